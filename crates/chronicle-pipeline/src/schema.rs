//! Locked schema versions, drift detection and lockfiles.
//!
//! A [`SchemaRegistry`] holds immutable [`SchemaDefinition`]s keyed by
//! version id. Every check reports through [`SchemaError`], which carries the
//! complete structural diff and any value violations found in the sample.
//! Lockfiles are JSON renderings of the definitions; CI regenerates them from
//! the in-code definitions and compares, so drift fails the build.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use chronicle_types::{
    ChronicleError, ColumnDef, Result, SchemaDrift, SchemaError, Table, Value, ValueViolation,
    Violation,
};

/// Rows inspected by value-level validation unless configured otherwise.
pub const DEFAULT_SAMPLE_CAP: usize = 100;

const LOCKFILE_SUFFIX: &str = ".lock.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub version: String,
    pub columns: Vec<ColumnDef>,
}

impl SchemaDefinition {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

// ---------------------------------------------------------------------------
// Diffing
// ---------------------------------------------------------------------------

/// Structural differences between `expected` and `candidate`. Column order
/// and allowed-value sets are not compared.
pub fn structural_diff(expected: &[ColumnDef], candidate: &[ColumnDef]) -> Vec<SchemaDrift> {
    let mut drift = Vec::new();
    for want in expected {
        match candidate.iter().find(|c| c.name == want.name) {
            None => drift.push(SchemaDrift::Missing {
                column: want.name.clone(),
                expected: want.data_type,
            }),
            Some(have) => {
                if have.data_type != want.data_type {
                    drift.push(SchemaDrift::TypeMismatch {
                        column: want.name.clone(),
                        expected: want.data_type,
                        actual: have.data_type,
                    });
                }
                if have.nullable != want.nullable {
                    drift.push(SchemaDrift::NullabilityMismatch {
                        column: want.name.clone(),
                        expected_nullable: want.nullable,
                        actual_nullable: have.nullable,
                    });
                }
            }
        }
    }
    for have in candidate {
        if !expected.iter().any(|c| c.name == have.name) {
            drift.push(SchemaDrift::Extra {
                column: have.name.clone(),
                actual: have.data_type,
            });
        }
    }
    drift
}

/// Full comparison of two definitions, including allowed-value sets.
fn definition_diff(expected: &[ColumnDef], actual: &[ColumnDef]) -> Vec<SchemaDrift> {
    let mut drift = structural_diff(expected, actual);
    for want in expected {
        if let Some(have) = actual.iter().find(|c| c.name == want.name) {
            if have.allowed != want.allowed {
                drift.push(SchemaDrift::AllowedValuesMismatch {
                    column: want.name.clone(),
                    expected: want.allowed.clone(),
                    actual: have.allowed.clone(),
                });
            }
        }
    }
    drift
}

// ---------------------------------------------------------------------------
// SchemaRegistry
// ---------------------------------------------------------------------------

/// Registry of locked schema versions. Constructed explicitly and shared by
/// reference; tests build isolated instances.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    versions: BTreeMap<String, SchemaDefinition>,
    sample_cap: usize,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            versions: BTreeMap::new(),
            sample_cap: DEFAULT_SAMPLE_CAP,
        }
    }

    /// Cap on rows inspected by [`check`](Self::check).
    pub fn with_sample_cap(mut self, cap: usize) -> Self {
        self.sample_cap = cap;
        self
    }

    pub fn sample_cap(&self) -> usize {
        self.sample_cap
    }

    /// Register `version`. Re-registering identical content is a no-op;
    /// different content is rejected.
    pub fn define(&mut self, version: impl Into<String>, columns: Vec<ColumnDef>) -> Result<()> {
        let version = version.into();
        let definition = SchemaDefinition {
            version: version.clone(),
            columns,
        };
        if let Some(existing) = self.versions.get(&version) {
            if *existing == definition {
                return Ok(());
            }
            return Err(ChronicleError::DuplicateVersion { version });
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = definition.columns.iter().find(|c| !seen.insert(c.name.as_str())) {
            return Err(ChronicleError::InvalidTable(format!(
                "schema '{version}' declares column '{}' twice",
                dup.name
            )));
        }
        tracing::debug!(version = %version, columns = definition.columns.len(), "Schema version defined");
        self.versions.insert(version, definition);
        Ok(())
    }

    pub fn get(&self, version: &str) -> Result<&SchemaDefinition> {
        self.versions
            .get(version)
            .ok_or_else(|| ChronicleError::NotFound {
                kind: "schema version",
                name: version.to_string(),
            })
    }

    pub fn has(&self, version: &str) -> bool {
        self.versions.contains_key(version)
    }

    /// Registered version ids, sorted.
    pub fn versions(&self) -> Vec<&str> {
        self.versions.keys().map(String::as_str).collect()
    }

    /// Structural drift of `candidate` against `version`. Empty means conformant.
    pub fn diff(&self, version: &str, candidate: &[ColumnDef]) -> Result<Vec<SchemaDrift>> {
        let definition = self.get(version)?;
        Ok(structural_diff(&definition.columns, candidate))
    }

    /// Structural check followed by value checks on at most `cap` rows.
    pub fn validate(&self, version: &str, table: &Table, cap: usize) -> Result<()> {
        let definition = self.get(version)?;
        let drift = structural_diff(&definition.columns, table.columns());
        if !drift.is_empty() {
            return Err(SchemaError {
                drift,
                ..SchemaError::new(version)
            }
            .into());
        }

        let violations = value_violations(definition, table, cap);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(SchemaError {
                violations,
                ..SchemaError::new(version)
            }
            .into())
        }
    }

    /// [`validate`](Self::validate) with the registry's configured sample cap.
    pub fn check(&self, version: &str, table: &Table) -> Result<()> {
        self.validate(version, table, self.sample_cap)
    }

    // -- Lockfiles ----------------------------------------------------------

    /// Machine-checkable JSON rendering of `version`.
    pub fn lockfile(&self, version: &str) -> Result<String> {
        let definition = self.get(version)?;
        let mut rendered = serde_json::to_string_pretty(definition)?;
        rendered.push('\n');
        Ok(rendered)
    }

    pub fn lockfile_path(dir: &Path, version: &str) -> PathBuf {
        dir.join(format!("{version}{LOCKFILE_SUFFIX}"))
    }

    /// Regenerate every lockfile under `dir`.
    pub fn write_lockfiles(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::new();
        for version in self.versions.keys() {
            let path = Self::lockfile_path(dir, version);
            std::fs::write(&path, self.lockfile(version)?)?;
            tracing::info!(path = %path.display(), "Lockfile written");
            written.push(path);
        }
        Ok(written)
    }

    /// Compare one checked-in lockfile with the in-code definition.
    pub fn check_lockfile(&self, path: &Path) -> Result<()> {
        let data = std::fs::read_to_string(path)?;
        let locked: SchemaDefinition = serde_json::from_str(&data)?;
        let canonical = self.get(&locked.version)?;
        let drift = definition_diff(&canonical.columns, &locked.columns);
        if drift.is_empty() {
            return Ok(());
        }
        Err(SchemaError {
            drift,
            ..SchemaError::new(locked.version)
        }
        .into())
    }

    /// Check every registered version has a matching lockfile in `dir` and
    /// that `dir` holds no lockfile for an unknown version. Returns the
    /// number of lockfiles checked.
    pub fn check_lockfiles(&self, dir: &Path) -> Result<usize> {
        for version in self.versions.keys() {
            let path = Self::lockfile_path(dir, version);
            if !path.exists() {
                return Err(ChronicleError::NotFound {
                    kind: "lockfile",
                    name: path.display().to_string(),
                });
            }
            self.check_lockfile(&path)?;
        }
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(version) = name.strip_suffix(LOCKFILE_SUFFIX) {
                self.get(version)?;
            }
        }
        Ok(self.versions.len())
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn value_violations(definition: &SchemaDefinition, table: &Table, cap: usize) -> Vec<ValueViolation> {
    let positions: Vec<(usize, &ColumnDef)> = definition
        .columns
        .iter()
        .filter_map(|col| table.column_index(&col.name).map(|idx| (idx, col)))
        .collect();

    let mut violations = Vec::new();
    for (row_idx, row) in table.rows().iter().take(cap).enumerate() {
        for &(idx, col) in &positions {
            let value = &row[idx];
            let violation = match value.data_type() {
                None if !col.nullable => Some(Violation::NullInRequired),
                None => None,
                Some(actual) if actual != col.data_type => Some(Violation::WrongType {
                    expected: col.data_type,
                    actual,
                }),
                Some(_) => match (&col.allowed, value) {
                    (Some(allowed), Value::Utf8(s)) if !allowed.iter().any(|a| a == s) => {
                        Some(Violation::NotAllowed { value: s.clone() })
                    }
                    _ => None,
                },
            };
            if let Some(violation) = violation {
                violations.push(ValueViolation {
                    row: row_idx,
                    column: col.name.clone(),
                    violation,
                });
            }
        }
    }
    violations
}
