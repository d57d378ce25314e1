//! Shared types and errors for the Chronicle pipeline engine.
//!
//! This crate provides the foundational types used across all other Chronicle crates:
//! - `ChronicleError`: unified error taxonomy
//! - `Table` / `Value` / `ColumnDef`: typed in-memory tables that stages exchange
//! - `Document` / `DraftArtifact`: immutable output artifacts and agent drafts
//! - `RunId` / `RunStatus` / `RunRecord`: execution bookkeeping rows
//! - `Window` / `WindowKey`: bounded slices of the event stream

pub mod document;
pub mod run;
pub mod table;
pub mod window;

pub use document::{slugify, Document, DocumentKind, DraftArtifact};
pub use run::{RunId, RunMetrics, RunRecord, RunStatus, TokenUsage};
pub use table::{truncate_to_micros, ColumnDef, DataType, RowView, Table, Value};
pub use window::{Window, WindowKey};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unified error type for all Chronicle subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ChronicleError {
    // === Schema Errors ===
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Schema version '{version}' is already registered with a different definition")]
    DuplicateVersion { version: String },

    // === Registry Errors ===
    #[error("A {kind} named '{name}' is already registered")]
    DuplicateName { kind: &'static str, name: String },

    #[error("No {kind} named '{name}' is registered")]
    NotFound { kind: &'static str, name: String },

    // === Window / Checkpoint Errors ===
    #[error("Window integrity violated: {0}")]
    WindowIntegrity(String),

    #[error("Window {window} was already committed by another worker")]
    CheckpointConflict { window: WindowKey },

    // === Run Tracking Errors ===
    #[error("Failed to persist run metadata for run {run}: {message}")]
    RunTracking { run: String, message: String },

    // === Generation Errors ===
    #[error("Generation agent failed: {message}")]
    Generation { message: String, retryable: bool },

    #[error("Generation timed out after {timeout_ms}ms")]
    GenerationTimeout { timeout_ms: u64 },

    #[error("Max retries exhausted for window {window} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        window: String,
        attempts: usize,
        #[source]
        last_error: Box<ChronicleError>,
    },

    #[error("Invalid artifact '{slug}': {reason}")]
    InvalidArtifact { slug: String, reason: String },

    // === Data / Storage Errors ===
    #[error("Invalid table: {0}")]
    InvalidTable(String),

    #[error("Store error during {operation}: {message}")]
    Store { operation: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChronicleError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChronicleError::GenerationTimeout { .. }
                | ChronicleError::Generation {
                    retryable: true,
                    ..
                }
        )
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChronicleError::Schema(_)
                | ChronicleError::DuplicateVersion { .. }
                | ChronicleError::DuplicateName { .. }
                | ChronicleError::NotFound { .. }
                | ChronicleError::WindowIntegrity(_)
                | ChronicleError::InvalidArtifact { .. }
                | ChronicleError::Config(_)
        )
    }

    /// Returns `true` for a lost race on a window commit. The caller treats
    /// the window as already processed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ChronicleError::CheckpointConflict { .. })
    }
}

/// A convenience alias for `Result<T, ChronicleError>`.
pub type Result<T> = std::result::Result<T, ChronicleError>;

// ---------------------------------------------------------------------------
// SchemaError: structural and value-level nonconformance
// ---------------------------------------------------------------------------

/// Which side of a stage a schema check ran on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// One structural difference between a candidate and a registered schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaDrift {
    Missing {
        column: String,
        expected: DataType,
    },
    Extra {
        column: String,
        actual: DataType,
    },
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: DataType,
    },
    NullabilityMismatch {
        column: String,
        expected_nullable: bool,
        actual_nullable: bool,
    },
    /// Only reported when comparing full definitions (lockfiles); table
    /// shapes do not carry allowed-value sets.
    AllowedValuesMismatch {
        column: String,
        expected: Option<Vec<String>>,
        actual: Option<Vec<String>>,
    },
}

impl SchemaDrift {
    pub fn column(&self) -> &str {
        match self {
            SchemaDrift::Missing { column, .. }
            | SchemaDrift::Extra { column, .. }
            | SchemaDrift::TypeMismatch { column, .. }
            | SchemaDrift::NullabilityMismatch { column, .. }
            | SchemaDrift::AllowedValuesMismatch { column, .. } => column,
        }
    }
}

impl fmt::Display for SchemaDrift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaDrift::Missing { column, expected } => {
                write!(f, "missing column '{column}' ({expected})")
            }
            SchemaDrift::Extra { column, actual } => {
                write!(f, "unexpected column '{column}' ({actual})")
            }
            SchemaDrift::TypeMismatch {
                column,
                expected,
                actual,
            } => write!(f, "column '{column}' is {actual}, expected {expected}"),
            SchemaDrift::NullabilityMismatch {
                column,
                expected_nullable,
                ..
            } => {
                let want = if *expected_nullable { "nullable" } else { "non-null" };
                write!(f, "column '{column}' must be {want}")
            }
            SchemaDrift::AllowedValuesMismatch { column, .. } => {
                write!(f, "column '{column}' has a different allowed-value set")
            }
        }
    }
}

/// Why a single value failed value-level validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    NullInRequired,
    WrongType { expected: DataType, actual: DataType },
    NotAllowed { value: String },
}

/// A value-level failure located at a row and column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueViolation {
    pub row: usize,
    pub column: String,
    pub violation: Violation,
}

impl fmt::Display for ValueViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.violation {
            Violation::NullInRequired => {
                write!(f, "row {}: '{}' is null", self.row, self.column)
            }
            Violation::WrongType { expected, actual } => write!(
                f,
                "row {}: '{}' holds {actual}, expected {expected}",
                self.row, self.column
            ),
            Violation::NotAllowed { value } => write!(
                f,
                "row {}: '{}' value '{value}' is not in the allowed set",
                self.row, self.column
            ),
        }
    }
}

/// Nonconformance against a registered schema version. Always carries the
/// full structural diff and every value violation found in the sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaError {
    pub version: String,
    pub stage: Option<String>,
    pub direction: Option<Direction>,
    pub drift: Vec<SchemaDrift>,
    pub violations: Vec<ValueViolation>,
}

impl SchemaError {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            stage: None,
            direction: None,
            drift: Vec::new(),
            violations: Vec::new(),
        }
    }

    /// Attach the stage name and the side of the stage that was checked.
    pub fn at_stage(mut self, stage: impl Into<String>, direction: Direction) -> Self {
        self.stage = Some(stage.into());
        self.direction = Some(direction);
        self
    }

    /// Names of the columns reported missing.
    pub fn missing_columns(&self) -> Vec<&str> {
        self.drift
            .iter()
            .filter(|d| matches!(d, SchemaDrift::Missing { .. }))
            .map(SchemaDrift::column)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.drift.is_empty() && self.violations.is_empty()
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Schema '{}' violated", self.version)?;
        if let (Some(stage), Some(direction)) = (&self.stage, self.direction) {
            write!(f, " by {direction} of stage '{stage}'")?;
        }
        let details: Vec<String> = self
            .drift
            .iter()
            .map(ToString::to_string)
            .chain(self.violations.iter().map(ToString::to_string))
            .collect();
        write!(f, ": {}", details.join("; "))
    }
}

impl std::error::Error for SchemaError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_duplicate_version() {
        let err = ChronicleError::DuplicateVersion {
            version: "ir_v1".into(),
        };
        assert_eq!(
            err.to_string(),
            "Schema version 'ir_v1' is already registered with a different definition"
        );
    }

    #[test]
    fn error_display_not_found() {
        let err = ChronicleError::NotFound {
            kind: "view",
            name: "chunks".into(),
        };
        assert_eq!(err.to_string(), "No view named 'chunks' is registered");
    }

    #[test]
    fn error_display_store() {
        let err = ChronicleError::Store {
            operation: "insert events".into(),
            message: "disk full".into(),
        };
        assert_eq!(err.to_string(), "Store error during insert events: disk full");
    }

    #[test]
    fn schema_error_display_names_stage_and_column() {
        let err = SchemaError {
            version: "ir_v1".into(),
            stage: Some("enrich".into()),
            direction: Some(Direction::Output),
            drift: vec![SchemaDrift::Missing {
                column: "author_uuid".into(),
                expected: DataType::Uuid,
            }],
            violations: Vec::new(),
        };
        assert_eq!(
            err.to_string(),
            "Schema 'ir_v1' violated by output of stage 'enrich': missing column 'author_uuid' (uuid)"
        );
        assert_eq!(err.missing_columns(), vec!["author_uuid"]);
    }

    #[test]
    fn schema_error_converts_into_chronicle_error() {
        let err: ChronicleError = SchemaError::new("ir_v1").into();
        assert!(matches!(err, ChronicleError::Schema(_)));
        assert!(err.is_terminal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn retryable_generation_errors() {
        let transient = ChronicleError::Generation {
            message: "503".into(),
            retryable: true,
        };
        let permanent = ChronicleError::Generation {
            message: "bad prompt".into(),
            retryable: false,
        };
        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(ChronicleError::GenerationTimeout { timeout_ms: 10 }.is_retryable());
    }

    #[test]
    fn checkpoint_conflict_is_conflict() {
        let key = WindowKey {
            tenant_id: "acme".into(),
            source: "chat".into(),
            start: chrono::DateTime::from_timestamp(0, 0).unwrap(),
            end: chrono::DateTime::from_timestamp(60, 0).unwrap(),
        };
        let err = ChronicleError::CheckpointConflict { window: key };
        assert!(err.is_conflict());
        assert!(!err.is_terminal());
    }

    #[test]
    fn drift_serializes_with_kind_tag() {
        let drift = SchemaDrift::TypeMismatch {
            column: "ts".into(),
            expected: DataType::Timestamp,
            actual: DataType::Utf8,
        };
        let json = serde_json::to_value(&drift).unwrap();
        assert_eq!(json["kind"], "type_mismatch");
        assert_eq!(json["expected"], "timestamp");
    }

    #[test]
    fn result_alias_err() {
        fn example() -> Result<()> {
            Err(ChronicleError::WindowIntegrity("duplicate bounds".into()))
        }
        assert!(example().is_err());
    }
}
