//! The committed schema lockfiles must match the canonical registry. Update
//! them with `chron schema lock` whenever a version is intentionally added.

use std::path::Path;

use chronicle_pipeline::canonical_registry;
use chronicle_pipeline::ir::{ir_v1_columns, IR_V1};
use chronicle_pipeline::SchemaRegistry;
use chronicle_types::{ChronicleError, ColumnDef, DataType};

fn lock_dir() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/../../schema"))
}

#[test]
fn committed_lockfiles_match_registry() {
    let registry = canonical_registry().unwrap();
    let checked = registry.check_lockfiles(lock_dir()).unwrap();
    assert_eq!(checked, registry.versions().len());
}

#[test]
fn written_lockfiles_are_byte_identical() {
    let registry = canonical_registry().unwrap();
    for version in registry.versions() {
        let committed =
            std::fs::read_to_string(SchemaRegistry::lockfile_path(lock_dir(), version)).unwrap();
        assert_eq!(committed, registry.lockfile(version).unwrap(), "{version} drifted");
    }
}

#[test]
fn drift_is_reported_per_column() {
    let dir = tempfile::tempdir().unwrap();
    canonical_registry().unwrap().write_lockfiles(dir.path()).unwrap();

    // Same version name, one column retyped.
    let mut columns = ir_v1_columns();
    columns[7] = ColumnDef::nullable("text", DataType::Json);
    let mut drifted = SchemaRegistry::new();
    drifted.define(IR_V1, columns).unwrap();

    let err = drifted
        .check_lockfile(&SchemaRegistry::lockfile_path(dir.path(), IR_V1))
        .unwrap_err();
    match err {
        ChronicleError::Schema(e) => {
            assert_eq!(e.drift.len(), 1);
            assert_eq!(e.drift[0].column(), "text");
        }
        other => panic!("expected schema error, got {other:?}"),
    }
}
