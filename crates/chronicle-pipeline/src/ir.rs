//! Canonical schema versions.
//!
//! These definitions are the single source of truth; `schema/*.lock.json`
//! is regenerated from them with `chron schema lock`.

use chronicle_types::{ColumnDef, DataType, Result};

use crate::schema::SchemaRegistry;

/// Normalised event rows. No raw author identity column exists.
pub const IR_V1: &str = "ir_v1";
/// `ir_v1` plus a per-thread `chunk_idx`.
pub const IR_V1_CHUNKED: &str = "ir_v1_chunked";
/// Per-bucket message activity.
pub const ACTIVITY_V1: &str = "activity_v1";

pub const MEDIA_TYPES: [&str; 4] = ["audio", "document", "image", "video"];

pub fn ir_v1_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::required("event_id", DataType::Uuid),
        ColumnDef::required("tenant_id", DataType::Utf8),
        ColumnDef::required("source", DataType::Utf8),
        ColumnDef::required("thread_id", DataType::Uuid),
        ColumnDef::required("msg_id", DataType::Utf8),
        ColumnDef::required("ts", DataType::Timestamp),
        ColumnDef::required("author_uuid", DataType::Uuid),
        ColumnDef::nullable("text", DataType::Utf8),
        ColumnDef::nullable("media_url", DataType::Utf8),
        ColumnDef::nullable("media_type", DataType::Utf8).with_allowed(MEDIA_TYPES),
        ColumnDef::nullable("attrs", DataType::Json),
        ColumnDef::nullable("pii_flags", DataType::Json),
        ColumnDef::required("created_at", DataType::Timestamp),
        ColumnDef::nullable("created_by_run", DataType::Uuid),
    ]
}

pub fn chunk_idx_column() -> ColumnDef {
    ColumnDef::required("chunk_idx", DataType::Int64)
}

pub fn ir_v1_chunked_columns() -> Vec<ColumnDef> {
    let mut columns = ir_v1_columns();
    columns.push(chunk_idx_column());
    columns
}

pub fn activity_v1_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::required("bucket", DataType::Timestamp),
        ColumnDef::required("message_count", DataType::Int64),
        ColumnDef::required("unique_authors", DataType::Int64),
        ColumnDef::required("first_message", DataType::Timestamp),
        ColumnDef::required("last_message", DataType::Timestamp),
    ]
}

/// A registry holding every canonical version.
pub fn canonical_registry() -> Result<SchemaRegistry> {
    let mut registry = SchemaRegistry::new();
    registry.define(IR_V1, ir_v1_columns())?;
    registry.define(IR_V1_CHUNKED, ir_v1_chunked_columns())?;
    registry.define(ACTIVITY_V1, activity_v1_columns())?;
    Ok(registry)
}
