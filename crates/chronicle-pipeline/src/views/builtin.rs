//! The built-in view families. Each is registered under its base name as an
//! expression view and under `<name>_optimized` as SQL. Both variants
//! return identical rows for identical input.

use chronicle_types::Result;

use super::expr;
use super::sql::{OutputShape, SqlView};
use super::{ViewRegistry, OPTIMIZED_SUFFIX};
use crate::ir::{self, ACTIVITY_V1, IR_V1, IR_V1_CHUNKED};
use crate::stage::FnTransform;
use crate::store::Store;

const MESSAGES_WITH_TEXT_SQL: &str = r#"
SELECT * FROM {input}
WHERE text IS NOT NULL AND text <> ''
ORDER BY __row_ord
"#;

const MESSAGES_WITH_MEDIA_SQL: &str = r#"
SELECT * FROM {input}
WHERE media_url IS NOT NULL
ORDER BY __row_ord
"#;

const CHUNKS_SQL: &str = r#"
SELECT *,
       ROW_NUMBER() OVER (PARTITION BY thread_id ORDER BY ts, event_id) - 1 AS chunk_idx
FROM {input}
ORDER BY __row_ord
"#;

/// Bucketing floors `ts` to a multiple of the bucket width, negative
/// timestamps included.
fn activity_sql(bucket_micros: i64) -> String {
    format!(
        r#"
SELECT ts - (((ts % {b}) + {b}) % {b}) AS bucket,
       COUNT(*)                        AS message_count,
       COUNT(DISTINCT author_uuid)     AS unique_authors,
       MIN(ts)                         AS first_message,
       MAX(ts)                         AS last_message
FROM {{input}}
GROUP BY bucket
ORDER BY bucket
"#,
        b = bucket_micros
    )
}

/// Input and output schema versions of a built-in view (either variant).
pub fn builtin_contract(name: &str) -> Option<(&'static str, &'static str)> {
    match name.strip_suffix(OPTIMIZED_SUFFIX).unwrap_or(name) {
        "messages_with_text" | "messages_with_media" => Some((IR_V1, IR_V1)),
        "chunks" => Some((IR_V1, IR_V1_CHUNKED)),
        "hourly_aggregates" | "daily_aggregates" => Some((IR_V1, ACTIVITY_V1)),
        _ => None,
    }
}

pub fn register_expression_views(registry: &mut ViewRegistry) -> Result<()> {
    registry.register("messages_with_text", FnTransform::new(expr::messages_with_text))?;
    registry.register("messages_with_media", FnTransform::new(expr::messages_with_media))?;
    registry.register("chunks", FnTransform::new(expr::chunks))?;
    registry.register("hourly_aggregates", FnTransform::new(expr::hourly_aggregates))?;
    registry.register("daily_aggregates", FnTransform::new(expr::daily_aggregates))?;
    Ok(())
}

pub fn register_sql_views(registry: &mut ViewRegistry, store: &Store) -> Result<()> {
    let views = [
        ("messages_with_text", MESSAGES_WITH_TEXT_SQL.to_string(), OutputShape::Input),
        ("messages_with_media", MESSAGES_WITH_MEDIA_SQL.to_string(), OutputShape::Input),
        (
            "chunks",
            CHUNKS_SQL.to_string(),
            OutputShape::Extend(vec![ir::chunk_idx_column()]),
        ),
        (
            "hourly_aggregates",
            activity_sql(expr::HOUR_MICROS),
            OutputShape::Fixed(ir::activity_v1_columns()),
        ),
        (
            "daily_aggregates",
            activity_sql(expr::DAY_MICROS),
            OutputShape::Fixed(ir::activity_v1_columns()),
        ),
    ];
    for (name, query, shape) in views {
        registry.register(
            format!("{name}{OPTIMIZED_SUFFIX}"),
            SqlView::new(store.clone(), query, shape),
        )?;
    }
    Ok(())
}

/// A registry holding every built-in view in both variants.
pub fn builtin_views(store: &Store) -> Result<ViewRegistry> {
    let mut registry = ViewRegistry::new();
    register_expression_views(&mut registry)?;
    register_sql_views(&mut registry, store)?;
    Ok(registry)
}
