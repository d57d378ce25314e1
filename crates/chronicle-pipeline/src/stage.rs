//! Transform trait and the schema-checking stage wrapper.

use std::sync::Arc;

use async_trait::async_trait;

use chronicle_types::{ChronicleError, Direction, Result, RunId, Table, WindowKey};

use crate::schema::SchemaRegistry;

// ---------------------------------------------------------------------------
// Transform trait
// ---------------------------------------------------------------------------

/// Per-call context handed to every transform.
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub tenant_id: String,
    pub run_id: Option<RunId>,
    pub window: Option<WindowKey>,
}

/// A table-to-table transformation. Implementations must be referentially
/// transparent: identical input yields identical output.
#[async_trait]
pub trait Transform: Send + Sync {
    async fn apply(&self, input: Table, ctx: &StageContext) -> Result<Table>;
}

/// Adapts a plain function into a [`Transform`].
pub struct FnTransform<F>(F);

impl<F> FnTransform<F>
where
    F: Fn(Table) -> Result<Table> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Transform for FnTransform<F>
where
    F: Fn(Table) -> Result<Table> + Send + Sync,
{
    async fn apply(&self, input: Table, _ctx: &StageContext) -> Result<Table> {
        (self.0)(input)
    }
}

// ---------------------------------------------------------------------------
// ValidatedStage
// ---------------------------------------------------------------------------

/// A transform whose input and output are checked against declared schema
/// versions. Adding, removing or retyping a column requires declaring a
/// different output version.
pub struct ValidatedStage {
    name: String,
    input_version: String,
    output_version: String,
    inner: Arc<dyn Transform>,
    schemas: Arc<SchemaRegistry>,
}

/// Wrap `inner` so every call is checked against `input_version` before and
/// `output_version` after.
pub fn validated(
    name: impl Into<String>,
    input_version: impl Into<String>,
    output_version: impl Into<String>,
    inner: Arc<dyn Transform>,
    schemas: Arc<SchemaRegistry>,
) -> ValidatedStage {
    ValidatedStage {
        name: name.into(),
        input_version: input_version.into(),
        output_version: output_version.into(),
        inner,
        schemas,
    }
}

impl ValidatedStage {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_version(&self) -> &str {
        &self.input_version
    }

    pub fn output_version(&self) -> &str {
        &self.output_version
    }

    pub async fn process(&self, input: Table, ctx: &StageContext) -> Result<Table> {
        self.check(&self.input_version, &input, Direction::Input)?;
        let rows_in = input.len();
        let output = self.inner.apply(input, ctx).await?;
        self.check(&self.output_version, &output, Direction::Output)?;
        tracing::debug!(
            stage = %self.name,
            rows_in,
            rows_out = output.len(),
            "Stage processed"
        );
        Ok(output)
    }

    fn check(&self, version: &str, table: &Table, direction: Direction) -> Result<()> {
        match self.schemas.check(version, table) {
            Err(ChronicleError::Schema(err)) => {
                let err = err.at_stage(self.name.clone(), direction);
                tracing::warn!(stage = %self.name, %direction, error = %err, "Schema check failed");
                Err(err.into())
            }
            other => other,
        }
    }
}

#[async_trait]
impl Transform for ValidatedStage {
    async fn apply(&self, input: Table, ctx: &StageContext) -> Result<Table> {
        self.process(input, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_types::{ColumnDef, DataType, Value};
    use uuid::Uuid;

    fn post_columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::required("event_id", DataType::Uuid),
            ColumnDef::required("thread_id", DataType::Uuid),
            ColumnDef::required("ts", DataType::Timestamp),
            ColumnDef::required("author_uuid", DataType::Uuid),
            ColumnDef::nullable("text", DataType::Utf8),
            ColumnDef::nullable("attrs", DataType::Json),
        ]
    }

    fn schemas() -> Arc<SchemaRegistry> {
        let mut reg = SchemaRegistry::new();
        reg.define("post_v1", post_columns()).unwrap();
        Arc::new(reg)
    }

    fn input(n: usize) -> Table {
        let rows = (0..n)
            .map(|i| {
                vec![
                    Value::Uuid(Uuid::new_v4()),
                    Value::Uuid(Uuid::nil()),
                    Value::from(chrono::DateTime::from_timestamp(i as i64 * 60, 0).unwrap()),
                    Value::Uuid(Uuid::new_v4()),
                    if i % 2 == 0 { Value::from("hi") } else { Value::Null },
                    Value::Null,
                ]
            })
            .collect();
        Table::new(post_columns(), rows).unwrap()
    }

    fn stage(inner: Arc<dyn Transform>) -> ValidatedStage {
        validated("enrich", "post_v1", "post_v1", inner, schemas())
    }

    // 1. Filtering and reordering keep the contract
    #[tokio::test]
    async fn filter_and_reverse_pass() {
        let inner = Arc::new(FnTransform::new(|t: Table| {
            let kept = t.filter(|row| row.get("text").is_some_and(|v| !v.is_null()));
            let mut rows = kept.clone().into_rows();
            rows.reverse();
            Table::new(kept.columns().to_vec(), rows)
        }));
        let out = stage(inner).process(input(6), &StageContext::default()).await.unwrap();
        assert_eq!(out.len(), 3);
    }

    // 2. Dropping a required column is rejected on output, naming exactly that column
    #[tokio::test]
    async fn dropped_author_column_is_named() {
        let inner = Arc::new(FnTransform::new(|t: Table| t.drop_column("author_uuid")));
        let err = stage(inner)
            .process(input(3), &StageContext::default())
            .await
            .unwrap_err();
        let err = match err {
            ChronicleError::Schema(e) => e,
            other => panic!("expected SchemaError, got {other:?}"),
        };
        assert_eq!(err.stage.as_deref(), Some("enrich"));
        assert_eq!(err.direction, Some(Direction::Output));
        assert_eq!(err.drift.len(), 1);
        assert_eq!(err.missing_columns(), vec!["author_uuid"]);
    }

    // 3. Nonconformant input never reaches the transform
    #[tokio::test]
    async fn input_checked_before_transform() {
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = called.clone();
        let inner = Arc::new(FnTransform::new(move |t: Table| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(t)
        }));
        let bad = input(2).drop_column("text").unwrap();
        let err = stage(inner)
            .process(bad, &StageContext::default())
            .await
            .unwrap_err();
        match err {
            ChronicleError::Schema(e) => assert_eq!(e.direction, Some(Direction::Input)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    // 4. Silently retyping a column is rejected
    #[tokio::test]
    async fn retyped_column_is_rejected() {
        let inner = Arc::new(FnTransform::new(|t: Table| {
            let mut columns = t.columns().to_vec();
            columns[4] = ColumnDef::nullable("text", DataType::Json);
            let rows = t
                .into_rows()
                .into_iter()
                .map(|mut r| {
                    r[4] = Value::Null;
                    r
                })
                .collect();
            Table::new(columns, rows)
        }));
        let err = stage(inner)
            .process(input(2), &StageContext::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("column 'text' is json, expected utf8"));
    }

    // 5. Validated stages compose as transforms
    #[tokio::test]
    async fn stages_nest() {
        let identity: Arc<dyn Transform> = Arc::new(FnTransform::new(Ok));
        let inner: Arc<dyn Transform> = Arc::new(stage(identity));
        let outer = stage(inner);
        let out = outer.apply(input(4), &StageContext::default()).await.unwrap();
        assert_eq!(out.len(), 4);
    }
}
