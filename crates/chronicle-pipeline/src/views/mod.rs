//! Named, swappable table-to-table transformations.
//!
//! The same logical view may be registered twice: once as composable
//! [`Table`](chronicle_types::Table) operations ([`expr`]) and once as SQL
//! text run by SQLite ([`sql`]), conventionally under an `_optimized`
//! suffix. Callers pick by name; swapping needs no caller change.

pub mod builtin;
pub mod expr;
pub mod sql;

use std::collections::BTreeMap;
use std::sync::Arc;

use chronicle_types::{ChronicleError, Result};

use crate::stage::Transform;

pub use builtin::{builtin_contract, builtin_views, register_expression_views, register_sql_views};
pub use sql::{OutputShape, SqlView};

/// Suffix naming the hand-tuned variant of a view family.
pub const OPTIMIZED_SUFFIX: &str = "_optimized";

// ---------------------------------------------------------------------------
// ViewRegistry
// ---------------------------------------------------------------------------

/// Name to transform catalog. Constructed explicitly and injected.
#[derive(Default)]
pub struct ViewRegistry {
    views: BTreeMap<String, Arc<dyn Transform>>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `view` under `name`. Names are never silently replaced.
    pub fn register(&mut self, name: impl Into<String>, view: impl Transform + 'static) -> Result<()> {
        self.register_shared(name, Arc::new(view))
    }

    pub fn register_shared(&mut self, name: impl Into<String>, view: Arc<dyn Transform>) -> Result<()> {
        let name = name.into();
        if self.views.contains_key(&name) {
            return Err(ChronicleError::DuplicateName { kind: "view", name });
        }
        tracing::debug!(view = %name, "View registered");
        self.views.insert(name, view);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Transform>> {
        self.views
            .get(name)
            .cloned()
            .ok_or_else(|| ChronicleError::NotFound {
                kind: "view",
                name: name.to_string(),
            })
    }

    pub fn has(&self, name: &str) -> bool {
        self.views.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.views.keys().map(String::as_str).collect()
    }

    pub fn unregister(&mut self, name: &str) -> Result<Arc<dyn Transform>> {
        self.views.remove(name).ok_or_else(|| ChronicleError::NotFound {
            kind: "view",
            name: name.to_string(),
        })
    }

    pub fn clear(&mut self) {
        self.views.clear();
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{FnTransform, StageContext};
    use chronicle_types::{ColumnDef, DataType, Table, Value};

    fn identity() -> FnTransform<fn(Table) -> Result<Table>> {
        FnTransform::new(Ok as fn(Table) -> Result<Table>)
    }

    #[test]
    fn register_and_list_sorted() {
        let mut reg = ViewRegistry::new();
        reg.register("zeta", identity()).unwrap();
        reg.register("alpha", identity()).unwrap();
        assert_eq!(reg.list(), vec!["alpha", "zeta"]);
        assert!(reg.has("alpha"));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut reg = ViewRegistry::new();
        reg.register("chunks", identity()).unwrap();
        let err = reg.register("chunks", identity()).unwrap_err();
        assert!(matches!(err, ChronicleError::DuplicateName { kind: "view", .. }));
    }

    #[test]
    fn get_missing_is_not_found() {
        let reg = ViewRegistry::new();
        assert!(matches!(
            reg.get("nope"),
            Err(ChronicleError::NotFound { kind: "view", .. })
        ));
    }

    #[test]
    fn unregister_and_clear() {
        let mut reg = ViewRegistry::new();
        reg.register("a", identity()).unwrap();
        reg.register("b", identity()).unwrap();
        reg.unregister("a").unwrap();
        assert!(!reg.has("a"));
        assert!(reg.unregister("a").is_err());
        reg.clear();
        assert!(reg.is_empty());
        // A cleared name can be registered again.
        reg.register("b", identity()).unwrap();
    }

    #[tokio::test]
    async fn lookup_returns_callable_view() {
        let mut reg = ViewRegistry::new();
        reg.register(
            "double_rows",
            FnTransform::new(|t: Table| {
                let mut rows = t.rows().to_vec();
                rows.extend(t.rows().iter().cloned());
                Table::new(t.columns().to_vec(), rows)
            }),
        )
        .unwrap();
        let input = Table::new(
            vec![ColumnDef::required("n", DataType::Int64)],
            vec![vec![Value::Int64(1)]],
        )
        .unwrap();
        let view = reg.get("double_rows").unwrap();
        let out = view.apply(input, &StageContext::default()).await.unwrap();
        assert_eq!(out.len(), 2);
    }
}
