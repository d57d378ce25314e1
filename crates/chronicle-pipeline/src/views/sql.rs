//! Views expressed as SQL text and run by SQLite.
//!
//! The input table is materialised into a connection-local TEMP table with
//! an extra `__row_ord` column holding each row's input position. The query
//! names that table through the `{input}` placeholder and may order by
//! `__row_ord` to preserve input order. Result rows are decoded by name
//! against the declared output shape; extra result columns are ignored.

use async_trait::async_trait;
use sqlx::sqlite::SqliteConnection;
use sqlx::Connection;
use uuid::Uuid;

use chronicle_types::{ColumnDef, Result, Table};

use crate::stage::{StageContext, Transform};
use crate::store::codec::{bind_value, decode_table, quote_ident, sql_type};
use crate::store::{store_error, Store};

/// Placeholder replaced by the quoted name of the materialised input.
pub const INPUT_PLACEHOLDER: &str = "{input}";

/// Input-position column added to the materialised input.
pub const ROW_ORD: &str = "__row_ord";

/// Columns a [`SqlView`] produces.
#[derive(Debug, Clone)]
pub enum OutputShape {
    /// Same columns as the input (filters).
    Input,
    /// Input columns followed by these.
    Extend(Vec<ColumnDef>),
    /// A fixed column set (aggregates).
    Fixed(Vec<ColumnDef>),
}

impl OutputShape {
    fn resolve(&self, input: &Table) -> Vec<ColumnDef> {
        match self {
            OutputShape::Input => input.columns().to_vec(),
            OutputShape::Extend(extra) => {
                let mut cols = input.columns().to_vec();
                cols.extend(extra.iter().cloned());
                cols
            }
            OutputShape::Fixed(cols) => cols.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqlView {
    store: Store,
    query: String,
    shape: OutputShape,
}

impl SqlView {
    pub fn new(store: Store, query: impl Into<String>, shape: OutputShape) -> Self {
        Self {
            store,
            query: query.into(),
            shape,
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    async fn run(&self, conn: &mut SqliteConnection, table: &str, input: &Table) -> Result<Table> {
        let defs = std::iter::once(format!("{} INTEGER NOT NULL", quote_ident(ROW_ORD)))
            .chain(
                input
                    .columns()
                    .iter()
                    .map(|c| format!("{} {}", quote_ident(&c.name), sql_type(c.data_type))),
            )
            .collect::<Vec<_>>()
            .join(", ");
        sqlx::query(&format!("CREATE TEMP TABLE {table} ({defs})"))
            .execute(&mut *conn)
            .await
            .map_err(store_error("materialise view input"))?;

        let placeholders = vec!["?"; input.columns().len() + 1].join(", ");
        let insert = format!("INSERT INTO {table} VALUES ({placeholders})");
        let mut tx = conn.begin().await.map_err(store_error("materialise view input"))?;
        for (ord, row) in input.rows().iter().enumerate() {
            let mut q = sqlx::query(&insert).bind(ord as i64);
            for value in row {
                q = bind_value(q, value);
            }
            q.execute(&mut *tx)
                .await
                .map_err(store_error("materialise view input"))?;
        }
        tx.commit().await.map_err(store_error("materialise view input"))?;

        let sql = self.query.replace(INPUT_PLACEHOLDER, table);
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *conn)
            .await
            .map_err(store_error("run sql view"))?;
        decode_table(&rows, self.shape.resolve(input))
    }
}

#[async_trait]
impl Transform for SqlView {
    async fn apply(&self, input: Table, _ctx: &StageContext) -> Result<Table> {
        let table = quote_ident(&format!("view_input_{}", Uuid::new_v4().simple()));
        let mut conn = self
            .store
            .pool()
            .acquire()
            .await
            .map_err(store_error("acquire view connection"))?;

        let result = self.run(&mut conn, &table, &input).await;

        if let Err(e) = sqlx::query(&format!("DROP TABLE IF EXISTS temp.{table}"))
            .execute(&mut *conn)
            .await
        {
            tracing::warn!(table = %table, error = %e, "Failed to drop view input table");
        }
        result
    }
}
