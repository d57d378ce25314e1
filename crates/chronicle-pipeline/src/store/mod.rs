//! SQLite-backed store holding the three relations: events, documents, runs.
//!
//! One pooled [`SqlitePool`] is opened per process and shared by every
//! component. Processing state lives only in these relations; there are no
//! marker files, so deleting the database resets everything consistently.

pub mod codec;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::Row;
use uuid::Uuid;

use chronicle_types::{ChronicleError, Document, DocumentKind, Result, RunId, Table};

use crate::ir;
use codec::{bind_value, decode_table, from_micros, to_micros};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        event_id       TEXT    PRIMARY KEY,
        tenant_id      TEXT    NOT NULL,
        source         TEXT    NOT NULL,
        thread_id      TEXT    NOT NULL,
        msg_id         TEXT    NOT NULL,
        ts             INTEGER NOT NULL,
        author_uuid    TEXT    NOT NULL,
        text           TEXT,
        media_url      TEXT,
        media_type     TEXT,
        attrs          TEXT,
        pii_flags      TEXT,
        created_at     INTEGER NOT NULL,
        created_by_run TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_events_stream
        ON events (tenant_id, source, ts, event_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS runs (
        run_id         TEXT    PRIMARY KEY,
        tenant_id      TEXT    NOT NULL,
        stage          TEXT    NOT NULL,
        status         TEXT    NOT NULL,
        error          TEXT,
        parent_run_id  TEXT    REFERENCES runs(run_id),
        started_at     INTEGER NOT NULL,
        finished_at    INTEGER,
        duration_ms    INTEGER,
        rows_in        INTEGER NOT NULL DEFAULT 0,
        rows_out       INTEGER NOT NULL DEFAULT 0,
        external_calls INTEGER NOT NULL DEFAULT 0,
        input_tokens   INTEGER NOT NULL DEFAULT 0,
        output_tokens  INTEGER NOT NULL DEFAULT 0,
        cost_usd       REAL    NOT NULL DEFAULT 0,
        attrs          TEXT    NOT NULL DEFAULT '{}',
        code_ref          TEXT,
        config_hash       TEXT,
        input_fingerprint TEXT,
        trace_id          TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_runs_parent ON runs (parent_run_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        document_id     TEXT    PRIMARY KEY,
        kind            TEXT    NOT NULL,
        tenant_id       TEXT    NOT NULL,
        source          TEXT    NOT NULL,
        slug            TEXT    NOT NULL,
        title           TEXT    NOT NULL,
        subject         TEXT,
        body            TEXT    NOT NULL,
        metadata        TEXT    NOT NULL DEFAULT 'null',
        window_start    INTEGER,
        window_end      INTEGER,
        created_at      INTEGER NOT NULL,
        produced_by_run TEXT    NOT NULL REFERENCES runs(run_id)
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_journal_window
        ON documents (tenant_id, source, window_start, window_end)
        WHERE kind = 'journal'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_documents_stream
        ON documents (tenant_id, source, kind, created_at)
    "#,
];

/// Map a driver error to [`ChronicleError::Store`], tagged with what was
/// being attempted.
pub(crate) fn store_error(operation: &'static str) -> impl Fn(sqlx::Error) -> ChronicleError {
    move |e| ChronicleError::Store {
        operation: operation.to_string(),
        message: e.to_string(),
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Handle to the pooled database. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database at `path` in WAL mode and run
    /// the idempotent schema setup.
    pub async fn open(path: &Path, max_connections: u32) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(store_error("open database"))?;
        tracing::debug!(path = %path.display(), max_connections, "Store opened");
        Self::from_pool(pool).await
    }

    /// A private in-memory database on a single long-lived connection.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(store_error("open database"))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await
            .map_err(store_error("open database"))?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(store_error("create schema"))?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -- Events -------------------------------------------------------------

    /// Append event rows. Rows whose `event_id` already exists are ignored.
    /// Returns the number of rows inserted.
    pub async fn insert_events(&self, events: &Table) -> Result<u64> {
        let columns = ir::ir_v1_columns();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        let projected = events.select(&names)?;

        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "INSERT OR IGNORE INTO events ({}) VALUES ({placeholders})",
            names.join(", ")
        );

        let mut tx = self.pool.begin().await.map_err(store_error("insert events"))?;
        let mut inserted = 0;
        for row in projected.rows() {
            let query = row
                .iter()
                .fold(sqlx::query(&sql), |query, value| bind_value(query, value));
            inserted += query
                .execute(&mut *tx)
                .await
                .map_err(store_error("insert events"))?
                .rows_affected();
        }
        tx.commit().await.map_err(store_error("insert events"))?;
        tracing::info!(rows = projected.len(), inserted, "Events ingested");
        Ok(inserted)
    }

    /// All events for one stream, ordered by `(ts, event_id)`.
    pub async fn load_events(&self, tenant_id: &str, source: &str) -> Result<Table> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM events
            WHERE tenant_id = ? AND source = ?
            ORDER BY ts, event_id
            "#,
        )
        .bind(tenant_id)
        .bind(source)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error("load events"))?;
        decode_table(&rows, ir::ir_v1_columns())
    }

    // -- Documents ----------------------------------------------------------

    /// Documents for one stream, oldest first, optionally of one kind.
    pub async fn documents(
        &self,
        tenant_id: &str,
        source: &str,
        kind: Option<DocumentKind>,
    ) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM documents
            WHERE tenant_id = ? AND source = ? AND (? IS NULL OR kind = ?)
            ORDER BY created_at, window_start, document_id
            "#,
        )
        .bind(tenant_id)
        .bind(source)
        .bind(kind.map(|k| k.as_str()))
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error("load documents"))?;
        rows.iter().map(document_from_row).collect()
    }

    /// Most recent non-journal documents produced for windows ending at or
    /// before `before`, newest first.
    pub async fn recent_documents(
        &self,
        tenant_id: &str,
        source: &str,
        before: chrono::DateTime<chrono::Utc>,
        limit: u32,
    ) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM documents
            WHERE tenant_id = ? AND source = ? AND kind <> 'journal'
              AND window_end IS NOT NULL AND window_end <= ?
            ORDER BY window_end DESC, created_at DESC
            LIMIT ?
            "#,
        )
        .bind(tenant_id)
        .bind(source)
        .bind(to_micros(before))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error("load recent documents"))?;
        rows.iter().map(document_from_row).collect()
    }

    pub async fn count_documents(
        &self,
        tenant_id: &str,
        source: &str,
        kind: Option<DocumentKind>,
    ) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM documents
            WHERE tenant_id = ? AND source = ? AND (? IS NULL OR kind = ?)
            "#,
        )
        .bind(tenant_id)
        .bind(source)
        .bind(kind.map(|k| k.as_str()))
        .bind(kind.map(|k| k.as_str()))
        .fetch_one(&self.pool)
        .await
        .map_err(store_error("count documents"))?;
        Ok(count.max(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Document rows
// ---------------------------------------------------------------------------

pub(crate) async fn insert_document(
    conn: &mut SqliteConnection,
    doc: &Document,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO documents (
            document_id, kind, tenant_id, source, slug, title, subject, body,
            metadata, window_start, window_end, created_at, produced_by_run
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(doc.id.to_string())
    .bind(doc.kind.as_str())
    .bind(&doc.tenant_id)
    .bind(&doc.source)
    .bind(&doc.slug)
    .bind(&doc.title)
    .bind(&doc.subject)
    .bind(&doc.body)
    .bind(doc.metadata.to_string())
    .bind(doc.window_start.map(to_micros))
    .bind(doc.window_end.map(to_micros))
    .bind(to_micros(doc.created_at))
    .bind(doc.produced_by.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let get_err = store_error("decode document");
    let text = |name: &str| row.try_get::<String, _>(name).map_err(&get_err);
    let id = text("document_id")?;
    let produced_by = text("produced_by_run")?;
    let metadata = text("metadata")?;
    let optional_ts = |name: &str| -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        row.try_get::<Option<i64>, _>(name)
            .map_err(&get_err)?
            .map(from_micros)
            .transpose()
    };
    Ok(Document {
        id: Uuid::parse_str(&id).map_err(|e| ChronicleError::InvalidTable(e.to_string()))?,
        kind: text("kind")?.parse()?,
        tenant_id: text("tenant_id")?,
        source: text("source")?,
        slug: text("slug")?,
        title: text("title")?,
        subject: row
            .try_get::<Option<String>, _>("subject")
            .map_err(&get_err)?,
        body: text("body")?,
        metadata: serde_json::from_str(&metadata)?,
        window_start: optional_ts("window_start")?,
        window_end: optional_ts("window_end")?,
        created_at: from_micros(row.try_get::<i64, _>("created_at").map_err(&get_err)?)?,
        produced_by: RunId::from_str(&produced_by)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_types::Value;
    use serde_json::json;

    fn events(n: usize) -> Table {
        let records: Vec<_> = (0..n)
            .map(|i| {
                json!({
                    "event_id": Uuid::new_v4().to_string(),
                    "tenant_id": "acme",
                    "source": "chat",
                    "thread_id": Uuid::nil().to_string(),
                    "msg_id": format!("m{i}"),
                    "ts": format!("2024-03-01T00:{:02}:00Z", i),
                    "author_uuid": Uuid::nil().to_string(),
                    "text": if i % 2 == 0 { json!("hello") } else { json!(null) },
                    "media_type": if i == 1 { json!("image") } else { json!(null) },
                    "attrs": {"n": i},
                    "created_at": "2024-03-02T00:00:00Z",
                })
            })
            .collect();
        Table::from_records(ir::ir_v1_columns(), &records).unwrap()
    }

    #[tokio::test]
    async fn schema_setup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("chronicle.db");
        let first = Store::open(&path, 2).await.unwrap();
        first.close().await;
        let second = Store::open(&path, 2).await.unwrap();
        assert_eq!(second.count_documents("acme", "chat", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn events_round_trip_and_dedupe() {
        let store = Store::in_memory().await.unwrap();
        let table = events(5);
        assert_eq!(store.insert_events(&table).await.unwrap(), 5);
        assert_eq!(store.insert_events(&table).await.unwrap(), 0);

        let loaded = store.load_events("acme", "chat").await.unwrap();
        assert_eq!(loaded, table);
        assert_eq!(loaded.value(1, "text"), Some(&Value::Null));
        assert_eq!(loaded.value(3, "attrs"), Some(&Value::Json(json!({"n": 3}))));
    }

    #[tokio::test]
    async fn insert_requires_ir_columns() {
        let store = Store::in_memory().await.unwrap();
        let partial = events(1).drop_column("author_uuid").unwrap();
        assert!(matches!(
            store.insert_events(&partial).await,
            Err(ChronicleError::InvalidTable(_))
        ));
    }
}
