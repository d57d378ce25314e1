//! Run tracking: one row per execution unit, single-parent lineage.
//!
//! Every failure to persist run metadata surfaces as
//! [`ChronicleError::RunTracking`]; callers must not swallow it, since a
//! missing run row breaks lineage for everything it produced.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

use chronicle_types::{
    ChronicleError, Result, RunId, RunMetrics, RunRecord, RunStatus, Table, TokenUsage,
    WindowKey,
};

use crate::store::codec::{from_micros, to_micros};
use crate::store::Store;

fn tracking_error(run: impl ToString) -> impl Fn(sqlx::Error) -> ChronicleError {
    let run = run.to_string();
    move |e| ChronicleError::RunTracking {
        run: run.clone(),
        message: e.to_string(),
    }
}

fn clamp_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Content address of a table: `sha256:<hex>` over its column definitions
/// and every row in order. Equal tables always hash equal.
pub fn fingerprint_table(table: &Table) -> Result<String> {
    let mut hasher = Sha256::new();
    for column in table.columns() {
        hasher.update(format!("{}:{}:{}\n", column.name, column.data_type, column.nullable));
    }
    for row in table.rows() {
        let cells: Vec<serde_json::Value> = row.iter().map(|v| v.to_json()).collect();
        hasher.update(serde_json::to_vec(&cells)?);
        hasher.update(b"\n");
    }
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

/// A window that failed inside a degraded batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedWindow {
    pub window: WindowKey,
    pub error: String,
}

/// Partial-success bookkeeping for a degraded run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialRun {
    pub metrics: RunMetrics,
    pub succeeded: Vec<WindowKey>,
    pub failed: Vec<FailedWindow>,
    /// Windows never attempted because the batch was cancelled.
    pub cancelled: Vec<WindowKey>,
}

impl PartialRun {
    fn into_metrics(self) -> Result<RunMetrics> {
        let mut metrics = self.metrics;
        metrics
            .attrs
            .insert("succeeded_windows".into(), serde_json::to_value(&self.succeeded)?);
        metrics
            .attrs
            .insert("failed_windows".into(), serde_json::to_value(&self.failed)?);
        if !self.cancelled.is_empty() {
            metrics
                .attrs
                .insert("cancelled_windows".into(), serde_json::to_value(&self.cancelled)?);
        }
        Ok(metrics)
    }
}

// ---------------------------------------------------------------------------
// Row-level helpers shared with the checkpoint journal
// ---------------------------------------------------------------------------

/// Close a running run. Only rows still in `running` are touched.
pub(crate) async fn close_run(
    conn: &mut SqliteConnection,
    run: RunId,
    status: RunStatus,
    metrics: &RunMetrics,
    error: Option<&str>,
) -> Result<()> {
    let finished = to_micros(Utc::now());
    let attrs = serde_json::Value::Object(metrics.attrs.clone()).to_string();
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET status = ?, error = ?, finished_at = ?, duration_ms = (? - started_at) / 1000,
            rows_in = ?, rows_out = ?, external_calls = ?,
            input_tokens = ?, output_tokens = ?, cost_usd = ?, attrs = ?
        WHERE run_id = ? AND status = 'running'
        "#,
    )
    .bind(status.as_str())
    .bind(error)
    .bind(finished)
    .bind(finished)
    .bind(clamp_i64(metrics.rows_in))
    .bind(clamp_i64(metrics.rows_out))
    .bind(clamp_i64(metrics.external_calls))
    .bind(clamp_i64(metrics.tokens.input_tokens))
    .bind(clamp_i64(metrics.tokens.output_tokens))
    .bind(metrics.cost_usd)
    .bind(attrs)
    .bind(run.to_string())
    .execute(&mut *conn)
    .await
    .map_err(tracking_error(run))?;

    if result.rows_affected() == 1 {
        return Ok(());
    }
    let current: Option<(String,)> = sqlx::query_as("SELECT status FROM runs WHERE run_id = ?")
        .bind(run.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(tracking_error(run))?;
    let message = match current {
        Some((current,)) => format!("run is already {current}, cannot mark it {status}"),
        None => "run does not exist".to_string(),
    };
    Err(ChronicleError::RunTracking {
        run: run.to_string(),
        message,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<RunRecord> {
    let run_id: String = row.try_get("run_id").map_err(tracking_error("?"))?;
    let get = tracking_error(&run_id);
    let parent: Option<String> = row.try_get("parent_run_id").map_err(&get)?;
    let status: String = row.try_get("status").map_err(&get)?;
    let finished: Option<i64> = row.try_get("finished_at").map_err(&get)?;
    let attrs: String = row.try_get("attrs").map_err(&get)?;
    let count = |name: &str| -> Result<u64> {
        let v: i64 = row.try_get(name).map_err(&get)?;
        Ok(v.max(0) as u64)
    };
    let attrs = match serde_json::from_str::<serde_json::Value>(&attrs)? {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    Ok(RunRecord {
        run_id: RunId::from_str(&run_id)?,
        tenant_id: row.try_get("tenant_id").map_err(&get)?,
        stage: row.try_get("stage").map_err(&get)?,
        status: status.parse()?,
        error: row.try_get("error").map_err(&get)?,
        parent_run_id: parent.as_deref().map(RunId::from_str).transpose()?,
        started_at: from_micros(row.try_get("started_at").map_err(&get)?)?,
        finished_at: finished.map(from_micros).transpose()?,
        duration_ms: row.try_get("duration_ms").map_err(&get)?,
        metrics: RunMetrics {
            rows_in: count("rows_in")?,
            rows_out: count("rows_out")?,
            external_calls: count("external_calls")?,
            tokens: TokenUsage {
                input_tokens: count("input_tokens")?,
                output_tokens: count("output_tokens")?,
            },
            cost_usd: row.try_get("cost_usd").map_err(&get)?,
            attrs,
        },
        code_ref: row.try_get("code_ref").map_err(&get)?,
        config_hash: row.try_get("config_hash").map_err(&get)?,
        input_fingerprint: row.try_get("input_fingerprint").map_err(&get)?,
        trace_id: row.try_get("trace_id").map_err(&get)?,
    })
}

// ---------------------------------------------------------------------------
// RunTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunTracker {
    store: Store,
    code_ref: Option<String>,
    config_hash: Option<String>,
    trace_id: Option<String>,
}

impl RunTracker {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            code_ref: None,
            config_hash: None,
            trace_id: None,
        }
    }

    /// Stamp every run started by this tracker with code and config provenance.
    pub fn with_provenance(
        mut self,
        code_ref: Option<String>,
        config_hash: Option<String>,
    ) -> Self {
        self.code_ref = code_ref;
        self.config_hash = config_hash;
        self
    }

    /// Stamp every run started by this tracker with a correlation id.
    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Open a run in `running`. The parent, if any, is fixed here and never
    /// changes afterwards.
    pub async fn start(&self, stage: &str, tenant_id: &str, parent: Option<RunId>) -> Result<RunId> {
        self.open(stage, tenant_id, parent, None).await
    }

    /// [`start`](Self::start), also recording the fingerprint of the rows the
    /// run consumes.
    pub async fn start_with_input(
        &self,
        stage: &str,
        tenant_id: &str,
        parent: Option<RunId>,
        input: &Table,
    ) -> Result<RunId> {
        self.open(stage, tenant_id, parent, Some(fingerprint_table(input)?))
            .await
    }

    async fn open(
        &self,
        stage: &str,
        tenant_id: &str,
        parent: Option<RunId>,
        input_fingerprint: Option<String>,
    ) -> Result<RunId> {
        let run = RunId::new();
        if let Some(parent) = parent {
            if self.get(parent).await?.is_none() {
                return Err(ChronicleError::RunTracking {
                    run: run.to_string(),
                    message: format!("parent run {parent} does not exist"),
                });
            }
        }
        sqlx::query(
            r#"
            INSERT INTO runs (
                run_id, tenant_id, stage, status, parent_run_id, started_at,
                code_ref, config_hash, input_fingerprint, trace_id
            )
            VALUES (?, ?, ?, 'running', ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.to_string())
        .bind(tenant_id)
        .bind(stage)
        .bind(parent.map(|p| p.to_string()))
        .bind(to_micros(Utc::now()))
        .bind(&self.code_ref)
        .bind(&self.config_hash)
        .bind(&input_fingerprint)
        .bind(&self.trace_id)
        .execute(self.store.pool())
        .await
        .map_err(tracking_error(run))?;
        tracing::info!(run_id = %run, stage, tenant = tenant_id, parent = ?parent, "Run started");
        Ok(run)
    }

    pub async fn complete(&self, run: RunId, metrics: &RunMetrics) -> Result<()> {
        let mut conn = self.acquire(run).await?;
        close_run(&mut conn, run, RunStatus::Completed, metrics, None).await?;
        tracing::info!(
            run_id = %run,
            rows_in = metrics.rows_in,
            rows_out = metrics.rows_out,
            tokens = metrics.tokens.total(),
            "Run completed"
        );
        Ok(())
    }

    /// Mark failed, keeping the error text and whatever the run consumed
    /// before it failed.
    pub async fn fail(&self, run: RunId, error: &str, metrics: &RunMetrics) -> Result<()> {
        let mut conn = self.acquire(run).await?;
        close_run(&mut conn, run, RunStatus::Failed, metrics, Some(error)).await?;
        tracing::warn!(
            run_id = %run,
            error,
            rows_in = metrics.rows_in,
            external_calls = metrics.external_calls,
            "Run failed"
        );
        Ok(())
    }

    /// Mark degraded, recording which windows succeeded and which failed.
    pub async fn degrade(&self, run: RunId, partial: PartialRun) -> Result<()> {
        let summary = format!(
            "{} window(s) failed, {} succeeded, {} cancelled",
            partial.failed.len(),
            partial.succeeded.len(),
            partial.cancelled.len()
        );
        let metrics = partial.into_metrics()?;
        let mut conn = self.acquire(run).await?;
        close_run(&mut conn, run, RunStatus::Degraded, &metrics, Some(&summary)).await?;
        tracing::warn!(run_id = %run, summary = %summary, "Run degraded");
        Ok(())
    }

    pub async fn get(&self, run: RunId) -> Result<Option<RunRecord>> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?")
            .bind(run.to_string())
            .fetch_optional(self.store.pool())
            .await
            .map_err(tracking_error(run))?;
        row.as_ref().map(run_from_row).transpose()
    }

    /// Direct children of `run`, oldest first.
    pub async fn children(&self, run: RunId) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE parent_run_id = ? ORDER BY started_at, run_id",
        )
        .bind(run.to_string())
        .fetch_all(self.store.pool())
        .await
        .map_err(tracking_error(run))?;
        rows.iter().map(run_from_row).collect()
    }

    /// Most recently started runs, newest first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query("SELECT * FROM runs ORDER BY started_at DESC, run_id LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(self.store.pool())
            .await
            .map_err(tracking_error("*"))?;
        rows.iter().map(run_from_row).collect()
    }

    /// Walk from `run` to its root. The first element is `run` itself, the
    /// last has no parent. A revisited id is reported instead of looping.
    pub async fn lineage(&self, run: RunId) -> Result<Vec<RunRecord>> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = Some(run);
        while let Some(id) = cursor {
            if !visited.insert(id) {
                return Err(ChronicleError::RunTracking {
                    run: run.to_string(),
                    message: format!("lineage cycle through run {id}"),
                });
            }
            let record = self.get(id).await?.ok_or_else(|| ChronicleError::RunTracking {
                run: run.to_string(),
                message: format!("lineage references missing run {id}"),
            })?;
            cursor = record.parent_run_id;
            chain.push(record);
        }
        Ok(chain)
    }

    async fn acquire(&self, run: RunId) -> Result<sqlx::pool::PoolConnection<sqlx::Sqlite>> {
        self.store
            .pool()
            .acquire()
            .await
            .map_err(tracking_error(run))
    }
}
