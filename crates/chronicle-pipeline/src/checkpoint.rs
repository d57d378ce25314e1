//! Store-backed checkpointing.
//!
//! A window is complete exactly when a journal document with its bounds
//! exists. The journal is written in the same transaction as the window's
//! artifacts (and, through [`CheckpointJournal::commit_window`], the closing
//! of its run), so "work is done" can never outlive the work product. The
//! unique partial index on journal bounds turns a lost race between two
//! workers into [`ChronicleError::CheckpointConflict`].

use chrono::{DateTime, Utc};

use chronicle_types::{
    ChronicleError, Document, DraftArtifact, Result, RunId, RunMetrics, RunStatus, WindowKey,
};

use crate::store::codec::to_micros;
use crate::store::{document_from_row, insert_document, is_unique_violation, store_error, Store};
use crate::tracking::close_run;

#[derive(Debug, Clone)]
pub struct CheckpointJournal {
    store: Store,
}

impl CheckpointJournal {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Whether a journal with exactly these bounds exists.
    pub async fn already_processed(&self, window: &WindowKey) -> Result<bool> {
        let found: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM documents
            WHERE kind = 'journal' AND tenant_id = ? AND source = ?
              AND window_start = ? AND window_end = ?
            LIMIT 1
            "#,
        )
        .bind(&window.tenant_id)
        .bind(&window.source)
        .bind(to_micros(window.start))
        .bind(to_micros(window.end))
        .fetch_optional(self.store.pool())
        .await
        .map_err(store_error("check journal"))?;
        Ok(found.is_some())
    }

    /// Persist the window's artifacts and its journal atomically. Returns the
    /// journal document.
    pub async fn record_completion(
        &self,
        window: &WindowKey,
        artifacts: Vec<DraftArtifact>,
        run: RunId,
    ) -> Result<Document> {
        self.write(window, artifacts, run, None).await
    }

    /// [`record_completion`](Self::record_completion) that also closes `run`
    /// as completed with `metrics` inside the same transaction.
    pub async fn commit_window(
        &self,
        window: &WindowKey,
        artifacts: Vec<DraftArtifact>,
        run: RunId,
        metrics: &RunMetrics,
    ) -> Result<Document> {
        self.write(window, artifacts, run, Some(metrics)).await
    }

    async fn write(
        &self,
        window: &WindowKey,
        artifacts: Vec<DraftArtifact>,
        run: RunId,
        close_with: Option<&RunMetrics>,
    ) -> Result<Document> {
        if window.start > window.end {
            return Err(ChronicleError::WindowIntegrity(format!(
                "window {window} starts after it ends"
            )));
        }
        let documents = artifacts
            .into_iter()
            .map(|draft| Document::from_draft(draft, window, run))
            .collect::<Result<Vec<_>>>()?;
        let journal = Document::journal(window, run, &documents);

        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(store_error("begin window commit"))?;
        for doc in documents.iter().chain(std::iter::once(&journal)) {
            if let Err(e) = insert_document(&mut tx, doc).await {
                // Dropping the transaction rolls it back.
                if is_unique_violation(&e) && doc.kind == chronicle_types::DocumentKind::Journal {
                    tracing::info!(window = %window, run_id = %run, "Window already committed by another worker");
                    return Err(ChronicleError::CheckpointConflict {
                        window: window.clone(),
                    });
                }
                return Err(store_error("write documents")(e));
            }
        }
        if let Some(metrics) = close_with {
            let mut metrics = metrics.clone();
            metrics.rows_out = documents.len() as u64;
            close_run(&mut tx, run, RunStatus::Completed, &metrics, None).await?;
        }
        tx.commit().await.map_err(store_error("commit window"))?;

        tracing::info!(
            window = %window,
            run_id = %run,
            artifacts = documents.len(),
            "Window committed"
        );
        Ok(journal)
    }

    /// Journals for one stream, ordered by window start.
    pub async fn journals(&self, tenant_id: &str, source: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM documents
            WHERE kind = 'journal' AND tenant_id = ? AND source = ?
            ORDER BY window_start, window_end
            "#,
        )
        .bind(tenant_id)
        .bind(source)
        .fetch_all(self.store.pool())
        .await
        .map_err(store_error("load journals"))?;
        rows.iter().map(document_from_row).collect()
    }

    /// The latest journal whose window ended at or before `before`. Used as
    /// prior context for the next window.
    pub async fn latest_journal(
        &self,
        tenant_id: &str,
        source: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<Document>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM documents
            WHERE kind = 'journal' AND tenant_id = ? AND source = ? AND window_end <= ?
            ORDER BY window_end DESC, window_start DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(source)
        .bind(to_micros(before))
        .fetch_optional(self.store.pool())
        .await
        .map_err(store_error("load latest journal"))?;
        row.as_ref().map(document_from_row).transpose()
    }
}
