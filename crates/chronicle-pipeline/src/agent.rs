//! The content-generation seam.
//!
//! An agent receives one window's transformed rows plus prior context and
//! returns draft artifacts. Agents are external collaborators; [`DigestAgent`]
//! is a deterministic offline implementation used by the CLI.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;

use chronicle_types::{
    Document, DraftArtifact, Result, RunMetrics, Table, TokenUsage, WindowKey,
};

/// What the pipeline already knows about the stream before this window.
#[derive(Debug, Clone, Default)]
pub struct PriorContext {
    /// Journal of the latest window that ended at or before this one starts.
    pub previous_journal: Option<Document>,
    /// Most recent non-journal documents, newest first.
    pub recent: Vec<Document>,
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub window: &'a WindowKey,
    pub rows: &'a Table,
    pub prior: &'a PriorContext,
}

/// External usage reported by an agent; folded into the window run's metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub calls: u64,
    pub tokens: TokenUsage,
    pub cost_usd: f64,
}

impl Usage {
    pub fn record(&self, metrics: &mut RunMetrics) {
        metrics.external_calls += self.calls;
        metrics.tokens += self.tokens;
        metrics.cost_usd += self.cost_usd;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub drafts: Vec<DraftArtifact>,
    pub usage: Usage,
}

#[async_trait]
pub trait GenerationAgent: Send + Sync {
    /// Produce drafts for one window. Transient failures should be reported
    /// as retryable errors; the runner retries them with backoff.
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<Generation>;
}

// ---------------------------------------------------------------------------
// DigestAgent
// ---------------------------------------------------------------------------

/// Writes one digest post per window: message and author counts, the
/// busiest threads, and a pointer back to the previous window's journal.
#[derive(Debug, Clone)]
pub struct DigestAgent {
    top_threads: usize,
}

impl Default for DigestAgent {
    fn default() -> Self {
        Self { top_threads: 3 }
    }
}

impl DigestAgent {
    pub fn new(top_threads: usize) -> Self {
        Self { top_threads }
    }

    fn body(&self, request: &GenerationRequest<'_>) -> String {
        let rows = request.rows;
        let authors: HashSet<String> = rows
            .iter()
            .filter_map(|r| r.get("author_uuid").filter(|v| !v.is_null()))
            .map(ToString::to_string)
            .collect();
        let mut threads: BTreeMap<String, usize> = BTreeMap::new();
        for row in rows.iter() {
            if let Some(thread) = row.get("thread_id").filter(|v| !v.is_null()) {
                *threads.entry(thread.to_string()).or_default() += 1;
            }
        }
        let mut busiest: Vec<(String, usize)> = threads.into_iter().collect();
        busiest.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut lines = vec![format!(
            "{} messages from {} authors.",
            rows.len(),
            authors.len()
        )];
        for (thread, count) in busiest.into_iter().take(self.top_threads) {
            lines.push(format!("- thread {thread}: {count} messages"));
        }
        if let Some(prev) = &request.prior.previous_journal {
            lines.push(format!("Previously: {}", prev.slug));
        }
        lines.join("\n")
    }
}

#[async_trait]
impl GenerationAgent for DigestAgent {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<Generation> {
        if request.rows.is_empty() {
            return Ok(Generation::default());
        }
        let title = format!(
            "Digest {} {}",
            request.window.source,
            request.window.start.format("%Y-%m-%d %H:%M")
        );
        let slug = format!(
            "digest-{}-{}",
            request.window.source,
            request.window.start.format("%Y%m%dT%H%M%S")
        );
        let draft = DraftArtifact::post(title, self.body(&request)).with_slug(slug);
        Ok(Generation {
            drafts: vec![draft],
            usage: Usage::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::views::builtin::tests::sample_events;
    use chrono::{TimeZone, Utc};
    use chronicle_types::DocumentKind;

    fn key() -> WindowKey {
        WindowKey {
            tenant_id: "acme".into(),
            source: "chat".into(),
            start: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn digest_summarises_window() {
        let rows = sample_events();
        let prior = PriorContext::default();
        let out = DigestAgent::default()
            .generate(GenerationRequest {
                window: &key(),
                rows: &rows,
                prior: &prior,
            })
            .await
            .unwrap();
        assert_eq!(out.drafts.len(), 1);
        let draft = &out.drafts[0];
        assert_eq!(draft.kind, DocumentKind::Post);
        assert!(draft.body.starts_with("24 messages from 4 authors."));
        assert_eq!(draft.body.lines().filter(|l| l.starts_with("- thread")).count(), 3);
        assert!(draft.validate().is_ok());
    }

    #[tokio::test]
    async fn empty_window_has_no_drafts() {
        let rows = Table::empty(crate::ir::ir_v1_columns());
        let prior = PriorContext::default();
        let out = DigestAgent::default()
            .generate(GenerationRequest {
                window: &key(),
                rows: &rows,
                prior: &prior,
            })
            .await
            .unwrap();
        assert!(out.drafts.is_empty());
    }

    #[test]
    fn usage_accumulates_into_metrics() {
        let mut metrics = RunMetrics::default();
        let usage = Usage {
            calls: 2,
            tokens: TokenUsage {
                input_tokens: 100,
                output_tokens: 20,
            },
            cost_usd: 0.5,
        };
        usage.record(&mut metrics);
        usage.record(&mut metrics);
        assert_eq!(metrics.external_calls, 4);
        assert_eq!(metrics.tokens.total(), 240);
        assert!((metrics.cost_usd - 1.0).abs() < f64::EPSILON);
    }
}
