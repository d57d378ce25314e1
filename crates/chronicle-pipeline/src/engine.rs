//! Batch runner: plan windows, skip completed ones, process the rest
//! concurrently, and close the batch run with an honest status.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::json;

use chronicle_types::{
    ChronicleError, DraftArtifact, Result, RunId, RunMetrics, RunStatus, Table, Window,
    WindowKey,
};

use crate::agent::{GenerationAgent, GenerationRequest, PriorContext};
use crate::checkpoint::CheckpointJournal;
use crate::config::PipelineConfig;
use crate::events::{EventEmitter, PipelineEvent};
use crate::ir::IR_V1;
use crate::retry::retry_generation;
use crate::schema::SchemaRegistry;
use crate::stage::{validated, StageContext, ValidatedStage};
use crate::store::Store;
use crate::tracking::{FailedWindow, PartialRun, RunTracker};
use crate::views::ViewRegistry;
use crate::windowing::WindowPlanner;

/// Stage name recorded on per-window child runs.
pub const WINDOW_STAGE: &str = "window";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Cooperative cancellation. Windows already in flight finish; windows not
/// yet started are reported as cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WindowOutcome {
    Completed { artifacts: usize },
    /// A journal already existed before the window was attempted.
    Skipped,
    /// Another worker committed the window first.
    Conflict,
    Failed { error: String },
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct WindowReport {
    pub window: WindowKey,
    pub run_id: Option<RunId>,
    pub outcome: WindowOutcome,
    pub metrics: RunMetrics,
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub run_id: RunId,
    pub status: RunStatus,
    /// Ordered by window start.
    pub windows: Vec<WindowReport>,
    pub metrics: RunMetrics,
}

impl BatchReport {
    fn count(&self, pred: impl Fn(&WindowOutcome) -> bool) -> usize {
        self.windows.iter().filter(|w| pred(&w.outcome)).count()
    }

    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, WindowOutcome::Completed { .. }))
    }

    /// Windows found already done, including lost checkpoint races.
    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, WindowOutcome::Skipped | WindowOutcome::Conflict))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, WindowOutcome::Failed { .. }))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|o| matches!(o, WindowOutcome::Cancelled))
    }
}

// ---------------------------------------------------------------------------
// PipelineRunner
// ---------------------------------------------------------------------------

pub struct PipelineRunner {
    store: Store,
    schemas: Arc<SchemaRegistry>,
    stages: Vec<ValidatedStage>,
    agent: Arc<dyn GenerationAgent>,
    config: PipelineConfig,
    tracker: RunTracker,
    journal: CheckpointJournal,
    events: EventEmitter,
    cancel: CancelHandle,
}

impl PipelineRunner {
    /// Build a runner. Every configured stage must name a registered view
    /// and registered schema versions.
    pub fn new(
        store: Store,
        schemas: SchemaRegistry,
        views: &ViewRegistry,
        agent: Arc<dyn GenerationAgent>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let schemas = Arc::new(schemas.with_sample_cap(config.validation_sample));
        schemas.get(IR_V1)?;
        let stages = config
            .stages
            .iter()
            .map(|spec| {
                schemas.get(&spec.input_schema)?;
                schemas.get(&spec.output_schema)?;
                Ok(validated(
                    spec.view.clone(),
                    spec.input_schema.clone(),
                    spec.output_schema.clone(),
                    views.get(&spec.view)?,
                    schemas.clone(),
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let tracker = RunTracker::new(store.clone()).with_provenance(
            Some(format!("chronicle-pipeline {}", env!("CARGO_PKG_VERSION"))),
            Some(config.fingerprint()?),
        );
        Ok(Self {
            journal: CheckpointJournal::new(store.clone()),
            store,
            schemas,
            stages,
            agent,
            config,
            tracker,
            events: EventEmitter::default(),
            cancel: CancelHandle::default(),
        })
    }

    /// Tag every run this runner opens with `trace_id`.
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.tracker = self.tracker.with_trace_id(Some(trace_id.into()));
        self
    }

    pub fn tracker(&self) -> &RunTracker {
        &self.tracker
    }

    pub fn journal(&self) -> &CheckpointJournal {
        &self.journal
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run every window of the stream stored for `(tenant_id, source)`.
    pub async fn run_stored(&self, tenant_id: &str, source: &str) -> Result<BatchReport> {
        let events = self.store.load_events(tenant_id, source).await?;
        self.run_batch(tenant_id, source, &events).await
    }

    /// Process `events` (ordered by `ts`) as one batch. Window failures
    /// degrade the batch; run-tracking and store failures abort it.
    pub async fn run_batch(
        &self,
        tenant_id: &str,
        source: &str,
        events: &Table,
    ) -> Result<BatchReport> {
        let started = Instant::now();
        let batch = self
            .tracker
            .start_with_input(&self.config.stage_name, tenant_id, None, events)
            .await?;

        let windows = match self.plan(tenant_id, source, events) {
            Ok(windows) => windows,
            Err(e) => {
                let metrics = RunMetrics {
                    rows_in: events.len() as u64,
                    ..Default::default()
                };
                self.tracker.fail(batch, &e.to_string(), &metrics).await?;
                return Err(e);
            }
        };
        tracing::info!(
            run_id = %batch,
            tenant = tenant_id,
            source,
            windows = windows.len(),
            "Batch started"
        );
        self.events.emit(PipelineEvent::BatchStarted {
            run_id: batch,
            tenant_id: tenant_id.to_string(),
            source: source.to_string(),
            window_count: windows.len(),
        });

        let processed = stream::iter(windows)
            .map(|window| self.process_window(batch, window))
            .buffer_unordered(self.config.max_workers)
            .try_collect::<Vec<_>>()
            .await;
        let mut reports = match processed {
            Ok(reports) => reports,
            Err(e) => {
                tracing::error!(run_id = %batch, error = %e, "Batch aborted");
                if let Err(close) = self
                    .tracker
                    .fail(batch, &e.to_string(), &RunMetrics::default())
                    .await
                {
                    tracing::error!(run_id = %batch, error = %close, "Could not record batch failure");
                }
                return Err(e);
            }
        };
        reports.sort_by(|a, b| (a.window.start, a.window.end).cmp(&(b.window.start, b.window.end)));

        let report = self.close_batch(batch, reports).await?;
        self.events.emit(PipelineEvent::BatchCompleted {
            run_id: batch,
            status: report.status.as_str().to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
        Ok(report)
    }

    fn plan(&self, tenant_id: &str, source: &str, events: &Table) -> Result<Vec<Window>> {
        self.schemas.check(IR_V1, events)?;
        WindowPlanner::new(self.config.windowing.clone())?
            .with_range(self.config.date_range)
            .plan(tenant_id, source, events)
            .collect()
    }

    async fn close_batch(&self, batch: RunId, windows: Vec<WindowReport>) -> Result<BatchReport> {
        let mut metrics = RunMetrics::default();
        let mut partial = PartialRun::default();
        for w in &windows {
            metrics += &w.metrics;
            match &w.outcome {
                WindowOutcome::Completed { .. } | WindowOutcome::Skipped | WindowOutcome::Conflict => {
                    partial.succeeded.push(w.window.clone())
                }
                WindowOutcome::Failed { error } => partial.failed.push(FailedWindow {
                    window: w.window.clone(),
                    error: error.clone(),
                }),
                WindowOutcome::Cancelled => partial.cancelled.push(w.window.clone()),
            }
        }
        let metrics = metrics
            .with_attr("windows", json!(windows.len()))
            .with_attr("succeeded", json!(partial.succeeded.len()))
            .with_attr("failed", json!(partial.failed.len()))
            .with_attr("cancelled", json!(partial.cancelled.len()));

        let status = if partial.failed.is_empty() && partial.cancelled.is_empty() {
            self.tracker.complete(batch, &metrics).await?;
            RunStatus::Completed
        } else if partial.succeeded.is_empty() && !partial.failed.is_empty() {
            let error = format!("all {} attempted window(s) failed", partial.failed.len());
            self.tracker.fail(batch, &error, &metrics).await?;
            RunStatus::Failed
        } else {
            partial.metrics = metrics.clone();
            self.tracker.degrade(batch, partial).await?;
            RunStatus::Degraded
        };

        Ok(BatchReport {
            run_id: batch,
            status,
            windows,
            metrics,
        })
    }

    /// One window end to end. `Err` is reserved for failures that must abort
    /// the batch.
    async fn process_window(&self, batch: RunId, window: Window) -> Result<WindowReport> {
        let key = window.key.clone();
        let report = |run_id, outcome, metrics| WindowReport {
            window: key.clone(),
            run_id,
            outcome,
            metrics,
        };

        if self.cancel.is_cancelled() {
            self.events.emit(PipelineEvent::WindowCancelled { window: key.clone() });
            return Ok(report(None, WindowOutcome::Cancelled, RunMetrics::default()));
        }
        if self.journal.already_processed(&key).await? {
            tracing::debug!(window = %key, "Window already processed, skipping");
            self.events.emit(PipelineEvent::WindowSkipped { window: key.clone() });
            return Ok(report(None, WindowOutcome::Skipped, RunMetrics::default()));
        }

        let run = self
            .tracker
            .start_with_input(WINDOW_STAGE, &key.tenant_id, Some(batch), &window.rows)
            .await?;
        let started = Instant::now();
        self.events.emit(PipelineEvent::WindowStarted {
            window: key.clone(),
            run_id: run,
            rows: window.len(),
        });
        let mut metrics = RunMetrics {
            rows_in: window.len() as u64,
            ..Default::default()
        }
        .with_attr("carried_rows", json!(window.carried));

        let prior = PriorContext {
            previous_journal: self
                .journal
                .latest_journal(&key.tenant_id, &key.source, key.start)
                .await?,
            recent: self
                .store
                .recent_documents(&key.tenant_id, &key.source, key.start, self.config.prior_documents)
                .await?,
        };

        let drafts = match self.produce(window, run, &prior, &mut metrics).await {
            Ok(drafts) => drafts,
            Err(e) if matches!(e, ChronicleError::RunTracking { .. }) => return Err(e),
            Err(e) => {
                let error = e.to_string();
                self.tracker.fail(run, &error, &metrics).await?;
                self.events.emit(PipelineEvent::WindowFailed {
                    window: key.clone(),
                    run_id: run,
                    error: error.clone(),
                });
                return Ok(report(Some(run), WindowOutcome::Failed { error }, metrics));
            }
        };

        let artifacts = drafts.len();
        match self.journal.commit_window(&key, drafts, run, &metrics).await {
            Ok(_) => {
                metrics.rows_out = artifacts as u64;
                self.events.emit(PipelineEvent::WindowCompleted {
                    window: key.clone(),
                    run_id: run,
                    artifacts,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                Ok(report(Some(run), WindowOutcome::Completed { artifacts }, metrics))
            }
            Err(e) if e.is_conflict() => {
                let metrics = metrics.with_attr("checkpoint_conflict", json!(true));
                self.tracker.complete(run, &metrics).await?;
                self.events.emit(PipelineEvent::CheckpointConflict {
                    window: key.clone(),
                    run_id: run,
                });
                Ok(report(Some(run), WindowOutcome::Conflict, RunMetrics::default()))
            }
            Err(e) => Err(e),
        }
    }

    /// Transform the window's rows through the stage chain and generate
    /// drafts from them. `metrics` is filled in even when this fails, so a
    /// failed run still records the calls it spent.
    async fn produce(
        &self,
        window: Window,
        run: RunId,
        prior: &PriorContext,
        metrics: &mut RunMetrics,
    ) -> Result<Vec<DraftArtifact>> {
        let ctx = StageContext {
            tenant_id: window.key.tenant_id.clone(),
            run_id: Some(run),
            window: Some(window.key.clone()),
        };
        let key = window.key;
        let mut rows = window.rows;
        for stage in &self.stages {
            rows = stage.process(rows, &ctx).await?;
        }
        metrics.attrs.insert("rows_transformed".into(), json!(rows.len()));

        let attempts = AtomicUsize::new(0);
        let retries = AtomicUsize::new(0);
        let timeout = self.config.generation_timeout_ms;
        let (agent, key_ref, rows_ref, attempts_ref) = (&self.agent, &key, &rows, &attempts);
        let generation = retry_generation(
            &key,
            &self.config.retry,
            move || async move {
                attempts_ref.fetch_add(1, Ordering::Relaxed);
                let request = GenerationRequest {
                    window: key_ref,
                    rows: rows_ref,
                    prior,
                };
                match timeout {
                    Some(ms) => {
                        match tokio::time::timeout(Duration::from_millis(ms), agent.generate(request)).await {
                            Ok(result) => result,
                            Err(_) => Err(ChronicleError::GenerationTimeout { timeout_ms: ms }),
                        }
                    }
                    None => agent.generate(request).await,
                }
            },
            |failed, _| {
                retries.fetch_add(1, Ordering::Relaxed);
                self.events.emit(PipelineEvent::WindowRetrying {
                    window: key.clone(),
                    attempt: failed,
                });
            },
        )
        .await;

        // Failed attempts still cost a call each; a success reports its own usage.
        let attempts = attempts.load(Ordering::Relaxed);
        let failed_calls = match &generation {
            Ok(_) => attempts.saturating_sub(1),
            Err(_) => attempts,
        };
        metrics.external_calls += failed_calls as u64;
        metrics.attrs.insert("attempts".into(), json!(attempts));
        metrics
            .attrs
            .insert("retries".into(), json!(retries.load(Ordering::Relaxed)));
        let generation = generation?;
        generation.usage.record(metrics);
        for draft in &generation.drafts {
            draft.validate()?;
        }
        Ok(generation.drafts)
    }
}
