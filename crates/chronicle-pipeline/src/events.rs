//! Batch progress events.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! observers (the CLI's progress output, tests) can follow a batch without
//! coupling to the runner internals.

use serde::{Deserialize, Serialize};

use chronicle_types::{RunId, WindowKey};

/// Events emitted while a batch runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    BatchStarted {
        run_id: RunId,
        tenant_id: String,
        source: String,
        window_count: usize,
    },
    BatchCompleted {
        run_id: RunId,
        status: String,
        duration_ms: u64,
    },
    WindowSkipped {
        window: WindowKey,
    },
    WindowStarted {
        window: WindowKey,
        run_id: RunId,
        rows: usize,
    },
    WindowCompleted {
        window: WindowKey,
        run_id: RunId,
        artifacts: usize,
        duration_ms: u64,
    },
    WindowFailed {
        window: WindowKey,
        run_id: RunId,
        error: String,
    },
    WindowRetrying {
        window: WindowKey,
        attempt: usize,
    },
    CheckpointConflict {
        window: WindowKey,
        run_id: RunId,
    },
    WindowCancelled {
        window: WindowKey,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers. Dropped when nobody listens.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
