//! Execution-run bookkeeping types.

use std::fmt;
use std::ops::AddAssign;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ChronicleError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RunId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunId {
    type Err = ChronicleError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s).map(RunId).map_err(|e| ChronicleError::RunTracking {
            run: s.to_string(),
            message: format!("malformed run id: {e}"),
        })
    }
}

/// Run lifecycle. Transitions are monotonic: `Running` moves to exactly one
/// of the terminal states and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Degraded,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Degraded => "degraded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ChronicleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "degraded" => Ok(RunStatus::Degraded),
            other => Err(ChronicleError::RunTracking {
                run: String::new(),
                message: format!("unknown run status '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// Counters recorded when a run closes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub rows_in: u64,
    pub rows_out: u64,
    pub external_calls: u64,
    pub tokens: TokenUsage,
    pub cost_usd: f64,
    #[serde(default)]
    pub attrs: serde_json::Map<String, serde_json::Value>,
}

impl RunMetrics {
    pub fn with_attr(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }
}

/// Sums counters; attrs are left to the caller.
impl AddAssign<&RunMetrics> for RunMetrics {
    fn add_assign(&mut self, rhs: &RunMetrics) {
        self.rows_in += rhs.rows_in;
        self.rows_out += rhs.rows_out;
        self.external_calls += rhs.external_calls;
        self.tokens += rhs.tokens;
        self.cost_usd += rhs.cost_usd;
    }
}

/// One persisted row of the runs relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub tenant_id: String,
    pub stage: String,
    pub status: RunStatus,
    pub error: Option<String>,
    pub parent_run_id: Option<RunId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub metrics: RunMetrics,
    pub code_ref: Option<String>,
    pub config_hash: Option<String>,
    /// `sha256:<hex>` of the rows the run was started on, if any.
    pub input_fingerprint: Option<String>,
    /// Correlation id shared by every run of one invocation.
    pub trace_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_to_snake_case() {
        let json = serde_json::to_string(&RunStatus::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
        assert_eq!("completed".parse::<RunStatus>().unwrap(), RunStatus::Completed);
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn only_running_is_non_terminal() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Degraded.is_terminal());
    }

    #[test]
    fn run_id_parses_and_displays() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<RunId>().is_err());
    }

    #[test]
    fn metrics_accumulate() {
        let mut total = RunMetrics::default();
        let window = RunMetrics {
            rows_in: 10,
            rows_out: 2,
            external_calls: 1,
            tokens: TokenUsage {
                input_tokens: 100,
                output_tokens: 20,
            },
            cost_usd: 0.5,
            attrs: Default::default(),
        };
        total += &window;
        total += &window;
        assert_eq!(total.rows_in, 20);
        assert_eq!(total.external_calls, 2);
        assert_eq!(total.tokens.total(), 240);
        assert!((total.cost_usd - 1.0).abs() < f64::EPSILON);
    }
}
