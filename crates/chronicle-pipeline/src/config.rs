//! Runner configuration, loadable from a JSON file. Every field has a
//! default, so `{}` is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use chronicle_types::{ChronicleError, Result};

use crate::ir::IR_V1;
use crate::retry::Backoff;
use crate::schema::DEFAULT_SAMPLE_CAP;
use crate::views::builtin_contract;
use crate::windowing::{DateRange, WindowPolicy};

/// One step of the per-window transformation chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Name looked up in the view registry.
    pub view: String,
    pub input_schema: String,
    pub output_schema: String,
}

impl StageSpec {
    pub fn new(
        view: impl Into<String>,
        input_schema: impl Into<String>,
        output_schema: impl Into<String>,
    ) -> Self {
        Self {
            view: view.into(),
            input_schema: input_schema.into(),
            output_schema: output_schema.into(),
        }
    }

    /// A built-in view with its declared contract.
    pub fn builtin(view: &str) -> Result<Self> {
        let (input, output) = builtin_contract(view).ok_or_else(|| {
            ChronicleError::Config(format!("'{view}' is not a built-in view"))
        })?;
        Ok(Self::new(view, input, output))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_ms: 500,
            max_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Backoff {
        if self.base_ms == 0 {
            Backoff::IMMEDIATE
        } else {
            Backoff::exponential(
                Duration::from_millis(self.base_ms),
                Duration::from_millis(self.max_ms),
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub database_path: PathBuf,
    pub max_connections: u32,
    /// Windows processed concurrently.
    pub max_workers: usize,
    pub windowing: WindowPolicy,
    pub date_range: DateRange,
    pub stages: Vec<StageSpec>,
    pub retry: RetryConfig,
    /// Per-attempt limit on a generation call.
    pub generation_timeout_ms: Option<u64>,
    /// Rows value-checked per schema validation.
    pub validation_sample: usize,
    /// Stage name recorded on the batch run.
    pub stage_name: String,
    /// Recent documents handed to the agent as prior context.
    pub prior_documents: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(".chronicle/chronicle.db"),
            max_connections: 4,
            max_workers: 4,
            windowing: WindowPolicy::default(),
            date_range: DateRange::default(),
            stages: vec![StageSpec::new("messages_with_text", IR_V1, IR_V1)],
            retry: RetryConfig::default(),
            generation_timeout_ms: None,
            validation_sample: DEFAULT_SAMPLE_CAP,
            stage_name: "batch".to_string(),
            prior_documents: 5,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| ChronicleError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(ChronicleError::Config("max_workers must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(ChronicleError::Config(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.stage_name.trim().is_empty() {
            return Err(ChronicleError::Config("stage_name must not be empty".into()));
        }
        if let (Some(from), Some(to)) = (self.date_range.from, self.date_range.to) {
            if from >= to {
                return Err(ChronicleError::Config(format!(
                    "date_range.from ({from}) must precede date_range.to ({to})"
                )));
            }
        }
        Ok(())
    }

    /// Hex SHA-256 of the JSON form, stamped on every run as `config_hash`.
    pub fn fingerprint(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(self)?);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::windowing::WindowUnit;

    #[test]
    fn empty_object_is_default() {
        let config: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_overrides_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chronicle.json");
        std::fs::write(
            &path,
            r#"{
                "max_workers": 8,
                "windowing": { "unit": "messages", "size": 50, "overlap": 0.1 },
                "stages": [
                    { "view": "chunks_optimized", "input_schema": "ir_v1", "output_schema": "ir_v1_chunked" }
                ],
                "retry": { "max_retries": 1 }
            }"#,
        )
        .unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.windowing.unit, WindowUnit::Messages);
        assert_eq!(config.windowing.size, 50);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.base_ms, 500);
        assert_eq!(config.stages[0], StageSpec::builtin("chunks_optimized").unwrap());
        assert_eq!(config.stage_name, "batch");
    }

    #[test]
    fn invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "max_workers": 0 }"#).unwrap();
        assert!(matches!(
            PipelineConfig::load(&path),
            Err(ChronicleError::Config(_))
        ));
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            PipelineConfig::load(&path),
            Err(ChronicleError::Config(_))
        ));
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = PipelineConfig::default();
        let mut b = PipelineConfig::default();
        let hash = a.fingerprint().unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, b.fingerprint().unwrap());
        b.max_workers = 9;
        assert_ne!(hash, b.fingerprint().unwrap());
    }

    #[test]
    fn zero_base_disables_backoff() {
        let retry = RetryConfig {
            base_ms: 0,
            ..Default::default()
        };
        assert_eq!(retry.backoff(), Backoff::IMMEDIATE);
    }
}
