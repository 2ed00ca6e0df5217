//! Configuration types for reconcilers and stream sources.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{Result, StreamStageError};

/// Configuration for a reconciling stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Stage name used in logs and events.
    #[serde(default = "default_stage_name")]
    pub stage_name: String,
    /// Maximum number of domain transforms running at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_transforms: usize,
    /// Consecutive passes without progress before a stall warning.
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold_passes: u32,
    /// Delay between passes when driven by `run_until_finished`.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Fraction of the poll interval added as random jitter.
    #[serde(default = "default_poll_jitter")]
    pub poll_jitter: f64,
    /// Upper bound on passes for `run_until_finished`; `None` is unbounded.
    #[serde(default)]
    pub max_passes: Option<u64>,
}

fn default_stage_name() -> String {
    "stage".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_stall_threshold() -> u32 {
    10
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_poll_jitter() -> f64 {
    0.1
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            stage_name: default_stage_name(),
            max_concurrent_transforms: default_max_concurrent(),
            stall_threshold_passes: default_stall_threshold(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_jitter: default_poll_jitter(),
            max_passes: None,
        }
    }
}

impl ReconcilerConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from JSON, filling in defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| StreamStageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the stage name.
    #[must_use]
    pub fn with_stage_name(mut self, name: impl Into<String>) -> Self {
        self.stage_name = name.into();
        self
    }

    /// Sets the transform concurrency.
    #[must_use]
    pub fn with_max_concurrent_transforms(mut self, n: usize) -> Self {
        self.max_concurrent_transforms = n;
        self
    }

    /// Sets the stall threshold.
    #[must_use]
    pub fn with_stall_threshold(mut self, passes: u32) -> Self {
        self.stall_threshold_passes = passes;
        self
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Sets the pass limit.
    #[must_use]
    pub fn with_max_passes(mut self, passes: u64) -> Self {
        self.max_passes = Some(passes);
        self
    }

    /// Returns the poll interval as a Duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Checks the configuration for values that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.stage_name.trim().is_empty() {
            return Err(StreamStageError::Config("stage_name must not be empty".into()));
        }
        if self.max_concurrent_transforms == 0 {
            return Err(StreamStageError::Config(
                "max_concurrent_transforms must be at least 1".into(),
            ));
        }
        if self.stall_threshold_passes == 0 {
            return Err(StreamStageError::Config(
                "stall_threshold_passes must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.poll_jitter) {
            return Err(StreamStageError::Config(format!(
                "poll_jitter must be within [0, 1], got {}",
                self.poll_jitter
            )));
        }
        Ok(())
    }
}

/// Configuration for a directory-backed stream source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorySourceConfig {
    /// Directory watched for new files.
    pub directory: PathBuf,
    /// Regular expression file names must match.
    #[serde(default = "default_pattern")]
    pub pattern: String,
    /// Seconds without a new file after which the stream is closed.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    /// File whose presence in the directory closes the stream.
    #[serde(default)]
    pub sentinel_file: Option<String>,
}

fn default_pattern() -> String {
    r".*\d+.*".to_string()
}

fn default_timeout_seconds() -> f64 {
    60.0
}

impl DirectorySourceConfig {
    /// Creates a configuration watching `directory`.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            pattern: default_pattern(),
            timeout_seconds: default_timeout_seconds(),
            sentinel_file: None,
        }
    }

    /// Sets the file name pattern.
    #[must_use]
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    /// Sets the no-new-files timeout.
    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: f64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Sets the sentinel file name.
    #[must_use]
    pub fn with_sentinel(mut self, name: impl Into<String>) -> Self {
        self.sentinel_file = Some(name.into());
        self
    }

    /// Returns the timeout as a Duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconciler_config_defaults() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.max_concurrent_transforms, 4);
        assert_eq!(config.stall_threshold_passes, 10);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_reconciler_config_from_json_fills_defaults() {
        let config =
            ReconcilerConfig::from_json_str(r#"{"stage_name": "align", "max_passes": 3}"#).unwrap();
        assert_eq!(config.stage_name, "align");
        assert_eq!(config.max_passes, Some(3));
        assert_eq!(config.poll_interval_ms, 5000);
    }

    #[test]
    fn test_reconciler_config_rejects_invalid() {
        let err = ReconcilerConfig::from_json_str(r#"{"max_concurrent_transforms": 0}"#).unwrap_err();
        assert!(matches!(err, StreamStageError::Config(_)));

        let config = ReconcilerConfig {
            poll_jitter: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        assert!(ReconcilerConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_directory_config_builders() {
        let config = DirectorySourceConfig::new("/data/movies")
            .with_pattern(r"movie\d+\.mrcs")
            .with_timeout_seconds(30.0)
            .with_sentinel("DONE");

        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.sentinel_file.as_deref(), Some("DONE"));
    }
}
