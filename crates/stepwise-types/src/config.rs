//! Workflow engine configuration.
//!
//! `WorkflowConfig` is loaded from `workflow.toml` and controls run timeouts,
//! validation and stream buffering. All fields have sensible defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine settings applied to every run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Whole-run timeout in seconds. `None` or `0` disables the timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: Option<u64>,

    /// Log every step dispatch at `info` instead of `debug`.
    #[serde(default)]
    pub verbose: bool,

    /// Skip graph validation when building the workflow.
    #[serde(default)]
    pub disable_validation: bool,

    /// Capacity of the per-context stream broadcast channel.
    #[serde(default = "default_stream_capacity")]
    pub stream_capacity: usize,
}

fn default_timeout_secs() -> Option<u64> {
    Some(10)
}

fn default_stream_capacity() -> usize {
    1024
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            verbose: false,
            disable_validation: false,
            stream_capacity: default_stream_capacity(),
        }
    }
}

impl WorkflowConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_config_default_values() {
        let config = WorkflowConfig::default();
        assert_eq!(config.timeout_secs, Some(10));
        assert!(!config.verbose);
        assert!(!config.disable_validation);
        assert_eq!(config.stream_capacity, 1024);
        assert_eq!(config.timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_workflow_config_deserialize_with_defaults() {
        let config: WorkflowConfig = toml::from_str("").unwrap();
        assert_eq!(config, WorkflowConfig::default());
    }

    #[test]
    fn test_workflow_config_deserialize_with_values() {
        let toml_str = r#"
timeout_secs = 120
verbose = true
disable_validation = true
stream_capacity = 64
"#;
        let config: WorkflowConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.timeout_secs, Some(120));
        assert!(config.verbose);
        assert!(config.disable_validation);
        assert_eq!(config.stream_capacity, 64);
    }

    #[test]
    fn test_workflow_config_serde_roundtrip() {
        let config = WorkflowConfig {
            timeout_secs: None,
            verbose: true,
            disable_validation: false,
            stream_capacity: 8,
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: WorkflowConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
        assert!(parsed.timeout().is_none());
    }

    #[test]
    fn test_zero_timeout_disables() {
        let config: WorkflowConfig = toml::from_str("timeout_secs = 0").unwrap();
        assert_eq!(config.timeout_secs, Some(0));
        assert!(config.timeout().is_none());
    }
}
