//! Workflow configuration loader.
//!
//! Reads `workflow.toml` from a directory and deserializes it into
//! [`WorkflowConfig`]. Falls back to defaults when the file is missing or
//! malformed.

use std::path::Path;

use stepwise_types::config::WorkflowConfig;

/// File name looked up by [`load_workflow_config`].
pub const CONFIG_FILE_NAME: &str = "workflow.toml";

/// Load engine configuration from `{dir}/workflow.toml`.
///
/// - Missing file: returns [`WorkflowConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
/// - Otherwise returns the parsed config; absent keys take their defaults.
pub async fn load_workflow_config(dir: &Path) -> WorkflowConfig {
    let config_path = dir.join(CONFIG_FILE_NAME);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE_NAME} found at {}, using defaults", config_path.display());
            return WorkflowConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return WorkflowConfig::default();
        }
    };

    match toml::from_str::<WorkflowConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            WorkflowConfig::default()
        }
    }
}
