//! Engine configuration loader.
//!
//! Reads `journalflow.toml` from the application data directory and
//! deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use journalflow_types::config::EngineConfig;

/// File name looked up inside the data directory.
pub const CONFIG_FILE_NAME: &str = "journalflow.toml";

/// Load engine configuration from `{data_dir}/journalflow.toml`.
///
/// - Missing file: returns [`EngineConfig::default()`].
/// - Unreadable or unparseable file: logs a warning and returns the default.
/// - A relative `definitions_dir` is resolved against `data_dir`.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE_NAME);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE_NAME} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    let mut config = match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            return EngineConfig::default();
        }
    };

    if let Some(dir) = config.definitions_dir.take() {
        config.definitions_dir = Some(if dir.is_relative() {
            data_dir.join(dir)
        } else {
            dir
        });
    }
    config
}
