//! Engine configuration types for journalflow.
//!
//! `EngineConfig` represents the `journalflow.toml` that tunes wait
//! defaults, retry backoff, runaway guards, and definition loading.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `{data_dir}/journalflow.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Duration used by Wait steps that carry no `duration` parameter.
    #[serde(default = "default_wait_ms")]
    pub default_wait_ms: u64,

    /// Base of the exponential retry backoff: `base * 2^attempt` milliseconds.
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,

    /// Maximum nesting of SubWorkflow launches.
    #[serde(default = "default_max_sub_workflow_depth")]
    pub max_sub_workflow_depth: u32,

    /// Steps an instance may execute before it is failed as a runaway.
    #[serde(default = "default_max_steps_per_instance")]
    pub max_steps_per_instance: u64,

    /// Reject definitions whose non-End steps lead nowhere (including Decision
    /// steps with fewer than two branches). Unreachable steps are only linted.
    #[serde(default)]
    pub strict_termination: bool,

    /// Capacity of the instance event broadcast channel.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Directory scanned for `*.yaml` / `*.yml` definitions at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definitions_dir: Option<PathBuf>,
}

fn default_wait_ms() -> u64 {
    1000
}

fn default_retry_backoff_base_ms() -> u64 {
    1000
}

fn default_max_sub_workflow_depth() -> u32 {
    5
}

fn default_max_steps_per_instance() -> u64 {
    10_000
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_wait_ms: default_wait_ms(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            max_sub_workflow_depth: default_max_sub_workflow_depth(),
            max_steps_per_instance: default_max_steps_per_instance(),
            strict_termination: false,
            event_bus_capacity: default_event_bus_capacity(),
            definitions_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.default_wait_ms, 1000);
        assert_eq!(config.retry_backoff_base_ms, 1000);
        assert_eq!(config.max_sub_workflow_depth, 5);
        assert_eq!(config.max_steps_per_instance, 10_000);
        assert!(!config.strict_termination);
        assert_eq!(config.event_bus_capacity, 1024);
        assert!(config.definitions_dir.is_none());
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.default_wait_ms, 1000);
        assert_eq!(config.max_steps_per_instance, 10_000);
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
default_wait_ms = 250
retry_backoff_base_ms = 10
max_sub_workflow_depth = 2
strict_termination = true
definitions_dir = "/tmp/workflows"
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.default_wait_ms, 250);
        assert_eq!(config.retry_backoff_base_ms, 10);
        assert_eq!(config.max_sub_workflow_depth, 2);
        assert!(config.strict_termination);
        assert_eq!(config.event_bus_capacity, 1024);
        assert_eq!(
            config.definitions_dir.as_deref(),
            Some(std::path::Path::new("/tmp/workflows"))
        );
    }
}
