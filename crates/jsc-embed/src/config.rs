//! Configuration for embedding contexts.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{EmbedError, EmbedResult};

/// Tuning knobs for a context (or a context group) and its engine thread.
///
/// Can be built in code or loaded from JSON; missing fields take their
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EmbedConfig {
    /// Pending unprotects tolerated before a background drain.
    /// Default: 100
    pub release_threshold: usize,

    /// Idle time after which the engine thread runs its background tick.
    /// Default: 10ms
    pub tick_interval_ms: u64,

    /// Name given to the engine thread.
    /// Default: "jsc-embed-worker"
    pub thread_name: String,

    /// Initial capacity of the identity cache.
    /// Default: 64
    pub initial_cache_capacity: usize,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            release_threshold: 100,
            tick_interval_ms: 10,
            thread_name: "jsc-embed-worker".to_string(),
            initial_cache_capacity: 64,
        }
    }
}

impl EmbedConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config from a JSON document.
    pub fn from_json_str(json: &str) -> EmbedResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a config from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> EmbedResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            EmbedError::internal(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Set the release queue threshold (minimum 1).
    pub fn release_threshold(mut self, threshold: usize) -> Self {
        self.release_threshold = threshold.max(1);
        self
    }

    /// Set the background tick interval.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = (interval.as_millis() as u64).max(1);
        self
    }

    /// Set the engine thread name.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Set the initial identity cache capacity.
    pub fn initial_cache_capacity(mut self, capacity: usize) -> Self {
        self.initial_cache_capacity = capacity;
        self
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EmbedConfig::default();
        assert_eq!(config.release_threshold, 100);
        assert_eq!(config.tick_duration(), Duration::from_millis(10));
        assert_eq!(config.thread_name, "jsc-embed-worker");
    }

    #[test]
    fn test_builder_min_values() {
        let config = EmbedConfig::new()
            .release_threshold(0)
            .tick_interval(Duration::ZERO);
        assert_eq!(config.release_threshold, 1);
        assert_eq!(config.tick_interval_ms, 1);
    }

    #[test]
    fn test_from_json_partial() {
        let config = EmbedConfig::from_json_str(r#"{ "releaseThreshold": 8, "threadName": "js" }"#)
            .unwrap();
        assert_eq!(config.release_threshold, 8);
        assert_eq!(config.thread_name, "js");
        assert_eq!(config.tick_interval_ms, 10);
    }

    #[test]
    fn test_from_json_invalid() {
        let err = EmbedConfig::from_json_str("{ releaseThreshold: }").unwrap_err();
        assert_eq!(err.error_type(), "ConfigError");
    }
}
