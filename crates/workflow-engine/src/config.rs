//! Engine configuration
//!
//! Timeouts, graph-size guards and the snapshot compression level. Stored
//! as JSON; every field falls back to its default when absent.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::constants::defaults;
use crate::error::{EngineError, Result};

/// Tunables shared by the builder and every run of an engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-node timeout when the node's retry policy declares none
    #[serde(default = "default_node_timeout_ms")]
    pub default_node_timeout_ms: u64,
    /// Bounded wait on a streaming queue before the producer counts as stalled
    #[serde(default = "default_stream_queue_timeout_ms")]
    pub stream_queue_timeout_ms: u64,
    /// How long an interactive node waits for an external answer
    #[serde(default = "default_interactive_answer_timeout_ms")]
    pub interactive_answer_timeout_ms: u64,
    /// Upper bound on nodes in one workflow
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
    /// Upper bound on enumerated chains
    #[serde(default = "default_max_chains")]
    pub max_chains: usize,
    /// zstd level for engine snapshots
    #[serde(default = "default_cache_compression_level")]
    pub cache_compression_level: i32,
}

fn default_node_timeout_ms() -> u64 {
    defaults::NODE_TIMEOUT_MS
}

fn default_stream_queue_timeout_ms() -> u64 {
    defaults::STREAM_QUEUE_TIMEOUT_MS
}

fn default_interactive_answer_timeout_ms() -> u64 {
    defaults::INTERACTIVE_ANSWER_TIMEOUT_MS
}

fn default_max_nodes() -> usize {
    defaults::MAX_NODES
}

fn default_max_chains() -> usize {
    defaults::MAX_CHAINS
}

fn default_cache_compression_level() -> i32 {
    defaults::CACHE_COMPRESSION_LEVEL
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_node_timeout_ms: default_node_timeout_ms(),
            stream_queue_timeout_ms: default_stream_queue_timeout_ms(),
            interactive_answer_timeout_ms: default_interactive_answer_timeout_ms(),
            max_nodes: default_max_nodes(),
            max_chains: default_max_chains(),
            cache_compression_level: default_cache_compression_level(),
        }
    }
}

impl EngineConfig {
    pub fn default_node_timeout(&self) -> Duration {
        Duration::from_millis(self.default_node_timeout_ms)
    }

    pub fn stream_queue_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_queue_timeout_ms)
    }

    pub fn interactive_answer_timeout(&self) -> Duration {
        Duration::from_millis(self.interactive_answer_timeout_ms)
    }

    /// Load configuration from a JSON file; a missing file yields defaults
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !fs::try_exists(path).await? {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).await?;
        serde_json::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration as pretty JSON, creating parent directories
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Config(e.to_string()))?;
        fs::write(path, contents).await?;

        log::info!("Engine configuration saved to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path().join("engine.json"))
            .await
            .unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.default_node_timeout(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.json");
        let config = EngineConfig {
            stream_queue_timeout_ms: 250,
            max_nodes: 12,
            ..EngineConfig::default()
        };
        config.save(&path).await.unwrap();

        let loaded = EngineConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        tokio::fs::write(&path, r#"{"max_nodes": 5}"#).await.unwrap();

        let loaded = EngineConfig::load(&path).await.unwrap();
        assert_eq!(loaded.max_nodes, 5);
        assert_eq!(loaded.cache_compression_level, defaults::CACHE_COMPRESSION_LEVEL);
    }

    #[tokio::test]
    async fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let err = EngineConfig::load(&path).await.unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
