//! Node configuration for a fast-sync node.
//!
//! Provides [`NodeConfig`] with defaults for the chain id, logging and the
//! embedded [`SyncConfig`]. The configuration can be built programmatically
//! or deserialized by the embedding application.

use fastsync_network::SyncConfig;
use serde::{Deserialize, Serialize};

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Configuration for a node instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Chain the node follows; commits are signed over it.
    pub chain_id: String,
    /// Log level filter string (e.g. "info", "debug", "fastsync_network=trace").
    pub log_level: String,
    pub log_format: LogFormat,
    /// Block pool and reactor tunables.
    pub sync: SyncConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            chain_id: "fastsync-local".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            sync: SyncConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Same as the default but with the short timers of
    /// [`SyncConfig::testing`].
    pub fn testing() -> Self {
        Self {
            sync: SyncConfig::testing(),
            ..Self::default()
        }
    }
}
