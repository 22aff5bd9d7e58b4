//! Daemon configuration loaded from environment variables.
//!
//! Engine settings live in [`NodeConfig`]; this adds what only the binary
//! needs. All settings have defaults so the daemon can start with zero
//! configuration for local development.

use std::path::PathBuf;
use std::time::Duration;

use veil_core::NodeConfig;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Engine settings (`VEIL_SYNC_INTERVAL_SECS`, `VEIL_CONTACT_LISTEN`, ...).
    pub node: NodeConfig,

    /// Directory attachments are stored in.
    /// Env: `VEIL_BLOB_PATH`
    /// Default: `./blobs`
    pub blob_path: PathBuf,

    /// File holding the contact identity, created on first start.
    /// Env: `VEIL_IDENTITY_PATH`
    /// Default: none (a fresh contact identity every run).
    pub identity_path: Option<PathBuf>,

    /// Deadline for establishing an outbound connection.
    /// Env: `VEIL_CONNECT_TIMEOUT_SECS`
    /// Default: `30`
    pub connect_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            blob_path: PathBuf::from("./blobs"),
            identity_path: None,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self {
            node: NodeConfig::from_lookup(&lookup),
            ..Self::default()
        };

        if let Some(path) = lookup("VEIL_BLOB_PATH") {
            if path.trim().is_empty() {
                tracing::warn!("Empty VEIL_BLOB_PATH, using default");
            } else {
                config.blob_path = PathBuf::from(path);
            }
        }

        if let Some(path) = lookup("VEIL_IDENTITY_PATH") {
            if !path.trim().is_empty() {
                config.identity_path = Some(PathBuf::from(path));
            }
        }

        if let Some(raw) = lookup("VEIL_CONNECT_TIMEOUT_SECS") {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.connect_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %raw, "Invalid VEIL_CONNECT_TIMEOUT_SECS, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}
