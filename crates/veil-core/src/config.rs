//! Engine configuration loaded from environment variables.
//!
//! Every setting has a default so a node can start with zero configuration.

use std::net::SocketAddr;
use std::time::Duration;

use veil_shared::constants::{
    CONTACT_PORT, CONVERSATION_PORT, DEFAULT_IO_TIMEOUT_SECS, DEFAULT_MAX_BACKOFF_SECS,
    DEFAULT_SYNC_INTERVAL_SECS, MAX_ATTACHMENT_SIZE,
};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Pause between two sync ticks of a peer worker.
    /// Env: `VEIL_SYNC_INTERVAL_SECS`
    /// Default: `15`
    pub sync_interval: Duration,

    /// Ceiling of the failure backoff of a peer worker.
    /// Env: `VEIL_MAX_BACKOFF_SECS`
    /// Default: `300`
    pub max_backoff: Duration,

    /// Deadline for one dial, handshake or sync session.
    /// Env: `VEIL_IO_TIMEOUT_SECS`
    /// Default: `60`
    pub io_timeout: Duration,

    /// Local socket of the contact listener.
    /// Env: `VEIL_CONTACT_LISTEN`
    /// Default: `127.0.0.1:0`
    pub contact_listen: SocketAddr,

    /// Local socket of the conversation listener shared by all rooms.
    /// Env: `VEIL_CONVERSATION_LISTEN`
    /// Default: `127.0.0.1:0`
    pub conversation_listen: SocketAddr,

    /// Public port contact identities are published on.
    pub contact_port: u16,

    /// Public port room identities are published on.
    pub conversation_port: u16,

    /// Largest attachment accepted from a peer, in bytes.
    /// Env: `VEIL_MAX_ATTACHMENT_MB`
    /// Default: `50`
    pub max_attachment_size: u64,

    /// Accept incoming room requests without asking.
    /// Env: `VEIL_AUTO_ACCEPT` (true/false)
    /// Default: `false`
    pub auto_accept: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
            io_timeout: Duration::from_secs(DEFAULT_IO_TIMEOUT_SECS),
            contact_listen: ([127, 0, 0, 1], 0).into(),
            conversation_listen: ([127, 0, 0, 1], 0).into(),
            contact_port: CONTACT_PORT,
            conversation_port: CONVERSATION_PORT,
            max_attachment_size: MAX_ATTACHMENT_SIZE,
            auto_accept: false,
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64, _>(&lookup, "VEIL_SYNC_INTERVAL_SECS") {
            if secs > 0 {
                config.sync_interval = Duration::from_secs(secs);
            } else {
                tracing::warn!("VEIL_SYNC_INTERVAL_SECS must be positive, using default");
            }
        }

        if let Some(secs) = parse_var::<u64, _>(&lookup, "VEIL_MAX_BACKOFF_SECS") {
            config.max_backoff = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_var::<u64, _>(&lookup, "VEIL_IO_TIMEOUT_SECS") {
            if secs > 0 {
                config.io_timeout = Duration::from_secs(secs);
            } else {
                tracing::warn!("VEIL_IO_TIMEOUT_SECS must be positive, using default");
            }
        }

        if let Some(addr) = parse_var::<SocketAddr, _>(&lookup, "VEIL_CONTACT_LISTEN") {
            config.contact_listen = addr;
        }

        if let Some(addr) = parse_var::<SocketAddr, _>(&lookup, "VEIL_CONVERSATION_LISTEN") {
            config.conversation_listen = addr;
        }

        if let Some(mb) = parse_var::<u64, _>(&lookup, "VEIL_MAX_ATTACHMENT_MB") {
            config.max_attachment_size = mb.saturating_mul(1024 * 1024);
        }

        if let Some(flag) = parse_var::<bool, _>(&lookup, "VEIL_AUTO_ACCEPT") {
            config.auto_accept = flag;
        }

        if config.max_backoff < config.sync_interval {
            tracing::warn!(
                max_backoff = ?config.max_backoff,
                sync_interval = ?config.sync_interval,
                "Backoff ceiling below sync interval, raising it"
            );
            config.max_backoff = config.sync_interval;
        }

        config
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> NodeConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]);
        assert_eq!(config.sync_interval, Duration::from_secs(15));
        assert_eq!(config.max_backoff, Duration::from_secs(300));
        assert_eq!(config.io_timeout, Duration::from_secs(60));
        assert_eq!(config.contact_port, CONTACT_PORT);
        assert_eq!(config.max_attachment_size, 50 * 1024 * 1024);
        assert!(!config.auto_accept);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("VEIL_SYNC_INTERVAL_SECS", "2"),
            ("VEIL_MAX_BACKOFF_SECS", "30"),
            ("VEIL_CONVERSATION_LISTEN", "127.0.0.1:7000"),
            ("VEIL_MAX_ATTACHMENT_MB", "1"),
            ("VEIL_AUTO_ACCEPT", "true"),
        ]);
        assert_eq!(config.sync_interval, Duration::from_secs(2));
        assert_eq!(config.max_backoff, Duration::from_secs(30));
        assert_eq!(config.conversation_listen.port(), 7000);
        assert_eq!(config.max_attachment_size, 1024 * 1024);
        assert!(config.auto_accept);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = load(&[
            ("VEIL_SYNC_INTERVAL_SECS", "0"),
            ("VEIL_IO_TIMEOUT_SECS", "soon"),
            ("VEIL_CONTACT_LISTEN", "not-an-addr"),
        ]);
        assert_eq!(config.sync_interval, Duration::from_secs(15));
        assert_eq!(config.io_timeout, Duration::from_secs(60));
        assert_eq!(config.contact_listen.port(), 0);
    }

    #[test]
    fn test_backoff_never_below_interval() {
        let config = load(&[
            ("VEIL_SYNC_INTERVAL_SECS", "60"),
            ("VEIL_MAX_BACKOFF_SECS", "10"),
        ]);
        assert_eq!(config.max_backoff, Duration::from_secs(60));
    }
}
