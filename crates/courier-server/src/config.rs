//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use courier_shared::constants::{
    CALL_END_GRACE_MS, CALL_RING_TIMEOUT_SECS, DEFAULT_HTTP_PORT, DEFAULT_PAGE_LIMIT,
    MAX_PAGE_LIMIT,
};

/// What happens when a user authenticates while already online elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPolicy {
    /// The newer connection wins; the older one is told and closed.
    Evict,
    /// The newer connection is refused.
    Reject,
}

impl FromStr for SessionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "evict" => Ok(SessionPolicy::Evict),
            "reject" => Ok(SessionPolicy::Reject),
            other => Err(format!("unknown session policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Env: `INSTANCE_NAME`
    /// Default: `"Courier Node"`
    pub instance_name: String,

    /// How long a call may ring before both sides get `timeout`.
    /// Env: `CALL_RING_TIMEOUT_SECS`
    pub ring_timeout: Duration,

    /// How long an ended call lingers before its slot is freed.
    /// Env: `CALL_END_GRACE_MS`
    pub end_grace: Duration,

    /// Env: `HISTORY_MAX_PAGE`
    pub history_max_page: u32,

    /// Env: `HISTORY_DEFAULT_PAGE`
    pub history_default_page: u32,

    /// Events buffered per connection before it is considered too slow and
    /// dropped.
    /// Env: `OUTBOUND_QUEUE_CAPACITY`
    pub outbound_queue_capacity: usize,

    /// Inbound events per second allowed on one socket.
    /// Env: `EVENTS_PER_SEC`
    pub events_per_sec: f64,

    /// Env: `EVENT_BURST`
    pub event_burst: f64,

    /// Env: `SESSION_POLICY` (evict/reject)
    pub session_policy: SessionPolicy,

    /// Accept sockets without a known session token and trust the
    /// `authenticate` payload. Development only.
    /// Env: `ALLOW_UNVERIFIED_AUTH` (true/false)
    /// Default: `false`
    pub allow_unverified_auth: bool,

    /// JSON fixture of users, conversations and session tokens.
    /// Env: `SEED_PATH`
    pub seed_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            instance_name: "Courier Node".to_string(),
            ring_timeout: Duration::from_secs(CALL_RING_TIMEOUT_SECS),
            end_grace: Duration::from_millis(CALL_END_GRACE_MS),
            history_max_page: MAX_PAGE_LIMIT,
            history_default_page: DEFAULT_PAGE_LIMIT,
            outbound_queue_capacity: 256,
            events_per_sec: 20.0,
            event_burst: 60.0,
            session_policy: SessionPolicy::Evict,
            allow_unverified_auth: false,
            seed_path: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = get("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(name) = get("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(secs) = parse_var::<u64>(&get, "CALL_RING_TIMEOUT_SECS") {
            config.ring_timeout = Duration::from_secs(secs);
        }

        if let Some(ms) = parse_var::<u64>(&get, "CALL_END_GRACE_MS") {
            config.end_grace = Duration::from_millis(ms);
        }

        if let Some(n) = parse_var::<u32>(&get, "HISTORY_MAX_PAGE") {
            config.history_max_page = n.max(1);
        }

        if let Some(n) = parse_var::<u32>(&get, "HISTORY_DEFAULT_PAGE") {
            config.history_default_page = n.max(1);
        }
        config.history_default_page = config.history_default_page.min(config.history_max_page);

        if let Some(n) = parse_var::<usize>(&get, "OUTBOUND_QUEUE_CAPACITY") {
            config.outbound_queue_capacity = n.max(1);
        }

        if let Some(rate) = parse_var::<f64>(&get, "EVENTS_PER_SEC") {
            config.events_per_sec = rate;
        }

        if let Some(burst) = parse_var::<f64>(&get, "EVENT_BURST") {
            config.event_burst = burst;
        }

        if let Some(policy) = parse_var::<SessionPolicy>(&get, "SESSION_POLICY") {
            config.session_policy = policy;
        }

        if let Some(val) = get("ALLOW_UNVERIFIED_AUTH") {
            config.allow_unverified_auth = val == "true" || val == "1";
        }

        if let Some(path) = get("SEED_PATH") {
            if !path.is_empty() {
                config.seed_path = Some(PathBuf::from(path));
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

fn parse_var<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = get(key)?;
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

    fn from_map(vars: &[(&str, &str)]) -> ServerConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.ring_timeout, Duration::from_secs(45));
        assert_eq!(config.end_grace, Duration::from_secs(3));
        assert_eq!(config.history_max_page, 100);
        assert_eq!(config.session_policy, SessionPolicy::Evict);
        assert!(!config.allow_unverified_auth);
    }

    #[test]
    fn test_overrides() {
        let config = from_map(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("CALL_RING_TIMEOUT_SECS", "10"),
            ("SESSION_POLICY", "Reject"),
            ("ALLOW_UNVERIFIED_AUTH", "true"),
            ("SEED_PATH", "/tmp/seed.json"),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.ring_timeout, Duration::from_secs(10));
        assert_eq!(config.session_policy, SessionPolicy::Reject);
        assert!(config.allow_unverified_auth);
        assert_eq!(config.seed_path, Some(PathBuf::from("/tmp/seed.json")));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_map(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("HISTORY_MAX_PAGE", "lots"),
            ("SESSION_POLICY", "both"),
        ]);
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.history_max_page, 100);
        assert_eq!(config.session_policy, SessionPolicy::Evict);
    }

    #[test]
    fn test_default_page_never_exceeds_max() {
        let config = from_map(&[("HISTORY_MAX_PAGE", "20")]);
        assert_eq!(config.history_default_page, 20);
    }
}
