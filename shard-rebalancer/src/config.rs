use std::time::Duration;

use crate::Error;

pub const DEFAULT_ROOT_PATH: &str = "/elastic-cluster";
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

const DEFAULT_REBALANCE_DELAY_MS: u64 = 1000;
const DEFAULT_REBALANCE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_READY_PROBE_TIMEOUT_MS: u64 = 100;

/// Construction-time settings of a cluster node, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub host: String,
    pub port: u16,
    /// Address of the coordination service.
    pub coordination_url: String,
    /// Prefix under which the party and gate paths live.
    pub root_path: String,
    /// Quiet period after a membership change before rebalancing.
    pub rebalance_delay: Duration,
    /// Upper bound for one rebalance attempt; exceeded attempts are retried.
    pub rebalance_timeout: Duration,
    /// Upper bound for the liveness probe in `ready()`.
    pub ready_probe_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            coordination_url: DEFAULT_REDIS_URL.to_string(),
            root_path: DEFAULT_ROOT_PATH.to_string(),
            rebalance_delay: Duration::from_millis(DEFAULT_REBALANCE_DELAY_MS),
            rebalance_timeout: Duration::from_millis(DEFAULT_REBALANCE_TIMEOUT_MS),
            ready_probe_timeout: Duration::from_millis(DEFAULT_READY_PROBE_TIMEOUT_MS),
        }
    }
}

impl ClusterConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Load settings from the environment, falling back to defaults.
    ///
    /// Recognised variables: `NODE_HOST`, `PORT`, `REDIS_URL`, `CLUSTER_ROOT`,
    /// `REBALANCE_DELAY_MS`, `REBALANCE_TIMEOUT_MS`, `READY_PROBE_TIMEOUT_MS`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, Error> {
        let defaults = Self::default();

        Ok(Self {
            host: std::env::var("NODE_HOST").unwrap_or(defaults.host),
            port: parse_env("PORT")?.unwrap_or(defaults.port),
            coordination_url: std::env::var("REDIS_URL").unwrap_or(defaults.coordination_url),
            root_path: std::env::var("CLUSTER_ROOT").unwrap_or(defaults.root_path),
            rebalance_delay: parse_env("REBALANCE_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.rebalance_delay),
            rebalance_timeout: parse_env("REBALANCE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.rebalance_timeout),
            ready_probe_timeout: parse_env("READY_PROBE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.ready_probe_timeout),
        })
    }

    pub fn with_coordination_url(mut self, url: impl Into<String>) -> Self {
        self.coordination_url = url.into();
        self
    }

    pub fn with_root_path(mut self, root_path: impl Into<String>) -> Self {
        self.root_path = root_path.into();
        self
    }

    pub fn with_rebalance_delay(mut self, delay: Duration) -> Self {
        self.rebalance_delay = delay;
        self
    }

    pub fn with_rebalance_timeout(mut self, timeout: Duration) -> Self {
        self.rebalance_timeout = timeout;
        self
    }

    pub fn with_ready_probe_timeout(mut self, timeout: Duration) -> Self {
        self.ready_probe_timeout = timeout;
        self
    }

    /// This node's identity in the membership group.
    pub fn node_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn party_path(&self) -> String {
        format!("{}/party", self.root_path)
    }

    /// Gate for the membership generation `generation`.
    ///
    /// Each generation gets its own gate so nodes that are rebalancing
    /// different membership states never share barrier slots.
    pub fn gate_path(&self, generation: u64) -> String {
        format!("{}/gate/{}", self.root_path, generation)
    }

    /// Check the settings for values that would stall rebalancing.
    pub fn validate(&self) -> Result<(), Error> {
        if self.host.is_empty() {
            return Err(Error::config("host must not be empty"));
        }
        if !self.root_path.starts_with('/') {
            return Err(Error::config(format!(
                "root path must be absolute, got '{}'",
                self.root_path
            )));
        }
        if self.rebalance_timeout.is_zero() {
            return Err(Error::config("rebalance timeout must be positive"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, Error> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::config(format!("{} has an invalid value: '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ClusterConfig::default();
        assert_eq!(config.rebalance_delay, Duration::from_secs(1));
        assert_eq!(config.rebalance_timeout, Duration::from_secs(5));
        assert_eq!(config.ready_probe_timeout, Duration::from_millis(100));
        assert_eq!(config.root_path, "/elastic-cluster");
    }

    #[test]
    fn test_paths_and_identity() {
        let config = ClusterConfig::new("node-a", 9000);
        assert_eq!(config.node_id(), "node-a:9000");
        assert_eq!(config.party_path(), "/elastic-cluster/party");
        assert_eq!(config.gate_path(7), "/elastic-cluster/gate/7");
    }

    #[test]
    fn test_validate_rejects_relative_root() {
        let config = ClusterConfig::default().with_root_path("cluster");
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(ClusterConfig::default().validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_from_env_reads_overrides() {
        std::env::set_var("NODE_HOST", "svc-3");
        std::env::set_var("PORT", "9100");
        std::env::set_var("REBALANCE_DELAY_MS", "250");

        let config = ClusterConfig::from_env().unwrap();

        std::env::remove_var("NODE_HOST");
        std::env::remove_var("PORT");
        std::env::remove_var("REBALANCE_DELAY_MS");

        assert_eq!(config.node_id(), "svc-3:9100");
        assert_eq!(config.rebalance_delay, Duration::from_millis(250));
        assert_eq!(config.rebalance_timeout, Duration::from_secs(5));
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        std::env::set_var("REBALANCE_TIMEOUT_MS", "soon");
        let result = ClusterConfig::from_env();
        std::env::remove_var("REBALANCE_TIMEOUT_MS");

        assert!(matches!(result, Err(Error::Config(_))));
    }
}
