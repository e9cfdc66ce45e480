//! Router configuration

use crate::error::{Result, RoutingError};
use crate::types::SnodeVersion;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for the directory, path builder and request dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Seed node base URLs used to bootstrap the pool
    pub seed_nodes: Vec<String>,

    /// Smallest pool that can be refreshed by querying its own members
    pub min_pool_size: usize,

    /// How long a refreshed pool stays fresh
    pub pool_refresh_interval: Duration,

    /// Number of pool members asked for their view of the network
    pub pool_query_count: usize,

    /// The intersection of their answers must be strictly larger than this
    pub min_pool_agreement: usize,

    /// Upper bound on the accepted pool
    pub max_pool_size: usize,

    /// A cached swarm smaller than this is looked up again
    pub min_swarm_size: usize,

    /// Swarm members a message is stored on
    pub target_swarm_snode_count: usize,

    /// Hops per path, guard included
    pub path_size: usize,

    pub target_path_count: usize,

    pub snode_failure_threshold: u32,

    pub path_failure_threshold: u32,

    /// Retries after the first attempt for directory queries
    pub directory_retry_count: usize,

    /// Retries after the first attempt for message delivery
    pub message_retry_count: usize,

    /// Initial delay between retries, doubled per attempt
    pub retry_backoff: Duration,

    pub max_retry_backoff: Duration,

    /// Timeout of the guard liveness probe
    pub probe_timeout: Duration,

    /// Delay before probing another guard candidate
    pub guard_retry_delay: Duration,

    /// Oldest storage server version accepted as a guard
    pub min_snode_version: String,

    /// When false, storage RPCs go straight to the node
    pub use_onion_requests: bool,

    /// Size limit of the destination server; onions above 75% of it are logged
    pub max_request_size: usize,

    /// Nodes asked to resolve a name; all answers must match
    pub ons_validation_count: usize,
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: RouterConfig =
            toml::from_str(source).map_err(|e| RoutingError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RoutingError::InvalidConfig(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.seed_nodes.is_empty() {
            return Err(RoutingError::InvalidConfig("no seed nodes configured".into()));
        }
        if self.path_size == 0 || self.target_path_count == 0 {
            return Err(RoutingError::InvalidConfig("paths need at least one hop".into()));
        }
        if self.snode_failure_threshold == 0 || self.path_failure_threshold == 0 {
            return Err(RoutingError::InvalidConfig("failure thresholds must be positive".into()));
        }
        if self.pool_query_count == 0 || self.ons_validation_count == 0 {
            return Err(RoutingError::InvalidConfig("query counts must be positive".into()));
        }
        if self.max_pool_size <= self.min_pool_agreement {
            return Err(RoutingError::InvalidConfig(format!(
                "max_pool_size ({}) must exceed min_pool_agreement ({})",
                self.max_pool_size, self.min_pool_agreement
            )));
        }
        self.min_snode_version()
            .map_err(|_| RoutingError::InvalidConfig(format!("bad version {}", self.min_snode_version)))?;
        Ok(())
    }

    pub fn min_snode_version(&self) -> Result<SnodeVersion> {
        SnodeVersion::parse(&self.min_snode_version)
    }

    pub fn with_seed_nodes(mut self, seed_nodes: Vec<String>) -> Self {
        self.seed_nodes = seed_nodes;
        self
    }

    pub fn with_min_pool_size(mut self, size: usize) -> Self {
        self.min_pool_size = size;
        self
    }

    pub fn with_pool_refresh_interval(mut self, interval: Duration) -> Self {
        self.pool_refresh_interval = interval;
        self
    }

    pub fn with_path_size(mut self, hops: usize) -> Self {
        self.path_size = hops;
        self
    }

    pub fn with_target_path_count(mut self, count: usize) -> Self {
        self.target_path_count = count;
        self
    }

    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_backoff = initial;
        self.max_retry_backoff = max;
        self
    }

    pub fn with_guard_retry_delay(mut self, delay: Duration) -> Self {
        self.guard_retry_delay = delay;
        self
    }

    pub fn with_min_snode_version(mut self, version: impl Into<String>) -> Self {
        self.min_snode_version = version.into();
        self
    }

    pub fn with_onion_requests(mut self, enabled: bool) -> Self {
        self.use_onion_requests = enabled;
        self
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            seed_nodes: vec![
                "https://storage.seed1.loki.network:4433".to_string(),
                "https://storage.seed3.loki.network:4433".to_string(),
                "https://public.loki.foundation:4433".to_string(),
            ],
            min_pool_size: 12,
            pool_refresh_interval: Duration::from_secs(2 * 60 * 60),
            pool_query_count: 3,
            min_pool_agreement: 24,
            max_pool_size: 256,
            min_swarm_size: 3,
            target_swarm_snode_count: 2,
            path_size: 3,
            target_path_count: 2,
            snode_failure_threshold: 3,
            path_failure_threshold: 3,
            directory_retry_count: 4,
            message_retry_count: 8,
            retry_backoff: Duration::from_millis(250),
            max_retry_backoff: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            guard_retry_delay: Duration::from_millis(100),
            min_snode_version: "2.0.7".to_string(),
            use_onion_requests: true,
            max_request_size: 10_000_000,
            ons_validation_count: 3,
        }
    }
}
