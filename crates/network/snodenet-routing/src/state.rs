//! Directory state owned by the work queue.
//!
//! Every method here runs inside a queue job. Persistence failures are logged
//! and the in-memory state stays authoritative.

use crate::config::RouterConfig;
use crate::directory::parse_snodes;
use crate::error::{Result, RoutingError};
use crate::failure::{FailureCounter, FailureOutcome};
use crate::queue::SharedResult;
use crate::storage::SnodeStore;
use crate::types::{OnionPath, Snode};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Either a value available now or an in-flight operation to wait on.
pub(crate) enum Lookup<T, P = T> {
    Ready(T),
    Pending(SharedResult<P>),
}

pub(crate) struct NetworkState {
    pub(crate) pool: HashSet<Snode>,
    pub(crate) last_pool_refresh: Option<DateTime<Utc>>,
    swarms: HashMap<String, HashSet<Snode>>,
    loaded_swarms: HashSet<String>,
    pub(crate) paths: Vec<OnionPath>,
    /// Failures reported by storage servers, per node
    pub(crate) snode_failures: FailureCounter<Snode>,
    /// "Next node not found" reports from guards, per hop
    pub(crate) hop_failures: FailureCounter<Snode>,
    pub(crate) path_failures: FailureCounter<OnionPath>,
    pub(crate) pool_refresh: Option<SharedResult<HashSet<Snode>>>,
    pub(crate) path_build: Option<SharedResult<Vec<OnionPath>>>,
    /// Latest `(hardfork, softfork)` reported by storage servers
    pub(crate) fork_versions: Option<(i64, i64)>,
    store: Arc<dyn SnodeStore>,
}

impl NetworkState {
    /// Restores the pool, its refresh time and the active paths from `store`.
    pub(crate) fn load(store: Arc<dyn SnodeStore>, config: &RouterConfig) -> Self {
        let pool = store.load_pool().unwrap_or_else(|e| {
            warn!("Couldn't load snode pool: {}", e);
            HashSet::new()
        });
        let last_pool_refresh = store.last_pool_refresh().unwrap_or_else(|e| {
            warn!("Couldn't load last pool refresh date: {}", e);
            None
        });
        let paths = store.load_paths().unwrap_or_else(|e| {
            warn!("Couldn't load onion request paths: {}", e);
            Vec::new()
        });
        debug!("Loaded {} snodes and {} paths", pool.len(), paths.len());

        Self {
            pool,
            last_pool_refresh,
            swarms: HashMap::new(),
            loaded_swarms: HashSet::new(),
            paths,
            snode_failures: FailureCounter::new(config.snode_failure_threshold),
            hop_failures: FailureCounter::new(config.snode_failure_threshold),
            path_failures: FailureCounter::new(config.path_failure_threshold),
            pool_refresh: None,
            path_build: None,
            fork_versions: None,
            store,
        }
    }

    pub(crate) fn set_pool(&mut self, pool: HashSet<Snode>, refreshed_at: DateTime<Utc>) {
        if let Err(e) = self.store.save_pool(&pool) {
            warn!("Couldn't persist snode pool: {}", e);
        }
        if let Err(e) = self.store.set_last_pool_refresh(refreshed_at) {
            warn!("Couldn't persist pool refresh date: {}", e);
        }
        self.pool = pool;
        self.last_pool_refresh = Some(refreshed_at);
    }

    pub(crate) fn drop_snode_from_pool(&mut self, snode: &Snode) {
        if self.pool.remove(snode) {
            if let Err(e) = self.store.save_pool(&self.pool) {
                warn!("Couldn't persist snode pool: {}", e);
            }
            debug!("Snode pool count: {}", self.pool.len());
        }
    }

    /// Cached swarm, loading it from the store on first access.
    pub(crate) fn swarm(&mut self, public_key: &str) -> Option<HashSet<Snode>> {
        if !self.loaded_swarms.contains(public_key) {
            match self.store.load_swarm(public_key) {
                Ok(Some(swarm)) => {
                    self.swarms.insert(public_key.to_string(), swarm);
                }
                Ok(None) => {}
                Err(e) => warn!("Couldn't load swarm for {}: {}", public_key, e),
            }
            self.loaded_swarms.insert(public_key.to_string());
        }
        self.swarms.get(public_key).cloned()
    }

    pub(crate) fn set_swarm(&mut self, public_key: &str, swarm: HashSet<Snode>) {
        if let Err(e) = self.store.save_swarm(public_key, &swarm) {
            warn!("Couldn't persist swarm for {}: {}", public_key, e);
        }
        self.swarms.insert(public_key.to_string(), swarm);
        self.loaded_swarms.insert(public_key.to_string());
    }

    pub(crate) fn drop_snode_from_swarm(&mut self, snode: &Snode, public_key: &str) {
        if let Some(mut swarm) = self.swarm(public_key) {
            if swarm.remove(snode) {
                self.set_swarm(public_key, swarm);
            }
        }
    }

    /// Reacts to an error status returned by a storage server.
    ///
    /// Returns the error to surface instead of the raw HTTP failure, if any.
    pub(crate) fn handle_snode_error(
        &mut self,
        status_code: u16,
        body: Option<&[u8]>,
        snode: &Snode,
        public_key: Option<&str>,
    ) -> Option<RoutingError> {
        match status_code {
            404 => {
                debug!("Can't reach the server at {}", snode);
                None
            }
            406 => {
                warn!("The user's clock is out of sync with the service node network.");
                Some(RoutingError::ClockOutOfSync)
            }
            421 => {
                match public_key {
                    Some(public_key) => {
                        let snodes = body.map(parse_snodes).unwrap_or_default();
                        if snodes.is_empty() {
                            info!("Invalidating swarm for: {}", public_key);
                            self.drop_snode_from_swarm(snode, public_key);
                        } else {
                            self.set_swarm(public_key, snodes);
                        }
                    }
                    None => warn!("Got a 421 without an associated public key."),
                }
                None
            }
            500 | 502 | 503 => {
                self.record_bad_snode(snode, public_key);
                None
            }
            _ => {
                debug!("Unhandled response code: {}", status_code);
                self.record_bad_snode(snode, public_key);
                None
            }
        }
    }

    fn record_bad_snode(&mut self, snode: &Snode, public_key: Option<&str>) {
        match self.snode_failures.record_failure(snode.clone()) {
            FailureOutcome::Counted(count) => {
                debug!("Couldn't reach snode at: {}; setting failure count to {}", snode, count);
            }
            FailureOutcome::ThresholdReached => {
                info!("Failure threshold reached for: {}; dropping it", snode);
                if let Some(public_key) = public_key {
                    self.drop_snode_from_swarm(snode, public_key);
                }
                self.drop_snode_from_pool(snode);
            }
        }
    }

    /// Pool members that aren't part of any active path.
    pub(crate) fn unused_snodes(&self) -> Vec<Snode> {
        let used: HashSet<&Snode> = self.paths.iter().flat_map(|p| p.hops()).collect();
        self.pool.iter().filter(|s| !used.contains(s)).cloned().collect()
    }

    pub(crate) fn set_paths(&mut self, paths: Vec<OnionPath>) {
        self.paths = paths;
        self.persist_paths();
    }

    /// Removes `snode` from the pool and swaps it out of its path for an unused node.
    pub(crate) fn repair_path_snode(&mut self, snode: &Snode) -> Result<()> {
        self.drop_snode_from_pool(snode);

        let Some(index) = self.paths.iter().position(|p| p.contains(snode)) else {
            return Ok(());
        };
        let replacement = self
            .unused_snodes()
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(RoutingError::InsufficientSnodes)?;

        let path = &mut self.paths[index];
        path.replace(snode, replacement.clone());
        info!("Replaced {} with {} in {}", snode, replacement, path);
        self.persist_paths();
        Ok(())
    }

    /// Removes `path`. Shortfalls are rebuilt lazily.
    pub(crate) fn drop_path(&mut self, path: &OnionPath) {
        let before = self.paths.len();
        self.paths.retain(|p| p != path);
        if self.paths.len() == before {
            return;
        }
        self.path_failures.record_success(path);
        info!("Dropped path {}; {} remaining", path, self.paths.len());
        self.persist_paths();
    }

    fn persist_paths(&self) {
        if let Err(e) = self.store.save_paths(&self.paths) {
            warn!("Couldn't persist onion request paths: {}", e);
        }
    }

    pub(crate) fn record_fork_versions(&mut self, hardfork: i64, softfork: i64) {
        let updated = match self.fork_versions {
            None => Some((hardfork, softfork)),
            Some((hf, _)) if hardfork > hf => Some((hardfork, softfork)),
            Some((hf, sf)) if hardfork == hf && softfork > sf => Some((hf, softfork)),
            _ => None,
        };
        if let Some(versions) = updated {
            debug!("Storage servers report hardfork {}.{}", versions.0, versions.1);
            self.fork_versions = Some(versions);
        }
    }
}
