//! Persistence interface for directory state

use crate::error::Result;
use crate::types::{OnionPath, Snode};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Identifies the last message seen from a node for an identity and namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LastHashKey {
    pub snode: Snode,
    pub public_key: String,
    pub namespace: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastHashRecord {
    pub hash: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl LastHashRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires_at| expires_at <= now)
    }
}

/// Storage backend for pool, swarms, paths and message bookkeeping.
///
/// Calls are synchronous and made from inside the serialized context, so
/// implementations should be quick.
pub trait SnodeStore: Send + Sync {
    fn load_pool(&self) -> Result<HashSet<Snode>>;

    fn save_pool(&self, pool: &HashSet<Snode>) -> Result<()>;

    fn last_pool_refresh(&self) -> Result<Option<DateTime<Utc>>>;

    fn set_last_pool_refresh(&self, at: DateTime<Utc>) -> Result<()>;

    fn load_swarm(&self, public_key: &str) -> Result<Option<HashSet<Snode>>>;

    fn save_swarm(&self, public_key: &str, swarm: &HashSet<Snode>) -> Result<()>;

    fn load_paths(&self) -> Result<Vec<OnionPath>>;

    /// Replaces the stored paths; an empty slice clears them.
    fn save_paths(&self, paths: &[OnionPath]) -> Result<()>;

    /// Most recent hash for `key` that hasn't expired at `now`.
    fn last_message_hash(&self, key: &LastHashKey, now: DateTime<Utc>) -> Result<Option<String>>;

    fn set_last_message_hash(&self, key: &LastHashKey, record: LastHashRecord) -> Result<()>;

    fn prune_expired_message_hashes(&self, key: &LastHashKey, now: DateTime<Utc>) -> Result<()>;

    fn received_message_hashes(&self, public_key: &str) -> Result<HashSet<String>>;

    fn insert_received_message_hashes(&self, public_key: &str, hashes: &[String]) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    pool: HashSet<Snode>,
    last_pool_refresh: Option<DateTime<Utc>>,
    swarms: HashMap<String, HashSet<Snode>>,
    paths: Vec<OnionPath>,
    last_hashes: HashMap<LastHashKey, LastHashRecord>,
    received: HashMap<String, HashSet<String>>,
}

/// In-memory store for tests and ephemeral clients.
#[derive(Debug, Clone, Default)]
pub struct MemorySnodeStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemorySnodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with a pool refreshed at `refreshed_at`.
    pub fn with_pool(pool: HashSet<Snode>, refreshed_at: Option<DateTime<Utc>>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.write();
            state.pool = pool;
            state.last_pool_refresh = refreshed_at;
        }
        store
    }
}

impl SnodeStore for MemorySnodeStore {
    fn load_pool(&self) -> Result<HashSet<Snode>> {
        Ok(self.state.read().pool.clone())
    }

    fn save_pool(&self, pool: &HashSet<Snode>) -> Result<()> {
        self.state.write().pool = pool.clone();
        Ok(())
    }

    fn last_pool_refresh(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.read().last_pool_refresh)
    }

    fn set_last_pool_refresh(&self, at: DateTime<Utc>) -> Result<()> {
        self.state.write().last_pool_refresh = Some(at);
        Ok(())
    }

    fn load_swarm(&self, public_key: &str) -> Result<Option<HashSet<Snode>>> {
        Ok(self.state.read().swarms.get(public_key).cloned())
    }

    fn save_swarm(&self, public_key: &str, swarm: &HashSet<Snode>) -> Result<()> {
        self.state
            .write()
            .swarms
            .insert(public_key.to_string(), swarm.clone());
        Ok(())
    }

    fn load_paths(&self) -> Result<Vec<OnionPath>> {
        Ok(self.state.read().paths.clone())
    }

    fn save_paths(&self, paths: &[OnionPath]) -> Result<()> {
        self.state.write().paths = paths.to_vec();
        Ok(())
    }

    fn last_message_hash(&self, key: &LastHashKey, now: DateTime<Utc>) -> Result<Option<String>> {
        Ok(self
            .state
            .read()
            .last_hashes
            .get(key)
            .filter(|record| !record.is_expired(now))
            .map(|record| record.hash.clone()))
    }

    fn set_last_message_hash(&self, key: &LastHashKey, record: LastHashRecord) -> Result<()> {
        self.state.write().last_hashes.insert(key.clone(), record);
        Ok(())
    }

    fn prune_expired_message_hashes(&self, key: &LastHashKey, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write();
        if state.last_hashes.get(key).map_or(false, |record| record.is_expired(now)) {
            state.last_hashes.remove(key);
        }
        Ok(())
    }

    fn received_message_hashes(&self, public_key: &str) -> Result<HashSet<String>> {
        Ok(self
            .state
            .read()
            .received
            .get(public_key)
            .cloned()
            .unwrap_or_default())
    }

    fn insert_received_message_hashes(&self, public_key: &str, hashes: &[String]) -> Result<()> {
        self.state
            .write()
            .received
            .entry(public_key.to_string())
            .or_default()
            .extend(hashes.iter().cloned());
        Ok(())
    }
}
