//! Snode pool and swarm maintenance.
//!
//! The pool is refreshed either from the seed nodes or, once it is large
//! enough, by asking several pool members for their view and keeping only
//! the nodes they all agree on.

use crate::api;
use crate::error::{Result, RoutingError};
use crate::network::Core;
use crate::queue::SharedResult;
use crate::retry::{self, RetryPolicy};
use crate::state::{Lookup, NetworkState};
use crate::transport::HttpRequest;
use crate::types::{Snode, SnodeEndpoint};
use chrono::Utc;
use futures::future::{try_join_all, FutureExt};
use rand::seq::{IteratorRandom, SliceRandom};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Discovery fields requested for every node.
fn pool_fields() -> Value {
    json!({
        "public_ip": true,
        "storage_port": true,
        "pubkey_ed25519": true,
        "pubkey_x25519": true,
    })
}

/// Authoritative view of the snode pool and per-identity swarms.
#[derive(Clone)]
pub struct SnodeDirectory {
    core: Arc<Core>,
}

impl SnodeDirectory {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    /// Returns the pool, refreshing it first if it is too small or stale.
    ///
    /// Concurrent callers share a single refresh.
    pub async fn get_pool(&self) -> Result<HashSet<Snode>> {
        get_pool(&self.core).await
    }

    /// Returns the swarm for `public_key`, querying the network if the cached one is too small.
    pub async fn get_swarm(&self, public_key: &str) -> Result<HashSet<Snode>> {
        get_swarm(&self.core, public_key).await
    }

    /// Random distinct swarm members used for write fan-out.
    pub async fn get_target_snodes(&self, public_key: &str) -> Result<Vec<Snode>> {
        get_target_snodes(&self.core, public_key).await
    }

    pub async fn drop_from_pool(&self, snode: &Snode) -> Result<()> {
        let snode = snode.clone();
        self.core
            .queue
            .run(move |state| state.drop_snode_from_pool(&snode))
            .await
    }

    pub async fn drop_from_swarm(&self, snode: &Snode, public_key: &str) -> Result<()> {
        let snode = snode.clone();
        let public_key = public_key.to_string();
        self.core
            .queue
            .run(move |state| state.drop_snode_from_swarm(&snode, &public_key))
            .await
    }

    /// Classifies a storage server error and updates pool, swarm and counters.
    ///
    /// Returns the error the caller should surface instead of the raw failure, if any.
    pub async fn handle_error(
        &self,
        status_code: u16,
        body: Option<&[u8]>,
        snode: &Snode,
        public_key: Option<&str>,
    ) -> Result<Option<RoutingError>> {
        handle_error(&self.core, status_code, body.map(<[u8]>::to_vec), snode, public_key).await
    }

    /// Swarm cached for `public_key`, without touching the network.
    pub async fn cached_swarm(&self, public_key: &str) -> Result<Option<HashSet<Snode>>> {
        let public_key = public_key.to_string();
        self.core.queue.run(move |state| state.swarm(&public_key)).await
    }

    /// `(hardfork, softfork)` most recently reported by a storage server.
    pub async fn fork_versions(&self) -> Result<Option<(i64, i64)>> {
        self.core.queue.run(|state| state.fork_versions).await
    }
}

pub(crate) async fn handle_error(
    core: &Arc<Core>,
    status_code: u16,
    body: Option<Vec<u8>>,
    snode: &Snode,
    public_key: Option<&str>,
) -> Result<Option<RoutingError>> {
    let snode = snode.clone();
    let public_key = public_key.map(str::to_string);
    core.queue
        .run(move |state| {
            state.handle_snode_error(status_code, body.as_deref(), &snode, public_key.as_deref())
        })
        .await
}

pub(crate) async fn get_pool(core: &Arc<Core>) -> Result<HashSet<Snode>> {
    let job_core = core.clone();
    let lookup = core
        .queue
        .run(move |state| {
            if is_pool_fresh(&job_core, state) {
                Lookup::Ready(state.pool.clone())
            } else {
                Lookup::Pending(pending_pool_refresh(&job_core, state))
            }
        })
        .await?;

    match lookup {
        Lookup::Ready(pool) => Ok(pool),
        Lookup::Pending(refresh) => refresh.await,
    }
}

fn is_pool_fresh(core: &Core, state: &NetworkState) -> bool {
    if state.pool.len() < core.config.min_pool_size {
        return false;
    }
    let Some(refreshed_at) = state.last_pool_refresh else {
        return false;
    };
    match (Utc::now() - refreshed_at).to_std() {
        Ok(age) => age < core.config.pool_refresh_interval,
        // Refresh time in the future; treat it as fresh.
        Err(_) => true,
    }
}

/// Attaches to the in-flight refresh, starting one if none is running.
fn pending_pool_refresh(core: &Arc<Core>, state: &mut NetworkState) -> SharedResult<HashSet<Snode>> {
    if let Some(pending) = &state.pool_refresh {
        return pending.clone();
    }
    let pending = spawn_pool_refresh(core.clone(), state.pool.clone());
    state.pool_refresh = Some(pending.clone());
    pending
}

fn spawn_pool_refresh(core: Arc<Core>, current: HashSet<Snode>) -> SharedResult<HashSet<Snode>> {
    let handle = tokio::spawn(async move {
        let result = refresh_pool(&core, current).await;
        let settled = result.clone();
        let applied = core
            .queue
            .run(move |state| {
                if let Ok(pool) = settled {
                    state.set_pool(pool, Utc::now());
                }
                state.pool_refresh = None;
            })
            .await;
        applied.and(result)
    });

    async move {
        handle
            .await
            .map_err(|e| RoutingError::Internal(format!("pool refresh task: {}", e)))?
    }
    .boxed()
    .shared()
}

async fn refresh_pool(core: &Arc<Core>, current: HashSet<Snode>) -> Result<HashSet<Snode>> {
    let pool = if current.len() < core.config.min_pool_size {
        info!("Populating snode pool using seed nodes");
        fetch_pool_from_seed(core).await?
    } else {
        info!("Populating snode pool using random snodes");
        match fetch_pool_from_snodes(core, &current).await {
            Ok(pool) => pool,
            Err(e) => {
                warn!("Couldn't update snode pool from snodes: {}; falling back to seed nodes", e);
                fetch_pool_from_seed(core).await?
            }
        }
    };

    if pool.is_empty() {
        return Err(RoutingError::SnodePoolUpdatingFailed);
    }
    info!("Got snode pool of size: {}", pool.len());
    Ok(pool)
}

/// Bootstraps the pool from a random seed node, picking a new seed per attempt.
pub(crate) async fn fetch_pool_from_seed(core: &Arc<Core>) -> Result<HashSet<Snode>> {
    let body = serde_json::to_vec(&json!({
        "method": "get_n_service_nodes",
        "params": {
            "active_only": true,
            "limit": core.config.max_pool_size,
            "fields": pool_fields(),
        },
    }))?;

    retry::attempt(RetryPolicy::directory(&core.config), move || {
        let body = body.clone();
        async move {
            let seed = core
                .config
                .seed_nodes
                .choose(&mut rand::thread_rng())
                .ok_or(RoutingError::InsufficientSnodes)?;
            debug!("Querying seed node {}", seed);
            let url = format!("{}/json_rpc", seed.trim_end_matches('/'));
            let response = core
                .transport
                .execute(HttpRequest::post(url, body).to_seed_node())
                .await?;
            parse_pool_response(&response)
        }
    })
    .await
}

async fn fetch_pool_from_snodes(core: &Arc<Core>, current: &HashSet<Snode>) -> Result<HashSet<Snode>> {
    let targets = current
        .iter()
        .cloned()
        .choose_multiple(&mut rand::thread_rng(), core.config.pool_query_count);
    if targets.len() < core.config.pool_query_count {
        return Err(RoutingError::InsufficientSnodes);
    }

    let params = json!({
        "endpoint": "get_service_nodes",
        "params": {
            "active_only": true,
            "fields": pool_fields(),
        },
    });
    let responses = try_join_all(targets.iter().map(|snode| {
        let params = params.clone();
        retry::attempt(RetryPolicy::directory(&core.config), move || {
            let params = params.clone();
            async move {
                let response = api::invoke(core, SnodeEndpoint::OxendRequest, snode, None, params).await?;
                parse_pool_response(&response)
            }
        })
    }))
    .await?;

    intersect_pool_responses(
        responses,
        core.config.min_pool_agreement,
        core.config.max_pool_size,
    )
}

/// Keeps only nodes every responder reported.
///
/// The intersection must be strictly larger than `min_agreement`; it is then
/// capped to `max_size` entries.
pub fn intersect_pool_responses(
    responses: Vec<HashSet<Snode>>,
    min_agreement: usize,
    max_size: usize,
) -> Result<HashSet<Snode>> {
    let mut responses = responses.into_iter();
    let first = responses.next().ok_or(RoutingError::InconsistentSnodePools)?;
    let intersection = responses.fold(first, |acc, next| {
        acc.into_iter().filter(|snode| next.contains(snode)).collect()
    });

    if intersection.len() <= min_agreement {
        debug!("Only {} snodes in common between pool responses", intersection.len());
        return Err(RoutingError::InconsistentSnodePools);
    }
    Ok(intersection.into_iter().take(max_size).collect())
}

/// Parses `{"result": {"service_node_states": [...]}}`.
pub fn parse_pool_response(data: &[u8]) -> Result<HashSet<Snode>> {
    let json: Value = serde_json::from_slice(data)?;
    let states = json
        .get("result")
        .and_then(|result| result.get("service_node_states"))
        .and_then(Value::as_array)
        .ok_or(RoutingError::SnodePoolUpdatingFailed)?;
    Ok(states.iter().filter_map(Snode::from_json).collect())
}

/// Parses a swarm listing, `{"snodes": [...]}`. Malformed input yields an empty set.
pub fn parse_snodes(data: &[u8]) -> HashSet<Snode> {
    let Ok(json) = serde_json::from_slice::<Value>(data) else {
        return HashSet::new();
    };
    json.get("snodes")
        .and_then(Value::as_array)
        .map(|snodes| snodes.iter().filter_map(Snode::from_json).collect())
        .unwrap_or_default()
}

pub(crate) async fn get_swarm(core: &Arc<Core>, public_key: &str) -> Result<HashSet<Snode>> {
    let key = public_key.to_string();
    let cached = core.queue.run(move |state| state.swarm(&key)).await?;
    if let Some(swarm) = cached {
        if swarm.len() >= core.config.min_swarm_size {
            return Ok(swarm);
        }
    }

    debug!("Getting swarm for: {}", public_key);
    let swarm = retry::attempt(RetryPolicy::directory(&core.config), move || async move {
        let pool = get_pool(core).await?;
        let snode = pool
            .into_iter()
            .choose(&mut rand::thread_rng())
            .ok_or(RoutingError::InsufficientSnodes)?;
        let response = api::invoke(
            core,
            SnodeEndpoint::GetSwarm,
            &snode,
            Some(public_key),
            json!({ "pubKey": public_key }),
        )
        .await?;
        Ok(parse_snodes(&response))
    })
    .await?;

    let key = public_key.to_string();
    let stored = swarm.clone();
    core.queue.run(move |state| state.set_swarm(&key, stored)).await?;
    Ok(swarm)
}

pub(crate) async fn get_target_snodes(core: &Arc<Core>, public_key: &str) -> Result<Vec<Snode>> {
    let swarm = get_swarm(core, public_key).await?;
    Ok(swarm
        .into_iter()
        .choose_multiple(&mut rand::thread_rng(), core.config.target_swarm_snode_count))
}
