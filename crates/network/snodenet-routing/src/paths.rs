//! Onion path construction and repair.

use crate::directory;
use crate::error::{Result, RoutingError};
use crate::network::Core;
use crate::queue::SharedResult;
use crate::state::{Lookup, NetworkState};
use crate::transport::HttpRequest;
use crate::types::{OnionPath, Snode, SnodeVersion};
use chrono::Utc;
use futures::future::FutureExt;
use rand::seq::SliceRandom;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Path build notifications for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathEvent {
    BuildingPaths,
    PathsBuilt(Vec<OnionPath>),
}

/// Builds, hands out and repairs onion request paths.
#[derive(Clone)]
pub struct OnionPathBuilder {
    core: Arc<Core>,
}

impl OnionPathBuilder {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    /// Returns a random path, avoiding `excluding` when one is given.
    ///
    /// Builds paths first if none exist. With some but fewer than the target
    /// count, an existing path is returned while the rest build in the background.
    pub async fn get_path(&self, excluding: Option<&Snode>) -> Result<OnionPath> {
        get_path(&self.core, excluding).await
    }

    /// Tops the active paths up to the target count.
    pub async fn build_paths(&self) -> Result<Vec<OnionPath>> {
        let job_core = self.core.clone();
        let pending = self
            .core
            .queue
            .run(move |state| pending_path_build(&job_core, state))
            .await?;
        pending.await
    }

    pub async fn paths(&self) -> Result<Vec<OnionPath>> {
        self.core.queue.run(|state| state.paths.clone()).await
    }

    /// Replaces `snode` in its path with an unused pool node and drops it from the pool.
    pub async fn drop_snode(&self, snode: &Snode) -> Result<()> {
        let snode = snode.clone();
        self.core
            .queue
            .run(move |state| state.repair_path_snode(&snode))
            .await?
    }

    /// Removes `path`. The shortfall is rebuilt on the next [`get_path`](Self::get_path).
    pub async fn drop_path(&self, path: &OnionPath) -> Result<()> {
        let path = path.clone();
        self.core.queue.run(move |state| state.drop_path(&path)).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PathEvent> {
        self.core.events.subscribe()
    }
}

pub(crate) async fn get_path(core: &Arc<Core>, excluding: Option<&Snode>) -> Result<OnionPath> {
    let excluded = excluding.cloned();
    let job_core = core.clone();
    let lookup = core
        .queue
        .run(move |state| -> Result<Lookup<OnionPath, Vec<OnionPath>>> {
            if state.paths.len() >= job_core.config.target_path_count {
                return random_path(&state.paths, excluded.as_ref())
                    .map(Lookup::Ready)
                    .ok_or(RoutingError::InsufficientSnodes);
            }
            let pending = pending_path_build(&job_core, state);
            Ok(match random_path(&state.paths, excluded.as_ref()) {
                Some(path) => Lookup::Ready(path),
                None => Lookup::Pending(pending),
            })
        })
        .await??;

    match lookup {
        Lookup::Ready(path) => Ok(path),
        Lookup::Pending(build) => {
            let paths = build.await?;
            random_path(&paths, excluding).ok_or(RoutingError::InsufficientSnodes)
        }
    }
}

fn random_path(paths: &[OnionPath], excluding: Option<&Snode>) -> Option<OnionPath> {
    let candidates: Vec<&OnionPath> = paths
        .iter()
        .filter(|path| excluding.map_or(true, |snode| !path.contains(snode)))
        .collect();
    candidates.choose(&mut rand::thread_rng()).map(|path| (*path).clone())
}

fn pending_path_build(core: &Arc<Core>, state: &mut NetworkState) -> SharedResult<Vec<OnionPath>> {
    if let Some(pending) = &state.path_build {
        return pending.clone();
    }
    let pending = spawn_path_build(core.clone(), state.paths.clone());
    state.path_build = Some(pending.clone());
    pending
}

fn spawn_path_build(core: Arc<Core>, reusing: Vec<OnionPath>) -> SharedResult<Vec<OnionPath>> {
    let handle = tokio::spawn(async move {
        let _ = core.events.send(PathEvent::BuildingPaths);
        let built = build_paths(&core, reusing).await;

        let paths = core
            .queue
            .run(move |state: &mut NetworkState| -> Result<Vec<OnionPath>> {
                state.path_build = None;
                let paths = merge_paths(state.paths.clone(), built?);
                state.set_paths(paths.clone());
                Ok(paths)
            })
            .await??;

        info!("Built {} onion request paths", paths.len());
        let _ = core.events.send(PathEvent::PathsBuilt(paths.clone()));
        Ok::<_, RoutingError>(paths)
    });

    async move {
        handle
            .await
            .map_err(|e| RoutingError::Internal(format!("path build task: {}", e)))?
    }
    .boxed()
    .shared()
}

/// Appends built paths to the active ones, skipping any that share a hop
/// with a path already kept. Repairs can run while a build is in flight.
fn merge_paths(mut paths: Vec<OnionPath>, built: Vec<OnionPath>) -> Vec<OnionPath> {
    for path in built {
        let overlaps = paths
            .iter()
            .any(|kept| kept.hops().iter().any(|hop| path.contains(hop)));
        if overlaps {
            warn!("Discarding built path {}; it overlaps an active path", path);
            continue;
        }
        paths.push(path);
    }
    paths
}

/// Builds the paths missing next to `reusing`, returning only the new ones.
async fn build_paths(core: &Arc<Core>, reusing: Vec<OnionPath>) -> Result<Vec<OnionPath>> {
    let config = &core.config;
    let needed = config.target_path_count.saturating_sub(reusing.len());
    if needed == 0 {
        return Ok(Vec::new());
    }
    info!("Building {} onion request paths", needed);

    let pool = usable_pool(core).await?;
    let used: HashSet<&Snode> = reusing.iter().flat_map(|path| path.hops()).collect();
    let mut unused: Vec<Snode> = pool.into_iter().filter(|snode| !used.contains(snode)).collect();
    unused.shuffle(&mut rand::thread_rng());

    if needed * config.path_size > unused.len() {
        warn!(
            "Not enough snodes to build {} paths: {} unused in pool",
            needed,
            unused.len()
        );
        return Err(RoutingError::InsufficientSnodes);
    }

    let guards = select_guards(core, &mut unused, needed).await?;

    let mut paths = Vec::with_capacity(needed);
    for guard in guards {
        let mut hops = Vec::with_capacity(config.path_size);
        hops.push(guard);
        for _ in 1..config.path_size {
            hops.push(unused.pop().ok_or(RoutingError::InsufficientSnodes)?);
        }
        let path = OnionPath::new(hops);
        debug!("Built path {}", path);
        paths.push(path);
    }
    Ok(paths)
}

/// Pool to draw hops from. Never waits on a snode-based pool refresh, since
/// that refresh may itself need a path.
async fn usable_pool(core: &Arc<Core>) -> Result<HashSet<Snode>> {
    let cached = core.queue.run(|state| state.pool.clone()).await?;
    if cached.len() >= core.config.min_pool_size {
        return Ok(cached);
    }

    info!("Snode pool too small to build paths; fetching from seed nodes");
    let pool = directory::fetch_pool_from_seed(core).await?;
    let applied = pool.clone();
    core.queue
        .run(move |state| state.set_pool(applied, Utc::now()))
        .await?;
    Ok(pool)
}

/// Probes candidates until `count` guards answer with a supported version.
///
/// Each attempt consumes a candidate, and enough candidates are always left
/// behind to fill the remaining hops.
async fn select_guards(core: &Arc<Core>, candidates: &mut Vec<Snode>, count: usize) -> Result<Vec<Snode>> {
    let hops_per_path = core.config.path_size.saturating_sub(1);
    let mut guards = Vec::with_capacity(count);

    while guards.len() < count {
        let still_needed = count - guards.len();
        let reserved = count * hops_per_path + still_needed - 1;
        if candidates.len() <= reserved {
            return Err(RoutingError::InsufficientSnodes);
        }
        let candidate = candidates.pop().ok_or(RoutingError::InsufficientSnodes)?;

        match probe_guard(core, &candidate).await {
            Ok(()) => {
                debug!("Guard snode selected: {}", candidate);
                guards.push(candidate);
            }
            Err(e) => {
                debug!("Guard candidate {} rejected: {}", candidate, e);
                tokio::time::sleep(core.config.guard_retry_delay).await;
            }
        }
    }
    Ok(guards)
}

/// Liveness and version check for a guard candidate.
pub(crate) async fn probe_guard(core: &Core, snode: &Snode) -> Result<()> {
    let timeout = core.config.probe_timeout;
    let request = HttpRequest::get(snode.url("get_stats/v1")).with_timeout(timeout);
    let response = tokio::time::timeout(timeout, core.transport.execute(request))
        .await
        .map_err(|_| RoutingError::Timeout)??;

    let stats: Value = serde_json::from_slice(&response)?;
    let version = stats
        .get("version")
        .and_then(Value::as_str)
        .ok_or(RoutingError::MissingSnodeVersion)?;
    let version = SnodeVersion::parse(version)?;
    if version < core.min_snode_version {
        return Err(RoutingError::UnsupportedSnodeVersion(version.to_string()));
    }
    Ok(())
}
