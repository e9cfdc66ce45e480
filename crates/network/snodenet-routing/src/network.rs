//! Entry point wiring configuration, transport, storage and the work queue together.

use crate::api::SnodeApi;
use crate::config::RouterConfig;
use crate::directory::SnodeDirectory;
use crate::dispatcher::RequestDispatcher;
use crate::error::{Result, RoutingError};
use crate::paths::{OnionPathBuilder, PathEvent};
use crate::queue::WorkQueue;
use crate::state::NetworkState;
use crate::storage::{MemorySnodeStore, SnodeStore};
use crate::transport::{ReqwestTransport, Transport};
use crate::types::{SnodeVersion, UserIdentity};
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Transport timeout for everything except guard probes.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Shared by every handle.
pub(crate) struct Core {
    pub(crate) config: RouterConfig,
    pub(crate) min_snode_version: SnodeVersion,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) store: Arc<dyn SnodeStore>,
    pub(crate) queue: WorkQueue<NetworkState>,
    pub(crate) events: broadcast::Sender<PathEvent>,
    identity: Option<UserIdentity>,
    /// Server time minus local time, in milliseconds
    clock_offset_ms: AtomicI64,
}

impl Core {
    pub(crate) fn identity(&self) -> Result<&UserIdentity> {
        self.identity.as_ref().ok_or(RoutingError::MissingKeyMaterial)
    }

    /// Local time corrected by the last observed server offset.
    pub(crate) fn network_time_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.clock_offset_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn set_clock_offset(&self, server_time_ms: i64) {
        let offset = server_time_ms - Utc::now().timestamp_millis();
        self.clock_offset_ms.store(offset, Ordering::Relaxed);
        debug!("Clock offset set to {}ms", offset);
    }
}

/// Builder for [`SnodeNetwork`].
pub struct SnodeNetworkBuilder {
    config: RouterConfig,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn SnodeStore>>,
    identity: Option<UserIdentity>,
}

impl SnodeNetworkBuilder {
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SnodeStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Keys used for authenticated retrieval and deletion.
    pub fn with_identity(mut self, identity: UserIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Validates the configuration, restores persisted state and starts the work queue.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<SnodeNetwork> {
        self.config.validate()?;
        let min_snode_version = self.config.min_snode_version()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(DEFAULT_REQUEST_TIMEOUT)?),
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemorySnodeStore::new()));

        let state = NetworkState::load(store.clone(), &self.config);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let core = Core {
            config: self.config,
            min_snode_version,
            transport,
            store,
            queue: WorkQueue::spawn(state),
            events,
            identity: self.identity,
            clock_offset_ms: AtomicI64::new(0),
        };
        Ok(SnodeNetwork { core: Arc::new(core) })
    }
}

/// Handle to the storage network. Cheap to clone.
#[derive(Clone)]
pub struct SnodeNetwork {
    core: Arc<Core>,
}

impl SnodeNetwork {
    pub fn builder(config: RouterConfig) -> SnodeNetworkBuilder {
        SnodeNetworkBuilder {
            config,
            transport: None,
            store: None,
            identity: None,
        }
    }

    /// Network with the reqwest transport and an in-memory store.
    pub fn new(config: RouterConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn directory(&self) -> SnodeDirectory {
        SnodeDirectory::new(self.core.clone())
    }

    pub fn paths(&self) -> OnionPathBuilder {
        OnionPathBuilder::new(self.core.clone())
    }

    pub fn dispatcher(&self) -> RequestDispatcher {
        RequestDispatcher::new(self.core.clone())
    }

    pub fn api(&self) -> SnodeApi {
        SnodeApi::new(self.core.clone())
    }

    /// Path build notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<PathEvent> {
        self.core.events.subscribe()
    }

    /// Last observed difference between server and local time.
    pub fn clock_offset_ms(&self) -> i64 {
        self.core.clock_offset_ms.load(Ordering::Relaxed)
    }

    pub fn network_time_ms(&self) -> i64 {
        self.core.network_time_ms()
    }

    pub fn config(&self) -> &RouterConfig {
        &self.core.config
    }
}
