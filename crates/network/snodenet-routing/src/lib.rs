//! # Snodenet Routing
//!
//! Onion-routed requests to a decentralized storage network, together with the
//! directory state needed to build the tunnels.
//!
//! This crate provides:
//! - **Snode directory**: pool bootstrap from seed nodes, quorum refresh from
//!   pool members, per-identity swarms and failure-driven eviction
//! - **Onion paths**: disjoint multi-hop paths with probed guards and in-place repair
//! - **Onion crypto**: x25519 + AES-GCM layers, one per hop plus one for the destination
//! - **Wire framing**: the binary/JSON envelope and the bencoded V4 framing
//! - **Storage API**: message retrieval, storage and deletion, and ONS resolution
//!
//! All directory state lives in a single serialized work queue; network I/O
//! runs outside it and re-enters it to apply results.
//!
//! ## Example
//!
//! ```rust,no_run
//! use snodenet_routing::{RouterConfig, SnodeNetwork};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = SnodeNetwork::new(RouterConfig::default())?;
//!
//!     let swarm = network.directory().get_swarm("05abcdef").await?;
//!     println!("{} snodes in swarm", swarm.len());
//!
//!     let session_id = network.api().resolve_ons_name("alice").await?;
//!     println!("alice is {}", session_id);
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod failure;
pub mod network;
pub mod onion;
pub mod paths;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod transport;
pub mod types;
pub mod wire;

mod state;

// Re-exports for convenience
pub use api::SnodeApi;
pub use config::RouterConfig;
pub use directory::SnodeDirectory;
pub use dispatcher::RequestDispatcher;
pub use error::{Result, RoutingError};
pub use network::{SnodeNetwork, SnodeNetworkBuilder};
pub use paths::{OnionPathBuilder, PathEvent};
pub use storage::{MemorySnodeStore, SnodeStore};
pub use transport::{HttpMethod, HttpRequest, ReqwestTransport, Transport};
pub use types::{
    Destination, OnionPath, OnionVersion, ReceivedMessage, ResponseInfo, ServerDestination, Snode,
    SnodeEndpoint, SnodeMessage, UserIdentity,
};
pub use wire::OnionHttpRequest;
