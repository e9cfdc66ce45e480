//! Core types for the service node network

use crate::error::{Result, RoutingError};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A storage network server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Snode {
    /// Public IP address
    pub address: String,
    /// Storage server port
    pub port: u16,
    /// Hex encoded ed25519 identity key
    pub ed25519_public_key: String,
    /// Hex encoded x25519 encryption key
    pub x25519_public_key: String,
}

impl Snode {
    pub fn new(
        address: impl Into<String>,
        port: u16,
        ed25519_public_key: impl Into<String>,
        x25519_public_key: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            port,
            ed25519_public_key: ed25519_public_key.into(),
            x25519_public_key: x25519_public_key.into(),
        }
    }

    /// HTTPS URL for an endpoint on this node.
    pub fn url(&self, path: &str) -> String {
        format!("https://{}:{}/{}", self.address, self.port, path.trim_start_matches('/'))
    }

    /// Parses a node entry from a discovery response.
    ///
    /// Both the current (`public_ip`, `storage_port`) and the legacy (`ip`, `port`)
    /// shapes are accepted, and ports may be encoded as strings. Entries without a
    /// usable address or with malformed keys yield `None`.
    pub fn from_json(value: &Value) -> Option<Snode> {
        let address = value
            .get("public_ip")
            .or_else(|| value.get("ip"))
            .and_then(Value::as_str)?;
        if address.is_empty() || address == "0.0.0.0" {
            return None;
        }

        let port = value.get("storage_port").or_else(|| value.get("port"))?;
        let port = match port {
            Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok())?,
            Value::String(s) => s.parse::<u16>().ok()?,
            _ => return None,
        };

        let ed25519 = value.get("pubkey_ed25519").and_then(Value::as_str)?;
        let x25519 = value.get("pubkey_x25519").and_then(Value::as_str)?;
        if !is_hex_key(ed25519) || !is_hex_key(x25519) {
            return None;
        }

        Some(Snode::new(address, port, ed25519, x25519))
    }
}

impl fmt::Display for Snode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

fn is_hex_key(key: &str) -> bool {
    key.len() == 64 && key.bytes().all(|b| b.is_ascii_hexdigit())
}

/// An ordered list of hops. The first hop is the guard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OnionPath(Vec<Snode>);

impl OnionPath {
    pub fn new(hops: Vec<Snode>) -> Self {
        Self(hops)
    }

    /// The only hop that ever sees the caller's address.
    pub fn guard(&self) -> Option<&Snode> {
        self.0.first()
    }

    pub fn hops(&self) -> &[Snode] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, snode: &Snode) -> bool {
        self.0.contains(snode)
    }

    pub fn find_by_ed25519(&self, ed25519_public_key: &str) -> Option<&Snode> {
        self.0.iter().find(|s| s.ed25519_public_key == ed25519_public_key)
    }

    /// Swaps `old` for `new` in place, keeping hop order.
    pub fn replace(&mut self, old: &Snode, new: Snode) -> bool {
        match self.0.iter().position(|s| s == old) {
            Some(index) => {
                self.0[index] = new;
                true
            }
            None => false,
        }
    }
}

impl fmt::Display for OnionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hops: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", hops.join(" -> "))
    }
}

/// An external HTTP service reached through the last hop of a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDestination {
    pub host: String,
    /// Onion endpoint on the server, e.g. `/oxen/v4/lsrpc`
    pub target: String,
    /// Hex encoded x25519 key of the server
    pub x25519_public_key: String,
    pub scheme: Option<String>,
    pub port: Option<u16>,
}

/// Where an onion request ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Snode(Snode),
    Server(ServerDestination),
}

impl Destination {
    pub fn x25519_public_key(&self) -> &str {
        match self {
            Destination::Snode(snode) => &snode.x25519_public_key,
            Destination::Server(server) => &server.x25519_public_key,
        }
    }

    pub fn snode(&self) -> Option<&Snode> {
        match self {
            Destination::Snode(snode) => Some(snode),
            Destination::Server(_) => None,
        }
    }
}

/// Onion request protocol generations.
///
/// V2 and V3 share the binary envelope and JSON payloads; V4 uses the
/// bencoded request/response framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnionVersion {
    V2,
    V3,
    V4,
}

impl OnionVersion {
    pub fn target(&self) -> &'static str {
        match self {
            OnionVersion::V2 => "/loki/v2/lsrpc",
            OnionVersion::V3 => "/loki/v3/lsrpc",
            OnionVersion::V4 => "/oxen/v4/lsrpc",
        }
    }
}

/// Status line and headers of a response returned through a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ResponseInfo {
    pub fn new(code: u16) -> Self {
        Self { code, headers: BTreeMap::new() }
    }
}

/// Request line and headers for a V4 onion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub method: String,
    pub endpoint: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Storage server RPC methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnodeEndpoint {
    GetSwarm,
    GetMessages,
    SendMessage,
    DeleteMessage,
    ClearAllData,
    GetInfo,
    OxendRequest,
}

impl SnodeEndpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnodeEndpoint::GetSwarm => "get_snodes_for_pubkey",
            SnodeEndpoint::GetMessages => "retrieve",
            SnodeEndpoint::SendMessage => "store",
            SnodeEndpoint::DeleteMessage => "delete",
            SnodeEndpoint::ClearAllData => "delete_all",
            SnodeEndpoint::GetInfo => "info",
            SnodeEndpoint::OxendRequest => "oxend_request",
        }
    }
}

impl fmt::Display for SnodeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dotted version reported by a node's status endpoint.
#[derive(Debug, Clone)]
pub struct SnodeVersion(Vec<u32>);

impl SnodeVersion {
    pub fn parse(version: &str) -> Result<Self> {
        let parts = version
            .trim()
            .split('.')
            .map(|part| part.parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| RoutingError::UnsupportedSnodeVersion(version.to_string()))?;
        if parts.is_empty() {
            return Err(RoutingError::UnsupportedSnodeVersion(version.to_string()));
        }
        Ok(Self(parts))
    }
}

impl PartialEq for SnodeVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SnodeVersion {}

impl PartialOrd for SnodeVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SnodeVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let lhs = self.0.get(i).copied().unwrap_or(0);
            let rhs = other.0.get(i).copied().unwrap_or(0);
            match lhs.cmp(&rhs) {
                Ordering::Equal => continue,
                ordering => return ordering,
            }
        }
        Ordering::Equal
    }
}

impl fmt::Display for SnodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        f.write_str(&parts.join("."))
    }
}

/// A message to store in a recipient's swarm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnodeMessage {
    /// Session id of the recipient
    pub recipient: String,
    /// Base64 encoded payload
    pub data: String,
    /// Time to live in milliseconds
    pub ttl: u64,
    /// Sender timestamp in milliseconds
    pub timestamp_ms: u64,
}

impl SnodeMessage {
    /// Storage server `store` parameters, without namespace.
    pub fn to_params(&self) -> Value {
        serde_json::json!({
            "pubKey": self.recipient,
            "data": self.data,
            "ttl": self.ttl.to_string(),
            "timestamp": self.timestamp_ms.to_string(),
        })
    }
}

/// A message returned by `retrieve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub hash: String,
    pub expiration_ms: Option<i64>,
    pub data: Vec<u8>,
}

/// The local user's keys, needed for authenticated storage operations.
#[derive(Clone)]
pub struct UserIdentity {
    signing_key: SigningKey,
    session_id: String,
}

impl UserIdentity {
    pub fn new(signing_key: SigningKey, session_id: impl Into<String>) -> Self {
        Self { signing_key, session_id: session_id.into() }
    }

    /// Builds an identity from a raw 32 byte ed25519 seed.
    pub fn from_seed(seed: &[u8], session_id: impl Into<String>) -> Result<Self> {
        let seed: [u8; 32] = seed.try_into().map_err(|_| RoutingError::SigningFailed)?;
        Ok(Self::new(SigningKey::from_bytes(&seed), session_id))
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn ed25519_public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }
}

impl fmt::Debug for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserIdentity")
            .field("session_id", &self.session_id)
            .field("ed25519_public_key", &self.ed25519_public_key_hex())
            .finish()
    }
}
