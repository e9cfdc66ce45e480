//! Common test utilities: logging, configs and a simulated snode network.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::Url;
use serde_json::{json, Value};
use snodenet_routing::crypto::{aead, ons, signing};
use snodenet_routing::wire;
use snodenet_routing::{
    HttpMethod, HttpRequest, MemorySnodeStore, Result, RouterConfig, RoutingError, Snode,
    SnodeNetwork, Transport, UserIdentity,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use x25519_dalek::{PublicKey, StaticSecret};

pub const SEED_URL: &str = "https://seed.test:4433";
pub const SERVER_HOST: &str = "open.test";
pub const CURRENT_VERSION: &str = "2.4.0";
pub const OUTDATED_VERSION: &str = "2.0.0";
pub const SWARM_SIZE: usize = 4;

/// Initialize test logging
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("snodenet_routing=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// Defaults with a single seed and near-zero delays.
pub fn test_config() -> RouterConfig {
    RouterConfig::default()
        .with_seed_nodes(vec![SEED_URL.to_string()])
        .with_retry_backoff(Duration::from_millis(1), Duration::from_millis(4))
        .with_guard_retry_delay(Duration::from_millis(1))
}

pub fn test_identity() -> UserIdentity {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    let session_id = format!("05{}", hex::encode([7u8; 32]));
    UserIdentity::from_seed(&seed, session_id).unwrap()
}

pub fn snode_json(snode: &Snode) -> Value {
    json!({
        "public_ip": snode.address,
        "storage_port": snode.port,
        "pubkey_ed25519": snode.ed25519_public_key,
        "pubkey_x25519": snode.x25519_public_key,
    })
}

/// Swarm listings use the older `ip`/`port` shape with string ports.
pub fn legacy_snode_json(snode: &Snode) -> Value {
    json!({
        "ip": snode.address,
        "port": snode.port.to_string(),
        "pubkey_ed25519": snode.ed25519_public_key,
        "pubkey_x25519": snode.x25519_public_key,
    })
}

pub struct SimNode {
    pub snode: Snode,
    secret: StaticSecret,
    signing_key: SigningKey,
}

impl SimNode {
    fn generate(index: usize) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let signing_key = SigningKey::generate(&mut OsRng);
        let snode = Snode::new(
            format!("10.1.{}.{}", index / 250, index % 250 + 1),
            22021,
            hex::encode(signing_key.verifying_key().as_bytes()),
            hex::encode(PublicKey::from(&secret).as_bytes()),
        );
        Self {
            snode,
            secret,
            signing_key,
        }
    }
}

/// Replaces the default answer of a node for an RPC method when it returns `Some`.
pub type Override = Arc<dyn Fn(&Snode, &str, &Value) -> Option<(u16, Value)> + Send + Sync>;

#[derive(Clone)]
struct StoredMessage {
    hash: String,
    data: String,
    expiration: i64,
}

#[derive(Default)]
struct SimState {
    offline: HashSet<String>,
    outdated: HashSet<String>,
    outdated_checks: usize,
    pool_views: HashMap<String, Vec<Snode>>,
    rpc_override: Option<Override>,
    seed_delay: Option<Duration>,
    seed_failures: usize,
    messages: Vec<StoredMessage>,
    next_message: usize,
    ons: HashMap<String, (String, String)>,
    bad_signer: Option<String>,
    probed: Vec<Snode>,
    rpc_log: Vec<(Snode, String)>,
    clock_skew_ms: Option<i64>,
}

/// In-process storage network. Every node holds real keys, peels its onion
/// layer and answers through the destination's symmetric key.
pub struct SimulatedNetwork {
    nodes: Vec<SimNode>,
    server_secret: StaticSecret,
    state: Mutex<SimState>,
    pub seed_requests: AtomicUsize,
    pub pool_queries: AtomicUsize,
    pub onion_requests: AtomicUsize,
    pub direct_requests: AtomicUsize,
}

impl SimulatedNetwork {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            nodes: (0..size).map(SimNode::generate).collect(),
            server_secret: StaticSecret::random_from_rng(OsRng),
            state: Mutex::new(SimState::default()),
            seed_requests: AtomicUsize::new(0),
            pool_queries: AtomicUsize::new(0),
            onion_requests: AtomicUsize::new(0),
            direct_requests: AtomicUsize::new(0),
        })
    }

    pub fn snodes(&self) -> Vec<Snode> {
        self.nodes.iter().map(|node| node.snode.clone()).collect()
    }

    /// Store whose pool holds the first `count` nodes, refreshed `age` ago.
    pub fn store_with_pool(&self, count: usize, age: ChronoDuration) -> MemorySnodeStore {
        MemorySnodeStore::with_pool(
            self.snodes().into_iter().take(count).collect(),
            Some(Utc::now() - age),
        )
    }

    pub fn server_public_key(&self) -> String {
        hex::encode(PublicKey::from(&self.server_secret).as_bytes())
    }

    /// The swarm every public key maps to.
    pub fn swarm(&self) -> Vec<Snode> {
        self.snodes().into_iter().take(SWARM_SIZE).collect()
    }

    pub fn set_offline(&self, snode: &Snode) {
        self.state.lock().offline.insert(snode.ed25519_public_key.clone());
    }

    pub fn set_outdated(&self, snode: &Snode) {
        self.state.lock().outdated.insert(snode.ed25519_public_key.clone());
    }

    /// The next `count` guard candidates checked report an outdated version.
    pub fn outdate_next_guard_checks(&self, count: usize) {
        self.state.lock().outdated_checks = count;
    }

    /// Nodes reported as outdated so far.
    pub fn outdated(&self) -> HashSet<String> {
        self.state.lock().outdated.clone()
    }

    pub fn set_pool_view(&self, snode: &Snode, view: Vec<Snode>) {
        self.state
            .lock()
            .pool_views
            .insert(snode.ed25519_public_key.clone(), view);
    }

    pub fn set_override<F>(&self, rpc_override: F)
    where
        F: Fn(&Snode, &str, &Value) -> Option<(u16, Value)> + Send + Sync + 'static,
    {
        self.state.lock().rpc_override = Some(Arc::new(rpc_override));
    }

    pub fn set_seed_delay(&self, delay: Duration) {
        self.state.lock().seed_delay = Some(delay);
    }

    pub fn fail_next_seed_requests(&self, count: usize) {
        self.state.lock().seed_failures = count;
    }

    /// Destinations report server time `skew_ms` ahead of local time.
    pub fn set_clock_skew(&self, skew_ms: i64) {
        self.state.lock().clock_skew_ms = Some(skew_ms);
    }

    /// `snode` signs deletion confirmations with the wrong key.
    pub fn set_bad_signer(&self, snode: &Snode) {
        self.state.lock().bad_signer = Some(snode.ed25519_public_key.clone());
    }

    pub fn add_message(&self, data: &[u8]) -> String {
        let mut state = self.state.lock();
        state.next_message += 1;
        let hash = format!("hash-{}", state.next_message);
        state.messages.push(StoredMessage {
            hash: hash.clone(),
            data: STANDARD.encode(data),
            expiration: (Utc::now() + ChronoDuration::days(14)).timestamp_millis(),
        });
        hash
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn register_ons_name(&self, name: &str, session_id: &[u8]) {
        let mut nonce = [0u8; 24];
        OsRng.fill_bytes(&mut nonce);
        let (ciphertext, nonce) = ons::encrypt_value(name, session_id, &nonce).unwrap();
        self.state
            .lock()
            .ons
            .insert(STANDARD.encode(ons::name_hash(name)), (ciphertext, nonce));
    }

    pub fn probed(&self) -> Vec<Snode> {
        self.state.lock().probed.clone()
    }

    /// Every RPC that reached a destination node, in order.
    pub fn rpc_log(&self) -> Vec<(Snode, String)> {
        self.state.lock().rpc_log.clone()
    }

    fn node_by_host(&self, host: &str) -> Option<&SimNode> {
        self.nodes.iter().find(|node| node.snode.address == host)
    }

    fn node_by_ed25519(&self, key: &str) -> Option<&SimNode> {
        self.nodes
            .iter()
            .find(|node| node.snode.ed25519_public_key == key)
    }

    fn is_offline(&self, node: &SimNode) -> bool {
        self.state.lock().offline.contains(&node.snode.ed25519_public_key)
    }

    async fn handle_seed(&self) -> Result<Bytes> {
        self.seed_requests.fetch_add(1, Ordering::SeqCst);
        let (delay, fail) = {
            let mut state = self.state.lock();
            let fail = state.seed_failures > 0;
            if fail {
                state.seed_failures -= 1;
            }
            (state.seed_delay, fail)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(RoutingError::HttpRequestFailed {
                status_code: 503,
                body: None,
            });
        }

        let states: Vec<Value> = self.nodes.iter().map(|node| snode_json(&node.snode)).collect();
        json_bytes(&json!({ "result": { "service_node_states": states } }))
    }

    fn handle_probe(&self, node: &SimNode) -> Result<Bytes> {
        let outdated = {
            let mut state = self.state.lock();
            state.probed.push(node.snode.clone());
            if state.outdated_checks > 0 {
                state.outdated_checks -= 1;
                state.outdated.insert(node.snode.ed25519_public_key.clone());
            }
            state.outdated.contains(&node.snode.ed25519_public_key)
        };
        let version = if outdated { OUTDATED_VERSION } else { CURRENT_VERSION };
        json_bytes(&json!({ "version": version }))
    }

    fn handle_onion(&self, guard: &SimNode, body: &[u8]) -> Result<Bytes> {
        self.onion_requests.fetch_add(1, Ordering::SeqCst);
        let (mut ciphertext, wrapper) = wire::decode_envelope(body)?;
        let mut ephemeral = ephemeral_key(&wrapper)?;
        let mut current = guard;

        loop {
            let (plaintext, key) = aead::decrypt_from(&ciphertext, &ephemeral, &current.secret)?;
            let (inner, routing) = wire::decode_envelope(&plaintext)?;
            if routing.get("headers").is_some() {
                return self.reply_from_snode(current, &inner, &key);
            }

            ephemeral = ephemeral_key(&routing)?;
            if let Some(next) = routing.get("destination").and_then(Value::as_str) {
                match self.node_by_ed25519(next) {
                    Some(node) if !self.is_offline(node) => {
                        current = node;
                        ciphertext = inner;
                        continue;
                    }
                    _ => return Err(next_node_not_found(next)),
                }
            }

            let host = routing.get("host").and_then(Value::as_str).unwrap_or_default();
            if host != SERVER_HOST {
                return Err(next_node_not_found(host));
            }
            let target = routing.get("target").and_then(Value::as_str).unwrap_or_default();
            let (payload, key) = aead::decrypt_from(&inner, &ephemeral, &self.server_secret)?;
            return reply_from_server(target, &payload, &key);
        }
    }

    fn reply_from_snode(&self, node: &SimNode, payload: &[u8], key: &aead::SymmetricKey) -> Result<Bytes> {
        let request: Value = serde_json::from_slice(payload)?;
        let method = request["method"].as_str().unwrap_or_default();
        let (status, mut body) = self.respond(node, method, &request["params"]);

        if let Some(skew) = self.state.lock().clock_skew_ms {
            if let Value::Object(map) = &mut body {
                map.insert("t".into(), json!(Utc::now().timestamp_millis() + skew));
            }
        }

        let inner = json!({ "status": status, "body": body.to_string() });
        let sealed = aead::encrypt(&serde_json::to_vec(&inner)?, key)?;
        json_bytes(&json!({ "result": STANDARD.encode(sealed) }))
    }

    fn handle_direct(&self, node: &SimNode, body: &[u8]) -> Result<Bytes> {
        self.direct_requests.fetch_add(1, Ordering::SeqCst);
        let request: Value = serde_json::from_slice(body)?;
        let method = request["method"].as_str().unwrap_or_default();
        let (status, body) = self.respond(node, method, &request["params"]);
        let body = Bytes::from(serde_json::to_vec(&body)?);
        if (200..300).contains(&status) {
            Ok(body)
        } else {
            Err(RoutingError::HttpRequestFailed {
                status_code: status,
                body: Some(body),
            })
        }
    }

    fn respond(&self, node: &SimNode, method: &str, params: &Value) -> (u16, Value) {
        let rpc_override = {
            let mut state = self.state.lock();
            state.rpc_log.push((node.snode.clone(), method.to_string()));
            state.rpc_override.clone()
        };
        if let Some(rpc_override) = rpc_override {
            if let Some(reply) = rpc_override(&node.snode, method, params) {
                return reply;
            }
        }

        match method {
            "oxend_request" => self.respond_oxend(node, params),
            "get_snodes_for_pubkey" => {
                let snodes: Vec<Value> = self.swarm().iter().map(legacy_snode_json).collect();
                (200, json!({ "snodes": snodes }))
            }
            "info" => (
                200,
                json!({ "timestamp": Utc::now().timestamp_millis(), "hf": [19, 3] }),
            ),
            "store" => {
                let data = params["data"].as_str().unwrap_or_default().to_string();
                let mut state = self.state.lock();
                state.next_message += 1;
                let hash = format!("hash-{}", state.next_message);
                state.messages.push(StoredMessage {
                    hash: hash.clone(),
                    data,
                    expiration: Utc::now().timestamp_millis() + 60_000,
                });
                (200, json!({ "hash": hash, "hf": [19, 3] }))
            }
            "retrieve" => {
                let last_hash = params["lastHash"].as_str().unwrap_or_default();
                let state = self.state.lock();
                let start = state
                    .messages
                    .iter()
                    .position(|message| message.hash == last_hash)
                    .map_or(0, |index| index + 1);
                let messages: Vec<Value> = state.messages[start..]
                    .iter()
                    .map(|message| {
                        json!({
                            "hash": message.hash,
                            "expiration": message.expiration,
                            "data": message.data,
                        })
                    })
                    .collect();
                (200, json!({ "messages": messages }))
            }
            "delete" => {
                let public_key = params["pubkey"].as_str().unwrap_or_default().to_string();
                let requested: Vec<String> = params["messages"]
                    .as_array()
                    .map(|hashes| hashes.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default();
                let deleted: Vec<String> = {
                    let mut state = self.state.lock();
                    let deleted = state
                        .messages
                        .iter()
                        .filter(|message| requested.contains(&message.hash))
                        .map(|message| message.hash.clone())
                        .collect();
                    state.messages.retain(|message| !requested.contains(&message.hash));
                    deleted
                };
                let signed = format!("{}{}{}", public_key, requested.concat(), deleted.concat());
                (200, self.swarm_confirmations(&deleted, &signed))
            }
            "delete_all" => {
                let public_key = params["pubkey"].as_str().unwrap_or_default().to_string();
                let timestamp = params["timestamp"].as_i64().unwrap_or_default();
                let deleted: Vec<String> = {
                    let mut state = self.state.lock();
                    let deleted = state.messages.iter().map(|m| m.hash.clone()).collect();
                    state.messages.clear();
                    deleted
                };
                let signed = format!("{}{}{}", public_key, timestamp, deleted.concat());
                (200, self.swarm_confirmations(&deleted, &signed))
            }
            _ => (400, json!({ "error": format!("unknown method {}", method) })),
        }
    }

    fn respond_oxend(&self, node: &SimNode, params: &Value) -> (u16, Value) {
        match params["endpoint"].as_str() {
            Some("get_service_nodes") => {
                self.pool_queries.fetch_add(1, Ordering::SeqCst);
                let view = self
                    .state
                    .lock()
                    .pool_views
                    .get(&node.snode.ed25519_public_key)
                    .cloned()
                    .unwrap_or_else(|| self.snodes());
                let states: Vec<Value> = view.iter().map(snode_json).collect();
                (200, json!({ "result": { "service_node_states": states } }))
            }
            Some("ons_resolve") => {
                let hash = params["params"]["name_hash"].as_str().unwrap_or_default();
                let record = self.state.lock().ons.get(hash).cloned();
                match record {
                    Some((ciphertext, nonce)) => (
                        200,
                        json!({ "result": { "encrypted_value": ciphertext, "nonce": nonce } }),
                    ),
                    None => (404, json!({ "error": "name not found" })),
                }
            }
            _ => (400, json!({ "error": "unknown endpoint" })),
        }
    }

    fn swarm_confirmations(&self, deleted: &[String], signed: &str) -> Value {
        let bad_signer = self.state.lock().bad_signer.clone();
        let mut swarm = serde_json::Map::new();
        for node in self.nodes.iter().take(SWARM_SIZE) {
            let key = &node.snode.ed25519_public_key;
            let signature = if bad_signer.as_ref() == Some(key) {
                signing::sign(&SigningKey::generate(&mut OsRng), signed.as_bytes())
            } else {
                signing::sign(&node.signing_key, signed.as_bytes())
            };
            swarm.insert(key.clone(), json!({ "deleted": deleted, "signature": signature }));
        }
        json!({ "swarm": swarm })
    }
}

#[async_trait]
impl Transport for SimulatedNetwork {
    async fn execute(&self, request: HttpRequest) -> Result<Bytes> {
        if request.is_seed_node {
            return self.handle_seed().await;
        }

        let url = Url::parse(&request.url).map_err(|_| RoutingError::InvalidUrl)?;
        let node = url
            .host_str()
            .and_then(|host| self.node_by_host(host))
            .filter(|node| !self.is_offline(node))
            .ok_or(RoutingError::Timeout)?;
        let body = request.body.unwrap_or_default();

        match (request.method, url.path()) {
            (HttpMethod::Get, "/get_stats/v1") => self.handle_probe(node),
            (HttpMethod::Post, "/onion_req/v2") => self.handle_onion(node, &body),
            (HttpMethod::Post, "/storage_rpc/v1") => self.handle_direct(node, &body),
            _ => Err(RoutingError::HttpRequestFailed {
                status_code: 404,
                body: None,
            }),
        }
    }
}

fn reply_from_server(target: &str, payload: &[u8], key: &aead::SymmetricKey) -> Result<Bytes> {
    if target == "/oxen/v4/lsrpc" {
        let (info, body) = wire::decode_bencoded(payload)?;
        let info: Value = serde_json::from_slice(&info)?;
        let response_info = json!({
            "code": 200,
            "headers": { "x-endpoint": info["endpoint"] },
        });
        let frame = wire::encode_bencoded(&serde_json::to_vec(&response_info)?, body.as_deref());
        return Ok(Bytes::from(aead::encrypt(&frame, key)?));
    }

    let request: Value = serde_json::from_slice(payload)?;
    let body = json!({ "endpoint": request["endpoint"], "echo": request["body"] });
    let inner = json!({ "status": 200, "body": body.to_string() });
    let sealed = aead::encrypt(&serde_json::to_vec(&inner)?, key)?;
    json_bytes(&json!({ "result": STANDARD.encode(sealed) }))
}

fn ephemeral_key(routing: &Value) -> Result<[u8; 32]> {
    routing
        .get("ephemeral_key")
        .and_then(Value::as_str)
        .and_then(|key| hex::decode(key).ok())
        .and_then(|key| key.try_into().ok())
        .ok_or(RoutingError::InvalidRequestInfo)
}

fn next_node_not_found(key: &str) -> RoutingError {
    RoutingError::HttpRequestFailed {
        status_code: 502,
        body: Some(Bytes::from(format!("Next node not found: {}", key))),
    }
}

fn json_bytes(value: &Value) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Replays canned responses in order, recording every request.
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<Bytes>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Result<Bytes>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> Result<Bytes> {
        self.requests.lock().push(request);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or(Err(RoutingError::HttpRequestFailed {
                status_code: 0,
                body: None,
            }))
    }
}

pub fn build_network(
    sim: &Arc<SimulatedNetwork>,
    config: RouterConfig,
    store: MemorySnodeStore,
) -> SnodeNetwork {
    SnodeNetwork::builder(config)
        .with_transport(sim.clone())
        .with_store(Arc::new(store))
        .build()
        .unwrap()
}

pub fn build_network_with_identity(
    sim: &Arc<SimulatedNetwork>,
    config: RouterConfig,
    store: MemorySnodeStore,
    identity: UserIdentity,
) -> SnodeNetwork {
    SnodeNetwork::builder(config)
        .with_transport(sim.clone())
        .with_store(Arc::new(store))
        .with_identity(identity)
        .build()
        .unwrap()
}
