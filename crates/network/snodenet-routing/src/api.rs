//! Storage server operations: message retrieval, storage and deletion,
//! network time, and name resolution.

use crate::crypto::{ons, signing};
use crate::directory;
use crate::dispatcher;
use crate::error::{Result, RoutingError};
use crate::network::Core;
use crate::retry::{self, RetryPolicy};
use crate::storage::{LastHashKey, LastHashRecord};
use crate::transport::HttpRequest;
use crate::types::{ReceivedMessage, Snode, SnodeEndpoint, SnodeMessage, UserIdentity};
use crate::wire;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use futures::future::{join_all, try_join_all};
use rand::seq::IteratorRandom;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Remote operations against the storage network.
#[derive(Clone)]
pub struct SnodeApi {
    core: Arc<Core>,
}

impl SnodeApi {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    /// Raw RPC call, through a path unless onion requests are disabled.
    pub async fn invoke(
        &self,
        endpoint: SnodeEndpoint,
        snode: &Snode,
        public_key: Option<&str>,
        params: Value,
    ) -> Result<Bytes> {
        invoke(&self.core, endpoint, snode, public_key, params).await
    }

    /// Server time of `snode` in milliseconds.
    pub async fn get_network_time(&self, snode: &Snode) -> Result<i64> {
        get_network_time(&self.core, snode).await
    }

    /// Fetches messages newer than the last one seen from `snode`, minus duplicates.
    pub async fn get_messages(
        &self,
        snode: &Snode,
        public_key: &str,
        namespace: i32,
        authenticated: bool,
    ) -> Result<Vec<ReceivedMessage>> {
        let core = &self.core;
        let key = LastHashKey {
            snode: snode.clone(),
            public_key: public_key.to_string(),
            namespace,
        };
        let now = Utc::now();
        if let Err(e) = core.store.prune_expired_message_hashes(&key, now) {
            warn!("Couldn't prune expired message hashes: {}", e);
        }
        let last_hash = core
            .store
            .last_message_hash(&key, now)
            .unwrap_or_else(|e| {
                warn!("Couldn't load last message hash: {}", e);
                None
            })
            .unwrap_or_default();

        let params = if authenticated {
            let identity = core.identity()?;
            let timestamp = core.network_time_ms();
            let namespace_part = if namespace == 0 { String::new() } else { namespace.to_string() };
            let signature = signing::sign(
                identity.signing_key(),
                format!("retrieve{}{}", namespace_part, timestamp).as_bytes(),
            );
            json!({
                "pubKey": public_key,
                "namespace": namespace,
                "lastHash": last_hash,
                "timestamp": timestamp,
                "pubkey_ed25519": identity.ed25519_public_key_hex(),
                "signature": signature,
            })
        } else {
            let mut params = json!({ "pubKey": public_key, "lastHash": last_hash });
            if namespace != 0 {
                params["namespace"] = json!(namespace);
            }
            params
        };

        let response = invoke(core, SnodeEndpoint::GetMessages, snode, Some(public_key), params).await?;
        let messages = parse_messages(&response)?;

        if let Some(newest) = messages.last() {
            let record = LastHashRecord {
                hash: newest.hash.clone(),
                expires_at: newest
                    .expiration_ms
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            };
            if let Err(e) = core.store.set_last_message_hash(&key, record) {
                warn!("Couldn't persist last message hash: {}", e);
            }
        }

        let received = core.store.received_message_hashes(public_key).unwrap_or_else(|e| {
            warn!("Couldn't load received message hashes: {}", e);
            Default::default()
        });
        let fresh: Vec<ReceivedMessage> = messages
            .into_iter()
            .filter(|message| !received.contains(&message.hash))
            .collect();
        let hashes: Vec<String> = fresh.iter().map(|message| message.hash.clone()).collect();
        if let Err(e) = core.store.insert_received_message_hashes(public_key, &hashes) {
            warn!("Couldn't persist received message hashes: {}", e);
        }
        Ok(fresh)
    }

    /// Stores `message` on the recipient's target snodes; one result per snode.
    pub async fn send_message(&self, message: &SnodeMessage, namespace: i32) -> Result<Vec<Result<Bytes>>> {
        let core = &self.core;
        let recipient = message.recipient.as_str();
        let targets = directory::get_target_snodes(core, recipient).await?;

        let mut params = message.to_params();
        if namespace != 0 {
            params["namespace"] = json!(namespace);
        }

        let policy = RetryPolicy::message(&core.config);
        let results = join_all(targets.iter().map(|snode| {
            let params = params.clone();
            retry::attempt(policy, move || {
                invoke(core, SnodeEndpoint::SendMessage, snode, Some(recipient), params.clone())
            })
        }))
        .await;
        Ok(results)
    }

    /// Deletes `hashes` from the user's swarm. Maps each swarm member's ed25519
    /// key to whether its deletion signature verified.
    pub async fn delete_messages(&self, hashes: &[String]) -> Result<HashMap<String, bool>> {
        let core = &self.core;
        let identity = core.identity()?;
        let public_key = identity.session_id();
        let snode = random_swarm_member(core, public_key).await?;

        let joined = hashes.concat();
        let signature = signing::sign(identity.signing_key(), format!("delete{}", joined).as_bytes());
        let params = json!({
            "pubkey": public_key,
            "pubkey_ed25519": identity.ed25519_public_key_hex(),
            "messages": hashes,
            "signature": signature,
        });

        let response = retry::attempt(RetryPolicy::directory(&core.config), || {
            invoke(core, SnodeEndpoint::DeleteMessage, &snode, Some(public_key), params.clone())
        })
        .await?;

        verify_swarm_deletions(&response, |deleted| {
            format!("{}{}{}", public_key, joined, deleted.concat())
        })
    }

    /// Deletes everything stored for the user across the swarm.
    pub async fn clear_all_data(&self) -> Result<HashMap<String, bool>> {
        let core = &self.core;
        let identity = core.identity()?;
        let public_key = identity.session_id();
        let snode = random_swarm_member(core, public_key).await?;
        let snode = &snode;

        retry::attempt(RetryPolicy::directory(&core.config), move || async move {
            let timestamp = get_network_time(core, snode).await?;
            let params = clear_all_params(identity, timestamp);
            let response = invoke(core, SnodeEndpoint::ClearAllData, snode, None, params).await?;
            verify_swarm_deletions(&response, |deleted| {
                format!("{}{}{}", public_key, timestamp, deleted.concat())
            })
        })
        .await
    }

    /// Resolves an ONS name to a session id, requiring every queried snode to agree.
    pub async fn resolve_ons_name(&self, name: &str) -> Result<String> {
        let core = &self.core;
        let name = name.to_lowercase();
        let name = name.as_str();
        let params = json!({
            "endpoint": "ons_resolve",
            "params": {
                "type": 0,
                "name_hash": STANDARD.encode(ons::name_hash(name)),
            },
        });

        let count = core.config.ons_validation_count;
        let pool = directory::get_pool(core).await?;
        let snodes = pool.into_iter().choose_multiple(&mut rand::thread_rng(), count);
        if snodes.len() < count {
            return Err(RoutingError::InsufficientSnodes);
        }

        let policy = RetryPolicy::directory(&core.config);
        let responses = try_join_all(snodes.iter().map(|snode| {
            let params = params.clone();
            retry::attempt(policy, move || {
                invoke(core, SnodeEndpoint::OxendRequest, snode, None, params.clone())
            })
        }))
        .await?;

        // A single undecryptable answer fails the lookup.
        let session_ids = responses
            .iter()
            .map(|response| parse_ons_response(name, response))
            .collect::<Result<Vec<_>>>()?;

        let mut session_ids = session_ids.into_iter();
        let first = session_ids.next().ok_or(RoutingError::InsufficientSnodes)?;
        if session_ids.any(|other| other != first) {
            warn!("ONS responses for {} didn't match", name);
            return Err(RoutingError::ValidationFailed);
        }
        Ok(first)
    }
}

fn clear_all_params(identity: &UserIdentity, timestamp: i64) -> Value {
    let signature = signing::sign(
        identity.signing_key(),
        format!("delete_all{}", timestamp).as_bytes(),
    );
    json!({
        "pubkey": identity.session_id(),
        "pubkey_ed25519": identity.ed25519_public_key_hex(),
        "timestamp": timestamp,
        "signature": signature,
    })
}

async fn random_swarm_member(core: &Arc<Core>, public_key: &str) -> Result<Snode> {
    let swarm = directory::get_swarm(core, public_key).await?;
    swarm
        .into_iter()
        .choose(&mut rand::thread_rng())
        .ok_or(RoutingError::InsufficientSnodes)
}

pub(crate) async fn invoke(
    core: &Arc<Core>,
    endpoint: SnodeEndpoint,
    snode: &Snode,
    public_key: Option<&str>,
    params: Value,
) -> Result<Bytes> {
    let response = if core.config.use_onion_requests {
        dispatcher::send_to_snode(core, endpoint, &params, snode, public_key).await?
    } else {
        invoke_direct(core, endpoint, &params, snode, public_key).await?
    };
    track_fork_versions(core, &response);
    Ok(response)
}

async fn invoke_direct(
    core: &Arc<Core>,
    endpoint: SnodeEndpoint,
    params: &Value,
    snode: &Snode,
    public_key: Option<&str>,
) -> Result<Bytes> {
    let body = wire::snode_payload(endpoint, params)?;
    let request = HttpRequest::post(snode.url("storage_rpc/v1"), body);
    match core.transport.execute(request).await {
        Ok(response) => Ok(response),
        Err(RoutingError::HttpRequestFailed { status_code, body }) if status_code != 0 => {
            let mapped = directory::handle_error(
                core,
                status_code,
                body.as_ref().map(|b| b.to_vec()),
                snode,
                public_key,
            )
            .await?;
            Err(mapped.unwrap_or(RoutingError::HttpRequestFailed { status_code, body }))
        }
        Err(e) => Err(e),
    }
}

fn track_fork_versions(core: &Core, response: &[u8]) {
    let Ok(json) = serde_json::from_slice::<Value>(response) else {
        return;
    };
    let Some(versions) = json.get("hf").and_then(Value::as_array) else {
        return;
    };
    if let (Some(hardfork), Some(softfork)) = (
        versions.first().and_then(Value::as_i64),
        versions.get(1).and_then(Value::as_i64),
    ) {
        if core
            .queue
            .submit(move |state| state.record_fork_versions(hardfork, softfork))
            .is_err()
        {
            debug!("Work queue closed; dropping fork versions");
        }
    }
}

pub(crate) async fn get_network_time(core: &Arc<Core>, snode: &Snode) -> Result<i64> {
    let response = invoke(core, SnodeEndpoint::GetInfo, snode, None, json!({})).await?;
    let json: Value = serde_json::from_slice(&response)?;
    json.get("timestamp")
        .and_then(Value::as_i64)
        .ok_or_else(|| RoutingError::InvalidResponse("missing timestamp".into()))
}

/// Parses `{"messages": [{"hash", "expiration", "data"}]}`, skipping malformed entries.
pub fn parse_messages(data: &[u8]) -> Result<Vec<ReceivedMessage>> {
    let json: Value = serde_json::from_slice(data)?;
    let Some(messages) = json.get("messages").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    Ok(messages
        .iter()
        .filter_map(|message| {
            let hash = message.get("hash").and_then(Value::as_str)?;
            let data = message.get("data").and_then(Value::as_str)?;
            let data = match STANDARD.decode(data) {
                Ok(data) => data,
                Err(e) => {
                    debug!("Skipping message {} with undecodable data: {}", hash, e);
                    return None;
                }
            };
            Some(ReceivedMessage {
                hash: hash.to_string(),
                expiration_ms: message.get("expiration").and_then(Value::as_i64),
                data,
            })
        })
        .collect())
}

/// Checks each swarm member's signature over `expected_message(deleted_hashes)`.
pub fn verify_swarm_deletions<F>(data: &[u8], expected_message: F) -> Result<HashMap<String, bool>>
where
    F: Fn(&[String]) -> String,
{
    let json: Value = serde_json::from_slice(data)?;
    let swarm = json
        .get("swarm")
        .and_then(Value::as_object)
        .ok_or_else(|| RoutingError::InvalidResponse("missing swarm".into()))?;

    let mut confirmations = HashMap::with_capacity(swarm.len());
    for (snode_key, entry) in swarm {
        if entry.get("failed").and_then(Value::as_bool) == Some(true) {
            let reason = entry.get("reason").and_then(Value::as_str).unwrap_or("unknown");
            let code = entry.get("code").map(Value::to_string).unwrap_or_default();
            warn!("{} failed to delete data: {} ({})", snode_key, reason, code);
            confirmations.insert(snode_key.clone(), false);
            continue;
        }

        let deleted: Vec<String> = entry
            .get("deleted")
            .and_then(Value::as_array)
            .map(|hashes| hashes.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let verified = entry
            .get("signature")
            .and_then(Value::as_str)
            .map_or(false, |signature| {
                signing::verify(snode_key, expected_message(&deleted).as_bytes(), signature).is_ok()
            });
        confirmations.insert(snode_key.clone(), verified);
    }
    Ok(confirmations)
}

/// Decrypts the session id from an `ons_resolve` response.
pub fn parse_ons_response(name: &str, data: &[u8]) -> Result<String> {
    let json: Value = serde_json::from_slice(data)?;
    let result = json
        .get("result")
        .ok_or_else(|| RoutingError::InvalidResponse("missing result".into()))?;
    let encrypted_value = result
        .get("encrypted_value")
        .and_then(Value::as_str)
        .ok_or_else(|| RoutingError::InvalidResponse("missing encrypted_value".into()))?;
    let nonce = result.get("nonce").and_then(Value::as_str);
    ons::decrypt_value(name, encrypted_value, nonce)
}
