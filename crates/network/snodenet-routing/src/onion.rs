//! Onion construction: one encryption layer for the destination and one per hop.

use crate::crypto::aead::{self, EncryptionResult, SymmetricKey};
use crate::error::{Result, RoutingError};
use crate::types::{Destination, OnionPath, Snode};
use crate::wire;
use serde_json::{json, Value};

/// The outermost layer of an onion, ready to send to the guard.
#[derive(Debug, Clone)]
pub struct BuiltOnion {
    pub guard: Snode,
    pub ciphertext: Vec<u8>,
    pub ephemeral_public_key: [u8; 32],
    /// Decrypts the destination's reply. Never leaves the client.
    pub destination_symmetric_key: SymmetricKey,
}

impl BuiltOnion {
    /// Request body for the guard's `onion_req/v2` endpoint.
    pub fn guard_request_body(&self) -> Result<Vec<u8>> {
        wire::encode_envelope(
            &self.ciphertext,
            &json!({ "ephemeral_key": hex::encode(self.ephemeral_public_key) }),
        )
    }
}

/// Innermost layer, readable only by the destination.
pub fn encrypt_for_destination(payload: &[u8], destination: &Destination) -> Result<EncryptionResult> {
    match destination {
        Destination::Snode(snode) => {
            let wrapped = wire::encode_envelope(payload, &json!({ "headers": "" }))?;
            aead::encrypt_for(&wrapped, &snode.x25519_public_key)
        }
        Destination::Server(server) => aead::encrypt_for(payload, &server.x25519_public_key),
    }
}

/// Tells a hop where to forward the layer it just removed.
pub fn routing_metadata(next: &Destination, previous_ephemeral_key: &[u8; 32]) -> Value {
    let ephemeral_key = hex::encode(previous_ephemeral_key);
    match next {
        Destination::Snode(snode) => json!({
            "destination": snode.ed25519_public_key,
            "ephemeral_key": ephemeral_key,
        }),
        Destination::Server(server) => {
            let scheme = server.scheme.clone().unwrap_or_else(|| "https".to_string());
            let port = server
                .port
                .unwrap_or(if scheme == "http" { 80 } else { 443 });
            json!({
                "host": server.host,
                "target": server.target,
                "method": "POST",
                "protocol": scheme,
                "port": port,
                "ephemeral_key": ephemeral_key,
            })
        }
    }
}

/// Wraps `previous` in a layer for `hop`, naming `next` as the forward target.
pub fn encrypt_hop(hop: &Snode, next: &Destination, previous: &EncryptionResult) -> Result<EncryptionResult> {
    let metadata = routing_metadata(next, &previous.ephemeral_public_key);
    let plaintext = wire::encode_envelope(&previous.ciphertext, &metadata)?;
    aead::encrypt_for(&plaintext, &hop.x25519_public_key)
}

/// Builds every layer, walking from the last hop back to the guard.
pub fn build_onion(payload: &[u8], path: &OnionPath, destination: &Destination) -> Result<BuiltOnion> {
    let guard = path.guard().cloned().ok_or(RoutingError::InsufficientSnodes)?;

    let mut layer = encrypt_for_destination(payload, destination)?;
    let destination_symmetric_key = layer.symmetric_key.clone();

    let mut next = destination.clone();
    for hop in path.hops().iter().rev() {
        layer = encrypt_hop(hop, &next, &layer)?;
        next = Destination::Snode(hop.clone());
    }

    Ok(BuiltOnion {
        guard,
        ciphertext: layer.ciphertext,
        ephemeral_public_key: layer.ephemeral_public_key,
        destination_symmetric_key,
    })
}
