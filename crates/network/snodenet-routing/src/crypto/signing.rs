//! ed25519 request signatures and swarm response verification.

use crate::error::{Result, RoutingError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// Signs `message` and returns the base64 signature sent to storage servers.
pub fn sign(key: &SigningKey, message: &[u8]) -> String {
    STANDARD.encode(key.sign(message).to_bytes())
}

/// Checks a base64 signature made by the hex encoded ed25519 key.
pub fn verify(public_key_hex: &str, message: &[u8], signature_b64: &str) -> Result<()> {
    let key_bytes: [u8; 32] = hex::decode(public_key_hex)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(RoutingError::SignatureVerificationFailed)?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| RoutingError::SignatureVerificationFailed)?;

    let signature_bytes: [u8; 64] = STANDARD
        .decode(signature_b64)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(RoutingError::SignatureVerificationFailed)?;

    key.verify(message, &Signature::from_bytes(&signature_bytes))
        .map_err(|_| RoutingError::SignatureVerificationFailed)
}
