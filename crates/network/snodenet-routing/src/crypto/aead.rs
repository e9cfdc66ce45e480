//! Hop encryption: ephemeral x25519 key agreement, HMAC-SHA256 key derivation
//! and AES-256-GCM with the IV prepended to the ciphertext.

use crate::error::{Result, RoutingError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const IV_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

const KEY_DERIVATION_SALT: &[u8] = b"LOKI";

/// AES-256-GCM key shared with one hop or the destination.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey([REDACTED])")
    }
}

/// Output of one layer of onion encryption.
#[derive(Debug, Clone)]
pub struct EncryptionResult {
    pub ciphertext: Vec<u8>,
    /// Key needed to read the reply; only kept for the destination layer
    pub symmetric_key: SymmetricKey,
    pub ephemeral_public_key: [u8; 32],
}

/// Derives the layer key from an x25519 shared secret.
pub fn derive_symmetric_key(shared_secret: &[u8]) -> Result<SymmetricKey> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(KEY_DERIVATION_SALT)
        .map_err(|e| RoutingError::EncryptionFailed(e.to_string()))?;
    mac.update(shared_secret);
    let digest = mac.finalize().into_bytes();

    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    Ok(SymmetricKey(key))
}

pub fn parse_x25519_public_key(hex_key: &str) -> Result<PublicKey> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| RoutingError::InvalidEncoding(format!("x25519 key: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| RoutingError::InvalidEncoding("x25519 key must be 32 bytes".into()))?;
    Ok(PublicKey::from(bytes))
}

/// Encrypts with a fresh random IV; output is `iv || ciphertext || tag`.
pub fn encrypt(plaintext: &[u8], key: &SymmetricKey) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| RoutingError::EncryptionFailed(e.to_string()))?;

    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| RoutingError::EncryptionFailed("AES-GCM encryption failed".into()))?;

    let mut out = Vec::with_capacity(IV_SIZE + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt(data: &[u8], key: &SymmetricKey) -> Result<Vec<u8>> {
    if data.len() < IV_SIZE + TAG_SIZE {
        return Err(RoutingError::DecryptionFailed);
    }
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| RoutingError::DecryptionFailed)?;
    let (iv, ciphertext) = data.split_at(IV_SIZE);
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| RoutingError::DecryptionFailed)
}

/// Encrypts `plaintext` for the holder of `recipient_x25519`, using a one-time key pair.
pub fn encrypt_for(plaintext: &[u8], recipient_x25519: &str) -> Result<EncryptionResult> {
    let recipient = parse_x25519_public_key(recipient_x25519)?;
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public_key = PublicKey::from(&secret);
    let shared_secret = secret.diffie_hellman(&recipient);

    let symmetric_key = derive_symmetric_key(shared_secret.as_bytes())?;
    let ciphertext = encrypt(plaintext, &symmetric_key)?;

    Ok(EncryptionResult {
        ciphertext,
        symmetric_key,
        ephemeral_public_key: ephemeral_public_key.to_bytes(),
    })
}

/// The receiving side of [`encrypt_for`]. Returns the plaintext and the key
/// used to encrypt the reply.
pub fn decrypt_from(
    ciphertext: &[u8],
    ephemeral_public_key: &[u8; 32],
    recipient: &StaticSecret,
) -> Result<(Vec<u8>, SymmetricKey)> {
    let shared_secret = recipient.diffie_hellman(&PublicKey::from(*ephemeral_public_key));
    let symmetric_key = derive_symmetric_key(shared_secret.as_bytes())?;
    let plaintext = decrypt(ciphertext, &symmetric_key)?;
    Ok((plaintext, symmetric_key))
}
