//! Name service hashing and value decryption.

use crate::error::{Result, RoutingError};
use argon2::{Algorithm, Argon2, Params, Version};
use blake2::digest::consts::U32;
use blake2::digest::{Digest, Mac};
use blake2::{Blake2b, Blake2bMac};
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use crypto_secretbox::XSalsa20Poly1305;

type Blake2b256 = Blake2b<U32>;
type Blake2bMac256 = Blake2bMac<U32>;

/// Byte length of a decrypted session id (type prefix + x25519 key).
pub const SESSION_ID_SIZE: usize = 33;

const XCHACHA_TAG_SIZE: usize = 16;
const XCHACHA_NONCE_SIZE: usize = 24;

// libsodium crypto_pwhash "moderate" limits
const LEGACY_OPS_LIMIT: u32 = 3;
const LEGACY_MEM_LIMIT_KIB: u32 = 256 * 1024;
const LEGACY_SALT: [u8; 16] = [0u8; 16];
const LEGACY_NONCE: [u8; 24] = [0u8; 24];

/// BLAKE2b-256 of the lower-cased name.
pub fn name_hash(name: &str) -> [u8; 32] {
    let digest = <Blake2b256 as Digest>::digest(name.to_lowercase().as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// BLAKE2b-256 of the name keyed with its own hash.
fn value_key(name: &str) -> Result<[u8; 32]> {
    let name = name.to_lowercase();
    let hash = name_hash(&name);
    let mut mac = Blake2bMac256::new_with_salt_and_personal(&hash, &[], &[])
        .map_err(|_| RoutingError::HashingFailed)?;
    Mac::update(&mut mac, name.as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// Argon2id key for values registered before HF16.
fn legacy_value_key(name: &str) -> Result<[u8; 32]> {
    let params = Params::new(LEGACY_MEM_LIMIT_KIB, LEGACY_OPS_LIMIT, 1, Some(32))
        .map_err(|_| RoutingError::HashingFailed)?;
    let mut key = [0u8; 32];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(name.to_lowercase().as_bytes(), &LEGACY_SALT, &mut key)
        .map_err(|_| RoutingError::HashingFailed)?;
    Ok(key)
}

/// Decrypts a resolved value into a hex session id.
///
/// Values without a nonce use the pre-HF16 scheme: an Argon2id key and a
/// secretbox under an all-zero nonce.
pub fn decrypt_value(name: &str, ciphertext_hex: &str, nonce_hex: Option<&str>) -> Result<String> {
    let ciphertext = hex::decode(ciphertext_hex)
        .map_err(|e| RoutingError::InvalidEncoding(format!("encrypted_value: {}", e)))?;

    let Some(nonce_hex) = nonce_hex else {
        let key = legacy_value_key(name)?;
        let cipher = XSalsa20Poly1305::new(GenericArray::from_slice(&key));
        let plaintext = cipher
            .decrypt(GenericArray::from_slice(&LEGACY_NONCE), ciphertext.as_slice())
            .map_err(|_| RoutingError::DecryptionFailed)?;
        return Ok(hex::encode(plaintext));
    };

    let nonce = hex::decode(nonce_hex)
        .map_err(|e| RoutingError::InvalidEncoding(format!("nonce: {}", e)))?;
    if ciphertext.len() < SESSION_ID_SIZE + XCHACHA_TAG_SIZE || nonce.len() != XCHACHA_NONCE_SIZE {
        return Err(RoutingError::DecryptionFailed);
    }

    let key = value_key(name)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let plaintext = cipher
        .decrypt(XNonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| RoutingError::DecryptionFailed)?;

    Ok(hex::encode(plaintext))
}

/// Produces `(ciphertext_hex, nonce_hex)` the way a name registration stores it.
pub fn encrypt_value(name: &str, session_id: &[u8], nonce: &[u8; XCHACHA_NONCE_SIZE]) -> Result<(String, String)> {
    let key = value_key(name)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(nonce), session_id)
        .map_err(|_| RoutingError::EncryptionFailed("xchacha20poly1305".into()))?;
    Ok((hex::encode(ciphertext), hex::encode(nonce)))
}

/// Pre-HF16 counterpart of [`encrypt_value`]; the result carries no nonce.
pub fn encrypt_legacy_value(name: &str, session_id: &[u8]) -> Result<String> {
    let key = legacy_value_key(name)?;
    let cipher = XSalsa20Poly1305::new(GenericArray::from_slice(&key));
    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&LEGACY_NONCE), session_id)
        .map_err(|_| RoutingError::EncryptionFailed("xsalsa20poly1305".into()))?;
    Ok(hex::encode(ciphertext))
}
