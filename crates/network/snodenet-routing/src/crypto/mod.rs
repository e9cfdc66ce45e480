//! Cryptographic primitives for onion layers, name resolution and request signing.

pub mod aead;
pub mod ons;
pub mod signing;

pub use aead::{decrypt, decrypt_from, encrypt, encrypt_for, EncryptionResult, SymmetricKey};
