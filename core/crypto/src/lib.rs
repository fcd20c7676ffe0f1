//! Cryptographic primitives for vaultline.
//!
//! This module provides:
//! - Authenticated encryption using ChaCha20-Poly1305 (96-bit nonces, detached tags)
//! - Key types for the envelope hierarchy with automatic zeroization
//! - Argon2id derivation of the platform master key
//! - Blind indexing for equality search over encrypted names
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext, nonce or key material is ever logged
//! - Constant-time comparison of blind index tokens

pub mod aead;
pub mod blind;
pub mod kdf;
pub mod keys;

pub use aead::{decrypt, decrypt_with_aad, encrypt, encrypt_with_aad, SealedBox};
pub use blind::{normalize, BlindIndex, BlindIndexer};
pub use kdf::{derive_master_key, KdfParams};
pub use keys::{DataKey, IndexKey, PlatformMasterKey, RootKey, Salt, KEY_LENGTH};
