//! Authenticated encryption using ChaCha20-Poly1305.
//!
//! Every call draws a fresh 96-bit nonce from the OS RNG. The 128-bit
//! authentication tag is kept detached so the persisted layout can store
//! ciphertext, nonce and tag as separate fields.

use chacha20poly1305::{
    aead::{AeadCore, AeadInPlace, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::keys::KEY_LENGTH;
use vaultline_common::{Error, Result};

/// Nonce size for ChaCha20-Poly1305 (12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Output of one encryption: ciphertext plus its nonce and detached tag.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
    pub tag: [u8; TAG_SIZE],
}

impl SealedBox {
    /// Concatenate as nonce || ciphertext || tag, for opaque blob storage.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len() + TAG_SIZE);
        blob.extend_from_slice(&self.nonce);
        blob.extend_from_slice(&self.ciphertext);
        blob.extend_from_slice(&self.tag);
        blob
    }

    /// Split a blob produced by [`SealedBox::to_blob`].
    ///
    /// # Errors
    /// - Returns `DecryptionFailed` if the blob is too short to hold a nonce and tag
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::DecryptionFailed("Sealed blob too short".to_string()));
        }
        let (nonce, rest) = blob.split_at(NONCE_SIZE);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);

        let mut nonce_arr = [0u8; NONCE_SIZE];
        nonce_arr.copy_from_slice(nonce);
        let mut tag_arr = [0u8; TAG_SIZE];
        tag_arr.copy_from_slice(tag);

        Ok(Self {
            ciphertext: ciphertext.to_vec(),
            nonce: nonce_arr,
            tag: tag_arr,
        })
    }
}

impl fmt::Debug for SealedBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealedBox([{} bytes])", self.ciphertext.len())
    }
}

fn cipher_for(key: &[u8]) -> Result<ChaCha20Poly1305> {
    if key.len() != KEY_LENGTH {
        return Err(Error::Crypto(format!(
            "Invalid key length: expected {}, got {}",
            KEY_LENGTH,
            key.len()
        )));
    }
    Ok(ChaCha20Poly1305::new(Key::from_slice(key)))
}

/// Encrypt plaintext using ChaCha20-Poly1305.
///
/// # Preconditions
/// - `key` must be exactly KEY_LENGTH bytes
///
/// # Postconditions
/// - The nonce is freshly random for this call
/// - `ciphertext.len() == plaintext.len()`
///
/// # Errors
/// - Returns error if key length is incorrect
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<SealedBox> {
    encrypt_with_aad(key, plaintext, &[])
}

/// Decrypt a [`SealedBox`] using ChaCha20-Poly1305.
///
/// # Errors
/// - Returns `Crypto` if key length is incorrect
/// - Returns `DecryptionFailed` if the tag does not verify (tamper or wrong key)
pub fn decrypt(key: &[u8], sealed: &SealedBox) -> Result<Vec<u8>> {
    decrypt_with_aad(key, sealed, &[])
}

/// Encrypt and bind the ciphertext to `aad`.
///
/// The same `aad` must be presented on decryption; this ties a ciphertext to
/// the record it was written for so rows cannot be swapped undetected.
pub fn encrypt_with_aad(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<SealedBox> {
    let cipher = cipher_for(key)?;
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&nonce, aad, &mut buffer)
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    let mut nonce_arr = [0u8; NONCE_SIZE];
    nonce_arr.copy_from_slice(&nonce);
    let mut tag_arr = [0u8; TAG_SIZE];
    tag_arr.copy_from_slice(&tag);

    Ok(SealedBox {
        ciphertext: buffer,
        nonce: nonce_arr,
        tag: tag_arr,
    })
}

/// Decrypt a [`SealedBox`] that was bound to `aad`.
pub fn decrypt_with_aad(key: &[u8], sealed: &SealedBox, aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;

    let mut buffer = sealed.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&sealed.nonce),
            aad,
            &mut buffer,
            Tag::from_slice(&sealed.tag),
        )
        .map_err(|_| Error::DecryptionFailed("Authentication tag mismatch".to_string()))?;

    Ok(buffer)
}
