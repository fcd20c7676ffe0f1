//! Blind indexing of secret and folder names.
//!
//! A blind index is a deterministic keyed BLAKE2b MAC over the normalized
//! name. It supports equality lookups over encrypted names and is never used
//! to reconstruct the name. Tokens from different projects are not
//! comparable because each project's [`IndexKey`] is distinct.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use blake2::digest::{consts::U32, Mac};
use blake2::Blake2bMac;
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;

use crate::keys::IndexKey;
use vaultline_common::{Error, Result};

/// BLAKE2b personalizations, at most 16 bytes each.
const PERSONA: &[u8] = b"vaultline-bidx1";
const PATH_PERSONA: &[u8] = b"vaultline-pidx1";

/// Normalize a name for indexing: trim surrounding whitespace and lowercase.
pub fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// An opaque blind index token, base64url encoded.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlindIndex(String);

impl BlindIndex {
    /// Wrap a stored token.
    pub fn from_encoded(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The encoded token.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time token comparison.
    pub fn matches(&self, other: &BlindIndex) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl fmt::Debug for BlindIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlindIndex({})", self.0)
    }
}

impl fmt::Display for BlindIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produces blind index tokens under one project's index key.
#[derive(Debug, Clone)]
pub struct BlindIndexer {
    key: IndexKey,
}

impl BlindIndexer {
    /// Create an indexer for the given key.
    pub fn new(key: IndexKey) -> Self {
        Self { key }
    }

    /// Index a name. The name is normalized first.
    ///
    /// # Errors
    /// - Returns `InvalidInput` if the normalized name is empty
    pub fn index(&self, name: &str) -> Result<BlindIndex> {
        let normalized = normalize(name);
        if normalized.is_empty() {
            return Err(Error::InvalidInput("Cannot index an empty name".to_string()));
        }
        self.index_normalized(&normalized)
    }

    /// Index an already-normalized name.
    pub fn index_normalized(&self, normalized: &str) -> Result<BlindIndex> {
        self.mac(PERSONA, normalized.as_bytes())
    }

    /// Index a folder path. Paths are matched exactly, so no normalization
    /// is applied; tokens never collide with name tokens.
    pub fn index_path(&self, path: &str) -> Result<BlindIndex> {
        self.mac(PATH_PERSONA, path.as_bytes())
    }

    fn mac(&self, persona: &[u8], input: &[u8]) -> Result<BlindIndex> {
        let mut mac =
            Blake2bMac::<U32>::new_with_salt_and_personal(self.key.as_bytes(), &[], persona)
                .map_err(|e| Error::Crypto(format!("Blind index key rejected: {}", e)))?;
        mac.update(input);
        let token = mac.finalize().into_bytes();
        Ok(BlindIndex(URL_SAFE_NO_PAD.encode(token)))
    }
}
