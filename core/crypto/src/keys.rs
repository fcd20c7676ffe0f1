//! Key types with secure memory handling.
//!
//! The envelope hierarchy is: platform master key (or external KMS) seals
//! each organization's [`RootKey`]; a root key wraps project [`DataKey`]s;
//! data keys encrypt secret values and seed the project's [`IndexKey`].
//! All key types zeroize their memory on drop and redact `Debug` output.

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use vaultline_common::{Error, Result};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

macro_rules! key_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Zeroize, ZeroizeOnDrop)]
        pub struct $name {
            key: [u8; KEY_LENGTH],
        }

        impl $name {
            /// Create a key from raw bytes.
            pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
                Self { key }
            }

            /// Create a key from a slice, e.g. freshly unwrapped material.
            ///
            /// # Errors
            /// - Returns error if the slice is not exactly KEY_LENGTH bytes
            pub fn from_slice(bytes: &[u8]) -> Result<Self> {
                if bytes.len() != KEY_LENGTH {
                    return Err(Error::Crypto(format!(
                        "Invalid key length: expected {}, got {}",
                        KEY_LENGTH,
                        bytes.len()
                    )));
                }
                let mut key = [0u8; KEY_LENGTH];
                key.copy_from_slice(bytes);
                Ok(Self { key })
            }

            /// Generate a random key from the OS RNG.
            pub fn generate() -> Self {
                let mut key = [0u8; KEY_LENGTH];
                OsRng.fill_bytes(&mut key);
                Self { key }
            }

            /// Get the key bytes.
            ///
            /// # Security
            /// The returned slice should be used immediately and not stored.
            pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
                &self.key
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "([REDACTED])"))
            }
        }
    };
}

key_type!(
    /// Platform master key used by the in-process KMS to seal root keys.
    PlatformMasterKey
);

key_type!(
    /// Organization root key. Only ever wraps data keys.
    RootKey
);

key_type!(
    /// Project data encryption key (DEK). Encrypts secret values and names.
    DataKey
);

key_type!(
    /// Keyed-hash key for a project's blind index.
    IndexKey
);

impl DataKey {
    /// Derive the blind index key for `project` from this data key.
    ///
    /// Uses keyed blake2b with a domain separation label, so the index key
    /// reveals nothing about the data key and differs per project.
    pub fn derive_index_key(&self, project: &[u8]) -> IndexKey {
        use blake2::digest::consts::U32;
        use blake2::{Blake2b, Digest};

        let mut hasher = Blake2b::<U32>::new();
        hasher.update(&self.key);
        hasher.update((project.len() as u64).to_le_bytes());
        hasher.update(project);
        hasher.update(b"vaultline-blind-index-v1");

        let result = hasher.finalize();
        let mut derived = [0u8; KEY_LENGTH];
        derived.copy_from_slice(&result);
        IndexKey::from_bytes(derived)
    }
}

/// Salt for key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt(pub [u8; 32]);

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        let mut salt = [0u8; 32];
        OsRng.fill_bytes(&mut salt);
        Self(salt)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}
