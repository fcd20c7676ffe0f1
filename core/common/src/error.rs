//! Error taxonomy shared by every vaultline crate.

use thiserror::Error;

/// Top-level error type for vaultline operations.
///
/// Approval outcomes (pending or denied mutations) are not errors; they are
/// reported through the store's mutation outcome type instead.
#[derive(Debug, Error)]
pub enum Error {
    /// A root key or KMS could not be reached. Retryable.
    #[error("Key unavailable: {0}")]
    KeyUnavailable(String),

    /// Authentication tag verification failed: tamper, corruption, or a
    /// key/version mismatch. Never retried with the same inputs.
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Optimistic concurrency conflict on a version chain. Retryable.
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Cryptographic parameter or primitive misuse (wrong key length, RNG failure).
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Storage backend failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failed operation may succeed if attempted again unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::KeyUnavailable(_) | Error::ConcurrentModification(_))
    }

    /// Message safe to show to a caller without privileged access.
    ///
    /// Never includes ciphertext, key identifiers or backend details.
    pub fn public_message(&self) -> String {
        match self {
            Error::DecryptionFailed(_) | Error::Crypto(_) => "secret unreadable".to_string(),
            Error::KeyUnavailable(_) => "key service temporarily unavailable".to_string(),
            Error::ConcurrentModification(_) => {
                "secret was modified concurrently, retry the request".to_string()
            }
            Error::NotFound(what) => format!("not found: {}", what),
            Error::AlreadyExists(what) => format!("already exists: {}", what),
            Error::InvalidInput(reason) => format!("invalid input: {}", reason),
            Error::Storage(_) | Error::Serialization(_) | Error::Io(_) => {
                "internal storage error".to_string()
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::KeyUnavailable("kms timeout".into()).is_retryable());
        assert!(Error::ConcurrentModification("head moved".into()).is_retryable());
        assert!(!Error::DecryptionFailed("tag mismatch".into()).is_retryable());
        assert!(!Error::NotFound("secret".into()).is_retryable());
    }

    #[test]
    fn test_public_message_hides_crypto_detail() {
        let err = Error::DecryptionFailed("dek 1f2e tag mismatch".into());
        let msg = err.public_message();
        assert_eq!(msg, "secret unreadable");
        assert!(!msg.contains("1f2e"));
    }
}
