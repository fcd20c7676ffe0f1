//! Store configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use vaultline_common::{Error, Result};
use vaultline_keys::HierarchyOptions;

use crate::retry::RetryConfig;

/// Tunables for a [`crate::SecretStore`].
///
/// Every field has a default, so a config file only needs the values it
/// overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Retries after a `ConcurrentModification` before giving up.
    pub max_write_retries: u32,
    /// First backoff delay between write retries.
    pub retry_initial_delay_ms: u64,
    /// Backoff cap.
    pub retry_max_delay_ms: u64,
    /// Upper bound on any single KMS call.
    pub kms_timeout_ms: u64,
    pub root_key_cache_ttl_secs: u64,
    pub root_key_cache_capacity: usize,
    /// How long a retired root key is kept before it may be purged.
    pub root_key_grace_secs: u64,
    /// Commits between folder checkpoints.
    pub checkpoint_window: u64,
    /// Secrets re-encrypted per data key rotation batch.
    pub rotation_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_write_retries: 5,
            retry_initial_delay_ms: 5,
            retry_max_delay_ms: 200,
            kms_timeout_ms: 2000,
            root_key_cache_ttl_secs: 300,
            root_key_cache_capacity: 1024,
            root_key_grace_secs: 86_400,
            checkpoint_window: 100,
            rotation_batch_size: 100,
        }
    }
}

impl StoreConfig {
    /// Check values that would make the store misbehave.
    ///
    /// # Errors
    /// - `InvalidInput` for a zero checkpoint window, batch size, or KMS timeout
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_window == 0 {
            return Err(Error::InvalidInput(
                "checkpoint_window must be at least 1".to_string(),
            ));
        }
        if self.rotation_batch_size == 0 {
            return Err(Error::InvalidInput(
                "rotation_batch_size must be at least 1".to_string(),
            ));
        }
        if self.kms_timeout_ms == 0 {
            return Err(Error::InvalidInput(
                "kms_timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Retry policy for optimistic write conflicts.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_conflicts: self.max_write_retries,
            base_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    /// Options for the key hierarchy.
    pub fn hierarchy_options(&self) -> HierarchyOptions {
        HierarchyOptions {
            kms_timeout: Duration::from_millis(self.kms_timeout_ms),
            cache_ttl: Duration::from_secs(self.root_key_cache_ttl_secs),
            cache_capacity: self.root_key_cache_capacity,
            root_key_grace: Duration::from_secs(self.root_key_grace_secs),
        }
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to bytes for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let config: Self =
            serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.max_write_retries, 5);
        assert_eq!(config.checkpoint_window, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = StoreConfig::from_json(r#"{ "checkpoint_window": 3 }"#).unwrap();
        assert_eq!(config.checkpoint_window, 3);
        assert_eq!(config.kms_timeout_ms, 2000);
    }

    #[test]
    fn test_invalid_window_rejected() {
        let result = StoreConfig::from_json(r#"{ "checkpoint_window": 0 }"#);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_config_serialization() {
        let config = StoreConfig {
            rotation_batch_size: 7,
            ..StoreConfig::default()
        };
        let restored = StoreConfig::from_bytes(&config.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, config);

        let json = config.to_json().unwrap();
        assert_eq!(StoreConfig::from_json(&json).unwrap(), config);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        tokio::fs::write(&path, r#"{ "max_write_retries": 1 }"#)
            .await
            .unwrap();

        let config = StoreConfig::load(&path).await.unwrap();
        assert_eq!(config.max_write_retries, 1);
    }

    #[test]
    fn test_hierarchy_options() {
        let options = StoreConfig::default().hierarchy_options();
        assert_eq!(options.kms_timeout, Duration::from_secs(2));
        assert_eq!(options.root_key_grace, Duration::from_secs(86_400));
    }

    #[test]
    fn test_retry_config_follows_store_config() {
        let config = StoreConfig {
            max_write_retries: 2,
            retry_initial_delay_ms: 7,
            retry_max_delay_ms: 70,
            ..StoreConfig::default()
        };
        let retry = config.retry_config();
        assert_eq!(retry.max_conflicts, 2);
        assert_eq!(retry.window(1), Duration::from_millis(7));
        assert_eq!(retry.window(5), Duration::from_millis(70));
    }
}
