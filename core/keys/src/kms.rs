//! KMS boundary and the in-process implementation.
//!
//! A KMS seals organization root keys. The hierarchy never sees the KMS's
//! own key material, only opaque sealed blobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vaultline_common::{Error, OrgId, Result, SensitiveBytes};
use vaultline_crypto::{
    decrypt_with_aad, derive_master_key, encrypt_with_aad, KdfParams, PlatformMasterKey, Salt,
    SealedBox,
};

/// External key management service.
#[async_trait]
pub trait KmsClient: Send + Sync {
    /// Identifier stored on every root key this KMS seals.
    fn name(&self) -> &str;

    /// Seal root key material for an organization.
    async fn wrap(&self, org: &OrgId, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Unseal material previously returned by [`KmsClient::wrap`].
    ///
    /// # Errors
    /// - `DecryptionFailed` if the blob was tampered with or sealed for another org
    async fn unwrap(&self, org: &OrgId, ciphertext: &[u8]) -> Result<SensitiveBytes>;
}

fn org_aad(org: &OrgId) -> Vec<u8> {
    let mut aad = b"vaultline-root-key:".to_vec();
    aad.extend_from_slice(org.as_str().as_bytes());
    aad
}

/// In-process KMS holding a platform master key.
///
/// Root keys are sealed with ChaCha20-Poly1305 under the master key, bound to
/// the organization id as associated data.
#[derive(Debug)]
pub struct LocalKms {
    master: PlatformMasterKey,
}

impl LocalKms {
    /// Create a KMS from an existing master key.
    pub fn new(master: PlatformMasterKey) -> Self {
        Self { master }
    }

    /// Derive the master key from a passphrase.
    ///
    /// # Errors
    /// - Empty passphrase
    /// - KDF failure
    pub fn from_passphrase(passphrase: &[u8], salt: &Salt, params: &KdfParams) -> Result<Self> {
        Ok(Self::new(derive_master_key(passphrase, salt, params)?))
    }
}

#[async_trait]
impl KmsClient for LocalKms {
    fn name(&self) -> &str {
        "local"
    }

    async fn wrap(&self, org: &OrgId, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = encrypt_with_aad(self.master.as_bytes(), plaintext, &org_aad(org))?;
        Ok(sealed.to_blob())
    }

    async fn unwrap(&self, org: &OrgId, ciphertext: &[u8]) -> Result<SensitiveBytes> {
        let sealed = SealedBox::from_blob(ciphertext)?;
        let plaintext = decrypt_with_aad(self.master.as_bytes(), &sealed, &org_aad(org))?;
        Ok(SensitiveBytes::new(plaintext))
    }
}

const VERIFICATION_PLAINTEXT: &[u8] = b"VAULTLINE_MASTER_KEY_CHECK_V1";

/// Persisted parameters for a passphrase-derived [`LocalKms`].
///
/// Holds the salt, KDF parameters and a verification blob so that a wrong
/// passphrase is detected up front instead of as a root key unseal failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalKmsManifest {
    pub salt: Salt,
    pub kdf_params: KdfParams,
    pub verification: SealedBox,
    pub created_at: DateTime<Utc>,
}

impl LocalKmsManifest {
    /// Create a manifest for a new passphrase and return the unlocked KMS.
    ///
    /// # Errors
    /// - Empty passphrase
    /// - KDF failure
    pub fn create(passphrase: &[u8], kdf_params: KdfParams) -> Result<(Self, LocalKms)> {
        let salt = Salt::generate();
        let master = derive_master_key(passphrase, &salt, &kdf_params)?;
        let verification = encrypt_with_aad(master.as_bytes(), VERIFICATION_PLAINTEXT, &[])?;
        let manifest = Self {
            salt,
            kdf_params,
            verification,
            created_at: Utc::now(),
        };
        Ok((manifest, LocalKms::new(master)))
    }

    /// Derive the master key and check it against the verification blob.
    ///
    /// # Errors
    /// - `KeyUnavailable` if the passphrase is wrong
    pub fn unlock(&self, passphrase: &[u8]) -> Result<LocalKms> {
        let master = derive_master_key(passphrase, &self.salt, &self.kdf_params)?;
        match decrypt_with_aad(master.as_bytes(), &self.verification, &[]) {
            Ok(plaintext) if plaintext == VERIFICATION_PLAINTEXT => Ok(LocalKms::new(master)),
            Ok(_) | Err(Error::DecryptionFailed(_)) => Err(Error::KeyUnavailable(
                "Invalid master passphrase".to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
