//! Envelope key hierarchy: KMS -> organization root key -> project data key.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use vaultline_common::{
    AuditEvent, AuditKind, AuditTrail, DekId, Error, OrgId, ProjectId, Result, RootKeyId,
    SensitiveBytes,
};
use vaultline_crypto::{
    decrypt_with_aad, encrypt_with_aad, BlindIndexer, DataKey, RootKey, SealedBox,
};
use vaultline_storage::{
    DataKeyRecord, LedgerStore, ProjectKeyring, RootKeyRecord, RootKeyStatus,
};

use crate::cache::RootKeyCache;
use crate::kms::KmsClient;

/// Tunables for [`KeyHierarchy`].
#[derive(Debug, Clone)]
pub struct HierarchyOptions {
    /// Upper bound on any single KMS call.
    pub kms_timeout: Duration,
    /// How long unsealed root keys stay cached.
    pub cache_ttl: Duration,
    /// Maximum number of cached root keys.
    pub cache_capacity: usize,
    /// How long a retired root key is kept after rotation.
    pub root_key_grace: Duration,
}

impl Default for HierarchyOptions {
    fn default() -> Self {
        Self {
            kms_timeout: Duration::from_secs(2),
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 1024,
            root_key_grace: Duration::from_secs(86_400),
        }
    }
}

/// A data key sealed under a root key.
#[derive(Debug, Clone)]
pub struct WrappedDataKey {
    pub root_key: RootKeyId,
    pub sealed: SealedBox,
}

/// Outcome of starting a data key rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataKeyRotationStart {
    pub old_dek: DekId,
    pub new_dek: DekId,
}

fn dek_aad(org: &OrgId, dek: &DekId) -> Vec<u8> {
    let mut aad = b"vaultline-dek:".to_vec();
    aad.extend_from_slice(org.as_str().as_bytes());
    aad.push(0);
    aad.extend_from_slice(dek.as_bytes());
    aad
}

/// Owns every key operation.
///
/// Unwrapped data keys are returned to the caller and never retained. Only
/// root keys are cached, in a [`RootKeyCache`] sized by [`HierarchyOptions`].
pub struct KeyHierarchy {
    store: Arc<dyn LedgerStore>,
    kms: Arc<dyn KmsClient>,
    cache: RootKeyCache,
    audit: Arc<AuditTrail>,
    options: HierarchyOptions,
}

impl KeyHierarchy {
    /// Create a hierarchy over a store and KMS.
    pub fn new(
        store: Arc<dyn LedgerStore>,
        kms: Arc<dyn KmsClient>,
        audit: Arc<AuditTrail>,
        options: HierarchyOptions,
    ) -> Self {
        let cache = RootKeyCache::new(options.cache_capacity, options.cache_ttl);
        Self {
            store,
            kms,
            cache,
            audit,
            options,
        }
    }

    /// The root key cache, for explicit eviction on revocation.
    pub fn cache(&self) -> &RootKeyCache {
        &self.cache
    }

    async fn with_kms_timeout<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.options.kms_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(Error::DecryptionFailed(reason))) => Err(Error::DecryptionFailed(reason)),
            Ok(Err(e)) => Err(Error::KeyUnavailable(format!(
                "KMS '{}' failed: {}",
                self.kms.name(),
                e
            ))),
            Err(_) => Err(Error::KeyUnavailable(format!(
                "KMS '{}' timed out after {:?}",
                self.kms.name(),
                self.options.kms_timeout
            ))),
        }
    }

    async fn seal_root_key(&self, org: &OrgId, key: &RootKey) -> Result<Vec<u8>> {
        self.with_kms_timeout(self.kms.wrap(org, key.as_bytes())).await
    }

    /// Fetch root key material, unsealing through the KMS on a cache miss.
    async fn root_key(&self, org: &OrgId, id: &RootKeyId) -> Result<RootKey> {
        if let Some(key) = self.cache.get(id) {
            return Ok(key);
        }

        let record = self.store.get_root_key(id).await?;
        if &record.org != org {
            return Err(Error::InvalidInput(format!(
                "root key {} does not belong to {}",
                id, org
            )));
        }

        let material: SensitiveBytes = self
            .with_kms_timeout(self.kms.unwrap(org, &record.sealed_material))
            .await?;
        let key = RootKey::from_slice(material.as_bytes())?;
        self.cache.insert(org, *id, key.clone());

        self.audit.emit(AuditEvent::success(AuditKind::RootKeyUnsealed {
            org: org.clone(),
            root_key: *id,
        }));
        debug!(org = %org, root_key = %id, "Root key unsealed");
        Ok(key)
    }

    async fn active_root(&self, org: &OrgId) -> Result<RootKeyRecord> {
        self.store
            .active_root_key(org)
            .await?
            .ok_or_else(|| Error::NotFound(format!("organization {} is not provisioned", org)))
    }

    /// Create an organization's first root key.
    ///
    /// Concurrent callers race on the store's conditional insert; exactly
    /// one wins.
    ///
    /// # Errors
    /// - `AlreadyExists` if the organization already has an active root key
    /// - `KeyUnavailable` if the KMS cannot seal the key
    pub async fn provision_org(&self, org: &OrgId) -> Result<RootKeyId> {
        if self.store.active_root_key(org).await?.is_some() {
            return Err(Error::AlreadyExists(format!("organization {}", org)));
        }
        let id = self.insert_root_key(org, None).await?;
        self.audit
            .emit(AuditEvent::success(AuditKind::RootKeyProvisioned {
                org: org.clone(),
                root_key: id,
            }));
        info!(org = %org, root_key = %id, "Organization provisioned");
        Ok(id)
    }

    /// Seal and store a fresh active root key, retiring `replaces` in the
    /// same store operation.
    async fn insert_root_key(
        &self,
        org: &OrgId,
        replaces: Option<RootKeyRecord>,
    ) -> Result<RootKeyId> {
        let key = RootKey::generate();
        let id = RootKeyId::generate();
        let sealed_material = self.seal_root_key(org, &key).await?;
        let record = RootKeyRecord {
            id,
            org: org.clone(),
            kms: self.kms.name().to_string(),
            sealed_material,
            status: RootKeyStatus::Active,
            created_at: Utc::now(),
        };
        self.store.insert_root_key(record, replaces).await?;
        self.cache.insert(org, id, key);
        Ok(id)
    }

    fn wrap_with_root(
        &self,
        org: &OrgId,
        root: &RootKey,
        dek_id: &DekId,
        dek: &DataKey,
    ) -> Result<SealedBox> {
        encrypt_with_aad(root.as_bytes(), dek.as_bytes(), &dek_aad(org, dek_id))
    }

    /// Wrap a data key under the organization's active root key.
    ///
    /// # Errors
    /// - `NotFound` if the organization has no root key
    /// - `KeyUnavailable` if the root key cannot be unsealed
    pub async fn wrap_data_key(
        &self,
        org: &OrgId,
        project: Option<&ProjectId>,
        dek_id: &DekId,
        dek: &DataKey,
    ) -> Result<WrappedDataKey> {
        let record = self.active_root(org).await?;
        let result = self
            .root_key(org, &record.id)
            .await
            .and_then(|root| self.wrap_with_root(org, &root, dek_id, dek));

        let kind = AuditKind::DataKeyWrapped {
            org: org.clone(),
            project: project.cloned(),
            root_key: record.id,
            dek: *dek_id,
        };
        match result {
            Ok(sealed) => {
                self.audit.emit(AuditEvent::success(kind));
                Ok(WrappedDataKey {
                    root_key: record.id,
                    sealed,
                })
            }
            Err(e) => {
                self.audit.emit(AuditEvent::failure(kind));
                Err(e)
            }
        }
    }

    /// Unwrap a stored data key.
    ///
    /// # Errors
    /// - `DecryptionFailed` if the wrapped key was tampered with
    /// - `KeyUnavailable` if its root key cannot be unsealed
    pub async fn unwrap_data_key(&self, record: &DataKeyRecord) -> Result<DataKey> {
        let result = self
            .root_key(&record.org, &record.root_key)
            .await
            .and_then(|root| open_data_key(&root, record));

        let kind = AuditKind::DataKeyUnwrapped {
            org: record.org.clone(),
            project: Some(record.project.clone()),
            root_key: record.root_key,
            dek: record.id,
        };
        match result {
            Ok(key) => {
                self.audit.emit(AuditEvent::success(kind));
                Ok(key)
            }
            Err(e) => {
                warn!(dek = %record.id, error = %e, "Data key unwrap failed");
                self.audit.emit(AuditEvent::failure(kind));
                Err(e)
            }
        }
    }

    async fn create_data_key(&self, org: &OrgId, project: &ProjectId) -> Result<DekId> {
        let dek_id = DekId::generate();
        let dek = DataKey::generate();
        let wrapped = self.wrap_data_key(org, Some(project), &dek_id, &dek).await?;
        self.store
            .insert_data_key(DataKeyRecord {
                id: dek_id,
                org: org.clone(),
                project: project.clone(),
                root_key: wrapped.root_key,
                wrapped: wrapped.sealed,
                created_at: Utc::now(),
            })
            .await?;
        Ok(dek_id)
    }

    /// Return the project's keyring, creating its first data key if needed.
    ///
    /// Concurrent callers converge on whichever keyring is stored first.
    ///
    /// # Errors
    /// - `InvalidInput` if the project belongs to another organization
    pub async fn ensure_project_keyring(
        &self,
        org: &OrgId,
        project: &ProjectId,
    ) -> Result<ProjectKeyring> {
        if let Some(keyring) = self.store.get_keyring(project).await? {
            return check_owner(keyring, org);
        }

        let dek_id = self.create_data_key(org, project).await?;
        let stored = self
            .store
            .insert_keyring(ProjectKeyring {
                project: project.clone(),
                org: org.clone(),
                current_dek: dek_id,
                index_dek: dek_id,
                updated_at: Utc::now(),
            })
            .await?;
        if stored.current_dek == dek_id {
            info!(org = %org, project = %project, dek = %dek_id, "Project keyring created");
        }
        check_owner(stored, org)
    }

    /// The project's keyring.
    ///
    /// # Errors
    /// - `NotFound` if the project has never been registered
    pub async fn keyring(&self, project: &ProjectId) -> Result<ProjectKeyring> {
        self.store
            .get_keyring(project)
            .await?
            .ok_or_else(|| Error::NotFound(format!("project {}", project)))
    }

    /// Unwrap a data key by id.
    pub async fn data_key(&self, dek_id: &DekId) -> Result<DataKey> {
        let record = self.store.get_data_key(dek_id).await?;
        self.unwrap_data_key(&record).await
    }

    /// The key new writes in `project` are encrypted with.
    pub async fn current_data_key(&self, project: &ProjectId) -> Result<(DekId, DataKey)> {
        let keyring = self.keyring(project).await?;
        let key = self.data_key(&keyring.current_dek).await?;
        Ok((keyring.current_dek, key))
    }

    /// Blind indexer for `project`, seeded from its first data key.
    pub async fn indexer(&self, project: &ProjectId) -> Result<BlindIndexer> {
        let keyring = self.keyring(project).await?;
        let dek = self.data_key(&keyring.index_dek).await?;
        Ok(BlindIndexer::new(
            dek.derive_index_key(project.as_str().as_bytes()),
        ))
    }

    /// Replace the organization's root key and rewrap every data key under it.
    ///
    /// The old key is retired, not deleted; it stays unsealable until
    /// [`KeyHierarchy::purge_retired_root_keys`] runs after the grace window.
    ///
    /// # Errors
    /// - `NotFound` if the organization is not provisioned
    /// - `KeyUnavailable` if the KMS is unreachable
    /// - `ConcurrentModification` if another rotation replaced the key first
    pub async fn rotate_root_key(&self, org: &OrgId) -> Result<RootKeyId> {
        let old = self.active_root(org).await?;
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.options.root_key_grace)
            .map_err(|e| Error::InvalidInput(format!("root key grace out of range: {}", e)))?;
        let mut retired = old.clone();
        retired.status = RootKeyStatus::Retired {
            retired_at: now,
            purge_after: now + grace,
        };
        let new_id = self.insert_root_key(org, Some(retired)).await?;

        let new_root = self.root_key(org, &new_id).await?;
        let mut rewrapped = Vec::new();
        for mut record in self.store.list_data_keys(org).await? {
            if record.root_key == new_id {
                continue;
            }
            let dek = self.unwrap_data_key(&record).await?;
            record.wrapped = self.wrap_with_root(org, &new_root, &record.id, &dek)?;
            record.root_key = new_id;
            self.audit.emit(AuditEvent::success(AuditKind::DataKeyWrapped {
                org: org.clone(),
                project: Some(record.project.clone()),
                root_key: new_id,
                dek: record.id,
            }));
            rewrapped.push(record);
        }
        let count = rewrapped.len();
        if !rewrapped.is_empty() {
            self.store.rewrap_data_keys(rewrapped).await?;
        }
        self.cache.invalidate_key(&old.id);

        self.audit.emit(AuditEvent::success(AuditKind::RootKeyRotated {
            org: org.clone(),
            old_root_key: old.id,
            new_root_key: new_id,
            rewrapped: count,
        }));
        info!(
            org = %org,
            old_root_key = %old.id,
            new_root_key = %new_id,
            rewrapped = count,
            "Root key rotated"
        );
        Ok(new_id)
    }

    /// Delete retired root keys whose grace window has passed and that no
    /// data key still references. Returns the purged ids.
    pub async fn purge_retired_root_keys(
        &self,
        org: &OrgId,
        now: chrono::DateTime<Utc>,
    ) -> Result<Vec<RootKeyId>> {
        let data_keys = self.store.list_data_keys(org).await?;
        let mut purged = Vec::new();
        for record in self.store.list_root_keys(org).await? {
            let RootKeyStatus::Retired { purge_after, .. } = record.status else {
                continue;
            };
            if purge_after > now {
                continue;
            }
            if data_keys.iter().any(|dk| dk.root_key == record.id) {
                warn!(root_key = %record.id, "Retired root key still referenced, not purging");
                continue;
            }
            self.store.delete_root_key(&record.id).await?;
            self.cache.invalidate_key(&record.id);
            self.audit.emit(AuditEvent::success(AuditKind::RootKeyPurged {
                org: org.clone(),
                root_key: record.id,
            }));
            purged.push(record.id);
        }
        Ok(purged)
    }

    /// Create a new data key for `project` and make it current.
    ///
    /// Existing versions keep their data key until the rotation job
    /// re-encrypts them.
    ///
    /// # Errors
    /// - `ConcurrentModification` if another rotation moved the current key first
    pub async fn begin_data_key_rotation(
        &self,
        project: &ProjectId,
    ) -> Result<DataKeyRotationStart> {
        let keyring = self.keyring(project).await?;
        let new_dek = self.create_data_key(&keyring.org, project).await?;
        self.store
            .set_current_dek(project, &keyring.current_dek, &new_dek)
            .await?;

        self.audit
            .emit(AuditEvent::success(AuditKind::DataKeyRotationStarted {
                project: project.clone(),
                old_dek: keyring.current_dek,
                new_dek,
            }));
        info!(project = %project, old_dek = %keyring.current_dek, new_dek = %new_dek, "Data key rotation started");
        Ok(DataKeyRotationStart {
            old_dek: keyring.current_dek,
            new_dek,
        })
    }

    /// Evict every cached root key of an organization, e.g. on revocation.
    pub fn evict_org(&self, org: &OrgId) {
        self.cache.invalidate_org(org);
    }
}

fn open_data_key(root: &RootKey, record: &DataKeyRecord) -> Result<DataKey> {
    let plaintext = SensitiveBytes::new(decrypt_with_aad(
        root.as_bytes(),
        &record.wrapped,
        &dek_aad(&record.org, &record.id),
    )?);
    DataKey::from_slice(plaintext.as_bytes())
}

fn check_owner(keyring: ProjectKeyring, org: &OrgId) -> Result<ProjectKeyring> {
    if &keyring.org != org {
        return Err(Error::InvalidInput(format!(
            "project {} belongs to another organization",
            keyring.project
        )));
    }
    Ok(keyring)
}

impl std::fmt::Debug for KeyHierarchy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyHierarchy")
            .field("store", &self.store.name())
            .field("kms", &self.kms.name())
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::LocalKms;
    use async_trait::async_trait;
    use vaultline_common::MemoryAuditSink;
    use vaultline_crypto::PlatformMasterKey;
    use vaultline_storage::MemoryStore;

    struct Fixture {
        keys: KeyHierarchy,
        store: Arc<MemoryStore>,
        sink: Arc<MemoryAuditSink>,
    }

    fn fixture_with(kms: Arc<dyn KmsClient>, options: HierarchyOptions) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemoryAuditSink::new());
        let keys = KeyHierarchy::new(
            store.clone(),
            kms,
            Arc::new(AuditTrail::new(sink.clone())),
            options,
        );
        Fixture { keys, store, sink }
    }

    fn fixture() -> Fixture {
        fixture_with(
            Arc::new(LocalKms::new(PlatformMasterKey::generate())),
            HierarchyOptions::default(),
        )
    }

    fn org() -> OrgId {
        OrgId::new("acme").unwrap()
    }

    fn project(name: &str) -> ProjectId {
        ProjectId::new(name).unwrap()
    }

    /// KMS that never answers.
    struct StalledKms;

    #[async_trait]
    impl KmsClient for StalledKms {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn wrap(&self, _org: &OrgId, _plaintext: &[u8]) -> Result<Vec<u8>> {
            std::future::pending().await
        }

        async fn unwrap(&self, _org: &OrgId, _ciphertext: &[u8]) -> Result<SensitiveBytes> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_provision_twice_fails() {
        let f = fixture();
        f.keys.provision_org(&org()).await.unwrap();
        assert!(matches!(
            f.keys.provision_org(&org()).await,
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_provisioning_leaves_one_active_key() {
        let f = fixture();
        let (org_a, org_b) = (org(), org());
        let (a, b) = tokio::join!(f.keys.provision_org(&org_a), f.keys.provision_org(&org_b));
        assert!(a.is_ok() ^ b.is_ok());
        assert!(matches!(a.and(b), Err(Error::AlreadyExists(_))));

        let keys = f.store.list_root_keys(&org()).await.unwrap();
        assert_eq!(keys.iter().filter(|k| k.is_active()).count(), 1);
    }

    #[tokio::test]
    async fn test_wrap_unwrap_data_key() {
        let f = fixture();
        f.keys.provision_org(&org()).await.unwrap();
        let keyring = f.keys.ensure_project_keyring(&org(), &project("p1")).await.unwrap();

        let (dek_id, dek) = f.keys.current_data_key(&project("p1")).await.unwrap();
        assert_eq!(dek_id, keyring.current_dek);

        let record = f.store.get_data_key(&dek_id).await.unwrap();
        assert_ne!(record.wrapped.ciphertext.as_slice(), dek.as_bytes());
        let again = f.keys.unwrap_data_key(&record).await.unwrap();
        assert_eq!(again.as_bytes(), dek.as_bytes());
    }

    #[tokio::test]
    async fn test_tampered_wrapped_key_fails() {
        let f = fixture();
        f.keys.provision_org(&org()).await.unwrap();
        let keyring = f.keys.ensure_project_keyring(&org(), &project("p1")).await.unwrap();

        let mut record = f.store.get_data_key(&keyring.current_dek).await.unwrap();
        record.wrapped.ciphertext[0] ^= 0xFF;
        assert!(matches!(
            f.keys.unwrap_data_key(&record).await,
            Err(Error::DecryptionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_keyring_is_idempotent() {
        let f = fixture();
        f.keys.provision_org(&org()).await.unwrap();
        let first = f.keys.ensure_project_keyring(&org(), &project("p1")).await.unwrap();
        let second = f.keys.ensure_project_keyring(&org(), &project("p1")).await.unwrap();
        assert_eq!(first.current_dek, second.current_dek);

        let other = OrgId::new("globex").unwrap();
        assert!(matches!(
            f.keys.ensure_project_keyring(&other, &project("p1")).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_root_rotation_rewraps_and_preserves_keys() {
        let f = fixture();
        let old_root = f.keys.provision_org(&org()).await.unwrap();
        f.keys.ensure_project_keyring(&org(), &project("p1")).await.unwrap();
        f.keys.ensure_project_keyring(&org(), &project("p2")).await.unwrap();
        let (dek_id, before) = f.keys.current_data_key(&project("p1")).await.unwrap();

        let new_root = f.keys.rotate_root_key(&org()).await.unwrap();
        assert_ne!(old_root, new_root);

        for record in f.store.list_data_keys(&org()).await.unwrap() {
            assert_eq!(record.root_key, new_root);
        }
        let after = f.keys.data_key(&dek_id).await.unwrap();
        assert_eq!(before.as_bytes(), after.as_bytes());

        let old = f.store.get_root_key(&old_root).await.unwrap();
        assert!(!old.is_active());

        assert!(f.sink.events().iter().any(|e| matches!(
            e.kind,
            AuditKind::RootKeyRotated { rewrapped: 2, .. }
        )));
    }

    #[tokio::test]
    async fn test_purge_respects_grace_window() {
        let f = fixture();
        let old_root = f.keys.provision_org(&org()).await.unwrap();
        f.keys.ensure_project_keyring(&org(), &project("p1")).await.unwrap();
        f.keys.rotate_root_key(&org()).await.unwrap();

        let purged = f.keys.purge_retired_root_keys(&org(), Utc::now()).await.unwrap();
        assert!(purged.is_empty());

        let later = Utc::now() + chrono::Duration::days(2);
        let purged = f.keys.purge_retired_root_keys(&org(), later).await.unwrap();
        assert_eq!(purged, vec![old_root]);
        assert!(f.store.get_root_key(&old_root).await.is_err());

        // Data keys remain readable under the new root.
        assert!(f.keys.current_data_key(&project("p1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_index_key_stable_across_dek_rotation() {
        let f = fixture();
        f.keys.provision_org(&org()).await.unwrap();
        f.keys.ensure_project_keyring(&org(), &project("p1")).await.unwrap();

        let before = f.keys.indexer(&project("p1")).await.unwrap().index("DB_PASS").unwrap();
        let start = f.keys.begin_data_key_rotation(&project("p1")).await.unwrap();
        assert_ne!(start.old_dek, start.new_dek);
        let after = f.keys.indexer(&project("p1")).await.unwrap().index("DB_PASS").unwrap();
        assert_eq!(before, after);

        let (current, _) = f.keys.current_data_key(&project("p1")).await.unwrap();
        assert_eq!(current, start.new_dek);
    }

    #[tokio::test]
    async fn test_index_tokens_differ_across_projects() {
        let f = fixture();
        f.keys.provision_org(&org()).await.unwrap();
        f.keys.ensure_project_keyring(&org(), &project("p1")).await.unwrap();
        f.keys.ensure_project_keyring(&org(), &project("p2")).await.unwrap();

        let a = f.keys.indexer(&project("p1")).await.unwrap().index("DB_PASS").unwrap();
        let b = f.keys.indexer(&project("p2")).await.unwrap().index("DB_PASS").unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_stalled_kms_times_out_as_key_unavailable() {
        let f = fixture_with(
            Arc::new(StalledKms),
            HierarchyOptions {
                kms_timeout: Duration::from_millis(20),
                ..HierarchyOptions::default()
            },
        );
        assert!(matches!(
            f.keys.provision_org(&org()).await,
            Err(Error::KeyUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_unwrap_is_audited() {
        let f = fixture();
        f.keys.provision_org(&org()).await.unwrap();
        f.keys.ensure_project_keyring(&org(), &project("p1")).await.unwrap();
        f.keys.current_data_key(&project("p1")).await.unwrap();

        let events = f.sink.events();
        assert!(events
            .iter()
            .any(|e| matches!(e.kind, AuditKind::DataKeyWrapped { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e.kind, AuditKind::DataKeyUnwrapped { .. })));
    }
}
