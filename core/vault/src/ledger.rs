//! Append-only commit log over secret version chains.
//!
//! Every mutation becomes one new [`VersionRecord`] per touched secret,
//! grouped into a folder commit that storage applies atomically. Heads only
//! ever move forward; rollback and revert append copies of older content.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use vaultline_common::{
    Actor, CommitId, DekId, Error, FolderId, FolderPath, FolderRef, Result, SecretId,
    SensitiveBytes, VersionId,
};
use vaultline_crypto::{decrypt_with_aad, encrypt_with_aad, BlindIndex, DataKey, SealedBox};
use vaultline_keys::KeyHierarchy;
use vaultline_storage::{
    CheckpointRecord, CommitBatch, CommitRecord, FolderRecord, LedgerStore, SecretRecord,
    VersionOrigin, VersionRecord, VersionWrite,
};

/// Content of a staged version.
pub enum Payload {
    Value(SensitiveBytes),
    /// Deletion marker; stores an encrypted empty value.
    Tombstone,
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Value(_) => write!(f, "Payload::Value([REDACTED])"),
            Payload::Tombstone => write!(f, "Payload::Tombstone"),
        }
    }
}

/// One version to append, not yet encrypted.
#[derive(Debug)]
pub struct Staged {
    pub secret: SecretId,
    /// Head the new version must replace; `None` for a new secret.
    pub head: Option<SecretRecord>,
    /// Plaintext name as supplied by the caller.
    pub name: String,
    pub blind_index: BlindIndex,
    pub payload: Payload,
    pub origin: VersionOrigin,
}

impl Staged {
    /// Stage a version on an existing chain.
    pub fn on(head: SecretRecord, name: String, payload: Payload, origin: VersionOrigin) -> Self {
        Self {
            secret: head.id,
            blind_index: head.blind_index.clone(),
            head: Some(head),
            name,
            payload,
            origin,
        }
    }
}

/// A commit together with the versions it created.
#[derive(Debug, Clone)]
pub struct Appended {
    pub commit: CommitRecord,
    pub versions: Vec<VersionRecord>,
}

fn aad(label: &[u8], row: &[u8; 16], dek: &DekId) -> Vec<u8> {
    let mut aad = Vec::with_capacity(label.len() + 32);
    aad.extend_from_slice(label);
    aad.extend_from_slice(row);
    aad.extend_from_slice(dek.as_bytes());
    aad
}

fn value_aad(version: &VersionId, dek: &DekId) -> Vec<u8> {
    aad(b"vaultline-value:", version.as_bytes(), dek)
}

fn name_aad(version: &VersionId, dek: &DekId) -> Vec<u8> {
    aad(b"vaultline-name:", version.as_bytes(), dek)
}

fn path_aad(folder: &FolderId, dek: &DekId) -> Vec<u8> {
    aad(b"vaultline-path:", folder.as_bytes(), dek)
}

/// Data keys unwrapped for the duration of one operation.
///
/// Dropping the scope zeroizes every key it holds.
pub struct KeyScope<'a> {
    keys: &'a KeyHierarchy,
    unwrapped: HashMap<DekId, DataKey>,
}

impl<'a> KeyScope<'a> {
    pub fn new(keys: &'a KeyHierarchy) -> Self {
        Self {
            keys,
            unwrapped: HashMap::new(),
        }
    }

    async fn data_key(&mut self, id: &DekId) -> Result<&DataKey> {
        if !self.unwrapped.contains_key(id) {
            let key = self.keys.data_key(id).await?;
            self.unwrapped.insert(*id, key);
        }
        self.unwrapped
            .get(id)
            .ok_or_else(|| Error::KeyUnavailable(format!("data key {}", id)))
    }

    /// Decrypt a version's value.
    ///
    /// # Errors
    /// - `DecryptionFailed` if the ciphertext does not verify under its recorded data key
    pub async fn open_value(&mut self, version: &VersionRecord) -> Result<SensitiveBytes> {
        let key = self.data_key(&version.dek).await?;
        let plaintext = decrypt_with_aad(
            key.as_bytes(),
            &version.value,
            &value_aad(&version.id, &version.dek),
        )?;
        Ok(SensitiveBytes::new(plaintext))
    }

    /// Decrypt a version's name.
    pub async fn open_name(&mut self, version: &VersionRecord) -> Result<String> {
        let key = self.data_key(&version.dek).await?;
        let plaintext = decrypt_with_aad(
            key.as_bytes(),
            &version.name,
            &name_aad(&version.id, &version.dek),
        )?;
        String::from_utf8(plaintext)
            .map_err(|_| Error::DecryptionFailed("secret name is not UTF-8".to_string()))
    }

    /// Decrypt a folder's path.
    pub async fn open_path(&mut self, folder: &FolderRecord) -> Result<FolderPath> {
        let key = self.data_key(&folder.path_dek).await?;
        let plaintext = decrypt_with_aad(
            key.as_bytes(),
            &folder.path,
            &path_aad(&folder.id, &folder.path_dek),
        )?;
        let path = String::from_utf8(plaintext)
            .map_err(|_| Error::DecryptionFailed("folder path is not UTF-8".to_string()))?;
        FolderPath::parse(&path)
    }
}

fn seal(key: &DataKey, plaintext: &[u8], aad: &[u8]) -> Result<SealedBox> {
    encrypt_with_aad(key.as_bytes(), plaintext, aad)
}

/// The commit log for all folders of a store.
pub struct CommitLog {
    store: Arc<dyn LedgerStore>,
    keys: Arc<KeyHierarchy>,
    checkpoint_window: u64,
}

impl CommitLog {
    pub fn new(store: Arc<dyn LedgerStore>, keys: Arc<KeyHierarchy>, checkpoint_window: u64) -> Self {
        Self {
            store,
            keys,
            checkpoint_window: checkpoint_window.max(1),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// A fresh key scope for one operation.
    pub fn scope(&self) -> KeyScope<'_> {
        KeyScope::new(&self.keys)
    }

    async fn path_index(&self, folder: &FolderRef) -> Result<BlindIndex> {
        self.keys
            .indexer(&folder.project)
            .await?
            .index_path(&folder.path.to_string_path())
    }

    /// Find a folder without creating it.
    pub async fn find_folder(&self, folder: &FolderRef) -> Result<Option<FolderRecord>> {
        let path_index = self.path_index(folder).await?;
        self.store
            .find_folder(&folder.project, &folder.environment, &path_index)
            .await
    }

    /// Find or create a folder. A new folder's path is sealed under the
    /// project's current data key.
    pub async fn ensure_folder(&self, folder: &FolderRef) -> Result<FolderRecord> {
        let path_index = self.path_index(folder).await?;
        if let Some(existing) = self
            .store
            .find_folder(&folder.project, &folder.environment, &path_index)
            .await?
        {
            return Ok(existing);
        }

        let id = FolderId::generate();
        let (dek, key) = self.keys.current_data_key(&folder.project).await?;
        let path = seal(
            &key,
            folder.path.to_string_path().as_bytes(),
            &path_aad(&id, &dek),
        )?;
        self.store
            .insert_folder(FolderRecord {
                id,
                project: folder.project.clone(),
                environment: folder.environment.clone(),
                path_index,
                path,
                path_dek: dek,
                created_at: Utc::now(),
            })
            .await
    }

    /// Encrypt staged versions under the project's current data key and
    /// apply them as one commit.
    ///
    /// # Errors
    /// - `ConcurrentModification` if any staged head is stale; nothing is written
    /// - `KeyUnavailable` if the data key cannot be unwrapped
    pub async fn append(
        &self,
        folder: &FolderRecord,
        staged: Vec<Staged>,
        actor: &Actor,
        message: Option<String>,
    ) -> Result<Appended> {
        let (dek_id, dek) = self.keys.current_data_key(&folder.project).await?;
        let now = Utc::now();

        let mut writes = Vec::with_capacity(staged.len());
        for entry in staged {
            let id = VersionId::generate();
            let (value, tombstone) = match &entry.payload {
                Payload::Value(value) => (value.as_bytes(), false),
                Payload::Tombstone => (&[][..], true),
            };
            let version = VersionRecord {
                id,
                secret: entry.secret,
                project: folder.project.clone(),
                seq: entry.head.as_ref().map_or(1, |h| h.head_seq + 1),
                prev: entry.head.as_ref().map(|h| h.head),
                value: seal(&dek, value, &value_aad(&id, &dek_id))?,
                name: seal(&dek, entry.name.as_bytes(), &name_aad(&id, &dek_id))?,
                dek: dek_id,
                blind_index: entry.blind_index,
                actor: actor.clone(),
                created_at: now,
                tombstone,
                origin: entry.origin,
            };
            writes.push(VersionWrite {
                expected_head: version.prev,
                version,
            });
        }
        drop(dek);

        let versions: Vec<VersionRecord> = writes.iter().map(|w| w.version.clone()).collect();
        let commit = self
            .store
            .apply_commit(CommitBatch {
                id: CommitId::generate(),
                folder: folder.id,
                writes,
                actor: actor.clone(),
                message,
                created_at: now,
            })
            .await?;
        debug!(
            folder = %folder.id,
            commit = %commit.id,
            seq = commit.seq,
            versions = versions.len(),
            "Commit appended"
        );

        if let Err(e) = self.maybe_checkpoint(&commit).await {
            warn!(folder = %folder.id, seq = commit.seq, error = %e, "Checkpoint failed");
        }

        Ok(Appended { commit, versions })
    }

    /// Append a new version whose content equals `target`.
    ///
    /// The head is never repointed; history keeps both the pre-rollback
    /// chain and the rollback version.
    ///
    /// # Errors
    /// - `InvalidInput` if `target` belongs to another secret or is a deletion marker
    /// - `DecryptionFailed` if `target` cannot be decrypted
    pub async fn rollback(
        &self,
        folder: &FolderRecord,
        head: SecretRecord,
        target: &VersionId,
        actor: &Actor,
    ) -> Result<Appended> {
        let target = self.store.get_version(target).await?;
        if target.secret != head.id {
            return Err(Error::InvalidInput(format!(
                "version {} does not belong to secret {}",
                target.id, head.id
            )));
        }
        if target.tombstone {
            return Err(Error::InvalidInput(format!(
                "version {} is a deletion marker",
                target.id
            )));
        }

        let mut scope = self.scope();
        let value = scope.open_value(&target).await?;
        let name = scope.open_name(&target).await?;
        drop(scope);

        let origin = VersionOrigin::Rollback {
            from: Some(head.head),
            to: target.id,
        };
        let staged = Staged::on(head, name, Payload::Value(value), origin);
        self.append(folder, vec![staged], actor, None).await
    }

    async fn maybe_checkpoint(&self, commit: &CommitRecord) -> Result<()> {
        let last = self
            .store
            .nearest_checkpoint(&commit.folder, commit.seq)
            .await?
            .map_or(0, |c| c.commit_seq);
        if commit.seq - last < self.checkpoint_window {
            return Ok(());
        }
        let state = self.state_at(&commit.folder, commit.seq).await?;
        self.store
            .insert_checkpoint(CheckpointRecord {
                folder: commit.folder,
                commit: commit.id,
                commit_seq: commit.seq,
                state,
                created_at: Utc::now(),
            })
            .await?;
        debug!(folder = %commit.folder, seq = commit.seq, "Checkpoint stored");
        Ok(())
    }
}

impl std::fmt::Debug for CommitLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitLog")
            .field("store", &self.store.name())
            .field("checkpoint_window", &self.checkpoint_window)
            .finish()
    }
}
