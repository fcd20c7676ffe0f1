//! In-memory ledger store for tests and ephemeral deployments.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use vaultline_common::{
    CommitId, DekId, EnvironmentId, Error, FolderId, OrgId, ProjectId, Result,
    RootKeyId, SecretId, VersionId,
};
use vaultline_crypto::BlindIndex;

use crate::provider::{check_root_key_swap, check_write, validate_batch, LedgerStore};
use crate::records::{
    CheckpointRecord, CommitBatch, CommitRecord, DataKeyRecord, FolderRecord, ProjectKeyring,
    RootKeyRecord, SecretRecord, VersionRecord,
};

type FolderKey = (ProjectId, EnvironmentId, BlindIndex);

#[derive(Default)]
struct Inner {
    root_keys: HashMap<RootKeyId, RootKeyRecord>,
    data_keys: HashMap<DekId, DataKeyRecord>,
    keyrings: HashMap<ProjectId, ProjectKeyring>,
    folders: HashMap<FolderId, FolderRecord>,
    folder_index: HashMap<FolderKey, FolderId>,
    secrets: HashMap<SecretId, SecretRecord>,
    name_index: HashMap<(FolderId, BlindIndex), SecretId>,
    versions: HashMap<VersionId, VersionRecord>,
    chains: HashMap<SecretId, Vec<VersionId>>,
    commits: HashMap<CommitId, CommitRecord>,
    folder_commits: HashMap<FolderId, Vec<CommitId>>,
    checkpoints: HashMap<FolderId, Vec<CheckpointRecord>>,
}

/// In-memory ledger store.
///
/// All data is stored in memory and lost on drop. A single lock guards the
/// whole state, which makes every commit trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert_root_key(
        &self,
        record: RootKeyRecord,
        replaces: Option<RootKeyRecord>,
    ) -> Result<()> {
        let mut inner = self.write()?;
        if inner.root_keys.contains_key(&record.id) {
            return Err(Error::AlreadyExists(format!("root key {}", record.id)));
        }
        let active: Vec<RootKeyId> = inner
            .root_keys
            .values()
            .filter(|k| k.org == record.org && k.is_active())
            .map(|k| k.id)
            .collect();
        check_root_key_swap(&record.org, &active, replaces.as_ref())?;
        if let Some(old) = replaces {
            inner.root_keys.insert(old.id, old);
        }
        inner.root_keys.insert(record.id, record);
        Ok(())
    }

    async fn get_root_key(&self, id: &RootKeyId) -> Result<RootKeyRecord> {
        self.read()?
            .root_keys
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("root key {}", id)))
    }

    async fn active_root_key(&self, org: &OrgId) -> Result<Option<RootKeyRecord>> {
        Ok(self
            .read()?
            .root_keys
            .values()
            .filter(|k| &k.org == org && k.is_active())
            .max_by_key(|k| k.created_at)
            .cloned())
    }

    async fn list_root_keys(&self, org: &OrgId) -> Result<Vec<RootKeyRecord>> {
        let mut keys: Vec<RootKeyRecord> = self
            .read()?
            .root_keys
            .values()
            .filter(|k| &k.org == org)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }

    async fn delete_root_key(&self, id: &RootKeyId) -> Result<()> {
        self.write()?
            .root_keys
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("root key {}", id)))
    }

    async fn insert_data_key(&self, record: DataKeyRecord) -> Result<()> {
        let mut inner = self.write()?;
        if inner.data_keys.contains_key(&record.id) {
            return Err(Error::AlreadyExists(format!("data key {}", record.id)));
        }
        inner.data_keys.insert(record.id, record);
        Ok(())
    }

    async fn get_data_key(&self, id: &DekId) -> Result<DataKeyRecord> {
        self.read()?
            .data_keys
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("data key {}", id)))
    }

    async fn list_data_keys(&self, org: &OrgId) -> Result<Vec<DataKeyRecord>> {
        let mut keys: Vec<DataKeyRecord> = self
            .read()?
            .data_keys
            .values()
            .filter(|k| &k.org == org)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }

    async fn rewrap_data_keys(&self, records: Vec<DataKeyRecord>) -> Result<()> {
        let mut inner = self.write()?;
        if let Some(missing) = records.iter().find(|r| !inner.data_keys.contains_key(&r.id)) {
            return Err(Error::NotFound(format!("data key {}", missing.id)));
        }
        for record in records {
            inner.data_keys.insert(record.id, record);
        }
        Ok(())
    }

    async fn get_keyring(&self, project: &ProjectId) -> Result<Option<ProjectKeyring>> {
        Ok(self.read()?.keyrings.get(project).cloned())
    }

    async fn insert_keyring(&self, keyring: ProjectKeyring) -> Result<ProjectKeyring> {
        let mut inner = self.write()?;
        Ok(inner
            .keyrings
            .entry(keyring.project.clone())
            .or_insert(keyring)
            .clone())
    }

    async fn set_current_dek(
        &self,
        project: &ProjectId,
        expected: &DekId,
        new: &DekId,
    ) -> Result<ProjectKeyring> {
        let mut inner = self.write()?;
        let keyring = inner
            .keyrings
            .get_mut(project)
            .ok_or_else(|| Error::NotFound(format!("keyring for project {}", project)))?;
        if &keyring.current_dek != expected {
            return Err(Error::ConcurrentModification(format!(
                "project {} current data key changed",
                project
            )));
        }
        keyring.current_dek = *new;
        keyring.updated_at = Utc::now();
        Ok(keyring.clone())
    }

    async fn find_folder(
        &self,
        project: &ProjectId,
        environment: &EnvironmentId,
        path_index: &BlindIndex,
    ) -> Result<Option<FolderRecord>> {
        let inner = self.read()?;
        let key = (project.clone(), environment.clone(), path_index.clone());
        Ok(inner
            .folder_index
            .get(&key)
            .and_then(|id| inner.folders.get(id))
            .cloned())
    }

    async fn insert_folder(&self, record: FolderRecord) -> Result<FolderRecord> {
        let mut inner = self.write()?;
        let key = (
            record.project.clone(),
            record.environment.clone(),
            record.path_index.clone(),
        );
        if let Some(existing) = inner.folder_index.get(&key).and_then(|id| inner.folders.get(id)) {
            return Ok(existing.clone());
        }
        inner.folder_index.insert(key, record.id);
        inner.folders.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_folder(&self, id: &FolderId) -> Result<FolderRecord> {
        self.read()?
            .folders
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("folder {}", id)))
    }

    async fn find_secret(
        &self,
        folder: &FolderId,
        index: &BlindIndex,
    ) -> Result<Option<SecretRecord>> {
        let inner = self.read()?;
        Ok(inner
            .name_index
            .get(&(*folder, index.clone()))
            .and_then(|id| inner.secrets.get(id))
            .cloned())
    }

    async fn get_secret(&self, id: &SecretId) -> Result<SecretRecord> {
        self.read()?
            .secrets
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("secret {}", id)))
    }

    async fn list_secrets(&self, folder: &FolderId) -> Result<Vec<SecretRecord>> {
        let mut secrets: Vec<SecretRecord> = self
            .read()?
            .secrets
            .values()
            .filter(|s| &s.folder == folder)
            .cloned()
            .collect();
        secrets.sort_by_key(|s| (s.created_at, s.id));
        Ok(secrets)
    }

    async fn list_project_secrets(&self, project: &ProjectId) -> Result<Vec<SecretRecord>> {
        let mut secrets: Vec<SecretRecord> = self
            .read()?
            .secrets
            .values()
            .filter(|s| &s.project == project)
            .cloned()
            .collect();
        secrets.sort_by_key(|s| (s.created_at, s.id));
        Ok(secrets)
    }

    async fn get_version(&self, id: &VersionId) -> Result<VersionRecord> {
        self.read()?
            .versions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("version {}", id)))
    }

    async fn list_versions(&self, secret: &SecretId) -> Result<Vec<VersionRecord>> {
        let inner = self.read()?;
        let chain = inner
            .chains
            .get(secret)
            .ok_or_else(|| Error::NotFound(format!("secret {}", secret)))?;
        chain
            .iter()
            .map(|id| {
                inner
                    .versions
                    .get(id)
                    .cloned()
                    .ok_or_else(|| Error::Storage(format!("dangling version {}", id)))
            })
            .collect()
    }

    async fn apply_commit(&self, batch: CommitBatch) -> Result<CommitRecord> {
        validate_batch(&batch)?;
        let mut inner = self.write()?;

        if !inner.folders.contains_key(&batch.folder) {
            return Err(Error::NotFound(format!("folder {}", batch.folder)));
        }

        for write in &batch.writes {
            let current = inner.secrets.get(&write.version.secret);
            let name_owner = inner
                .name_index
                .get(&(batch.folder, write.version.blind_index.clone()))
                .and_then(|id| inner.secrets.get(id));
            check_write(current, name_owner, write)?;
        }

        // All checks passed; nothing below can fail.
        for write in &batch.writes {
            let version = write.version.clone();
            match inner.secrets.get_mut(&version.secret) {
                Some(secret) => secret.advance(&version),
                None => {
                    let secret = SecretRecord::from_first_version(&version, batch.folder);
                    inner
                        .name_index
                        .insert((batch.folder, secret.blind_index.clone()), secret.id);
                    inner.secrets.insert(secret.id, secret);
                }
            }
            inner
                .chains
                .entry(version.secret)
                .or_default()
                .push(version.id);
            inner.versions.insert(version.id, version);
        }

        let commits = inner.folder_commits.entry(batch.folder).or_default();
        let seq = commits.len() as u64 + 1;
        commits.push(batch.id);
        let record = batch.into_record(seq);
        inner.commits.insert(record.id, record.clone());

        Ok(record)
    }

    async fn get_commit(&self, id: &CommitId) -> Result<CommitRecord> {
        self.read()?
            .commits
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("commit {}", id)))
    }

    async fn list_commits(
        &self,
        folder: &FolderId,
        after: u64,
        up_to: Option<u64>,
    ) -> Result<Vec<CommitRecord>> {
        let inner = self.read()?;
        let Some(ids) = inner.folder_commits.get(folder) else {
            return Ok(Vec::new());
        };
        ids.iter()
            .filter_map(|id| inner.commits.get(id))
            .filter(|c| c.seq > after && up_to.map_or(true, |max| c.seq <= max))
            .map(|c| Ok(c.clone()))
            .collect()
    }

    async fn latest_commit(&self, folder: &FolderId) -> Result<Option<CommitRecord>> {
        let inner = self.read()?;
        Ok(inner
            .folder_commits
            .get(folder)
            .and_then(|ids| ids.last())
            .and_then(|id| inner.commits.get(id))
            .cloned())
    }

    async fn insert_checkpoint(&self, checkpoint: CheckpointRecord) -> Result<()> {
        let mut inner = self.write()?;
        let list = inner.checkpoints.entry(checkpoint.folder).or_default();
        if list.iter().any(|c| c.commit_seq == checkpoint.commit_seq) {
            return Ok(());
        }
        list.push(checkpoint);
        list.sort_by_key(|c| c.commit_seq);
        Ok(())
    }

    async fn nearest_checkpoint(
        &self,
        folder: &FolderId,
        at_seq: u64,
    ) -> Result<Option<CheckpointRecord>> {
        Ok(self.read()?.checkpoints.get(folder).and_then(|list| {
            list.iter()
                .rev()
                .find(|c| c.commit_seq <= at_seq)
                .cloned()
        }))
    }
}
