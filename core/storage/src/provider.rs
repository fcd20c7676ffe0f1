//! Ledger store trait definition.

use async_trait::async_trait;
use std::collections::HashSet;

use vaultline_common::{
    CommitId, DekId, EnvironmentId, Error, FolderId, OrgId, ProjectId, Result,
    RootKeyId, SecretId, VersionId,
};
use vaultline_crypto::BlindIndex;

use crate::records::{
    CheckpointRecord, CommitBatch, CommitRecord, DataKeyRecord, FolderRecord, ProjectKeyring,
    RootKeyRecord, SecretRecord, VersionRecord, VersionWrite,
};

/// Persistence for keys, version chains, commits and checkpoints.
///
/// Implementations must make [`LedgerStore::apply_commit`] atomic: every
/// head check passes and every version, head and the commit are written, or
/// nothing is. Records are never mutated after insertion except head
/// pointers, keyring pointers, root key status and data key wrapping.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    // -- root keys --

    /// Insert a new active root key. With `replaces`, that record (the
    /// organization's current active key, already marked retired) is stored
    /// in the same step.
    ///
    /// # Errors
    /// - `AlreadyExists` if `replaces` is `None` and the organization has an active key
    /// - `ConcurrentModification` if the organization's active key is not `replaces`
    async fn insert_root_key(
        &self,
        record: RootKeyRecord,
        replaces: Option<RootKeyRecord>,
    ) -> Result<()>;

    /// Fetch a root key record.
    ///
    /// # Errors
    /// - `NotFound` if no such key exists (e.g. purged)
    async fn get_root_key(&self, id: &RootKeyId) -> Result<RootKeyRecord>;

    /// The organization's newest active root key, if provisioned.
    async fn active_root_key(&self, org: &OrgId) -> Result<Option<RootKeyRecord>>;

    /// All root keys for an organization, oldest first.
    async fn list_root_keys(&self, org: &OrgId) -> Result<Vec<RootKeyRecord>>;

    /// Delete a root key record.
    async fn delete_root_key(&self, id: &RootKeyId) -> Result<()>;

    // -- data keys --

    /// Insert a wrapped data key.
    async fn insert_data_key(&self, record: DataKeyRecord) -> Result<()>;

    /// Fetch a wrapped data key.
    async fn get_data_key(&self, id: &DekId) -> Result<DataKeyRecord>;

    /// All data keys belonging to an organization.
    async fn list_data_keys(&self, org: &OrgId) -> Result<Vec<DataKeyRecord>>;

    /// Atomically replace the wrapping of several existing data keys.
    async fn rewrap_data_keys(&self, records: Vec<DataKeyRecord>) -> Result<()>;

    // -- keyrings --

    /// Fetch a project's keyring.
    async fn get_keyring(&self, project: &ProjectId) -> Result<Option<ProjectKeyring>>;

    /// Insert a keyring unless one exists; returns whichever keyring is stored.
    async fn insert_keyring(&self, keyring: ProjectKeyring) -> Result<ProjectKeyring>;

    /// Move a project's current data key from `expected` to `new`.
    ///
    /// # Errors
    /// - `ConcurrentModification` if the current key is not `expected`
    async fn set_current_dek(
        &self,
        project: &ProjectId,
        expected: &DekId,
        new: &DekId,
    ) -> Result<ProjectKeyring>;

    // -- folders --

    /// Find a folder by its path's blind index.
    async fn find_folder(
        &self,
        project: &ProjectId,
        environment: &EnvironmentId,
        path_index: &BlindIndex,
    ) -> Result<Option<FolderRecord>>;

    /// Insert a folder unless one exists at that location; returns the stored folder.
    async fn insert_folder(&self, record: FolderRecord) -> Result<FolderRecord>;

    /// Fetch a folder by id.
    async fn get_folder(&self, id: &FolderId) -> Result<FolderRecord>;

    // -- secrets and versions --

    /// Equality lookup of a secret by blind index within a folder.
    async fn find_secret(
        &self,
        folder: &FolderId,
        index: &BlindIndex,
    ) -> Result<Option<SecretRecord>>;

    /// Fetch a secret head.
    async fn get_secret(&self, id: &SecretId) -> Result<SecretRecord>;

    /// All secrets (including deleted) in a folder.
    async fn list_secrets(&self, folder: &FolderId) -> Result<Vec<SecretRecord>>;

    /// All secrets (including deleted) in a project.
    async fn list_project_secrets(&self, project: &ProjectId) -> Result<Vec<SecretRecord>>;

    /// Fetch a version.
    async fn get_version(&self, id: &VersionId) -> Result<VersionRecord>;

    /// A secret's versions in sequence order.
    async fn list_versions(&self, secret: &SecretId) -> Result<Vec<VersionRecord>>;

    // -- commits --

    /// Apply a commit atomically and return it with its assigned sequence.
    ///
    /// # Errors
    /// - `ConcurrentModification` if any expected head does not match
    /// - `InvalidInput` if the batch touches a secret twice or is empty
    async fn apply_commit(&self, batch: CommitBatch) -> Result<CommitRecord>;

    /// Fetch a commit.
    async fn get_commit(&self, id: &CommitId) -> Result<CommitRecord>;

    /// Commits of a folder with `after < seq <= up_to`, ascending.
    async fn list_commits(
        &self,
        folder: &FolderId,
        after: u64,
        up_to: Option<u64>,
    ) -> Result<Vec<CommitRecord>>;

    /// The folder's most recent commit.
    async fn latest_commit(&self, folder: &FolderId) -> Result<Option<CommitRecord>>;

    // -- checkpoints --

    /// Store a materialized folder state.
    async fn insert_checkpoint(&self, checkpoint: CheckpointRecord) -> Result<()>;

    /// The latest checkpoint with `commit_seq <= at_seq`.
    async fn nearest_checkpoint(
        &self,
        folder: &FolderId,
        at_seq: u64,
    ) -> Result<Option<CheckpointRecord>>;
}

/// Validate the shape of a batch before any head is inspected.
/// Check that `active` (the organization's active root keys) is exactly
/// what an insert replacing `replaces` expects.
pub(crate) fn check_root_key_swap(
    org: &OrgId,
    active: &[RootKeyId],
    replaces: Option<&RootKeyRecord>,
) -> Result<()> {
    match replaces {
        None if !active.is_empty() => Err(Error::AlreadyExists(format!(
            "organization {} already has an active root key",
            org
        ))),
        Some(old) if *active != [old.id] => Err(Error::ConcurrentModification(format!(
            "organization {} active root key changed",
            org
        ))),
        _ => Ok(()),
    }
}

pub(crate) fn validate_batch(batch: &CommitBatch) -> Result<()> {
    if batch.writes.is_empty() {
        return Err(Error::InvalidInput("Commit has no changes".to_string()));
    }
    let mut seen = HashSet::new();
    let mut names = HashSet::new();
    for write in &batch.writes {
        if !seen.insert(write.version.secret) {
            return Err(Error::InvalidInput(format!(
                "Secret {} appears twice in one commit",
                write.version.secret
            )));
        }
        if !names.insert(&write.version.blind_index) {
            return Err(Error::InvalidInput(
                "Two secrets in one commit share a name".to_string(),
            ));
        }
    }
    Ok(())
}

/// Compare-and-swap check of one write against the stored head.
///
/// `name_owner` is the secret currently registered under the write's blind
/// index in the target folder, if any.
pub(crate) fn check_write(
    current: Option<&SecretRecord>,
    name_owner: Option<&SecretRecord>,
    write: &VersionWrite,
) -> Result<()> {
    let version = &write.version;
    match (current, write.expected_head) {
        (None, None) => {
            if version.seq != 1 || version.prev.is_some() {
                return Err(Error::InvalidInput(format!(
                    "First version of {} must have seq 1 and no predecessor",
                    version.secret
                )));
            }
            if let Some(owner) = name_owner {
                return Err(Error::ConcurrentModification(format!(
                    "name already registered to secret {}",
                    owner.id
                )));
            }
            Ok(())
        }
        (None, Some(expected)) => Err(Error::ConcurrentModification(format!(
            "secret {} has no head, expected {}",
            version.secret, expected
        ))),
        (Some(secret), None) => Err(Error::ConcurrentModification(format!(
            "secret {} already has head {}",
            secret.id, secret.head
        ))),
        (Some(secret), Some(expected)) => {
            if secret.head != expected {
                return Err(Error::ConcurrentModification(format!(
                    "secret {} head is {}, expected {}",
                    secret.id, secret.head, expected
                )));
            }
            if version.prev != Some(secret.head) || version.seq != secret.head_seq + 1 {
                return Err(Error::InvalidInput(format!(
                    "Version {} does not extend head {} of secret {}",
                    version.id, secret.head, secret.id
                )));
            }
            if let Some(owner) = name_owner {
                if owner.id != secret.id {
                    return Err(Error::ConcurrentModification(format!(
                        "name already registered to secret {}",
                        owner.id
                    )));
                }
            }
            Ok(())
        }
    }
}
