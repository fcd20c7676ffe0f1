//! Versioned secret store.
//!
//! Every mutation follows the same path: ask the [`MutationGate`], then
//! resolve the head, encrypt, and append one commit, retrying the whole
//! attempt on `ConcurrentModification`. A denied or deferred mutation
//! returns before anything is encrypted or written.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use vaultline_common::{
    Actor, AuditEvent, AuditKind, AuditOutcome, AuditSink, AuditTrail, CommitId, DekId, Error,
    FolderRef, OrgId, ProjectId, Result, RootKeyId, SecretId, SecretRef, SensitiveBytes,
    TracingAuditSink, VersionId,
};
use vaultline_crypto::{normalize, BlindIndex};
use vaultline_keys::{KeyHierarchy, KmsClient};
use vaultline_storage::{
    CommitRecord, FolderRecord, LedgerStore, ProjectKeyring, SecretRecord, VersionOrigin,
};

use crate::config::StoreConfig;
use crate::gate::{AllowAll, GateDecision, MutationDescriptor, MutationGate, MutationOutcome};
use crate::ledger::{Appended, CommitLog, Payload, Staged};
use crate::replay::{DiffEntry, DiffOptions};
use crate::retry::RetryExecutor;
use crate::rotation::{DataKeyRotation, RotationProgress};

/// Where a write landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReceipt {
    pub secret: SecretId,
    pub version: VersionId,
    /// Sequence number of the version within its secret.
    pub seq: u64,
    pub commit: CommitId,
}

/// Result of a multi-secret commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitReceipt {
    pub commit: CommitId,
    /// Sequence number of the commit within its folder.
    pub commit_seq: u64,
    pub writes: Vec<WriteReceipt>,
}

impl CommitReceipt {
    fn from_appended(appended: &Appended) -> Self {
        Self {
            commit: appended.commit.id,
            commit_seq: appended.commit.seq,
            writes: appended
                .versions
                .iter()
                .map(|v| WriteReceipt {
                    secret: v.secret,
                    version: v.id,
                    seq: v.seq,
                    commit: appended.commit.id,
                })
                .collect(),
        }
    }

    fn single(self) -> Result<WriteReceipt> {
        self.writes
            .into_iter()
            .next()
            .ok_or_else(|| Error::Storage("commit produced no version".to_string()))
    }
}

/// A version as listed by [`SecretStore::history`]. Nothing is decrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionSummary {
    pub version: VersionId,
    pub seq: u64,
    pub prev: Option<VersionId>,
    pub actor: Actor,
    pub created_at: DateTime<Utc>,
    pub tombstone: bool,
    pub origin: VersionOrigin,
    pub dek: DekId,
}

/// A live secret in a folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretListing {
    pub secret: SecretId,
    pub name: String,
    pub version: VersionId,
    pub seq: u64,
    pub updated_at: DateTime<Utc>,
}

/// One change inside [`SecretStore::commit_batch`].
#[derive(Debug, Clone)]
pub enum BatchChange {
    /// Create the key or update it if it is live.
    Set { key: String, value: SensitiveBytes },
    Delete { key: String },
}

impl BatchChange {
    fn key(&self) -> &str {
        match self {
            BatchChange::Set { key, .. } | BatchChange::Delete { key } => key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Create,
    Update,
}

/// Builder for [`SecretStore`].
pub struct SecretStoreBuilder {
    store: Arc<dyn LedgerStore>,
    kms: Arc<dyn KmsClient>,
    gate: Arc<dyn MutationGate>,
    audit: Arc<dyn AuditSink>,
    config: StoreConfig,
}

impl SecretStoreBuilder {
    pub fn new(store: Arc<dyn LedgerStore>, kms: Arc<dyn KmsClient>) -> Self {
        Self {
            store,
            kms,
            gate: Arc::new(AllowAll),
            audit: Arc::new(TracingAuditSink),
            config: StoreConfig::default(),
        }
    }

    /// Policy hook consulted before every mutation. Defaults to [`AllowAll`].
    pub fn with_gate(mut self, gate: Arc<dyn MutationGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Audit destination. Defaults to [`TracingAuditSink`].
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Assemble the store.
    ///
    /// # Errors
    /// - `InvalidInput` if the configuration fails validation
    pub fn build(self) -> Result<SecretStore> {
        self.config.validate()?;
        let audit = Arc::new(AuditTrail::new(self.audit));
        let keys = Arc::new(KeyHierarchy::new(
            self.store.clone(),
            self.kms,
            audit.clone(),
            self.config.hierarchy_options(),
        ));
        let log = CommitLog::new(
            self.store.clone(),
            keys.clone(),
            self.config.checkpoint_window,
        );
        let retry = RetryExecutor::new(self.config.retry_config());
        Ok(SecretStore {
            store: self.store,
            keys,
            log,
            gate: self.gate,
            audit,
            retry,
            config: self.config,
        })
    }
}

/// Multi-tenant versioned secret store.
pub struct SecretStore {
    store: Arc<dyn LedgerStore>,
    keys: Arc<KeyHierarchy>,
    log: CommitLog,
    gate: Arc<dyn MutationGate>,
    audit: Arc<AuditTrail>,
    retry: RetryExecutor,
    config: StoreConfig,
}

impl SecretStore {
    pub fn builder(store: Arc<dyn LedgerStore>, kms: Arc<dyn KmsClient>) -> SecretStoreBuilder {
        SecretStoreBuilder::new(store, kms)
    }

    pub fn keys(&self) -> &KeyHierarchy {
        &self.keys
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn log(&self) -> &CommitLog {
        &self.log
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ---- setup ----

    /// Create the organization's first root key.
    pub async fn provision_org(&self, org: &OrgId) -> Result<RootKeyId> {
        self.keys.provision_org(org).await
    }

    /// Register a project under an organization, creating its first data key.
    /// Idempotent for the owning organization.
    pub async fn register_project(&self, org: &OrgId, project: &ProjectId) -> Result<ProjectKeyring> {
        self.keys.ensure_project_keyring(org, project).await
    }

    // ---- gate ----

    async fn consult_gate<T>(
        &self,
        mutation: &MutationDescriptor,
    ) -> Result<Option<MutationOutcome<T>>> {
        let decision = self.gate.before_apply(mutation).await?;
        let (outcome, audit_outcome) = match decision {
            GateDecision::Allow => return Ok(None),
            GateDecision::Deny { policy, reason } => {
                info!(
                    operation = mutation.operation(),
                    project = %mutation.project(),
                    policy = %policy,
                    "Mutation denied"
                );
                (MutationOutcome::Denied { policy, reason }, AuditOutcome::Denied)
            }
            GateDecision::Defer { pending_request_id } => {
                info!(
                    operation = mutation.operation(),
                    project = %mutation.project(),
                    request_id = %pending_request_id,
                    "Mutation deferred"
                );
                (
                    MutationOutcome::PendingApproval {
                        request_id: pending_request_id,
                    },
                    AuditOutcome::Deferred,
                )
            }
        };
        self.audit.emit(AuditEvent::new(
            AuditKind::MutationGated {
                project: mutation.project().clone(),
                operation: mutation.operation().to_string(),
                actor: mutation.actor().clone(),
            },
            audit_outcome,
        ));
        Ok(Some(outcome))
    }

    fn audit_appended(&self, project: &ProjectId, appended: &Appended, actor: &Actor) {
        for version in &appended.versions {
            self.audit.emit(AuditEvent::success(AuditKind::SecretMutated {
                project: project.clone(),
                secret: version.secret,
                version: version.id,
                commit: appended.commit.id,
                actor: actor.clone(),
                tombstone: version.tombstone,
            }));
        }
    }

    // ---- resolution ----

    async fn blind_index(&self, secret: &SecretRef) -> Result<BlindIndex> {
        self.keys.indexer(secret.project()).await?.index(secret.key())
    }

    /// Folder (created if missing), blind index and current head, for a write.
    async fn resolve_for_write(
        &self,
        secret: &SecretRef,
    ) -> Result<(FolderRecord, BlindIndex, Option<SecretRecord>)> {
        let blind_index = self.blind_index(secret).await?;
        let folder = self.log.ensure_folder(&secret.folder).await?;
        let head = self.store.find_secret(&folder.id, &blind_index).await?;
        Ok((folder, blind_index, head))
    }

    /// Folder and head of an existing secret, tombstoned or not.
    async fn locate(&self, secret: &SecretRef) -> Result<(FolderRecord, SecretRecord)> {
        let not_found = || Error::NotFound(secret.to_string());
        let blind_index = self.blind_index(secret).await?;
        let folder = self
            .log
            .find_folder(&secret.folder)
            .await?
            .ok_or_else(not_found)?;
        let head = self
            .store
            .find_secret(&folder.id, &blind_index)
            .await?
            .ok_or_else(not_found)?;
        Ok((folder, head))
    }

    // ---- single-secret writes ----

    /// Create a secret. Creating a deleted secret revives its chain.
    ///
    /// # Errors
    /// - `AlreadyExists` if the secret is live
    /// - `ConcurrentModification` once retries are exhausted
    pub async fn create(
        &self,
        secret: &SecretRef,
        value: SensitiveBytes,
        actor: &Actor,
    ) -> Result<MutationOutcome<WriteReceipt>> {
        let descriptor = MutationDescriptor::Create {
            secret: secret.clone(),
            actor: actor.clone(),
        };
        if let Some(blocked) = self.consult_gate(&descriptor).await? {
            return Ok(blocked);
        }
        let receipt = self
            .retry
            .execute(|| self.try_put(secret, &value, actor, WriteMode::Create, None))
            .await?;
        Ok(MutationOutcome::Applied(receipt))
    }

    /// Replace a live secret's value, retrying on conflicts.
    ///
    /// # Errors
    /// - `NotFound` if the secret is missing or deleted
    pub async fn update(
        &self,
        secret: &SecretRef,
        value: SensitiveBytes,
        actor: &Actor,
    ) -> Result<MutationOutcome<WriteReceipt>> {
        let descriptor = MutationDescriptor::Update {
            secret: secret.clone(),
            actor: actor.clone(),
            expected_version: None,
        };
        if let Some(blocked) = self.consult_gate(&descriptor).await? {
            return Ok(blocked);
        }
        let receipt = self
            .retry
            .execute(|| self.try_put(secret, &value, actor, WriteMode::Update, None))
            .await?;
        Ok(MutationOutcome::Applied(receipt))
    }

    /// Replace a live secret's value only if its head is still
    /// `expected_version`. Not retried: the caller owns the concurrency token.
    ///
    /// # Errors
    /// - `ConcurrentModification` if the head moved past `expected_version`
    /// - `NotFound` if the secret is missing or deleted
    pub async fn update_from(
        &self,
        secret: &SecretRef,
        value: SensitiveBytes,
        actor: &Actor,
        expected_version: &VersionId,
    ) -> Result<MutationOutcome<WriteReceipt>> {
        let descriptor = MutationDescriptor::Update {
            secret: secret.clone(),
            actor: actor.clone(),
            expected_version: Some(*expected_version),
        };
        if let Some(blocked) = self.consult_gate(&descriptor).await? {
            return Ok(blocked);
        }
        let receipt = self
            .try_put(secret, &value, actor, WriteMode::Update, Some(expected_version))
            .await?;
        Ok(MutationOutcome::Applied(receipt))
    }

    async fn try_put(
        &self,
        secret: &SecretRef,
        value: &SensitiveBytes,
        actor: &Actor,
        mode: WriteMode,
        expected: Option<&VersionId>,
    ) -> Result<WriteReceipt> {
        let (folder, blind_index, head) = match mode {
            WriteMode::Create => self.resolve_for_write(secret).await?,
            WriteMode::Update => {
                let (folder, head) = self.locate(secret).await?;
                if head.tombstone {
                    return Err(Error::NotFound(secret.to_string()));
                }
                let blind_index = head.blind_index.clone();
                (folder, blind_index, Some(head))
            }
        };
        if mode == WriteMode::Create && head.as_ref().is_some_and(|h| !h.tombstone) {
            return Err(Error::AlreadyExists(secret.to_string()));
        }
        if let Some(expected) = expected {
            if head.as_ref().map(|h| &h.head) != Some(expected) {
                return Err(Error::ConcurrentModification(format!(
                    "{} is no longer at version {}",
                    secret, expected
                )));
            }
        }

        let name = secret.key().to_string();
        let payload = Payload::Value(value.clone());
        let staged = match head {
            Some(head) => Staged::on(head, name, payload, VersionOrigin::Write),
            None => Staged {
                secret: SecretId::generate(),
                head: None,
                name,
                blind_index,
                payload,
                origin: VersionOrigin::Write,
            },
        };
        let appended = self.log.append(&folder, vec![staged], actor, None).await?;
        self.audit_appended(&folder.project, &appended, actor);
        debug!(secret = %secret, commit = %appended.commit.id, "Secret written");
        CommitReceipt::from_appended(&appended).single()
    }

    /// Delete a secret by appending a tombstone. History is kept.
    ///
    /// # Errors
    /// - `NotFound` if the secret is missing or already deleted
    pub async fn delete(
        &self,
        secret: &SecretRef,
        actor: &Actor,
    ) -> Result<MutationOutcome<WriteReceipt>> {
        let descriptor = MutationDescriptor::Delete {
            secret: secret.clone(),
            actor: actor.clone(),
        };
        if let Some(blocked) = self.consult_gate(&descriptor).await? {
            return Ok(blocked);
        }
        let receipt = self
            .retry
            .execute(|| self.try_delete(secret, actor))
            .await?;
        Ok(MutationOutcome::Applied(receipt))
    }

    async fn try_delete(&self, secret: &SecretRef, actor: &Actor) -> Result<WriteReceipt> {
        let (folder, head) = self.locate(secret).await?;
        if head.tombstone {
            return Err(Error::NotFound(secret.to_string()));
        }
        let staged = Staged::on(
            head,
            secret.key().to_string(),
            Payload::Tombstone,
            VersionOrigin::Write,
        );
        let appended = self.log.append(&folder, vec![staged], actor, None).await?;
        self.audit_appended(&folder.project, &appended, actor);
        debug!(secret = %secret, commit = %appended.commit.id, "Secret deleted");
        CommitReceipt::from_appended(&appended).single()
    }

    /// Append a new version whose content equals `target`. Works on
    /// deleted secrets too, reviving them.
    ///
    /// # Errors
    /// - `InvalidInput` if `target` belongs to another secret or is a tombstone
    /// - `NotFound` if the secret does not exist
    pub async fn rollback(
        &self,
        secret: &SecretRef,
        target: &VersionId,
        actor: &Actor,
    ) -> Result<MutationOutcome<WriteReceipt>> {
        let descriptor = MutationDescriptor::Rollback {
            secret: secret.clone(),
            actor: actor.clone(),
            target_version: *target,
        };
        if let Some(blocked) = self.consult_gate(&descriptor).await? {
            return Ok(blocked);
        }
        let receipt = self
            .retry
            .execute(|| self.try_rollback(secret, target, actor))
            .await?;
        Ok(MutationOutcome::Applied(receipt))
    }

    async fn try_rollback(
        &self,
        secret: &SecretRef,
        target: &VersionId,
        actor: &Actor,
    ) -> Result<WriteReceipt> {
        let (folder, head) = self.locate(secret).await?;
        let from_version = head.head;
        let appended = self.log.rollback(&folder, head, target, actor).await?;
        let receipt = CommitReceipt::from_appended(&appended).single()?;

        self.audit_appended(&folder.project, &appended, actor);
        self.audit.emit(AuditEvent::success(AuditKind::SecretRolledBack {
            project: folder.project.clone(),
            secret: receipt.secret,
            from_version: Some(from_version),
            to_version: *target,
            new_version: receipt.version,
            actor: actor.clone(),
        }));
        info!(
            secret = %secret,
            from_version = %from_version,
            to_version = %target,
            new_version = %receipt.version,
            "Secret rolled back"
        );
        Ok(receipt)
    }

    // ---- multi-secret writes ----

    /// Apply several changes to one folder as a single commit.
    ///
    /// The gate sees one `Batch` descriptor listing each change as a `Set`
    /// or `Delete`, built from the keys alone. Nothing is looked up or
    /// unwrapped before the gate allows the batch.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty batch or a key named twice
    /// - `NotFound` when deleting a missing or deleted key
    pub async fn commit_batch(
        &self,
        folder: &FolderRef,
        changes: Vec<BatchChange>,
        actor: &Actor,
        message: Option<String>,
    ) -> Result<MutationOutcome<CommitReceipt>> {
        if changes.is_empty() {
            return Err(Error::InvalidInput("batch has no changes".to_string()));
        }
        let mut keys = HashSet::with_capacity(changes.len());
        for change in &changes {
            if !keys.insert(normalize(change.key())) {
                return Err(Error::InvalidInput(format!(
                    "key {} appears twice in one batch",
                    change.key()
                )));
            }
        }
        let mut descriptors = Vec::with_capacity(changes.len());
        for change in &changes {
            let secret = folder.secret(change.key())?;
            descriptors.push(match change {
                BatchChange::Set { .. } => MutationDescriptor::Set {
                    secret,
                    actor: actor.clone(),
                },
                BatchChange::Delete { .. } => MutationDescriptor::Delete {
                    secret,
                    actor: actor.clone(),
                },
            });
        }
        let descriptor = MutationDescriptor::Batch {
            project: folder.project.clone(),
            actor: actor.clone(),
            changes: descriptors,
        };
        if let Some(blocked) = self.consult_gate(&descriptor).await? {
            return Ok(blocked);
        }

        let receipt = self
            .retry
            .execute(|| self.try_batch(folder, &changes, actor, message.as_deref()))
            .await?;
        Ok(MutationOutcome::Applied(receipt))
    }

    async fn try_batch(
        &self,
        folder_ref: &FolderRef,
        changes: &[BatchChange],
        actor: &Actor,
        message: Option<&str>,
    ) -> Result<CommitReceipt> {
        let indexer = self.keys.indexer(&folder_ref.project).await?;
        let folder = self.log.ensure_folder(folder_ref).await?;

        let mut staged = Vec::with_capacity(changes.len());
        for change in changes {
            let secret = folder_ref.secret(change.key())?;
            let blind_index = indexer.index(secret.key())?;
            let head = self.store.find_secret(&folder.id, &blind_index).await?;
            let name = secret.key().to_string();
            staged.push(match (change, head) {
                (BatchChange::Set { value, .. }, Some(head)) => Staged::on(
                    head,
                    name,
                    Payload::Value(value.clone()),
                    VersionOrigin::Write,
                ),
                (BatchChange::Set { value, .. }, None) => Staged {
                    secret: SecretId::generate(),
                    head: None,
                    name,
                    blind_index,
                    payload: Payload::Value(value.clone()),
                    origin: VersionOrigin::Write,
                },
                (BatchChange::Delete { .. }, Some(head)) if !head.tombstone => {
                    Staged::on(head, name, Payload::Tombstone, VersionOrigin::Write)
                }
                (BatchChange::Delete { .. }, _) => {
                    return Err(Error::NotFound(secret.to_string()));
                }
            });
        }

        let appended = self
            .log
            .append(&folder, staged, actor, message.map(str::to_string))
            .await?;
        self.audit_appended(&folder.project, &appended, actor);
        info!(
            folder = %folder_ref,
            commit = %appended.commit.id,
            changes = appended.versions.len(),
            "Batch committed"
        );
        Ok(CommitReceipt::from_appended(&appended))
    }

    /// Restore every secret a commit touched to its state just before that
    /// commit, as one new commit.
    ///
    /// Secrets whose current content already matches that state are left
    /// alone.
    ///
    /// # Errors
    /// - `NotFound` if the commit does not exist
    /// - `InvalidInput` if every touched secret is already in its prior state
    pub async fn revert_commit(
        &self,
        commit: &CommitId,
        actor: &Actor,
    ) -> Result<MutationOutcome<CommitReceipt>> {
        let record = self.store.get_commit(commit).await?;
        let folder = self.store.get_folder(&record.folder).await?;
        let descriptor = MutationDescriptor::RevertCommit {
            project: folder.project.clone(),
            actor: actor.clone(),
            commit: *commit,
        };
        if let Some(blocked) = self.consult_gate(&descriptor).await? {
            return Ok(blocked);
        }
        let receipt = self
            .retry
            .execute(|| self.try_revert(&folder, &record, actor))
            .await?;
        Ok(MutationOutcome::Applied(receipt))
    }

    async fn try_revert(
        &self,
        folder: &FolderRecord,
        record: &CommitRecord,
        actor: &Actor,
    ) -> Result<CommitReceipt> {
        let mut scope = self.log.scope();
        let mut staged = Vec::with_capacity(record.members.len());
        for member in &record.members {
            let version = self.store.get_version(&member.version).await?;
            let head = self.store.get_secret(&member.secret).await?;
            let prior = match version.prev {
                Some(prev) => Some(self.store.get_version(&prev).await?),
                None => None,
            };

            let (name, payload) = match prior {
                Some(prior) if !prior.tombstone => {
                    let value = scope.open_value(&prior).await?;
                    if !head.tombstone {
                        let current = self.store.get_version(&head.head).await?;
                        if current.id == prior.id || scope.open_value(&current).await? == value {
                            continue;
                        }
                    }
                    (scope.open_name(&prior).await?, Payload::Value(value))
                }
                _ => {
                    if head.tombstone {
                        continue;
                    }
                    (scope.open_name(&version).await?, Payload::Tombstone)
                }
            };
            staged.push(Staged::on(
                head,
                name,
                payload,
                VersionOrigin::Revert { commit: record.id },
            ));
        }
        drop(scope);

        if staged.is_empty() {
            return Err(Error::InvalidInput(format!(
                "commit {} has nothing left to revert",
                record.id
            )));
        }

        let message = Some(format!("revert {}", record.id));
        let appended = self.log.append(folder, staged, actor, message).await?;
        self.audit_appended(&folder.project, &appended, actor);
        self.audit.emit(AuditEvent::success(AuditKind::CommitReverted {
            project: folder.project.clone(),
            reverted: record.id,
            commit: appended.commit.id,
            actor: actor.clone(),
        }));
        info!(
            reverted = %record.id,
            commit = %appended.commit.id,
            secrets = appended.versions.len(),
            "Commit reverted"
        );
        Ok(CommitReceipt::from_appended(&appended))
    }

    // ---- reads ----

    /// Current value of a secret.
    ///
    /// # Errors
    /// - `NotFound` if the secret is missing or deleted
    /// - `DecryptionFailed` if the head does not verify under its data key
    pub async fn read(&self, secret: &SecretRef) -> Result<SensitiveBytes> {
        let (_, head) = self.locate(secret).await?;
        if head.tombstone {
            return Err(Error::NotFound(secret.to_string()));
        }
        let version = self.store.get_version(&head.head).await?;
        let value = self.log.scope().open_value(&version).await?;
        debug!(secret = %secret, version = %version.id, "Secret read");
        Ok(value)
    }

    /// Value of a secret as of a commit of its folder.
    ///
    /// # Errors
    /// - `InvalidInput` if the commit belongs to another folder
    /// - `NotFound` if the secret was not live at that commit
    pub async fn read_at(&self, secret: &SecretRef, commit: &CommitId) -> Result<SensitiveBytes> {
        let record = self.store.get_commit(commit).await?;
        let (folder, head) = self.locate(secret).await?;
        if record.folder != folder.id {
            return Err(Error::InvalidInput(format!(
                "commit {} is not in folder {}",
                commit, secret.folder
            )));
        }
        let state = self.log.state_at(&folder.id, record.seq).await?;
        let version_id = state
            .get(&head.id)
            .ok_or_else(|| Error::NotFound(format!("{} at commit {}", secret, commit)))?;
        let version = self.store.get_version(version_id).await?;
        self.log.scope().open_value(&version).await
    }

    /// Value of one specific version.
    ///
    /// # Errors
    /// - `NotFound` if the version belongs to another secret or is a tombstone
    pub async fn read_version(
        &self,
        secret: &SecretRef,
        version: &VersionId,
    ) -> Result<SensitiveBytes> {
        let (_, head) = self.locate(secret).await?;
        let record = self.store.get_version(version).await?;
        if record.secret != head.id || record.tombstone {
            return Err(Error::NotFound(format!("{} version {}", secret, version)));
        }
        self.log.scope().open_value(&record).await
    }

    /// Every version of a secret, oldest first.
    pub async fn history(&self, secret: &SecretRef) -> Result<Vec<VersionSummary>> {
        let (_, head) = self.locate(secret).await?;
        let versions = self.store.list_versions(&head.id).await?;
        Ok(versions
            .into_iter()
            .map(|v| VersionSummary {
                version: v.id,
                seq: v.seq,
                prev: v.prev,
                actor: v.actor,
                created_at: v.created_at,
                tombstone: v.tombstone,
                origin: v.origin,
                dek: v.dek,
            })
            .collect())
    }

    /// Live secrets of a folder with decrypted names, sorted by name.
    pub async fn list_secrets(&self, folder: &FolderRef) -> Result<Vec<SecretListing>> {
        let Some(folder) = self.log.find_folder(folder).await? else {
            return Ok(Vec::new());
        };
        let mut scope = self.log.scope();
        let mut listings = Vec::new();
        for head in self.store.list_secrets(&folder.id).await? {
            if head.tombstone {
                continue;
            }
            let version = self.store.get_version(&head.head).await?;
            listings.push(SecretListing {
                secret: head.id,
                name: scope.open_name(&version).await?,
                version: head.head,
                seq: head.head_seq,
                updated_at: head.updated_at,
            });
        }
        listings.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listings)
    }

    /// Commits of a folder, oldest first.
    pub async fn list_commits(&self, folder: &FolderRef) -> Result<Vec<CommitRecord>> {
        match self.log.find_folder(folder).await? {
            Some(folder) => self.store.list_commits(&folder.id, 0, None).await,
            None => Ok(Vec::new()),
        }
    }

    /// Diff the folder states at two commits.
    pub async fn compare_folder_states(
        &self,
        from: &CommitId,
        to: &CommitId,
        options: DiffOptions,
    ) -> Result<Vec<DiffEntry>> {
        let from = self.store.get_commit(from).await?;
        let to = self.store.get_commit(to).await?;
        self.log.diff(&from, &to, options).await
    }

    // ---- keys ----

    /// Replace the organization root key and rewrap its data keys.
    pub async fn rotate_root_key(&self, org: &OrgId) -> Result<RootKeyId> {
        self.keys.rotate_root_key(org).await
    }

    /// Delete retired root keys past their grace window.
    pub async fn purge_retired_root_keys(&self, org: &OrgId) -> Result<Vec<RootKeyId>> {
        self.keys.purge_retired_root_keys(org, Utc::now()).await
    }

    /// Rotation job for a project's data key.
    pub fn data_key_rotation(&self, project: &ProjectId) -> DataKeyRotation<'_> {
        DataKeyRotation::new(
            &self.log,
            &self.keys,
            &self.audit,
            project.clone(),
            self.config.rotation_batch_size,
        )
    }

    /// Start a new data key and re-encrypt every live secret under it.
    pub async fn rotate_data_key(&self, project: &ProjectId) -> Result<RotationProgress> {
        self.keys.begin_data_key_rotation(project).await?;
        self.data_key_rotation(project).run_to_completion().await
    }

    /// Continue an interrupted data key rotation.
    pub async fn resume_data_key_rotation(&self, project: &ProjectId) -> Result<RotationProgress> {
        self.data_key_rotation(project).run_to_completion().await
    }

    pub async fn data_key_rotation_progress(
        &self,
        project: &ProjectId,
    ) -> Result<RotationProgress> {
        self.data_key_rotation(project).progress().await
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("store", &self.store.name())
            .field("log", &self.log)
            .field("audit", &self.audit)
            .field("config", &self.config)
            .finish()
    }
}
