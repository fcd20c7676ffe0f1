//! Resumable data key rotation.
//!
//! Progress is tracked per secret by the data key of its head version, so a
//! rotation interrupted at any point is resumed by running the job again.
//! Foreground writes are never blocked; a write that lands mid-rotation is
//! already encrypted under the current key and simply drops out of the
//! remaining set.
//!
//! Heads that fail to decrypt are remembered by the job and passed over, so
//! they never starve the readable heads queued behind them.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use vaultline_common::{
    Actor, AuditEvent, AuditKind, AuditTrail, DekId, Error, FolderId, ProjectId, Result,
    SecretId, VersionId,
};
use vaultline_keys::KeyHierarchy;
use vaultline_storage::{FolderRecord, SecretRecord, VersionOrigin};

use crate::ledger::{CommitLog, Payload, Staged};

/// Batches in a row without progress before the job stops.
const MAX_IDLE_ROUNDS: u32 = 3;

/// Snapshot of a project's rotation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationProgress {
    pub current_dek: DekId,
    /// Live secrets in the project.
    pub total: usize,
    /// Live secrets already under `current_dek`.
    pub rotated: usize,
    pub remaining: usize,
    /// Stale heads this job found unreadable; counted in `remaining`.
    pub unreadable: Vec<SecretId>,
}

impl RotationProgress {
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// Nothing left that the job could still re-encrypt.
    pub fn is_exhausted(&self) -> bool {
        self.remaining == self.unreadable.len()
    }
}

/// Outcome of one [`DataKeyRotation::run_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub rotated: usize,
    /// Heads that moved under the job; they are picked up again if still stale.
    pub conflicts: usize,
    /// Heads that could not be decrypted and were left in place.
    pub unreadable: Vec<SecretId>,
}

/// Re-encrypts a project's live head versions under its current data key.
pub struct DataKeyRotation<'a> {
    log: &'a CommitLog,
    keys: &'a KeyHierarchy,
    audit: &'a AuditTrail,
    project: ProjectId,
    batch_size: usize,
    /// Head version each unreadable secret was skipped at.
    skipped: Mutex<HashMap<SecretId, VersionId>>,
}

impl<'a> DataKeyRotation<'a> {
    pub fn new(
        log: &'a CommitLog,
        keys: &'a KeyHierarchy,
        audit: &'a AuditTrail,
        project: ProjectId,
        batch_size: usize,
    ) -> Self {
        Self {
            log,
            keys,
            audit,
            project,
            batch_size: batch_size.max(1),
            skipped: Mutex::new(HashMap::new()),
        }
    }

    fn skipped_at(&self, head: &SecretRecord) -> bool {
        self.skipped
            .lock()
            .map(|skipped| skipped.get(&head.id) == Some(&head.head))
            .unwrap_or(false)
    }

    fn skip(&self, head: &SecretRecord) {
        if let Ok(mut skipped) = self.skipped.lock() {
            skipped.insert(head.id, head.head);
        }
    }

    async fn live_heads(&self) -> Result<Vec<SecretRecord>> {
        let mut heads = self
            .log
            .store()
            .list_project_secrets(&self.project)
            .await?;
        heads.retain(|h| !h.tombstone);
        Ok(heads)
    }

    /// How far the project is from having every live head under its current key.
    pub async fn progress(&self) -> Result<RotationProgress> {
        let current_dek = self.keys.keyring(&self.project).await?.current_dek;
        let heads = self.live_heads().await?;
        let rotated = heads.iter().filter(|h| h.head_dek == current_dek).count();
        let unreadable = heads
            .iter()
            .filter(|h| h.head_dek != current_dek && self.skipped_at(h))
            .map(|h| h.id)
            .collect();
        Ok(RotationProgress {
            current_dek,
            total: heads.len(),
            rotated,
            remaining: heads.len() - rotated,
            unreadable,
        })
    }

    /// Re-encrypt up to `limit` stale heads.
    ///
    /// Heads already known to be unreadable at their current version are
    /// passed over and do not count towards `limit`.
    ///
    /// # Errors
    /// - `KeyUnavailable` if a data key cannot be unwrapped; nothing further is attempted
    pub async fn run_batch(&self, limit: usize) -> Result<BatchReport> {
        let current_dek = self.keys.keyring(&self.project).await?.current_dek;
        let stale: Vec<SecretRecord> = self
            .live_heads()
            .await?
            .into_iter()
            .filter(|h| h.head_dek != current_dek && !self.skipped_at(h))
            .collect();

        let actor = Actor::key_rotation();
        let mut folders: HashMap<FolderId, FolderRecord> = HashMap::new();
        let mut scope = self.log.scope();
        let mut report = BatchReport::default();

        for head in stale {
            if report.rotated + report.conflicts >= limit {
                break;
            }
            let folder = match folders.get(&head.folder) {
                Some(folder) => folder.clone(),
                None => {
                    let folder = self.log.store().get_folder(&head.folder).await?;
                    folders.insert(folder.id, folder.clone());
                    folder
                }
            };
            let version = self.log.store().get_version(&head.head).await?;
            let contents = match scope.open_name(&version).await {
                Ok(name) => scope.open_value(&version).await.map(|value| (name, value)),
                Err(e) => Err(e),
            };
            let (name, value) = match contents {
                Ok(contents) => contents,
                Err(e @ (Error::DecryptionFailed(_) | Error::Crypto(_))) => {
                    warn!(secret = %head.id, version = %version.id, error = %e, "Skipping unreadable head during rotation");
                    self.skip(&head);
                    report.unreadable.push(head.id);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let secret = head.id;
            let staged = Staged::on(
                head,
                name,
                Payload::Value(value),
                VersionOrigin::Rotation {
                    from_dek: version.dek,
                },
            );
            match self.log.append(&folder, vec![staged], &actor, None).await {
                Ok(appended) => {
                    for version in &appended.versions {
                        self.audit.emit(AuditEvent::success(AuditKind::SecretMutated {
                            project: self.project.clone(),
                            secret: version.secret,
                            version: version.id,
                            commit: appended.commit.id,
                            actor: actor.clone(),
                            tombstone: false,
                        }));
                    }
                    report.rotated += 1;
                }
                Err(Error::ConcurrentModification(_)) => {
                    debug!(secret = %secret, "Head moved during rotation");
                    report.conflicts += 1;
                }
                Err(e) => return Err(e),
            }
        }
        drop(scope);

        let progress = self.progress().await?;
        self.audit
            .emit(AuditEvent::success(AuditKind::DataKeyRotationProgress {
                project: self.project.clone(),
                dek: progress.current_dek,
                rotated: progress.rotated,
                remaining: progress.remaining,
            }));
        debug!(
            project = %self.project,
            rotated = report.rotated,
            conflicts = report.conflicts,
            unreadable = report.unreadable.len(),
            remaining = progress.remaining,
            "Rotation batch finished"
        );
        Ok(report)
    }

    /// Run batches until every readable stale head is re-encrypted.
    ///
    /// Unreadable heads stay stale; the returned progress lists them and
    /// counts them as remaining.
    pub async fn run_to_completion(&self) -> Result<RotationProgress> {
        let mut idle_rounds = 0;
        loop {
            let progress = self.progress().await?;
            if progress.is_complete() {
                info!(project = %self.project, dek = %progress.current_dek, total = progress.total, "Data key rotation complete");
                return Ok(progress);
            }
            if progress.is_exhausted() {
                warn!(
                    project = %self.project,
                    remaining = progress.remaining,
                    "Data key rotation left unreadable heads behind"
                );
                return Ok(progress);
            }
            let report = self.run_batch(self.batch_size).await?;
            if report.rotated == 0 {
                idle_rounds += 1;
                if idle_rounds >= MAX_IDLE_ROUNDS {
                    let progress = self.progress().await?;
                    warn!(
                        project = %self.project,
                        remaining = progress.remaining,
                        "Data key rotation stalled"
                    );
                    return Ok(progress);
                }
            } else {
                idle_rounds = 0;
            }
        }
    }
}

impl std::fmt::Debug for DataKeyRotation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKeyRotation")
            .field("project", &self.project)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}
