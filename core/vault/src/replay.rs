//! Point-in-time folder state and diffs between commits.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use vaultline_common::{Error, FolderId, Result, SecretId, VersionId};
use vaultline_storage::CommitRecord;

use crate::ledger::{CommitLog, KeyScope};

/// Live secrets of a folder at one commit: secret -> head version.
pub type FolderState = BTreeMap<SecretId, VersionId>;

/// Kind of change between two folder states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
    /// A version on either side could not be decrypted.
    Unreadable,
}

/// One secret's change between two commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffEntry {
    pub secret: SecretId,
    pub kind: ChangeKind,
    pub from_version: Option<VersionId>,
    pub to_version: Option<VersionId>,
    /// Decrypted name, when readable.
    pub name: Option<String>,
}

/// Options for [`CommitLog::diff`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    /// Drop `Modified` entries whose decrypted name and value are unchanged.
    pub suppress_unchanged: bool,
}

/// A secret's change between two states: (secret, kind, from, to).
pub type StateChange = (SecretId, ChangeKind, Option<VersionId>, Option<VersionId>);

/// Apply commits in sequence order, newest wins per secret.
pub fn replay<'a>(
    mut state: FolderState,
    commits: impl IntoIterator<Item = &'a CommitRecord>,
) -> FolderState {
    for commit in commits {
        for member in &commit.members {
            if member.tombstone {
                state.remove(&member.secret);
            } else {
                state.insert(member.secret, member.version);
            }
        }
    }
    state
}

/// Set-diff two states by secret id.
pub fn diff_states(from: &FolderState, to: &FolderState) -> Vec<StateChange> {
    let secrets: BTreeSet<&SecretId> = from.keys().chain(to.keys()).collect();
    secrets
        .into_iter()
        .filter_map(|secret| match (from.get(secret), to.get(secret)) {
            (None, Some(b)) => Some((*secret, ChangeKind::Added, None, Some(*b))),
            (Some(a), None) => Some((*secret, ChangeKind::Removed, Some(*a), None)),
            (Some(a), Some(b)) if a != b => {
                Some((*secret, ChangeKind::Modified, Some(*a), Some(*b)))
            }
            _ => None,
        })
        .collect()
}

fn unreadable(e: &Error) -> bool {
    matches!(e, Error::DecryptionFailed(_) | Error::Crypto(_))
}

impl CommitLog {
    /// Reconstruct the live state of `folder` as of commit `seq`.
    ///
    /// Starts from the nearest checkpoint at or before `seq` and replays the
    /// commits after it.
    pub async fn state_at(&self, folder: &FolderId, seq: u64) -> Result<FolderState> {
        let checkpoint = self.store().nearest_checkpoint(folder, seq).await?;
        let (base, after) = match checkpoint {
            Some(c) => (c.state, c.commit_seq),
            None => (FolderState::new(), 0),
        };
        let commits = self.store().list_commits(folder, after, Some(seq)).await?;
        Ok(replay(base, &commits))
    }

    /// Diff the folder states at two commits of the same folder.
    ///
    /// All-or-nothing: a `KeyUnavailable` or storage error aborts the whole
    /// diff, while an undecryptable version marks only its secret `Unreadable`.
    ///
    /// # Errors
    /// - `InvalidInput` if the commits belong to different folders
    pub async fn diff(
        &self,
        from: &CommitRecord,
        to: &CommitRecord,
        options: DiffOptions,
    ) -> Result<Vec<DiffEntry>> {
        if from.folder != to.folder {
            return Err(Error::InvalidInput(
                "cannot diff commits of different folders".to_string(),
            ));
        }
        let from_state = self.state_at(&from.folder, from.seq).await?;
        let to_state = self.state_at(&to.folder, to.seq).await?;

        let mut scope = self.scope();
        let mut entries = Vec::new();
        for (secret, kind, from_version, to_version) in diff_states(&from_state, &to_state) {
            let entry = self
                .inspect(&mut scope, secret, kind, from_version, to_version, options)
                .await?;
            if let Some(entry) = entry {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn inspect(
        &self,
        scope: &mut KeyScope<'_>,
        secret: SecretId,
        kind: ChangeKind,
        from_version: Option<VersionId>,
        to_version: Option<VersionId>,
        options: DiffOptions,
    ) -> Result<Option<DiffEntry>> {
        let mut opened = Vec::with_capacity(2);
        for id in [from_version, to_version].into_iter().flatten() {
            let version = self.store().get_version(&id).await?;
            let contents = match scope.open_name(&version).await {
                Ok(name) => scope.open_value(&version).await.map(|value| (name, value)),
                Err(e) => Err(e),
            };
            match contents {
                Ok(contents) => opened.push(contents),
                Err(e) if unreadable(&e) => {
                    warn!(secret = %secret, version = %id, "Version unreadable during diff");
                    return Ok(Some(DiffEntry {
                        secret,
                        kind: ChangeKind::Unreadable,
                        from_version,
                        to_version,
                        name: opened.pop().map(|(name, _)| name),
                    }));
                }
                Err(e) => return Err(e),
            }
        }

        if kind == ChangeKind::Modified && options.suppress_unchanged {
            if let [(from_name, from_value), (to_name, to_value)] = opened.as_slice() {
                if from_name == to_name && from_value == to_value {
                    return Ok(None);
                }
            }
        }

        Ok(Some(DiffEntry {
            secret,
            kind,
            from_version,
            to_version,
            name: opened.pop().map(|(name, _)| name),
        }))
    }
}
