//! Persisted record shapes.
//!
//! No record carries a plaintext secret value, plaintext name, folder path,
//! or unwrapped key. Values, names and paths live in [`SealedBox`]es under a
//! project data key;
//! data keys are wrapped by a root key; root keys are sealed by a KMS.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use vaultline_common::{
    Actor, CommitId, DekId, EnvironmentId, FolderId, OrgId, ProjectId, RootKeyId,
    SecretId, VersionId,
};
use vaultline_crypto::{BlindIndex, SealedBox};

/// Lifecycle of an organization root key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RootKeyStatus {
    /// Wraps newly created data keys.
    Active,
    /// Superseded by rotation; kept for in-flight unwraps until `purge_after`.
    Retired {
        retired_at: DateTime<Utc>,
        purge_after: DateTime<Utc>,
    },
}

/// An organization root key, sealed by the KMS that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootKeyRecord {
    pub id: RootKeyId,
    pub org: OrgId,
    /// Name of the KMS that sealed the material.
    pub kms: String,
    pub sealed_material: Vec<u8>,
    pub status: RootKeyStatus,
    pub created_at: DateTime<Utc>,
}

impl RootKeyRecord {
    /// Whether this key wraps new data keys.
    pub fn is_active(&self) -> bool {
        matches!(self.status, RootKeyStatus::Active)
    }
}

/// A project data key in wrapped form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataKeyRecord {
    pub id: DekId,
    pub org: OrgId,
    pub project: ProjectId,
    /// Root key the `wrapped` material is currently sealed under.
    pub root_key: RootKeyId,
    pub wrapped: SealedBox,
    pub created_at: DateTime<Utc>,
}

/// Per-project key pointers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectKeyring {
    pub project: ProjectId,
    pub org: OrgId,
    /// Data key used for new writes.
    pub current_dek: DekId,
    /// Data key the blind index key is derived from; never rotated.
    pub index_dek: DekId,
    pub updated_at: DateTime<Utc>,
}

/// A folder within a project environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRecord {
    pub id: FolderId,
    pub project: ProjectId,
    pub environment: EnvironmentId,
    /// Lookup token for the folder path.
    pub path_index: BlindIndex,
    pub path: SealedBox,
    /// Data key `path` is sealed under.
    pub path_dek: DekId,
    pub created_at: DateTime<Utc>,
}

/// Head pointer of a secret's version chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: SecretId,
    pub project: ProjectId,
    pub folder: FolderId,
    pub blind_index: BlindIndex,
    pub head: VersionId,
    pub head_seq: u64,
    pub head_dek: DekId,
    pub tombstone: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Why a version was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VersionOrigin {
    /// Create, update or delete by an actor.
    Write,
    /// Content copied from `to` while the head was `from`.
    Rollback {
        from: Option<VersionId>,
        to: VersionId,
    },
    /// Re-encrypted under a new data key.
    Rotation { from_dek: DekId },
    /// Produced by reverting a commit.
    Revert { commit: CommitId },
}

/// One immutable version of a secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: VersionId,
    pub secret: SecretId,
    pub project: ProjectId,
    pub seq: u64,
    pub prev: Option<VersionId>,
    pub value: SealedBox,
    pub name: SealedBox,
    pub dek: DekId,
    pub blind_index: BlindIndex,
    pub actor: Actor,
    pub created_at: DateTime<Utc>,
    pub tombstone: bool,
    pub origin: VersionOrigin,
}

/// A version produced by a commit, as seen from the commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMember {
    pub secret: SecretId,
    pub version: VersionId,
    pub tombstone: bool,
}

/// An atomic batch of version changes to one folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: CommitId,
    pub folder: FolderId,
    pub seq: u64,
    pub members: Vec<CommitMember>,
    pub actor: Actor,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Materialized folder state at a commit: live secret -> version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub folder: FolderId,
    pub commit: CommitId,
    pub commit_seq: u64,
    pub state: BTreeMap<SecretId, VersionId>,
    pub created_at: DateTime<Utc>,
}

/// A version to append, guarded by the head it expects to replace.
#[derive(Debug, Clone)]
pub struct VersionWrite {
    pub version: VersionRecord,
    /// `None` means the secret must not exist yet.
    pub expected_head: Option<VersionId>,
}

/// Everything needed to apply one commit atomically.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub id: CommitId,
    pub folder: FolderId,
    pub writes: Vec<VersionWrite>,
    pub actor: Actor,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CommitBatch {
    /// Members as they will appear on the resulting commit.
    pub fn members(&self) -> Vec<CommitMember> {
        self.writes
            .iter()
            .map(|w| CommitMember {
                secret: w.version.secret,
                version: w.version.id,
                tombstone: w.version.tombstone,
            })
            .collect()
    }

    /// Build the commit record for an assigned sequence number.
    pub fn into_record(self, seq: u64) -> CommitRecord {
        let members = self.members();
        CommitRecord {
            id: self.id,
            folder: self.folder,
            seq,
            members,
            actor: self.actor,
            message: self.message,
            created_at: self.created_at,
        }
    }
}

impl SecretRecord {
    /// Head pointer for a secret whose first version is `version`.
    pub fn from_first_version(version: &VersionRecord, folder: FolderId) -> Self {
        Self {
            id: version.secret,
            project: version.project.clone(),
            folder,
            blind_index: version.blind_index.clone(),
            head: version.id,
            head_seq: version.seq,
            head_dek: version.dek,
            tombstone: version.tombstone,
            created_at: version.created_at,
            updated_at: version.created_at,
        }
    }

    /// Advance the head to `version`.
    pub fn advance(&mut self, version: &VersionRecord) {
        self.head = version.id;
        self.head_seq = version.seq;
        self.head_dek = version.dek;
        self.tombstone = version.tombstone;
        self.blind_index = version.blind_index.clone();
        self.updated_at = version.created_at;
    }
}
