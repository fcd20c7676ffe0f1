//! Record builders shared by backend tests.

use chrono::Utc;

use vaultline_common::{
    Actor, CommitId, DekId, EnvironmentId, FolderId, ProjectId, SecretId, VersionId,
};
use vaultline_crypto::{BlindIndex, SealedBox};

use crate::records::{CommitBatch, FolderRecord, VersionOrigin, VersionRecord, VersionWrite};

fn sealed(byte: u8) -> SealedBox {
    SealedBox {
        ciphertext: vec![byte; 4],
        nonce: [byte; 12],
        tag: [byte; 16],
    }
}

pub fn folder_record(project: &str, path: &str) -> FolderRecord {
    FolderRecord {
        id: FolderId::generate(),
        project: ProjectId::new(project).unwrap(),
        environment: EnvironmentId::new("dev").unwrap(),
        path_index: BlindIndex::from_encoded(format!("path{}", path)),
        path: sealed(9),
        path_dek: DekId::generate(),
        created_at: Utc::now(),
    }
}

pub fn version(
    project: &str,
    secret: SecretId,
    seq: u64,
    prev: Option<VersionId>,
    token: &str,
) -> VersionRecord {
    VersionRecord {
        id: VersionId::generate(),
        secret,
        project: ProjectId::new(project).unwrap(),
        seq,
        prev,
        value: sealed(seq as u8),
        name: sealed(0),
        dek: DekId::generate(),
        blind_index: BlindIndex::from_encoded(token),
        actor: Actor::new("user:test").unwrap(),
        created_at: Utc::now(),
        tombstone: false,
        origin: VersionOrigin::Write,
    }
}

pub fn batch(folder: FolderId, writes: Vec<(VersionRecord, Option<VersionId>)>) -> CommitBatch {
    CommitBatch {
        id: CommitId::generate(),
        folder,
        writes: writes
            .into_iter()
            .map(|(version, expected_head)| VersionWrite {
                version,
                expected_head,
            })
            .collect(),
        actor: Actor::new("user:test").unwrap(),
        message: None,
        created_at: Utc::now(),
    }
}
