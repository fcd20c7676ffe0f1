//! SQLite-backed ledger store.
//!
//! Each table keeps the columns needed for lookups and uniqueness next to a
//! JSON body holding the full record.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Params, Transaction};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

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

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS root_keys (
    id TEXT PRIMARY KEY,
    org TEXT NOT NULL,
    active INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_root_keys_org ON root_keys(org);
CREATE UNIQUE INDEX IF NOT EXISTS idx_root_keys_active ON root_keys(org) WHERE active = 1;

CREATE TABLE IF NOT EXISTS data_keys (
    id TEXT PRIMARY KEY,
    org TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_data_keys_org ON data_keys(org);

CREATE TABLE IF NOT EXISTS keyrings (
    project TEXT PRIMARY KEY,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS folders (
    id TEXT PRIMARY KEY,
    project TEXT NOT NULL,
    environment TEXT NOT NULL,
    path_index TEXT NOT NULL,
    body TEXT NOT NULL,
    UNIQUE(project, environment, path_index)
);

CREATE TABLE IF NOT EXISTS secrets (
    id TEXT PRIMARY KEY,
    project TEXT NOT NULL,
    folder TEXT NOT NULL,
    blind_index TEXT NOT NULL,
    body TEXT NOT NULL,
    UNIQUE(folder, blind_index)
);
CREATE INDEX IF NOT EXISTS idx_secrets_project ON secrets(project);

CREATE TABLE IF NOT EXISTS versions (
    id TEXT PRIMARY KEY,
    secret TEXT NOT NULL,
    seq INTEGER NOT NULL,
    body TEXT NOT NULL,
    UNIQUE(secret, seq)
);

CREATE TABLE IF NOT EXISTS commits (
    id TEXT PRIMARY KEY,
    folder TEXT NOT NULL,
    seq INTEGER NOT NULL,
    body TEXT NOT NULL,
    UNIQUE(folder, seq)
);

CREATE TABLE IF NOT EXISTS checkpoints (
    folder TEXT NOT NULL,
    commit_seq INTEGER NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY(folder, commit_seq)
);
"#;

fn sql_err(e: rusqlite::Error) -> Error {
    Error::Storage(format!("sqlite: {}", e))
}

fn encode<T: Serialize>(record: &T) -> Result<String> {
    Ok(serde_json::to_string(record)?)
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T> {
    Ok(serde_json::from_str(body)?)
}

fn query_one<T: DeserializeOwned, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Option<T>> {
    let body: Option<String> = conn
        .query_row(sql, params, |row| row.get(0))
        .optional()
        .map_err(sql_err)?;
    body.as_deref().map(decode).transpose()
}

fn query_all<T: DeserializeOwned, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql).map_err(sql_err)?;
    let rows = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .map_err(sql_err)?;
    let mut records = Vec::new();
    for body in rows {
        records.push(decode(&body.map_err(sql_err)?)?);
    }
    Ok(records)
}

/// Ledger store persisted in a single SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database file and apply the schema.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(sql_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        info!(path = %path.display(), "Ledger database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("sqlite connection lock poisoned".to_string()))
    }
}

fn load_secret(tx: &Transaction<'_>, id: &SecretId) -> Result<Option<SecretRecord>> {
    query_one(tx, "SELECT body FROM secrets WHERE id = ?1", [id.to_string()])
}

fn load_name_owner(
    tx: &Transaction<'_>,
    folder: &FolderId,
    index: &BlindIndex,
) -> Result<Option<SecretRecord>> {
    query_one(
        tx,
        "SELECT body FROM secrets WHERE folder = ?1 AND blind_index = ?2",
        [folder.to_string(), index.as_str().to_string()],
    )
}

#[async_trait]
impl LedgerStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn insert_root_key(
        &self,
        record: RootKeyRecord,
        replaces: Option<RootKeyRecord>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(sql_err)?;
        let active = {
            let mut stmt = tx
                .prepare("SELECT id FROM root_keys WHERE org = ?1 AND active = 1")
                .map_err(sql_err)?;
            let ids = stmt
                .query_map([record.org.as_str()], |row| row.get::<_, String>(0))
                .map_err(sql_err)?
                .collect::<rusqlite::Result<Vec<String>>>()
                .map_err(sql_err)?;
            ids.iter()
                .map(|id| id.parse::<RootKeyId>())
                .collect::<Result<Vec<RootKeyId>>>()?
        };
        check_root_key_swap(&record.org, &active, replaces.as_ref())?;

        // Retire first so the one-active-key index holds at every step.
        if let Some(old) = &replaces {
            tx.execute(
                "UPDATE root_keys SET active = ?1, body = ?2 WHERE id = ?3",
                params![old.is_active(), encode(old)?, old.id.to_string()],
            )
            .map_err(sql_err)?;
        }
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO root_keys (id, org, active, body) VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.id.to_string(),
                    record.org.as_str(),
                    record.is_active(),
                    encode(&record)?
                ],
            )
            .map_err(sql_err)?;
        if inserted == 0 {
            return Err(Error::AlreadyExists(format!("root key {}", record.id)));
        }
        tx.commit().map_err(sql_err)
    }

    async fn get_root_key(&self, id: &RootKeyId) -> Result<RootKeyRecord> {
        let conn = self.conn()?;
        query_one(&conn, "SELECT body FROM root_keys WHERE id = ?1", [id.to_string()])?
            .ok_or_else(|| Error::NotFound(format!("root key {}", id)))
    }

    async fn active_root_key(&self, org: &OrgId) -> Result<Option<RootKeyRecord>> {
        let conn = self.conn()?;
        query_one(
            &conn,
            "SELECT body FROM root_keys WHERE org = ?1 AND active = 1 ORDER BY rowid DESC LIMIT 1",
            [org.as_str()],
        )
    }

    async fn list_root_keys(&self, org: &OrgId) -> Result<Vec<RootKeyRecord>> {
        let conn = self.conn()?;
        query_all(
            &conn,
            "SELECT body FROM root_keys WHERE org = ?1 ORDER BY rowid",
            [org.as_str()],
        )
    }

    async fn delete_root_key(&self, id: &RootKeyId) -> Result<()> {
        let conn = self.conn()?;
        let deleted = conn
            .execute("DELETE FROM root_keys WHERE id = ?1", [id.to_string()])
            .map_err(sql_err)?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("root key {}", id)));
        }
        debug!(root_key = %id, "Root key row deleted");
        Ok(())
    }

    async fn insert_data_key(&self, record: DataKeyRecord) -> Result<()> {
        let conn = self.conn()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO data_keys (id, org, body) VALUES (?1, ?2, ?3)",
                params![record.id.to_string(), record.org.as_str(), encode(&record)?],
            )
            .map_err(sql_err)?;
        if inserted == 0 {
            return Err(Error::AlreadyExists(format!("data key {}", record.id)));
        }
        Ok(())
    }

    async fn get_data_key(&self, id: &DekId) -> Result<DataKeyRecord> {
        let conn = self.conn()?;
        query_one(&conn, "SELECT body FROM data_keys WHERE id = ?1", [id.to_string()])?
            .ok_or_else(|| Error::NotFound(format!("data key {}", id)))
    }

    async fn list_data_keys(&self, org: &OrgId) -> Result<Vec<DataKeyRecord>> {
        let conn = self.conn()?;
        query_all(
            &conn,
            "SELECT body FROM data_keys WHERE org = ?1 ORDER BY rowid",
            [org.as_str()],
        )
    }

    async fn rewrap_data_keys(&self, records: Vec<DataKeyRecord>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(sql_err)?;
        for record in &records {
            let updated = tx
                .execute(
                    "UPDATE data_keys SET body = ?1 WHERE id = ?2",
                    params![encode(record)?, record.id.to_string()],
                )
                .map_err(sql_err)?;
            if updated == 0 {
                return Err(Error::NotFound(format!("data key {}", record.id)));
            }
        }
        tx.commit().map_err(sql_err)
    }

    async fn get_keyring(&self, project: &ProjectId) -> Result<Option<ProjectKeyring>> {
        let conn = self.conn()?;
        query_one(
            &conn,
            "SELECT body FROM keyrings WHERE project = ?1",
            [project.as_str()],
        )
    }

    async fn insert_keyring(&self, keyring: ProjectKeyring) -> Result<ProjectKeyring> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO keyrings (project, body) VALUES (?1, ?2)",
            params![keyring.project.as_str(), encode(&keyring)?],
        )
        .map_err(sql_err)?;
        query_one(
            &conn,
            "SELECT body FROM keyrings WHERE project = ?1",
            [keyring.project.as_str()],
        )?
        .ok_or_else(|| Error::Storage(format!("keyring for {} vanished", keyring.project)))
    }

    async fn set_current_dek(
        &self,
        project: &ProjectId,
        expected: &DekId,
        new: &DekId,
    ) -> Result<ProjectKeyring> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(sql_err)?;
        let mut keyring: ProjectKeyring = query_one(
            &tx,
            "SELECT body FROM keyrings WHERE project = ?1",
            [project.as_str()],
        )?
        .ok_or_else(|| Error::NotFound(format!("keyring for project {}", project)))?;
        if &keyring.current_dek != expected {
            return Err(Error::ConcurrentModification(format!(
                "project {} current data key changed",
                project
            )));
        }
        keyring.current_dek = *new;
        keyring.updated_at = Utc::now();
        tx.execute(
            "UPDATE keyrings SET body = ?1 WHERE project = ?2",
            params![encode(&keyring)?, project.as_str()],
        )
        .map_err(sql_err)?;
        tx.commit().map_err(sql_err)?;
        Ok(keyring)
    }

    async fn find_folder(
        &self,
        project: &ProjectId,
        environment: &EnvironmentId,
        path_index: &BlindIndex,
    ) -> Result<Option<FolderRecord>> {
        let conn = self.conn()?;
        query_one(
            &conn,
            "SELECT body FROM folders WHERE project = ?1 AND environment = ?2 AND path_index = ?3",
            params![project.as_str(), environment.as_str(), path_index.as_str()],
        )
    }

    async fn insert_folder(&self, record: FolderRecord) -> Result<FolderRecord> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO folders (id, project, environment, path_index, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id.to_string(),
                record.project.as_str(),
                record.environment.as_str(),
                record.path_index.as_str(),
                encode(&record)?
            ],
        )
        .map_err(sql_err)?;
        query_one(
            &conn,
            "SELECT body FROM folders WHERE project = ?1 AND environment = ?2 AND path_index = ?3",
            params![
                record.project.as_str(),
                record.environment.as_str(),
                record.path_index.as_str()
            ],
        )?
        .ok_or_else(|| Error::Storage(format!("folder {} vanished", record.id)))
    }

    async fn get_folder(&self, id: &FolderId) -> Result<FolderRecord> {
        let conn = self.conn()?;
        query_one(&conn, "SELECT body FROM folders WHERE id = ?1", [id.to_string()])?
            .ok_or_else(|| Error::NotFound(format!("folder {}", id)))
    }

    async fn find_secret(
        &self,
        folder: &FolderId,
        index: &BlindIndex,
    ) -> Result<Option<SecretRecord>> {
        let conn = self.conn()?;
        query_one(
            &conn,
            "SELECT body FROM secrets WHERE folder = ?1 AND blind_index = ?2",
            [folder.to_string(), index.as_str().to_string()],
        )
    }

    async fn get_secret(&self, id: &SecretId) -> Result<SecretRecord> {
        let conn = self.conn()?;
        query_one(&conn, "SELECT body FROM secrets WHERE id = ?1", [id.to_string()])?
            .ok_or_else(|| Error::NotFound(format!("secret {}", id)))
    }

    async fn list_secrets(&self, folder: &FolderId) -> Result<Vec<SecretRecord>> {
        let conn = self.conn()?;
        query_all(
            &conn,
            "SELECT body FROM secrets WHERE folder = ?1 ORDER BY rowid",
            [folder.to_string()],
        )
    }

    async fn list_project_secrets(&self, project: &ProjectId) -> Result<Vec<SecretRecord>> {
        let conn = self.conn()?;
        query_all(
            &conn,
            "SELECT body FROM secrets WHERE project = ?1 ORDER BY rowid",
            [project.as_str()],
        )
    }

    async fn get_version(&self, id: &VersionId) -> Result<VersionRecord> {
        let conn = self.conn()?;
        query_one(&conn, "SELECT body FROM versions WHERE id = ?1", [id.to_string()])?
            .ok_or_else(|| Error::NotFound(format!("version {}", id)))
    }

    async fn list_versions(&self, secret: &SecretId) -> Result<Vec<VersionRecord>> {
        let conn = self.conn()?;
        let versions: Vec<VersionRecord> = query_all(
            &conn,
            "SELECT body FROM versions WHERE secret = ?1 ORDER BY seq",
            [secret.to_string()],
        )?;
        if versions.is_empty() {
            return Err(Error::NotFound(format!("secret {}", secret)));
        }
        Ok(versions)
    }

    async fn apply_commit(&self, batch: CommitBatch) -> Result<CommitRecord> {
        validate_batch(&batch)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(sql_err)?;

        let folder_exists: Option<String> = tx
            .query_row(
                "SELECT id FROM folders WHERE id = ?1",
                [batch.folder.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        if folder_exists.is_none() {
            return Err(Error::NotFound(format!("folder {}", batch.folder)));
        }

        let mut heads = Vec::with_capacity(batch.writes.len());
        for write in &batch.writes {
            let current = load_secret(&tx, &write.version.secret)?;
            let owner = load_name_owner(&tx, &batch.folder, &write.version.blind_index)?;
            check_write(current.as_ref(), owner.as_ref(), write)?;
            heads.push(current);
        }

        for (write, current) in batch.writes.iter().zip(heads) {
            let version = &write.version;
            tx.execute(
                "INSERT INTO versions (id, secret, seq, body) VALUES (?1, ?2, ?3, ?4)",
                params![
                    version.id.to_string(),
                    version.secret.to_string(),
                    version.seq as i64,
                    encode(version)?
                ],
            )
            .map_err(sql_err)?;

            let secret = match current {
                Some(mut secret) => {
                    secret.advance(version);
                    secret
                }
                None => SecretRecord::from_first_version(version, batch.folder),
            };
            tx.execute(
                "INSERT INTO secrets (id, project, folder, blind_index, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET blind_index = excluded.blind_index, body = excluded.body",
                params![
                    secret.id.to_string(),
                    secret.project.as_str(),
                    secret.folder.to_string(),
                    secret.blind_index.as_str(),
                    encode(&secret)?
                ],
            )
            .map_err(sql_err)?;
        }

        let last_seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM commits WHERE folder = ?1",
                [batch.folder.to_string()],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        let record = batch.into_record(last_seq as u64 + 1);
        tx.execute(
            "INSERT INTO commits (id, folder, seq, body) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id.to_string(),
                record.folder.to_string(),
                record.seq as i64,
                encode(&record)?
            ],
        )
        .map_err(sql_err)?;

        tx.commit().map_err(sql_err)?;
        debug!(folder = %record.folder, seq = record.seq, "Commit applied");
        Ok(record)
    }

    async fn get_commit(&self, id: &CommitId) -> Result<CommitRecord> {
        let conn = self.conn()?;
        query_one(&conn, "SELECT body FROM commits WHERE id = ?1", [id.to_string()])?
            .ok_or_else(|| Error::NotFound(format!("commit {}", id)))
    }

    async fn list_commits(
        &self,
        folder: &FolderId,
        after: u64,
        up_to: Option<u64>,
    ) -> Result<Vec<CommitRecord>> {
        let conn = self.conn()?;
        let up_to = up_to.map_or(i64::MAX, |max| max as i64);
        query_all(
            &conn,
            "SELECT body FROM commits WHERE folder = ?1 AND seq > ?2 AND seq <= ?3 ORDER BY seq",
            params![folder.to_string(), after as i64, up_to],
        )
    }

    async fn latest_commit(&self, folder: &FolderId) -> Result<Option<CommitRecord>> {
        let conn = self.conn()?;
        query_one(
            &conn,
            "SELECT body FROM commits WHERE folder = ?1 ORDER BY seq DESC LIMIT 1",
            [folder.to_string()],
        )
    }

    async fn insert_checkpoint(&self, checkpoint: CheckpointRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO checkpoints (folder, commit_seq, body) VALUES (?1, ?2, ?3)",
            params![
                checkpoint.folder.to_string(),
                checkpoint.commit_seq as i64,
                encode(&checkpoint)?
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn nearest_checkpoint(
        &self,
        folder: &FolderId,
        at_seq: u64,
    ) -> Result<Option<CheckpointRecord>> {
        let conn = self.conn()?;
        query_one(
            &conn,
            "SELECT body FROM checkpoints WHERE folder = ?1 AND commit_seq <= ?2
             ORDER BY commit_seq DESC LIMIT 1",
            params![folder.to_string(), at_seq as i64],
        )
    }
}
