#![allow(dead_code)]

use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};

use vaultline_common::{
    Actor, EnvironmentId, FolderPath, FolderRef, MemoryAuditSink, OrgId, ProjectId, Result,
    SecretRef, SensitiveBytes, VersionId,
};
use vaultline_crypto::PlatformMasterKey;
use vaultline_keys::{KmsClient, LocalKms};
use vaultline_storage::{LedgerStore, MemoryStore};
use vaultline_vault::{
    GateDecision, MutationDescriptor, MutationGate, MutationOutcome, SecretStore, StoreConfig,
    WriteReceipt,
};

pub struct Fixture {
    pub store: SecretStore,
    pub audit: Arc<MemoryAuditSink>,
    pub org: OrgId,
    pub project: ProjectId,
}

pub fn test_config() -> StoreConfig {
    StoreConfig {
        retry_initial_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..StoreConfig::default()
    }
}

pub async fn fixture_with(
    ledger: Arc<dyn LedgerStore>,
    gate: Option<Arc<dyn MutationGate>>,
    config: StoreConfig,
) -> Fixture {
    let audit = Arc::new(MemoryAuditSink::new());
    let kms: Arc<dyn KmsClient> = Arc::new(LocalKms::new(PlatformMasterKey::generate()));
    let mut builder = SecretStore::builder(ledger, kms)
        .with_audit_sink(audit.clone())
        .with_config(config);
    if let Some(gate) = gate {
        builder = builder.with_gate(gate);
    }
    let store = builder.build().unwrap();

    let org = OrgId::new("acme").unwrap();
    let project = ProjectId::new("p1").unwrap();
    store.provision_org(&org).await.unwrap();
    store.register_project(&org, &project).await.unwrap();
    Fixture {
        store,
        audit,
        org,
        project,
    }
}

pub async fn fixture() -> Fixture {
    fixture_with(Arc::new(MemoryStore::new()), None, test_config()).await
}

pub fn folder(project: &ProjectId) -> FolderRef {
    FolderRef::new(
        project.clone(),
        EnvironmentId::new("dev").unwrap(),
        FolderPath::root(),
    )
}

pub fn secret(project: &ProjectId, key: &str) -> SecretRef {
    folder(project).secret(key).unwrap()
}

pub fn actor() -> Actor {
    Actor::new("user:alice").unwrap()
}

pub fn value(s: &str) -> SensitiveBytes {
    SensitiveBytes::new(s.as_bytes().to_vec())
}

pub fn applied<T>(outcome: MutationOutcome<T>) -> T {
    match outcome {
        MutationOutcome::Applied(value) => value,
        other => panic!("mutation not applied: {:?}", other.map(|_| ())),
    }
}

pub async fn put(fixture: &Fixture, key: &str, v: &str) -> WriteReceipt {
    let secret = secret(&fixture.project, key);
    let outcome = match fixture.store.read(&secret).await {
        Ok(_) => fixture.store.update(&secret, value(v), &actor()).await,
        Err(_) => fixture.store.create(&secret, value(v), &actor()).await,
    };
    applied(outcome.unwrap())
}

pub async fn read_str(fixture: &Fixture, key: &str) -> Result<String> {
    let bytes = fixture.store.read(&secret(&fixture.project, key)).await?;
    Ok(String::from_utf8(bytes.as_bytes().to_vec()).unwrap())
}

/// Flip one bit of a stored version's authentication tag.
pub fn tamper_version(db: &Path, version: &VersionId) {
    let conn = rusqlite::Connection::open(db).unwrap();
    let body: String = conn
        .query_row(
            "SELECT body FROM versions WHERE id = ?1",
            [version.to_string()],
            |row| row.get(0),
        )
        .unwrap();
    let mut doc: serde_json::Value = serde_json::from_str(&body).unwrap();
    let byte = doc["value"]["tag"][0].as_u64().unwrap();
    doc["value"]["tag"][0] = serde_json::Value::from(byte ^ 1);
    conn.execute(
        "UPDATE versions SET body = ?1 WHERE id = ?2",
        [doc.to_string(), version.to_string()],
    )
    .unwrap();
}

/// Gate returning a fixed decision and remembering what it was asked.
pub struct ScriptedGate {
    decision: GateDecision,
    seen: Mutex<Vec<MutationDescriptor>>,
}

impl ScriptedGate {
    pub fn new(decision: GateDecision) -> Self {
        Self {
            decision,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<MutationDescriptor> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MutationGate for ScriptedGate {
    async fn before_apply(&self, mutation: &MutationDescriptor) -> Result<GateDecision> {
        self.seen.lock().unwrap().push(mutation.clone());
        Ok(self.decision.clone())
    }
}
