mod common;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::*;
use vaultline_common::{AuditEvent, AuditSink, Error, OrgId, Result, SensitiveBytes};
use vaultline_crypto::PlatformMasterKey;
use vaultline_keys::{KmsClient, LocalKms};
use vaultline_storage::{MemoryStore, SqliteStore, VersionOrigin};
use vaultline_vault::{SecretStore, StoreConfig};

/// KMS that hangs once `stalled` is set.
struct FlakyKms {
    inner: LocalKms,
    stalled: AtomicBool,
}

#[async_trait]
impl KmsClient for FlakyKms {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn wrap(&self, org: &OrgId, plaintext: &[u8]) -> Result<Vec<u8>> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.wrap(org, plaintext).await
    }

    async fn unwrap(&self, org: &OrgId, ciphertext: &[u8]) -> Result<SensitiveBytes> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.unwrap(org, ciphertext).await
    }
}

struct FailingSink;

impl AuditSink for FailingSink {
    fn record(&self, _event: &AuditEvent) -> Result<()> {
        Err(Error::Storage("audit backend down".to_string()))
    }
}

#[tokio::test]
async fn test_root_rotation_preserves_readability() {
    let f = fixture().await;
    put(&f, "A", "alpha").await;
    put(&f, "B", "beta").await;

    f.store.rotate_root_key(&f.org).await.unwrap();
    f.store.keys().evict_org(&f.org);

    assert_eq!(read_str(&f, "A").await.unwrap(), "alpha");
    assert_eq!(read_str(&f, "B").await.unwrap(), "beta");

    // Writes after rotation land under the same data key and stay readable.
    put(&f, "A", "alpha2").await;
    assert_eq!(read_str(&f, "A").await.unwrap(), "alpha2");
}

#[tokio::test]
async fn test_purged_root_key_does_not_break_reads() {
    let config = StoreConfig {
        root_key_grace_secs: 0,
        ..test_config()
    };
    let f = fixture_with(Arc::new(MemoryStore::new()), None, config).await;
    put(&f, "A", "alpha").await;

    let old = f.store.keys().keyring(&f.project).await.unwrap();
    f.store.rotate_root_key(&f.org).await.unwrap();
    let purged = f.store.purge_retired_root_keys(&f.org).await.unwrap();
    assert_eq!(purged.len(), 1);

    f.store.keys().evict_org(&f.org);
    assert_eq!(read_str(&f, "A").await.unwrap(), "alpha");
    assert_eq!(
        f.store.keys().keyring(&f.project).await.unwrap().current_dek,
        old.current_dek
    );
}

#[tokio::test]
async fn test_stalled_kms_surfaces_key_unavailable() {
    let kms = Arc::new(FlakyKms {
        inner: LocalKms::new(PlatformMasterKey::generate()),
        stalled: AtomicBool::new(false),
    });
    let store = SecretStore::builder(Arc::new(MemoryStore::new()), kms.clone())
        .with_config(StoreConfig {
            kms_timeout_ms: 50,
            ..test_config()
        })
        .build()
        .unwrap();
    let f = Fixture {
        store,
        audit: Arc::new(vaultline_common::MemoryAuditSink::new()),
        org: OrgId::new("acme").unwrap(),
        project: vaultline_common::ProjectId::new("p1").unwrap(),
    };
    f.store.provision_org(&f.org).await.unwrap();
    f.store.register_project(&f.org, &f.project).await.unwrap();
    put(&f, "A", "alpha").await;

    kms.stalled.store(true, Ordering::SeqCst);
    f.store.keys().evict_org(&f.org);

    let err = read_str(&f, "A").await.unwrap_err();
    assert!(matches!(err, Error::KeyUnavailable(_)));
    assert!(err.is_retryable());

    kms.stalled.store(false, Ordering::SeqCst);
    assert_eq!(read_str(&f, "A").await.unwrap(), "alpha");
}

#[tokio::test]
async fn test_failing_audit_sink_does_not_block() {
    let store = SecretStore::builder(
        Arc::new(MemoryStore::new()),
        Arc::new(LocalKms::new(PlatformMasterKey::generate())),
    )
    .with_audit_sink(Arc::new(FailingSink))
    .with_config(test_config())
    .build()
    .unwrap();
    let org = OrgId::new("acme").unwrap();
    let project = vaultline_common::ProjectId::new("p1").unwrap();
    store.provision_org(&org).await.unwrap();
    store.register_project(&org, &project).await.unwrap();

    let secret = secret(&project, "A");
    let outcome = store.create(&secret, value("alpha"), &actor()).await.unwrap();
    assert!(outcome.is_applied());
    assert_eq!(store.read(&secret).await.unwrap().as_bytes(), b"alpha");
    assert!(store.audit().is_degraded());
    assert!(store.audit().failed_events() > 0);
}

#[tokio::test]
async fn test_data_key_rotation_reencrypts_everything() {
    let f = fixture().await;
    for key in ["A", "B", "C", "D", "E"] {
        put(&f, key, &format!("{}-value", key)).await;
    }
    applied(
        f.store
            .delete(&secret(&f.project, "E"), &actor())
            .await
            .unwrap(),
    );
    let before = f.store.keys().keyring(&f.project).await.unwrap();

    let progress = f.store.rotate_data_key(&f.project).await.unwrap();
    assert!(progress.is_complete());
    assert_eq!(progress.total, 4);
    assert_eq!(progress.rotated, 4);
    assert_ne!(progress.current_dek, before.current_dek);

    for key in ["A", "B", "C", "D"] {
        assert_eq!(read_str(&f, key).await.unwrap(), format!("{}-value", key));
        let history = f.store.history(&secret(&f.project, key)).await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.dek, progress.current_dek);
        assert_eq!(
            last.origin,
            VersionOrigin::Rotation {
                from_dek: before.current_dek
            }
        );
        assert_eq!(last.actor.as_str(), "system:key-rotation");
    }

    // Tombstones are left alone; lookups by name still work.
    let deleted = f.store.history(&secret(&f.project, "E")).await.unwrap();
    assert_eq!(deleted.len(), 2);
    assert!(f
        .store
        .create(&secret(&f.project, "A"), value("dup"), &actor())
        .await
        .is_err());
}

#[tokio::test]
async fn test_data_key_rotation_is_resumable() {
    let config = StoreConfig {
        rotation_batch_size: 2,
        ..test_config()
    };
    let f = fixture_with(Arc::new(MemoryStore::new()), None, config).await;
    for key in ["A", "B", "C", "D", "E"] {
        put(&f, key, "v").await;
    }

    f.store
        .keys()
        .begin_data_key_rotation(&f.project)
        .await
        .unwrap();
    let job = f.store.data_key_rotation(&f.project);
    let report = job.run_batch(2).await.unwrap();
    assert_eq!(report.rotated, 2);

    let progress = f.store.data_key_rotation_progress(&f.project).await.unwrap();
    assert_eq!(progress.remaining, 3);

    // A foreground write to a stale secret takes it off the remaining set.
    let mut stale = None;
    for key in ["A", "B", "C", "D", "E"] {
        let history = f.store.history(&secret(&f.project, key)).await.unwrap();
        if history.last().unwrap().dek != progress.current_dek {
            stale = Some(key);
            break;
        }
    }
    put(&f, stale.unwrap(), "w").await;
    let progress = f.store.data_key_rotation_progress(&f.project).await.unwrap();
    assert_eq!(progress.remaining, 2);

    let finished = f.store.resume_data_key_rotation(&f.project).await.unwrap();
    assert!(finished.is_complete());
    assert_eq!(finished.total, 5);
}

#[tokio::test]
async fn test_unreadable_head_does_not_block_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("ledger.db");
    let ledger = Arc::new(SqliteStore::open(&db).unwrap());
    let config = StoreConfig {
        rotation_batch_size: 1,
        ..test_config()
    };
    let f = fixture_with(ledger, None, config).await;

    let bad = put(&f, "A", "alpha").await;
    put(&f, "B", "beta").await;
    put(&f, "C", "gamma").await;
    tamper_version(&db, &bad.version);

    let progress = f.store.rotate_data_key(&f.project).await.unwrap();
    assert_eq!(progress.total, 3);
    assert_eq!(progress.rotated, 2);
    assert_eq!(progress.remaining, 1);
    assert_eq!(progress.unreadable, vec![bad.secret]);
    assert!(progress.is_exhausted());
    assert!(!progress.is_complete());

    for key in ["B", "C"] {
        let history = f.store.history(&secret(&f.project, key)).await.unwrap();
        assert_eq!(history.last().unwrap().dek, progress.current_dek);
    }
}

#[tokio::test]
async fn test_batch_reports_skipped_heads() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("ledger.db");
    let ledger = Arc::new(SqliteStore::open(&db).unwrap());
    let f = fixture_with(ledger, None, test_config()).await;

    let bad = put(&f, "A", "alpha").await;
    put(&f, "B", "beta").await;
    tamper_version(&db, &bad.version);

    f.store
        .keys()
        .begin_data_key_rotation(&f.project)
        .await
        .unwrap();
    let job = f.store.data_key_rotation(&f.project);
    let report = job.run_batch(1).await.unwrap();
    assert_eq!(report.rotated, 1);
    assert_eq!(report.unreadable, vec![bad.secret]);

    // Known-unreadable heads are passed over on the next batch.
    let report = job.run_batch(1).await.unwrap();
    assert_eq!(report.rotated, 0);
    assert!(report.unreadable.is_empty());
    assert_eq!(job.progress().await.unwrap().unreadable, vec![bad.secret]);
}

#[tokio::test]
async fn test_rotation_progress_is_audited() {
    let f = fixture().await;
    put(&f, "A", "v").await;
    f.store.rotate_data_key(&f.project).await.unwrap();

    let events = f.audit.events();
    assert!(events.iter().any(|e| matches!(
        e.kind,
        vaultline_common::AuditKind::DataKeyRotationStarted { .. }
    )));
    assert!(events.iter().any(|e| matches!(
        e.kind,
        vaultline_common::AuditKind::DataKeyRotationProgress { remaining: 0, .. }
    )));
}
