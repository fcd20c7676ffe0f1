mod common;

use std::sync::Arc;

use common::*;
use vaultline_common::{AuditKind, AuditOutcome, Error, FolderPath, FolderRef};
use vaultline_storage::{MemoryStore, SqliteStore, VersionOrigin};
use vaultline_vault::{
    BatchChange, ChangeKind, DiffEntry, DiffOptions, GateDecision, MutationDescriptor,
    MutationGate, MutationOutcome, StoreConfig,
};

#[tokio::test]
async fn test_create_update_read_at() {
    let f = fixture().await;
    let first = put(&f, "DB_PASS", "s3cr3t").await;
    assert_eq!(read_str(&f, "DB_PASS").await.unwrap(), "s3cr3t");

    let second = put(&f, "DB_PASS", "s3cr3t2").await;
    assert_eq!(read_str(&f, "DB_PASS").await.unwrap(), "s3cr3t2");
    assert_eq!(second.seq, 2);
    assert_eq!(second.secret, first.secret);

    let secret = secret(&f.project, "DB_PASS");
    let at_first = f.store.read_at(&secret, &first.commit).await.unwrap();
    assert_eq!(at_first.as_bytes(), b"s3cr3t");
}

#[tokio::test]
async fn test_lookup_is_case_and_whitespace_insensitive() {
    let f = fixture().await;
    put(&f, "DB_PASS", "v").await;

    let other = secret(&f.project, "  db_pass ");
    assert_eq!(f.store.read(&other).await.unwrap().as_bytes(), b"v");
    let result = f.store.create(&other, value("again"), &actor()).await;
    assert!(matches!(result, Err(Error::AlreadyExists(_))));
}

#[tokio::test]
async fn test_read_missing_is_not_found() {
    let f = fixture().await;
    let result = f.store.read(&secret(&f.project, "NOPE")).await;
    assert!(matches!(result, Err(Error::NotFound(_))));

    let result = f
        .store
        .update(&secret(&f.project, "NOPE"), value("x"), &actor())
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_concurrent_update_from_one_wins() {
    let f = fixture().await;
    let base = put(&f, "API_KEY", "v1").await;
    let secret = secret(&f.project, "API_KEY");

    let actor_a = actor();
    let actor_b = actor();
    let (a, b) = tokio::join!(
        f.store
            .update_from(&secret, value("from-a"), &actor_a, &base.version),
        f.store
            .update_from(&secret, value("from-b"), &actor_b, &base.version),
    );

    let results = [a, b];
    let won: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
    let lost: Vec<_> = results
        .iter()
        .filter(|r| matches!(r, Err(Error::ConcurrentModification(_))))
        .collect();
    assert_eq!(won.len(), 1);
    assert_eq!(lost.len(), 1);

    let history = f.store.history(&secret).await.unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn test_concurrent_updates_retry_to_success() {
    let f = Arc::new(fixture().await);
    put(&f, "COUNTER", "0").await;

    let mut handles = Vec::new();
    for i in 0..4 {
        let f = f.clone();
        handles.push(tokio::spawn(async move {
            let secret = secret(&f.project, "COUNTER");
            f.store
                .update(&secret, value(&i.to_string()), &actor())
                .await
                .map(|o| o.is_applied())
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap());
    }

    let history = f.store.history(&secret(&f.project, "COUNTER")).await.unwrap();
    assert_eq!(history.len(), 5);
    let seqs: Vec<u64> = history.iter().map(|v| v.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_delete_then_rollback_restores_value() {
    let f = fixture().await;
    let created = put(&f, "TOKEN", "abc").await;
    let secret = secret(&f.project, "TOKEN");

    applied(f.store.delete(&secret, &actor()).await.unwrap());
    assert!(matches!(f.store.read(&secret).await, Err(Error::NotFound(_))));
    assert!(matches!(
        f.store.delete(&secret, &actor()).await,
        Err(Error::NotFound(_))
    ));

    let restored = applied(
        f.store
            .rollback(&secret, &created.version, &actor())
            .await
            .unwrap(),
    );
    assert_eq!(restored.seq, 3);
    assert_eq!(f.store.read(&secret).await.unwrap().as_bytes(), b"abc");
}

#[tokio::test]
async fn test_rollback_is_not_destructive() {
    let f = fixture().await;
    let v1 = put(&f, "URL", "one").await;
    let v2 = put(&f, "URL", "two").await;
    let secret = secret(&f.project, "URL");

    let rolled = applied(f.store.rollback(&secret, &v1.version, &actor()).await.unwrap());
    assert_eq!(f.store.read(&secret).await.unwrap().as_bytes(), b"one");

    let history = f.store.history(&secret).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].version, rolled.version);
    assert_eq!(
        history[2].origin,
        VersionOrigin::Rollback {
            from: Some(v2.version),
            to: v1.version
        }
    );
    assert_eq!(
        f.store.read_version(&secret, &v2.version).await.unwrap().as_bytes(),
        b"two"
    );
}

#[tokio::test]
async fn test_rollback_rejects_foreign_and_tombstone_targets() {
    let f = fixture().await;
    let other = put(&f, "OTHER", "x").await;
    put(&f, "MINE", "y").await;
    let mine = secret(&f.project, "MINE");

    let result = f.store.rollback(&mine, &other.version, &actor()).await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));

    let deleted = applied(f.store.delete(&mine, &actor()).await.unwrap());
    let result = f.store.rollback(&mine, &deleted.version, &actor()).await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_create_after_delete_reuses_chain() {
    let f = fixture().await;
    let first = put(&f, "K", "a").await;
    let secret = secret(&f.project, "K");
    applied(f.store.delete(&secret, &actor()).await.unwrap());

    let revived = applied(f.store.create(&secret, value("b"), &actor()).await.unwrap());
    assert_eq!(revived.secret, first.secret);
    assert_eq!(revived.seq, 3);
}

#[tokio::test]
async fn test_replay_matches_read() {
    let f = fixture().await;
    put(&f, "A", "1").await;
    put(&f, "B", "1").await;
    put(&f, "A", "2").await;
    applied(
        f.store
            .delete(&secret(&f.project, "B"), &actor())
            .await
            .unwrap(),
    );
    let last = put(&f, "C", "1").await;

    let record = f
        .store
        .log()
        .find_folder(&folder(&f.project))
        .await
        .unwrap()
        .unwrap();
    let commits = f.store.list_commits(&folder(&f.project)).await.unwrap();
    let latest = commits.last().unwrap();
    assert_eq!(latest.id, last.commit);

    let state = f.store.log().state_at(&record.id, latest.seq).await.unwrap();
    let listing = f.store.list_secrets(&folder(&f.project)).await.unwrap();
    assert_eq!(state.len(), listing.len());
    for entry in listing {
        assert_eq!(state.get(&entry.secret), Some(&entry.version));
        let via_replay = f
            .store
            .read_at(&secret(&f.project, &entry.name), &latest.id)
            .await
            .unwrap();
        let via_read = f
            .store
            .read(&secret(&f.project, &entry.name))
            .await
            .unwrap();
        assert_eq!(via_replay, via_read);
    }
}

#[tokio::test]
async fn test_replay_across_checkpoints() {
    let config = StoreConfig {
        checkpoint_window: 3,
        ..test_config()
    };
    let f = fixture_with(Arc::new(MemoryStore::new()), None, config).await;
    let mut receipts = Vec::new();
    for i in 0..10 {
        receipts.push(put(&f, "ROLLING", &i.to_string()).await);
    }

    let secret = secret(&f.project, "ROLLING");
    for (i, receipt) in receipts.iter().enumerate() {
        let at = f.store.read_at(&secret, &receipt.commit).await.unwrap();
        assert_eq!(at.as_bytes(), i.to_string().as_bytes());
    }
}

#[tokio::test]
async fn test_read_at_before_creation_is_not_found() {
    let f = fixture().await;
    let early = put(&f, "EARLY", "x").await;
    put(&f, "LATE", "y").await;

    let result = f
        .store
        .read_at(&secret(&f.project, "LATE"), &early.commit)
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_read_at_rejects_commit_of_other_folder() {
    let f = fixture().await;
    let elsewhere = FolderRef::new(
        f.project.clone(),
        folder(&f.project).environment,
        FolderPath::parse("/db").unwrap(),
    );
    let other = applied(
        f.store
            .create(&elsewhere.secret("X").unwrap(), value("x"), &actor())
            .await
            .unwrap(),
    );
    put(&f, "Y", "y").await;

    let result = f
        .store
        .read_at(&secret(&f.project, "Y"), &other.commit)
        .await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_diff_kinds_and_anti_symmetry() {
    let f = fixture().await;
    put(&f, "KEEP", "k").await;
    put(&f, "CHANGE", "1").await;
    let from = put(&f, "DROP", "d").await;

    put(&f, "CHANGE", "2").await;
    put(&f, "NEW", "n").await;
    let to = applied(
        f.store
            .delete(&secret(&f.project, "DROP"), &actor())
            .await
            .unwrap(),
    );

    let forward = f
        .store
        .compare_folder_states(&from.commit, &to.commit, DiffOptions::default())
        .await
        .unwrap();
    let backward = f
        .store
        .compare_folder_states(&to.commit, &from.commit, DiffOptions::default())
        .await
        .unwrap();

    let kind_of = |entries: &[DiffEntry], name: &str| {
        entries
            .iter()
            .find(|e| e.name.as_deref() == Some(name))
            .map(|e| e.kind)
    };
    assert_eq!(forward.len(), 3);
    assert_eq!(kind_of(&forward, "NEW"), Some(ChangeKind::Added));
    assert_eq!(kind_of(&forward, "DROP"), Some(ChangeKind::Removed));
    assert_eq!(kind_of(&forward, "CHANGE"), Some(ChangeKind::Modified));
    assert_eq!(kind_of(&backward, "NEW"), Some(ChangeKind::Removed));
    assert_eq!(kind_of(&backward, "DROP"), Some(ChangeKind::Added));
    assert_eq!(kind_of(&backward, "CHANGE"), Some(ChangeKind::Modified));
}

#[tokio::test]
async fn test_diff_suppresses_identical_content() {
    let f = fixture().await;
    let v1 = put(&f, "SAME", "x").await;
    put(&f, "SAME", "y").await;
    let rolled = applied(
        f.store
            .rollback(&secret(&f.project, "SAME"), &v1.version, &actor())
            .await
            .unwrap(),
    );

    let plain = f
        .store
        .compare_folder_states(&v1.commit, &rolled.commit, DiffOptions::default())
        .await
        .unwrap();
    assert_eq!(plain.len(), 1);

    let suppressed = f
        .store
        .compare_folder_states(
            &v1.commit,
            &rolled.commit,
            DiffOptions {
                suppress_unchanged: true,
            },
        )
        .await
        .unwrap();
    assert!(suppressed.is_empty());
}

#[tokio::test]
async fn test_folder_path_not_persisted_in_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("ledger.db");
    let ledger = Arc::new(SqliteStore::open(&db).unwrap());
    let f = fixture_with(ledger, None, test_config()).await;

    let location = FolderRef::new(
        f.project.clone(),
        vaultline_common::EnvironmentId::new("dev").unwrap(),
        FolderPath::parse("/payments-acquirer-stripe").unwrap(),
    );
    let secret = location.secret("API_KEY").unwrap();
    applied(f.store.create(&secret, value("sk_live"), &actor()).await.unwrap());

    let conn = rusqlite::Connection::open(&db).unwrap();
    let rows: Vec<String> = conn
        .prepare("SELECT id || project || environment || path_index || body FROM folders")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<std::result::Result<_, _>>()
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].contains("acquirer"));

    assert_eq!(f.store.read(&secret).await.unwrap().as_bytes(), b"sk_live");
    let listed = f.store.list_secrets(&location).await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn test_tampered_version_is_unreadable() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("ledger.db");
    let ledger = Arc::new(SqliteStore::open(&db).unwrap());
    let f = fixture_with(ledger, None, test_config()).await;

    let from = put(&f, "GOOD", "g").await;
    let bad = put(&f, "BAD", "b").await;
    let to = put(&f, "GOOD", "g2").await;
    tamper_version(&db, &bad.version);

    let result = f.store.read(&secret(&f.project, "BAD")).await;
    match result {
        Err(err @ Error::DecryptionFailed(_)) => {
            assert_eq!(err.public_message(), "secret unreadable");
        }
        other => panic!("expected DecryptionFailed, got {:?}", other.map(|_| ())),
    }
    assert_eq!(read_str(&f, "GOOD").await.unwrap(), "g2");

    let first = f.store.list_commits(&folder(&f.project)).await.unwrap()[0].clone();
    assert_eq!(first.id, from.commit);
    let diff = f
        .store
        .compare_folder_states(&first.id, &to.commit, DiffOptions::default())
        .await
        .unwrap();
    let bad_entry = diff.iter().find(|e| e.secret == bad.secret).unwrap();
    assert_eq!(bad_entry.kind, ChangeKind::Unreadable);
    let good_entry = diff.iter().find(|e| e.secret == from.secret).unwrap();
    assert_eq!(good_entry.kind, ChangeKind::Modified);
}

#[tokio::test]
async fn test_blind_index_differs_across_projects() {
    let f = fixture().await;
    let other = vaultline_common::ProjectId::new("p2").unwrap();
    f.store.register_project(&f.org, &other).await.unwrap();

    let a = f.store.keys().indexer(&f.project).await.unwrap();
    let b = f.store.keys().indexer(&other).await.unwrap();
    assert_ne!(a.index("DB_PASS").unwrap(), b.index("DB_PASS").unwrap());

    // The same name in both projects resolves to independent secrets.
    let in_a = put(&f, "DB_PASS", "a").await;
    let in_b = applied(
        f.store
            .create(&secret(&other, "DB_PASS"), value("b"), &actor())
            .await
            .unwrap(),
    );
    assert_ne!(in_a.secret, in_b.secret);
}

#[tokio::test]
async fn test_commit_batch_is_atomic() {
    let f = fixture().await;
    put(&f, "OLD", "o").await;
    let folder = folder(&f.project);

    let receipt = applied(
        f.store
            .commit_batch(
                &folder,
                vec![
                    BatchChange::Set {
                        key: "A".to_string(),
                        value: value("1"),
                    },
                    BatchChange::Set {
                        key: "OLD".to_string(),
                        value: value("o2"),
                    },
                ],
                &actor(),
                Some("seed".to_string()),
            )
            .await
            .unwrap(),
    );
    assert_eq!(receipt.writes.len(), 2);
    assert_eq!(read_str(&f, "A").await.unwrap(), "1");
    assert_eq!(read_str(&f, "OLD").await.unwrap(), "o2");

    // Deleting a missing key fails the whole batch.
    let result = f
        .store
        .commit_batch(
            &folder,
            vec![
                BatchChange::Set {
                    key: "B".to_string(),
                    value: value("2"),
                },
                BatchChange::Delete {
                    key: "MISSING".to_string(),
                },
            ],
            &actor(),
            None,
        )
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));
    assert!(matches!(read_str(&f, "B").await, Err(Error::NotFound(_))));

    let result = f
        .store
        .commit_batch(
            &folder,
            vec![
                BatchChange::Set {
                    key: "dup".to_string(),
                    value: value("1"),
                },
                BatchChange::Delete {
                    key: "DUP".to_string(),
                },
            ],
            &actor(),
            None,
        )
        .await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));

    let commits = f.store.list_commits(&folder).await.unwrap();
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[1].message.as_deref(), Some("seed"));
}

#[tokio::test]
async fn test_revert_commit_restores_prior_state() {
    let f = fixture().await;
    put(&f, "A", "a1").await;
    let folder = folder(&f.project);
    let batch = applied(
        f.store
            .commit_batch(
                &folder,
                vec![
                    BatchChange::Set {
                        key: "A".to_string(),
                        value: value("a2"),
                    },
                    BatchChange::Set {
                        key: "B".to_string(),
                        value: value("b1"),
                    },
                ],
                &actor(),
                None,
            )
            .await
            .unwrap(),
    );

    let reverted = applied(f.store.revert_commit(&batch.commit, &actor()).await.unwrap());
    assert_eq!(reverted.writes.len(), 2);
    assert_eq!(read_str(&f, "A").await.unwrap(), "a1");
    assert!(matches!(read_str(&f, "B").await, Err(Error::NotFound(_))));

    let history = f.store.history(&secret(&f.project, "A")).await.unwrap();
    assert_eq!(
        history.last().unwrap().origin,
        VersionOrigin::Revert {
            commit: batch.commit
        }
    );

    // Reverting again changes nothing.
    let again = f.store.revert_commit(&batch.commit, &actor()).await;
    assert!(matches!(again, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_denied_mutation_has_no_side_effects() {
    let gate = Arc::new(ScriptedGate::new(GateDecision::Deny {
        policy: "prod-freeze".to_string(),
        reason: "change freeze".to_string(),
    }));
    let f = fixture_with(
        Arc::new(MemoryStore::new()),
        Some(gate.clone() as Arc<dyn MutationGate>),
        test_config(),
    )
    .await;
    let secret = secret(&f.project, "DB_PASS");
    let events_before = f.audit.events().len();

    let outcome = f.store.create(&secret, value("x"), &actor()).await.unwrap();
    // The gate decision is the only event; no key was touched.
    assert_eq!(f.audit.events().len(), events_before + 1);
    assert_eq!(
        outcome,
        MutationOutcome::Denied {
            policy: "prod-freeze".to_string(),
            reason: "change freeze".to_string(),
        }
    );
    assert!(matches!(f.store.read(&secret).await, Err(Error::NotFound(_))));
    assert!(f.store.list_commits(&folder(&f.project)).await.unwrap().is_empty());

    assert!(matches!(gate.seen()[0], MutationDescriptor::Create { .. }));
    let gated = f
        .audit
        .events()
        .into_iter()
        .filter(|e| matches!(e.kind, AuditKind::MutationGated { .. }))
        .collect::<Vec<_>>();
    assert_eq!(gated.len(), 1);
    assert_eq!(gated[0].outcome, AuditOutcome::Denied);
}

#[tokio::test]
async fn test_deferred_mutation_returns_pending() {
    let gate = Arc::new(ScriptedGate::new(GateDecision::Defer {
        pending_request_id: "req-42".to_string(),
    }));
    let f = fixture_with(
        Arc::new(MemoryStore::new()),
        Some(gate.clone() as Arc<dyn MutationGate>),
        test_config(),
    )
    .await;
    let folder = folder(&f.project);
    let unwraps = |events: &[vaultline_common::AuditEvent]| {
        events
            .iter()
            .filter(|e| matches!(e.kind, AuditKind::DataKeyUnwrapped { .. }))
            .count()
    };
    let before = unwraps(&f.audit.events());

    let outcome = f
        .store
        .commit_batch(
            &folder,
            vec![
                BatchChange::Set {
                    key: "A".to_string(),
                    value: value("1"),
                },
                BatchChange::Delete {
                    key: "B".to_string(),
                },
            ],
            &actor(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        MutationOutcome::PendingApproval {
            request_id: "req-42".to_string()
        }
    );
    assert_eq!(unwraps(&f.audit.events()), before);
    assert!(f.store.list_commits(&folder).await.unwrap().is_empty());

    match &gate.seen()[0] {
        MutationDescriptor::Batch { changes, .. } => {
            assert!(matches!(changes[0], MutationDescriptor::Set { .. }));
            assert!(matches!(changes[1], MutationDescriptor::Delete { .. }));
        }
        other => panic!("unexpected descriptor {:?}", other),
    }
}

#[tokio::test]
async fn test_mutations_are_audited() {
    let f = fixture().await;
    let v1 = put(&f, "A", "1").await;
    put(&f, "A", "2").await;
    applied(
        f.store
            .rollback(&secret(&f.project, "A"), &v1.version, &actor())
            .await
            .unwrap(),
    );

    let events = f.audit.events();
    let mutated = events
        .iter()
        .filter(|e| matches!(e.kind, AuditKind::SecretMutated { .. }))
        .count();
    let rolled_back = events
        .iter()
        .filter(|e| matches!(e.kind, AuditKind::SecretRolledBack { .. }))
        .count();
    assert_eq!(mutated, 3);
    assert_eq!(rolled_back, 1);
    assert!(!f.store.audit().is_degraded());
}
