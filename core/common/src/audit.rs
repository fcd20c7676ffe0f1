//! Audit sink boundary.
//!
//! Every key operation, mutation, rollback and rotation produces an
//! [`AuditEvent`]. Recording is fire-and-forget: a failing sink never blocks
//! the underlying operation, it only flips the trail into degraded mode.
//! Events carry identifiers and outcomes only, never key material or values.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::types::{Actor, CommitId, DekId, OrgId, ProjectId, RootKeyId, SecretId, VersionId};
use crate::Result;

/// Outcome of an audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
    Deferred,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditKind {
    RootKeyProvisioned {
        org: OrgId,
        root_key: RootKeyId,
    },
    RootKeyUnsealed {
        org: OrgId,
        root_key: RootKeyId,
    },
    DataKeyWrapped {
        org: OrgId,
        project: Option<ProjectId>,
        root_key: RootKeyId,
        dek: DekId,
    },
    DataKeyUnwrapped {
        org: OrgId,
        project: Option<ProjectId>,
        root_key: RootKeyId,
        dek: DekId,
    },
    RootKeyRotated {
        org: OrgId,
        old_root_key: RootKeyId,
        new_root_key: RootKeyId,
        rewrapped: usize,
    },
    RootKeyPurged {
        org: OrgId,
        root_key: RootKeyId,
    },
    DataKeyRotationStarted {
        project: ProjectId,
        old_dek: DekId,
        new_dek: DekId,
    },
    DataKeyRotationProgress {
        project: ProjectId,
        dek: DekId,
        rotated: usize,
        remaining: usize,
    },
    SecretMutated {
        project: ProjectId,
        secret: SecretId,
        version: VersionId,
        commit: CommitId,
        actor: Actor,
        tombstone: bool,
    },
    SecretRolledBack {
        project: ProjectId,
        secret: SecretId,
        from_version: Option<VersionId>,
        to_version: VersionId,
        new_version: VersionId,
        actor: Actor,
    },
    CommitReverted {
        project: ProjectId,
        reverted: CommitId,
        commit: CommitId,
        actor: Actor,
    },
    MutationGated {
        project: ProjectId,
        operation: String,
        actor: Actor,
    },
}

/// A single audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub outcome: AuditOutcome,
    #[serde(flatten)]
    pub kind: AuditKind,
}

impl AuditEvent {
    /// Build an event stamped with the current time.
    pub fn new(kind: AuditKind, outcome: AuditOutcome) -> Self {
        Self {
            at: Utc::now(),
            outcome,
            kind,
        }
    }

    /// Successful event.
    pub fn success(kind: AuditKind) -> Self {
        Self::new(kind, AuditOutcome::Success)
    }

    /// Failed event.
    pub fn failure(kind: AuditKind) -> Self {
        Self::new(kind, AuditOutcome::Failure)
    }
}

/// External audit collaborator.
pub trait AuditSink: Send + Sync {
    /// Record one event.
    fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// Sink that writes audit events to the `vaultline::audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        info!(target: "vaultline::audit", outcome = ?event.outcome, "{}", payload);
        Ok(())
    }
}

/// Sink that keeps events in memory, for inspection in tests and tooling.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| crate::Error::Storage("audit buffer poisoned".to_string()))?;
        events.push(event.clone());
        Ok(())
    }
}

/// Fire-and-forget front for an [`AuditSink`] that tracks degraded mode.
pub struct AuditTrail {
    sink: Arc<dyn AuditSink>,
    degraded: AtomicBool,
    failures: AtomicU64,
}

impl AuditTrail {
    /// Wrap a sink.
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            degraded: AtomicBool::new(false),
            failures: AtomicU64::new(0),
        }
    }

    /// Trail writing to the tracing audit target.
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingAuditSink))
    }

    /// Record an event; failures are logged and counted, never propagated.
    pub fn emit(&self, event: AuditEvent) {
        if let Err(err) = self.sink.record(&event) {
            let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
            if !self.degraded.swap(true, Ordering::Relaxed) {
                warn!(error = %err, "Audit sink failing, continuing in degraded mode");
            } else {
                warn!(error = %err, failures, "Audit event dropped");
            }
        }
    }

    /// Whether any audit event has failed to record.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Number of events that could not be recorded.
    pub fn failed_events(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail")
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    impl AuditSink for FailingSink {
        fn record(&self, _event: &AuditEvent) -> Result<()> {
            Err(crate::Error::Storage("audit endpoint down".to_string()))
        }
    }

    fn sample_event() -> AuditEvent {
        AuditEvent::success(AuditKind::RootKeyProvisioned {
            org: OrgId::new("acme").unwrap(),
            root_key: RootKeyId::generate(),
        })
    }

    #[test]
    fn test_memory_sink_records() {
        let sink = Arc::new(MemoryAuditSink::new());
        let trail = AuditTrail::new(sink.clone());
        trail.emit(sample_event());
        assert_eq!(sink.events().len(), 1);
        assert!(!trail.is_degraded());
    }

    #[test]
    fn test_failing_sink_degrades_without_error() {
        let trail = AuditTrail::new(Arc::new(FailingSink));
        trail.emit(sample_event());
        trail.emit(sample_event());
        assert!(trail.is_degraded());
        assert_eq!(trail.failed_events(), 2);
    }

    #[test]
    fn test_event_serializes_flat() {
        let json = serde_json::to_value(sample_event()).unwrap();
        assert_eq!(json["kind"], "root_key_provisioned");
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["org"], "acme");
    }
}
