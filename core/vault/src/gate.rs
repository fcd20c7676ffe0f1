//! Mutation gate: the policy hook consulted before any write.
//!
//! The store describes each mutation with a closed [`MutationDescriptor`]
//! and asks the gate once, before anything is encrypted or written.
//! Descriptors carry identifiers only, never values.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vaultline_common::{Actor, CommitId, ProjectId, Result, SecretRef, VersionId};

/// One mutation proposed to the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationDescriptor {
    Create {
        secret: SecretRef,
        actor: Actor,
    },
    Update {
        secret: SecretRef,
        actor: Actor,
        /// Version the caller based the update on, when it supplied one.
        expected_version: Option<VersionId>,
    },
    /// Batch member that creates or replaces, whichever applies at commit.
    Set {
        secret: SecretRef,
        actor: Actor,
    },
    Delete {
        secret: SecretRef,
        actor: Actor,
    },
    Rollback {
        secret: SecretRef,
        actor: Actor,
        target_version: VersionId,
    },
    RevertCommit {
        project: ProjectId,
        actor: Actor,
        commit: CommitId,
    },
    /// Several mutations to one folder applied as one commit.
    Batch {
        project: ProjectId,
        actor: Actor,
        changes: Vec<MutationDescriptor>,
    },
}

impl MutationDescriptor {
    /// Short operation name for logs and audit.
    pub fn operation(&self) -> &'static str {
        match self {
            MutationDescriptor::Create { .. } => "create",
            MutationDescriptor::Update { .. } => "update",
            MutationDescriptor::Set { .. } => "set",
            MutationDescriptor::Delete { .. } => "delete",
            MutationDescriptor::Rollback { .. } => "rollback",
            MutationDescriptor::RevertCommit { .. } => "revert_commit",
            MutationDescriptor::Batch { .. } => "batch",
        }
    }

    /// Project the mutation targets.
    pub fn project(&self) -> &ProjectId {
        match self {
            MutationDescriptor::Create { secret, .. }
            | MutationDescriptor::Update { secret, .. }
            | MutationDescriptor::Set { secret, .. }
            | MutationDescriptor::Delete { secret, .. }
            | MutationDescriptor::Rollback { secret, .. } => secret.project(),
            MutationDescriptor::RevertCommit { project, .. }
            | MutationDescriptor::Batch { project, .. } => project,
        }
    }

    /// Who proposed it.
    pub fn actor(&self) -> &Actor {
        match self {
            MutationDescriptor::Create { actor, .. }
            | MutationDescriptor::Update { actor, .. }
            | MutationDescriptor::Set { actor, .. }
            | MutationDescriptor::Delete { actor, .. }
            | MutationDescriptor::Rollback { actor, .. }
            | MutationDescriptor::RevertCommit { actor, .. }
            | MutationDescriptor::Batch { actor, .. } => actor,
        }
    }
}

/// The gate's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny { policy: String, reason: String },
    /// Parked, e.g. awaiting approval. Resubmit the same descriptor once approved.
    Defer { pending_request_id: String },
}

/// Result of a gated mutation. Only `Applied` has side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome<T> {
    Applied(T),
    PendingApproval { request_id: String },
    Denied { policy: String, reason: String },
}

impl<T> MutationOutcome<T> {
    /// The applied value, if any.
    pub fn applied(self) -> Option<T> {
        match self {
            MutationOutcome::Applied(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, MutationOutcome::Applied(_))
    }

    /// Map the applied value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> MutationOutcome<U> {
        match self {
            MutationOutcome::Applied(value) => MutationOutcome::Applied(f(value)),
            MutationOutcome::PendingApproval { request_id } => {
                MutationOutcome::PendingApproval { request_id }
            }
            MutationOutcome::Denied { policy, reason } => {
                MutationOutcome::Denied { policy, reason }
            }
        }
    }
}

/// External policy hook.
#[async_trait]
pub trait MutationGate: Send + Sync {
    /// Decide whether a mutation may be applied now.
    async fn before_apply(&self, mutation: &MutationDescriptor) -> Result<GateDecision>;
}

/// Gate that allows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl MutationGate for AllowAll {
    async fn before_apply(&self, _mutation: &MutationDescriptor) -> Result<GateDecision> {
        Ok(GateDecision::Allow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultline_common::{EnvironmentId, FolderPath, FolderRef};

    fn secret_ref() -> SecretRef {
        FolderRef::new(
            ProjectId::new("p1").unwrap(),
            EnvironmentId::new("dev").unwrap(),
            FolderPath::root(),
        )
        .secret("DB_PASS")
        .unwrap()
    }

    #[test]
    fn test_descriptor_accessors() {
        let actor = Actor::new("user:alice").unwrap();
        let descriptor = MutationDescriptor::Delete {
            secret: secret_ref(),
            actor: actor.clone(),
        };
        assert_eq!(descriptor.operation(), "delete");
        assert_eq!(descriptor.project().as_str(), "p1");
        assert_eq!(descriptor.actor(), &actor);
    }

    #[test]
    fn test_outcome_map() {
        let outcome: MutationOutcome<u32> = MutationOutcome::Applied(2);
        assert_eq!(outcome.map(|v| v * 2).applied(), Some(4));

        let denied: MutationOutcome<u32> = MutationOutcome::Denied {
            policy: "p".to_string(),
            reason: "r".to_string(),
        };
        assert!(!denied.clone().map(|v| v + 1).is_applied());
        assert_eq!(denied.applied(), None);
    }

    #[tokio::test]
    async fn test_allow_all() {
        let descriptor = MutationDescriptor::Create {
            secret: secret_ref(),
            actor: Actor::new("user:alice").unwrap(),
        };
        assert_eq!(
            AllowAll.before_apply(&descriptor).await.unwrap(),
            GateDecision::Allow
        );
    }
}
