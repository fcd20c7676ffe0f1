//! Common utilities and types shared across vaultline crates.
//!
//! This crate provides the error taxonomy, tenant/project/secret
//! identifiers, and the audit sink boundary.

pub mod audit;
pub mod error;
pub mod types;

pub use audit::{AuditEvent, AuditKind, AuditOutcome, AuditSink, AuditTrail, MemoryAuditSink, TracingAuditSink};
pub use error::{Error, Result};
pub use types::{
    Actor, CommitId, DekId, EnvironmentId, FolderId, FolderPath, FolderRef, OrgId, ProjectId,
    RootKeyId, SecretId, SecretRef, SensitiveBytes, VersionId,
};
