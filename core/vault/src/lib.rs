//! Versioned secret engine for vaultline.
//!
//! This crate provides:
//! - The append-only commit log over per-secret version chains
//! - Point-in-time folder replay and commit diffs
//! - The mutation gate hook
//! - The [`SecretStore`] that ties keys, log and gate together
//! - The resumable data key rotation job
//!
//! # Architecture
//! The store sits between callers and a [`vaultline_storage::LedgerStore`].
//! Plaintext only exists inside a single store operation; everything that
//! reaches storage is sealed under a project data key.

pub mod config;
pub mod gate;
pub mod ledger;
pub mod replay;
pub mod retry;
pub mod rotation;
pub mod store;

pub use config::StoreConfig;
pub use gate::{AllowAll, GateDecision, MutationDescriptor, MutationGate, MutationOutcome};
pub use ledger::{Appended, CommitLog, KeyScope, Payload, Staged};
pub use replay::{ChangeKind, DiffEntry, DiffOptions, FolderState};
pub use retry::{RetryConfig, RetryExecutor};
pub use rotation::{BatchReport, DataKeyRotation, RotationProgress};
pub use store::{
    BatchChange, CommitReceipt, SecretListing, SecretStore, SecretStoreBuilder, VersionSummary,
    WriteReceipt,
};
