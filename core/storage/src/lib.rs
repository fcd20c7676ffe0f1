//! Ledger persistence for vaultline.
//!
//! This crate defines the persisted record shapes (wrapped keys, version
//! chains, commits, checkpoints), the [`LedgerStore`] trait every backend
//! implements, and a registry for resolving backends by name.
//!
//! # Design Principles
//! - Backend isolation: no backend-specific logic in key or vault crates
//! - Async operations: all store calls are async
//! - Atomic commits: a commit's head checks and writes succeed or fail together
//! - Ciphertext only: no record holds a plaintext value, name or key

pub mod memory;
pub mod provider;
pub mod records;
pub mod registry;
pub mod sqlite;

#[cfg(test)]
mod testing;

pub use memory::MemoryStore;
pub use provider::LedgerStore;
pub use records::{
    CheckpointRecord, CommitBatch, CommitMember, CommitRecord, DataKeyRecord, FolderRecord,
    ProjectKeyring, RootKeyRecord, RootKeyStatus, SecretRecord, VersionOrigin, VersionRecord,
    VersionWrite,
};
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};
pub use sqlite::SqliteStore;
