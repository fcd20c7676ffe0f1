//! Key hierarchy for vaultline.
//!
//! Organization root keys are sealed by a [`KmsClient`] and only ever wrap
//! project data keys. Data keys are stored wrapped and unwrapped per call.
//! Root key material is held in a bounded [`RootKeyCache`] that rotation
//! invalidates explicitly.

pub mod cache;
pub mod hierarchy;
pub mod kms;

pub use cache::RootKeyCache;
pub use hierarchy::{DataKeyRotationStart, HierarchyOptions, KeyHierarchy, WrappedDataKey};
pub use kms::{KmsClient, LocalKms, LocalKmsManifest};
