//! Common types used throughout vaultline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use zeroize::Zeroize;

/// Declares a tenant-facing identifier backed by a non-empty string.
macro_rules! name_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier.
            ///
            /// # Errors
            /// - Returns error if `id` is empty or only whitespace
            pub fn new(id: impl Into<String>) -> crate::Result<Self> {
                let id = id.into();
                if id.trim().is_empty() {
                    return Err(crate::Error::InvalidInput(format!(
                        "{} cannot be empty",
                        stringify!($name)
                    )));
                }
                Ok(Self(id))
            }

            /// Get the inner string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// Declares a system-generated identifier backed by a UUID.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Get the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Raw bytes, used as associated data when sealing.
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> crate::Result<Self> {
                Uuid::parse_str(s).map(Self).map_err(|e| {
                    crate::Error::InvalidInput(format!("invalid {}: {}", stringify!($name), e))
                })
            }
        }
    };
}

name_id!(
    /// Tenant (organization) identifier.
    OrgId
);
name_id!(
    /// Project identifier, unique across tenants.
    ProjectId
);
name_id!(
    /// Environment identifier within a project (e.g. "dev", "prod").
    EnvironmentId
);

uuid_id!(
    /// Identity of a secret's version chain.
    SecretId
);
uuid_id!(
    /// Identity of a single immutable version.
    VersionId
);
uuid_id!(
    /// Identity of a folder commit.
    CommitId
);
uuid_id!(
    /// Identity of a folder within a project environment.
    FolderId
);
uuid_id!(
    /// Identity of a project data encryption key.
    DekId
);
uuid_id!(
    /// Identity of an organization root key.
    RootKeyId
);

/// Who performed a mutation, e.g. `user:alice` or `system:key-rotation`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor(String);

impl Actor {
    /// Actor recorded on versions written by the data key rotation job.
    pub const KEY_ROTATION: &'static str = "system:key-rotation";

    /// Create an actor identity.
    pub fn new(actor: impl Into<String>) -> crate::Result<Self> {
        let actor = actor.into();
        if actor.trim().is_empty() {
            return Err(crate::Error::InvalidInput("Actor cannot be empty".to_string()));
        }
        Ok(Self(actor))
    }

    /// The system actor used for key rotation.
    pub fn key_rotation() -> Self {
        Self(Self::KEY_ROTATION.to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A folder path within a project environment.
///
/// Paths are logical; `/` is the environment root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderPath {
    components: Vec<String>,
}

impl FolderPath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a path from string components.
    ///
    /// # Errors
    /// - Returns error if any component is empty or contains a separator
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        for comp in &components {
            validate_component(comp)?;
        }
        Ok(Self { components })
    }

    /// Parse a path string using '/' as separator.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let path = path.trim_start_matches('/').trim_end_matches('/');
        if path.is_empty() {
            return Ok(Self::root());
        }

        let components: Vec<String> = path.split('/').map(String::from).collect();
        Self::from_components(components)
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// Join this path with a child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        validate_component(child)?;
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Convert to a string representation.
    pub fn to_string_path(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}", self.components.join("/"))
        }
    }
}

impl fmt::Display for FolderPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_path())
    }
}

fn validate_component(comp: &str) -> crate::Result<()> {
    if comp.is_empty() {
        return Err(crate::Error::InvalidInput(
            "Path component cannot be empty".to_string(),
        ));
    }
    if comp.contains('/') || comp.contains('\\') {
        return Err(crate::Error::InvalidInput(
            "Path component cannot contain separators".to_string(),
        ));
    }
    Ok(())
}

/// Locates a folder: project, environment and path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FolderRef {
    pub project: ProjectId,
    pub environment: EnvironmentId,
    pub path: FolderPath,
}

impl FolderRef {
    /// Create a folder reference.
    pub fn new(project: ProjectId, environment: EnvironmentId, path: FolderPath) -> Self {
        Self {
            project,
            environment,
            path,
        }
    }

    /// Reference a secret inside this folder.
    pub fn secret(&self, key: impl Into<String>) -> crate::Result<SecretRef> {
        SecretRef::new(self.clone(), key)
    }
}

impl fmt::Display for FolderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}{}", self.project, self.environment, self.path)
    }
}

/// Logical secret identity: (project, environment, folder path, key name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    pub folder: FolderRef,
    key: String,
}

impl SecretRef {
    /// Create a secret reference.
    ///
    /// # Errors
    /// - Returns error if the key name is blank
    pub fn new(folder: FolderRef, key: impl Into<String>) -> crate::Result<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "Secret key name cannot be empty".to_string(),
            ));
        }
        Ok(Self { folder, key })
    }

    /// The key name as supplied by the caller.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The owning project.
    pub fn project(&self) -> &ProjectId {
        &self.folder.project
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.folder.path.is_root() {
            write!(
                f,
                "{}/{}/{}",
                self.folder.project, self.folder.environment, self.key
            )
        } else {
            write!(f, "{}/{}", self.folder, self.key)
        }
    }
}

/// Sensitive data wrapper that zeroizes on drop.
#[derive(Clone, Zeroize, PartialEq, Eq)]
#[zeroize(drop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// View as UTF-8, if valid.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for SensitiveBytes {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl From<&str> for SensitiveBytes {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_name_id_empty_fails() {
        assert!(OrgId::new("").is_err());
        assert!(ProjectId::new("   ").is_err());
        assert_eq!(EnvironmentId::new("prod").unwrap().as_str(), "prod");
    }

    #[test]
    fn test_uuid_id_parse() {
        let id = SecretId::generate();
        let parsed: SecretId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<VersionId>().is_err());
    }

    #[test]
    fn test_folder_path_root() {
        let path = FolderPath::parse("/").unwrap();
        assert!(path.is_root());
        assert_eq!(path.to_string_path(), "/");
        assert!(path.parent().is_none());
    }

    #[test]
    fn test_folder_path_parse_and_join() {
        let path = FolderPath::parse("/backend/db/").unwrap();
        assert_eq!(path.components(), &["backend", "db"]);
        let joined = FolderPath::root().join("backend").unwrap().join("db").unwrap();
        assert_eq!(joined, path);
        assert_eq!(path.parent().unwrap().to_string_path(), "/backend");
    }

    #[test]
    fn test_folder_path_rejects_empty_component() {
        assert!(FolderPath::parse("/a//b").is_err());
        assert!(FolderPath::root().join("a/b").is_err());
    }

    #[test]
    fn test_secret_ref_display() {
        let folder = FolderRef::new(
            ProjectId::new("p1").unwrap(),
            EnvironmentId::new("dev").unwrap(),
            FolderPath::parse("/api").unwrap(),
        );
        let secret = folder.secret("DB_PASS").unwrap();
        assert_eq!(secret.to_string(), "p1/dev/api/DB_PASS");
        assert!(folder.secret(" ").is_err());
    }

    #[test]
    fn test_sensitive_bytes_debug_redacts() {
        let bytes = SensitiveBytes::from("hunter2");
        let debug = format!("{:?}", bytes);
        assert!(!debug.contains("hunter2"));
        assert_eq!(bytes.as_str(), Some("hunter2"));
    }

    proptest! {
        #[test]
        fn prop_folder_path_display_parse(components in proptest::collection::vec("[a-z0-9_-]{1,8}", 0..5)) {
            let path = FolderPath::from_components(components).unwrap();
            let reparsed = FolderPath::parse(&path.to_string_path()).unwrap();
            prop_assert_eq!(path, reparsed);
        }
    }
}
