//! Common types used throughout twinsync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One side of the synchronized pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaSide {
    /// The local filesystem.
    Local,
    /// The remote storage service.
    Remote,
}

impl ReplicaSide {
    /// The other replica.
    pub fn opposite(self) -> Self {
        match self {
            ReplicaSide::Local => ReplicaSide::Remote,
            ReplicaSide::Remote => ReplicaSide::Local,
        }
    }
}

impl fmt::Display for ReplicaSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaSide::Local => write!(f, "local"),
            ReplicaSide::Remote => write!(f, "remote"),
        }
    }
}

/// A path relative to the root of a replica.
///
/// Both replicas address their entries with the same relative paths, so two
/// equal `SyncPath`s on different sides name the same logical location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncPath {
    components: Vec<String>,
}

impl SyncPath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a path from name components.
    ///
    /// # Errors
    /// - Returns error if a component is empty or contains '/'
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        for comp in &components {
            validate_component(comp)?;
        }
        Ok(Self { components })
    }

    /// Parse a path string into a SyncPath.
    ///
    /// Uses '/' as separator; leading and trailing separators are ignored.
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

    /// Get the last component.
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this path with a child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        validate_component(child)?;
        Ok(self.child(child))
    }

    /// Append a component that is already known to be valid.
    ///
    /// Names stored in a replica tree are validated on insertion, so paths
    /// derived from tree nodes use this instead of [`SyncPath::join`].
    pub fn child(&self, name: &str) -> Self {
        let mut components = self.components.clone();
        components.push(name.to_string());
        Self { components }
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Number of components.
    pub fn depth(&self) -> usize {
        self.components.len()
    }

    /// True if `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &SyncPath) -> bool {
        self.components.len() < other.components.len()
            && other.components[..self.components.len()] == self.components[..]
    }

    /// True if `self` equals `other` or is one of its ancestors.
    pub fn is_ancestor_or_equal(&self, other: &SyncPath) -> bool {
        self == other || self.is_ancestor_of(other)
    }

    /// Strict ancestors, nearest first, ending with the root.
    pub fn ancestors(&self) -> Vec<SyncPath> {
        (0..self.components.len())
            .rev()
            .map(|len| Self {
                components: self.components[..len].to_vec(),
            })
            .collect()
    }

    /// Length in characters of the relative path, separators included.
    pub fn char_len(&self) -> usize {
        let names: usize = self.components.iter().map(|c| c.chars().count()).sum();
        names + self.components.len().saturating_sub(1)
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

impl fmt::Display for SyncPath {
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
    if comp.contains('/') {
        return Err(crate::Error::InvalidInput(format!(
            "Path component cannot contain separators: {comp}"
        )));
    }
    Ok(())
}
