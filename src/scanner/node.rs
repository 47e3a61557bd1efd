//! Tracked tree entries and the opaque artifacts attached to them.

#![allow(missing_docs)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::paths::key_depth;
use crate::scanner::hasher::Fingerprint;

/// File or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

/// Externally produced payload for a node. Opaque to the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Artifact(pub serde_json::Value);

impl Artifact {
    /// Plain-text artifact (the common case for summaries).
    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        Self(serde_json::Value::String(body.into()))
    }

    /// Text body when the artifact is a JSON string.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        self.0.as_str()
    }
}

/// One entry per project-relative path.
///
/// `fingerprint` is the content hash for files and the children hash for
/// directories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub path: String,
    pub kind: NodeKind,
    pub fingerprint: Fingerprint,
    /// Sorted immediate child keys (directories only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl Node {
    #[must_use]
    pub fn file(path: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            path: path.into(),
            kind: NodeKind::File,
            fingerprint,
            children: Vec::new(),
            artifact: None,
            last_processed_at: None,
        }
    }

    #[must_use]
    pub fn directory(path: impl Into<String>, fingerprint: Fingerprint, children: Vec<String>) -> Self {
        Self {
            path: path.into(),
            kind: NodeKind::Directory,
            fingerprint,
            children,
            artifact: None,
            last_processed_at: None,
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        key_depth(&self.path)
    }

    /// Same content identity (kind and fingerprint) as `other`.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.kind == other.kind && self.fingerprint == other.fingerprint
    }
}
