//! Change detection: classify every path of a fresh tree against the cache.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use crate::scanner::node::Node;
use crate::store::manifest::Manifest;

/// Classification of one fresh tree against a cached manifest.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Paths absent from the cache.
    pub new: Vec<String>,
    /// Paths whose kind or fingerprint differs from the cache.
    pub changed: Vec<String>,
    /// Unchanged paths with their cached artifact and timestamp carried forward.
    pub unchanged: BTreeMap<String, Node>,
    /// Cached paths no longer present in the tree.
    pub deleted: Vec<String>,
}

impl ChangeSet {
    /// Paths that need external processing (new and changed), sorted.
    #[must_use]
    pub fn pending(&self) -> Vec<String> {
        let mut out: Vec<String> = self.new.iter().chain(self.changed.iter()).cloned().collect();
        out.sort();
        out
    }

    /// Whether the tree matches the cache exactly.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// Diff `current` against `cached`.
///
/// Runs in time proportional to the number of paths; fingerprints are
/// compared, never content. With no manifest every path is new.
#[must_use]
pub fn detect(current: &BTreeMap<String, Node>, cached: Option<&Manifest>) -> ChangeSet {
    let Some(manifest) = cached else {
        return ChangeSet {
            new: current.keys().cloned().collect(),
            ..ChangeSet::default()
        };
    };

    let mut set = ChangeSet::default();
    for (path, node) in current {
        match manifest.nodes.get(path) {
            None => set.new.push(path.clone()),
            Some(old) if !old.same_content(node) => set.changed.push(path.clone()),
            Some(old) => {
                // Structure comes from the fresh walk; the derived payload
                // comes from the cache untouched.
                let mut carried = node.clone();
                carried.artifact = old.artifact.clone();
                carried.last_processed_at = old.last_processed_at;
                set.unchanged.insert(path.clone(), carried);
            }
        }
    }

    set.deleted = manifest
        .nodes
        .keys()
        .filter(|p| !current.contains_key(*p))
        .cloned()
        .collect();

    set
}
