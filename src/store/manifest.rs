//! Cache Store: the durable path → node map with artifacts.
//!
//! The manifest is authoritative for "is this path already summarized". It is
//! only ever mutated by merging successful staging entries whose fingerprint
//! still matches the tree on disk, by carrying forward unchanged nodes, and by
//! recording directories that had nothing to summarize.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, TreesumError};
use crate::scanner::diff::ChangeSet;
use crate::scanner::hasher::Fingerprint;
use crate::scanner::node::{Artifact, Node, NodeKind};
use crate::store::atomic;
use crate::store::staging::{Outcome, StagingEntry};

/// On-disk format version. Bump on incompatible layout changes.
pub const MANIFEST_VERSION: u32 = 1;

/// Aggregate counters, recomputed on every persist (`total_cost` accumulates).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Counters {
    pub files: usize,
    pub directories: usize,
    /// Nodes currently carrying an artifact.
    pub processed: usize,
    /// Sum of processor cost over every merged success.
    pub total_cost: u64,
}

/// Durable snapshot of the last processed tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub generated_at: DateTime<Utc>,
    /// Root fingerprint of the last run that finished with nothing pending.
    pub root_fingerprint: Option<Fingerprint>,
    pub nodes: BTreeMap<String, Node>,
    #[serde(default)]
    pub counters: Counters,
}

impl Manifest {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            version: MANIFEST_VERSION,
            generated_at: Utc::now(),
            root_fingerprint: None,
            nodes: BTreeMap::new(),
            counters: Counters::default(),
        }
    }

    /// Cached artifact for `path`, only if its fingerprint still matches.
    #[must_use]
    pub fn valid_artifact(&self, path: &str, fingerprint: &Fingerprint) -> Option<&Artifact> {
        self.nodes
            .get(path)
            .filter(|node| &node.fingerprint == fingerprint)
            .and_then(|node| node.artifact.as_ref())
    }

    /// Whether the manifest describes `root` with nothing left to process.
    #[must_use]
    pub fn is_current_for(&self, root: &Fingerprint) -> bool {
        self.root_fingerprint.as_ref() == Some(root)
    }

    /// Fold a change set into the working manifest.
    ///
    /// Deleted paths are dropped, unchanged nodes are replaced by their
    /// carried-forward copies (fresh structure, cached artifact). Changed
    /// paths whose kind flipped lose their entry outright; other new and
    /// changed paths keep whatever entry they had until a success for their
    /// current fingerprint is merged. Returns whether anything changed.
    pub fn apply_changes(&mut self, changes: &ChangeSet, current: &BTreeMap<String, Node>) -> bool {
        let mut dirty = false;
        for path in &changes.deleted {
            dirty |= self.nodes.remove(path).is_some();
        }
        for path in &changes.changed {
            let flipped = matches!(
                (self.nodes.get(path), current.get(path)),
                (Some(cached), Some(fresh)) if cached.kind != fresh.kind
            );
            if flipped {
                self.nodes.remove(path);
                dirty = true;
            }
        }
        for (path, carried) in &changes.unchanged {
            if self.nodes.get(path) != Some(carried) {
                self.nodes.insert(path.clone(), carried.clone());
                dirty = true;
            }
        }
        dirty
    }

    /// Record a directory that has nothing to summarize, without an artifact,
    /// so an unchanged tree classifies it as unchanged next time. Returns
    /// whether the entry changed.
    pub fn record_skipped(&mut self, node: &Node) -> bool {
        let mut entry = node.clone();
        entry.artifact = None;
        entry.last_processed_at = None;
        if self.nodes.get(&node.path) == Some(&entry) {
            return false;
        }
        self.nodes.insert(node.path.clone(), entry);
        true
    }

    /// Whether `path` was recorded as a skipped directory at `fingerprint`.
    #[must_use]
    pub fn is_skipped_directory(&self, path: &str, fingerprint: &Fingerprint) -> bool {
        self.nodes.get(path).is_some_and(|node| {
            node.is_dir() && node.artifact.is_none() && &node.fingerprint == fingerprint
        })
    }

    /// Merge successful staging entries whose path and fingerprint match
    /// `current`. Entries for paths that have since changed are ignored.
    ///
    /// Idempotent: re-merging the same entries returns 0 and changes nothing.
    pub fn merge_completed<'a, I>(&mut self, current: &BTreeMap<String, Node>, entries: I) -> usize
    where
        I: IntoIterator<Item = &'a StagingEntry>,
    {
        let mut merged = 0;
        for entry in entries {
            let Outcome::Success { artifact, cost } = &entry.outcome else {
                continue;
            };
            let Some(tree_node) = current.get(&entry.path) else {
                continue;
            };
            if tree_node.fingerprint != entry.fingerprint {
                continue;
            }

            let mut node = tree_node.clone();
            node.artifact = Some(artifact.clone());
            node.last_processed_at = Some(entry.timestamp);
            if self.nodes.get(&entry.path) == Some(&node) {
                continue;
            }
            self.nodes.insert(entry.path.clone(), node);
            self.counters.total_cost = self.counters.total_cost.saturating_add(*cost);
            merged += 1;
        }
        merged
    }

    /// Recompute the derived counters from the node map.
    pub fn recount(&mut self) {
        let mut files = 0;
        let mut directories = 0;
        let mut processed = 0;
        for node in self.nodes.values() {
            match node.kind {
                NodeKind::File => files += 1,
                NodeKind::Directory => directories += 1,
            }
            if node.artifact.is_some() {
                processed += 1;
            }
        }
        self.counters.files = files;
        self.counters.directories = directories;
        self.counters.processed = processed;
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::empty()
    }
}

/// Reads and atomically writes the manifest file.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the manifest. `Ok(None)` when none has been written yet.
    pub fn load(&self) -> Result<Option<Manifest>> {
        let Some(manifest) = atomic::read_json::<Manifest>(&self.path, "manifest_load")? else {
            return Ok(None);
        };
        if manifest.version != MANIFEST_VERSION {
            return Err(TreesumError::FormatVersion {
                context: "manifest",
                found: manifest.version,
                expected: MANIFEST_VERSION,
            });
        }
        Ok(Some(manifest))
    }

    /// Stamp, recount and persist.
    pub fn save(&self, manifest: &mut Manifest) -> Result<()> {
        manifest.version = MANIFEST_VERSION;
        manifest.generated_at = Utc::now();
        manifest.recount();
        atomic::write_json(&self.path, manifest, "manifest_save")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::diff::detect;
    use crate::scanner::hasher::{hash_bytes, hash_children};

    fn current() -> BTreeMap<String, Node> {
        let a = hash_bytes(b"x");
        let b = hash_bytes(b"y");
        let root = hash_children([&a, &b]);
        let mut nodes = BTreeMap::new();
        nodes.insert("a.txt".to_string(), Node::file("a.txt", a));
        nodes.insert("b.txt".to_string(), Node::file("b.txt", b));
        nodes.insert(
            ".".to_string(),
            Node::directory(".", root, vec!["a.txt".to_string(), "b.txt".to_string()]),
        );
        nodes
    }

    fn success(path: &str, fp: &Fingerprint, body: &str, cost: u64) -> StagingEntry {
        StagingEntry {
            path: path.to_string(),
            fingerprint: fp.clone(),
            outcome: Outcome::Success {
                artifact: Artifact::text(body),
                cost,
            },
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn round_trip_preserves_nodes_and_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("manifest.json"));
        let nodes = current();
        let mut manifest = Manifest::empty();
        let entries = vec![
            success("a.txt", &nodes["a.txt"].fingerprint, "A", 10),
            success(".", &nodes["."].fingerprint, "ROOT", 5),
        ];
        manifest.merge_completed(&nodes, &entries);
        manifest.root_fingerprint = Some(nodes["."].fingerprint.clone());
        store.save(&mut manifest).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.nodes, manifest.nodes);
        assert_eq!(loaded.root_fingerprint, manifest.root_fingerprint);
        assert_eq!(loaded.counters, manifest.counters);
        assert_eq!(loaded.counters.files, 1);
        assert_eq!(loaded.counters.directories, 1);
        assert_eq!(loaded.counters.total_cost, 15);
    }

    #[test]
    fn missing_manifest_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("manifest.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("manifest.json"));
        let mut manifest = Manifest::empty();
        manifest.version = 99;
        atomic::write_json(store.path(), &manifest, "test").unwrap();
        let err = store.load().unwrap_err();
        assert_eq!(err.code(), "TSM-2102");
    }

    #[test]
    fn merge_is_idempotent_and_skips_stale_fingerprints() {
        let nodes = current();
        let mut manifest = Manifest::empty();
        let entries = vec![
            success("a.txt", &nodes["a.txt"].fingerprint, "A", 3),
            success("b.txt", &hash_bytes(b"old"), "B", 3),
            success("gone.txt", &hash_bytes(b"g"), "G", 3),
        ];
        assert_eq!(manifest.merge_completed(&nodes, &entries), 1);
        assert_eq!(manifest.merge_completed(&nodes, &entries), 0);
        assert_eq!(manifest.nodes.len(), 1);
        assert_eq!(manifest.counters.total_cost, 3);
        assert!(
            manifest
                .valid_artifact("a.txt", &nodes["a.txt"].fingerprint)
                .is_some()
        );
        assert!(manifest.valid_artifact("a.txt", &hash_bytes(b"z")).is_none());
    }

    #[test]
    fn apply_changes_drops_deleted_and_carries_unchanged() {
        let nodes = current();
        let mut manifest = Manifest::empty();
        let entries = vec![
            success("a.txt", &nodes["a.txt"].fingerprint, "A", 1),
            success("b.txt", &nodes["b.txt"].fingerprint, "B", 1),
        ];
        manifest.merge_completed(&nodes, &entries);
        manifest.nodes.insert(
            "gone.txt".to_string(),
            Node::file("gone.txt", hash_bytes(b"g")),
        );

        let changes = detect(&nodes, Some(&manifest));
        assert!(manifest.apply_changes(&changes, &nodes));
        assert!(!manifest.nodes.contains_key("gone.txt"));
        assert!(manifest.nodes["a.txt"].artifact.is_some());
        assert!(!manifest.apply_changes(&detect(&nodes, Some(&manifest)), &nodes));
    }

    #[test]
    fn apply_changes_drops_entries_whose_kind_flipped() {
        let mut manifest = Manifest::empty();
        let mut old = Node::file("e", hash_bytes(b""));
        old.artifact = Some(Artifact::text("empty file"));
        manifest.nodes.insert("e".to_string(), old);

        let mut nodes = BTreeMap::new();
        nodes.insert("e".to_string(), Node::directory("e", hash_children(&Vec::<Fingerprint>::new()), Vec::new()));
        let changes = detect(&nodes, Some(&manifest));
        assert_eq!(changes.changed, vec!["e"]);

        assert!(manifest.apply_changes(&changes, &nodes));
        assert!(!manifest.nodes.contains_key("e"));
    }

    #[test]
    fn skipped_directories_are_recorded_without_artifact() {
        let mut manifest = Manifest::empty();
        let dir = Node::directory("empty", hash_children(&Vec::<Fingerprint>::new()), Vec::new());
        assert!(manifest.record_skipped(&dir));
        assert!(!manifest.record_skipped(&dir), "recording twice is a no-op");
        assert!(manifest.is_skipped_directory("empty", &dir.fingerprint));
        assert!(!manifest.is_skipped_directory("empty", &hash_bytes(b"other")));
        assert!(manifest.valid_artifact("empty", &dir.fingerprint).is_none());

        let mut again = BTreeMap::new();
        again.insert("empty".to_string(), dir);
        let changes = detect(&again, Some(&manifest));
        assert!(changes.changed.is_empty());
        assert!(changes.new.is_empty());
    }
}
