//! Read-only view of a project's cache state.
//!
//! Nothing here takes the lock or writes a file, so it is safe to call while
//! a run is in progress; the answer is simply a snapshot.

#![allow(missing_docs)]

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::core::config::Config;
use crate::core::errors::Result;
use crate::core::paths::ProjectPaths;
use crate::runner::lock::{self, LockState};
use crate::scanner::exclusion::ExclusionRules;
use crate::scanner::hasher::Fingerprint;
use crate::scanner::tree::TreeBuilder;
use crate::store::manifest::{Counters, ManifestStore};
use crate::store::staging::{Outcome, StagingStore};

/// Summary of the persisted manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestStatus {
    pub generated_at: DateTime<Utc>,
    /// `None` until a run completed without failures.
    pub root_fingerprint: Option<Fingerprint>,
    pub nodes: usize,
    pub counters: Counters,
}

/// One open failure in the staging log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFailure {
    pub path: String,
    pub reason: String,
    pub retry_count: u32,
    pub rate_limited: bool,
}

/// Summary of a staging log left by an unfinished run.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingStatus {
    pub started_at: DateTime<Utc>,
    pub root_fingerprint: Fingerprint,
    pub completed: usize,
    pub failures: Vec<StagedFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub paths: ProjectPaths,
    pub manifest: Option<ManifestStatus>,
    pub staging: Option<StagingStatus>,
    pub lock: LockState,
    /// Set only by [`inspect_with_tree`]: whether the manifest records the
    /// tree currently on disk.
    pub current: Option<bool>,
}

impl Status {
    /// A run is in progress on some live process.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        matches!(self.lock, LockState::Held { alive: true, .. })
    }

    /// A prior run stopped before finishing its queue.
    #[must_use]
    pub fn has_unfinished_run(&self) -> bool {
        self.staging.is_some()
    }
}

/// Snapshot the manifest, staging log and lock for `root`.
pub fn inspect(root: &Path, config: &Config) -> Result<Status> {
    let paths = ProjectPaths::resolve(root, &config.paths);

    let manifest = ManifestStore::new(&paths.manifest).load()?.map(|m| ManifestStatus {
        generated_at: m.generated_at,
        root_fingerprint: m.root_fingerprint.clone(),
        nodes: m.nodes.len(),
        counters: m.counters.clone(),
    });

    let staging = StagingStore::new(&paths.staging).load()?.map(|log| StagingStatus {
        started_at: log.started_at,
        completed: log.completed.len(),
        failures: log
            .failed
            .iter()
            .filter_map(|entry| match &entry.outcome {
                Outcome::Failure {
                    reason,
                    retry_count,
                    rate_limited,
                } => Some(StagedFailure {
                    path: entry.path.clone(),
                    reason: reason.clone(),
                    retry_count: *retry_count,
                    rate_limited: *rate_limited,
                }),
                Outcome::Success { .. } => None,
            })
            .collect(),
        root_fingerprint: log.root_fingerprint,
    });

    let lock = lock::inspect(&paths.lock)?;

    Ok(Status {
        paths,
        manifest,
        staging,
        lock,
        current: None,
    })
}

/// [`inspect`], plus a walk of the tree to tell whether the manifest is
/// current.
pub fn inspect_with_tree(root: &Path, config: &Config) -> Result<Status> {
    let mut status = inspect(root, config)?;
    let rules = ExclusionRules::for_project(config, &status.paths)?;
    let tree = TreeBuilder::new(&status.paths.root, rules)
        .follow_symlinks(config.scan.follow_symlinks)
        .build()?;
    let current = status
        .manifest
        .as_ref()
        .and_then(|m| m.root_fingerprint.as_ref())
        .is_some_and(|fp| *fp == tree.root_fingerprint);
    status.current = Some(current);
    Ok(status)
}
