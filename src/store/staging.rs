//! Staging Log: crash-recoverable record of per-path outcomes for one run.
//!
//! Every mutation is persisted as a whole-file atomic replace, so after a
//! crash [`StagingStore::load`] returns the last complete state or nothing.
//! The log is keyed to the root fingerprint of the tree it was produced
//! against; a log for a different root is stale and never merged.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, TreesumError};
use crate::scanner::hasher::Fingerprint;
use crate::scanner::node::Artifact;
use crate::store::atomic;

/// On-disk format version.
pub const STAGING_VERSION: u32 = 1;

/// Result of processing one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Success {
        artifact: Artifact,
        cost: u64,
    },
    Failure {
        reason: String,
        /// Cumulative attempts across every run that failed this path.
        retry_count: u32,
        rate_limited: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingEntry {
    pub path: String,
    pub fingerprint: Fingerprint,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
}

impl StagingEntry {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        match self.outcome {
            Outcome::Failure { retry_count, .. } => retry_count,
            Outcome::Success { .. } => 0,
        }
    }
}

/// In-memory form of the staging file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingLog {
    pub version: u32,
    pub started_at: DateTime<Utc>,
    pub root_fingerprint: Fingerprint,
    #[serde(default)]
    pub completed: Vec<StagingEntry>,
    #[serde(default)]
    pub failed: Vec<StagingEntry>,
}

impl StagingLog {
    #[must_use]
    pub fn new(root_fingerprint: Fingerprint) -> Self {
        Self {
            version: STAGING_VERSION,
            started_at: Utc::now(),
            root_fingerprint,
            completed: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Whether this log was produced against `root`.
    #[must_use]
    pub fn matches_root(&self, root: &Fingerprint) -> bool {
        &self.root_fingerprint == root
    }

    #[must_use]
    pub fn completed_paths(&self) -> HashSet<&str> {
        self.completed.iter().map(|e| e.path.as_str()).collect()
    }

    #[must_use]
    pub fn failure_for(&self, path: &str) -> Option<&StagingEntry> {
        self.failed.iter().find(|e| e.path == path)
    }

    /// Record a success. Clears any open failure for the same path.
    pub fn record_success(&mut self, path: &str, fingerprint: &Fingerprint, artifact: Artifact, cost: u64) {
        self.failed.retain(|e| e.path != path);
        self.completed.retain(|e| e.path != path);
        self.completed.push(StagingEntry {
            path: path.to_string(),
            fingerprint: fingerprint.clone(),
            outcome: Outcome::Success { artifact, cost },
            timestamp: Utc::now(),
        });
    }

    /// Record a failure. `attempts` is added to the prior retry count for
    /// the path, so counts accumulate across interrupted runs.
    pub fn record_failure(
        &mut self,
        path: &str,
        fingerprint: &Fingerprint,
        reason: impl Into<String>,
        attempts: u32,
        rate_limited: bool,
    ) -> u32 {
        let prior = self.failure_for(path).map_or(0, StagingEntry::retry_count);
        let retry_count = prior.saturating_add(attempts);
        self.failed.retain(|e| e.path != path);
        self.failed.push(StagingEntry {
            path: path.to_string(),
            fingerprint: fingerprint.clone(),
            outcome: Outcome::Failure {
                reason: reason.into(),
                retry_count,
                rate_limited,
            },
            timestamp: Utc::now(),
        });
        retry_count
    }

    /// Drop completed entries after they were merged; open failures stay.
    pub fn reset_completed(&mut self) -> usize {
        let n = self.completed.len();
        self.completed.clear();
        n
    }
}

/// Owns the staging file location.
#[derive(Debug, Clone)]
pub struct StagingStore {
    path: PathBuf,
}

impl StagingStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start a fresh log for `root_fingerprint` and persist it.
    pub fn create(&self, root_fingerprint: Fingerprint) -> Result<StagingLog> {
        let log = StagingLog::new(root_fingerprint);
        self.persist(&log)?;
        Ok(log)
    }

    pub fn append_success(
        &self,
        log: &mut StagingLog,
        path: &str,
        fingerprint: &Fingerprint,
        artifact: Artifact,
        cost: u64,
    ) -> Result<()> {
        log.record_success(path, fingerprint, artifact, cost);
        self.persist(log)
    }

    /// Returns the cumulative retry count now recorded for `path`.
    pub fn append_failure(
        &self,
        log: &mut StagingLog,
        path: &str,
        fingerprint: &Fingerprint,
        reason: impl Into<String>,
        attempts: u32,
        rate_limited: bool,
    ) -> Result<u32> {
        let count = log.record_failure(path, fingerprint, reason, attempts, rate_limited);
        self.persist(log)?;
        Ok(count)
    }

    /// Last complete log, or `None` when no run left one behind.
    pub fn load(&self) -> Result<Option<StagingLog>> {
        let Some(log) = atomic::read_json::<StagingLog>(&self.path, "staging_load")? else {
            return Ok(None);
        };
        if log.version != STAGING_VERSION {
            return Err(TreesumError::FormatVersion {
                context: "staging log",
                found: log.version,
                expected: STAGING_VERSION,
            });
        }
        Ok(Some(log))
    }

    pub fn persist(&self, log: &StagingLog) -> Result<()> {
        atomic::write_json(&self.path, log, "staging_save")
    }

    pub fn clear(&self) -> Result<()> {
        atomic::remove_if_exists(&self.path).map(|_| ())
    }
}
