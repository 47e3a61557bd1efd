//! Bundler / merge controller: drives one full processing run.
//!
//! Flow: take the lock, walk the tree, reconcile any staging log left by an
//! interrupted run, diff against the manifest, then process pending files in
//! parallel and pending directories strictly deepest-first. Every outcome is
//! staged on the controlling thread; every `bundle_size` successes the staged
//! completions are folded into the manifest, so a crash loses at most one
//! bundle of work.

#![allow(missing_docs)]

use std::cmp::Reverse;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::unbounded;

use crate::core::config::{Config, StaleRunPolicy};
use crate::core::errors::{Result, TreesumError};
use crate::core::paths::ProjectPaths;
use crate::logger::jsonl::{ActivityLog, EventType, LogEntry, Severity};
use crate::runner::lock::ProcessLock;
use crate::runner::processor::{ChildArtifact, ProcessError, ProcessRequest, Processed, Processor};
use crate::runner::retry::{Attempted, RetryExecutor, RetryPolicy};
use crate::runner::signals::{CancelFlag, RunScope};
use crate::scanner::diff::{ChangeSet, detect};
use crate::scanner::exclusion::ExclusionRules;
use crate::scanner::hasher::Fingerprint;
use crate::scanner::node::{Artifact, Node};
use crate::scanner::tree::{Tree, TreeBuilder};
use crate::store::manifest::{Manifest, ManifestStore};
use crate::store::staging::{Outcome, StagingLog, StagingStore};

// ──────────────────── reports ────────────────────

/// What happened to a staging log found at run start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StagingDisposition {
    /// No prior log.
    #[default]
    None,
    /// Same tree: its completed entries were merged before diffing.
    Resumed { merged: usize },
    /// Different tree: dropped without merging.
    Discarded,
}

/// Summary of one run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub root_fingerprint: Option<Fingerprint>,
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub staging: StagingDisposition,
    /// Paths whose artifact was produced in this run.
    pub processed: Vec<String>,
    /// Paths whose processing failed in this run.
    pub failed: Vec<String>,
    /// Directories with no child carrying an artifact.
    pub skipped_directories: Vec<String>,
    /// Directories left pending because a child is unfinished.
    pub deferred_directories: Vec<String>,
    /// Pending paths never attempted (rate-limit abort).
    pub not_attempted: Vec<String>,
    pub bundles_merged: usize,
    /// Processor invocations including retries.
    pub processor_calls: u64,
    pub total_cost: u64,
    pub aborted_by_rate_limit: bool,
    /// Pid of a dead owner whose lock was cleared to start this run.
    pub stale_lock_cleared: Option<u32>,
    /// The manifest now records this tree with nothing left to process.
    pub complete: bool,
}

impl RunReport {
    /// Number of processor-backed paths the run classified as needing work.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.new + self.changed
    }
}

/// Dry-run view: what a run would process right now.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub tree: Tree,
    pub changes: ChangeSet,
    pub manifest_present: bool,
    pub pending_files: Vec<String>,
    /// Deepest first.
    pub pending_directories: Vec<String>,
}

// ──────────────────── bundler ────────────────────

/// Orchestrates runs for one project root.
pub struct Bundler<'p> {
    config: Config,
    paths: ProjectPaths,
    processor: &'p dyn Processor,
    activity: ActivityLog,
    cancel: Option<CancelFlag>,
}

impl<'p> Bundler<'p> {
    /// Validate `config` and resolve project paths.
    pub fn new(root: &Path, config: Config, processor: &'p dyn Processor) -> Result<Self> {
        config.validate()?;
        let paths = ProjectPaths::resolve(root, &config.paths);
        let activity = ActivityLog::for_project(&paths.activity_log, &config.logging);
        Ok(Self {
            config,
            paths,
            processor,
            activity,
            cancel: None,
        })
    }

    /// Drive cancellation from `flag` instead of hooking process signals.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    #[must_use]
    pub fn with_activity_log(mut self, activity: ActivityLog) -> Self {
        self.activity = activity;
        self
    }

    #[must_use]
    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the tree and diff it against the manifest. Takes no lock and
    /// calls no processor.
    pub fn plan(&self) -> Result<RunPlan> {
        let tree = self.build_tree()?;
        let manifest = ManifestStore::new(&self.paths.manifest).load()?;
        let changes = detect(&tree.nodes, manifest.as_ref());
        let (pending_files, pending_directories) =
            split_pending(&tree, changes.pending(), &HashSet::new());
        Ok(RunPlan {
            manifest_present: manifest.is_some(),
            tree,
            changes,
            pending_files,
            pending_directories,
        })
    }

    /// Execute one run under the project lock.
    ///
    /// Rate-limit aborts are reported in the [`RunReport`], not as errors.
    /// A termination signal yields [`TreesumError::Interrupted`] after staged
    /// work has been persisted.
    pub fn run(&self) -> Result<RunReport> {
        let scope = match &self.cancel {
            Some(flag) => RunScope::detached(flag.clone()),
            None => RunScope::install(),
        };

        let lock = ProcessLock::acquire(&self.paths.lock)?;
        self.activity.record(
            &LogEntry::info(EventType::LockAcquired).details(self.paths.lock.display().to_string()),
        );
        let mut report = RunReport::default();
        if let Some(stale) = lock.cleared_stale() {
            eprintln!(
                "[TSM-LOCK] cleared stale lock left by pid {} (since {})",
                stale.pid,
                stale.acquired_at.to_rfc3339()
            );
            self.activity.record(
                &LogEntry::warning(EventType::StaleLockCleared)
                    .details(format!("pid {} on {}", stale.pid, stale.host)),
            );
            report.stale_lock_cleared = Some(stale.pid);
        }

        let result = self.run_locked(&scope.cancel_flag(), &mut report);

        match &result {
            Ok(()) if report.aborted_by_rate_limit => self.activity.record(
                &LogEntry::warning(EventType::RunAborted)
                    .count(report.not_attempted.len() as u64)
                    .details("rate limited; remaining queue abandoned"),
            ),
            Ok(()) => self.activity.record(
                &LogEntry::info(EventType::RunComplete)
                    .count(report.processed.len() as u64)
                    .cost(report.total_cost),
            ),
            Err(TreesumError::Interrupted) => {
                self.activity.record(&LogEntry::warning(EventType::RunInterrupted));
            }
            Err(e) => self.activity.record(
                &LogEntry::new(EventType::RunAborted, Severity::Critical)
                    .error(e.code(), e.to_string()),
            ),
        }

        let released = lock.release();
        self.activity.record(&LogEntry::info(EventType::LockReleased));
        self.activity.flush();
        drop(scope);

        result?;
        released?;
        Ok(report)
    }

    fn build_tree(&self) -> Result<Tree> {
        let rules = ExclusionRules::for_project(&self.config, &self.paths)?;
        TreeBuilder::new(&self.paths.root, rules)
            .follow_symlinks(self.config.scan.follow_symlinks)
            .build()
    }

    fn run_locked(&self, cancel: &CancelFlag, report: &mut RunReport) -> Result<()> {
        let manifest_store = ManifestStore::new(&self.paths.manifest);
        let staging_store = StagingStore::new(&self.paths.staging);

        let tree = self.build_tree()?;
        report.root_fingerprint = Some(tree.root_fingerprint.clone());
        self.activity.record(
            &LogEntry::info(EventType::RunStart)
                .fingerprint(tree.root_fingerprint.as_str())
                .count(tree.len() as u64)
                .details(format!("config {}", self.config.stable_hash()?)),
        );

        let mut manifest = manifest_store.load()?;
        let mut resumed_paths: HashSet<String> = HashSet::new();
        let mut prior_log = None;

        if let Some(mut log) = staging_store.load()? {
            if log.matches_root(&tree.root_fingerprint) {
                let working = manifest.get_or_insert_with(Manifest::empty);
                let merged = working.merge_completed(&tree.nodes, &log.completed);
                if merged > 0 {
                    manifest_store.save(working)?;
                }
                resumed_paths.extend(log.completed.iter().map(|e| e.path.clone()));
                log.reset_completed();
                staging_store.persist(&log)?;
                report.staging = StagingDisposition::Resumed { merged };
                self.activity.record(
                    &LogEntry::info(EventType::StagingResumed)
                        .count(merged as u64)
                        .details(format!("{} open failures", log.failed.len())),
                );
                prior_log = Some(log);
            } else if self.config.bundle.stale_run == StaleRunPolicy::Refuse {
                return Err(TreesumError::StalePriorRun {
                    staged_root: log.root_fingerprint.to_string(),
                    current_root: tree.root_fingerprint.to_string(),
                });
            } else {
                eprintln!(
                    "[TSM-STAGING] discarding staging log from a different tree ({} entries)",
                    log.completed.len() + log.failed.len()
                );
                staging_store.clear()?;
                report.staging = StagingDisposition::Discarded;
                self.activity.record(
                    &LogEntry::warning(EventType::StagingDiscarded)
                        .fingerprint(log.root_fingerprint.as_str())
                        .count((log.completed.len() + log.failed.len()) as u64),
                );
            }
        }

        let changes = detect(&tree.nodes, manifest.as_ref());
        report.new = changes.new.len();
        report.changed = changes.changed.len();
        report.unchanged = changes.unchanged.len();
        report.deleted = changes.deleted.len();

        let manifest_existed = manifest.is_some();
        let mut working = manifest.unwrap_or_default();
        let dirty = working.apply_changes(&changes, &tree.nodes) || !manifest_existed;

        let (files, directories) = split_pending(&tree, changes.pending(), &resumed_paths);

        let log = match prior_log {
            Some(log) => log,
            None if files.is_empty() && directories.is_empty() => {
                StagingLog::new(tree.root_fingerprint.clone())
            }
            None => staging_store.create(tree.root_fingerprint.clone())?,
        };

        let mut state = RunState {
            tree: &tree,
            manifest: working,
            manifest_dirty: dirty,
            log,
            since_merge: 0,
            skipped: HashSet::new(),
            rate_limited: false,
            manifest_store,
            staging_store,
        };

        let executor = RetryExecutor::new(RetryPolicy::from(&self.config.retry), cancel.clone());

        self.process_files(&mut state, &executor, &files, report)?;
        if !state.rate_limited && !cancel.is_cancelled() {
            self.process_directories(&mut state, &executor, &directories, report)?;
        }

        let finished: HashSet<&str> = report
            .processed
            .iter()
            .chain(&report.failed)
            .chain(&report.skipped_directories)
            .chain(&report.deferred_directories)
            .map(String::as_str)
            .collect();
        report.not_attempted = files
            .iter()
            .chain(&directories)
            .filter(|p| !finished.contains(p.as_str()))
            .cloned()
            .collect();
        report.aborted_by_rate_limit = state.rate_limited;

        let interrupted = cancel.is_cancelled();
        self.finalize(&mut state, report, interrupted)?;
        if interrupted {
            return Err(TreesumError::Interrupted);
        }
        Ok(())
    }

    // ──────────────────── files ────────────────────

    fn process_files(
        &self,
        state: &mut RunState<'_>,
        executor: &RetryExecutor,
        files: &[String],
        report: &mut RunReport,
    ) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }

        let tree = state.tree;
        let root = tree.root.as_path();
        let workers = self.config.scan.parallelism.min(files.len()).max(1);
        let stop = AtomicBool::new(false);

        let (job_tx, job_rx) = unbounded::<&Node>();
        let (result_tx, result_rx) = unbounded::<(&Node, Attempted<Processed>)>();
        for path in files {
            if let Some(node) = tree.get(path) {
                let _ = job_tx.send(node);
            }
        }
        drop(job_tx);

        std::thread::scope(|s| -> Result<()> {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let stop = &stop;
                s.spawn(move || {
                    while !stop.load(Ordering::Relaxed) && !executor_cancelled(executor) {
                        let Ok(node) = job_rx.recv() else {
                            break;
                        };
                        let request = ProcessRequest {
                            node,
                            root,
                            children: Vec::new(),
                        };
                        let attempted = self.attempt(executor, &request);
                        let quota_exhausted = !attempted.cancelled
                            && attempted.result.as_ref().is_err_and(ProcessError::is_rate_limited);
                        if quota_exhausted {
                            stop.store(true, Ordering::Relaxed);
                        }
                        if result_tx.send((node, attempted)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            for (node, attempted) in &result_rx {
                let outcome = self.record_outcome(state, node, attempted, report);
                if outcome.is_err() || state.rate_limited {
                    stop.store(true, Ordering::Relaxed);
                }
                outcome?;
            }
            Ok(())
        })
    }

    // ──────────────────── directories ────────────────────

    fn process_directories(
        &self,
        state: &mut RunState<'_>,
        executor: &RetryExecutor,
        directories: &[String],
        report: &mut RunReport,
    ) -> Result<()> {
        let tree = state.tree;
        for path in directories {
            if state.rate_limited || executor_cancelled(executor) {
                break;
            }
            let Some(node) = tree.get(path) else {
                continue;
            };

            let step = match state.readiness(node) {
                Readiness::Ready(children) => {
                    let request = ProcessRequest {
                        node,
                        root: tree.root.as_path(),
                        children,
                    };
                    DirectoryStep::Attempted(self.attempt(executor, &request))
                }
                Readiness::Empty => DirectoryStep::Skip,
                Readiness::Blocked(child) => DirectoryStep::Defer(child),
            };

            let attempted = match step {
                DirectoryStep::Attempted(attempted) => attempted,
                DirectoryStep::Skip => {
                    state.skipped.insert(path.clone());
                    state.manifest_dirty |= state.manifest.record_skipped(node);
                    report.skipped_directories.push(path.clone());
                    self.activity.record(
                        &LogEntry::info(EventType::DirectorySkipped)
                            .path(path.as_str())
                            .details("no child carries an artifact"),
                    );
                    continue;
                }
                DirectoryStep::Defer(child) => {
                    report.deferred_directories.push(path.clone());
                    self.activity.record(
                        &LogEntry::info(EventType::DirectorySkipped)
                            .path(path.as_str())
                            .details(format!("deferred: child {child} unfinished")),
                    );
                    continue;
                }
            };
            self.record_outcome(state, node, attempted, report)?;
        }
        Ok(())
    }

    // ──────────────────── shared ────────────────────

    fn attempt(&self, executor: &RetryExecutor, request: &ProcessRequest<'_>) -> Attempted<Processed> {
        let path = request.node.path.as_str();
        executor.run_observed(
            |_| self.processor.process(request),
            |attempt, delay, err| {
                self.activity.record(
                    &LogEntry::info(EventType::RetryScheduled)
                        .path(path)
                        .attempt(attempt)
                        .delay_ms(duration_ms(delay))
                        .error(err.kind(), err.to_string()),
                );
            },
        )
    }

    /// Stage one outcome and merge when a bundle is full. Runs only on the
    /// controlling thread.
    fn record_outcome(
        &self,
        state: &mut RunState<'_>,
        node: &Node,
        attempted: Attempted<Processed>,
        report: &mut RunReport,
    ) -> Result<()> {
        report.processor_calls += u64::from(attempted.attempts);
        match attempted.result {
            Ok(Processed { artifact, cost }) => {
                state.staging_store.append_success(
                    &mut state.log,
                    &node.path,
                    &node.fingerprint,
                    artifact,
                    cost,
                )?;
                report.processed.push(node.path.clone());
                report.total_cost = report.total_cost.saturating_add(cost);
                self.activity.record(
                    &LogEntry::info(EventType::PathProcessed)
                        .path(node.path.as_str())
                        .fingerprint(node.fingerprint.short())
                        .attempt(attempted.attempts)
                        .cost(cost),
                );
                state.since_merge += 1;
                if state.since_merge >= self.config.bundle.bundle_size {
                    self.merge_bundle(state, report)?;
                }
            }
            Err(err) => {
                let rate_limited = err.is_rate_limited();
                let retry_count = state.staging_store.append_failure(
                    &mut state.log,
                    &node.path,
                    &node.fingerprint,
                    err.to_string(),
                    attempted.attempts,
                    rate_limited,
                )?;
                report.failed.push(node.path.clone());
                self.activity.record(
                    &LogEntry::warning(EventType::PathFailed)
                        .path(node.path.as_str())
                        .attempt(attempted.attempts)
                        .retry_count(retry_count)
                        .error(err.kind(), err.to_string()),
                );
                if rate_limited && !attempted.cancelled {
                    state.rate_limited = true;
                }
            }
        }
        Ok(())
    }

    /// Fold staged completions into the manifest, persist it, then drop the
    /// merged entries from the staging log. Manifest first: a crash between
    /// the two writes leaves entries that re-merge as no-ops.
    fn merge_bundle(&self, state: &mut RunState<'_>, report: &mut RunReport) -> Result<()> {
        let merged = state
            .manifest
            .merge_completed(&state.tree.nodes, &state.log.completed);
        if merged == 0 && !state.manifest_dirty {
            return Ok(());
        }
        state.since_merge = 0;
        state.manifest_store.save(&mut state.manifest)?;
        state.manifest_dirty = false;
        if state.log.reset_completed() > 0 {
            state.staging_store.persist(&state.log)?;
        }
        report.bundles_merged += 1;
        self.activity.record(&LogEntry::info(EventType::BundleMerged).count(merged as u64));
        Ok(())
    }

    fn finalize(&self, state: &mut RunState<'_>, report: &mut RunReport, interrupted: bool) -> Result<()> {
        let clean = state.log.failed.is_empty()
            && !state.rate_limited
            && !interrupted
            && report.deferred_directories.is_empty()
            && report.not_attempted.is_empty();

        if clean && !state.manifest.is_current_for(&state.tree.root_fingerprint) {
            state.manifest.root_fingerprint = Some(state.tree.root_fingerprint.clone());
            state.manifest_dirty = true;
        }
        self.merge_bundle(state, report)?;

        if state.log.failed.is_empty() && !interrupted {
            state.staging_store.clear()?;
        }
        report.complete = clean;
        Ok(())
    }
}

// ──────────────────── run state ────────────────────

struct RunState<'t> {
    tree: &'t Tree,
    manifest: Manifest,
    manifest_dirty: bool,
    log: StagingLog,
    since_merge: usize,
    /// Directories skipped this run for lack of child artifacts.
    skipped: HashSet<String>,
    rate_limited: bool,
    manifest_store: ManifestStore,
    staging_store: StagingStore,
}

enum Readiness<'a> {
    Ready(Vec<ChildArtifact<'a>>),
    Empty,
    Blocked(String),
}

enum DirectoryStep {
    Attempted(Attempted<Processed>),
    Skip,
    Defer(String),
}

impl RunState<'_> {
    /// Artifact for `path` valid for `fingerprint`: staged this bundle, or
    /// already in the manifest.
    fn artifact_for(&self, path: &str, fingerprint: &Fingerprint) -> Option<&Artifact> {
        self.log
            .completed
            .iter()
            .rev()
            .find(|e| e.path == path && &e.fingerprint == fingerprint)
            .and_then(|e| match &e.outcome {
                Outcome::Success { artifact, .. } => Some(artifact),
                Outcome::Failure { .. } => None,
            })
            .or_else(|| self.manifest.valid_artifact(path, fingerprint))
    }

    fn readiness<'a>(&'a self, dir: &'a Node) -> Readiness<'a> {
        let mut ready = Vec::with_capacity(dir.children.len());
        for child in &dir.children {
            let Some(child_node) = self.tree.get(child) else {
                continue;
            };
            if let Some(artifact) = self.artifact_for(child, &child_node.fingerprint) {
                ready.push(ChildArtifact {
                    path: child.as_str(),
                    kind: child_node.kind,
                    artifact,
                });
            } else if self.skipped.contains(child)
                || self.manifest.is_skipped_directory(child, &child_node.fingerprint)
            {
                continue;
            } else {
                return Readiness::Blocked(child.clone());
            }
        }
        if ready.is_empty() {
            Readiness::Empty
        } else {
            Readiness::Ready(ready)
        }
    }
}

// ──────────────────── helpers ────────────────────

/// Split pending paths into files (any order) and directories (deepest
/// first, then by path), leaving out `exclude`.
fn split_pending(
    tree: &Tree,
    pending: Vec<String>,
    exclude: &HashSet<String>,
) -> (Vec<String>, Vec<String>) {
    let (mut directories, files): (Vec<String>, Vec<String>) = pending
        .into_iter()
        .filter(|p| !exclude.contains(p))
        .filter(|p| tree.get(p).is_some())
        .partition(|p| tree.get(p).is_some_and(Node::is_dir));
    directories.sort_by(|a, b| {
        let da = tree.get(a).map_or(0, Node::depth);
        let db = tree.get(b).map_or(0, Node::depth);
        (Reverse(da), a).cmp(&(Reverse(db), b))
    });
    (files, directories)
}

fn executor_cancelled(executor: &RetryExecutor) -> bool {
    executor.cancel_flag().is_cancelled()
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::hasher::hash_bytes;
    use parking_lot::Mutex;
    use std::fs;

    /// Records calls; fails any path listed in `fail` with the given error.
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail: Vec<(String, ProcessError)>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: Vec::new(),
            }
        }

        fn failing(path: &str, err: ProcessError) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: vec![(path.to_string(), err)],
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl Processor for Recorder {
        fn process(&self, request: &ProcessRequest<'_>) -> std::result::Result<Processed, ProcessError> {
            let path = request.node.path.clone();
            self.calls.lock().push(path.clone());
            if let Some((_, err)) = self.fail.iter().find(|(p, _)| *p == path) {
                return Err(err.clone());
            }
            let body = if request.node.is_dir() {
                let kids: Vec<&str> = request.children.iter().map(|c| c.path).collect();
                format!("dir {path} [{}]", kids.join(","))
            } else {
                format!("file {path}")
            };
            Ok(Processed::new(Artifact::text(body), 1))
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.scan.parallelism = 2;
        config.retry.initial_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        config.retry.max_retry_after_ms = 2;
        config.logging.enabled = false;
        config
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn bundler<'p>(root: &Path, config: Config, p: &'p dyn Processor) -> Bundler<'p> {
        Bundler::new(root, config, p)
            .unwrap()
            .with_cancel_flag(CancelFlag::new())
    }

    #[test]
    fn directories_follow_their_children() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a/one.rs", "1");
        write(dir.path(), "src/two.rs", "2");
        let recorder = Recorder::new();

        let report = bundler(dir.path(), config(), &recorder).run().unwrap();
        assert!(report.complete);
        let calls = recorder.calls();
        let pos = |p: &str| calls.iter().position(|c| c == p).unwrap();
        assert!(pos("src/a/one.rs") < pos("src/a"));
        assert!(pos("src/a") < pos("src"));
        assert!(pos("src") < pos("."));
        assert_eq!(calls.len(), 5);
    }

    #[test]
    fn empty_directories_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "x");
        fs::create_dir_all(dir.path().join("empty/nested")).unwrap();
        let recorder = Recorder::new();

        let report = bundler(dir.path(), config(), &recorder).run().unwrap();
        assert_eq!(report.skipped_directories, vec!["empty/nested", "empty"]);
        assert!(!recorder.calls().contains(&"empty".to_string()));
        assert!(recorder.calls().contains(&".".to_string()));
        assert!(report.complete);

        let again = Recorder::new();
        let report = bundler(dir.path(), config(), &again).run().unwrap();
        assert!(again.calls().is_empty());
        assert!(report.skipped_directories.is_empty());
        assert_eq!((report.new, report.changed), (0, 0));
        assert!(report.complete);
    }

    #[test]
    fn failed_child_defers_ancestors_and_keeps_staging() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "lib/bad.rs", "b");
        write(dir.path(), "ok.rs", "o");
        let recorder = Recorder::failing("lib/bad.rs", ProcessError::request("400"));

        let b = bundler(dir.path(), config(), &recorder);
        let report = b.run().unwrap();
        assert_eq!(report.failed, vec!["lib/bad.rs"]);
        assert_eq!(report.deferred_directories, vec!["lib", "."]);
        assert!(!report.complete);

        let staging = StagingStore::new(&b.paths().staging).load().unwrap().unwrap();
        assert_eq!(staging.failed.len(), 1);
        assert_eq!(staging.failure_for("lib/bad.rs").unwrap().retry_count(), 1);

        let manifest = ManifestStore::new(&b.paths().manifest).load().unwrap().unwrap();
        assert!(manifest.nodes.contains_key("ok.rs"));
        assert!(manifest.root_fingerprint.is_none());
    }

    #[test]
    fn bundles_merge_every_n_successes() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..7 {
            write(dir.path(), &format!("f{i}.txt"), &i.to_string());
        }
        let mut cfg = config();
        cfg.bundle.bundle_size = 3;
        let recorder = Recorder::new();

        let report = bundler(dir.path(), cfg, &recorder).run().unwrap();
        // 8 successes (7 files + root): merges after 3 and 6, plus the final one.
        assert_eq!(report.processed.len(), 8);
        assert_eq!(report.bundles_merged, 3);
    }

    #[test]
    fn merge_with_nothing_staged_keeps_the_bundle_counter() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "x");
        let recorder = Recorder::new();
        let b = bundler(dir.path(), config(), &recorder);
        let paths = b.paths().clone();
        let rules = ExclusionRules::for_project(b.config(), &paths).unwrap();
        let tree = TreeBuilder::new(dir.path(), rules).build().unwrap();

        let staging_store = StagingStore::new(&paths.staging);
        let log = staging_store.create(tree.root_fingerprint.clone()).unwrap();
        let mut state = RunState {
            tree: &tree,
            manifest: Manifest::default(),
            manifest_dirty: false,
            log,
            since_merge: 2,
            skipped: HashSet::new(),
            rate_limited: false,
            manifest_store: ManifestStore::new(&paths.manifest),
            staging_store,
        };
        let mut report = RunReport::default();

        b.merge_bundle(&mut state, &mut report).unwrap();
        assert_eq!(state.since_merge, 2, "a no-op merge is not a bundle");
        assert_eq!(report.bundles_merged, 0);
        assert!(!paths.manifest.exists());

        let fp = tree.get("a.txt").unwrap().fingerprint.clone();
        state
            .staging_store
            .append_success(&mut state.log, "a.txt", &fp, Artifact::text("A"), 1)
            .unwrap();
        b.merge_bundle(&mut state, &mut report).unwrap();
        assert_eq!(state.since_merge, 0);
        assert_eq!(report.bundles_merged, 1);
        assert!(paths.manifest.exists());
    }

    #[test]
    fn plan_reports_without_processing() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a/b.txt", "x");
        let recorder = Recorder::new();
        let b = bundler(dir.path(), config(), &recorder);

        let plan = b.plan().unwrap();
        assert!(!plan.manifest_present);
        assert_eq!(plan.pending_files, vec!["a/b.txt"]);
        assert_eq!(plan.pending_directories, vec!["a", "."]);
        assert!(recorder.calls().is_empty());
        assert!(!b.paths().lock.exists());
    }

    #[test]
    fn stale_staging_is_refused_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "x");
        let mut cfg = config();
        cfg.bundle.stale_run = StaleRunPolicy::Refuse;
        let recorder = Recorder::new();
        let b = bundler(dir.path(), cfg, &recorder);
        StagingStore::new(&b.paths().staging)
            .create(hash_bytes(b"some other tree"))
            .unwrap();

        let err = b.run().unwrap_err();
        assert_eq!(err.code(), "TSM-3002");
        assert!(recorder.calls().is_empty());
        assert!(!b.paths().lock.exists(), "lock released on fatal error");
    }

    #[test]
    fn cancelled_run_is_interrupted_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "x");
        let recorder = Recorder::new();
        let flag = CancelFlag::new();
        flag.cancel();
        let b = Bundler::new(dir.path(), config(), &recorder)
            .unwrap()
            .with_cancel_flag(flag);

        let err = b.run().unwrap_err();
        assert!(matches!(err, TreesumError::Interrupted));
        assert!(recorder.calls().is_empty());
        assert!(!b.paths().lock.exists());
    }

    #[test]
    fn split_orders_directories_deepest_first() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "x/y/z/f", "1");
        write(dir.path(), "b/f", "2");
        let tree = TreeBuilder::new(dir.path(), ExclusionRules::default())
            .build()
            .unwrap();
        let pending: Vec<String> = tree.nodes.keys().cloned().collect();
        let (files, dirs) = split_pending(&tree, pending, &HashSet::new());
        assert_eq!(files.len(), 2);
        assert_eq!(dirs, vec!["x/y/z", "x/y", "b", "x", "."]);
    }
}
