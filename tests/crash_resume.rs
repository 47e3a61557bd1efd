mod common;

use std::panic::{AssertUnwindSafe, catch_unwind};

use common::{Scripted, bundler, load_manifest, load_staging, test_config, write};
use tempfile::TempDir;
use treesum::prelude::*;
use treesum::scanner::hasher::hash_bytes;

fn six_files(root: &std::path::Path) {
    for i in 0..6 {
        write(root, &format!("f{i}.txt"), &format!("content {i}"));
    }
}

fn current_tree(root: &std::path::Path, config: &Config) -> Tree {
    let paths = ProjectPaths::resolve(root, &config.paths);
    let rules = ExclusionRules::for_project(config, &paths).unwrap();
    TreeBuilder::new(root, rules).build().unwrap()
}

#[test]
fn staged_entries_survive_a_crash_exactly_once() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    six_files(root);
    let mut config = test_config();
    config.bundle.bundle_size = 100;

    let crashing = Scripted::new().crash_after(3);
    let b = bundler(root, config.clone(), &crashing);
    let outcome = catch_unwind(AssertUnwindSafe(|| b.run()));
    assert!(outcome.is_err(), "processor panic takes the run down");
    assert_eq!(crashing.call_count(), 4);

    assert!(load_manifest(root, &config).is_none(), "no bundle was merged");
    let staging = load_staging(root, &config).unwrap();
    assert_eq!(staging.completed.len(), 3);

    let resumed = Scripted::new();
    let report = bundler(root, config.clone(), &resumed).run().unwrap();
    assert_eq!(report.staging, StagingDisposition::Resumed { merged: 3 });
    assert!(report.complete);
    for done in ["f0.txt", "f1.txt", "f2.txt"] {
        assert_eq!(resumed.calls_for(done), 0, "{done} was already staged");
    }
    assert_eq!(resumed.calls(), vec!["f3.txt", "f4.txt", "f5.txt", "."]);

    let manifest = load_manifest(root, &config).unwrap();
    assert_eq!(manifest.nodes.len(), 7);
    assert_eq!(manifest.counters.files, 6);
    assert_eq!(manifest.counters.processed, 7);
    assert_eq!(manifest.counters.total_cost, 70, "no entry counted twice");
    assert!(load_staging(root, &config).is_none());
}

#[test]
fn hand_built_staging_log_merges_all_entries() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    six_files(root);
    let config = test_config();
    let tree = current_tree(root, &config);

    let paths = ProjectPaths::resolve(root, &config.paths);
    let store = StagingStore::new(&paths.staging);
    let mut log = store.create(tree.root_fingerprint.clone()).unwrap();
    for key in ["f1.txt", "f4.txt"] {
        let node = tree.get(key).unwrap();
        store
            .append_success(&mut log, key, &node.fingerprint, Artifact::text(format!("staged {key}")), 1)
            .unwrap();
    }

    let processor = Scripted::new();
    let report = bundler(root, config.clone(), &processor).run().unwrap();
    assert_eq!(report.staging, StagingDisposition::Resumed { merged: 2 });
    assert_eq!(processor.calls_for("f1.txt"), 0);
    assert_eq!(processor.calls_for("f4.txt"), 0);

    let manifest = load_manifest(root, &config).unwrap();
    assert_eq!(
        manifest.nodes["f1.txt"].artifact.as_ref().and_then(Artifact::as_text),
        Some("staged f1.txt")
    );
    let root_summary = manifest.nodes["."].artifact.as_ref().and_then(Artifact::as_text).unwrap();
    assert!(root_summary.contains("f4.txt=staged f4.txt"));
}

#[test]
fn resume_merge_is_durable_before_processing() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    six_files(root);
    let mut config = test_config();
    config.bundle.bundle_size = 100;

    let first = Scripted::new().crash_after(2);
    let b = bundler(root, config.clone(), &first);
    assert!(catch_unwind(AssertUnwindSafe(|| b.run())).is_err());

    // Crash again on the very first call after resuming.
    let second = Scripted::new().crash_after(0);
    let b = bundler(root, config.clone(), &second);
    assert!(catch_unwind(AssertUnwindSafe(|| b.run())).is_err());

    let manifest = load_manifest(root, &config).expect("resume merge persisted");
    assert!(manifest.nodes.contains_key("f0.txt"));
    assert!(manifest.nodes.contains_key("f1.txt"));
    let staging = load_staging(root, &config).unwrap();
    assert!(staging.completed.is_empty(), "merged entries dropped from staging");
}

#[test]
fn interrupted_run_persists_and_resumes() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    six_files(root);
    let config = test_config();

    let flag = CancelFlag::new();
    let processor = Scripted::new().cancel_after(2, flag.clone());
    let b = Bundler::new(root, config.clone(), &processor)
        .unwrap()
        .with_cancel_flag(flag);
    let err = b.run().unwrap_err();
    assert!(matches!(err, TreesumError::Interrupted));
    assert_eq!(processor.call_count(), 2);
    assert!(!b.paths().lock.exists(), "lock released on interrupt");

    let manifest = load_manifest(root, &config).unwrap();
    assert!(manifest.nodes.contains_key("f0.txt"));
    assert!(manifest.root_fingerprint.is_none());
    assert!(load_staging(root, &config).is_some());

    let rest = Scripted::new();
    let report = bundler(root, config.clone(), &rest).run().unwrap();
    assert!(report.complete);
    assert_eq!(rest.calls(), vec!["f2.txt", "f3.txt", "f4.txt", "f5.txt", "."]);
}

#[test]
fn stale_staging_log_is_discarded_not_merged() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    six_files(root);
    let config = test_config();

    let paths = ProjectPaths::resolve(root, &config.paths);
    let store = StagingStore::new(&paths.staging);
    let mut log = store.create(hash_bytes(b"an older tree")).unwrap();
    let tree = current_tree(root, &config);
    let f0 = tree.get("f0.txt").unwrap();
    store
        .append_success(&mut log, "f0.txt", &f0.fingerprint, Artifact::text("from a stale run"), 1)
        .unwrap();

    let processor = Scripted::new();
    let report = bundler(root, config.clone(), &processor).run().unwrap();
    assert_eq!(report.staging, StagingDisposition::Discarded);
    assert_eq!(processor.calls_for("f0.txt"), 1);
    let manifest = load_manifest(root, &config).unwrap();
    assert_eq!(
        manifest.nodes["f0.txt"].artifact.as_ref().and_then(Artifact::as_text),
        Some("file:content 0")
    );
}

#[test]
fn refused_stale_run_changes_nothing() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    six_files(root);
    let mut config = test_config();
    config.bundle.stale_run = StaleRunPolicy::Refuse;

    let paths = ProjectPaths::resolve(root, &config.paths);
    StagingStore::new(&paths.staging)
        .create(hash_bytes(b"an older tree"))
        .unwrap();

    let processor = Scripted::new();
    let err = bundler(root, config.clone(), &processor).run().unwrap_err();
    assert!(matches!(err, TreesumError::StalePriorRun { .. }));
    assert_eq!(processor.call_count(), 0);
    assert!(load_staging(root, &config).is_some());

    config.bundle.stale_run = StaleRunPolicy::Discard;
    let report = bundler(root, config, &processor).run().unwrap();
    assert_eq!(report.staging, StagingDisposition::Discarded);
    assert!(report.complete);
}
