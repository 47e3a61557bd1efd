#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use treesum::prelude::*;

/// What the scripted processor does for one call on a path.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Fail(ProcessError),
    Panic,
}

/// Processor double: succeeds by default, replays per-path scripts, records
/// every call in order.
#[derive(Default)]
pub struct Scripted {
    calls: Mutex<Vec<String>>,
    scripts: Mutex<HashMap<String, Vec<Step>>>,
    panic_after: Option<usize>,
    cancel_after: Option<(usize, CancelFlag)>,
    successes: AtomicUsize,
}

impl Scripted {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `steps` for `path`; once exhausted the path succeeds.
    pub fn script(self, path: &str, steps: Vec<Step>) -> Self {
        self.scripts.lock().insert(path.to_string(), steps);
        self
    }

    /// Always fail `path` with `err`.
    pub fn always_fail(self, path: &str, err: ProcessError) -> Self {
        self.script(path, vec![Step::Fail(err); 64])
    }

    /// Panic on the call following the `n`th success, emulating a crash.
    pub fn crash_after(mut self, n: usize) -> Self {
        self.panic_after = Some(n);
        self
    }

    /// Trip `flag` once `n` calls have succeeded, emulating a signal.
    pub fn cancel_after(mut self, n: usize, flag: CancelFlag) -> Self {
        self.cancel_after = Some((n, flag));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, path: &str) -> usize {
        self.calls.lock().iter().filter(|p| *p == path).count()
    }
}

impl Processor for Scripted {
    fn process(&self, request: &ProcessRequest<'_>) -> std::result::Result<Processed, ProcessError> {
        let path = request.node.path.clone();
        self.calls.lock().push(path.clone());

        if let Some(limit) = self.panic_after
            && self.successes.load(Ordering::SeqCst) >= limit
        {
            panic!("simulated crash while processing {path}");
        }

        let step = {
            let mut scripts = self.scripts.lock();
            scripts
                .get_mut(&path)
                .filter(|steps| !steps.is_empty())
                .map(|steps| steps.remove(0))
        };
        match step.unwrap_or(Step::Succeed) {
            Step::Fail(err) => return Err(err),
            Step::Panic => panic!("scripted panic for {path}"),
            Step::Succeed => {}
        }

        let done = self.successes.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((n, flag)) = &self.cancel_after
            && done >= *n
        {
            flag.cancel();
        }
        let body = if request.node.is_dir() {
            let children: Vec<String> = request
                .children
                .iter()
                .map(|c| format!("{}={}", c.path, c.artifact.as_text().unwrap_or("?")))
                .collect();
            format!("dir({})", children.join(";"))
        } else {
            let bytes = fs::read(request.absolute_path())?;
            format!("file:{}", String::from_utf8_lossy(&bytes))
        };
        Ok(Processed::new(Artifact::text(body), 10))
    }
}

/// Fast retries, single worker, no activity log noise.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.scan.parallelism = 1;
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.max_retry_after_ms = 5;
    config
}

pub fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

pub fn bundler<'p>(root: &Path, config: Config, processor: &'p Scripted) -> Bundler<'p> {
    Bundler::new(root, config, processor)
        .unwrap()
        .with_cancel_flag(CancelFlag::new())
}

pub fn load_manifest(root: &Path, config: &Config) -> Option<Manifest> {
    let paths = ProjectPaths::resolve(root, &config.paths);
    ManifestStore::new(&paths.manifest).load().unwrap()
}

pub fn load_staging(root: &Path, config: &Config) -> Option<StagingLog> {
    let paths = ProjectPaths::resolve(root, &config.paths);
    StagingStore::new(&paths.staging).load().unwrap()
}
