//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, TreesumError};

/// Full treesum configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub scan: ScanConfig,
    pub retry: RetryConfig,
    pub bundle: BundleConfig,
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
}

/// Tree walk behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScanConfig {
    /// Ordered exclusion rules: relative paths, bare names, or `*`/`**` globs.
    pub exclude: Vec<String>,
    pub follow_symlinks: bool,
    /// Worker threads used for file processing.
    pub parallelism: usize,
}

/// Retry/backoff knobs for external processor calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Ceiling applied to server-suggested retry-after waits.
    pub max_retry_after_ms: u64,
}

/// What to do with a staging log left by a run over a different tree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StaleRunPolicy {
    /// Drop the stale log and continue.
    #[default]
    Discard,
    /// Stop with `StalePriorRun` until an operator opts into discarding.
    Refuse,
}

/// Periodic merge settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BundleConfig {
    /// Successful stagings between Cache Store merges.
    pub bundle_size: usize,
    pub stale_run: StaleRunPolicy,
}

/// State file locations. Relative paths resolve against the project root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub state_dir: PathBuf,
    pub manifest_file: PathBuf,
    pub staging_file: PathBuf,
    pub lock_file: PathBuf,
    pub activity_log_file: PathBuf,
}

/// Activity log settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclude: vec![
                ".git".to_string(),
                "target".to_string(),
                "node_modules".to_string(),
            ],
            follow_symlinks: false,
            parallelism: std::thread::available_parallelism()
                .map_or(2, |n| n.get().saturating_div(2).max(1)),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            max_retry_after_ms: 120_000,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    #[must_use]
    pub const fn max_retry_after(&self) -> Duration {
        Duration::from_millis(self.max_retry_after_ms)
    }
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            bundle_size: 5,
            stale_run: StaleRunPolicy::Discard,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".treesum"),
            manifest_file: PathBuf::from("manifest.json"),
            staging_file: PathBuf::from("staging.json"),
            lock_file: PathBuf::from("run.lock"),
            activity_log_file: PathBuf::from("activity.jsonl"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_bytes: 16 * 1024 * 1024,
            max_rotated_files: 3,
        }
    }
}

impl Config {
    /// Default config location for a project.
    #[must_use]
    pub fn default_path(project_root: &Path) -> PathBuf {
        project_root
            .join(PathsConfig::default().state_dir)
            .join("config.toml")
    }

    /// Load config from the project default or an explicit path, then apply
    /// env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(project_root: &Path, path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(|| Self::default_path(project_root), Path::to_path_buf);

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| TreesumError::Io {
                path: path_buf.clone(),
                source,
            })?;
            toml::from_str::<Self>(&raw)?
        } else if path.is_some() {
            return Err(TreesumError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Merge two fully-typed configs.
    ///
    /// Every overlay field that differs from its default wins; exclusion
    /// lists concatenate with duplicates removed (first occurrence kept).
    #[must_use]
    pub fn merged(base: &Self, overlay: &Self) -> Self {
        let defaults = Self::default();
        let mut out = base.clone();

        let mut exclude = base.scan.exclude.clone();
        for rule in &overlay.scan.exclude {
            if !exclude.contains(rule) {
                exclude.push(rule.clone());
            }
        }
        out.scan.exclude = exclude;
        overlay_field(
            &mut out.scan.follow_symlinks,
            overlay.scan.follow_symlinks,
            defaults.scan.follow_symlinks,
        );
        overlay_field(
            &mut out.scan.parallelism,
            overlay.scan.parallelism,
            defaults.scan.parallelism,
        );

        overlay_field(
            &mut out.retry.max_retries,
            overlay.retry.max_retries,
            defaults.retry.max_retries,
        );
        overlay_field(
            &mut out.retry.initial_delay_ms,
            overlay.retry.initial_delay_ms,
            defaults.retry.initial_delay_ms,
        );
        overlay_field(
            &mut out.retry.multiplier,
            overlay.retry.multiplier,
            defaults.retry.multiplier,
        );
        overlay_field(
            &mut out.retry.max_delay_ms,
            overlay.retry.max_delay_ms,
            defaults.retry.max_delay_ms,
        );
        overlay_field(
            &mut out.retry.max_retry_after_ms,
            overlay.retry.max_retry_after_ms,
            defaults.retry.max_retry_after_ms,
        );

        overlay_field(
            &mut out.bundle.bundle_size,
            overlay.bundle.bundle_size,
            defaults.bundle.bundle_size,
        );
        overlay_field(
            &mut out.bundle.stale_run,
            overlay.bundle.stale_run,
            defaults.bundle.stale_run,
        );

        overlay_field(
            &mut out.paths.state_dir,
            overlay.paths.state_dir.clone(),
            defaults.paths.state_dir,
        );
        overlay_field(
            &mut out.paths.manifest_file,
            overlay.paths.manifest_file.clone(),
            defaults.paths.manifest_file,
        );
        overlay_field(
            &mut out.paths.staging_file,
            overlay.paths.staging_file.clone(),
            defaults.paths.staging_file,
        );
        overlay_field(
            &mut out.paths.lock_file,
            overlay.paths.lock_file.clone(),
            defaults.paths.lock_file,
        );
        overlay_field(
            &mut out.paths.activity_log_file,
            overlay.paths.activity_log_file.clone(),
            defaults.paths.activity_log_file,
        );

        overlay_field(
            &mut out.logging.enabled,
            overlay.logging.enabled,
            defaults.logging.enabled,
        );
        overlay_field(
            &mut out.logging.max_size_bytes,
            overlay.logging.max_size_bytes,
            defaults.logging.max_size_bytes,
        );
        overlay_field(
            &mut out.logging.max_rotated_files,
            overlay.logging.max_rotated_files,
            defaults.logging.max_rotated_files,
        );

        out
    }

    /// Deterministic hash of the effective config for the activity log.
    ///
    /// FNV-1a over canonical JSON so the value is stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("TREESUM_SCAN_EXCLUDE") {
            for rule in raw.split(',').map(str::trim).filter(|r| !r.is_empty()) {
                if !self.scan.exclude.iter().any(|existing| existing == rule) {
                    self.scan.exclude.push(rule.to_string());
                }
            }
        }
        if let Some(raw) = lookup("TREESUM_SCAN_FOLLOW_SYMLINKS") {
            self.scan.follow_symlinks = parse_env("TREESUM_SCAN_FOLLOW_SYMLINKS", &raw)?;
        }
        if let Some(raw) = lookup("TREESUM_SCAN_PARALLELISM") {
            self.scan.parallelism = parse_env("TREESUM_SCAN_PARALLELISM", &raw)?;
        }

        if let Some(raw) = lookup("TREESUM_RETRY_MAX_RETRIES") {
            self.retry.max_retries = parse_env("TREESUM_RETRY_MAX_RETRIES", &raw)?;
        }
        if let Some(raw) = lookup("TREESUM_RETRY_INITIAL_DELAY_MS") {
            self.retry.initial_delay_ms = parse_env("TREESUM_RETRY_INITIAL_DELAY_MS", &raw)?;
        }
        if let Some(raw) = lookup("TREESUM_RETRY_MULTIPLIER") {
            self.retry.multiplier = parse_env("TREESUM_RETRY_MULTIPLIER", &raw)?;
        }
        if let Some(raw) = lookup("TREESUM_RETRY_MAX_DELAY_MS") {
            self.retry.max_delay_ms = parse_env("TREESUM_RETRY_MAX_DELAY_MS", &raw)?;
        }
        if let Some(raw) = lookup("TREESUM_RETRY_MAX_RETRY_AFTER_MS") {
            self.retry.max_retry_after_ms = parse_env("TREESUM_RETRY_MAX_RETRY_AFTER_MS", &raw)?;
        }

        if let Some(raw) = lookup("TREESUM_BUNDLE_SIZE") {
            self.bundle.bundle_size = parse_env("TREESUM_BUNDLE_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("TREESUM_BUNDLE_STALE_RUN") {
            self.bundle.stale_run = match raw.trim().to_ascii_lowercase().as_str() {
                "discard" => StaleRunPolicy::Discard,
                "refuse" => StaleRunPolicy::Refuse,
                other => {
                    return Err(TreesumError::ConfigParse {
                        context: "env",
                        details: format!(
                            "TREESUM_BUNDLE_STALE_RUN={other:?}: expected \"discard\" or \"refuse\""
                        ),
                    });
                }
            };
        }

        if let Some(raw) = lookup("TREESUM_STATE_DIR") {
            self.paths.state_dir = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("TREESUM_LOGGING_ENABLED") {
            self.logging.enabled = parse_env("TREESUM_LOGGING_ENABLED", &raw)?;
        }

        Ok(())
    }

    /// Reject settings a run cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.bundle.bundle_size == 0 {
            return Err(TreesumError::InvalidConfig {
                details: "bundle.bundle_size must be >= 1".to_string(),
            });
        }
        if self.scan.parallelism == 0 {
            return Err(TreesumError::InvalidConfig {
                details: "scan.parallelism must be >= 1".to_string(),
            });
        }
        if !(self.retry.multiplier >= 1.0 && self.retry.multiplier.is_finite()) {
            return Err(TreesumError::InvalidConfig {
                details: format!(
                    "retry.multiplier must be a finite value >= 1.0, got {}",
                    self.retry.multiplier
                ),
            });
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(TreesumError::InvalidConfig {
                details: format!(
                    "retry.initial_delay_ms ({}) must be <= retry.max_delay_ms ({})",
                    self.retry.initial_delay_ms, self.retry.max_delay_ms
                ),
            });
        }
        if self.paths.state_dir.as_os_str().is_empty() {
            return Err(TreesumError::InvalidConfig {
                details: "paths.state_dir must not be empty".to_string(),
            });
        }

        for rule in &self.scan.exclude {
            crate::scanner::exclusion::validate_rule(rule)?;
        }

        Ok(())
    }
}

fn overlay_field<T: PartialEq>(slot: &mut T, overlay: T, default: T) {
    if overlay != default {
        *slot = overlay;
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|error| TreesumError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}
