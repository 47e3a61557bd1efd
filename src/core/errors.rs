//! TSM-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, TreesumError>;

/// Top-level error type for treesum.
#[derive(Debug, Error)]
pub enum TreesumError {
    #[error("[TSM-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[TSM-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[TSM-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[TSM-2001] project root is not a readable directory: {path}")]
    InvalidRoot { path: PathBuf },

    #[error("[TSM-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[TSM-2102] unsupported {context} format version {found} (expected {expected})")]
    FormatVersion {
        context: &'static str,
        found: u32,
        expected: u32,
    },

    #[error("[TSM-3001] lock held by pid {owner_pid} on {host} since {since}")]
    LockContention {
        owner_pid: u32,
        host: String,
        since: String,
    },

    #[error(
        "[TSM-3002] staging log belongs to tree {staged_root} but current tree is {current_root}; discard it to continue"
    )]
    StalePriorRun {
        staged_root: String,
        current_root: String,
    },

    #[error("[TSM-3003] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[TSM-3004] run interrupted by termination signal")]
    Interrupted,

    #[error("[TSM-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl TreesumError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "TSM-1001",
            Self::MissingConfig { .. } => "TSM-1002",
            Self::ConfigParse { .. } => "TSM-1003",
            Self::InvalidRoot { .. } => "TSM-2001",
            Self::Serialization { .. } => "TSM-2101",
            Self::FormatVersion { .. } => "TSM-2102",
            Self::LockContention { .. } => "TSM-3001",
            Self::StalePriorRun { .. } => "TSM-3002",
            Self::Io { .. } => "TSM-3003",
            Self::Interrupted => "TSM-3004",
            Self::Runtime { .. } => "TSM-3900",
        }
    }

    /// Whether re-running might resolve the failure.
    ///
    /// Lock contention clears once the other run ends and an interrupted run
    /// resumes from its staging log; everything else needs operator action.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockContention { .. } | Self::Interrupted)
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for TreesumError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for TreesumError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<TreesumError> {
        vec![
            TreesumError::InvalidConfig {
                details: String::new(),
            },
            TreesumError::MissingConfig {
                path: PathBuf::new(),
            },
            TreesumError::ConfigParse {
                context: "",
                details: String::new(),
            },
            TreesumError::InvalidRoot {
                path: PathBuf::new(),
            },
            TreesumError::Serialization {
                context: "",
                details: String::new(),
            },
            TreesumError::FormatVersion {
                context: "",
                found: 0,
                expected: 1,
            },
            TreesumError::LockContention {
                owner_pid: 1,
                host: String::new(),
                since: String::new(),
            },
            TreesumError::StalePriorRun {
                staged_root: String::new(),
                current_root: String::new(),
            },
            TreesumError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            },
            TreesumError::Interrupted,
            TreesumError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = all_variants();
        let codes: Vec<&str> = errors.iter().map(TreesumError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn display_includes_code() {
        for err in all_variants() {
            let msg = err.to_string();
            assert!(
                msg.contains(err.code()),
                "display should contain {}: {msg}",
                err.code()
            );
        }
    }

    #[test]
    fn lock_contention_names_owner() {
        let err = TreesumError::LockContention {
            owner_pid: 4242,
            host: "build-01".to_string(),
            since: "2026-01-01T00:00:00Z".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("4242"));
        assert!(msg.contains("build-01"));
        assert!(msg.contains("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn retryable_errors_are_correct() {
        assert!(
            TreesumError::LockContention {
                owner_pid: 1,
                host: String::new(),
                since: String::new(),
            }
            .is_retryable()
        );
        assert!(TreesumError::Interrupted.is_retryable());
        assert!(
            !TreesumError::StalePriorRun {
                staged_root: String::new(),
                current_root: String::new(),
            }
            .is_retryable()
        );
        assert!(
            !TreesumError::io("/tmp/x", std::io::Error::other("disk")).is_retryable()
        );
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: TreesumError = json_err.into();
        assert_eq!(err.code(), "TSM-2101");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: TreesumError = toml_err.into();
        assert_eq!(err.code(), "TSM-1003");
    }
}
