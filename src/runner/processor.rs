//! The external Processor seam and its failure taxonomy.
//!
//! Implementations (a model client, a test double) turn one node plus the
//! artifacts of its children into an artifact. They report failures through
//! [`ProcessError`], whose variants carry everything the retry executor needs
//! to classify them.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::core::paths::ROOT_KEY;
use crate::scanner::node::{Artifact, Node, NodeKind};

/// Per-path failure reported by a [`Processor`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProcessError {
    /// Quota exhausted. Always retried; `retry_after` is the server's hint.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Service-side failure. Retried only when flagged (5xx, timeouts).
    #[error("service error: {message}")]
    Service { message: String, retryable: bool },

    /// Client-side rejection. Never retried.
    #[error("request rejected: {message}")]
    Request { message: String },

    /// Local read or persistence failure for this path. Never retried.
    #[error("io failure: {message}")]
    Io { message: String },
}

/// How the retry executor treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    RateLimited { retry_after: Option<Duration> },
    Retryable,
    Terminal,
}

impl ProcessError {
    #[must_use]
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            message: "too many requests".to_string(),
            retry_after,
        }
    }

    #[must_use]
    pub fn service(message: impl Into<String>, retryable: bool) -> Self {
        Self::Service {
            message: message.into(),
            retryable,
        }
    }

    #[must_use]
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request {
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn class(&self) -> RetryClass {
        match self {
            Self::RateLimited { retry_after, .. } => RetryClass::RateLimited {
                retry_after: *retry_after,
            },
            Self::Service {
                retryable: true, ..
            } => RetryClass::Retryable,
            Self::Service { .. } | Self::Request { .. } | Self::Io { .. } => RetryClass::Terminal,
        }
    }

    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Short stable tag for log lines.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Service { .. } => "service",
            Self::Request { .. } => "request",
            Self::Io { .. } => "io",
        }
    }
}

impl From<std::io::Error> for ProcessError {
    fn from(value: std::io::Error) -> Self {
        Self::Io {
            message: value.to_string(),
        }
    }
}

/// A child's finished artifact, handed to a directory's processing call.
#[derive(Debug, Clone, Copy)]
pub struct ChildArtifact<'a> {
    pub path: &'a str,
    pub kind: NodeKind,
    pub artifact: &'a Artifact,
}

/// Everything a processor sees for one node.
#[derive(Debug, Clone)]
pub struct ProcessRequest<'a> {
    pub node: &'a Node,
    pub root: &'a Path,
    /// Sorted by path; empty for files.
    pub children: Vec<ChildArtifact<'a>>,
}

impl ProcessRequest<'_> {
    /// Absolute on-disk location of the node.
    #[must_use]
    pub fn absolute_path(&self) -> PathBuf {
        if self.node.path == ROOT_KEY {
            self.root.to_path_buf()
        } else {
            self.root.join(&self.node.path)
        }
    }
}

/// Successful processor output.
#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    pub artifact: Artifact,
    /// Opaque numeric cost (e.g. tokens) summed into manifest counters.
    pub cost: u64,
}

impl Processed {
    #[must_use]
    pub fn new(artifact: Artifact, cost: u64) -> Self {
        Self { artifact, cost }
    }
}

/// External collaborator deriving an artifact for one node.
///
/// Files may be processed from several worker threads at once.
pub trait Processor: Send + Sync {
    fn process(&self, request: &ProcessRequest<'_>) -> Result<Processed, ProcessError>;
}

impl<F> Processor for F
where
    F: Fn(&ProcessRequest<'_>) -> Result<Processed, ProcessError> + Send + Sync,
{
    fn process(&self, request: &ProcessRequest<'_>) -> Result<Processed, ProcessError> {
        self(request)
    }
}
