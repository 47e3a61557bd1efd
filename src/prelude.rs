//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use treesum::prelude::*;
//! ```

// Core
pub use crate::core::config::{Config, StaleRunPolicy};
pub use crate::core::errors::{Result, TreesumError};
pub use crate::core::paths::ProjectPaths;

// Scanner
pub use crate::scanner::diff::ChangeSet;
pub use crate::scanner::exclusion::ExclusionRules;
pub use crate::scanner::hasher::Fingerprint;
pub use crate::scanner::node::{Artifact, Node, NodeKind};
pub use crate::scanner::tree::{Tree, TreeBuilder};

// Store
pub use crate::store::manifest::{Manifest, ManifestStore};
pub use crate::store::staging::{StagingLog, StagingStore};

// Runner
pub use crate::runner::bundler::{Bundler, RunPlan, RunReport, StagingDisposition};
pub use crate::runner::lock::ProcessLock;
pub use crate::runner::processor::{ChildArtifact, ProcessError, ProcessRequest, Processed, Processor};
pub use crate::runner::retry::{RetryExecutor, RetryPolicy};
pub use crate::runner::signals::{CancelFlag, RunScope};
pub use crate::runner::status::{Status, inspect};

// Logging
pub use crate::logger::jsonl::ActivityLog;
