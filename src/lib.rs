#![forbid(unsafe_code)]

//! treesum: an incremental, crash-safe summary cache over a file tree.
//!
//! Every file and directory gets a content fingerprint; an external
//! [`Processor`](runner::processor::Processor) derives an artifact for each
//! node whose fingerprint changed since the last run, children before
//! parents. Results are staged durably as they arrive and merged into the
//! manifest in bundles, so an interrupted run resumes where it stopped.
//!
//! # Library usage
//!
//! Use the [`prelude`] for convenient access to the most common types:
//!
//! ```rust,no_run
//! use treesum::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use treesum::core::config::Config;
//! use treesum::runner::bundler::Bundler;
//! ```

pub mod prelude;

pub mod core;
pub mod logger;
pub mod runner;
pub mod scanner;
pub mod store;
