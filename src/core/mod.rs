//! Core types: errors, configuration, project paths.

pub mod config;
pub mod errors;
pub mod paths;
