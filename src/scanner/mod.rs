//! Content scanner: fingerprints, exclusion rules, tree walk, change detection.

pub mod diff;
pub mod exclusion;
pub mod hasher;
pub mod node;
pub mod tree;
