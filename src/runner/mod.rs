//! Run orchestration: locking, cancellation, retries, and the bundler.

pub mod bundler;
pub mod lock;
pub mod processor;
pub mod retry;
pub mod signals;
pub mod status;
