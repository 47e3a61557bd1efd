//! Durable state: the Cache Store (manifest) and the Staging Log.

pub mod atomic;
pub mod manifest;
pub mod staging;
