//! Content fingerprints: SHA-256 over file bytes and over sorted child
//! fingerprints.

#![allow(missing_docs)]

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::errors::{Result, TreesumError};

const READ_CHUNK: usize = 64 * 1024;

/// Domain tag mixed into every directory fingerprint.
const DIRECTORY_TAG: &[u8] = b"dir\0";

/// Lowercase hex SHA-256 digest used as a content-addressed cache key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an existing hex digest (e.g. one read back from disk).
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint raw content.
#[must_use]
pub fn hash_bytes(content: &[u8]) -> Fingerprint {
    Fingerprint(to_hex(&Sha256::digest(content)))
}

/// Fingerprint a file by streaming its bytes.
pub fn hash_file(path: &Path) -> Result<Fingerprint> {
    let file = File::open(path).map_err(|e| TreesumError::io(path, e))?;
    let mut reader = BufReader::with_capacity(READ_CHUNK, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).map_err(|e| TreesumError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Fingerprint(to_hex(&hasher.finalize())))
}

/// Fingerprint a directory from its children's fingerprints.
///
/// Input order does not matter: fingerprints are sorted before being
/// concatenated and digested. The digest is prefixed with a directory tag so
/// a directory never shares a fingerprint with a file, an empty one included.
#[must_use]
pub fn hash_children<'a, I>(children: I) -> Fingerprint
where
    I: IntoIterator<Item = &'a Fingerprint>,
{
    let mut sorted: Vec<&str> = children.into_iter().map(Fingerprint::as_str).collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    hasher.update(DIRECTORY_TAG);
    for fp in sorted {
        hasher.update(fp.as_bytes());
    }
    Fingerprint(to_hex(&hasher.finalize()))
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
