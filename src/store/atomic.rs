//! Whole-file JSON persistence through write-to-temp then rename.
//!
//! A reader (or a process restarted after a crash) sees either the previous
//! complete file or the new complete file, never a truncated one.

#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::errors::{Result, TreesumError};

/// Sibling temp path used while writing `path`.
#[must_use]
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json<T: Serialize>(path: &Path, value: &T, context: &'static str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| TreesumError::io(parent, e))?;
    }

    let temp_path = temp_path_for(path);
    let file = {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            opts.mode(0o600);
        }
        opts.open(&temp_path)
            .map_err(|e| TreesumError::io(&temp_path, e))?
    };

    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value).map_err(|e| TreesumError::Serialization {
        context,
        details: e.to_string(),
    })?;
    writer.flush().map_err(|e| TreesumError::io(&temp_path, e))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| TreesumError::io(&temp_path, e))?;
    drop(writer);

    fs::rename(&temp_path, path).map_err(|e| TreesumError::io(path, e))?;
    Ok(())
}

/// Read a JSON file written by [`write_json`]. A missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path, context: &'static str) -> Result<Option<T>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(TreesumError::io(path, err)),
    };
    serde_json::from_reader(BufReader::new(file))
        .map(Some)
        .map_err(|e| TreesumError::Serialization {
            context,
            details: format!("{}: {e}", path.display()),
        })
}

/// Remove `path` if present. Missing files are not an error.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(TreesumError::io(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        let mut value = BTreeMap::new();
        value.insert("a".to_string(), 1u32);

        write_json(&path, &value, "test").unwrap();
        let loaded: BTreeMap<String, u32> = read_json(&path, "test").unwrap().unwrap();
        assert_eq!(loaded, value);
        assert!(!temp_path_for(&path).exists(), "temp file renamed away");
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<BTreeMap<String, u32>> =
            read_json(&dir.path().join("absent.json"), "test").unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn truncated_file_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{\"a\": 1").unwrap();
        let err = read_json::<BTreeMap<String, u32>>(&path, "test").unwrap_err();
        assert_eq!(err.code(), "TSM-2101");
    }

    #[test]
    fn leftover_temp_file_does_not_shadow_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json(&path, &vec![1, 2, 3], "test").unwrap();
        // Simulate a crash between temp write and rename.
        fs::write(temp_path_for(&path), "{garbage").unwrap();
        let loaded: Vec<i32> = read_json(&path, "test").unwrap().unwrap();
        assert_eq!(loaded, vec![1, 2, 3]);
        // The next write truncates the stale temp file.
        write_json(&path, &vec![4], "test").unwrap();
        let loaded: Vec<i32> = read_json(&path, "test").unwrap().unwrap();
        assert_eq!(loaded, vec![4]);
    }

    #[cfg(unix)]
    #[test]
    fn state_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json(&path, &1u8, "test").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn remove_if_exists_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        fs::write(&path, "1").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }
}
