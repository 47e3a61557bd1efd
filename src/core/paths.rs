//! Shared path manipulation utilities.
//!
//! Node keys are project-relative, `/`-separated strings. The project root is
//! the reserved key `"."`.

use std::env;
use std::path::{Component, Path, PathBuf};

use crate::core::config::PathsConfig;

/// Key reserved for the project root directory.
pub const ROOT_KEY: &str = ".";

/// Resolve a path to an absolute, normalized path.
///
/// If `fs::canonicalize` succeeds (path exists), it is used to resolve symlinks
/// and normalize components.
///
/// If it fails (e.g. path does not exist), the path is made absolute relative
/// to CWD and `..`/`.` components are resolved syntactically.
pub fn resolve_absolute_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    };

    if let Ok(canonical) = std::fs::canonicalize(&absolute) {
        return canonical;
    }

    normalize_syntactic(&absolute)
}

fn normalize_syntactic(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::Normal(_) => {
                components.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
        }
    }
    components.into_iter().collect()
}

/// Join a child name onto a node key.
#[must_use]
pub fn join_key(parent: &str, name: &str) -> String {
    if parent == ROOT_KEY {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Parent key of a node key; `None` for the root.
#[must_use]
pub fn parent_key(key: &str) -> Option<&str> {
    if key == ROOT_KEY {
        return None;
    }
    Some(key.rsplit_once('/').map_or(ROOT_KEY, |(parent, _)| parent))
}

/// Number of segments below the root (`"."` is 0, `"a/b"` is 2).
#[must_use]
pub fn key_depth(key: &str) -> usize {
    if key == ROOT_KEY {
        0
    } else {
        key.split('/').count()
    }
}

/// Normalize a user-supplied relative path into key form.
///
/// Strips leading `./`, trailing `/`, and converts `\` separators.
#[must_use]
pub fn normalize_key(raw: &str) -> String {
    let mut key = raw.replace('\\', "/");
    while let Some(stripped) = key.strip_prefix("./") {
        key = stripped.to_string();
    }
    while key.len() > 1 && key.ends_with('/') {
        key.pop();
    }
    if key.is_empty() {
        ROOT_KEY.to_string()
    } else {
        key
    }
}

/// Resolved on-disk locations for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub manifest: PathBuf,
    pub staging: PathBuf,
    pub lock: PathBuf,
    pub activity_log: PathBuf,
}

impl ProjectPaths {
    /// Resolve every state file against `root`. Relative entries in `paths`
    /// are taken relative to the project root.
    #[must_use]
    pub fn resolve(root: &Path, paths: &PathsConfig) -> Self {
        let root = resolve_absolute_path(root);
        let anchor = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                root.join(p)
            }
        };
        let state_dir = anchor(&paths.state_dir);
        Self {
            manifest: state_dir.join(&paths.manifest_file),
            staging: state_dir.join(&paths.staging_file),
            lock: state_dir.join(&paths.lock_file),
            activity_log: state_dir.join(&paths.activity_log_file),
            state_dir,
            root,
        }
    }

    /// The state directory's key when it lives inside the project tree.
    #[must_use]
    pub fn state_dir_key(&self) -> Option<String> {
        let rel = self.state_dir.strip_prefix(&self.root).ok()?;
        let key = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        if key.is_empty() { None } else { Some(key) }
    }
}
