//! Tree builder: depth-first walk producing a fingerprinted node map.
//!
//! The walk uses an explicit work stack. Each directory is visited twice: on
//! entry its files are hashed and subdirectories queued, on exit its children
//! fingerprints are folded into its own. Exclusion rules are checked before
//! anything is read, so excluded subtrees are never opened.
//!
//! Unreadable entries that are not excluded abort the build: a partial tree
//! would produce a root fingerprint that silently disagrees with the disk.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::errors::{Result, TreesumError};
use crate::core::paths::{ROOT_KEY, join_key, resolve_absolute_path};
use crate::scanner::exclusion::ExclusionRules;
use crate::scanner::hasher::{Fingerprint, hash_children, hash_file};
use crate::scanner::node::{Node, NodeKind};

/// Fully materialized snapshot of the tracked tree.
#[derive(Debug, Clone)]
pub struct Tree {
    pub root: PathBuf,
    pub nodes: BTreeMap<String, Node>,
    pub root_fingerprint: Fingerprint,
}

impl Tree {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Node> {
        self.nodes.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn file_count(&self) -> usize {
        self.nodes.values().filter(|n| n.kind == NodeKind::File).count()
    }

    pub fn directory_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_dir()).count()
    }
}

/// Walk state for one directory.
enum Step {
    Enter { key: String, dir: PathBuf },
    Exit { key: String, children: Vec<String> },
}

/// Builds a [`Tree`] from a root directory.
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    root: PathBuf,
    rules: ExclusionRules,
    follow_symlinks: bool,
}

impl TreeBuilder {
    pub fn new(root: &Path, rules: ExclusionRules) -> Self {
        Self {
            root: resolve_absolute_path(root),
            rules,
            follow_symlinks: false,
        }
    }

    #[must_use]
    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the root and return every non-excluded node.
    pub fn build(&self) -> Result<Tree> {
        match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(TreesumError::InvalidRoot {
                    path: self.root.clone(),
                });
            }
        }

        let mut nodes: BTreeMap<String, Node> = BTreeMap::new();
        let mut visited: HashSet<PathBuf> = HashSet::new();
        if self.follow_symlinks {
            visited.insert(fs::canonicalize(&self.root).map_err(|e| TreesumError::io(&self.root, e))?);
        }

        let mut stack = vec![Step::Enter {
            key: ROOT_KEY.to_string(),
            dir: self.root.clone(),
        }];

        while let Some(step) = stack.pop() {
            match step {
                Step::Enter { key, dir } => {
                    let (children, subdirs) = self.enter_directory(&key, &dir, &mut nodes, &mut visited)?;
                    stack.push(Step::Exit { key, children });
                    // Reverse so the lexicographically first subdirectory is walked first.
                    for (child_key, child_dir) in subdirs.into_iter().rev() {
                        stack.push(Step::Enter {
                            key: child_key,
                            dir: child_dir,
                        });
                    }
                }
                Step::Exit { key, children } => {
                    let fingerprint = hash_children(
                        children
                            .iter()
                            .filter_map(|child| nodes.get(child))
                            .map(|node| &node.fingerprint),
                    );
                    nodes.insert(key.clone(), Node::directory(key, fingerprint, children));
                }
            }
        }

        let root_fingerprint = nodes
            .get(ROOT_KEY)
            .map(|n| n.fingerprint.clone())
            .ok_or_else(|| TreesumError::Runtime {
                details: "tree walk finished without a root node".to_string(),
            })?;

        Ok(Tree {
            root: self.root.clone(),
            nodes,
            root_fingerprint,
        })
    }

    /// Read one directory: hash its files, return sorted child keys and the
    /// subdirectories still to walk.
    fn enter_directory(
        &self,
        key: &str,
        dir: &Path,
        nodes: &mut BTreeMap<String, Node>,
        visited: &mut HashSet<PathBuf>,
    ) -> Result<(Vec<String>, Vec<(String, PathBuf)>)> {
        let entries = fs::read_dir(dir).map_err(|e| TreesumError::io(dir, e))?;

        let mut listed: Vec<(String, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TreesumError::io(dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_key = join_key(key, &name);
            if self.rules.is_excluded(&child_key) {
                continue;
            }
            listed.push((child_key, entry.path()));
        }
        listed.sort_by(|a, b| a.0.cmp(&b.0));

        let mut children = Vec::with_capacity(listed.len());
        let mut subdirs = Vec::new();

        for (child_key, path) in listed {
            let link_meta = fs::symlink_metadata(&path).map_err(|e| TreesumError::io(&path, e))?;
            let meta = if link_meta.file_type().is_symlink() {
                if !self.follow_symlinks {
                    continue;
                }
                fs::metadata(&path).map_err(|e| TreesumError::io(&path, e))?
            } else {
                link_meta
            };

            if meta.is_file() {
                let fingerprint = hash_file(&path)?;
                nodes.insert(child_key.clone(), Node::file(child_key.clone(), fingerprint));
                children.push(child_key);
            } else if meta.is_dir() {
                if self.follow_symlinks {
                    let canonical = fs::canonicalize(&path).map_err(|e| TreesumError::io(&path, e))?;
                    if !visited.insert(canonical) {
                        // Already walked through another link: a cycle or alias.
                        continue;
                    }
                }
                children.push(child_key.clone());
                subdirs.push((child_key, path));
            }
            // Sockets, fifos and devices carry no content to summarize.
        }

        Ok((children, subdirs))
    }
}
