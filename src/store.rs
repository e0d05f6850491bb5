//! Repository Store: where the managed repository lives on disk.
//!
//! Only path composition and filesystem existence. Anything git-specific
//! belongs to `wflib_git`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Fixed segment under the data root that holds the managed repository
pub const REPOSITORY_DIR_NAME: &str = "workflow-libs";

#[derive(Debug, Clone)]
pub struct RepositoryStore {
    data_root: PathBuf,
}

impl RepositoryStore {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    /// `<data_root>/workflow-libs`, the same value on every call
    pub fn repository_root(&self) -> PathBuf {
        self.data_root.join(REPOSITORY_DIR_NAME)
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    pub fn ensure_parent_directories(&self, path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
            _ => Ok(()),
        }
    }
}
