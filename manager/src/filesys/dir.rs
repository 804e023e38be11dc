//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::errors::BotError;
use crate::filesys::file::File;

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), BotError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Delete the directory and all contents
    pub async fn delete(&self) -> Result<(), BotError> {
        match fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Recursively hand the tree over to `uid:gid`
    pub async fn chown_recursive(&self, uid: u32, gid: u32) -> Result<(), BotError> {
        let root = self.path.clone();
        tokio::task::spawn_blocking(move || chown_tree(&root, uid, gid))
            .await
            .map_err(|e| BotError::Internal(e.to_string()))?
    }

    /// Get a file within this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    /// Get a subdirectory
    pub fn subdir(&self, name: &str) -> Dir {
        Dir::new(self.path.join(name))
    }
}

#[cfg(unix)]
fn chown_tree(root: &Path, uid: u32, gid: u32) -> Result<(), BotError> {
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| BotError::StorageError(e.to_string()))?;
        std::os::unix::fs::lchown(entry.path(), Some(uid), Some(gid))?;
    }
    debug!("Changed ownership of {} to {}:{}", root.display(), uid, gid);
    Ok(())
}

#[cfg(not(unix))]
fn chown_tree(root: &Path, _uid: u32, _gid: u32) -> Result<(), BotError> {
    debug!("Ownership changes unsupported, skipping {}", root.display());
    Ok(())
}
