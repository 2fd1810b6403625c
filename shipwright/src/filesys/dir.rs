//! Directories under the storage layout

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

use crate::errors::DeployError;
use crate::filesys::file::File;

/// A directory addressed by path; created lazily by the writes under it
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A file at `name`, relative to this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    /// Remove the directory tree; already gone is fine
    pub async fn delete(&self) -> Result<(), DeployError> {
        match fs::remove_dir_all(&self.path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// A fresh, empty directory under the system temp dir
    pub async fn create_temp_dir(prefix: &str) -> Result<Dir, DeployError> {
        let path = std::env::temp_dir().join(format!("{}-{}", prefix, Uuid::new_v4().simple()));
        fs::create_dir_all(&path).await?;
        Ok(Dir::new(path))
    }
}
