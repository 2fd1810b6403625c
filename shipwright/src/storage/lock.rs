//! Cross-process target lock
//!
//! Holds an exclusive advisory lock on `locks/<service>@<host>.lock` for the
//! lifetime of a deployment attempt, so two shipwright processes cannot
//! deploy the same service to the same host at once. The OS releases the
//! lock when the file is closed, including when the process dies.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fd_lock::RwLock;
use tracing::debug;

use crate::errors::DeployError;
use crate::models::target::SlotKey;

/// An acquired target lock; released on drop
pub struct TargetLock {
    path: PathBuf,
    _file: Box<RwLock<fs::File>>,
}

impl TargetLock {
    /// Try to lock `path` for `slot` without blocking
    pub fn try_acquire(path: impl AsRef<Path>, slot: &SlotKey) -> Result<Self, DeployError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let mut lock = Box::new(RwLock::new(file));
        {
            let mut guard = match lock.try_write() {
                Ok(guard) => guard,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(DeployError::AttemptInFlight {
                        service: slot.service.clone(),
                        host: slot.host.clone(),
                    });
                }
                Err(e) => return Err(e.into()),
            };
            guard.set_len(0)?;
            writeln!(guard, "{}", std::process::id())?;
            guard.flush()?;
            // Keep the lock past this scope; closing the file releases it
            std::mem::forget(guard);
        }

        debug!("Acquired target lock {}", path.display());
        Ok(Self { path, _file: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for TargetLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetLock")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::target::DeploymentTarget;

    #[test]
    fn test_second_acquire_is_rejected_until_release() {
        let dir = std::env::temp_dir().join(format!("shipwright-lock-{}", uuid::Uuid::new_v4()));
        let slot = SlotKey::new("api", &DeploymentTarget::new("10.0.0.5"));
        let path = dir.join("api@10.0.0.5.lock");

        let first = TargetLock::try_acquire(&path, &slot).unwrap();
        let second = TargetLock::try_acquire(&path, &slot);
        assert!(matches!(second, Err(DeployError::AttemptInFlight { .. })));

        drop(first);
        let third = TargetLock::try_acquire(&path, &slot).unwrap();
        assert_eq!(third.path(), path.as_path());

        drop(third);
        let _ = fs::remove_dir_all(dir);
    }
}
