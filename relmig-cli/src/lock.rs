//! Exclusive run lock next to the target database

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::MigrationError;

/// Contents of the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub run_id: String,
    pub pid: u32,
    pub started_at: String,
}

/// Held for the whole run; the file is removed on drop
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    info: LockInfo,
    released: bool,
}

impl RunLock {
    /// Create the lock file, failing if another run holds it
    pub fn acquire(path: &Path) -> Result<Self> {
        let info = LockInfo {
            run_id: uuid::Uuid::new_v4().to_string(),
            pid: std::process::id(),
            started_at: chrono::Utc::now().to_rfc3339(),
        };

        let mut file = match OpenOptions::new().create_new(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(path)
                    .ok()
                    .and_then(|text| serde_json::from_str::<LockInfo>(&text).ok());
                let message = match holder {
                    Some(h) => format!(
                        "run lock {} held by pid {} since {}; remove it if that process is gone",
                        path.display(),
                        h.pid,
                        h.started_at
                    ),
                    None => format!("run lock {} already exists", path.display()),
                };
                return Err(MigrationError::Configuration(message).into());
            }
            Err(e) => {
                return Err(MigrationError::Configuration(format!(
                    "failed to create run lock {}: {}",
                    path.display(),
                    e
                ))
                .into());
            }
        };

        file.write_all(serde_json::to_string_pretty(&info)?.as_bytes())?;
        file.sync_all()?;
        log::debug!("Acquired run lock {} ({})", path.display(), info.run_id);

        Ok(Self {
            path: path.to_path_buf(),
            info,
            released: false,
        })
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file now
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = fs::remove_file(&self.path) {
                log::warn!("Failed to remove run lock {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_run_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.db.relmig.lock");

        let lock = RunLock::acquire(&path).unwrap();
        assert_eq!(lock.info().pid, std::process::id());

        let err = RunLock::acquire(&path).unwrap_err();
        assert!(matches!(
            MigrationError::find(&err),
            Some(MigrationError::Configuration(_))
        ));
        assert!(err.to_string().contains("held by pid"));

        drop(lock);
        assert!(!path.exists());
        RunLock::acquire(&path).unwrap().release().unwrap();
        assert!(!path.exists());
    }
}
