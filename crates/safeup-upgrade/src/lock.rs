use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use crate::UpgradeError;

/// Advisory lock held for the duration of one promote, rollback, snapshot
/// or recovery. The lock file is removed when the guard is dropped.
#[derive(Debug)]
pub struct OperationLock {
    path: PathBuf,
}

impl OperationLock {
    pub fn acquire(path: &Path, operation: &str, id: &str) -> Result<Self, UpgradeError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let holder = read_lock_holder(path)
                    .unwrap_or_else(|| format!("lock file {}", path.display()));
                return Err(UpgradeError::OperationLocked { holder });
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to claim operation lock: {}", path.display()))
                    .into());
            }
        };

        let guard = Self {
            path: path.to_path_buf(),
        };
        let line = format!("{operation} {id} pid={}\n", std::process::id());
        file.write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .with_context(|| format!("failed to write operation lock: {}", path.display()))?;
        debug!(lock = %path.display(), operation, id, "operation lock acquired");
        Ok(guard)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(lock = %self.path.display(), error = %err, "failed to release operation lock");
            }
        }
    }
}

/// `<operation> <id> pid=<pid>` line of an existing lock file.
pub(crate) fn read_lock_holder(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    let holder = raw.trim();
    if holder.is_empty() {
        return None;
    }
    Some(holder.to_string())
}
