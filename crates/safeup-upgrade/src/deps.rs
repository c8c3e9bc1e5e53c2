use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

use crate::fs_utils::{copy_path, remove_path_if_exists};
use crate::registry::{NoRegistry, PackageRegistry};

/// Filesystem primitives the orchestrator needs. All paths are assumed to
/// be on one physical filesystem; cross-device renames are not supported.
pub trait Filesystem {
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn copy_tree(&self, from: &Path, to: &Path) -> Result<()>;
    fn remove_tree(&self, path: &Path) -> Result<()>;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    /// True when `path` is a readable directory with at least one entry.
    fn has_entries(&self, path: &Path) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StdFilesystem;

impl Filesystem for StdFilesystem {
    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).with_context(|| {
            format!("failed renaming {} to {}", from.display(), to.display())
        })
    }

    fn copy_tree(&self, from: &Path, to: &Path) -> Result<()> {
        copy_path(from, to)
    }

    fn remove_tree(&self, path: &Path) -> Result<()> {
        remove_path_if_exists(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))
    }

    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn has_entries(&self, path: &Path) -> bool {
        fs::read_dir(path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }
}

pub trait Clock {
    fn now(&self) -> SystemTime;

    fn now_unix(&self) -> u64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Collaborators handed to the service at construction.
pub struct Dependencies {
    pub registry: Box<dyn PackageRegistry>,
    pub filesystem: Box<dyn Filesystem>,
    pub clock: Box<dyn Clock>,
}

impl Dependencies {
    pub fn new(registry: Box<dyn PackageRegistry>) -> Self {
        Self {
            registry,
            filesystem: Box::new(StdFilesystem),
            clock: Box::new(SystemClock),
        }
    }

    pub fn with_filesystem(mut self, filesystem: Box<dyn Filesystem>) -> Self {
        self.filesystem = filesystem;
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl Default for Dependencies {
    fn default() -> Self {
        Self::new(Box::new(NoRegistry))
    }
}
