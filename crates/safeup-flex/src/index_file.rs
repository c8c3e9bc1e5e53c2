use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::IndexEntry;

/// Persisted form of an index: `{version, timestamp, index}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledIndex {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub index: BTreeMap<String, IndexEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFile {
    path: PathBuf,
}

impl IndexFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable files load as an empty, unversioned index so
    /// the next sync rebuilds it.
    pub fn load(&self) -> CompiledIndex {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return CompiledIndex::default(),
            Err(err) => {
                warn!(index = %self.path.display(), error = %err, "ignoring unreadable index file");
                return CompiledIndex::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(compiled) => compiled,
            Err(err) => {
                warn!(index = %self.path.display(), error = %err, "ignoring malformed index file");
                CompiledIndex::default()
            }
        }
    }

    pub fn save(&self, compiled: &CompiledIndex) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(compiled).context("failed to serialize index")?;
        let staged = self.path.with_extension("json.tmp");
        fs::write(&staged, raw)
            .with_context(|| format!("failed to write index file: {}", staged.display()))?;
        fs::rename(&staged, &self.path)
            .with_context(|| format!("failed to replace index file: {}", self.path.display()))
    }
}
