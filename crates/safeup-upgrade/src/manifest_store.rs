use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use safeup_core::UpgradeManifest;
use tracing::{debug, info, warn};

use crate::Filesystem;

/// One pretty-printed JSON document per manifest, named `<id>.json`.
/// Ids are time-sortable, so lexical order of the file names is creation
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn persist(&self, manifest: &UpgradeManifest) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.manifest_path(&manifest.id);
        let mut raw = manifest.to_json_pretty()?;
        raw.push('\n');
        fs::write(&path, raw)
            .with_context(|| format!("failed to write manifest file: {}", path.display()))?;
        debug!(manifest = %path.display(), "manifest persisted");
        Ok(path)
    }

    pub fn load(&self, id: &str) -> Result<Option<UpgradeManifest>> {
        read_manifest_file(&self.manifest_path(id))
    }

    /// Manifest ids in ascending (oldest-first) order.
    pub fn ids(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read manifest store: {}", self.dir.display())
                });
            }
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry
                .with_context(|| format!("failed to iterate manifest store: {}", self.dir.display()))?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Parsable manifests, newest first. Unreadable documents are skipped.
    pub fn list(&self) -> Result<Vec<UpgradeManifest>> {
        let mut manifests = Vec::new();
        for id in self.ids()?.into_iter().rev() {
            match self.load(&id) {
                Ok(Some(manifest)) => manifests.push(manifest),
                Ok(None) => {}
                Err(err) => warn!(id = %id, error = %format!("{err:#}"), "skipping unreadable manifest"),
            }
        }
        Ok(manifests)
    }

    /// The manifest named `id`, or the most recent one when `id` is `None`.
    pub fn resolve(&self, id: Option<&str>) -> Result<Option<UpgradeManifest>> {
        match id {
            Some(id) => self.load(id),
            None => match self.ids()?.pop() {
                Some(latest) => self.load(&latest),
                None => Ok(None),
            },
        }
    }

    /// Stamps `rolled_back_at`; returns false when the manifest is absent.
    pub fn mark_rolled_back(&self, id: &str, at: u64) -> Result<bool> {
        let Some(mut manifest) = self.load(id)? else {
            return Ok(false);
        };
        manifest.rolled_back_at = Some(at);
        self.persist(&manifest)?;
        Ok(true)
    }

    /// Deletes the oldest manifests beyond `limit` together with their backup
    /// trees. Only backups under `staging_root` are removed. Returns the ids
    /// that were pruned.
    pub fn prune(
        &self,
        limit: usize,
        staging_root: &Path,
        filesystem: &dyn Filesystem,
    ) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ids = self.ids()?;
        if ids.len() <= limit {
            return Ok(Vec::new());
        }

        let excess = ids.len() - limit;
        let mut pruned = Vec::with_capacity(excess);
        for id in ids.into_iter().take(excess) {
            let backup = match self.load(&id) {
                Ok(manifest) => manifest.map(|manifest| manifest.backup_path),
                Err(err) => {
                    warn!(id = %id, error = %format!("{err:#}"), "pruning unreadable manifest");
                    None
                }
            };

            let path = self.manifest_path(&id);
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove manifest file: {}", path.display()))?;

            if let Some(backup) = backup {
                if backup.starts_with(staging_root) && filesystem.exists(&backup) {
                    filesystem.remove_tree(&backup)?;
                } else if filesystem.exists(&backup) {
                    warn!(id = %id, backup = %backup.display(), "keeping backup outside staging root");
                }
            }
            info!(id = %id, "pruned snapshot");
            pruned.push(id);
        }
        Ok(pruned)
    }
}

fn read_manifest_file(path: &Path) -> Result<Option<UpgradeManifest>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read manifest file: {}", path.display()));
        }
    };
    let manifest = UpgradeManifest::from_json_str(&raw)
        .with_context(|| format!("failed parsing manifest file: {}", path.display()))?;
    Ok(Some(manifest))
}

pub(crate) fn write_stage_manifest(path: &Path, manifest: &UpgradeManifest) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, manifest.to_json_pretty()?)
        .with_context(|| format!("failed to write stage manifest: {}", path.display()))
}

pub(crate) fn read_stage_manifest(path: &Path) -> Result<Option<UpgradeManifest>> {
    read_manifest_file(path)
}
