use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Filesystem locations used by the orchestrator.
///
/// The staging root must live on the same filesystem as the live root and
/// outside of it, so the rename swap never moves the staging area itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeLayout {
    root: PathBuf,
    staging_root: PathBuf,
    manifest_store: PathBuf,
}

impl UpgradeLayout {
    pub fn new(
        root: impl Into<PathBuf>,
        staging_root: impl Into<PathBuf>,
        manifest_store: impl Into<PathBuf>,
    ) -> Self {
        Self {
            root: root.into(),
            staging_root: staging_root.into(),
            manifest_store: manifest_store.into(),
        }
    }

    /// Default layout: staging root `<parent>/.<name>-safeup`, manifests under
    /// `<root>/user/data/upgrades`.
    pub fn for_root(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let staging_root = default_staging_root(&root)?;
        let manifest_store = root.join("user").join("data").join("upgrades");
        Ok(Self::new(root, staging_root, manifest_store))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    pub fn manifest_store(&self) -> &Path {
        &self.manifest_store
    }

    pub fn stage_dir(&self, id: &str) -> PathBuf {
        self.staging_root.join(id)
    }

    pub fn package_dir(&self, id: &str) -> PathBuf {
        self.stage_dir(id).join("package")
    }

    pub fn stage_manifest_path(&self, id: &str) -> PathBuf {
        self.stage_dir(id).join("manifest.json")
    }

    pub fn backup_dir(&self, id: &str) -> PathBuf {
        self.staging_root.join(format!("snapshot-{id}"))
    }

    pub fn aside_dir(&self, id: &str, timestamp: u64) -> PathBuf {
        self.staging_root.join(format!("rollback-{id}-{timestamp}"))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.staging_root.join("operation.lock")
    }

    pub fn swap_marker_path(&self) -> PathBuf {
        self.staging_root.join("swap.json")
    }

    pub fn recovery_flag_path(&self) -> PathBuf {
        self.root.join("user").join("data").join("recovery.flag")
    }

    pub fn version_file_path(&self) -> PathBuf {
        self.root.join("VERSION")
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.root.join("user").join("plugins")
    }

    pub fn plugin_config_path(&self, slug: &str) -> PathBuf {
        self.root
            .join("user")
            .join("config")
            .join("plugins")
            .join(format!("{slug}.yaml"))
    }

    pub fn system_config_path(&self) -> PathBuf {
        self.root.join("user").join("config").join("system.yaml")
    }

    pub fn default_config_path(&self) -> PathBuf {
        self.root.join("user").join("config").join("safeup.toml")
    }

    /// True when `path` is located under the staging root.
    pub fn is_within_staging_root(&self, path: &Path) -> bool {
        path.starts_with(&self.staging_root)
    }
}

fn default_staging_root(root: &Path) -> Result<PathBuf> {
    let name = root
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("cannot derive staging root for {}", root.display()))?;
    let parent = root
        .parent()
        .with_context(|| format!("live root has no parent directory: {}", root.display()))?;
    Ok(parent.join(format!(".{name}-safeup")))
}
