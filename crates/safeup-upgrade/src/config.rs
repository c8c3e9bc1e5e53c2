use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::UpgradeLayout;

pub const DEFAULT_IGNORED_DIRS: [&str; 6] = ["backup", "images", "logs", "tmp", "cache", "user"];
const DEFAULT_SNAPSHOT_LIMIT: usize = 3;
const DEFAULT_DECLARATION_FILE: &str = "composer.json";
const DEFAULT_SHARED_LIBRARY: &str = "psr/log";
const DEFAULT_DEPRECATED_API_PATTERN: &str =
    r"(?i)->add(?:Debug|Info|Notice|Warning|Error|Critical|Alert|Emergency)\s*\(";
const DEFAULT_DEPRECATED_API_LIBRARY: &str = "Monolog";
const DEFAULT_SOURCE_EXTENSIONS: [&str; 1] = ["php"];

/// Contents of `safeup.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeupConfig {
    #[serde(default = "config_file_version")]
    pub version: u32,
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub staging_root: Option<PathBuf>,
    #[serde(default)]
    pub manifest_store: Option<PathBuf>,
    #[serde(default)]
    pub snapshot_limit: Option<usize>,
    #[serde(default)]
    pub ignored_dirs: Option<Vec<String>>,
    #[serde(default)]
    pub current_version: Option<String>,
    #[serde(default)]
    pub runtime_version: Option<String>,
    #[serde(default)]
    pub registry_url: Option<String>,
    #[serde(default)]
    pub declaration_file: Option<String>,
    #[serde(default)]
    pub shared_library: Option<String>,
    /// Regex matched against plugin sources; an empty string disables the scan.
    #[serde(default)]
    pub deprecated_api_pattern: Option<String>,
    #[serde(default)]
    pub deprecated_api_library: Option<String>,
    #[serde(default)]
    pub source_extensions: Option<Vec<String>>,
}

impl Default for SafeupConfig {
    fn default() -> Self {
        Self {
            version: config_file_version(),
            root: None,
            staging_root: None,
            manifest_store: None,
            snapshot_limit: None,
            ignored_dirs: None,
            current_version: None,
            runtime_version: None,
            registry_url: None,
            declaration_file: None,
            shared_library: None,
            deprecated_api_pattern: None,
            deprecated_api_library: None,
            source_extensions: None,
        }
    }
}

/// Tunables consumed by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeOptions {
    pub current_version: Option<String>,
    pub runtime_version: String,
    pub ignored_dirs: Vec<String>,
    /// Number of manifests kept after pruning; 0 disables pruning.
    pub snapshot_limit: usize,
    pub declaration_file: String,
    pub shared_library: String,
    /// Empty disables the deprecated API scan.
    pub deprecated_api_pattern: String,
    pub deprecated_api_library: String,
    pub source_extensions: Vec<String>,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            current_version: None,
            runtime_version: "unknown".to_string(),
            ignored_dirs: DEFAULT_IGNORED_DIRS.iter().map(|dir| dir.to_string()).collect(),
            snapshot_limit: DEFAULT_SNAPSHOT_LIMIT,
            declaration_file: DEFAULT_DECLARATION_FILE.to_string(),
            shared_library: DEFAULT_SHARED_LIBRARY.to_string(),
            deprecated_api_pattern: DEFAULT_DEPRECATED_API_PATTERN.to_string(),
            deprecated_api_library: DEFAULT_DEPRECATED_API_LIBRARY.to_string(),
            source_extensions: DEFAULT_SOURCE_EXTENSIONS
                .iter()
                .map(|extension| extension.to_string())
                .collect(),
        }
    }
}

impl SafeupConfig {
    /// Layout for `root`; relative overrides are resolved against the root.
    pub fn layout(&self, root: &Path) -> Result<UpgradeLayout> {
        let root = self
            .root
            .as_deref()
            .map(|configured| resolve_against(root, configured))
            .unwrap_or_else(|| root.to_path_buf());
        let defaults = UpgradeLayout::for_root(&root)?;
        let staging_root = self
            .staging_root
            .as_deref()
            .map(|path| resolve_against(&root, path))
            .unwrap_or_else(|| defaults.staging_root().to_path_buf());
        let manifest_store = self
            .manifest_store
            .as_deref()
            .map(|path| resolve_against(&root, path))
            .unwrap_or_else(|| defaults.manifest_store().to_path_buf());
        Ok(UpgradeLayout::new(root, staging_root, manifest_store))
    }

    pub fn options(&self) -> UpgradeOptions {
        let defaults = UpgradeOptions::default();
        UpgradeOptions {
            current_version: self.current_version.clone(),
            runtime_version: self
                .runtime_version
                .clone()
                .unwrap_or(defaults.runtime_version),
            ignored_dirs: self.ignored_dirs.clone().unwrap_or(defaults.ignored_dirs),
            snapshot_limit: self.snapshot_limit.unwrap_or(defaults.snapshot_limit),
            declaration_file: self
                .declaration_file
                .clone()
                .unwrap_or(defaults.declaration_file),
            shared_library: self
                .shared_library
                .clone()
                .unwrap_or(defaults.shared_library),
            deprecated_api_pattern: self
                .deprecated_api_pattern
                .clone()
                .unwrap_or(defaults.deprecated_api_pattern),
            deprecated_api_library: self
                .deprecated_api_library
                .clone()
                .unwrap_or(defaults.deprecated_api_library),
            source_extensions: self
                .source_extensions
                .clone()
                .unwrap_or(defaults.source_extensions),
        }
    }
}

pub fn parse_config(content: &str) -> Result<SafeupConfig> {
    let config: SafeupConfig = toml::from_str(content).context("failed parsing safeup config")?;
    let expected = config_file_version();
    if config.version != expected {
        anyhow::bail!(
            "unsupported safeup config version {} (expected {}): update safeup.toml to version {}",
            config.version,
            expected,
            expected
        );
    }
    if let Some(ignored) = &config.ignored_dirs {
        if !ignored.iter().any(|dir| dir.trim_matches('/') == "user") {
            anyhow::bail!("ignored_dirs in safeup config must include 'user'");
        }
    }
    if let Some(pattern) = config.deprecated_api_pattern.as_deref() {
        if !pattern.is_empty() {
            Regex::new(pattern).with_context(|| {
                format!("invalid deprecated_api_pattern in safeup config: {pattern}")
            })?;
        }
    }
    Ok(config)
}

/// Reads `path`; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<SafeupConfig> {
    match fs::read_to_string(path) {
        Ok(raw) => parse_config(&raw)
            .with_context(|| format!("failed loading config file {}", path.display())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(SafeupConfig::default()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file {}", path.display()))
        }
    }
}

fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn config_file_version() -> u32 {
    1
}
