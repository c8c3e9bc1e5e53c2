use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use safeup_security::sha256_file_hex;
use serde_json::Value;

pub type KeyNormalizer = fn(&str) -> String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Yaml,
    Json,
}

impl DataFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Json => "json",
        }
    }

    pub fn parse(self, raw: &str) -> Result<Value> {
        match self {
            Self::Yaml => serde_yaml::from_str(raw).context("failed parsing YAML row"),
            Self::Json => serde_json::from_str(raw).context("failed parsing JSON row"),
        }
    }

    pub fn render(self, value: &Value) -> Result<String> {
        match self {
            Self::Yaml => serde_yaml::to_string(value).context("failed serializing YAML row"),
            Self::Json => serde_json::to_string_pretty(value)
                .map(|mut raw| {
                    raw.push('\n');
                    raw
                })
                .context("failed serializing JSON row"),
        }
    }
}

/// One row as seen by a storage enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub storage_key: String,
    pub storage_timestamp: u64,
    pub checksum: String,
}

/// Authoritative row storage for one Flex type.
pub trait FlexStorage {
    fn format(&self) -> DataFormat;

    /// File holding the row for `key`.
    fn storage_path(&self, key: &str) -> PathBuf;

    /// Every row currently stored, keyed by storage key.
    fn load_entries(&self) -> Result<BTreeMap<String, StorageEntry>>;

    /// Storage-specific key normalization. `None` means the storage has no
    /// opinion and callers fall back to their own rule.
    fn normalize_key(&self, key: &str) -> Option<String>;

    fn has_key(&self, key: &str) -> bool {
        is_valid_key(key) && self.storage_path(key).is_file()
    }

    fn read_row(&self, key: &str) -> Result<Option<Value>> {
        if !is_valid_key(key) {
            return Ok(None);
        }
        let path = self.storage_path(key);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read row file: {}", path.display()));
            }
        };
        let value = self
            .format()
            .parse(&raw)
            .with_context(|| format!("failed parsing row file: {}", path.display()))?;
        Ok(Some(value))
    }

    fn replace_row(&self, key: &str, row: &Value) -> Result<()> {
        ensure_valid_key(key)?;
        let path = self.storage_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = self.format().render(row)?;
        fs::write(&path, raw)
            .with_context(|| format!("failed to write row file: {}", path.display()))
    }

    /// Returns false when nothing was stored under `key`.
    fn delete_row(&self, key: &str) -> Result<bool> {
        if !self.has_key(key) {
            return Ok(false);
        }
        let path = self.storage_path(key);
        fs::remove_file(&path)
            .with_context(|| format!("failed to remove row file: {}", path.display()))?;
        Ok(true)
    }

    fn rename_row(&self, from: &str, to: &str) -> Result<bool> {
        ensure_valid_key(to)?;
        if !self.has_key(from) {
            return Ok(false);
        }
        if self.has_key(to) {
            anyhow::bail!("cannot rename row '{from}': '{to}' already exists");
        }
        let source = self.storage_path(from);
        let target = self.storage_path(to);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::rename(&source, &target).with_context(|| {
            format!(
                "failed renaming row {} to {}",
                source.display(),
                target.display()
            )
        })?;
        Ok(true)
    }
}

/// One file per row: `<folder>/<key>.<ext>`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    folder: PathBuf,
    format: DataFormat,
    normalizer: Option<KeyNormalizer>,
}

impl FileStorage {
    pub fn new(folder: impl Into<PathBuf>, format: DataFormat) -> Self {
        Self {
            folder: folder.into(),
            format,
            normalizer: None,
        }
    }

    pub fn case_insensitive(self) -> Self {
        self.with_key_normalizer(fold_case)
    }

    pub fn with_key_normalizer(mut self, normalizer: KeyNormalizer) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }
}

impl FlexStorage for FileStorage {
    fn format(&self) -> DataFormat {
        self.format
    }

    fn storage_path(&self, key: &str) -> PathBuf {
        self.folder
            .join(format!("{key}.{}", self.format.extension()))
    }

    fn load_entries(&self) -> Result<BTreeMap<String, StorageEntry>> {
        let mut entries = BTreeMap::new();
        let Some(dir) = read_dir_if_exists(&self.folder)? else {
            return Ok(entries);
        };
        for entry in dir {
            let entry = entry
                .with_context(|| format!("failed to iterate {}", self.folder.display()))?;
            let path = entry.path();
            if !path.is_file()
                || path.extension().and_then(|ext| ext.to_str()) != Some(self.format.extension())
            {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if !is_valid_key(key) {
                continue;
            }
            entries.insert(key.to_string(), describe_row(key, &path)?);
        }
        Ok(entries)
    }

    fn normalize_key(&self, key: &str) -> Option<String> {
        self.normalizer.map(|normalize| normalize(key))
    }
}

/// One folder per row: `<folder>/<key>/item.<ext>`.
#[derive(Debug, Clone)]
pub struct FolderStorage {
    folder: PathBuf,
    format: DataFormat,
    file_name: String,
    normalizer: Option<KeyNormalizer>,
}

impl FolderStorage {
    pub fn new(folder: impl Into<PathBuf>, format: DataFormat) -> Self {
        Self {
            folder: folder.into(),
            format,
            file_name: "item".to_string(),
            normalizer: None,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn case_insensitive(self) -> Self {
        self.with_key_normalizer(fold_case)
    }

    pub fn with_key_normalizer(mut self, normalizer: KeyNormalizer) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }
}

impl FlexStorage for FolderStorage {
    fn format(&self) -> DataFormat {
        self.format
    }

    fn storage_path(&self, key: &str) -> PathBuf {
        self.folder
            .join(key)
            .join(format!("{}.{}", self.file_name, self.format.extension()))
    }

    fn load_entries(&self) -> Result<BTreeMap<String, StorageEntry>> {
        let mut entries = BTreeMap::new();
        let Some(dir) = read_dir_if_exists(&self.folder)? else {
            return Ok(entries);
        };
        for entry in dir {
            let entry = entry
                .with_context(|| format!("failed to iterate {}", self.folder.display()))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(key) = name.to_str() else {
                continue;
            };
            let row = self.storage_path(key);
            if !is_valid_key(key) || !row.is_file() {
                continue;
            }
            entries.insert(key.to_string(), describe_row(key, &row)?);
        }
        Ok(entries)
    }

    fn normalize_key(&self, key: &str) -> Option<String> {
        self.normalizer.map(|normalize| normalize(key))
    }

    fn delete_row(&self, key: &str) -> Result<bool> {
        if !self.has_key(key) {
            return Ok(false);
        }
        let dir = self.folder.join(key);
        fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to remove row folder: {}", dir.display()))?;
        Ok(true)
    }

    fn rename_row(&self, from: &str, to: &str) -> Result<bool> {
        ensure_valid_key(to)?;
        if !self.has_key(from) {
            return Ok(false);
        }
        let source = self.folder.join(from);
        let target = self.folder.join(to);
        if target.exists() {
            anyhow::bail!("cannot rename row '{from}': '{to}' already exists");
        }
        fs::rename(&source, &target).with_context(|| {
            format!(
                "failed renaming row folder {} to {}",
                source.display(),
                target.display()
            )
        })?;
        Ok(true)
    }
}

pub(crate) fn fold_case(key: &str) -> String {
    key.to_lowercase()
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && !key.starts_with('.') && !key.contains(['/', '\\'])
}

fn ensure_valid_key(key: &str) -> Result<()> {
    if !is_valid_key(key) {
        anyhow::bail!("invalid storage key '{key}'");
    }
    Ok(())
}

fn read_dir_if_exists(dir: &Path) -> Result<Option<fs::ReadDir>> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(Some(entries)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read storage folder {}", dir.display()))
        }
    }
}

fn describe_row(key: &str, path: &Path) -> Result<StorageEntry> {
    let metadata =
        fs::metadata(path).with_context(|| format!("failed to stat row file: {}", path.display()))?;
    let storage_timestamp = metadata
        .modified()
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    Ok(StorageEntry {
        storage_key: key.to_string(),
        storage_timestamp,
        checksum: sha256_file_hex(path)?,
    })
}
