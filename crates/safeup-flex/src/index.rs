//! Compiled index over a Flex storage and its incremental refresh.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::storage::fold_case;
use crate::{CompiledIndex, FlexStorage, IndexFile, StorageEntry};

/// Metadata kept per object. Storage stays authoritative; entries are a
/// cache of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: String,
    pub storage_key: String,
    pub storage_timestamp: u64,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flex_key: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl IndexEntry {
    fn from_storage(type_name: &str, entry: &StorageEntry) -> Self {
        Self {
            key: entry.storage_key.clone(),
            storage_key: entry.storage_key.clone(),
            storage_timestamp: entry.storage_timestamp,
            checksum: entry.checksum.clone(),
            email: None,
            flex_key: Some(format!("{type_name}.obj:{}", entry.storage_key)),
            extra: BTreeMap::new(),
        }
    }

    fn matches_storage(&self, entry: &StorageEntry) -> bool {
        self.storage_timestamp == entry.storage_timestamp && self.checksum == entry.checksum
    }
}

/// Derives per-object metadata from a freshly read row.
pub trait IndexMeta {
    fn update_object_meta(&self, entry: &mut IndexEntry, row: &Value, storage: &dyn FlexStorage);
}

/// Keeps the storage key, passed through the storage normalizer if any.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainMeta;

impl IndexMeta for PlainMeta {
    fn update_object_meta(&self, entry: &mut IndexEntry, _row: &Value, storage: &dyn FlexStorage) {
        if let Some(key) = storage.normalize_key(&entry.storage_key) {
            entry.key = key;
        }
    }
}

/// Account rows: the key is the username (numbers allowed) or the storage
/// key, case-folded; email is case-folded too.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserMeta;

impl IndexMeta for UserMeta {
    fn update_object_meta(&self, entry: &mut IndexEntry, row: &Value, storage: &dyn FlexStorage) {
        let username = match row.get("username") {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            Some(Value::Number(number)) => number.to_string(),
            _ => entry.key.clone(),
        };
        entry.key = storage
            .normalize_key(&username)
            .unwrap_or_else(|| fold_case(&username));
        entry.email = row
            .get("email")
            .and_then(Value::as_str)
            .filter(|email| !email.is_empty())
            .map(fold_case);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyField {
    StorageKey,
    FlexKey,
    Email,
}

/// In-memory index keyed by primary key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlexIndex {
    entries: BTreeMap<String, IndexEntry>,
}

impl FlexIndex {
    pub fn new(entries: BTreeMap<String, IndexEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn entries(&self) -> &BTreeMap<String, IndexEntry> {
        &self.entries
    }

    /// View keyed by an alternate field. Entries without the field are
    /// left out; on duplicates the first entry in primary-key order wins.
    pub fn with_key_field(&self, field: KeyField) -> FlexIndex {
        let mut view = BTreeMap::new();
        for entry in self.entries.values() {
            let alternate = match field {
                KeyField::StorageKey => Some(entry.storage_key.as_str()),
                KeyField::FlexKey => entry.flex_key.as_deref(),
                KeyField::Email => entry.email.as_deref(),
            };
            if let Some(alternate) = alternate {
                view.entry(alternate.to_string())
                    .or_insert_with(|| entry.clone());
            }
        }
        FlexIndex::new(view)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexChanges {
    pub total: usize,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl IndexChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn summary(&self, type_name: &str) -> String {
        format!(
            "Flex: {} index updated, {} objects ({} added, {} updated, {} removed).",
            capitalize(type_name),
            self.total,
            self.added.len(),
            self.updated.len(),
            self.removed.len()
        )
    }
}

pub trait ChangeSink {
    fn on_changes(&mut self, type_name: &str, changes: &IndexChanges);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingChangeSink;

impl ChangeSink for TracingChangeSink {
    fn on_changes(&mut self, type_name: &str, changes: &IndexChanges) {
        debug!("{}", changes.summary(type_name));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub type_name: String,
    /// Schema tag; a stored index with another tag is rebuilt in full.
    pub version: String,
    /// A stored index younger than this is returned without enumerating
    /// storage. 0 disables reuse.
    pub reuse_window_secs: u64,
}

/// Refreshes `index_file` against `storage` and returns the merged index.
///
/// Rows whose timestamp and checksum are unchanged are carried over
/// without being read again.
pub fn sync_index(
    storage: &dyn FlexStorage,
    index_file: &IndexFile,
    meta: &dyn IndexMeta,
    sink: &mut dyn ChangeSink,
    options: &SyncOptions,
    now: u64,
) -> Result<(FlexIndex, IndexChanges)> {
    let stored = index_file.load();
    let force = stored.version != options.version;
    if !force
        && stored.timestamp > 0
        && now < stored.timestamp.saturating_add(options.reuse_window_secs)
    {
        debug!(index = %index_file.path().display(), "reusing fresh index");
        let changes = IndexChanges {
            total: stored.index.len(),
            ..IndexChanges::default()
        };
        return Ok((FlexIndex::new(stored.index), changes));
    }

    let fresh = storage.load_entries()?;
    let previous: HashMap<&str, &IndexEntry> = stored
        .index
        .values()
        .map(|entry| (entry.storage_key.as_str(), entry))
        .collect();

    let mut changes = IndexChanges::default();
    let mut merged: BTreeMap<String, IndexEntry> = BTreeMap::new();
    for (storage_key, storage_entry) in &fresh {
        let known = previous.get(storage_key.as_str()).copied();
        let (entry, refreshed) = match known {
            Some(known) if !force && known.matches_storage(storage_entry) => (known.clone(), false),
            _ => {
                let mut entry = IndexEntry::from_storage(&options.type_name, storage_entry);
                let row = match storage.read_row(storage_key) {
                    Ok(row) => row.unwrap_or(Value::Null),
                    Err(err) => {
                        warn!(key = %storage_key, error = %format!("{err:#}"), "indexing unreadable row without metadata");
                        Value::Null
                    }
                };
                meta.update_object_meta(&mut entry, &row, storage);
                (entry, true)
            }
        };

        if let Some(existing) = merged.get(&entry.key) {
            warn!(
                key = %entry.key,
                kept = %existing.storage_key,
                skipped = %entry.storage_key,
                "duplicate index key"
            );
            continue;
        }
        if refreshed {
            if known.is_some() {
                changes.updated.push(entry.key.clone());
            } else {
                changes.added.push(entry.key.clone());
            }
        }
        merged.insert(entry.key.clone(), entry);
    }

    for entry in stored.index.values() {
        if !fresh.contains_key(&entry.storage_key) {
            changes.removed.push(entry.key.clone());
        }
    }
    changes.total = merged.len();

    let compiled = CompiledIndex {
        version: options.version.clone(),
        timestamp: now,
        index: merged,
    };
    index_file.save(&compiled)?;
    if !changes.is_empty() {
        sink.on_changes(&options.type_name, &changes);
    }
    Ok((FlexIndex::new(compiled.index), changes))
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
