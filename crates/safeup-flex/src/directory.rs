use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::debug;

use crate::storage::fold_case;
use crate::{
    sync_index, ChangeSink, FlexIndex, FlexObject, FlexStorage, IndexChanges, IndexFile,
    IndexMeta, KeyField, SyncOptions, TracingChangeSink, UserMeta,
};

pub const USER_INDEX_VERSION: &str = "1.1";
const USER_TYPE: &str = "user";
const DEFAULT_REUSE_WINDOW_SECS: u64 = 2;

/// Field consulted by [`UserDirectory::find`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupField {
    Key,
    StorageKey,
    FlexKey,
    Email,
    Username,
    Other(String),
}

impl FromStr for LookupField {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let field = value.trim();
        if field.is_empty() {
            anyhow::bail!("lookup field must not be empty");
        }
        Ok(match field {
            "key" => Self::Key,
            "storage_key" => Self::StorageKey,
            "flex_key" => Self::FlexKey,
            "email" => Self::Email,
            "username" => Self::Username,
            other => Self::Other(other.to_string()),
        })
    }
}

impl fmt::Display for LookupField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key => f.write_str("key"),
            Self::StorageKey => f.write_str("storage_key"),
            Self::FlexKey => f.write_str("flex_key"),
            Self::Email => f.write_str("email"),
            Self::Username => f.write_str("username"),
            Self::Other(field) => f.write_str(field),
        }
    }
}

/// User accounts: index plus object cache over one storage. Lookups never
/// fail for unknown keys; they hand back a non-existing object instead.
pub struct UserDirectory {
    storage: Box<dyn FlexStorage>,
    index_file: IndexFile,
    meta: Box<dyn IndexMeta>,
    sink: Box<dyn ChangeSink>,
    options: SyncOptions,
    index: Option<FlexIndex>,
    objects: HashMap<String, FlexObject>,
    last_changes: Option<IndexChanges>,
}

impl UserDirectory {
    pub fn new(storage: Box<dyn FlexStorage>, index_file: IndexFile) -> Self {
        Self {
            storage,
            index_file,
            meta: Box::new(UserMeta),
            sink: Box::new(TracingChangeSink),
            options: SyncOptions {
                type_name: USER_TYPE.to_string(),
                version: USER_INDEX_VERSION.to_string(),
                reuse_window_secs: DEFAULT_REUSE_WINDOW_SECS,
            },
            index: None,
            objects: HashMap::new(),
            last_changes: None,
        }
    }

    pub fn with_change_sink(mut self, sink: Box<dyn ChangeSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_meta(mut self, meta: Box<dyn IndexMeta>) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_reuse_window(mut self, seconds: u64) -> Self {
        self.options.reuse_window_secs = seconds;
        self
    }

    pub fn storage(&self) -> &dyn FlexStorage {
        self.storage.as_ref()
    }

    /// Changes found by the most recent index refresh on this instance.
    pub fn last_changes(&self) -> Option<&IndexChanges> {
        self.last_changes.as_ref()
    }

    /// The in-memory index, built on first access.
    pub fn index(&mut self) -> Result<&FlexIndex> {
        if self.index.is_none() {
            self.refresh()?;
        }
        self.index
            .as_ref()
            .context("flex index missing after refresh")
    }

    /// Drops the in-memory index and every cached object.
    pub fn invalidate(&mut self) {
        self.index = None;
        self.objects.clear();
    }

    /// Rebuilds the index against storage, bypassing the reuse window.
    pub fn reindex(&mut self) -> Result<IndexChanges> {
        self.invalidate();
        self.refresh_with_window(0)?;
        Ok(self.last_changes.clone().unwrap_or_default())
    }

    fn refresh(&mut self) -> Result<()> {
        self.refresh_with_window(self.options.reuse_window_secs)
    }

    fn refresh_with_window(&mut self, window: u64) -> Result<()> {
        let options = SyncOptions {
            reuse_window_secs: window,
            ..self.options.clone()
        };
        let (index, changes) = sync_index(
            self.storage.as_ref(),
            &self.index_file,
            self.meta.as_ref(),
            self.sink.as_mut(),
            &options,
            now_unix(),
        )?;
        self.index = Some(index);
        self.last_changes = Some(changes);
        Ok(())
    }

    /// Storage normalizer first, plain case folding otherwise.
    pub fn normalize_key(&self, key: &str) -> String {
        self.storage
            .normalize_key(key)
            .unwrap_or_else(|| fold_case(key))
    }

    /// Stored object for an already-normalized primary key.
    pub fn get(&mut self, key: &str) -> Result<Option<FlexObject>> {
        if let Some(object) = self.objects.get(key) {
            return Ok(Some(object.clone()));
        }
        let Some(entry) = self.index()?.get(key).cloned() else {
            return Ok(None);
        };
        let Some(row) = self.storage.read_row(&entry.storage_key)? else {
            debug!(key, storage_key = %entry.storage_key, "indexed row vanished from storage");
            return Ok(None);
        };
        let object = FlexObject::stored(
            USER_TYPE,
            &entry.key,
            &entry.storage_key,
            entry.storage_timestamp,
            row,
        );
        self.objects.insert(entry.key.clone(), object.clone());
        Ok(Some(object))
    }

    /// Always returns an object; a missing account comes back with
    /// `exists() == false`, the requested username and state `enabled`.
    pub fn load(&mut self, username: &str) -> Result<FlexObject> {
        let key = if username.is_empty() {
            String::new()
        } else {
            let key = self.normalize_key(username);
            if let Some(object) = self.get(&key)? {
                return Ok(object);
            }
            key
        };

        let mut data = Map::new();
        data.insert("username".to_string(), Value::String(username.to_string()));
        data.insert("state".to_string(), Value::String("enabled".to_string()));
        Ok(FlexObject::new(USER_TYPE, &key, data))
    }

    /// First match over `fields`, in the given order; `load("")` when
    /// nothing matches.
    pub fn find(&mut self, query: &str, fields: &[LookupField]) -> Result<FlexObject> {
        if !query.is_empty() {
            for field in fields {
                if let Some(object) = self.find_by(query, field)? {
                    return Ok(object);
                }
            }
        }
        self.load("")
    }

    fn find_by(&mut self, query: &str, field: &LookupField) -> Result<Option<FlexObject>> {
        let key = match field {
            LookupField::Key => Some(query.to_string()),
            LookupField::Username => Some(self.normalize_key(query)),
            LookupField::StorageKey => self.alternate_key(KeyField::StorageKey, query)?,
            LookupField::FlexKey => self.alternate_key(KeyField::FlexKey, query)?,
            LookupField::Email => self.alternate_key(KeyField::Email, &fold_case(query))?,
            LookupField::Other(name) => return self.scan_property(name, query),
        };
        match key {
            Some(key) => self.get(&key),
            None => Ok(None),
        }
    }

    fn alternate_key(&mut self, field: KeyField, value: &str) -> Result<Option<String>> {
        Ok(self
            .index()?
            .with_key_field(field)
            .get(value)
            .map(|entry| entry.key.clone()))
    }

    /// Case-folded comparison of a (possibly nested) property across all
    /// objects, in key order.
    fn scan_property(&mut self, name: &str, query: &str) -> Result<Option<FlexObject>> {
        let wanted = fold_case(query);
        let keys: Vec<String> = self.index()?.keys().cloned().collect();
        for key in keys {
            let Some(object) = self.get(&key)? else {
                continue;
            };
            let matches = match object.get_nested(name) {
                Some(Value::String(value)) => fold_case(value) == wanted,
                Some(Value::Number(value)) => value.to_string() == wanted,
                _ => false,
            };
            if matches {
                return Ok(Some(object));
            }
        }
        Ok(None)
    }

    /// Removes a stored account. Returns false, without side effects, when
    /// the account does not exist.
    pub fn delete(&mut self, username: &str) -> Result<bool> {
        let object = self.load(username)?;
        if !object.exists() {
            return Ok(false);
        }
        let storage_key = object.storage_key().unwrap_or(object.key()).to_string();
        let deleted = self.storage.delete_row(&storage_key)?;
        self.reindex()?;
        Ok(deleted)
    }

    /// Writes `object` under its storage key (the normalized key for new
    /// objects) and marks it as existing.
    pub fn save(&mut self, object: &mut FlexObject) -> Result<()> {
        let storage_key = match object.storage_key() {
            Some(storage_key) => storage_key.to_string(),
            None => {
                let key = if object.key().is_empty() {
                    object
                        .get_str("username")
                        .map(|username| self.normalize_key(username))
                        .unwrap_or_default()
                } else {
                    object.key().to_string()
                };
                if key.is_empty() {
                    anyhow::bail!("cannot save {} object without a key", object.type_name());
                }
                key
            }
        };
        self.storage.replace_row(&storage_key, object.data())?;
        object.mark_stored(&storage_key, now_unix());
        self.reindex()?;
        Ok(())
    }

    /// Deletes `object` from storage and flags it as no longer existing.
    pub fn remove(&mut self, object: &mut FlexObject) -> Result<bool> {
        let Some(storage_key) = object.storage_key().map(str::to_string) else {
            return Ok(false);
        };
        let deleted = self.storage.delete_row(&storage_key)?;
        object.mark_deleted();
        self.reindex()?;
        Ok(deleted)
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
