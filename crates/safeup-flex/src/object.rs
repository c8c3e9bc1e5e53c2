use anyhow::Result;
use safeup_core::{def_nested, get_nested, has_nested, set_nested, unset_nested, DEFAULT_SEPARATOR};
use serde_json::{Map, Value};

/// A file-backed record with dynamic nested properties. Objects can be
/// built for keys that are not stored; `exists()` tells them apart.
#[derive(Debug, Clone, PartialEq)]
pub struct FlexObject {
    type_name: String,
    key: String,
    storage_key: Option<String>,
    timestamp: Option<u64>,
    data: Value,
    exists: bool,
}

impl FlexObject {
    /// An object that is not (yet) stored.
    pub fn new(type_name: &str, key: &str, data: Map<String, Value>) -> Self {
        Self {
            type_name: type_name.to_string(),
            key: key.to_string(),
            storage_key: None,
            timestamp: None,
            data: Value::Object(data),
            exists: false,
        }
    }

    pub(crate) fn stored(
        type_name: &str,
        key: &str,
        storage_key: &str,
        timestamp: u64,
        data: Value,
    ) -> Self {
        let data = match data {
            Value::Object(map) => Value::Object(map),
            _ => Value::Object(Map::new()),
        };
        Self {
            type_name: type_name.to_string(),
            key: key.to_string(),
            storage_key: Some(storage_key.to_string()),
            timestamp: Some(timestamp),
            data,
            exists: true,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn storage_key(&self) -> Option<&str> {
        self.storage_key.as_deref()
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn flex_key(&self) -> String {
        let key = self.storage_key.as_deref().unwrap_or(&self.key);
        format!("{}.obj:{key}", self.type_name)
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_nested(&self, path: &str) -> Option<&Value> {
        get_nested(&self.data, path, DEFAULT_SEPARATOR)
    }

    pub fn has_nested(&self, path: &str) -> bool {
        has_nested(&self.data, path, DEFAULT_SEPARATOR)
    }

    pub fn set_nested(&mut self, path: &str, value: Value) -> Result<()> {
        set_nested(&mut self.data, path, value, DEFAULT_SEPARATOR)
    }

    pub fn unset_nested(&mut self, path: &str) -> Result<Option<Value>> {
        unset_nested(&mut self.data, path, DEFAULT_SEPARATOR)
    }

    pub fn def_nested(&mut self, path: &str, default: Value) -> Result<()> {
        def_nested(&mut self.data, path, default, DEFAULT_SEPARATOR)
    }

    pub(crate) fn mark_stored(&mut self, storage_key: &str, timestamp: u64) {
        self.storage_key = Some(storage_key.to_string());
        self.timestamp = Some(timestamp);
        self.exists = true;
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.exists = false;
    }
}
