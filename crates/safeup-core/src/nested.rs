//! Dot-path access over a `serde_json::Value` tree.
//!
//! Objects are walked by key and arrays by numeric index. Setting a path
//! creates intermediate objects where the tree holds `null` or nothing, and
//! refuses to descend through scalars.

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};

pub const DEFAULT_SEPARATOR: char = '.';

pub fn get_nested<'a>(value: &'a Value, path: &str, separator: char) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split(separator) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

pub fn has_nested(value: &Value, path: &str, separator: char) -> bool {
    get_nested(value, path, separator).is_some()
}

pub fn set_nested(value: &mut Value, path: &str, new_value: Value, separator: char) -> Result<()> {
    let segments: Vec<&str> = path.split(separator).collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(anyhow!("nested property path must not be empty"));
    };

    let mut current = value;
    for segment in parents {
        current = descend_or_create(current, segment)
            .ok_or_else(|| anyhow!("cannot set nested property {path} on non-object value"))?;
    }

    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => {
            map.insert((*last).to_string(), new_value);
            Ok(())
        }
        Value::Array(items) => {
            let index = last
                .parse::<usize>()
                .ok()
                .filter(|index| *index < items.len())
                .ok_or_else(|| anyhow!("cannot set nested property {path}: index out of range"))?;
            items[index] = new_value;
            Ok(())
        }
        _ => Err(anyhow!(
            "cannot set nested property {path} on non-object value"
        )),
    }
}

/// Removes the value at `path`, returning it. Missing intermediate nodes are
/// not an error.
pub fn unset_nested(value: &mut Value, path: &str, separator: char) -> Result<Option<Value>> {
    let segments: Vec<&str> = path.split(separator).collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(anyhow!("nested property path must not be empty"));
    };

    let mut current = value;
    for segment in parents {
        current = match current {
            Value::Null => return Ok(None),
            Value::Object(map) => match map.get_mut(*segment) {
                Some(next) => next,
                None => return Ok(None),
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(next) => next,
                None => return Ok(None),
            },
            _ => {
                return Err(anyhow!(
                    "cannot unset nested property {path} on non-object value"
                ))
            }
        };
    }

    match current {
        Value::Object(map) => Ok(map.remove(*last)),
        Value::Null => Ok(None),
        Value::Array(items) => match last.parse::<usize>() {
            Ok(index) if index < items.len() => Ok(Some(items.remove(index))),
            _ => Ok(None),
        },
        _ => Err(anyhow!(
            "cannot unset nested property {path} on non-object value"
        )),
    }
}

/// Sets `path` to `default` only when nothing is stored there yet.
pub fn def_nested(value: &mut Value, path: &str, default: Value, separator: char) -> Result<()> {
    if has_nested(value, path, separator) {
        return Ok(());
    }
    set_nested(value, path, default, separator)
}

fn descend_or_create<'a>(current: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => Some(
            map.entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
        ),
        Value::Array(items) => {
            let index = segment.parse::<usize>().ok()?;
            items.get_mut(index)
        }
        _ => None,
    }
}
