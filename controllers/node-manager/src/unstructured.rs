//! Typed reads of nested fields in untyped objects.
//!
//! Absent fields read as `None`; present fields of the wrong JSON type are
//! an [`ControllerError::InvalidObject`] naming the dotted path.

use crate::error::ControllerError;
use serde_json::{Map, Value};

/// Follows `path` through nested objects. `null` counts as absent.
pub fn nested<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(value, |current, key| current.get(key))
        .filter(|v| !v.is_null())
}

fn wrong_type(path: &[&str], expected: &str) -> ControllerError {
    ControllerError::InvalidObject(format!("{} is not {}", path.join("."), expected))
}

pub fn nested_str<'a>(value: &'a Value, path: &[&str]) -> Result<Option<&'a str>, ControllerError> {
    match nested(value, path) {
        None => Ok(None),
        Some(v) => v.as_str().map(Some).ok_or_else(|| wrong_type(path, "a string")),
    }
}

pub fn nested_i64(value: &Value, path: &[&str]) -> Result<Option<i64>, ControllerError> {
    match nested(value, path) {
        None => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or_else(|| wrong_type(path, "an integer")),
    }
}

pub fn nested_slice<'a>(value: &'a Value, path: &[&str]) -> Result<&'a [Value], ControllerError> {
    match nested(value, path) {
        None => Ok(&[]),
        Some(v) => v.as_array().map(Vec::as_slice).ok_or_else(|| wrong_type(path, "a list")),
    }
}

pub fn nested_map<'a>(value: &'a Value, path: &[&str]) -> Result<Option<&'a Map<String, Value>>, ControllerError> {
    match nested(value, path) {
        None => Ok(None),
        Some(v) => v.as_object().map(Some).ok_or_else(|| wrong_type(path, "an object")),
    }
}

/// Reads a string field, treating absence as the empty string.
pub fn str_or_empty<'a>(value: &'a Value, path: &[&str]) -> Result<&'a str, ControllerError> {
    Ok(nested_str(value, path)?.unwrap_or_default())
}
