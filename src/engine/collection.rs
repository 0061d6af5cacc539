//! Keyed collection diff
//!
//! Computes add/remove/update operations for collections the remote API
//! models as independently addressable items.

use super::payload::values_equal;
use crate::error::{EngineError, Result};
use crate::schema::AttributeKind;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Operations needed to turn the prior collection into the desired one
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionDiff {
    pub add: Vec<Value>,
    pub remove: Vec<Value>,
    pub update: Vec<Value>,
}

impl CollectionDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.update.is_empty()
    }
}

/// Read the comparison key of an item (strings and numbers are accepted)
pub fn item_key(item: &Value, key: &str, path: &str) -> Result<String> {
    let field = match item {
        Value::Object(map) => map.get(key),
        // Collections of plain ids use the value itself as key
        Value::String(_) | Value::Number(_) => Some(item),
        _ => None,
    };
    match field {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(EngineError::validation(
            path,
            format!("collection item has no '{}' key", key),
        )),
    }
}

/// Diff two collections by a stable per-item key.
///
/// Items present in both that are semantically equal under `element` are
/// left untouched.
pub fn diff_keyed(
    element: &AttributeKind,
    prior: &[Value],
    desired: &[Value],
    key: &str,
    path: &str,
) -> Result<CollectionDiff> {
    let mut before: HashMap<String, &Value> = HashMap::with_capacity(prior.len());
    for (i, item) in prior.iter().enumerate() {
        before.insert(item_key(item, key, &format!("{}[{}]", path, i))?, item);
    }

    let mut diff = CollectionDiff::default();
    let mut seen = HashSet::with_capacity(desired.len());
    for (i, item) in desired.iter().enumerate() {
        let item_path = format!("{}[{}]", path, i);
        let k = item_key(item, key, &item_path)?;
        if !seen.insert(k.clone()) {
            return Err(EngineError::validation(
                item_path,
                format!("duplicate '{}' value '{}'", key, k),
            ));
        }
        match before.get(&k) {
            None => diff.add.push(item.clone()),
            Some(old) if !values_equal(element, old, item) => diff.update.push(item.clone()),
            Some(_) => {}
        }
    }

    for item in prior {
        let k = item_key(item, key, path)?;
        if !seen.contains(&k) {
            diff.remove.push(item.clone());
        }
    }
    Ok(diff)
}
