//! Derived-Type Resolver
//!
//! Pure functions mapping a local union value to the single populated
//! variant (and back from a wire discriminant). The "at most one variant"
//! rule is checked here once; everything downstream works with a
//! [`Resolved`] instead of N nullable branches.

use super::{join_path, Attribute, AttributeKind, UnionSchema, Variant};
use crate::error::{EngineError, Result};
use serde_json::{Map, Value};

/// The populated variant of a union value
#[derive(Debug, Clone, Copy)]
pub struct Resolved<'a> {
    pub variant: &'a Variant,
    /// The variant's nested local value
    pub value: &'a Value,
}

impl Resolved<'_> {
    pub fn discriminant(&self) -> &str {
        &self.variant.discriminant
    }
}

/// Determine which variant of `union` is populated in `value`.
///
/// Returns `Ok(None)` when nothing is selected and the union is optional.
pub fn resolve<'a>(
    union: &'a UnionSchema,
    value: &'a Value,
    required: bool,
    path: &str,
) -> Result<Option<Resolved<'a>>> {
    let map = match value {
        Value::Null => return none_selected(required, path),
        Value::Object(map) => map,
        _ => {
            return Err(EngineError::validation(
                path,
                "derived type must be an object keyed by variant name",
            ))
        }
    };

    let mut selected: Vec<Resolved<'a>> = Vec::new();
    for (key, nested) in map {
        let Some(variant) = union.variant(key) else {
            return Err(EngineError::validation(
                join_path(path, key),
                "unknown derived type",
            ));
        };
        if !nested.is_null() {
            selected.push(Resolved {
                variant,
                value: nested,
            });
        }
    }

    match selected.len() {
        0 => none_selected(required, path),
        1 => Ok(selected.pop()),
        _ => Err(EngineError::AmbiguousVariant {
            path: path.to_string(),
            variants: selected.iter().map(|r| r.variant.name.clone()).collect(),
        }),
    }
}

fn none_selected<'a>(required: bool, path: &str) -> Result<Option<Resolved<'a>>> {
    if required {
        Err(EngineError::NoVariantSelected {
            path: path.to_string(),
        })
    } else {
        Ok(None)
    }
}

/// Build a local union value with exactly the branch named by
/// `discriminant` populated.
pub fn expand(union: &UnionSchema, discriminant: &str, nested: Value, path: &str) -> Result<Value> {
    let Some(selected) = union.by_discriminant(discriminant) else {
        return Err(EngineError::UnknownDiscriminant {
            path: path.to_string(),
            discriminant: discriminant.to_string(),
        });
    };

    let mut out = Map::new();
    let mut nested = Some(nested);
    for variant in &union.variants {
        let value = if variant.name == selected.name {
            nested.take().unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        out.insert(variant.name.clone(), value);
    }
    Ok(Value::Object(out))
}

/// Check every union in a desired value before anything is sent.
///
/// Reports the first violation with its full attribute path.
pub fn validate(attributes: &[Attribute], value: &Value) -> Result<()> {
    validate_object(attributes, value, "")
}

fn validate_object(attributes: &[Attribute], value: &Value, path: &str) -> Result<()> {
    let map = match value {
        Value::Object(map) => map,
        Value::Null => return Ok(()),
        _ => return Err(EngineError::validation(path, "expected an object")),
    };

    for attr in attributes {
        let attr_path = join_path(path, &attr.name);
        match map.get(&attr.name) {
            Some(v) if !v.is_null() => validate_value(&attr.kind, attr.required, v, &attr_path)?,
            _ => {
                if attr.required && matches!(attr.kind, AttributeKind::Union(_)) {
                    return Err(EngineError::NoVariantSelected { path: attr_path });
                }
            }
        }
    }
    Ok(())
}

fn validate_value(kind: &AttributeKind, required: bool, value: &Value, path: &str) -> Result<()> {
    match kind {
        AttributeKind::Object { attributes } => validate_object(attributes, value, path),
        AttributeKind::Union(union) => {
            if let Some(resolved) = resolve(union, value, required, path)? {
                let variant_path = join_path(path, &resolved.variant.name);
                validate_object(&resolved.variant.attributes, resolved.value, &variant_path)?;
            }
            Ok(())
        }
        AttributeKind::List { element } | AttributeKind::Set { element } => {
            let Some(items) = value.as_array() else {
                return Err(EngineError::validation(path, "expected a collection"));
            };
            if element.is_scalar() {
                return Ok(());
            }
            for (i, item) in items.iter().enumerate() {
                // Collection elements that are unions must always select one variant
                validate_value(element, true, item, &format!("{}[{}]", path, i))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
