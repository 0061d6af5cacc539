//! Diff & Default Engine
//!
//! Builds primary write payloads from a desired local value and maps wire
//! responses back into the local shape.
//!
//! Rules for writes:
//! - read-only attributes are never sent, write-once attributes only on create
//! - on create, an absent or null attribute falls back to its declared default
//! - on update, an absent key means "not modified"; an explicit value is sent
//!   only if it differs from the prior; an explicit null resets to the
//!   default, or sends a wire `null` when the prior held a value
//!
//! Reads reconstruct declared defaults for fields the API leaves out, so
//! that `read(write(defaulted(d))) == defaulted(d)`.

use crate::diagnostics::Diagnostics;
use crate::error::{EngineError, Result};
use crate::schema::{
    expand, join_path, resolve, Attribute, AttributeKind, UnionSchema, WriteMode,
    DISCRIMINANT_FIELD,
};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Which primary write a payload is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Create,
    Update,
}

impl WriteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }
}

/// Build the wire payload for a primary create or update.
///
/// `excluded` names top-level attributes owned by sub-actions.
pub fn build_write_payload(
    attributes: &[Attribute],
    desired: &Value,
    prior: Option<&Value>,
    kind: WriteKind,
    excluded: &HashSet<&str>,
) -> Result<Map<String, Value>> {
    let desired = as_object(desired, "")?;
    let prior = prior.and_then(Value::as_object);
    let mut out = Map::new();
    write_object(attributes, desired, prior, kind, excluded, "", &mut out)?;
    Ok(out)
}

fn write_object(
    attributes: &[Attribute],
    desired: &Map<String, Value>,
    prior: Option<&Map<String, Value>>,
    kind: WriteKind,
    excluded: &HashSet<&str>,
    path: &str,
    out: &mut Map<String, Value>,
) -> Result<()> {
    for attr in attributes {
        if excluded.contains(attr.name.as_str()) {
            continue;
        }
        match attr.mode {
            WriteMode::ReadOnly => continue,
            WriteMode::WriteOnce if kind == WriteKind::Update => continue,
            _ => {}
        }

        let attr_path = join_path(path, &attr.name);
        let wanted = desired.get(&attr.name);
        let before = prior
            .and_then(|p| p.get(&attr.name))
            .filter(|v| !v.is_null());

        match kind {
            WriteKind::Create => {
                let value = match wanted {
                    Some(v) if !v.is_null() => v.clone(),
                    _ => match &attr.default {
                        Some(default) => default.clone(),
                        None => continue,
                    },
                };
                emit(attr, &value, None, kind, &attr_path, out)?;
            }
            WriteKind::Update => match wanted {
                None => continue,
                Some(Value::Null) => {
                    if let Some(default) = &attr.default {
                        if before != Some(default) {
                            emit(attr, default, None, kind, &attr_path, out)?;
                        }
                    } else if before.is_some() {
                        emit_null(attr, before, out);
                    }
                }
                Some(value) => {
                    let baseline = before.or(attr.default.as_ref());
                    if let Some(baseline) = baseline {
                        if values_equal(&attr.kind, value, baseline) {
                            continue;
                        }
                    }
                    emit(attr, value, before, kind, &attr_path, out)?;
                }
            },
        }
    }
    Ok(())
}

/// Emit one attribute's value under its wire key(s)
fn emit(
    attr: &Attribute,
    value: &Value,
    prior: Option<&Value>,
    kind: WriteKind,
    path: &str,
    out: &mut Map<String, Value>,
) -> Result<()> {
    match &attr.kind {
        AttributeKind::Union(union) => {
            let variant = write_union(union, attr.required, value, prior, kind, path)?;
            match (variant, union.inline) {
                (Some(fields), true) => out.extend(fields),
                (Some(fields), false) => {
                    out.insert(attr.wire_key().into_owned(), Value::Object(fields));
                }
                (None, false) => {
                    out.insert(attr.wire_key().into_owned(), Value::Null);
                }
                (None, true) => {}
            }
        }
        AttributeKind::Object { attributes } => {
            let desired = as_object(value, path)?;
            let mut nested = Map::new();
            match kind {
                // A PATCH replaces a complex property as a whole
                WriteKind::Update => write_whole(attributes, desired, path, &mut nested)?,
                WriteKind::Create => write_object(
                    attributes,
                    desired,
                    None,
                    kind,
                    &HashSet::new(),
                    path,
                    &mut nested,
                )?,
            }
            out.insert(attr.wire_key().into_owned(), Value::Object(nested));
        }
        other => {
            out.insert(attr.wire_key().into_owned(), value_to_wire(other, value, path)?);
        }
    }
    Ok(())
}

fn emit_null(attr: &Attribute, prior: Option<&Value>, out: &mut Map<String, Value>) {
    match (&attr.kind, prior) {
        // An inline union has no wire key of its own; null out the fields it set
        (AttributeKind::Union(union), Some(prior)) if union.inline => {
            if let Ok(Some(resolved)) = resolve(union, prior, false, "") {
                for field in &resolved.variant.attributes {
                    if field.mode != WriteMode::ReadOnly {
                        out.insert(field.wire_key().into_owned(), Value::Null);
                    }
                }
            }
        }
        _ => {
            out.insert(attr.wire_key().into_owned(), Value::Null);
        }
    }
}

/// Discriminant plus the resolved variant's fields
fn write_union(
    union: &UnionSchema,
    required: bool,
    value: &Value,
    prior: Option<&Value>,
    kind: WriteKind,
    path: &str,
) -> Result<Option<Map<String, Value>>> {
    let Some(resolved) = resolve(union, value, required, path)? else {
        return Ok(None);
    };

    // Only diff against the prior when it selected the same variant
    let prior_fields = prior
        .and_then(|p| resolve(union, p, false, path).ok().flatten())
        .filter(|p| p.variant.name == resolved.variant.name)
        .and_then(|p| p.value.as_object());

    let variant_path = join_path(path, &resolved.variant.name);
    let mut fields = Map::new();
    fields.insert(
        DISCRIMINANT_FIELD.to_string(),
        Value::String(resolved.variant.discriminant.clone()),
    );
    let desired = as_object(resolved.value, &variant_path)?;
    // Field-level diffs only make sense for inline fields of an unchanged variant
    let replace = kind == WriteKind::Update && (!union.inline || prior_fields.is_none());
    if replace {
        write_whole(&resolved.variant.attributes, desired, &variant_path, &mut fields)?;
    } else {
        write_object(
            &resolved.variant.attributes,
            desired,
            prior_fields,
            kind,
            &HashSet::new(),
            &variant_path,
            &mut fields,
        )?;
    }
    Ok(Some(fields))
}

/// Every writable field of a replaced complex value: set ones as given,
/// unset ones as their default or an explicit null
fn write_whole(
    attributes: &[Attribute],
    desired: &Map<String, Value>,
    path: &str,
    out: &mut Map<String, Value>,
) -> Result<()> {
    write_object(
        attributes,
        desired,
        None,
        WriteKind::Create,
        &HashSet::new(),
        path,
        out,
    )?;
    for attr in attributes {
        if attr.mode == WriteMode::ReadOnly || attr.inline_union().is_some() {
            continue;
        }
        out.entry(attr.wire_key().into_owned()).or_insert(Value::Null);
    }
    Ok(())
}

/// Convert a full local value of `kind` to its wire form.
///
/// Used for collection elements and sub-action bodies, where the value is
/// always sent whole.
pub fn value_to_wire(kind: &AttributeKind, value: &Value, path: &str) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match kind {
        AttributeKind::List { element } | AttributeKind::Set { element } => {
            let Some(items) = value.as_array() else {
                return Err(EngineError::validation(path, "expected a collection"));
            };
            items
                .iter()
                .enumerate()
                .map(|(i, item)| value_to_wire(element, item, &format!("{}[{}]", path, i)))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array)
        }
        AttributeKind::Object { attributes } => {
            let desired = as_object(value, path)?;
            let mut nested = Map::new();
            write_object(
                attributes,
                desired,
                None,
                WriteKind::Create,
                &HashSet::new(),
                path,
                &mut nested,
            )?;
            Ok(Value::Object(nested))
        }
        AttributeKind::Union(union) => {
            let fields = write_union(union, true, value, None, WriteKind::Create, path)?;
            Ok(fields.map(Value::Object).unwrap_or(Value::Null))
        }
        _ => Ok(value.clone()),
    }
}

/// Map a wire object back into the local shape.
///
/// Every declared attribute is present in the result. Polymorphic
/// collection elements with an unknown discriminant are dropped and
/// reported in `diags`; a direct union with an unknown discriminant fails.
pub fn map_from_wire(
    attributes: &[Attribute],
    wire: &Value,
    diags: &mut Diagnostics,
) -> Result<Value> {
    let wire = as_object(wire, "")?;
    read_object(attributes, wire, "", diags).map(Value::Object)
}

fn read_object(
    attributes: &[Attribute],
    wire: &Map<String, Value>,
    path: &str,
    diags: &mut Diagnostics,
) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for attr in attributes {
        let attr_path = join_path(path, &attr.name);
        let value = match attr.inline_union() {
            Some(union) => read_inline_union(union, wire, &attr_path, diags)?,
            None => match wire.get(attr.wire_key().as_ref()) {
                Some(v) if !v.is_null() => value_from_wire(&attr.kind, v, &attr_path, diags)?,
                _ => Value::Null,
            },
        };
        let value = match (&value, &attr.default) {
            (Value::Null, Some(default)) => default.clone(),
            _ => value,
        };
        out.insert(attr.name.clone(), value);
    }
    Ok(out)
}

fn read_inline_union(
    union: &UnionSchema,
    wire: &Map<String, Value>,
    path: &str,
    diags: &mut Diagnostics,
) -> Result<Value> {
    match wire.get(DISCRIMINANT_FIELD).and_then(Value::as_str) {
        Some(discriminant) => read_variant(union, discriminant, wire, path, diags),
        None => Ok(Value::Null),
    }
}

fn read_variant(
    union: &UnionSchema,
    discriminant: &str,
    wire: &Map<String, Value>,
    path: &str,
    diags: &mut Diagnostics,
) -> Result<Value> {
    let Some(variant) = union.by_discriminant(discriminant) else {
        return Err(EngineError::UnknownDiscriminant {
            path: path.to_string(),
            discriminant: discriminant.to_string(),
        });
    };
    let variant_path = join_path(path, &variant.name);
    let nested = read_object(&variant.attributes, wire, &variant_path, diags)?;
    expand(union, discriminant, Value::Object(nested), path)
}

fn value_from_wire(
    kind: &AttributeKind,
    value: &Value,
    path: &str,
    diags: &mut Diagnostics,
) -> Result<Value> {
    match kind {
        AttributeKind::Object { attributes } => {
            let wire = as_object(value, path)?;
            read_object(attributes, wire, path, diags).map(Value::Object)
        }
        AttributeKind::Union(union) => {
            let wire = as_object(value, path)?;
            let discriminant = wire
                .get(DISCRIMINANT_FIELD)
                .and_then(Value::as_str)
                .unwrap_or_default();
            read_variant(union, discriminant, wire, path, diags)
        }
        AttributeKind::List { element } | AttributeKind::Set { element } => {
            let Some(items) = value.as_array() else {
                return Err(EngineError::validation(path, "expected a collection"));
            };
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let item_path = format!("{}[{}]", path, i);
                match value_from_wire(element, item, &item_path, diags) {
                    Ok(v) => out.push(v),
                    Err(EngineError::UnknownDiscriminant { discriminant, .. }) => {
                        tracing::warn!("Skipping {} with unknown type {}", item_path, discriminant);
                        diags.warn_at(
                            item_path,
                            "skipped item with unrecognized derived type",
                            format!("'{}' is not a known derived type", discriminant),
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(Value::Array(out))
        }
        _ => Ok(value.clone()),
    }
}

/// Fill declared defaults into a local value
pub fn apply_defaults(attributes: &[Attribute], value: &Value) -> Value {
    let Some(map) = value.as_object() else {
        return value.clone();
    };
    let mut out = map.clone();
    for attr in attributes {
        let current = map.get(&attr.name).cloned().unwrap_or(Value::Null);
        let filled = match (&current, &attr.default) {
            (Value::Null, Some(default)) => default.clone(),
            (Value::Null, None) => {
                if map.contains_key(&attr.name) {
                    Value::Null
                } else {
                    continue;
                }
            }
            _ => defaults_in(&attr.kind, &current),
        };
        out.insert(attr.name.clone(), filled);
    }
    Value::Object(out)
}

fn defaults_in(kind: &AttributeKind, value: &Value) -> Value {
    match kind {
        AttributeKind::Object { attributes } => apply_defaults(attributes, value),
        AttributeKind::Union(union) => {
            let Some(map) = value.as_object() else {
                return value.clone();
            };
            let mut out = map.clone();
            for variant in &union.variants {
                if let Some(nested) = map.get(&variant.name).filter(|v| !v.is_null()) {
                    out.insert(
                        variant.name.clone(),
                        apply_defaults(&variant.attributes, nested),
                    );
                }
            }
            Value::Object(out)
        }
        AttributeKind::List { element } | AttributeKind::Set { element } => match value {
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| defaults_in(element, item)).collect())
            }
            other => other.clone(),
        },
        _ => value.clone(),
    }
}

/// Semantic equality: sets ignore order, absent equals null in objects,
/// numbers compare by value and read-only fields are ignored
pub fn values_equal(kind: &AttributeKind, a: &Value, b: &Value) -> bool {
    match (kind, a, b) {
        (AttributeKind::Set { element }, Value::Array(x), Value::Array(y)) => {
            if x.len() != y.len() {
                return false;
            }
            let mut unmatched: Vec<&Value> = y.iter().collect();
            x.iter().all(|item| {
                match unmatched.iter().position(|other| values_equal(element, item, other)) {
                    Some(pos) => {
                        unmatched.swap_remove(pos);
                        true
                    }
                    None => false,
                }
            })
        }
        (AttributeKind::List { element }, Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(element, l, r))
        }
        (AttributeKind::Object { attributes }, Value::Object(x), Value::Object(y)) => {
            attributes.iter().filter(|attr| attr.mode != WriteMode::ReadOnly).all(|attr| {
                let l = x.get(&attr.name).unwrap_or(&Value::Null);
                let r = y.get(&attr.name).unwrap_or(&Value::Null);
                values_equal(&attr.kind, l, r)
            })
        }
        (AttributeKind::Union(union), Value::Object(x), Value::Object(y)) => {
            union.variants.iter().all(|variant| {
                let l = x.get(&variant.name).unwrap_or(&Value::Null);
                let r = y.get(&variant.name).unwrap_or(&Value::Null);
                match (l, r) {
                    (Value::Object(lm), Value::Object(rm)) => variant
                        .attributes
                        .iter()
                        .filter(|attr| attr.mode != WriteMode::ReadOnly)
                        .all(|attr| {
                            let lv = lm.get(&attr.name).unwrap_or(&Value::Null);
                            let rv = rm.get(&attr.name).unwrap_or(&Value::Null);
                            values_equal(&attr.kind, lv, rv)
                        }),
                    _ => l == r,
                }
            })
        }
        (AttributeKind::Int | AttributeKind::Float, Value::Number(x), Value::Number(y)) => {
            x.as_f64() == y.as_f64()
        }
        _ => a == b,
    }
}

fn as_object<'a>(value: &'a Value, path: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| EngineError::validation(if path.is_empty() { "<root>" } else { path }, "expected an object"))
}
