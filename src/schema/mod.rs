//! Attribute Schema Model
//!
//! Static description of a resource's fields. Schemas are built once,
//! either with the builder helpers below or by deserializing a YAML/JSON
//! resource declaration, and are never mutated afterwards.
//!
//! # Local vs. wire shape
//!
//! Values handed to the engine use *local* attribute names (snake_case).
//! Payloads sent to the API use *wire* names, which default to the
//! camelCase form of the local name. A derived-type union is represented
//! locally as an object with one key per variant, at most one of them
//! non-null:
//!
//! ```text
//! local: { "platform": { "windows": { "show_progress": true }, "ios": null } }
//! wire:  { "@odata.type": "#microsoft.graph.windowsX", "showProgress": true }   (inline)
//! ```

pub mod resolver;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;

pub use resolver::{expand, resolve, validate, Resolved};

/// Wire field carrying the derived-type discriminant
pub const DISCRIMINANT_FIELD: &str = "@odata.type";

/// How an attribute participates in writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Sent on create and update
    #[default]
    Mutable,
    /// Sent on create, stripped on update
    WriteOnce,
    /// Never sent
    ReadOnly,
}

/// Shape of an attribute's value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttributeKind {
    String,
    Bool,
    Int,
    Float,
    /// Opaque JSON passed through untouched
    Json,
    /// Ordered collection
    List { element: Box<AttributeKind> },
    /// Unordered collection, compared without regard to order
    Set { element: Box<AttributeKind> },
    /// Nested complex object
    Object { attributes: Vec<Attribute> },
    /// Derived-type union
    Union(UnionSchema),
}

impl AttributeKind {
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Self::String | Self::Bool | Self::Int | Self::Float | Self::Json
        )
    }

    /// Element kind for collections
    pub fn element(&self) -> Option<&AttributeKind> {
        match self {
            Self::List { element } | Self::Set { element } => Some(element),
            _ => None,
        }
    }
}

/// "Exactly one of" group of derived types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnionSchema {
    /// Variant fields and the discriminant live in the parent wire object
    #[serde(default)]
    pub inline: bool,
    pub variants: Vec<Variant>,
}

impl UnionSchema {
    pub fn new(variants: Vec<Variant>) -> Self {
        Self {
            inline: false,
            variants,
        }
    }

    pub fn inline(variants: Vec<Variant>) -> Self {
        Self {
            inline: true,
            variants,
        }
    }

    pub fn variant(&self, name: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.name == name)
    }

    /// Find the variant for a wire discriminant (leading `#` optional)
    pub fn by_discriminant(&self, discriminant: &str) -> Option<&Variant> {
        let wanted = discriminant.trim_start_matches('#');
        self.variants
            .iter()
            .find(|v| v.discriminant.trim_start_matches('#') == wanted)
    }
}

/// One derived type of a union
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub discriminant: String,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

impl Variant {
    pub fn new(name: &str, discriminant: &str, attributes: Vec<Attribute>) -> Self {
        Self {
            name: name.to_string(),
            discriminant: discriminant.to_string(),
            attributes,
        }
    }
}

/// One field of a resource or nested object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wire_name: Option<String>,
    #[serde(flatten)]
    pub kind: AttributeKind,
    #[serde(default)]
    pub mode: WriteMode,
    #[serde(default)]
    pub required: bool,
    /// Provider-side default applied when the field is not configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl Attribute {
    pub fn new(name: &str, kind: AttributeKind) -> Self {
        Self {
            name: name.to_string(),
            wire_name: None,
            kind,
            mode: WriteMode::Mutable,
            required: false,
            default: None,
        }
    }

    pub fn string(name: &str) -> Self {
        Self::new(name, AttributeKind::String)
    }

    pub fn bool(name: &str) -> Self {
        Self::new(name, AttributeKind::Bool)
    }

    pub fn int(name: &str) -> Self {
        Self::new(name, AttributeKind::Int)
    }

    pub fn float(name: &str) -> Self {
        Self::new(name, AttributeKind::Float)
    }

    pub fn list(name: &str, element: AttributeKind) -> Self {
        Self::new(
            name,
            AttributeKind::List {
                element: Box::new(element),
            },
        )
    }

    pub fn set(name: &str, element: AttributeKind) -> Self {
        Self::new(
            name,
            AttributeKind::Set {
                element: Box::new(element),
            },
        )
    }

    pub fn object(name: &str, attributes: Vec<Attribute>) -> Self {
        Self::new(name, AttributeKind::Object { attributes })
    }

    pub fn union(name: &str, union: UnionSchema) -> Self {
        Self::new(name, AttributeKind::Union(union))
    }

    pub fn wire(mut self, wire_name: &str) -> Self {
        self.wire_name = Some(wire_name.to_string());
        self
    }

    pub fn read_only(mut self) -> Self {
        self.mode = WriteMode::ReadOnly;
        self
    }

    pub fn write_once(mut self) -> Self {
        self.mode = WriteMode::WriteOnce;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Field name used in API payloads
    pub fn wire_key(&self) -> Cow<'_, str> {
        match &self.wire_name {
            Some(name) => Cow::Borrowed(name.as_str()),
            None => Cow::Owned(camel_case(&self.name)),
        }
    }

    /// The union schema if this attribute is an inline union
    pub fn inline_union(&self) -> Option<&UnionSchema> {
        match &self.kind {
            AttributeKind::Union(union) if union.inline => Some(union),
            _ => None,
        }
    }
}

/// Look up an attribute by local name
pub fn find_attribute<'a>(attributes: &'a [Attribute], name: &str) -> Option<&'a Attribute> {
    attributes.iter().find(|a| a.name == name)
}

/// Convert a snake_case local name to its camelCase wire form
pub fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Join an attribute path segment
pub(crate) fn join_path(parent: &str, segment: &str) -> String {
    if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", parent, segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_camel_case() {
        assert_eq!(camel_case("display_name"), "displayName");
        assert_eq!(camel_case("role_scope_tag_ids"), "roleScopeTagIds");
        assert_eq!(camel_case("id"), "id");
        assert_eq!(camel_case("_private"), "private");
    }

    #[test]
    fn test_wire_key_override() {
        let attr = Attribute::string("odata_type").wire("@odata.type");
        assert_eq!(attr.wire_key(), "@odata.type");
        assert_eq!(Attribute::int("priority").wire_key(), "priority");
    }

    #[test]
    fn test_by_discriminant_ignores_hash() {
        let union = UnionSchema::new(vec![Variant::new(
            "windows",
            "#microsoft.graph.windowsConfig",
            vec![],
        )]);
        assert!(union.by_discriminant("microsoft.graph.windowsConfig").is_some());
        assert!(union.by_discriminant("#microsoft.graph.windowsConfig").is_some());
        assert!(union.by_discriminant("#microsoft.graph.iosConfig").is_none());
    }

    #[test]
    fn test_attribute_deserializes_from_yaml() {
        let yaml = r##"
name: platform
type: union
inline: true
required: true
variants:
  - name: windows
    discriminant: "#microsoft.graph.windowsConfig"
    attributes:
      - name: show_progress
        type: bool
        default: false
      - name: tags
        type: set
        element:
          type: string
"##;
        let attr: Attribute = serde_yaml::from_str(yaml).unwrap();
        assert!(attr.required);
        let union = attr.inline_union().expect("inline union");
        let windows = union.variant("windows").unwrap();
        assert_eq!(windows.attributes[0].default, Some(json!(false)));
        assert!(matches!(
            windows.attributes[1].kind,
            AttributeKind::Set { .. }
        ));
    }
}
