//! Resource declarations
//!
//! A [`ResourceSpec`] is everything the engine needs to reconcile one kind
//! of remote entity: its attribute schema, where it lives, how it is read,
//! which secondary writes follow the primary one, and which hooks apply.
//! Specs are constructed once at startup (from Rust or from YAML/JSON
//! documents) and shared read-only afterwards.
//!
//! # Architecture
//!
//! - [`registry`] - Builds and caches the process-wide table of specs

pub mod registry;

use crate::engine::WriteKind;
use crate::error::{EngineError, Result};
use crate::hooks::{HookDecl, ResourceHooks};
use crate::schema::{find_attribute, Attribute, AttributeKind, UnionSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use registry::{Registry, RegistryBuilder};

fn default_id_attribute() -> String {
    "id".to_string()
}

fn default_true() -> bool {
    true
}

/// HTTP verbs used by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Patch,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

/// Out-of-band sub-resource fetched after the primary read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplementalRead {
    /// Local attribute the result is spliced under
    pub attribute: String,
    /// Path relative to the entity, e.g. `content` or `assignments`
    pub uri_suffix: String,
    /// Raw bytes, stored base64-encoded
    #[serde(default)]
    pub binary: bool,
    /// A 404 yields null instead of failing the read
    #[serde(default)]
    pub optional: bool,
}

/// Server-side query capabilities of a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSupport {
    #[serde(default = "default_true")]
    pub server_side: bool,
    #[serde(default = "default_true")]
    pub paging: bool,
    #[serde(default)]
    pub page_size: Option<u32>,
}

impl Default for FilterSupport {
    fn default() -> Self {
        Self {
            server_side: true,
            paging: true,
            page_size: None,
        }
    }
}

/// How entities of a resource are read
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadOptions {
    /// `$expand` directives
    #[serde(default)]
    pub expand: Vec<String>,
    /// `$select` fields
    #[serde(default)]
    pub select: Vec<String>,
    #[serde(default)]
    pub supplemental: Vec<SupplementalRead>,
    #[serde(default)]
    pub filter: FilterSupport,
}

/// Which primary write a sub-action follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionScope {
    Create,
    Update,
    #[default]
    Always,
}

impl ActionScope {
    pub fn applies(&self, kind: WriteKind) -> bool {
        match self {
            Self::Always => true,
            Self::Create => kind == WriteKind::Create,
            Self::Update => kind == WriteKind::Update,
        }
    }
}

/// How a sub-action turns attributes into calls
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SubActionKind {
    /// One call carrying all listed attributes
    #[default]
    AllInOne,
    /// One call per added, removed or changed collection item
    Individual {
        /// Local field identifying an item
        key: String,
        /// Collection the items reference; enables `$ref` management
        #[serde(default)]
        reference: Option<String>,
    },
    /// Follow the create POST with a PATCH of the listed attributes
    PostThenPatch,
}

/// A secondary write issued after the primary create or update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteSubAction {
    pub name: String,
    /// Local attribute names carried by this action
    pub attributes: Vec<String>,
    /// Path relative to the entity, e.g. `assign`
    #[serde(default)]
    pub uri_suffix: String,
    #[serde(default)]
    pub scope: ActionScope,
    #[serde(default)]
    pub method: HttpMethod,
    /// Body key when it differs from the attribute's wire name
    #[serde(default)]
    pub wire_name: Option<String>,
    /// Downgrade remote failures to warnings
    #[serde(default)]
    pub errors_as_warnings: bool,
    #[serde(default)]
    pub kind: SubActionKind,
}

impl WriteSubAction {
    pub fn all_in_one(name: &str, uri_suffix: &str, attributes: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
            uri_suffix: uri_suffix.to_string(),
            scope: ActionScope::Always,
            method: HttpMethod::Post,
            wire_name: None,
            errors_as_warnings: false,
            kind: SubActionKind::AllInOne,
        }
    }

    pub fn individual(name: &str, uri_suffix: &str, attribute: &str, key: &str) -> Self {
        Self {
            kind: SubActionKind::Individual {
                key: key.to_string(),
                reference: None,
            },
            ..Self::all_in_one(name, uri_suffix, &[attribute])
        }
    }

    pub fn post_then_patch(name: &str, attributes: &[&str]) -> Self {
        Self {
            method: HttpMethod::Patch,
            scope: ActionScope::Create,
            kind: SubActionKind::PostThenPatch,
            ..Self::all_in_one(name, "", attributes)
        }
    }

    pub fn scope(mut self, scope: ActionScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn wire_name(mut self, wire_name: &str) -> Self {
        self.wire_name = Some(wire_name.to_string());
        self
    }

    pub fn errors_as_warnings(mut self) -> Self {
        self.errors_as_warnings = true;
        self
    }

    /// Switch an individual action to OData `$ref` management
    pub fn references(mut self, collection: &str) -> Self {
        if let SubActionKind::Individual { reference, .. } = &mut self.kind {
            *reference = Some(collection.to_string());
        }
        self
    }
}

/// Serialization policy for racy resource types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializePolicy {
    /// Delay awaited after each write span before the lock is released
    pub settle_ms: u64,
}

impl SerializePolicy {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// How entities of a resource are written
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteOptions {
    #[serde(default)]
    pub sub_actions: Vec<WriteSubAction>,
    #[serde(default)]
    pub serialize: Option<SerializePolicy>,
}

impl WriteOptions {
    /// Attributes kept out of the primary payload for a write kind
    pub fn excluded_attributes(&self, kind: WriteKind) -> HashSet<&str> {
        self.sub_actions
            .iter()
            .filter(|action| match action.kind {
                SubActionKind::PostThenPatch => kind == WriteKind::Create,
                _ => true,
            })
            .flat_map(|action| action.attributes.iter().map(String::as_str))
            .collect()
    }
}

/// Hooks bound to a spec
#[derive(Clone)]
pub struct BoundHooks(pub Arc<dyn ResourceHooks>);

impl fmt::Debug for BoundHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoundHooks({})", self.0.name())
    }
}

/// Complete declaration of one resource type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
    /// Collection URI relative to the API root; `{attr}` placeholders are
    /// filled from the value for nested collections
    pub base_uri: String,
    #[serde(default = "default_id_attribute")]
    pub id_attribute: String,
    /// The entity lives at `base_uri` itself and always exists
    #[serde(default)]
    pub singleton: bool,
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub read: ReadOptions,
    #[serde(default)]
    pub write: WriteOptions,
    /// Hook declarations, bound when the registry is built
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookDecl>,
    #[serde(skip)]
    pub(crate) bound: Option<BoundHooks>,
}

impl ResourceSpec {
    pub fn new(name: &str, base_uri: &str) -> Self {
        Self {
            name: name.to_string(),
            base_uri: base_uri.to_string(),
            id_attribute: default_id_attribute(),
            singleton: false,
            attributes: Vec::new(),
            read: ReadOptions::default(),
            write: WriteOptions::default(),
            hooks: Vec::new(),
            bound: None,
        }
    }

    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    pub fn expand(mut self, expand: &str) -> Self {
        self.read.expand.push(expand.to_string());
        self
    }

    pub fn supplemental(mut self, read: SupplementalRead) -> Self {
        self.read.supplemental.push(read);
        self
    }

    pub fn filter_support(mut self, support: FilterSupport) -> Self {
        self.read.filter = support;
        self
    }

    pub fn sub_action(mut self, action: WriteSubAction) -> Self {
        self.write.sub_actions.push(action);
        self
    }

    pub fn serialize_writes(mut self, settle: Duration) -> Self {
        self.write.serialize = Some(SerializePolicy {
            settle_ms: settle.as_millis() as u64,
        });
        self
    }

    pub fn hook_decl(mut self, decl: HookDecl) -> Self {
        self.hooks.push(decl);
        self
    }

    /// Attach a hook implementation directly
    pub fn with_hooks(mut self, hooks: Arc<dyn ResourceHooks>) -> Self {
        self.bound = Some(BoundHooks(hooks));
        self
    }

    pub fn hooks(&self) -> Option<&dyn ResourceHooks> {
        self.bound.as_ref().map(|b| b.0.as_ref())
    }

    pub fn find(&self, name: &str) -> Option<&Attribute> {
        find_attribute(&self.attributes, name)
    }

    /// The first union attribute declared on the resource root
    pub fn root_union(&self) -> Option<(&Attribute, &UnionSchema)> {
        self.attributes.iter().find_map(|attr| match &attr.kind {
            AttributeKind::Union(union) => Some((attr, union)),
            _ => None,
        })
    }

    /// Attribute names used as `{attr}` placeholders in `base_uri`
    pub fn placeholders(&self) -> Vec<&str> {
        let mut names = Vec::new();
        let mut rest = self.base_uri.as_str();
        while let Some(start) = rest.find('{') {
            let Some(len) = rest[start..].find('}') else {
                break;
            };
            names.push(&rest[start + 1..start + len]);
            rest = &rest[start + len + 1..];
        }
        names
    }

    /// Copy placeholder values from `source` into `value` where missing
    pub fn carry_placeholders(&self, source: &Value, value: &mut Value) {
        let Some(map) = value.as_object_mut() else {
            return;
        };
        for name in self.placeholders() {
            let Some(v) = source.get(name).filter(|v| !v.is_null()) else {
                continue;
            };
            if map.get(name).map_or(true, Value::is_null) {
                map.insert(name.to_string(), v.clone());
            }
        }
    }

    /// Collection URI with `{attr}` placeholders filled from `value`
    pub fn collection_uri(&self, value: Option<&Value>) -> Result<String> {
        let mut uri = String::with_capacity(self.base_uri.len());
        let mut rest = self.base_uri.as_str();
        while let Some(start) = rest.find('{') {
            let Some(len) = rest[start..].find('}') else {
                break;
            };
            let name = &rest[start + 1..start + len];
            let field = value.and_then(|v| v.get(name));
            let segment = match field {
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => {
                    return Err(EngineError::validation(
                        name,
                        format!("required to address {}", self.name),
                    ))
                }
            };
            uri.push_str(&rest[..start]);
            uri.push_str(&urlencoding::encode(&segment));
            rest = &rest[start + len + 1..];
        }
        uri.push_str(rest);
        Ok(uri)
    }

    /// URI of one entity (the collection URI itself for singletons)
    pub fn entity_uri(&self, value: Option<&Value>, id: Option<&str>) -> Result<String> {
        let collection = self.collection_uri(value)?;
        if self.singleton {
            return Ok(collection);
        }
        match id {
            Some(id) if !id.is_empty() => Ok(format!(
                "{}/{}",
                collection.trim_end_matches('/'),
                urlencoding::encode(id)
            )),
            _ => Err(EngineError::validation(
                &self.id_attribute,
                format!("{} has no id", self.name),
            )),
        }
    }

    /// Read the id attribute from a local value
    pub fn id_of(&self, value: &Value) -> Option<String> {
        match value.get(&self.id_attribute)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Check internal consistency of the declaration
    pub fn check(&self) -> Result<()> {
        let invalid = |msg: String| Err(EngineError::Registry(format!("{}: {}", self.name, msg)));

        if !self.singleton && self.find(&self.id_attribute).is_none() {
            return invalid(format!("id attribute '{}' is not declared", self.id_attribute));
        }
        let mut names = HashSet::new();
        for attr in &self.attributes {
            if !names.insert(attr.name.as_str()) {
                return invalid(format!("attribute '{}' declared twice", attr.name));
            }
            if let AttributeKind::Union(union) = &attr.kind {
                let mut seen = HashSet::new();
                for variant in &union.variants {
                    if !seen.insert(variant.discriminant.trim_start_matches('#')) {
                        return invalid(format!(
                            "union '{}' repeats discriminant '{}'",
                            attr.name, variant.discriminant
                        ));
                    }
                }
            }
        }
        for action in &self.write.sub_actions {
            if action.attributes.is_empty() {
                return invalid(format!("sub-action '{}' carries no attributes", action.name));
            }
            if action.wire_name.is_some() && action.attributes.len() > 1 {
                return invalid(format!(
                    "sub-action '{}' renames more than one attribute",
                    action.name
                ));
            }
            for name in &action.attributes {
                if self.find(name).is_none() {
                    return invalid(format!(
                        "sub-action '{}' references unknown attribute '{}'",
                        action.name, name
                    ));
                }
            }
            if let SubActionKind::Individual { .. } = action.kind {
                let collection = action.attributes.len() == 1
                    && self
                        .find(&action.attributes[0])
                        .and_then(|a| a.kind.element())
                        .is_some();
                if !collection {
                    return invalid(format!(
                        "individual sub-action '{}' must carry exactly one collection",
                        action.name
                    ));
                }
            }
        }
        for read in &self.read.supplemental {
            if self.find(&read.attribute).is_none() {
                return invalid(format!(
                    "supplemental read references unknown attribute '{}'",
                    read.attribute
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn members() -> ResourceSpec {
        ResourceSpec::new("group_member", "/groups/{group_id}/members")
            .attribute(Attribute::string("id"))
            .attribute(Attribute::string("group_id"))
            .attribute(Attribute::set("owners", AttributeKind::String))
    }

    #[test]
    fn test_collection_uri_fills_placeholders() {
        let spec = members();
        let uri = spec
            .collection_uri(Some(&json!({"group_id": "a b"})))
            .unwrap();
        assert_eq!(uri, "/groups/a%20b/members");
        assert!(spec.collection_uri(None).is_err());
    }

    #[test]
    fn test_carry_placeholders() {
        let spec = members();
        assert_eq!(spec.placeholders(), vec!["group_id"]);
        let mut value = json!({"id": "u1", "group_id": null});
        spec.carry_placeholders(&json!({"group_id": "g"}), &mut value);
        assert_eq!(value, json!({"id": "u1", "group_id": "g"}));
    }

    #[test]
    fn test_entity_uri_for_singleton() {
        let spec = ResourceSpec::new("settings", "/deviceManagement/settings").singleton();
        assert_eq!(spec.entity_uri(None, None).unwrap(), "/deviceManagement/settings");
        let spec = members();
        assert_eq!(
            spec.entity_uri(Some(&json!({"group_id": "g"})), Some("u1"))
                .unwrap(),
            "/groups/g/members/u1"
        );
    }

    #[test]
    fn test_excluded_attributes_per_kind() {
        let opts = WriteOptions {
            sub_actions: vec![
                WriteSubAction::all_in_one("assign", "assign", &["assignments"]),
                WriteSubAction::post_then_patch("settings", &["settings"]),
            ],
            serialize: None,
        };
        let create = opts.excluded_attributes(WriteKind::Create);
        assert!(create.contains("assignments") && create.contains("settings"));
        let update = opts.excluded_attributes(WriteKind::Update);
        assert!(update.contains("assignments") && !update.contains("settings"));
    }

    #[test]
    fn test_check_rejects_bad_sub_action() {
        let spec = members().sub_action(WriteSubAction::individual("owners", "owners", "group_id", "id"));
        let err = spec.check().unwrap_err();
        assert!(err.to_string().contains("exactly one collection"));

        let spec = members().sub_action(WriteSubAction::all_in_one("x", "x", &["missing"]));
        assert!(spec.check().is_err());

        let spec = members().sub_action(WriteSubAction::individual("owners", "owners", "owners", "id"));
        assert!(spec.check().is_ok());
    }

    #[test]
    fn test_scope_applies() {
        assert!(ActionScope::Always.applies(WriteKind::Create));
        assert!(ActionScope::Create.applies(WriteKind::Create));
        assert!(!ActionScope::Create.applies(WriteKind::Update));
        assert!(!ActionScope::Update.applies(WriteKind::Create));
    }

    #[test]
    fn test_spec_deserializes_from_yaml() {
        let yaml = r#"
name: enrollment_configuration
base_uri: /deviceManagement/deviceEnrollmentConfigurations
attributes:
  - name: id
    type: string
    mode: read_only
  - name: display_name
    type: string
  - name: assignments
    type: list
    element:
      type: object
      attributes:
        - name: target
          type: json
read:
  expand: [assignments]
  filter:
    server_side: false
write:
  serialize:
    settle_ms: 500
  sub_actions:
    - name: assign
      attributes: [assignments]
      uri_suffix: assign
      errors_as_warnings: true
    - name: priority
      attributes: [display_name]
      uri_suffix: setPriority
      scope: update
      kind:
        mode: individual
        key: id
"#;
        let spec: ResourceSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.read.expand, vec!["assignments"]);
        assert!(!spec.read.filter.server_side);
        assert!(spec.read.filter.paging);
        assert_eq!(spec.write.serialize.unwrap().settle(), Duration::from_millis(500));
        assert!(spec.write.sub_actions[0].errors_as_warnings);
        assert_eq!(spec.write.sub_actions[0].method, HttpMethod::Post);
        assert_eq!(spec.write.sub_actions[1].scope, ActionScope::Update);
        assert!(matches!(
            spec.write.sub_actions[1].kind,
            SubActionKind::Individual { ref key, .. } if key == "id"
        ));
    }
}
