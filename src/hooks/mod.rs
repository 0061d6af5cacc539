//! Resource hooks
//!
//! Per-resource business rules the generic engine cannot express
//! structurally. A resource carries at most one [`ResourceHooks`]
//! implementation (several can be composed with [`HookChain`]); the engine
//! invokes it at fixed points of the pipeline:
//!
//! ```text
//! create/update: outbound -> modify_create (create only) -> diff -> write -> sub-actions -> read-back -> inbound
//! read:          read assembly -> inbound -> wire-to-local mapping
//! delete:        modify_delete (may skip) -> DELETE
//! ```
//!
//! # Module Structure
//!
//! - [`default_entity`] - Convention-based default/singleton entities
//! - [`variant_write_once`] - Fields immutable for one derived type only

pub mod default_entity;
pub mod variant_write_once;

use crate::engine::Filter;
use crate::error::{EngineError, Result};
use crate::resource::ResourceSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub use default_entity::{DefaultEntityConfig, DefaultEntityHooks};
pub use variant_write_once::VariantWriteOnce;

/// CRUD operation a hook is invoked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    List,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::List => "list",
        }
    }
}

/// Read-only view of the operation handed to hooks
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub spec: &'a ResourceSpec,
    pub operation: Operation,
    /// Desired value as supplied by the caller
    pub planned: Option<&'a Value>,
    /// Prior state (update/delete)
    pub prior: Option<&'a Value>,
    /// Resolved entity id, if known
    pub id: Option<&'a str>,
}

/// Outcome of a create modify hook
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateModification {
    /// Update the existing entity instead of creating one
    pub redirect_to_update: bool,
    /// Identity of the entity to update
    pub override_id: Option<String>,
}

impl CreateModification {
    pub fn redirect(id: impl Into<String>) -> Self {
        Self {
            redirect_to_update: true,
            override_id: Some(id.into()),
        }
    }
}

/// Outcome of a delete modify hook
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteModification {
    /// Treat the delete as a successful no-op
    pub skip: bool,
}

/// Filtered listing of the resource being written, used for identity
/// discovery. Items are returned in wire shape.
#[async_trait]
pub trait EntityLookup: Send + Sync {
    async fn find(&self, filter: &Filter) -> Result<Vec<Value>>;
}

/// Strategy interface for resource-specific behavior.
///
/// Middleware receives the desired value in local attribute names
/// (`outbound`) or the raw wire response (`inbound`). Every method has a
/// pass-through default.
#[async_trait]
pub trait ResourceHooks: Send + Sync {
    fn name(&self) -> &str;

    fn outbound(&self, _ctx: &HookContext<'_>, raw: Value) -> Result<Value> {
        Ok(raw)
    }

    fn inbound(&self, _ctx: &HookContext<'_>, raw: Value) -> Result<Value> {
        Ok(raw)
    }

    async fn modify_create(
        &self,
        _ctx: &HookContext<'_>,
        _lookup: &dyn EntityLookup,
    ) -> Result<CreateModification> {
        Ok(CreateModification::default())
    }

    fn modify_delete(&self, _ctx: &HookContext<'_>) -> Result<DeleteModification> {
        Ok(DeleteModification::default())
    }
}

/// Several hooks applied as one: outbound in declared order, inbound in
/// reverse, the first redirecting create modification wins, and any skip
/// skips the delete.
pub struct HookChain {
    name: String,
    hooks: Vec<Arc<dyn ResourceHooks>>,
}

impl HookChain {
    pub fn new(hooks: Vec<Arc<dyn ResourceHooks>>) -> Self {
        let name = hooks
            .iter()
            .map(|h| h.name())
            .collect::<Vec<_>>()
            .join("+");
        Self { name, hooks }
    }
}

#[async_trait]
impl ResourceHooks for HookChain {
    fn name(&self) -> &str {
        &self.name
    }

    fn outbound(&self, ctx: &HookContext<'_>, raw: Value) -> Result<Value> {
        self.hooks.iter().try_fold(raw, |raw, h| h.outbound(ctx, raw))
    }

    fn inbound(&self, ctx: &HookContext<'_>, raw: Value) -> Result<Value> {
        self.hooks.iter().rev().try_fold(raw, |raw, h| h.inbound(ctx, raw))
    }

    async fn modify_create(
        &self,
        ctx: &HookContext<'_>,
        lookup: &dyn EntityLookup,
    ) -> Result<CreateModification> {
        for hook in &self.hooks {
            let modification = hook.modify_create(ctx, lookup).await?;
            if modification.redirect_to_update {
                return Ok(modification);
            }
        }
        Ok(CreateModification::default())
    }

    fn modify_delete(&self, ctx: &HookContext<'_>) -> Result<DeleteModification> {
        for hook in &self.hooks {
            if hook.modify_delete(ctx)?.skip {
                return Ok(DeleteModification { skip: true });
            }
        }
        Ok(DeleteModification::default())
    }
}

/// Hook reference in a resource declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HookDecl {
    DefaultEntity(DefaultEntityConfig),
    VariantWriteOnce(VariantWriteOnce),
    /// Implementation registered in code under this name
    Named { name: String },
}

impl HookDecl {
    /// Resolve the declaration to an implementation
    pub fn bind(&self, named: &HashMap<String, Arc<dyn ResourceHooks>>) -> Result<Arc<dyn ResourceHooks>> {
        match self {
            Self::DefaultEntity(config) => Ok(Arc::new(DefaultEntityHooks::new(config.clone())?)),
            Self::VariantWriteOnce(hook) => Ok(Arc::new(hook.clone())),
            Self::Named { name } => named
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::Registry(format!("no hook registered as '{}'", name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Tag(&'static str);

    #[async_trait]
    impl ResourceHooks for Tag {
        fn name(&self) -> &str {
            self.0
        }

        fn outbound(&self, _ctx: &HookContext<'_>, mut raw: Value) -> Result<Value> {
            if let Some(list) = raw.get_mut("trail").and_then(Value::as_array_mut) {
                list.push(json!(self.0));
            }
            Ok(raw)
        }

        fn inbound(&self, ctx: &HookContext<'_>, raw: Value) -> Result<Value> {
            self.outbound(ctx, raw)
        }

        fn modify_delete(&self, _ctx: &HookContext<'_>) -> Result<DeleteModification> {
            Ok(DeleteModification { skip: self.0 == "b" })
        }
    }

    fn ctx(spec: &ResourceSpec) -> HookContext<'_> {
        HookContext {
            spec,
            operation: Operation::Update,
            planned: None,
            prior: None,
            id: None,
        }
    }

    #[test]
    fn test_chain_order() {
        let spec = ResourceSpec::new("x", "/x");
        let chain = HookChain::new(vec![Arc::new(Tag("a")), Arc::new(Tag("b"))]);
        assert_eq!(chain.name(), "a+b");

        let out = chain.outbound(&ctx(&spec), json!({"trail": []})).unwrap();
        assert_eq!(out["trail"], json!(["a", "b"]));
        let back = chain.inbound(&ctx(&spec), json!({"trail": []})).unwrap();
        assert_eq!(back["trail"], json!(["b", "a"]));
        assert!(chain.modify_delete(&ctx(&spec)).unwrap().skip);
    }

    #[test]
    fn test_bind_named_hook() {
        let mut named: HashMap<String, Arc<dyn ResourceHooks>> = HashMap::new();
        named.insert("tag".into(), Arc::new(Tag("a")));
        let decl = HookDecl::Named { name: "tag".into() };
        assert_eq!(decl.bind(&named).unwrap().name(), "a");

        let missing = HookDecl::Named { name: "nope".into() };
        assert!(matches!(missing.bind(&named), Err(EngineError::Registry(_))));
    }

    #[test]
    fn test_hook_decl_from_yaml() {
        let yaml = r#"
- kind: default_entity
  name_attribute: display_name
  sentinel: Default
  default_id_pattern: "_DefaultWindows10EnrollmentCompletionPageConfiguration$"
- kind: variant_write_once
  union_attribute: platform
  variant: windows
  attributes: [install_behavior]
"#;
        let decls: Vec<HookDecl> = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(decls[0], HookDecl::DefaultEntity(ref c) if c.priority_attribute == "priority" && c.default_priority == 0));
        assert!(matches!(decls[1], HookDecl::VariantWriteOnce(ref v) if v.variant == "windows"));
    }
}
