//! Variant-scoped write-once fields
//!
//! Strips fields that can only be set at creation time, but only when one
//! particular derived type is selected. The schema marks such fields
//! mutable because other variants accept updates to them.

use super::{HookContext, Operation, ResourceHooks};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantWriteOnce {
    /// Local name of the union attribute
    pub union_attribute: String,
    /// Variant whose fields are write-once
    pub variant: String,
    /// Fields of that variant to strip on update
    pub attributes: Vec<String>,
}

#[async_trait]
impl ResourceHooks for VariantWriteOnce {
    fn name(&self) -> &str {
        "variant_write_once"
    }

    fn outbound(&self, ctx: &HookContext<'_>, mut raw: Value) -> Result<Value> {
        if ctx.operation != Operation::Update {
            return Ok(raw);
        }
        let fields = raw
            .get_mut(&self.union_attribute)
            .and_then(|u| u.get_mut(&self.variant))
            .and_then(Value::as_object_mut);
        if let Some(fields) = fields {
            for name in &self.attributes {
                if fields.remove(name).is_some() {
                    tracing::debug!("Stripped write-once {}.{}.{}", self.union_attribute, self.variant, name);
                }
            }
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceSpec;
    use serde_json::json;

    fn hook() -> VariantWriteOnce {
        VariantWriteOnce {
            union_attribute: "app".into(),
            variant: "win32".into(),
            attributes: vec!["install_command".into()],
        }
    }

    #[test]
    fn test_strips_on_update_only() {
        let spec = ResourceSpec::new("app", "/apps");
        let value = json!({"app": {"win32": {"install_command": "setup.exe", "name": "x"}, "web": null}});
        let update = HookContext {
            spec: &spec,
            operation: Operation::Update,
            planned: None,
            prior: None,
            id: Some("1"),
        };
        let out = hook().outbound(&update, value.clone()).unwrap();
        assert_eq!(out, json!({"app": {"win32": {"name": "x"}, "web": null}}));

        let create = HookContext {
            operation: Operation::Create,
            ..update
        };
        assert_eq!(hook().outbound(&create, value.clone()).unwrap(), value);
    }

    #[test]
    fn test_other_variant_untouched() {
        let spec = ResourceSpec::new("app", "/apps");
        let value = json!({"app": {"win32": null, "web": {"install_command": "keep"}}});
        let ctx = HookContext {
            spec: &spec,
            operation: Operation::Update,
            planned: None,
            prior: None,
            id: None,
        };
        assert_eq!(hook().outbound(&ctx, value.clone()).unwrap(), value);
    }
}
