//! Default/singleton entity hooks
//!
//! Some collections contain one entity per derived type that always exists,
//! cannot be created or deleted, and has a remote id that follows a naming
//! convention. Callers address it by putting a sentinel marker in the name
//! field with the default priority (`0` unless declared otherwise). On create the entity is discovered by query and
//! the operation becomes an update of it.

use super::{
    CreateModification, DeleteModification, EntityLookup, HookContext, Operation, ResourceHooks,
};
use crate::engine::Filter;
use crate::error::{EngineError, Result};
use crate::resource::ResourceSpec;
use crate::schema::{camel_case, resolve, DISCRIMINANT_FIELD};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_priority_attribute() -> String {
    "priority".to_string()
}

/// Declaration of a default entity convention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultEntityConfig {
    /// Local attribute holding the sentinel
    pub name_attribute: String,
    /// Marker value identifying the default entity
    pub sentinel: String,
    #[serde(default = "default_priority_attribute")]
    pub priority_attribute: String,
    /// Priority the default entity always has
    #[serde(default)]
    pub default_priority: i64,
    /// Regex every default entity id matches
    pub default_id_pattern: String,
}

pub struct DefaultEntityHooks {
    config: DefaultEntityConfig,
    default_id: Regex,
}

impl DefaultEntityHooks {
    pub fn new(config: DefaultEntityConfig) -> Result<Self> {
        let default_id = Regex::new(&config.default_id_pattern).map_err(|e| {
            EngineError::Registry(format!("invalid default id pattern: {}", e))
        })?;
        Ok(Self { config, default_id })
    }

    pub fn is_default_id(&self, id: &str) -> bool {
        self.default_id.is_match(id)
    }

    fn wants_default(&self, value: Option<&Value>) -> bool {
        value
            .and_then(|v| v.get(&self.config.name_attribute))
            .and_then(Value::as_str)
            == Some(self.config.sentinel.as_str())
    }

    fn wire_key(spec: &ResourceSpec, name: &str) -> String {
        spec.find(name)
            .map(|a| a.wire_key().into_owned())
            .unwrap_or_else(|| camel_case(name))
    }

    /// Discovery filter: the planned derived type plus the default priority
    fn discovery_filter(&self, ctx: &HookContext<'_>, planned: &Value) -> Result<Filter> {
        let mut filter = Filter::default();
        if let Some((attr, union)) = ctx.spec.root_union() {
            let value = planned.get(&attr.name).unwrap_or(&Value::Null);
            if let Some(resolved) = resolve(union, value, false, &attr.name)? {
                filter = filter.and(DISCRIMINANT_FIELD, resolved.discriminant());
            }
        }
        let priority = Self::wire_key(ctx.spec, &self.config.priority_attribute);
        Ok(filter.and(&priority, self.config.default_priority))
    }

    fn discovery_error(&self, ctx: &HookContext<'_>, message: String) -> EngineError {
        EngineError::IdentityDiscovery {
            resource: ctx.spec.name.clone(),
            message,
        }
    }
}

#[async_trait]
impl ResourceHooks for DefaultEntityHooks {
    fn name(&self) -> &str {
        "default_entity"
    }

    fn outbound(&self, ctx: &HookContext<'_>, mut raw: Value) -> Result<Value> {
        let targets_default =
            self.wants_default(Some(&raw)) || ctx.id.map_or(false, |id| self.is_default_id(id));
        if !targets_default {
            return Ok(raw);
        }

        let Some(map) = raw.as_object_mut() else {
            return Ok(raw);
        };
        match map.get(&self.config.priority_attribute) {
            None | Some(Value::Null) => {}
            Some(p) if p.as_f64() == Some(self.config.default_priority as f64) => {}
            Some(p) => {
                return Err(EngineError::hook(
                    self.name(),
                    format!(
                        "{} must be {} for the default {} (got {})",
                        self.config.priority_attribute, self.config.default_priority, ctx.spec.name, p
                    ),
                ))
            }
        }
        // The default entity's name and priority are owned by the remote side
        map.remove(&self.config.name_attribute);
        map.remove(&self.config.priority_attribute);
        Ok(raw)
    }

    fn inbound(&self, ctx: &HookContext<'_>, mut raw: Value) -> Result<Value> {
        let id_key = Self::wire_key(ctx.spec, &ctx.spec.id_attribute);
        let is_default = raw
            .get(&id_key)
            .and_then(Value::as_str)
            .map_or(false, |id| self.is_default_id(id));
        if is_default {
            if let Some(map) = raw.as_object_mut() {
                map.insert(
                    Self::wire_key(ctx.spec, &self.config.name_attribute),
                    Value::String(self.config.sentinel.clone()),
                );
            }
        }
        Ok(raw)
    }

    async fn modify_create(
        &self,
        ctx: &HookContext<'_>,
        lookup: &dyn EntityLookup,
    ) -> Result<CreateModification> {
        if ctx.operation != Operation::Create || !self.wants_default(ctx.planned) {
            return Ok(CreateModification::default());
        }
        let planned = ctx.planned.unwrap_or(&Value::Null);
        let filter = self.discovery_filter(ctx, planned)?;
        tracing::debug!("Discovering default {} with {}", ctx.spec.name, filter);

        let matches = lookup.find(&filter).await?;
        let [entity] = matches.as_slice() else {
            return Err(self.discovery_error(
                ctx,
                format!("expected exactly one default entity, found {}", matches.len()),
            ));
        };

        let id_key = Self::wire_key(ctx.spec, &ctx.spec.id_attribute);
        let Some(id) = entity.get(&id_key).and_then(Value::as_str) else {
            return Err(self.discovery_error(ctx, "matched entity has no id".to_string()));
        };
        if !self.is_default_id(id) {
            return Err(self.discovery_error(
                ctx,
                format!("matched entity id '{}' is not a default id", id),
            ));
        }

        tracing::info!("Redirecting create of default {} to update of {}", ctx.spec.name, id);
        Ok(CreateModification::redirect(id))
    }

    fn modify_delete(&self, ctx: &HookContext<'_>) -> Result<DeleteModification> {
        let id = ctx
            .id
            .map(str::to_string)
            .or_else(|| ctx.prior.and_then(|p| ctx.spec.id_of(p)));
        let skip = id.as_deref().map_or(false, |id| self.is_default_id(id));
        if skip {
            tracing::info!("Skipping delete of default {}", ctx.spec.name);
        }
        Ok(DeleteModification { skip })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, UnionSchema, Variant};
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeLookup {
        items: Vec<Value>,
        seen: Mutex<Vec<Filter>>,
    }

    #[async_trait]
    impl EntityLookup for FakeLookup {
        async fn find(&self, filter: &Filter) -> Result<Vec<Value>> {
            self.seen.lock().unwrap().push(filter.clone());
            Ok(self.items.iter().filter(|i| filter.matches(i)).cloned().collect())
        }
    }

    fn lookup(items: Vec<Value>) -> FakeLookup {
        FakeLookup {
            items,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn spec() -> ResourceSpec {
        ResourceSpec::new("enrollment_configuration", "/enrollmentConfigurations")
            .attribute(Attribute::string("id").read_only())
            .attribute(Attribute::string("display_name"))
            .attribute(Attribute::int("priority"))
            .attribute(Attribute::union(
                "platform",
                UnionSchema::inline(vec![
                    Variant::new("windows", "#microsoft.graph.windowsConfig", vec![]),
                    Variant::new("limit", "#microsoft.graph.limitConfig", vec![]),
                ]),
            ))
    }

    fn hooks() -> DefaultEntityHooks {
        DefaultEntityHooks::new(DefaultEntityConfig {
            name_attribute: "display_name".into(),
            sentinel: "Default".into(),
            priority_attribute: "priority".into(),
            default_priority: 0,
            default_id_pattern: "_Default[A-Za-z]+$".into(),
        })
        .unwrap()
    }

    fn create_ctx<'a>(spec: &'a ResourceSpec, planned: &'a Value) -> HookContext<'a> {
        HookContext {
            spec,
            operation: Operation::Create,
            planned: Some(planned),
            prior: None,
            id: None,
        }
    }

    #[tokio::test]
    async fn test_discovers_single_default() {
        let spec = spec();
        let planned = json!({"display_name": "Default", "priority": 0, "platform": {"windows": {}}});
        let lookup = lookup(vec![
            json!({"id": "abc_DefaultWindows", "@odata.type": "#microsoft.graph.windowsConfig", "priority": 0}),
            json!({"id": "abc_DefaultLimit", "@odata.type": "#microsoft.graph.limitConfig", "priority": 0}),
            json!({"id": "custom", "@odata.type": "#microsoft.graph.windowsConfig", "priority": 1}),
        ]);
        let modification = hooks().modify_create(&create_ctx(&spec, &planned), &lookup).await.unwrap();
        assert_eq!(modification, CreateModification::redirect("abc_DefaultWindows"));
        assert_eq!(
            lookup.seen.lock().unwrap()[0].to_odata(),
            "isof('microsoft.graph.windowsConfig') and priority eq 0"
        );
    }

    #[tokio::test]
    async fn test_discovery_uses_declared_priority() {
        let spec = spec();
        let hooks = DefaultEntityHooks::new(DefaultEntityConfig {
            name_attribute: "display_name".into(),
            sentinel: "Default".into(),
            priority_attribute: "priority".into(),
            default_priority: 1000,
            default_id_pattern: "_Default[A-Za-z]+$".into(),
        })
        .unwrap();
        let planned = json!({"display_name": "Default", "platform": {"windows": {}}});
        let lookup = lookup(vec![
            json!({"id": "abc_DefaultWindows", "@odata.type": "#microsoft.graph.windowsConfig", "priority": 1000}),
        ]);
        let modification = hooks.modify_create(&create_ctx(&spec, &planned), &lookup).await.unwrap();
        assert_eq!(modification, CreateModification::redirect("abc_DefaultWindows"));
        assert_eq!(
            lookup.seen.lock().unwrap()[0].to_odata(),
            "isof('microsoft.graph.windowsConfig') and priority eq 1000"
        );

        let ctx = HookContext {
            spec: &spec,
            operation: Operation::Create,
            planned: None,
            prior: None,
            id: None,
        };
        let kept = hooks
            .outbound(&ctx, json!({"display_name": "Default", "priority": 1000}))
            .unwrap();
        assert!(kept.get("priority").is_none());
        assert!(hooks
            .outbound(&ctx, json!({"display_name": "Default", "priority": 0}))
            .is_err());
    }

    #[tokio::test]
    async fn test_discovery_requires_exactly_one_match() {
        let spec = spec();
        let planned = json!({"display_name": "Default", "priority": 0, "platform": {"windows": {}}});

        let err = hooks()
            .modify_create(&create_ctx(&spec, &planned), &lookup(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IdentityDiscovery { ref message, .. } if message.contains("found 0")));

        let twice = vec![
            json!({"id": "a_DefaultWindows", "@odata.type": "#microsoft.graph.windowsConfig", "priority": 0}),
            json!({"id": "b_DefaultWindows", "@odata.type": "#microsoft.graph.windowsConfig", "priority": 0}),
        ];
        let err = hooks()
            .modify_create(&create_ctx(&spec, &planned), &lookup(twice))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("found 2"));
    }

    #[tokio::test]
    async fn test_discovery_checks_id_format() {
        let spec = spec();
        let planned = json!({"display_name": "Default", "priority": 0, "platform": {"windows": {}}});
        let items = vec![json!({"id": "not-default", "@odata.type": "#microsoft.graph.windowsConfig", "priority": 0})];
        let err = hooks()
            .modify_create(&create_ctx(&spec, &planned), &lookup(items))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a default id"));
    }

    #[tokio::test]
    async fn test_regular_create_is_untouched() {
        let spec = spec();
        let planned = json!({"display_name": "Kiosk", "priority": 2});
        let lookup = lookup(vec![]);
        let modification = hooks().modify_create(&create_ctx(&spec, &planned), &lookup).await.unwrap();
        assert_eq!(modification, CreateModification::default());
        assert!(lookup.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_outbound_strips_name_and_rejects_priority() {
        let spec = spec();
        let planned = json!({"display_name": "Default", "priority": 0, "platform": null});
        let ctx = create_ctx(&spec, &planned);
        let out = hooks().outbound(&ctx, planned.clone()).unwrap();
        assert_eq!(out, json!({"platform": null}));

        let bad = json!({"display_name": "Default", "priority": 3});
        let err = hooks().outbound(&ctx, bad).unwrap_err();
        assert!(matches!(err, EngineError::Hook { .. }));

        let custom = json!({"display_name": "Kiosk", "priority": 3});
        assert_eq!(hooks().outbound(&ctx, custom.clone()).unwrap(), custom);
    }

    #[test]
    fn test_inbound_rewrites_default_name() {
        let spec = spec();
        let planned = Value::Null;
        let ctx = create_ctx(&spec, &planned);
        let wire = json!({"id": "abc_DefaultWindows", "displayName": "All users and all devices"});
        let out = hooks().inbound(&ctx, wire).unwrap();
        assert_eq!(out["displayName"], "Default");

        let wire = json!({"id": "custom", "displayName": "Kiosk"});
        assert_eq!(hooks().inbound(&ctx, wire).unwrap()["displayName"], "Kiosk");
    }

    #[test]
    fn test_delete_skipped_for_default_id() {
        let spec = spec();
        let prior = json!({"id": "abc_DefaultWindows"});
        let ctx = HookContext {
            spec: &spec,
            operation: Operation::Delete,
            planned: None,
            prior: Some(&prior),
            id: None,
        };
        assert!(hooks().modify_delete(&ctx).unwrap().skip);

        let prior = json!({"id": "custom"});
        let ctx = HookContext { prior: Some(&prior), ..ctx };
        assert!(!hooks().modify_delete(&ctx).unwrap().skip);
    }

    #[test]
    fn test_invalid_pattern_is_registry_error() {
        let err = DefaultEntityHooks::new(DefaultEntityConfig {
            name_attribute: "display_name".into(),
            sentinel: "Default".into(),
            priority_attribute: "priority".into(),
            default_priority: 0,
            default_id_pattern: "(".into(),
        })
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::Registry(_)));
    }
}
