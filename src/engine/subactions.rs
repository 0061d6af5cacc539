//! Write Sub-Action Orchestrator
//!
//! Runs the secondary writes a resource declares, in declared order, after
//! the primary create or update. Each action is scoped to create, update or
//! both, and either aborts the operation on failure or is downgraded to a
//! warning. Nothing is rolled back: when an action fails or the caller
//! cancels, the writes already issued stay in place.

use super::collection::{diff_keyed, item_key};
use super::context::{guarded, OperationContext};
use super::payload::{build_write_payload, value_to_wire, values_equal, WriteKind};
use crate::error::{EngineError, Result};
use crate::graph::{join_uri, GraphClient};
use crate::resource::{HttpMethod, ResourceSpec, SubActionKind, WriteSubAction};
use crate::schema::{Attribute, AttributeKind};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

/// Inputs shared by every sub-action of one write
pub(crate) struct SubActionRun<'a> {
    pub client: &'a GraphClient,
    pub spec: &'a ResourceSpec,
    pub kind: WriteKind,
    pub entity_uri: &'a str,
    /// Desired value after outbound middleware, with defaults applied
    pub desired: &'a Value,
    pub prior: Option<&'a Value>,
}

fn applies(action: &WriteSubAction, kind: WriteKind) -> bool {
    match action.kind {
        SubActionKind::PostThenPatch => kind == WriteKind::Create && action.scope.applies(kind),
        _ => action.scope.applies(kind),
    }
}

/// Run every applicable sub-action in declared order
pub(crate) async fn run_sub_actions(run: &SubActionRun<'_>, ctx: &mut OperationContext) -> Result<()> {
    for action in &run.spec.write.sub_actions {
        if !applies(action, run.kind) {
            tracing::debug!(
                "Skipping sub-action {} on {}",
                action.name,
                run.kind.as_str()
            );
            continue;
        }

        let step = format!("sub-action '{}'", action.name);
        ctx.check_cancelled(&step)?;
        let cancel = ctx.cancellation().clone();

        match guarded(&cancel, &step, run_action(run, action)).await {
            Ok(calls) => tracing::debug!("Sub-action {} issued {} calls", action.name, calls),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) if action.errors_as_warnings && !e.is_validation() => {
                tracing::warn!("Sub-action {} failed, continuing: {}", action.name, e);
                ctx.diagnostics
                    .warn(format!("sub-action '{}' failed", action.name), e.to_string());
            }
            Err(e) => {
                return Err(EngineError::SubAction {
                    action: action.name.clone(),
                    source: Box::new(e),
                })
            }
        }
    }
    Ok(())
}

async fn run_action(run: &SubActionRun<'_>, action: &WriteSubAction) -> Result<usize> {
    match &action.kind {
        SubActionKind::AllInOne => all_in_one(run, action).await,
        SubActionKind::Individual { key, reference } => {
            individual(run, action, key, reference.as_deref()).await
        }
        SubActionKind::PostThenPatch => post_then_patch(run, action).await,
    }
}

fn attribute<'a>(spec: &'a ResourceSpec, name: &str) -> Result<&'a Attribute> {
    spec.find(name)
        .ok_or_else(|| EngineError::validation(name, "sub-action references an undeclared attribute"))
}

/// Whether none of the action's attributes differ from the prior state.
/// An attribute absent from the desired value counts as unchanged.
fn unchanged(run: &SubActionRun<'_>, action: &WriteSubAction) -> Result<bool> {
    let Some(prior) = run.prior else {
        return Ok(false);
    };
    for name in &action.attributes {
        let attr = attribute(run.spec, name)?;
        let Some(wanted) = run.desired.get(name) else {
            continue;
        };
        let before = prior.get(name).unwrap_or(&Value::Null);
        if !values_equal(&attr.kind, wanted, before) {
            return Ok(false);
        }
    }
    Ok(true)
}

async fn all_in_one(run: &SubActionRun<'_>, action: &WriteSubAction) -> Result<usize> {
    if run.kind == WriteKind::Update && unchanged(run, action)? {
        tracing::debug!("Sub-action {} unchanged", action.name);
        return Ok(0);
    }

    let mut body = Map::new();
    let mut populated = false;
    for name in &action.attributes {
        let attr = attribute(run.spec, name)?;
        let value = run.desired.get(name).unwrap_or(&Value::Null);
        populated |= !value.is_null();

        let key = match (&action.wire_name, action.attributes.len()) {
            (Some(wire), 1) => wire.clone(),
            _ => attr.wire_key().into_owned(),
        };
        let wire = match (value, attr.kind.element()) {
            // Clearing a relationship collection sends it empty
            (Value::Null, Some(_)) => Value::Array(Vec::new()),
            _ => value_to_wire(&attr.kind, value, name)?,
        };
        body.insert(key, wire);
    }

    if run.kind == WriteKind::Create && !populated {
        tracing::debug!("Sub-action {} has nothing to send", action.name);
        return Ok(0);
    }

    let uri = join_uri(run.entity_uri, &action.uri_suffix);
    run.client
        .send(action.method, &uri, Some(&Value::Object(body)))
        .await?;
    Ok(1)
}

fn items(value: Option<&Value>) -> &[Value] {
    value.and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
}

async fn individual(
    run: &SubActionRun<'_>,
    action: &WriteSubAction,
    key: &str,
    reference: Option<&str>,
) -> Result<usize> {
    let name = &action.attributes[0];
    let attr = attribute(run.spec, name)?;
    let element = attr.kind.element().unwrap_or(&AttributeKind::Json);

    let wanted = run.desired.get(name);
    if run.kind == WriteKind::Update && wanted.is_none() {
        return Ok(0);
    }
    let before = items(run.prior.and_then(|p| p.get(name)));
    let diff = diff_keyed(element, before, items(wanted), key, name)?;
    if diff.is_empty() {
        return Ok(0);
    }

    let base = join_uri(run.entity_uri, &action.uri_suffix);
    let item_uri = |item: &Value| -> Result<String> {
        let k = item_key(item, key, name)?;
        Ok(join_uri(&base, &urlencoding::encode(&k)))
    };
    let mut calls = 0;

    for item in &diff.remove {
        let mut uri = item_uri(item)?;
        if reference.is_some() {
            uri = join_uri(&uri, "$ref");
        }
        calls += 1;
        match run.client.delete(&uri).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => tracing::debug!("{} already removed", uri),
            Err(e) => return Err(e),
        }
    }

    for item in &diff.add {
        calls += 1;
        match reference {
            Some(collection) => {
                let k = item_key(item, key, name)?;
                let target = run.client.url(&join_uri(collection, &urlencoding::encode(&k)));
                run.client
                    .post(&join_uri(&base, "$ref"), &json!({ "@odata.id": target }))
                    .await?;
            }
            None => {
                let body = value_to_wire(element, item, name)?;
                run.client.send(action.method, &base, Some(&body)).await?;
            }
        }
    }

    // References carry no content of their own
    if reference.is_none() {
        for item in &diff.update {
            calls += 1;
            let body = value_to_wire(element, item, name)?;
            run.client.patch(&item_uri(item)?, &body).await?;
        }
    }
    Ok(calls)
}

async fn post_then_patch(run: &SubActionRun<'_>, action: &WriteSubAction) -> Result<usize> {
    let attributes: Vec<Attribute> = run
        .spec
        .attributes
        .iter()
        .filter(|a| action.attributes.contains(&a.name))
        .cloned()
        .collect();
    let payload = build_write_payload(
        &attributes,
        run.desired,
        None,
        WriteKind::Create,
        &HashSet::new(),
    )?;
    if payload.is_empty() {
        return Ok(0);
    }

    let uri = join_uri(run.entity_uri, &action.uri_suffix);
    run.client
        .send(HttpMethod::Patch, &uri, Some(&Value::Object(payload)))
        .await?;
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ActionScope;

    #[test]
    fn test_applies() {
        let update_only = WriteSubAction::all_in_one("priority", "setPriority", &["priority"])
            .scope(ActionScope::Update);
        assert!(!applies(&update_only, WriteKind::Create));
        assert!(applies(&update_only, WriteKind::Update));

        let patch = WriteSubAction::post_then_patch("rest", &["settings"]).scope(ActionScope::Always);
        assert!(applies(&patch, WriteKind::Create));
        assert!(!applies(&patch, WriteKind::Update));
    }

    #[test]
    fn test_items_of_missing_value() {
        assert!(items(None).is_empty());
        assert!(items(Some(&Value::Null)).is_empty());
        assert_eq!(items(Some(&json!([1, 2]))).len(), 2);
    }
}
