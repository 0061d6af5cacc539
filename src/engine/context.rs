//! Per-invocation operation state

use crate::diagnostics::Diagnostics;
use crate::error::{EngineError, Result};
use crate::hooks::{HookContext, Operation};
use crate::resource::ResourceSpec;
use serde_json::Value;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// State of one CRUD call. Created by the caller, discarded afterwards.
///
/// Diagnostics accumulate here and stay available when the operation
/// fails.
#[derive(Debug)]
pub struct OperationContext {
    pub resource_type: String,
    /// Desired value (create/update)
    pub planned: Option<Value>,
    /// Prior state (read/update/delete)
    pub prior: Option<Value>,
    pub diagnostics: Diagnostics,
    /// Entity id, when the caller knows it
    pub id: Option<String>,
    /// Identity set by a create modify hook
    pub id_override: Option<String>,
    cancel: CancellationToken,
}

impl OperationContext {
    fn new(resource_type: &str, planned: Option<Value>, prior: Option<Value>) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            planned,
            prior,
            diagnostics: Diagnostics::new(),
            id: None,
            id_override: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn create(resource_type: &str, planned: Value) -> Self {
        Self::new(resource_type, Some(planned), None)
    }

    /// `state` carries the id and any parent placeholders
    pub fn read(resource_type: &str, state: Value) -> Self {
        Self::new(resource_type, None, Some(state))
    }

    pub fn update(resource_type: &str, planned: Value, prior: Value) -> Self {
        Self::new(resource_type, Some(planned), Some(prior))
    }

    pub fn delete(resource_type: &str, prior: Value) -> Self {
        Self::new(resource_type, None, Some(prior))
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// Observe `token` for cancellation
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail with `Cancelled` if the caller has cancelled
    pub fn check_cancelled(&self, step: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            tracing::info!("{} cancelled before {}", self.resource_type, step);
            return Err(EngineError::Cancelled {
                step: step.to_string(),
            });
        }
        Ok(())
    }

    /// Id to address: hook override, then explicit id, then prior state
    pub(crate) fn target_id(&self, spec: &ResourceSpec) -> Option<String> {
        self.id_override
            .clone()
            .or_else(|| self.id.clone())
            .or_else(|| self.prior.as_ref().and_then(|p| spec.id_of(p)))
    }

    pub(crate) fn hook_context<'a>(
        &'a self,
        spec: &'a ResourceSpec,
        operation: Operation,
        id: Option<&'a str>,
    ) -> HookContext<'a> {
        HookContext {
            spec,
            operation,
            planned: self.planned.as_ref(),
            prior: self.prior.as_ref(),
            id,
        }
    }
}

/// Race `fut` against cancellation of `cancel`
pub(crate) async fn guarded<T, F>(cancel: &CancellationToken, step: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled { step: step.to_string() }),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Attribute;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_target_id_precedence() {
        let spec = ResourceSpec::new("x", "/x").attribute(Attribute::string("id"));
        let mut ctx = OperationContext::delete("x", json!({"id": "from-prior"}));
        assert_eq!(ctx.target_id(&spec).as_deref(), Some("from-prior"));
        ctx.id = Some("explicit".into());
        assert_eq!(ctx.target_id(&spec).as_deref(), Some("explicit"));
        ctx.id_override = Some("override".into());
        assert_eq!(ctx.target_id(&spec).as_deref(), Some("override"));
    }

    #[test]
    fn test_check_cancelled() {
        let token = CancellationToken::new();
        let ctx = OperationContext::create("x", json!({})).with_cancellation(token.clone());
        assert!(ctx.check_cancelled("write").is_ok());
        token.cancel();
        let err = ctx.check_cancelled("write").unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "operation cancelled before write");
    }

    #[tokio::test]
    async fn test_guarded_aborts_in_flight_call() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let result: Result<()> = guarded(&token, "primary write", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
