//! Boundary to the external tool gateway.
//!
//! Stages never talk to a backend directly. They build a typed
//! [`Capability`] and hand it to [`invoke`], which applies the call timeout
//! and decodes the raw result. The capability's effect class decides what a
//! stage does when the call fails (see [`call_with_policy`]).

pub mod capabilities;
pub mod scripted;
pub mod stdio;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tool_effects::{Effectful, FailurePolicy};
use tracing::{debug, warn};

pub use capabilities::{CreateWorkItem, EventRecord, SearchEvents, UpdateWorkItem, WorkItemRef};
pub use scripted::{ScriptedGateway, ToolCall};
pub use stdio::{StdioGateway, StdioGatewayConfig};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("tool `{tool}` failed: {message}")]
    Call { tool: String, message: String },
    #[error("tool `{tool}` timed out after {}s", .timeout.as_secs_f64())]
    Timeout { tool: String, timeout: Duration },
    #[error("tool `{tool}` returned a malformed result: {message}")]
    Malformed { tool: String, message: String },
    #[error("gateway transport error: {0}")]
    Transport(String),
    #[error("tool `{0}` is not exposed by this gateway")]
    ToolNotAllowed(String),
}

/// Generic tool-call interface. Implementations must be safe to share
/// between concurrent runs.
#[async_trait]
pub trait ToolGateway: Send + Sync {
    async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError>;
}

/// A named gateway operation with typed arguments and output.
pub trait Capability: Effectful + Send + Sync {
    const TOOL: &'static str;
    type Output;

    fn arguments(&self) -> serde_json::Value;

    fn decode(&self, raw: serde_json::Value) -> Result<Self::Output, GatewayError>;
}

/// Issue one capability call, bounded by `timeout`.
pub async fn invoke<C: Capability>(
    gateway: &dyn ToolGateway,
    capability: &C,
    timeout: Duration,
) -> Result<C::Output, GatewayError> {
    debug!(tool = C::TOOL, effect = %capability.effect(), "gateway call");
    let raw = tokio::time::timeout(timeout, gateway.call_tool(C::TOOL, capability.arguments()))
        .await
        .map_err(|_| GatewayError::Timeout {
            tool: C::TOOL.to_string(),
            timeout,
        })??;
    capability.decode(raw)
}

/// Result of a call after the capability's failure policy was applied.
#[derive(Debug)]
pub enum CallOutcome<T> {
    Completed(T),
    /// The call failed and the caller should continue with a degraded result.
    Degraded(GatewayError),
    /// The call failed and the failure must end the run.
    Failed(GatewayError),
}

pub async fn call_with_policy<C: Capability>(
    gateway: &dyn ToolGateway,
    capability: &C,
    timeout: Duration,
) -> CallOutcome<C::Output> {
    match invoke(gateway, capability, timeout).await {
        Ok(output) => CallOutcome::Completed(output),
        Err(err) => match capability.failure_policy() {
            FailurePolicy::Degrade => {
                warn!(tool = C::TOOL, error = %err, "gateway call failed, degrading");
                CallOutcome::Degraded(err)
            }
            FailurePolicy::Surface => CallOutcome::Failed(err),
        },
    }
}

/// Set of tool names a gateway connection is allowed to forward.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolFilter {
    allowed: BTreeSet<String>,
}

impl ToolFilter {
    pub fn new<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: tools.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, tool: &str) -> bool {
        self.allowed.contains(tool)
    }

    pub fn tools(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }
}

/// Routes each tool name to the first gateway whose filter admits it.
#[derive(Clone, Default)]
pub struct GatewayRouter {
    routes: Vec<(ToolFilter, Arc<dyn ToolGateway>)>,
}

impl GatewayRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, filter: ToolFilter, gateway: Arc<dyn ToolGateway>) -> Self {
        self.routes.push((filter, gateway));
        self
    }
}

#[async_trait]
impl ToolGateway for GatewayRouter {
    async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let Some((_, gateway)) = self.routes.iter().find(|(filter, _)| filter.allows(tool)) else {
            return Err(GatewayError::ToolNotAllowed(tool.to_string()));
        };
        gateway.call_tool(tool, arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    fn search() -> SearchEvents {
        let t: DateTime<Utc> = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        SearchEvents {
            query: "status:error".into(),
            time_from: t,
            time_to: t,
            limit: 50,
        }
    }

    #[tokio::test]
    async fn router_dispatches_by_tool_name() {
        let logs = ScriptedGateway::new().respond(SearchEvents::TOOL, json!([]));
        let tickets = ScriptedGateway::new().respond(CreateWorkItem::TOOL, json!({"id": 1}));
        let router = GatewayRouter::new()
            .route(ToolFilter::new([SearchEvents::TOOL]), Arc::new(logs.clone()))
            .route(ToolFilter::new([CreateWorkItem::TOOL]), Arc::new(tickets.clone()));

        router.call_tool(SearchEvents::TOOL, json!({})).await.expect("search");
        assert_eq!(logs.calls_to(SearchEvents::TOOL), 1);
        assert_eq!(tickets.calls().len(), 0);

        let err = router.call_tool("delete_everything", json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::ToolNotAllowed(t) if t == "delete_everything"));
    }

    #[tokio::test(start_paused = true)]
    async fn invoke_times_out_slow_calls() {
        let gateway = ScriptedGateway::new()
            .respond(SearchEvents::TOOL, json!([]))
            .with_delay(Duration::from_secs(31));
        let err = invoke(&gateway, &search(), DEFAULT_CALL_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { .. }));
    }

    #[tokio::test]
    async fn observe_failures_degrade() {
        let gateway = ScriptedGateway::new().fail(SearchEvents::TOOL, "rate limited");
        let outcome = call_with_policy(&gateway, &search(), DEFAULT_CALL_TIMEOUT).await;
        assert!(matches!(outcome, CallOutcome::Degraded(GatewayError::Call { .. })));
    }

    #[tokio::test]
    async fn mutate_failures_surface() {
        let gateway = ScriptedGateway::new().fail(CreateWorkItem::TOOL, "401");
        let create = CreateWorkItem {
            project: "MIRA".into(),
            work_item_type: "Bug".into(),
            fields: Default::default(),
        };
        let outcome = call_with_policy(&gateway, &create, DEFAULT_CALL_TIMEOUT).await;
        assert!(matches!(outcome, CallOutcome::Failed(_)));
    }
}
