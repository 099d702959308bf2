use super::{GatewayError, ToolGateway};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// One recorded gateway call.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub tool: String,
    pub arguments: serde_json::Value,
}

#[derive(Default)]
struct Script {
    responses: HashMap<String, VecDeque<Result<serde_json::Value, GatewayError>>>,
    calls: Vec<ToolCall>,
    delay: Option<Duration>,
}

/// In-process gateway that replays queued responses and records every call.
///
/// Responses are consumed in order per tool; the last queued response for a
/// tool is repeated once the queue runs dry.
#[derive(Clone, Default)]
pub struct ScriptedGateway {
    script: Arc<Mutex<Script>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, tool: &str, value: serde_json::Value) -> Self {
        self.push(tool, Ok(value));
        self
    }

    pub fn fail(self, tool: &str, message: &str) -> Self {
        self.push(
            tool,
            Err(GatewayError::Call {
                tool: tool.to_string(),
                message: message.to_string(),
            }),
        );
        self
    }

    /// Delay every response, e.g. to exercise call timeouts.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.lock().delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        self.lock().calls.clone()
    }

    pub fn calls_to(&self, tool: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.tool == tool).count()
    }

    fn push(&self, tool: &str, response: Result<serde_json::Value, GatewayError>) {
        self.lock()
            .responses
            .entry(tool.to_string())
            .or_default()
            .push_back(response);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ToolGateway for ScriptedGateway {
    async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let (response, delay) = {
            let mut script = self.lock();
            script.calls.push(ToolCall {
                tool: tool.to_string(),
                arguments,
            });
            let delay = script.delay;
            let response = match script.responses.get_mut(tool) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            };
            (response, delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        response.unwrap_or_else(|| {
            Err(GatewayError::Call {
                tool: tool.to_string(),
                message: "no scripted response".into(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn replays_in_order_then_repeats_last() {
        let gateway = ScriptedGateway::new()
            .respond("t", json!(1))
            .respond("t", json!(2));
        assert_eq!(gateway.call_tool("t", json!({})).await.unwrap(), json!(1));
        assert_eq!(gateway.call_tool("t", json!({})).await.unwrap(), json!(2));
        assert_eq!(gateway.call_tool("t", json!({})).await.unwrap(), json!(2));
        assert_eq!(gateway.calls_to("t"), 3);
    }

    #[tokio::test]
    async fn unknown_tool_fails_but_is_recorded() {
        let gateway = ScriptedGateway::new();
        let err = gateway.call_tool("missing", json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, GatewayError::Call { .. }));
        assert_eq!(
            gateway.calls(),
            vec![ToolCall {
                tool: "missing".into(),
                arguments: json!({"a": 1})
            }]
        );
    }
}
