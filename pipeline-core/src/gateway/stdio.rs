//! MCP tool gateway over a child process's stdin/stdout.
//!
//! One rmcp client session is shared by every pipeline run. The session owns
//! request ids and response routing, so a call abandoned by its caller (for
//! example on timeout) never disturbs the calls still in flight.

use super::{GatewayError, ToolFilter, ToolGateway};
use async_trait::async_trait;
use rmcp::ServiceExt;
use rmcp::service::{RoleClient, RunningService, ServiceError};
use rmcp::transport::TokioChildProcess;
use serde_json::{Value, json};
use std::fmt;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct StdioGatewayConfig {
    /// Label used in logs, e.g. "datadog".
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub tools: ToolFilter,
}

pub struct StdioGateway {
    name: String,
    tools: ToolFilter,
    session: RunningService<RoleClient, ()>,
}

impl StdioGateway {
    /// Launch the gateway process and complete the protocol handshake.
    pub async fn spawn(config: StdioGatewayConfig) -> Result<Self, GatewayError> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let transport = TokioChildProcess::new(command).map_err(|e| {
            GatewayError::Transport(format!("failed to launch {}: {e}", config.command))
        })?;

        let session = ().serve(transport).await.map_err(handshake_failed(&config.name))?;
        let gateway = Self {
            name: config.name,
            tools: config.tools,
            session,
        };
        info!(gateway = %gateway.name, tools = ?gateway.tools.tools().collect::<Vec<_>>(), "tool gateway ready");
        Ok(gateway)
    }

    /// Run the handshake over an already-open byte stream pair.
    pub async fn connect<R, W>(
        name: impl Into<String>,
        tools: ToolFilter,
        reader: R,
        writer: W,
    ) -> Result<Self, GatewayError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let name = name.into();
        let session = ().serve((reader, writer)).await.map_err(handshake_failed(&name))?;
        Ok(Self {
            name,
            tools,
            session,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn handshake_failed<E: fmt::Display>(name: &str) -> impl FnOnce(E) -> GatewayError + '_ {
    move |e| GatewayError::Transport(format!("{name} handshake failed: {e}"))
}

#[async_trait]
impl ToolGateway for StdioGateway {
    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, GatewayError> {
        if !self.tools.allows(tool) {
            return Err(GatewayError::ToolNotAllowed(tool.to_string()));
        }
        let params = serde_json::from_value(json!({"name": tool, "arguments": arguments}))
            .map_err(|e| GatewayError::Malformed {
                tool: tool.to_string(),
                message: format!("arguments must be a JSON object: {e}"),
            })?;

        debug!(gateway = %self.name, tool, "tools/call");
        let result = self.session.call_tool(params).await.map_err(|err| match err {
            ServiceError::McpError(error) => GatewayError::Call {
                tool: tool.to_string(),
                message: error.message.to_string(),
            },
            other => GatewayError::Transport(format!("{}: {other}", self.name)),
        })?;

        let result = serde_json::to_value(&result).map_err(|e| GatewayError::Malformed {
            tool: tool.to_string(),
            message: e.to_string(),
        })?;
        decode_tool_result(tool, result)
    }
}

/// Unwrap an MCP `tools/call` result into the tool's payload.
///
/// Structured content wins; otherwise text parts are joined and parsed as
/// JSON when possible, falling back to a plain string.
fn decode_tool_result(tool: &str, result: Value) -> Result<Value, GatewayError> {
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        return Err(GatewayError::Call {
            tool: tool.to_string(),
            message: if text.is_empty() { "tool reported an error".into() } else { text },
        });
    }
    if let Some(structured) = result.get("structuredContent").filter(|v| !v.is_null()) {
        return Ok(structured.clone());
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}
