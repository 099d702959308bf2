//! Startup configuration, read once from the environment and validated
//! before the ingress accepts traffic.

use crate::action::{DEFAULT_SITE, DEFAULT_WORK_ITEM_TYPE};
use crate::gateway::{
    Capability, CreateWorkItem, SearchEvents, StdioGatewayConfig, ToolFilter, UpdateWorkItem,
};
use crate::hypothesis::LlmConfig;
use crate::investigation::{DEFAULT_SEARCH_LIMIT, MAX_SEARCH_LIMIT};
use crate::queue::{DEFAULT_CAPACITY, DEFAULT_WORKERS};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const REQUIRED: [&str; 4] = ["DD_API_KEY", "DD_APP_KEY", "ADO_ORG_NAME", "ADO_PAT"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Clone, PartialEq, Eq)]
pub struct DatadogConfig {
    pub api_key: String,
    pub app_key: String,
    pub site: String,
}

impl fmt::Debug for DatadogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatadogConfig")
            .field("api_key", &"***")
            .field("app_key", &"***")
            .field("site", &self.site)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AdoConfig {
    pub org_name: String,
    pub pat: String,
    pub project: String,
    pub work_item_type: String,
}

impl fmt::Debug for AdoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdoConfig")
            .field("org_name", &self.org_name)
            .field("pat", &"***")
            .field("project", &self.project)
            .field("work_item_type", &self.work_item_type)
            .finish()
    }
}

/// Command line of a tool-gateway subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCommand {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub datadog: DatadogConfig,
    pub ado: AdoConfig,
    pub port: u16,
    pub search_limit: u32,
    pub gateway_timeout: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
    pub event_log_path: Option<PathBuf>,
    pub datadog_gateway: GatewayCommand,
    pub ado_gateway: GatewayCommand,
    pub llm: Option<LlmConfig>,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&std::env::vars().collect())
    }

    pub fn from_lookup(env: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |key: &str| env.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let missing: Vec<&'static str> = REQUIRED.into_iter().filter(|k| get(k).is_none()).collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        let required = |key: &'static str| get(key).map(ToString::to_string).unwrap_or_default();
        let or_default = |key: &str, default: &str| get(key).unwrap_or(default).to_string();

        let search_limit: u32 = parse_or(env, "SEARCH_LIMIT", DEFAULT_SEARCH_LIMIT)?;
        if search_limit == 0 || search_limit > MAX_SEARCH_LIMIT {
            return Err(ConfigError::Invalid {
                key: "SEARCH_LIMIT",
                message: format!("must be between 1 and {MAX_SEARCH_LIMIT}, got {search_limit}"),
            });
        }
        let timeout_secs: u64 = parse_or(env, "GATEWAY_TIMEOUT_SECS", 30)?;
        let workers: usize = parse_or(env, "PIPELINE_WORKERS", DEFAULT_WORKERS)?;
        let queue_capacity: usize = parse_or(env, "PIPELINE_QUEUE_CAPACITY", DEFAULT_CAPACITY)?;
        for (key, value) in [
            ("GATEWAY_TIMEOUT_SECS", timeout_secs as usize),
            ("PIPELINE_WORKERS", workers),
            ("PIPELINE_QUEUE_CAPACITY", queue_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    message: "must be greater than zero".into(),
                });
            }
        }

        let org_name = required("ADO_ORG_NAME");
        let datadog_gateway = command(
            env,
            "DATADOG_MCP_COMMAND",
            "DATADOG_MCP_ARGS",
            "node",
            vec!["../datadog-mcp/dist/index.js".to_string()],
        )?;
        let ado_gateway = command(
            env,
            "ADO_MCP_COMMAND",
            "ADO_MCP_ARGS",
            "npx",
            [
                "-y",
                "@azure-devops/mcp",
                org_name.as_str(),
                "--authentication",
                "envvar",
                "-d",
                "core",
                "work-items",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        )?;

        Ok(Self {
            datadog: DatadogConfig {
                api_key: required("DD_API_KEY"),
                app_key: required("DD_APP_KEY"),
                site: or_default("DD_SITE", DEFAULT_SITE),
            },
            ado: AdoConfig {
                org_name,
                pat: required("ADO_PAT"),
                project: or_default("ADO_PROJECT", "MIRA"),
                work_item_type: or_default("ADO_WORK_ITEM_TYPE", DEFAULT_WORK_ITEM_TYPE),
            },
            port: parse_or(env, "PORT", 3000)?,
            search_limit,
            gateway_timeout: Duration::from_secs(timeout_secs),
            workers,
            queue_capacity,
            event_log_path: get("EVENT_LOG_PATH").map(PathBuf::from),
            datadog_gateway,
            ado_gateway,
            llm: LlmConfig::from_lookup(env),
        })
    }

    /// Log-search gateway, scoped to the search tool.
    pub fn datadog_gateway_config(&self) -> StdioGatewayConfig {
        StdioGatewayConfig {
            name: "datadog".into(),
            command: self.datadog_gateway.command.clone(),
            args: self.datadog_gateway.args.clone(),
            env: vec![
                ("DD_API_KEY".into(), self.datadog.api_key.clone()),
                ("DD_APP_KEY".into(), self.datadog.app_key.clone()),
                ("DD_SITE".into(), self.datadog.site.clone()),
            ],
            tools: ToolFilter::new([SearchEvents::TOOL]),
        }
    }

    /// Work-item gateway, scoped to create and update.
    pub fn ado_gateway_config(&self) -> StdioGatewayConfig {
        let pat = self.ado.pat.clone();
        StdioGatewayConfig {
            name: "azure-devops".into(),
            command: self.ado_gateway.command.clone(),
            args: self.ado_gateway.args.clone(),
            env: vec![
                ("ADO_PAT".into(), pat.clone()),
                ("ADO_MCP_AUTH_TOKEN".into(), pat.clone()),
                ("AZURE_DEVOPS_PAT".into(), pat),
                ("AZURE_DEVOPS_AUTH_METHOD".into(), "pat".into()),
                (
                    "AZURE_DEVOPS_ORG_URL".into(),
                    format!("https://dev.azure.com/{}", self.ado.org_name),
                ),
                ("AZURE_DEVOPS_DEFAULT_PROJECT".into(), self.ado.project.clone()),
            ],
            tools: ToolFilter::new([CreateWorkItem::TOOL, UpdateWorkItem::TOOL]),
        }
    }
}

fn parse_or<T>(env: &HashMap<String, String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: format!("'{raw}': {e}"),
        }),
    }
}

fn command(
    env: &HashMap<String, String>,
    command_key: &'static str,
    args_key: &'static str,
    default_command: &str,
    default_args: Vec<String>,
) -> Result<GatewayCommand, ConfigError> {
    let command = env
        .get(command_key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .unwrap_or(default_command)
        .to_string();
    let args = match env.get(args_key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => default_args,
        Some(raw) => shlex::split(raw).ok_or_else(|| ConfigError::Invalid {
            key: args_key,
            message: "unbalanced quotes".into(),
        })?,
    };
    Ok(GatewayCommand { command, args })
}
