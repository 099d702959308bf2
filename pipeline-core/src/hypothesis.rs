//! Root-cause hypothesis text for an investigation record.
//!
//! The investigation stage only depends on [`HypothesisWriter`]. The
//! rule-based writer is deterministic and always available; the LLM writer
//! is optional and its failures fall back to the rule-based text.

use crate::records::{InvestigationRecord, InvestigationStatus};
use async_trait::async_trait;
use rig::client::{ProviderClient, completion::CompletionClient};
use rig::completion::Prompt;
use rig::providers::openai;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub const NO_RESULTS_HYPOTHESIS: &str = "No error logs found in the specified time range; \
     the alert is possibly transient or already resolved.";

#[derive(Debug, Error)]
pub enum HypothesisError {
    #[error("unsupported llm provider '{0}'")]
    UnsupportedProvider(String),
    #[error("missing env var {0}")]
    MissingKey(String),
    #[error("openai client error: {0}")]
    Client(String),
    #[error("llm prompt failed: {0}")]
    Prompt(String),
    #[error("invalid llm hypothesis: {0}")]
    Parse(String),
}

#[async_trait]
pub trait HypothesisWriter: Send + Sync {
    async fn hypothesize(&self, record: &InvestigationRecord) -> Result<String, HypothesisError>;
}

/// Deterministic summary of what the logs show.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuleBasedHypothesis;

impl RuleBasedHypothesis {
    pub fn describe(record: &InvestigationRecord) -> String {
        match &record.status {
            InvestigationStatus::NoResults => NO_RESULTS_HYPOTHESIS.to_string(),
            InvestigationStatus::Failed { reason } => format!(
                "Log investigation failed ({reason}); no evidence could be collected. \
                 Treat the alert as unverified."
            ),
            InvestigationStatus::Complete => describe_findings(record),
        }
    }
}

#[async_trait]
impl HypothesisWriter for RuleBasedHypothesis {
    async fn hypothesize(&self, record: &InvestigationRecord) -> Result<String, HypothesisError> {
        Ok(Self::describe(record))
    }
}

fn describe_findings(record: &InvestigationRecord) -> String {
    let services = record
        .affected_services
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>();
    let mut text = match services.as_slice() {
        [] => format!("{} error log(s) without a service attribution", record.error_count),
        [one] => format!("{} error log(s) from {one}", record.error_count),
        many => format!(
            "{} error log(s) across {} services ({})",
            record.error_count,
            many.len(),
            many.join(", ")
        ),
    };

    if let Some(message) = record.top_error_messages.first() {
        text.push_str(&format!("; most frequent error: \"{message}\""));
    }
    if let Some(frame) = record
        .stack_traces
        .first()
        .and_then(|trace| trace.lines().map(str::trim).find(|l| !l.is_empty()))
    {
        text.push_str(&format!("; failing code path starts at `{frame}`"));
    }
    match record.affected_hosts.len() {
        0 => {}
        1 => text.push_str("; confined to a single host, likely an instance-level fault"),
        n => text.push_str(&format!("; spread over {n} hosts, likely a shared dependency or deploy")),
    }
    if let Some(span) = record.error_span().filter(|s| s.num_minutes() > 0) {
        text.push_str(&format!("; errors continued for {} minute(s)", span.num_minutes()));
    }
    text.push('.');
    text
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            temperature: 0.2,
        }
    }
}

impl LlmConfig {
    /// Reads `LLM_*` settings. Returns `None` when the key variable is unset.
    pub fn from_lookup(lookup: &HashMap<String, String>) -> Option<Self> {
        let defaults = Self::default();
        let api_key_env = lookup
            .get("LLM_API_KEY_ENV")
            .cloned()
            .unwrap_or(defaults.api_key_env);
        if !lookup.contains_key(&api_key_env) {
            return None;
        }
        Some(Self {
            provider: lookup.get("LLM_PROVIDER").cloned().unwrap_or(defaults.provider),
            model: lookup.get("LLM_MODEL").cloned().unwrap_or(defaults.model),
            api_key_env,
            temperature: lookup
                .get("LLM_TEMPERATURE")
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(defaults.temperature),
        })
    }
}

/// Asks a completion model for a one-paragraph hypothesis over the record.
pub struct LlmHypothesis {
    config: LlmConfig,
}

impl LlmHypothesis {
    pub fn new(config: LlmConfig) -> Self {
        Self { config }
    }

    fn prompt(record: &InvestigationRecord) -> Result<String, HypothesisError> {
        let findings = serde_json::json!({
            "affected_services": record.affected_services,
            "error_count": record.error_count,
            "top_error_messages": record.top_error_messages,
            "stack_traces": record.stack_traces,
            "affected_hosts": record.affected_hosts,
            "first_error_at": record.first_error_at,
            "last_error_at": record.last_error_at,
        });
        Ok(format!(
            "Analyze the error log findings and return JSON only.\n\
             Schema: {{\"hypothesis\":\"string\"}}\n\
             Findings:\n{}",
            serde_json::to_string_pretty(&findings)
                .map_err(|e| HypothesisError::Parse(e.to_string()))?
        ))
    }
}

#[async_trait]
impl HypothesisWriter for LlmHypothesis {
    async fn hypothesize(&self, record: &InvestigationRecord) -> Result<String, HypothesisError> {
        if record.error_count == 0 {
            return Ok(RuleBasedHypothesis::describe(record));
        }
        let prompt = Self::prompt(record)?;
        let raw = run_prompt(&self.config, "You are an incident investigator.", &prompt).await?;
        parse_hypothesis(&raw)
    }
}

async fn run_prompt(
    config: &LlmConfig,
    preamble: &str,
    prompt: &str,
) -> Result<String, HypothesisError> {
    if config.provider.to_lowercase() != "openai" {
        return Err(HypothesisError::UnsupportedProvider(config.provider.clone()));
    }

    let client = if config.api_key_env == "OPENAI_API_KEY" {
        openai::Client::from_env()
    } else {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| HypothesisError::MissingKey(config.api_key_env.clone()))?;
        openai::Client::new(&api_key).map_err(|e| HypothesisError::Client(e.to_string()))?
    };

    let agent = client
        .agent(&config.model)
        .preamble(preamble)
        .temperature(config.temperature)
        .build();

    agent
        .prompt(prompt)
        .await
        .map_err(|e| HypothesisError::Prompt(e.to_string()))
}

fn parse_hypothesis(raw: &str) -> Result<String, HypothesisError> {
    // Models sometimes wrap JSON in a fenced block.
    let trimmed = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let v: serde_json::Value =
        serde_json::from_str(trimmed).map_err(|e| HypothesisError::Parse(e.to_string()))?;
    v.get("hypothesis")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| HypothesisError::Parse("missing hypothesis field".into()))
}
