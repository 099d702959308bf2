use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Alerts stamped below this value are taken to be epoch seconds.
/// Datadog's `$DATE` template variable has shipped both units.
const EPOCH_MS_FLOOR: i64 = 100_000_000_000;
/// 9999-12-31T23:59:59.999Z. Later stamps cannot be turned into a search window.
const EPOCH_MS_CEILING: i64 = 253_402_300_799_999;

/// Alert document as delivered by the monitor webhook.
///
/// Field names follow the canonical schema; the Datadog template names
/// (`alert_type`, `date`) are accepted as aliases.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlertPayload {
    pub id: String,
    #[serde(alias = "alert_type")]
    pub category: String,
    pub title: String,
    #[serde(alias = "date")]
    pub timestamp: i64,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A validated alert. Immutable for the lifetime of a pipeline run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Alert {
    id: String,
    category: String,
    title: String,
    timestamp_ms: i64,
    body: String,
    tags: Vec<String>,
}

impl Alert {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Epoch milliseconds.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Value of the first `key:value` tag whose key matches, ignoring case.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags.iter().find_map(|tag| {
            let (k, v) = tag.split_once(':')?;
            let v = v.trim();
            (k.trim().eq_ignore_ascii_case(key) && !v.is_empty()).then_some(v)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed alert document: {0}")]
    Malformed(String),
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("timestamp must be positive, got {0}")]
    InvalidTimestamp(i64),
    #[error("timestamp {0} is beyond the year 9999")]
    TimestampOutOfRange(i64),
    #[error("tag at position {0} is empty")]
    EmptyTag(usize),
}

pub fn validate_alert(payload: AlertPayload) -> Result<Alert, ValidationError> {
    if payload.id.trim().is_empty() {
        return Err(ValidationError::MissingField("id"));
    }
    if payload.category.trim().is_empty() {
        return Err(ValidationError::MissingField("category"));
    }
    if payload.title.trim().is_empty() {
        return Err(ValidationError::MissingField("title"));
    }
    if payload.timestamp <= 0 {
        return Err(ValidationError::InvalidTimestamp(payload.timestamp));
    }
    if let Some(pos) = payload.tags.iter().position(|t| t.trim().is_empty()) {
        return Err(ValidationError::EmptyTag(pos));
    }

    let timestamp_ms = if payload.timestamp < EPOCH_MS_FLOOR {
        payload.timestamp.saturating_mul(1000)
    } else {
        payload.timestamp
    };
    if timestamp_ms > EPOCH_MS_CEILING {
        return Err(ValidationError::TimestampOutOfRange(payload.timestamp));
    }

    Ok(Alert {
        id: payload.id.trim().to_string(),
        category: payload.category,
        title: payload.title,
        timestamp_ms,
        body: payload.body,
        tags: payload.tags,
    })
}

/// Parse and validate a raw JSON alert document.
pub fn parse_alert(value: serde_json::Value) -> Result<Alert, ValidationError> {
    let payload: AlertPayload =
        serde_json::from_value(value).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    validate_alert(payload)
}
