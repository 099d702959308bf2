//! Per-run state store threading stage outputs between stages.
//!
//! A [`RunContext`] belongs to exactly one pipeline run. Each key is owned by
//! one stage and may be written once; later stages only read it.

use crate::records::{DecisionRecord, InvestigationRecord, TicketOutcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Identity of one scheduled pipeline run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(Self)
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub user_id: String,
    pub alert_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKey {
    InvestigationReport,
    Decision,
    TicketResult,
}

impl StateKey {
    /// Every key a run writes, in stage order.
    pub const ALL: [StateKey; 3] = [StateKey::InvestigationReport, StateKey::Decision, StateKey::TicketResult];

    pub fn as_str(&self) -> &'static str {
        match self {
            StateKey::InvestigationReport => "investigation_report",
            StateKey::Decision => "decision",
            StateKey::TicketResult => "ticket_result",
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StateValue {
    Text(String),
    Investigation(InvestigationRecord),
    Decision(DecisionRecord),
    Ticket(TicketOutcome),
}

impl StateValue {
    pub fn kind(&self) -> &'static str {
        match self {
            StateValue::Text(_) => "text",
            StateValue::Investigation(_) => "investigation",
            StateValue::Decision(_) => "decision",
            StateValue::Ticket(_) => "ticket",
        }
    }

    /// Free text fits any key; a structured record only fits the key of the
    /// stage that produces it.
    fn fits(&self, key: StateKey) -> bool {
        matches!(
            (self, key),
            (StateValue::Text(_), _)
                | (StateValue::Investigation(_), StateKey::InvestigationReport)
                | (StateValue::Decision(_), StateKey::Decision)
                | (StateValue::Ticket(_), StateKey::TicketResult)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("state key `{0}` was already written in this run")]
    AlreadyWritten(StateKey),
    #[error("state key `{key}` cannot hold a {found} value")]
    WrongKind { key: StateKey, found: &'static str },
}

#[derive(Clone, Debug, Serialize)]
pub struct RunContext {
    key: RunKey,
    values: BTreeMap<StateKey, StateValue>,
}

impl RunContext {
    pub fn new(user_id: impl Into<String>, alert_id: impl Into<String>) -> Self {
        Self {
            key: RunKey {
                user_id: user_id.into(),
                alert_id: alert_id.into(),
            },
            values: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> &RunKey {
        &self.key
    }

    /// Write a stage output. Fails if the key already holds a value.
    pub fn put(&mut self, key: StateKey, value: StateValue) -> Result<(), ContextError> {
        if self.values.contains_key(&key) {
            return Err(ContextError::AlreadyWritten(key));
        }
        if !value.fits(key) {
            return Err(ContextError::WrongKind {
                key,
                found: value.kind(),
            });
        }
        self.values.insert(key, value);
        Ok(())
    }

    /// Fails if `key` already holds a value, without writing anything.
    pub fn ensure_vacant(&self, key: StateKey) -> Result<(), ContextError> {
        if self.contains(key) {
            return Err(ContextError::AlreadyWritten(key));
        }
        Ok(())
    }

    pub fn get(&self, key: StateKey) -> Option<&StateValue> {
        self.values.get(&key)
    }

    pub fn contains(&self, key: StateKey) -> bool {
        self.values.contains_key(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = StateKey> + '_ {
        self.values.keys().copied()
    }

    pub fn investigation(&self) -> Option<&InvestigationRecord> {
        match self.get(StateKey::InvestigationReport)? {
            StateValue::Investigation(record) => Some(record),
            _ => None,
        }
    }

    pub fn decision(&self) -> Option<&DecisionRecord> {
        match self.get(StateKey::Decision)? {
            StateValue::Decision(record) => Some(record),
            _ => None,
        }
    }

    pub fn ticket(&self) -> Option<&TicketOutcome> {
        match self.get(StateKey::TicketResult)? {
            StateValue::Ticket(outcome) => Some(outcome),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Decision, Priority, Severity};

    fn decision() -> DecisionRecord {
        DecisionRecord {
            decision: Decision::Ignore,
            reason: "quiet".into(),
            severity: Severity::Low,
            priority: Priority::P3,
            services_affected: vec![],
            recommended_action: "none".into(),
        }
    }

    #[test]
    fn keys_are_write_once() {
        let mut ctx = RunContext::new("datadog_webhook", "a-1");
        ctx.put(StateKey::InvestigationReport, StateValue::Text("first".into()))
            .expect("first write");
        let err = ctx
            .put(StateKey::InvestigationReport, StateValue::Text("second".into()))
            .unwrap_err();
        assert_eq!(err, ContextError::AlreadyWritten(StateKey::InvestigationReport));
        assert_eq!(
            ctx.ensure_vacant(StateKey::InvestigationReport),
            Err(ContextError::AlreadyWritten(StateKey::InvestigationReport))
        );
        assert_eq!(ctx.ensure_vacant(StateKey::Decision), Ok(()));
        assert_eq!(
            ctx.get(StateKey::InvestigationReport),
            Some(&StateValue::Text("first".into()))
        );
    }

    #[test]
    fn records_only_fit_their_own_key() {
        let mut ctx = RunContext::new("u", "a");
        let err = ctx
            .put(StateKey::TicketResult, StateValue::Decision(decision()))
            .unwrap_err();
        assert_eq!(
            err,
            ContextError::WrongKind {
                key: StateKey::TicketResult,
                found: "decision"
            }
        );
        assert!(!ctx.contains(StateKey::TicketResult));
    }

    #[test]
    fn typed_accessors_read_back_records() {
        let mut ctx = RunContext::new("u", "a");
        ctx.put(StateKey::Decision, StateValue::Decision(decision()))
            .expect("write");
        assert_eq!(ctx.decision().map(|d| d.decision), Some(Decision::Ignore));
        assert!(ctx.investigation().is_none());
        assert_eq!(ctx.keys().collect::<Vec<_>>(), vec![StateKey::Decision]);
    }

    #[test]
    fn run_key_carries_user_and_alert() {
        let ctx = RunContext::new("datadog_webhook", "alert-9");
        assert_eq!(ctx.key().user_id, "datadog_webhook");
        assert_eq!(ctx.key().alert_id, "alert-9");
    }

    #[test]
    fn run_ids_parse_back() {
        let id = RunId::new();
        assert_eq!(RunId::parse(&id.to_string()), Some(id));
        assert_eq!(RunId::parse("not-a-uuid"), None);
    }
}
