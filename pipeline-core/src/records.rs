use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Placeholder used in titles and tags when no service could be identified.
pub const UNKNOWN_SERVICE: &str = "unknown-service";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Work-item tracker priority: CRITICAL and HIGH share the top slot.
    pub fn work_item_priority(&self) -> u8 {
        match self {
            Severity::Critical | Severity::High => 1,
            Severity::Medium => 2,
            Severity::Low => 3,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Triage outcome. Declaration order is escalation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Ignore,
    Monitor,
    Ticket,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Ignore => "IGNORE",
            Decision::Monitor => "MONITOR",
            Decision::Ticket => "TICKET",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Absolute search window handed to the log backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// True when the end was pulled back to "now".
    pub clamped: bool,
}

impl TimeWindow {
    pub fn span(&self) -> Duration {
        self.end - self.start
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvestigationStatus {
    Complete,
    NoResults,
    Failed { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestigationRecord {
    pub alert_id: String,
    pub alert_time: DateTime<Utc>,
    /// Service and environment taken from the alert tags, `None` for wildcard.
    pub service: Option<String>,
    pub environment: Option<String>,
    pub query: String,
    pub window: TimeWindow,
    pub status: InvestigationStatus,
    pub affected_services: BTreeSet<String>,
    pub error_count: u32,
    pub first_error_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub top_error_messages: Vec<String>,
    pub stack_traces: Vec<String>,
    pub affected_hosts: BTreeSet<String>,
    pub hypothesis: String,
    pub severity_estimate: Severity,
}

impl InvestigationRecord {
    /// Time between the first and last error observed, if both are known.
    pub fn error_span(&self) -> Option<Duration> {
        match (self.first_error_at, self.last_error_at) {
            (Some(first), Some(last)) if last >= first => Some(last - first),
            _ => None,
        }
    }

    /// Service named in tickets: the alert's own service when the logs
    /// confirm it, otherwise the first affected service in sorted order.
    pub fn primary_service(&self) -> &str {
        if let Some(service) = self.service.as_deref() {
            if self.affected_services.is_empty() || self.affected_services.contains(service) {
                return service;
            }
        }
        self.affected_services
            .iter()
            .next()
            .map(String::as_str)
            .or(self.service.as_deref())
            .unwrap_or(UNKNOWN_SERVICE)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.status, InvestigationStatus::Failed { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision: Decision,
    pub reason: String,
    pub severity: Severity,
    pub priority: Priority,
    pub services_affected: Vec<String>,
    pub recommended_action: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TicketOutcome {
    NoTicket { reason: String },
    Created { ticket_id: String },
}

impl TicketOutcome {
    pub fn ticket_id(&self) -> Option<&str> {
        match self {
            TicketOutcome::Created { ticket_id } => Some(ticket_id),
            TicketOutcome::NoTicket { .. } => None,
        }
    }
}
