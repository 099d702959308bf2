//! Triage policy: a pure mapping from investigation findings to a bounded
//! decision. No gateway access, no clock, no randomness.

use crate::records::{
    Decision, DecisionRecord, InvestigationRecord, InvestigationStatus, Priority, Severity,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tool_effects_derive::Effectful;

/// Thresholds of the triage policy.
///
/// Rules are checked most severe first, so whenever a record could satisfy
/// both the MONITOR and the TICKET rule it is ticketed. A record that fits
/// no rule at all is also ticketed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Effectful)]
#[effect(Pure)]
pub struct TriagePolicy {
    /// Fewer errors than this (and nothing else notable) is noise.
    pub monitor_floor: u32,
    /// At or above this many errors a ticket is opened.
    pub ticket_floor: u32,
    pub critical_error_count: u32,
    pub critical_service_count: usize,
    /// First-to-last error span that counts as a sustained incident.
    #[serde(with = "minutes")]
    pub sustained_after: Duration,
    /// Lower-case substrings of error messages that indicate user impact.
    pub impact_markers: Vec<String>,
}

impl Default for TriagePolicy {
    fn default() -> Self {
        Self {
            monitor_floor: 2,
            ticket_floor: 5,
            critical_error_count: 20,
            critical_service_count: 3,
            sustained_after: Duration::minutes(10),
            impact_markers: [
                "http 500",
                "http 502",
                "http 503",
                "http 504",
                "internal server error",
                "service unavailable",
                "gateway timeout",
                "timed out",
                "timeout",
                "connection refused",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Facts about a record that the rules look at.
struct Signals<'a> {
    count: u32,
    services: usize,
    has_stack: bool,
    sustained: Option<i64>,
    impact: Option<&'a str>,
}

impl TriagePolicy {
    pub fn decide(&self, record: &InvestigationRecord) -> DecisionRecord {
        let signals = self.signals(record);
        let services_affected: Vec<String> = record.affected_services.iter().cloned().collect();

        let ticket_triggers = self.ticket_triggers(&signals);
        let (decision, severity, priority, reason, recommended_action) = if !ticket_triggers.is_empty() {
            let severity = self.ticket_severity(&signals);
            (
                Decision::Ticket,
                severity,
                ticket_priority(severity),
                capitalize(&ticket_triggers.join(", ")),
                ticket_action(severity, record),
            )
        } else if signals.count < self.monitor_floor {
            (
                Decision::Ignore,
                Severity::Low,
                Priority::P3,
                ignore_reason(record),
                ignore_action(record),
            )
        } else if signals.count < self.ticket_floor && signals.services <= 1 && signals.impact.is_none() {
            let priority = if signals.count == self.monitor_floor {
                Priority::P3
            } else {
                Priority::P2
            };
            (
                Decision::Monitor,
                Severity::Medium,
                priority,
                format!(
                    "{} errors in {} without stack traces or user impact",
                    signals.count,
                    record.primary_service()
                ),
                format!(
                    "Watch the {} error rate for the next 30 minutes; escalate if it reaches {} errors",
                    record.primary_service(),
                    self.ticket_floor
                ),
            )
        } else {
            let marker = signals.impact.unwrap_or("unknown");
            (
                Decision::Ticket,
                Severity::High,
                Priority::P1,
                format!(
                    "{} errors with evidence of user impact (\"{marker}\")",
                    signals.count
                ),
                ticket_action(Severity::High, record),
            )
        };

        DecisionRecord {
            decision,
            reason,
            severity,
            priority,
            services_affected,
            recommended_action,
        }
    }

    fn signals<'a>(&'a self, record: &InvestigationRecord) -> Signals<'a> {
        let messages: Vec<String> = record
            .top_error_messages
            .iter()
            .map(|m| m.to_lowercase())
            .collect();
        Signals {
            count: record.error_count,
            services: record.affected_services.len(),
            has_stack: !record.stack_traces.is_empty(),
            sustained: record
                .error_span()
                .filter(|span| *span >= self.sustained_after)
                .map(|span| span.num_minutes()),
            impact: self
                .impact_markers
                .iter()
                .map(String::as_str)
                .find(|marker| messages.iter().any(|m| m.contains(marker))),
        }
    }

    fn ticket_triggers(&self, s: &Signals<'_>) -> Vec<String> {
        let mut triggers = Vec::new();
        if s.count >= self.ticket_floor {
            triggers.push(format!("{} errors (threshold {})", s.count, self.ticket_floor));
        }
        if s.services > 1 {
            triggers.push(format!("{} services affected", s.services));
        }
        if s.has_stack {
            triggers.push("stack traces present".to_string());
        }
        if let Some(minutes) = s.sustained {
            triggers.push(format!("errors sustained for {minutes} minutes"));
        }
        triggers
    }

    fn ticket_severity(&self, s: &Signals<'_>) -> Severity {
        if s.count >= self.critical_error_count
            || s.services >= self.critical_service_count
            || (s.has_stack && s.sustained.is_some())
        {
            Severity::Critical
        } else {
            Severity::High
        }
    }
}

fn ticket_priority(severity: Severity) -> Priority {
    match severity {
        Severity::Critical => Priority::P0,
        _ => Priority::P1,
    }
}

fn ticket_action(severity: Severity, record: &InvestigationRecord) -> String {
    let services = if record.affected_services.is_empty() {
        record.primary_service().to_string()
    } else {
        record
            .affected_services
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    };
    match (severity, record.top_error_messages.first()) {
        (Severity::Critical, _) => {
            format!("Page the on-call engineer for {services} and start incident response immediately")
        }
        (_, Some(message)) => format!(
            "Assign to the team owning {services} and investigate the top error: {message}"
        ),
        (_, None) => format!("Assign to the team owning {services} and review the error logs"),
    }
}

fn ignore_reason(record: &InvestigationRecord) -> String {
    match &record.status {
        InvestigationStatus::NoResults => {
            "No errors found in the investigation window, possibly transient or already resolved"
                .to_string()
        }
        InvestigationStatus::Failed { reason } => {
            format!("Investigation failed ({reason}); no error evidence was collected")
        }
        InvestigationStatus::Complete => format!(
            "{} error(s) without stack traces, below the monitoring threshold",
            record.error_count
        ),
    }
}

fn ignore_action(record: &InvestigationRecord) -> String {
    if record.is_degraded() {
        "Re-run the investigation manually and check log backend connectivity".to_string()
    } else {
        "No action required; close the alert if it does not recur".to_string()
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

mod minutes {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.num_minutes())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        i64::deserialize(d).map(Duration::minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::TimeWindow;
    use chrono::DateTime;
    use std::collections::BTreeSet;
    use tool_effects::{Effect, Effectful};

    fn record(count: u32, services: &[&str], stacks: usize) -> InvestigationRecord {
        let t = DateTime::from_timestamp_millis(1_738_519_815_000).unwrap();
        InvestigationRecord {
            alert_id: "a".into(),
            alert_time: t,
            service: services.first().map(|s| s.to_string()),
            environment: None,
            query: "status:error".into(),
            window: TimeWindow { start: t, end: t, clamped: false },
            status: if count == 0 {
                InvestigationStatus::NoResults
            } else {
                InvestigationStatus::Complete
            },
            affected_services: services.iter().map(|s| s.to_string()).collect(),
            error_count: count,
            first_error_at: Some(t),
            last_error_at: Some(t + Duration::minutes(2)),
            top_error_messages: vec!["null reference in handler".into()],
            stack_traces: (0..stacks).map(|i| format!("at frame{i}")).collect(),
            affected_hosts: BTreeSet::new(),
            hypothesis: String::new(),
            severity_estimate: Severity::Medium,
        }
    }

    #[test]
    fn triage_is_pure() {
        assert_eq!(TriagePolicy::default().effect(), Effect::Pure);
    }

    #[test]
    fn same_record_same_decision() {
        let policy = TriagePolicy::default();
        let r = record(7, &["auth", "payment"], 1);
        assert_eq!(policy.decide(&r), policy.decide(&r.clone()));
    }

    #[test]
    fn five_errors_one_service_one_trace_is_a_ticket() {
        let d = TriagePolicy::default().decide(&record(5, &["payment"], 1));
        assert_eq!(d.decision, Decision::Ticket);
        assert_eq!(d.severity, Severity::High);
        assert_eq!(d.priority, Priority::P1);
        assert_eq!(d.reason, "5 errors (threshold 5), stack traces present");
    }

    #[test]
    fn empty_record_is_ignored() {
        let d = TriagePolicy::default().decide(&record(0, &[], 0));
        assert_eq!(d.decision, Decision::Ignore);
        assert_eq!((d.severity, d.priority), (Severity::Low, Priority::P3));
        assert!(d.reason.contains("possibly transient"));
        assert!(d.services_affected.is_empty());
    }

    #[test]
    fn degraded_record_is_ignored_with_rerun_advice() {
        let mut r = record(0, &[], 0);
        r.status = InvestigationStatus::Failed { reason: "timed out".into() };
        let d = TriagePolicy::default().decide(&r);
        assert_eq!(d.decision, Decision::Ignore);
        assert!(d.reason.contains("Investigation failed"));
        assert!(d.recommended_action.starts_with("Re-run"));
    }

    #[test]
    fn few_errors_in_one_service_are_monitored() {
        let policy = TriagePolicy::default();
        let borderline = policy.decide(&record(2, &["payment"], 0));
        assert_eq!(borderline.decision, Decision::Monitor);
        assert_eq!(borderline.priority, Priority::P3);
        let d = policy.decide(&record(4, &["payment"], 0));
        assert_eq!((d.decision, d.severity, d.priority), (Decision::Monitor, Severity::Medium, Priority::P2));
        assert_eq!(d.services_affected, vec!["payment"]);
    }

    #[test]
    fn user_impact_escalates_below_ticket_floor() {
        let mut r = record(3, &["payment"], 0);
        r.top_error_messages = vec!["upstream returned HTTP 503".into()];
        let d = TriagePolicy::default().decide(&r);
        assert_eq!((d.decision, d.priority), (Decision::Ticket, Priority::P1));
        assert!(d.reason.contains("http 503"));
    }

    #[test]
    fn sustained_trace_or_wide_blast_radius_is_critical() {
        let policy = TriagePolicy::default();
        let mut sustained = record(6, &["payment"], 1);
        sustained.last_error_at = sustained.first_error_at.map(|t| t + Duration::minutes(12));
        let d = policy.decide(&sustained);
        assert_eq!((d.severity, d.priority), (Severity::Critical, Priority::P0));
        assert!(d.reason.contains("sustained for 12 minutes"));

        let wide = policy.decide(&record(3, &["a", "b", "c"], 0));
        assert_eq!((wide.decision, wide.priority), (Decision::Ticket, Priority::P0));
        assert_eq!(wide.services_affected, vec!["a", "b", "c"]);
    }

    #[test]
    fn single_stray_trace_is_still_ticketed() {
        let d = TriagePolicy::default().decide(&record(1, &["payment"], 1));
        assert_eq!(d.decision, Decision::Ticket);
    }
}
