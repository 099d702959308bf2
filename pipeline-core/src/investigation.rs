//! Investigation stage: one bounded log search per alert, summarized into an
//! [`InvestigationRecord`].

use crate::error::PipelineError;
use crate::gateway::{
    CallOutcome, DEFAULT_CALL_TIMEOUT, EventRecord, SearchEvents, ToolGateway, call_with_policy,
};
use crate::hypothesis::{HypothesisWriter, RuleBasedHypothesis};
use crate::records::{InvestigationRecord, InvestigationStatus, Severity, TimeWindow};
use alert_registry::Alert;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on records per search, imposed by the backend's rate limits.
pub const MAX_SEARCH_LIMIT: u32 = 50;
pub const DEFAULT_SEARCH_LIMIT: u32 = MAX_SEARCH_LIMIT;

pub const LOOKBACK_MINUTES: i64 = 15;
pub const LOOKAHEAD_MINUTES: i64 = 5;

const TOP_MESSAGES: usize = 3;
const MAX_STACK_TRACES: usize = 3;
const STACK_EXCERPT_LINES: usize = 12;
const MESSAGE_MAX_CHARS: usize = 240;

pub struct InvestigationStage {
    gateway: Arc<dyn ToolGateway>,
    hypothesis: Arc<dyn HypothesisWriter>,
    search_limit: u32,
    timeout: Duration,
}

impl InvestigationStage {
    pub fn new(gateway: Arc<dyn ToolGateway>) -> Self {
        Self {
            gateway,
            hypothesis: Arc::new(RuleBasedHypothesis),
            search_limit: DEFAULT_SEARCH_LIMIT,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Result cap for the search call, clamped to `1..=MAX_SEARCH_LIMIT`.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.search_limit = limit.clamp(1, MAX_SEARCH_LIMIT);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_hypothesis(mut self, writer: Arc<dyn HypothesisWriter>) -> Self {
        self.hypothesis = writer;
        self
    }

    pub fn search_limit(&self) -> u32 {
        self.search_limit
    }

    pub async fn investigate(&self, alert: &Alert) -> Result<InvestigationRecord, PipelineError> {
        self.investigate_at(alert, Utc::now()).await
    }

    /// Same as [`investigate`](Self::investigate) with an explicit "now",
    /// which only affects clamping of the window end.
    pub async fn investigate_at(
        &self,
        alert: &Alert,
        now: DateTime<Utc>,
    ) -> Result<InvestigationRecord, PipelineError> {
        let alert_time = DateTime::from_timestamp_millis(alert.timestamp_ms()).unwrap_or_else(|| {
            warn!(alert_id = alert.id(), timestamp = alert.timestamp_ms(), "alert timestamp out of range, using now");
            now
        });
        let service = scoped_tag(alert, "service");
        let environment = scoped_tag(alert, "env");
        let query = build_query(service.as_deref(), environment.as_deref());
        let window = search_window(alert_time, now);

        let search = SearchEvents {
            query: query.clone(),
            time_from: window.start,
            time_to: window.end,
            limit: self.search_limit,
        };
        debug!(alert_id = alert.id(), query = %query, clamped = window.clamped, "searching error logs");

        let mut record = InvestigationRecord {
            alert_id: alert.id().to_string(),
            alert_time,
            service,
            environment,
            query,
            window,
            status: InvestigationStatus::Complete,
            affected_services: BTreeSet::new(),
            error_count: 0,
            first_error_at: None,
            last_error_at: None,
            top_error_messages: Vec::new(),
            stack_traces: Vec::new(),
            affected_hosts: BTreeSet::new(),
            hypothesis: String::new(),
            severity_estimate: Severity::Low,
        };

        match call_with_policy(self.gateway.as_ref(), &search, self.timeout).await {
            CallOutcome::Completed(events) if events.is_empty() => {
                record.status = InvestigationStatus::NoResults;
            }
            CallOutcome::Completed(events) => summarize(&mut record, &events),
            CallOutcome::Degraded(err) => {
                record.status = InvestigationStatus::Failed {
                    reason: err.to_string(),
                };
            }
            CallOutcome::Failed(err) => return Err(PipelineError::Gateway(err)),
        }

        record.severity_estimate = estimate_severity(&record);
        record.hypothesis = self.write_hypothesis(&record).await;

        info!(
            alert_id = %record.alert_id,
            error_count = record.error_count,
            services = record.affected_services.len(),
            severity = %record.severity_estimate,
            degraded = record.is_degraded(),
            "investigation complete"
        );
        Ok(record)
    }

    async fn write_hypothesis(&self, record: &InvestigationRecord) -> String {
        match self.hypothesis.hypothesize(record).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => RuleBasedHypothesis::describe(record),
            Err(err) => {
                warn!(alert_id = %record.alert_id, error = %err, "hypothesis writer failed, using rule-based text");
                RuleBasedHypothesis::describe(record)
            }
        }
    }
}

/// Tag value for `key`, with `*` read as "not scoped".
fn scoped_tag(alert: &Alert, key: &str) -> Option<String> {
    alert
        .tag_value(key)
        .filter(|v| *v != "*")
        .map(ToString::to_string)
}

/// Error-log query scoped to whatever the alert names.
pub fn build_query(service: Option<&str>, environment: Option<&str>) -> String {
    let mut query = String::from("status:error");
    if let Some(service) = service {
        query.push_str(" service:");
        query.push_str(service);
    }
    if let Some(env) = environment {
        query.push_str(" env:");
        query.push_str(env);
    }
    query
}

/// `[alert − 15min, alert + 5min]`, with the end pulled back to `now` when
/// it lies in the future. An alert stamped after `now` is anchored at `now`,
/// so the window never lies entirely ahead of the clock.
pub fn search_window(alert_time: DateTime<Utc>, now: DateTime<Utc>) -> TimeWindow {
    let anchor = alert_time.min(now);
    let start = anchor
        .checked_sub_signed(ChronoDuration::minutes(LOOKBACK_MINUTES))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let end = anchor
        .checked_add_signed(ChronoDuration::minutes(LOOKAHEAD_MINUTES))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    if end > now {
        TimeWindow {
            start,
            end: now,
            clamped: true,
        }
    } else {
        TimeWindow {
            start,
            end,
            clamped: false,
        }
    }
}

fn summarize(record: &mut InvestigationRecord, events: &[EventRecord]) {
    record.error_count = u32::try_from(events.len()).unwrap_or(u32::MAX);

    for event in events {
        if let Some(service) = &event.service {
            record.affected_services.insert(service.clone());
        }
        if let Some(host) = &event.host {
            record.affected_hosts.insert(host.clone());
        }
        if let Some(ts) = event.timestamp {
            record.first_error_at = Some(record.first_error_at.map_or(ts, |t| t.min(ts)));
            record.last_error_at = Some(record.last_error_at.map_or(ts, |t| t.max(ts)));
        }
    }
    if record.affected_services.is_empty() {
        if let Some(service) = &record.service {
            record.affected_services.insert(service.clone());
        }
    }

    record.top_error_messages = top_messages(events);
    record.stack_traces = events
        .iter()
        .filter_map(|e| e.stack_trace.as_deref())
        .map(excerpt)
        .fold(Vec::new(), |mut acc, trace| {
            if acc.len() < MAX_STACK_TRACES && !acc.contains(&trace) {
                acc.push(trace);
            }
            acc
        });
}

/// Most frequent messages first; ties keep first-seen order.
fn top_messages(events: &[EventRecord]) -> Vec<String> {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (pos, event) in events.iter().enumerate() {
        let message = event.message.trim();
        if message.is_empty() {
            continue;
        }
        counts.entry(message).or_insert((0, pos)).0 += 1;
    }
    let mut ranked: Vec<(&str, usize, usize)> =
        counts.into_iter().map(|(m, (n, first))| (m, n, first)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked
        .into_iter()
        .take(TOP_MESSAGES)
        .map(|(m, _, _)| truncate_chars(m, MESSAGE_MAX_CHARS))
        .collect()
}

fn excerpt(trace: &str) -> String {
    let lines: Vec<&str> = trace.lines().collect();
    if lines.len() <= STACK_EXCERPT_LINES {
        return trace.trim_end().to_string();
    }
    let mut out = lines[..STACK_EXCERPT_LINES].join("\n");
    out.push_str(&format!("\n... ({} more lines)", lines.len() - STACK_EXCERPT_LINES));
    out
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn estimate_severity(record: &InvestigationRecord) -> Severity {
    let count = record.error_count;
    let services = record.affected_services.len();
    let has_stack = !record.stack_traces.is_empty();
    if count == 0 || (count < 2 && !has_stack) {
        Severity::Low
    } else if count >= 20 || services >= 3 {
        Severity::Critical
    } else if count >= 5 || has_stack || services > 1 {
        Severity::High
    } else {
        Severity::Medium
    }
}
