//! Action stage: turns a TICKET decision into exactly one work-item creation
//! call. Any other decision is acknowledged without touching the gateway.

use crate::error::PipelineError;
use crate::gateway::{CallOutcome, CreateWorkItem, DEFAULT_CALL_TIMEOUT, ToolGateway, call_with_policy};
use crate::records::{Decision, DecisionRecord, InvestigationRecord, TicketOutcome};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub const DEFAULT_WORK_ITEM_TYPE: &str = "Bug";
pub const DEFAULT_SITE: &str = "datadoghq.com";
const TAG_PREFIX: &str = "incident; datadog; automated";
const TITLE_BRIEF_CHARS: usize = 80;

pub const FIELD_TITLE: &str = "System.Title";
pub const FIELD_DESCRIPTION: &str = "System.Description";
pub const FIELD_PRIORITY: &str = "Microsoft.VSTS.Common.Priority";
pub const FIELD_TAGS: &str = "System.Tags";
pub const FIELD_REPRO_STEPS: &str = "Microsoft.VSTS.TCM.ReproSteps";

/// Rendered work item. Rendering is deterministic in its inputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItemPayload {
    pub title: String,
    pub description: String,
    pub priority: u8,
    pub tags: String,
    pub repro_steps: String,
}

impl WorkItemPayload {
    pub fn fields(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (FIELD_TITLE.to_string(), self.title.clone()),
            (FIELD_DESCRIPTION.to_string(), self.description.clone()),
            (FIELD_PRIORITY.to_string(), self.priority.to_string()),
            (FIELD_TAGS.to_string(), self.tags.clone()),
            (FIELD_REPRO_STEPS.to_string(), self.repro_steps.clone()),
        ])
    }
}

pub struct ActionStage {
    gateway: Arc<dyn ToolGateway>,
    project: String,
    work_item_type: String,
    site: String,
    timeout: Duration,
}

impl ActionStage {
    pub fn new(gateway: Arc<dyn ToolGateway>, project: impl Into<String>) -> Self {
        Self {
            gateway,
            project: project.into(),
            work_item_type: DEFAULT_WORK_ITEM_TYPE.to_string(),
            site: DEFAULT_SITE.to_string(),
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_work_item_type(mut self, work_item_type: impl Into<String>) -> Self {
        self.work_item_type = work_item_type.into();
        self
    }

    /// Datadog site used for links, e.g. `datadoghq.eu`.
    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site = site.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn act(
        &self,
        decision: &DecisionRecord,
        record: &InvestigationRecord,
    ) -> Result<TicketOutcome, PipelineError> {
        if decision.decision != Decision::Ticket {
            return Ok(TicketOutcome::NoTicket {
                reason: format!(
                    "No ticket created - {}. Recommended action: {}",
                    decision.reason, decision.recommended_action
                ),
            });
        }

        let payload = self.render(decision, record);
        let create = CreateWorkItem {
            project: self.project.clone(),
            work_item_type: self.work_item_type.clone(),
            fields: payload.fields(),
        };

        match call_with_policy(self.gateway.as_ref(), &create, self.timeout).await {
            CallOutcome::Completed(item) => {
                info!(
                    alert_id = %record.alert_id,
                    ticket_id = %item.id,
                    project = %self.project,
                    "work item created"
                );
                Ok(TicketOutcome::Created { ticket_id: item.id })
            }
            CallOutcome::Degraded(err) | CallOutcome::Failed(err) => {
                error!(alert_id = %record.alert_id, error = %err, title = %payload.title, "work item creation failed");
                Err(PipelineError::TicketCreation(err))
            }
        }
    }

    pub fn render(&self, decision: &DecisionRecord, record: &InvestigationRecord) -> WorkItemPayload {
        let service = record.primary_service();
        let logs_url = logs_link(&self.site, record);
        WorkItemPayload {
            title: format!("[INCIDENT] {service}: {}", brief(decision, record)),
            description: self.description(decision, record, &logs_url),
            priority: decision.severity.work_item_priority(),
            tags: format!("{TAG_PREFIX}; {service}"),
            repro_steps: repro_steps(record),
        }
    }

    fn description(&self, decision: &DecisionRecord, record: &InvestigationRecord, logs_url: &str) -> String {
        let services = if decision.services_affected.is_empty() {
            record.primary_service().to_string()
        } else {
            decision.services_affected.join(", ")
        };

        let mut html = String::new();
        html.push_str("<h2>Incident Summary</h2>\n");
        html.push_str("<p><strong>Alert Source:</strong> Datadog Monitor</p>\n");
        html.push_str(&format!("<p><strong>Alert ID:</strong> {}</p>\n", escape(&record.alert_id)));
        html.push_str(&format!("<p><strong>Detection Time:</strong> {}</p>\n", iso(record.alert_time)));
        html.push_str(&format!("<p><strong>Services Affected:</strong> {}</p>\n", escape(&services)));
        html.push_str(&format!(
            "<p><strong>Severity:</strong> {} ({})</p>\n",
            decision.severity, decision.priority
        ));
        html.push_str(&format!("<p><strong>Decision:</strong> {}</p>\n", escape(&decision.reason)));

        html.push_str("<h2>Investigation Findings</h2>\n");
        html.push_str(&format!("<p><strong>Error Count:</strong> {}</p>\n", record.error_count));
        html.push_str(&format!(
            "<p><strong>Time Window:</strong> {} - {}</p>\n",
            iso(record.window.start),
            iso(record.window.end)
        ));
        if !record.affected_hosts.is_empty() {
            let hosts = record.affected_hosts.iter().map(String::as_str).collect::<Vec<_>>();
            html.push_str(&format!("<p><strong>Hosts:</strong> {}</p>\n", escape(&hosts.join(", "))));
        }
        if !record.top_error_messages.is_empty() {
            html.push_str("<h3>Error Messages</h3>\n<ul>\n");
            for message in &record.top_error_messages {
                html.push_str(&format!("  <li>{}</li>\n", escape(message)));
            }
            html.push_str("</ul>\n");
        }
        if let Some(trace) = record.stack_traces.first() {
            html.push_str(&format!("<h3>Stack Trace</h3>\n<pre>{}</pre>\n", escape(trace)));
        }

        html.push_str("<h2>Root Cause Analysis</h2>\n");
        html.push_str(&format!("<p>{}</p>\n", escape(&record.hypothesis)));

        html.push_str("<h2>Recommended Actions</h2>\n<ol>\n");
        html.push_str(&format!("  <li>{}</li>\n", escape(&decision.recommended_action)));
        html.push_str(&format!(
            "  <li>Check recent deployments and configuration changes of {}</li>\n",
            escape(record.primary_service())
        ));
        html.push_str("  <li>Review the full error logs for patterns beyond the top messages</li>\n</ol>\n");

        html.push_str("<h2>Links</h2>\n<ul>\n");
        html.push_str(&format!("  <li><a href=\"{}\">Datadog Logs</a></li>\n", escape(logs_url)));
        html.push_str(&format!(
            "  <li><a href=\"https://app.{}/monitors/manage\">Monitor Dashboard</a></li>\n",
            escape(&self.site)
        ));
        html.push_str("</ul>");
        html
    }
}

/// Short error description for the title.
fn brief(decision: &DecisionRecord, record: &InvestigationRecord) -> String {
    let text = record
        .top_error_messages
        .first()
        .map(String::as_str)
        .unwrap_or(decision.reason.as_str());
    let line = text.lines().next().unwrap_or_default().trim();
    match line.char_indices().nth(TITLE_BRIEF_CHARS) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}

fn repro_steps(record: &InvestigationRecord) -> String {
    let mut html = String::from("<h3>How to Reproduce/Investigate</h3>\n<ol>\n");
    html.push_str("  <li>Go to Datadog Logs Explorer</li>\n");
    html.push_str(&format!("  <li>Search: {}</li>\n", escape(&record.query)));
    html.push_str(&format!(
        "  <li>Time range: {} - {}</li>\n",
        iso(record.window.start),
        iso(record.window.end)
    ));
    html.push_str("  <li>Review error patterns and stack traces</li>\n</ol>");
    html
}

/// Logs explorer link for the exact query and window that was searched.
pub fn logs_link(site: &str, record: &InvestigationRecord) -> String {
    format!(
        "https://app.{site}/logs?query={}&from_ts={}&to_ts={}",
        encode_component(&record.query),
        record.window.start.timestamp_millis(),
        record.window.end.timestamp_millis()
    )
}

fn iso(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => {
                out.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    out
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
