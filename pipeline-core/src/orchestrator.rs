//! Pipeline orchestrator: runs investigation, triage and action in strict
//! sequence over one [`RunContext`], guarded by an explicit state machine.
//!
//! ```text
//! INVESTIGATING → DECIDING → ACTING → DONE
//!       └────────────┴──────────┴────→ FAILED
//! ```
//!
//! Each stage runs at most once and its output is written to the context
//! before the next state is entered. Nothing is retried.

use crate::action::ActionStage;
use crate::context::{RunContext, RunId, RunKey, StateKey, StateValue};
use crate::decision::TriagePolicy;
use crate::error::PipelineError;
use crate::event_log::{Event, EventLog, EventType};
use crate::investigation::InvestigationStage;
use crate::records::TicketOutcome;
use alert_registry::Alert;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tool_effects::Effectful;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Investigating,
    Deciding,
    Acting,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Investigating => "INVESTIGATING",
            Self::Deciding => "DECIDING",
            Self::Acting => "ACTING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_legal_transition(from: RunState, to: RunState) -> bool {
    use RunState::*;

    if to == Failed && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Investigating, Deciding) | (Deciding, Acting) | (Acting, Done)
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: RunState,
    pub to: RunState,
    /// Milliseconds since the run started.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct RunStateMachine {
    current: RunState,
    started_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            current: RunState::Investigating,
            started_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> RunState {
        self.current
    }

    pub fn advance(&mut self, to: RunState, reason: Option<&str>) -> Result<(), PipelineError> {
        if !is_legal_transition(self.current, to) {
            return Err(PipelineError::IllegalTransition {
                from: self.current,
                to,
            });
        }
        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            elapsed_ms: u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            reason: reason.map(ToString::to_string),
        });
        self.current = to;
        Ok(())
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    fn into_transitions(self) -> Vec<TransitionRecord> {
        self.transitions
    }
}

/// Everything known about a run once it reached a terminal state.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: RunId,
    pub key: RunKey,
    pub state: RunState,
    pub context: RunContext,
    pub transitions: Vec<TransitionRecord>,
    pub failure: Option<PipelineError>,
}

impl RunReport {
    pub fn ticket(&self) -> Option<&TicketOutcome> {
        self.context.ticket()
    }
}

pub struct Pipeline {
    investigation: InvestigationStage,
    triage: TriagePolicy,
    action: ActionStage,
    archive: Option<EventLog>,
}

impl Pipeline {
    pub fn new(investigation: InvestigationStage, triage: TriagePolicy, action: ActionStage) -> Self {
        Self {
            investigation,
            triage,
            action,
            archive: None,
        }
    }

    /// Archive run events to `log`.
    pub fn with_archive(mut self, log: EventLog) -> Self {
        self.archive = Some(log);
        self
    }

    pub async fn run(&self, run_id: RunId, alert: &Alert, mut ctx: RunContext) -> RunReport {
        let mut machine = RunStateMachine::new();
        info!(%run_id, alert_id = alert.id(), user_id = %ctx.key().user_id, "pipeline run started");
        self.archive(
            run_id,
            alert.id(),
            EventType::RunStarted,
            format!("run started for alert '{}'", alert.title()),
            serde_json::to_value(ctx.key()).ok(),
        )
        .await;

        let failure = match self.drive(run_id, &mut machine, alert, &mut ctx).await {
            Ok(()) => {
                info!(
                    %run_id,
                    alert_id = alert.id(),
                    decision = ?ctx.decision().map(|d| d.decision),
                    ticket_id = ?ctx.ticket().and_then(TicketOutcome::ticket_id),
                    "pipeline run done"
                );
                self.archive(run_id, alert.id(), EventType::RunCompleted, "run completed".into(), None)
                    .await;
                None
            }
            Err(err) => {
                let failed_in = machine.current();
                if let Err(illegal) = machine.advance(RunState::Failed, Some(&err.to_string())) {
                    warn!(%run_id, error = %illegal, "could not record failed state");
                }
                error!(
                    %run_id,
                    alert_id = alert.id(),
                    state = %failed_in,
                    decision = ?ctx.decision().map(|d| d.decision),
                    error = %err,
                    "pipeline run failed"
                );
                self.archive(
                    run_id,
                    alert.id(),
                    EventType::RunFailed,
                    err.to_string(),
                    Some(serde_json::json!({
                        "state": failed_in,
                        "decision": ctx.decision().map(|d| d.decision),
                    })),
                )
                .await;
                Some(err)
            }
        };

        RunReport {
            run_id,
            key: ctx.key().clone(),
            state: machine.current(),
            context: ctx,
            transitions: machine.into_transitions(),
            failure,
        }
    }

    async fn drive(
        &self,
        run_id: RunId,
        machine: &mut RunStateMachine,
        alert: &Alert,
        ctx: &mut RunContext,
    ) -> Result<(), PipelineError> {
        // Keys written before the run fail it before any tool call.
        for key in StateKey::ALL {
            ctx.ensure_vacant(key)?;
        }
        let record = self.investigation.investigate(alert).await?;
        self.write(run_id, alert, ctx, StateKey::InvestigationReport, StateValue::Investigation(record))
            .await?;
        self.enter(run_id, machine, RunState::Deciding)?;

        debug!(%run_id, effect = %self.triage.effect(), "applying triage policy");
        let record = ctx
            .investigation()
            .ok_or(PipelineError::MissingRecord(StateKey::InvestigationReport))?;
        let decision = self.triage.decide(record);
        self.write(run_id, alert, ctx, StateKey::Decision, StateValue::Decision(decision))
            .await?;
        self.enter(run_id, machine, RunState::Acting)?;

        let record = ctx
            .investigation()
            .ok_or(PipelineError::MissingRecord(StateKey::InvestigationReport))?;
        let decision = ctx
            .decision()
            .ok_or(PipelineError::MissingRecord(StateKey::Decision))?;
        let outcome = self.action.act(decision, record).await?;
        let (event_type, description) = match &outcome {
            TicketOutcome::Created { ticket_id } => (EventType::TicketCreated, format!("work item {ticket_id} created")),
            TicketOutcome::NoTicket { reason } => (EventType::NoTicket, reason.clone()),
        };
        self.write(run_id, alert, ctx, StateKey::TicketResult, StateValue::Ticket(outcome))
            .await?;
        self.archive(run_id, alert.id(), event_type, description, None).await;
        self.enter(run_id, machine, RunState::Done)
    }

    async fn write(
        &self,
        run_id: RunId,
        alert: &Alert,
        ctx: &mut RunContext,
        key: StateKey,
        value: StateValue,
    ) -> Result<(), PipelineError> {
        let details = serde_json::to_value(&value).ok();
        ctx.put(key, value)?;
        self.archive(
            run_id,
            alert.id(),
            EventType::StageCompleted,
            format!("{key} written"),
            details,
        )
        .await;
        Ok(())
    }

    fn enter(&self, run_id: RunId, machine: &mut RunStateMachine, to: RunState) -> Result<(), PipelineError> {
        let from = machine.current();
        machine.advance(to, None)?;
        debug!(%run_id, %from, state = %to, "run transition");
        Ok(())
    }

    /// Best effort: archive failures are logged and never fail the run.
    async fn archive(
        &self,
        run_id: RunId,
        alert_id: &str,
        event_type: EventType,
        description: String,
        details: Option<serde_json::Value>,
    ) {
        let Some(log) = self.archive.clone() else {
            return;
        };
        let event = Event {
            id: None,
            alert_id: alert_id.to_string(),
            run_id: run_id.to_string(),
            event_type,
            description,
            details,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        match tokio::task::spawn_blocking(move || log.append(&event)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(%run_id, error = %err, "event log append failed"),
            Err(err) => warn!(%run_id, error = %err, "event log task failed"),
        }
    }
}
