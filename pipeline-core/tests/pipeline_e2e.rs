use alert_registry::{Alert, parse_alert};
use pipeline_core::action::ActionStage;
use pipeline_core::context::{ContextError, RunContext, RunId, StateKey, StateValue};
use pipeline_core::decision::TriagePolicy;
use pipeline_core::error::PipelineError;
use pipeline_core::event_log::{EventLog, EventType};
use pipeline_core::gateway::{Capability, CreateWorkItem, ScriptedGateway, SearchEvents};
use pipeline_core::investigation::InvestigationStage;
use pipeline_core::orchestrator::{Pipeline, RunState};
use pipeline_core::records::{Decision, Priority, TicketOutcome};
use serde_json::{Value, json};
use std::sync::Arc;

const ALERT_MS: i64 = 1_738_519_815_000;

fn alert(tags: &[&str]) -> Alert {
    parse_alert(json!({
        "id": "1234567890",
        "alert_type": "error",
        "title": "High error rate on payment",
        "date": ALERT_MS,
        "body": "Error count above threshold",
        "tags": tags,
    }))
    .expect("valid alert")
}

fn log(service: &str, host: &str, message: &str, offset_secs: i64) -> Value {
    let ts = chrono::DateTime::from_timestamp_millis(ALERT_MS + offset_secs * 1000).unwrap();
    json!({
        "id": format!("log-{service}-{offset_secs}"),
        "attributes": {
            "timestamp": ts.to_rfc3339(),
            "service": service,
            "host": host,
            "status": "error",
            "message": message,
        }
    })
}

/// Seven error logs across payment and ledger, one carrying a stack trace.
fn scenario_a_logs() -> Value {
    let mut logs = vec![
        log("payment", "pay-1", "Charge failed: ledger returned 503", -300),
        log("payment", "pay-2", "Charge failed: ledger returned 503", -240),
        log("payment", "pay-1", "Charge failed: ledger returned 503", -200),
        log("ledger", "led-1", "Connection pool exhausted", -180),
        log("payment", "pay-2", "Charge failed: ledger returned 503", -120),
        log("ledger", "led-1", "Connection pool exhausted", -60),
        log("payment", "pay-1", "Retry budget exceeded", 0),
    ];
    logs[3]["attributes"]["error"] = json!({
        "stack": "PoolTimeoutError: pool exhausted\n    at Pool.acquire (pool.js:88)\n    at Ledger.post (ledger.js:42)"
    });
    Value::Array(logs)
}

fn pipeline(gateway: &ScriptedGateway) -> Pipeline {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
    let gateway = Arc::new(gateway.clone());
    Pipeline::new(
        InvestigationStage::new(gateway.clone()),
        TriagePolicy::default(),
        ActionStage::new(gateway, "MIRA"),
    )
}

#[tokio::test]
async fn scenario_a_multi_service_errors_open_a_ticket() {
    let gateway = ScriptedGateway::new()
        .respond(SearchEvents::TOOL, scenario_a_logs())
        .respond(CreateWorkItem::TOOL, json!({"id": 4711, "rev": 1}));
    let alert = alert(&["env:prod", "service:payment"]);

    let report = pipeline(&gateway)
        .run(RunId::new(), &alert, RunContext::new("datadog_webhook", alert.id()))
        .await;

    assert_eq!(report.state, RunState::Done, "failure: {:?}", report.failure);
    let record = report.context.investigation().expect("investigation");
    assert_eq!(record.error_count, 7);
    assert_eq!(record.affected_services.len(), 2);
    assert_eq!(record.stack_traces.len(), 1);

    let decision = report.context.decision().expect("decision");
    assert_eq!(decision.decision, Decision::Ticket);
    assert!(matches!(decision.priority, Priority::P0 | Priority::P1));
    assert_eq!(decision.services_affected, vec!["ledger", "payment"]);

    assert_eq!(
        report.ticket(),
        Some(&TicketOutcome::Created {
            ticket_id: "4711".into()
        })
    );
    assert_eq!(gateway.calls_to(SearchEvents::TOOL), 1);
    assert_eq!(gateway.calls_to(CreateWorkItem::TOOL), 1);

    let calls = gateway.calls();
    let fields = calls[1].arguments["fields"].as_array().expect("fields");
    let title = fields
        .iter()
        .find(|f| f["name"] == "System.Title")
        .and_then(|f| f["value"].as_str())
        .expect("title");
    assert_eq!(title, "[INCIDENT] payment: Charge failed: ledger returned 503");
}

#[tokio::test]
async fn scenario_b_quiet_alert_is_ignored_without_ticket() {
    let gateway = ScriptedGateway::new().respond(SearchEvents::TOOL, json!([]));
    let alert = alert(&["env:prod", "service:payment"]);

    let report = pipeline(&gateway)
        .run(RunId::new(), &alert, RunContext::new("datadog_webhook", alert.id()))
        .await;

    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.context.investigation().map(|r| r.error_count), Some(0));
    assert_eq!(
        report.context.decision().map(|d| d.decision),
        Some(Decision::Ignore)
    );
    assert!(matches!(report.ticket(), Some(TicketOutcome::NoTicket { .. })));
    assert_eq!(gateway.calls().len(), 1);
    assert_eq!(
        report.transitions.iter().map(|t| t.to).collect::<Vec<_>>(),
        vec![RunState::Deciding, RunState::Acting, RunState::Done]
    );
}

#[tokio::test]
async fn ticket_failure_fails_the_run() {
    let gateway = ScriptedGateway::new()
        .respond(SearchEvents::TOOL, scenario_a_logs())
        .fail(CreateWorkItem::TOOL, "TF400813: not authorized");
    let alert = alert(&["service:payment"]);

    let report = pipeline(&gateway)
        .run(RunId::new(), &alert, RunContext::new("datadog_webhook", alert.id()))
        .await;

    assert_eq!(report.state, RunState::Failed);
    assert!(matches!(report.failure, Some(PipelineError::TicketCreation(_))));
    assert_eq!(
        report.context.decision().map(|d| d.decision),
        Some(Decision::Ticket)
    );
    assert!(!report.context.contains(StateKey::TicketResult));
    assert_eq!(gateway.calls_to(CreateWorkItem::TOOL), 1);
}

#[tokio::test]
async fn search_outage_degrades_to_conservative_decision() {
    let gateway = ScriptedGateway::new().fail(SearchEvents::TOOL, "connection reset");
    let alert = alert(&["service:payment"]);

    let report = pipeline(&gateway)
        .run(RunId::new(), &alert, RunContext::new("datadog_webhook", alert.id()))
        .await;

    assert_eq!(report.state, RunState::Done);
    assert!(report.context.investigation().expect("record").is_degraded());
    assert_eq!(
        report.context.decision().map(|d| d.decision),
        Some(Decision::Ignore)
    );
    assert_eq!(gateway.calls_to(CreateWorkItem::TOOL), 0);
}

#[tokio::test]
async fn prefilled_context_is_not_overwritten() {
    let gateway = ScriptedGateway::new().respond(SearchEvents::TOOL, json!([]));
    let alert = alert(&["service:payment"]);
    let mut ctx = RunContext::new("datadog_webhook", alert.id());
    ctx.put(StateKey::InvestigationReport, StateValue::Text("from elsewhere".into()))
        .expect("seed");

    let report = pipeline(&gateway).run(RunId::new(), &alert, ctx).await;

    assert_eq!(report.state, RunState::Failed);
    assert!(matches!(report.failure, Some(PipelineError::Context(_))));
    assert_eq!(
        report.context.get(StateKey::InvestigationReport),
        Some(&StateValue::Text("from elsewhere".into()))
    );
    assert!(report.context.decision().is_none());
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn prefilled_later_key_fails_before_any_tool_call() {
    let gateway = ScriptedGateway::new()
        .respond(SearchEvents::TOOL, scenario_a_logs())
        .respond(CreateWorkItem::TOOL, json!({"id": "88"}));
    let alert = alert(&["service:payment"]);
    let mut ctx = RunContext::new("datadog_webhook", alert.id());
    ctx.put(StateKey::TicketResult, StateValue::Text("from elsewhere".into()))
        .expect("seed");

    let report = pipeline(&gateway).run(RunId::new(), &alert, ctx).await;

    assert_eq!(report.state, RunState::Failed);
    assert!(matches!(
        report.failure,
        Some(PipelineError::Context(ContextError::AlreadyWritten(StateKey::TicketResult)))
    ));
    assert!(report.context.investigation().is_none());
    assert_eq!(gateway.calls_to(SearchEvents::TOOL), 0);
    assert_eq!(gateway.calls_to(CreateWorkItem::TOOL), 0);
}

#[tokio::test]
async fn archive_records_the_run() {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("time")
        .as_nanos();
    let log = EventLog::open(format!("/tmp/incident-pipeline-tests/e2e-{nanos}.db")).expect("open");
    let gateway = ScriptedGateway::new()
        .respond(SearchEvents::TOOL, scenario_a_logs())
        .respond(CreateWorkItem::TOOL, json!({"id": "88"}));
    let alert = alert(&["service:payment"]);
    let run_id = RunId::new();

    pipeline(&gateway)
        .with_archive(log.clone())
        .run(run_id, &alert, RunContext::new("datadog_webhook", alert.id()))
        .await;

    let types: Vec<EventType> = log
        .events_for_run(&run_id.to_string())
        .expect("events")
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        types,
        vec![
            EventType::RunStarted,
            EventType::StageCompleted,
            EventType::StageCompleted,
            EventType::StageCompleted,
            EventType::TicketCreated,
            EventType::RunCompleted,
        ]
    );
    assert!(log.unfinished_runs().expect("unfinished").is_empty());
}
