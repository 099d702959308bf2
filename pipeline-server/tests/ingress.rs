use pipeline_core::action::ActionStage;
use pipeline_core::context::RunId;
use pipeline_core::decision::TriagePolicy;
use pipeline_core::gateway::{Capability, ScriptedGateway, SearchEvents};
use pipeline_core::investigation::InvestigationStage;
use pipeline_core::orchestrator::Pipeline;
use pipeline_core::queue::{RunPhase, RunQueue};
use pipeline_server::webhook::webhook_router;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn serve(gateway: ScriptedGateway) -> (String, Arc<RunQueue>) {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    let gateway = Arc::new(gateway);
    let pipeline = Pipeline::new(
        InvestigationStage::new(gateway.clone()),
        TriagePolicy::default(),
        ActionStage::new(gateway, "MIRA"),
    );
    let queue = Arc::new(RunQueue::start(Arc::new(pipeline), 2, 16));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = webhook_router(queue.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), queue)
}

fn alert() -> Value {
    json!({
        "id": "8812",
        "alert_type": "error",
        "title": "Error Log Monitor - payment:prod",
        "date": 1738519815000i64,
        "body": "More than 5 errors in 5 minutes",
        "tags": ["service:payment", "env:prod"],
    })
}

#[tokio::test]
async fn webhook_acknowledges_before_run_finishes() {
    let gateway = ScriptedGateway::new()
        .respond(SearchEvents::TOOL, json!([]))
        .with_delay(Duration::from_millis(800));
    let (base, queue) = serve(gateway).await;
    let client = reqwest::Client::new();

    let started = Instant::now();
    let response = client
        .post(format!("{base}/api/webhook/datadog"))
        .json(&alert())
        .send()
        .await
        .expect("send");
    let acked_after = started.elapsed();

    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    assert!(acked_after < Duration::from_millis(800), "ack took {acked_after:?}");
    let reply: Value = response.json().await.expect("json");
    assert_eq!(reply["status"], "accepted");
    assert_eq!(reply["alert_id"], "8812");

    let run_id = RunId::parse(reply["run_id"].as_str().expect("run id")).expect("parse");
    let in_flight: Value = client
        .get(format!("{base}/api/runs/{run_id}"))
        .send()
        .await
        .expect("status")
        .json()
        .await
        .expect("json");
    assert_ne!(in_flight["phase"], json!(RunPhase::Done));

    let done = queue.wait_for(run_id).await.expect("finished");
    assert_eq!(done.phase, RunPhase::Done);
    assert!(done.ticket_id.is_none());
}

#[tokio::test]
async fn malformed_alert_is_rejected_over_http() {
    let (base, queue) = serve(ScriptedGateway::new()).await;
    let mut payload = alert();
    payload.as_object_mut().unwrap().remove("id");

    let response = reqwest::Client::new()
        .post(format!("{base}/api/webhook/datadog"))
        .json(&payload)
        .send()
        .await
        .expect("send");

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let reply: Value = response.json().await.expect("json");
    assert_eq!(reply["status"], "rejected");
    assert_eq!(queue.stats().submitted, 0);

    let health: Value = reqwest::get(format!("{base}/health"))
        .await
        .expect("health")
        .json()
        .await
        .expect("json");
    assert_eq!(health["status"], "healthy");
}
