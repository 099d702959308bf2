use alert_registry::parse_alert;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use pipeline_core::context::{RunContext, RunId};
use pipeline_core::queue::RunQueue;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

/// Owner of every run started through the webhook.
pub const WEBHOOK_USER_ID: &str = "datadog_webhook";
pub const SERVICE_NAME: &str = "incident-pipeline";

type Reply = (StatusCode, Json<Value>);

pub fn webhook_router(queue: Arc<RunQueue>) -> Router {
    Router::new()
        .route("/", get(api_info))
        .route("/health", get(health))
        .route("/api/webhook/datadog", post(handle_datadog))
        .route("/api/runs", get(run_stats))
        .route("/api/runs/:run_id", get(run_status))
        .with_state(queue)
}

/// Validates the alert, schedules its run and returns without waiting for it.
pub async fn handle_datadog(State(queue): State<Arc<RunQueue>>, body: Bytes) -> Reply {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(err) => return reject(format!("request body is not JSON: {err}")),
    };
    let alert = match parse_alert(payload) {
        Ok(alert) => alert,
        Err(err) => return reject(err.to_string()),
    };

    let alert_id = alert.id().to_string();
    let ctx = RunContext::new(WEBHOOK_USER_ID, alert_id.clone());
    match queue.submit(alert, ctx) {
        Ok(run_id) => {
            info!(%run_id, alert_id = %alert_id, "alert accepted");
            (
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "accepted",
                    "alert_id": alert_id,
                    "run_id": run_id,
                    "message": format!("Alert {alert_id} accepted for processing"),
                })),
            )
        }
        Err(err) => {
            warn!(alert_id = %alert_id, error = %err, "alert not scheduled");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "rejected", "alert_id": alert_id, "error": err.to_string()})),
            )
        }
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn api_info() -> Json<Value> {
    Json(json!({
        "name": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Automated incident response: investigate, triage, ticket",
        "endpoints": {
            "webhook": "POST /api/webhook/datadog",
            "health": "GET /health",
            "runs": "GET /api/runs",
            "run": "GET /api/runs/:run_id",
        }
    }))
}

async fn run_stats(State(queue): State<Arc<RunQueue>>) -> Json<Value> {
    Json(json!(queue.stats()))
}

pub async fn run_status(State(queue): State<Arc<RunQueue>>, Path(run_id): Path<String>) -> Reply {
    let Some(run_id) = RunId::parse(&run_id) else {
        return reject(format!("'{run_id}' is not a run id"));
    };
    match queue.status(run_id) {
        Some(status) => (StatusCode::OK, Json(json!(status))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("run {run_id} not found")})),
        ),
    }
}

fn reject(error: String) -> Reply {
    (StatusCode::BAD_REQUEST, Json(json!({"status": "rejected", "error": error})))
}
