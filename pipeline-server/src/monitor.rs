//! Log-alert monitor provisioning for the webhook ingress.
//!
//! The monitor fires when more than [`CRITICAL_THRESHOLD`] error logs land
//! within five minutes and mentions the `@webhook-incident-pipeline`
//! integration, which posts the alert to [`WEBHOOK_PATH`].

use anyhow::{Context, bail};
use pipeline_core::investigation::build_query;
use serde::Deserialize;
use serde_json::{Value, json};

pub const WEBHOOK_NAME: &str = "incident-pipeline";
pub const WEBHOOK_PATH: &str = "/api/webhook/datadog";
pub const CRITICAL_THRESHOLD: u32 = 5;
pub const WARNING_THRESHOLD: u32 = 3;
pub const RENOTIFY_MINUTES: u32 = 60;

/// Body the webhook integration must send; matches what the ingress parses.
pub const WEBHOOK_PAYLOAD_TEMPLATE: &str = r#"{
    "id": "$ID",
    "alert_type": "$ALERT_TYPE",
    "title": "$EVENT_TITLE",
    "date": $DATE,
    "body": "$TEXT_ONLY_MSG",
    "tags": ["$TAGS"]
}"#;

/// Scope of a monitor. `*` means any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorScope {
    pub service: String,
    pub env: String,
}

impl MonitorScope {
    pub fn new(service: impl Into<String>, env: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            env: env.into(),
        }
    }

    pub fn log_query(&self) -> String {
        build_query(scoped(&self.service), scoped(&self.env))
    }
}

fn scoped(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty() && value != "*").then_some(value)
}

pub fn webhook_url(backend_url: &str) -> String {
    format!("{}{WEBHOOK_PATH}", backend_url.trim_end_matches('/'))
}

/// Request body for `POST /api/v1/monitor`.
pub fn monitor_definition(scope: &MonitorScope) -> Value {
    let query = scope.log_query();
    let MonitorScope { service, env } = scope;
    let message = format!(
        "## Error Log Alert\n\n\
         Elevated error rate detected in logs.\n\n\
         **Query:** `{query}`\n\
         **Threshold:** More than {CRITICAL_THRESHOLD} errors in 5 minutes\n\n\
         ### Alert Details\n\
         - Service: {service}\n\
         - Environment: {env}\n\
         - Triggered at: {{{{last_triggered_at}}}}\n\n\
         @webhook-{WEBHOOK_NAME}\n"
    );

    json!({
        "name": format!("[Incident Pipeline] Error Log Monitor - {service}:{env}"),
        "type": "log alert",
        "query": format!(
            "logs(\"{query}\").index(\"*\").rollup(\"count\").last(\"5m\") > {CRITICAL_THRESHOLD}"
        ),
        "message": message,
        "tags": [
            format!("service:{service}"),
            format!("env:{env}"),
            "team:sre",
            format!("source:{WEBHOOK_NAME}"),
            "automated:true",
        ],
        "options": {
            "thresholds": {
                "critical": f64::from(CRITICAL_THRESHOLD),
                "warning": f64::from(WARNING_THRESHOLD),
            },
            "notify_no_data": false,
            "renotify_interval": RENOTIFY_MINUTES,
            "escalation_message": "Alert is still active after 1 hour.",
            "include_tags": true,
        },
        // The pipeline reassesses priority on every run.
        "priority": 3,
    })
}

/// Manual steps for the webhook integration, which the monitor API cannot create.
pub fn webhook_instructions(backend_url: &str, site: &str) -> String {
    format!(
        "To complete the setup, configure a webhook in Datadog:\n\n\
         1. Navigate to https://app.{site}/integrations/webhooks\n\
         2. Create a new webhook named '{WEBHOOK_NAME}'\n\
         3. Set URL to: {url}\n\
         4. Set the custom payload to:\n\n{WEBHOOK_PAYLOAD_TEMPLATE}\n\n\
         5. Set custom headers to {{\"Content-Type\": \"application/json\"}}\n\
         6. Leave 'Encode as form' unchecked\n\
         7. Test the webhook to verify connectivity\n\n\
         The monitor message mentions @webhook-{WEBHOOK_NAME} to trigger it.",
        url = webhook_url(backend_url),
    )
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedMonitor {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub query: String,
}

pub struct MonitorClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    app_key: String,
}

impl MonitorClient {
    pub fn new(site: &str, api_key: impl Into<String>, app_key: impl Into<String>) -> Self {
        Self::with_base_url(format!("https://api.{site}"), api_key, app_key)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        app_key: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            app_key: app_key.into(),
        }
    }

    pub async fn create(&self, definition: &Value) -> anyhow::Result<CreatedMonitor> {
        let response = self
            .http
            .post(format!("{}/api/v1/monitor", self.base_url))
            .header("DD-API-KEY", &self.api_key)
            .header("DD-APPLICATION-KEY", &self.app_key)
            .json(definition)
            .send()
            .await
            .context("monitor API request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("monitor API returned {status}: {body}");
        }
        response
            .json::<CreatedMonitor>()
            .await
            .context("monitor API returned an unexpected body")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Json;

    #[test]
    fn query_drops_wildcards() {
        assert_eq!(MonitorScope::new("*", "*").log_query(), "status:error");
        assert_eq!(MonitorScope::new("*", "prod").log_query(), "status:error env:prod");
        assert_eq!(
            MonitorScope::new("payment", "prod").log_query(),
            "status:error service:payment env:prod"
        );
    }

    #[test]
    fn definition_targets_the_webhook() {
        let monitor = monitor_definition(&MonitorScope::new("payment", "*"));
        assert_eq!(monitor["type"], "log alert");
        assert_eq!(
            monitor["query"],
            "logs(\"status:error service:payment\").index(\"*\").rollup(\"count\").last(\"5m\") > 5"
        );
        assert_eq!(monitor["name"], "[Incident Pipeline] Error Log Monitor - payment:*");
        assert_eq!(monitor["options"]["thresholds"]["critical"], 5.0);
        assert_eq!(monitor["options"]["thresholds"]["warning"], 3.0);
        assert_eq!(monitor["options"]["renotify_interval"], 60);
        let message = monitor["message"].as_str().unwrap();
        assert!(message.contains("@webhook-incident-pipeline"));
        assert!(message.contains("{{last_triggered_at}}"));
        assert!(monitor["tags"].as_array().unwrap().contains(&json!("service:payment")));
    }

    #[test]
    fn webhook_url_joins_cleanly() {
        assert_eq!(
            webhook_url("https://ops.example.com/"),
            "https://ops.example.com/api/webhook/datadog"
        );
        let text = webhook_instructions("https://ops.example.com", "datadoghq.eu");
        assert!(text.contains("https://app.datadoghq.eu/integrations/webhooks"));
        assert!(text.contains("\"alert_type\": \"$ALERT_TYPE\""));
    }

    async fn fake_monitor_api(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        if headers.get("DD-API-KEY").and_then(|v| v.to_str().ok()) != Some("api")
            || headers.get("DD-APPLICATION-KEY").and_then(|v| v.to_str().ok()) != Some("app")
        {
            return (StatusCode::FORBIDDEN, Json(json!({"errors": ["Forbidden"]})));
        }
        (
            StatusCode::OK,
            Json(json!({"id": 991, "name": body["name"], "query": body["query"]})),
        )
    }

    async fn serve_fake() -> String {
        let app = Router::new().route("/api/v1/monitor", post(fake_monitor_api));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn client_posts_definition_with_keys() {
        let base = serve_fake().await;
        let definition = monitor_definition(&MonitorScope::new("payment", "prod"));

        let created = MonitorClient::with_base_url(&base, "api", "app")
            .create(&definition)
            .await
            .expect("created");
        assert_eq!(created.id, 991);
        assert_eq!(created.name, "[Incident Pipeline] Error Log Monitor - payment:prod");

        let err = MonitorClient::with_base_url(&base, "api", "wrong")
            .create(&definition)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("403"));
    }
}
