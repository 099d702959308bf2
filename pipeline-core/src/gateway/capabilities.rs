use super::{Capability, GatewayError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tool_effects_derive::Effectful;

/// Log/event search. Used once per run by the investigation stage.
#[derive(Clone, Debug, PartialEq, Eq, Effectful)]
#[effect(Observe)]
pub struct SearchEvents {
    pub query: String,
    pub time_from: DateTime<Utc>,
    pub time_to: DateTime<Utc>,
    pub limit: u32,
}

impl Capability for SearchEvents {
    const TOOL: &'static str = "search_logs";
    type Output = Vec<EventRecord>;

    fn arguments(&self) -> Value {
        json!({
            "query": self.query,
            "from": self.time_from.to_rfc3339_opts(SecondsFormat::Secs, true),
            "to": self.time_to.to_rfc3339_opts(SecondsFormat::Secs, true),
            "limit": self.limit,
        })
    }

    fn decode(&self, raw: Value) -> Result<Self::Output, GatewayError> {
        let items = match &raw {
            Value::Null => return Ok(Vec::new()),
            Value::Array(items) => items,
            Value::Object(obj) => ["logs", "data", "events"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_array))
                .ok_or_else(|| malformed(Self::TOOL, "no logs/data/events array in result"))?,
            other => {
                return Err(malformed(
                    Self::TOOL,
                    &format!("expected an array of events, got {}", type_name(other)),
                ));
            }
        };
        Ok(items.iter().map(EventRecord::from_value).collect())
    }
}

/// One log line returned by the search backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: Option<DateTime<Utc>>,
    pub service: Option<String>,
    pub host: Option<String>,
    pub status: Option<String>,
    pub message: String,
    pub stack_trace: Option<String>,
}

impl EventRecord {
    /// Lenient extraction: fields may sit at the top level or under the
    /// backend's `attributes` / `content` envelopes.
    pub fn from_value(value: &Value) -> Self {
        let roots = envelopes(value);
        let timestamp = roots.iter().find_map(|root| {
            ["timestamp", "date", "@timestamp"]
                .iter()
                .find_map(|k| root.get(*k).and_then(parse_timestamp))
        });

        Self {
            timestamp,
            service: first_text(&roots, &[&["service"]]),
            host: first_text(&roots, &[&["host"], &["hostname"], &["container_name"]]),
            status: first_text(&roots, &[&["status"], &["level"]]),
            message: first_text(&roots, &[&["message"], &["msg"], &["error", "message"]]).unwrap_or_default(),
            stack_trace: first_text(&roots, &[&["error", "stack"], &["stack_trace"], &["stack"], &["exception"]]),
        }
    }
}

/// Work item creation. At most once per run, only on TICKET decisions.
#[derive(Clone, Debug, PartialEq, Eq, Effectful)]
#[effect(Mutate)]
pub struct CreateWorkItem {
    pub project: String,
    pub work_item_type: String,
    pub fields: BTreeMap<String, String>,
}

impl Capability for CreateWorkItem {
    const TOOL: &'static str = "wit_create_work_item";
    type Output = WorkItemRef;

    fn arguments(&self) -> Value {
        json!({
            "project": self.project,
            "workItemType": self.work_item_type,
            "fields": self
                .fields
                .iter()
                .map(|(name, value)| json!({"name": name, "value": value}))
                .collect::<Vec<_>>(),
        })
    }

    fn decode(&self, raw: Value) -> Result<Self::Output, GatewayError> {
        WorkItemRef::from_value(Self::TOOL, &raw)
    }
}

/// Field update on an existing work item. Reachable through the gateway
/// but not issued by the default pipeline flow.
#[derive(Clone, Debug, PartialEq, Eq, Effectful)]
#[effect(Mutate)]
pub struct UpdateWorkItem {
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

impl Capability for UpdateWorkItem {
    const TOOL: &'static str = "wit_update_work_item";
    type Output = WorkItemRef;

    fn arguments(&self) -> Value {
        json!({
            "id": self.id,
            "updates": self
                .fields
                .iter()
                .map(|(name, value)| json!({
                    "op": "add",
                    "path": format!("/fields/{name}"),
                    "value": value,
                }))
                .collect::<Vec<_>>(),
        })
    }

    fn decode(&self, raw: Value) -> Result<Self::Output, GatewayError> {
        WorkItemRef::from_value(Self::TOOL, &raw)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemRef {
    pub id: String,
}

impl WorkItemRef {
    fn from_value(tool: &str, raw: &Value) -> Result<Self, GatewayError> {
        let id = [raw.get("id"), raw.get("workItem").and_then(|w| w.get("id"))]
            .into_iter()
            .flatten()
            .find_map(|v| match v {
                Value::Number(n) => Some(n.to_string()),
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                _ => None,
            })
            .ok_or_else(|| malformed(tool, "work item id missing from result"))?;
        Ok(Self { id })
    }
}

fn envelopes(value: &Value) -> Vec<&Value> {
    let mut roots = vec![value];
    for key in ["attributes", "content"] {
        if let Some(inner) = value.get(key).filter(|v| v.is_object()) {
            roots.push(inner);
            if let Some(nested) = inner.get("attributes").filter(|v| v.is_object()) {
                roots.push(nested);
            }
        }
    }
    roots
}

fn first_text(roots: &[&Value], paths: &[&[&str]]) -> Option<String> {
    roots.iter().find_map(|root| {
        paths.iter().find_map(|path| {
            lookup(root, path)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
        })
    })
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(*key))
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn malformed(tool: &str, message: &str) -> GatewayError {
    GatewayError::Malformed {
        tool: tool.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_arguments_use_iso8601_window() {
        let search = SearchEvents {
            query: "status:error service:payment".into(),
            time_from: DateTime::from_timestamp_millis(1_738_518_915_000).unwrap(),
            time_to: DateTime::from_timestamp_millis(1_738_520_115_000).unwrap(),
            limit: 50,
        };
        assert_eq!(
            search.arguments(),
            json!({
                "query": "status:error service:payment",
                "from": "2025-02-02T17:55:15Z",
                "to": "2025-02-02T18:15:15Z",
                "limit": 50,
            })
        );
    }

    #[test]
    fn event_fields_found_under_datadog_envelope() {
        let record = EventRecord::from_value(&json!({
            "id": "AQAAAY",
            "attributes": {
                "timestamp": "2025-02-02T18:00:00Z",
                "service": "payment",
                "host": "pay-1",
                "status": "error",
                "message": "charge failed",
                "attributes": {"error": {"stack": "at charge (pay.js:10)"}}
            }
        }));
        assert_eq!(record.service.as_deref(), Some("payment"));
        assert_eq!(record.host.as_deref(), Some("pay-1"));
        assert_eq!(record.message, "charge failed");
        assert_eq!(record.stack_trace.as_deref(), Some("at charge (pay.js:10)"));
        assert!(record.timestamp.is_some());
    }

    #[test]
    fn search_decode_accepts_wrapped_arrays() {
        let search = SearchEvents {
            query: String::new(),
            time_from: Utc::now(),
            time_to: Utc::now(),
            limit: 50,
        };
        let events = search
            .decode(json!({"logs": [{"message": "a"}, {"message": "b"}]}))
            .expect("decode");
        assert_eq!(events.len(), 2);
        assert!(search.decode(Value::Null).expect("null").is_empty());
        assert!(matches!(
            search.decode(json!("No logs found")),
            Err(GatewayError::Malformed { .. })
        ));
    }

    #[test]
    fn create_arguments_list_fields_by_name() {
        let mut fields = BTreeMap::new();
        fields.insert("System.Title".to_string(), "[INCIDENT] x: y".to_string());
        let create = CreateWorkItem {
            project: "MIRA".into(),
            work_item_type: "Bug".into(),
            fields,
        };
        assert_eq!(
            create.arguments(),
            json!({
                "project": "MIRA",
                "workItemType": "Bug",
                "fields": [{"name": "System.Title", "value": "[INCIDENT] x: y"}],
            })
        );
    }

    #[test]
    fn work_item_id_accepts_number_or_string() {
        assert_eq!(WorkItemRef::from_value("t", &json!({"id": 4711})).unwrap().id, "4711");
        assert_eq!(
            WorkItemRef::from_value("t", &json!({"workItem": {"id": "88"}})).unwrap().id,
            "88"
        );
        assert!(WorkItemRef::from_value("t", &json!({"ok": true})).is_err());
    }

    #[test]
    fn update_arguments_are_field_patches() {
        let mut fields = BTreeMap::new();
        fields.insert("System.State".to_string(), "Resolved".to_string());
        let update = UpdateWorkItem { id: "12".into(), fields };
        assert_eq!(
            update.arguments(),
            json!({
                "id": "12",
                "updates": [{"op": "add", "path": "/fields/System.State", "value": "Resolved"}],
            })
        );
    }
}
