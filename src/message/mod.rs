//! Task and result envelope shapes.
//!
//! [`TaskMessage`] is the envelope published to a broker; its wire field
//! names (`content-encoding`, `content-type`) follow the Celery message
//! protocol. [`ResultMessage`] is the envelope workers store and publish
//! back through a result backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope published to a message broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Packed payload, in the encoding named by `properties.body_encoding`.
    pub body: String,
    #[serde(rename = "content-encoding")]
    pub content_encoding: String,
    #[serde(rename = "content-type")]
    pub content_type: String,
    pub headers: serde_json::Map<String, Value>,
    pub properties: TaskProperties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProperties {
    /// UUID tying this publish to its eventual reply.
    pub correlation_id: String,
    /// Queue the RPC backend listens on, named by the client UUID.
    pub reply_to: String,
    /// 1 = transient, 2 = persistent.
    pub delivery_mode: u8,
    pub delivery_info: DeliveryInfo,
    pub priority: u8,
    /// "base64" or "utf-8".
    pub body_encoding: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryInfo {
    /// `""` addresses the default direct exchange.
    pub exchange: String,
    pub routing_key: String,
}

/// Worker-reported task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Received,
    Started,
    Success,
    Failure,
    Revoked,
    Retry,
}

impl TaskStatus {
    /// Whether a worker will never publish another update for this task.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked
        )
    }
}

/// Envelope read back from a result backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    pub task_id: String,
    pub status: TaskStatus,
    /// Task-typed payload on success, serialized exception descriptor on
    /// failure.
    pub result: Value,
    pub traceback: Option<String>,
    #[serde(default)]
    pub children: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_message_uses_hyphenated_wire_names() {
        let message = TaskMessage {
            body: "W10=".into(),
            content_encoding: "utf-8".into(),
            content_type: "application/json".into(),
            headers: serde_json::Map::new(),
            properties: TaskProperties {
                correlation_id: "id".into(),
                reply_to: "client".into(),
                delivery_mode: 2,
                delivery_info: DeliveryInfo {
                    exchange: "".into(),
                    routing_key: "celery".into(),
                },
                priority: 0,
                body_encoding: "base64".into(),
            },
        };

        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(wire["content-encoding"], "utf-8");
        assert_eq!(wire["content-type"], "application/json");
        assert_eq!(wire["properties"]["delivery_info"]["routing_key"], "celery");
    }

    #[test]
    fn result_message_parses_a_worker_reply() {
        let raw = json!({
            "task_id": "7a1b7e48-3a23-4b67-a1cb-4e159c3c1f0f",
            "status": "SUCCESS",
            "result": 25,
            "traceback": null,
            "children": [],
            "date_done": "2024-01-01T00:00:00"
        });

        let message: ResultMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(message.status, TaskStatus::Success);
        assert!(message.status.is_final());
        assert_eq!(message.result, json!(25));
        assert!(message.traceback.is_none());
    }

    #[test]
    fn non_final_statuses_parse_too() {
        for (raw, status) in [
            ("\"PENDING\"", TaskStatus::Pending),
            ("\"STARTED\"", TaskStatus::Started),
            ("\"RETRY\"", TaskStatus::Retry),
        ] {
            let parsed: TaskStatus = serde_json::from_str(raw).unwrap();
            assert_eq!(parsed, status);
            assert!(!parsed.is_final());
        }
    }
}
