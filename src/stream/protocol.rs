//! Event-plane wire protocol.
//!
//! Server push is a structured envelope `{type, topic, payload, timestamp}`;
//! client frames carry a `type` plus a type-specific payload. Action frames
//! reuse the same verbs as the synchronous plane and flow into the same
//! pool entry points.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::events::PoolEvent;

// Server → client message types.
pub const TYPE_CONNECTION: &str = "connection";
pub const TYPE_PONG: &str = "pong";
pub const TYPE_SUBSCRIBED: &str = "subscribed";
pub const TYPE_UNSUBSCRIBED: &str = "unsubscribed";
pub const TYPE_ACTION_RESULT: &str = "browser-action-result";
pub const TYPE_STATS: &str = "stats";
pub const TYPE_BROADCAST: &str = "broadcast";
pub const TYPE_ERROR: &str = "error";
pub const TYPE_HEARTBEAT: &str = "heartbeat";

/// Envelope pushed to event-plane clients.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub payload: Value,
    pub timestamp: String,
}

impl Envelope {
    fn new(kind: &'static str, topic: Option<String>, payload: Value) -> Self {
        Self {
            kind,
            topic,
            payload,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn connection(heartbeat_interval_secs: u64) -> Self {
        Self::new(
            TYPE_CONNECTION,
            None,
            json!({
                "service": "roostd",
                "version": env!("CARGO_PKG_VERSION"),
                "heartbeatIntervalSecs": heartbeat_interval_secs,
                "actions": ["create-session", "create-page", "navigate", "click", "type"],
            }),
        )
    }

    pub fn pong() -> Self {
        Self::new(TYPE_PONG, None, json!({}))
    }

    pub fn subscribed(topics: &[String]) -> Self {
        Self::new(TYPE_SUBSCRIBED, None, json!({ "topics": topics }))
    }

    pub fn unsubscribed(topics: &[String]) -> Self {
        Self::new(TYPE_UNSUBSCRIBED, None, json!({ "topics": topics }))
    }

    pub fn heartbeat() -> Self {
        Self::new(TYPE_HEARTBEAT, None, json!({}))
    }

    pub fn stats(stats: Value) -> Self {
        Self::new(TYPE_STATS, None, stats)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(TYPE_ERROR, None, json!({ "message": message.into() }))
    }

    /// Wrap a bus event for subscribed clients. The bus timestamp is kept so
    /// both planes report the same instant for the same mutation.
    pub fn broadcast(event: &PoolEvent) -> Self {
        Self {
            kind: TYPE_BROADCAST,
            topic: Some(event.topic.clone()),
            payload: event.payload.clone(),
            timestamp: event.timestamp.clone(),
        }
    }

    pub fn action_result(request_id: Option<Value>, result: Result<Value, (String, String)>) -> Self {
        let payload = match result {
            Ok(value) => json!({
                "requestId": request_id,
                "success": true,
                "result": value,
            }),
            Err((code, message)) => json!({
                "requestId": request_id,
                "success": false,
                "error": { "code": code, "message": message },
            }),
        };
        Self::new(TYPE_ACTION_RESULT, None, payload)
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// One frame received from a client.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct TopicsPayload {
    #[serde(default)]
    pub topics: Vec<String>,
}

/// Action verbs accepted over the open connection — the same verbs the
/// synchronous plane exposes, updating identical pool state.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum BrowserAction {
    #[serde(rename_all = "camelCase")]
    CreateSession {
        owner_id: Option<String>,
        #[serde(default)]
        metadata: std::collections::HashMap<String, String>,
    },
    #[serde(rename_all = "camelCase")]
    CreatePage {
        session_id: String,
        url: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Navigate {
        session_id: String,
        page_id: String,
        url: String,
        timeout_ms: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Click {
        session_id: String,
        page_id: String,
        selector: String,
    },
    #[serde(rename_all = "camelCase")]
    Type {
        session_id: String,
        page_id: String,
        selector: String,
        text: String,
    },
}

/// Action payloads carry an optional correlation id alongside the verb.
pub fn request_id_of(payload: &Value) -> Option<Value> {
    payload.get("requestId").cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape_on_the_wire() {
        let env = Envelope::subscribed(&["session.*".to_string()]);
        let value: Value = serde_json::from_str(&env.to_text()).unwrap();
        assert_eq!(value["type"], "subscribed");
        assert_eq!(value["payload"]["topics"][0], "session.*");
        assert!(value.get("topic").is_none());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn broadcast_keeps_bus_timestamp() {
        let event = PoolEvent {
            topic: "session.closed".to_string(),
            payload: json!({"sessionId": "s1"}),
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
        };
        let env = Envelope::broadcast(&event);
        assert_eq!(env.kind, TYPE_BROADCAST);
        assert_eq!(env.topic.as_deref(), Some("session.closed"));
        assert_eq!(env.timestamp, "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn action_frames_parse() {
        let payload = json!({
            "action": "navigate",
            "sessionId": "s1",
            "pageId": "p1",
            "url": "https://example.com",
        });
        match serde_json::from_value::<BrowserAction>(payload).unwrap() {
            BrowserAction::Navigate {
                session_id,
                page_id,
                url,
                timeout_ms,
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(page_id, "p1");
                assert_eq!(url, "https://example.com");
                assert!(timeout_ms.is_none());
            }
            other => panic!("unexpected action: {other:?}"),
        }

        let typed = json!({
            "action": "type",
            "sessionId": "s1",
            "pageId": "p1",
            "selector": "#q",
            "text": "hello",
        });
        assert!(matches!(
            serde_json::from_value::<BrowserAction>(typed).unwrap(),
            BrowserAction::Type { .. }
        ));
    }

    #[test]
    fn unknown_action_is_rejected() {
        let payload = json!({ "action": "detonate" });
        assert!(serde_json::from_value::<BrowserAction>(payload).is_err());
    }

    #[test]
    fn action_result_error_shape() {
        let env = Envelope::action_result(
            Some(json!(7)),
            Err(("not_found".to_string(), "session 'x' not found".to_string())),
        );
        let value: Value = serde_json::from_str(&env.to_text()).unwrap();
        assert_eq!(value["payload"]["success"], false);
        assert_eq!(value["payload"]["requestId"], 7);
        assert_eq!(value["payload"]["error"]["code"], "not_found");
    }
}
