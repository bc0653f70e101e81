//! Internal event bus.
//!
//! Every committed pool mutation publishes exactly one event here; both
//! control planes subscribe and forward uniformly. Publishing happens after
//! the state change is committed and before the synchronous caller gets its
//! response, so subscribers and callers observe a consistent ordering.

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;

/// Topic names carried on the bus and exposed to event-plane subscribers.
pub mod topic {
    pub const SESSION_CREATED: &str = "session.created";
    pub const SESSION_CLOSED: &str = "session.closed";
    pub const PAGE_CREATED: &str = "page.created";
    pub const PAGE_CLOSED: &str = "page.closed";
    pub const ACTION_PERFORMED: &str = "action.performed";
    pub const ENGINE_LAUNCHED: &str = "engine.launched";
    pub const ENGINE_DISCONNECTED: &str = "engine.disconnected";
    pub const POOL_DRAINING: &str = "pool.draining";
}

/// A committed state change, as published on the bus.
#[derive(Debug, Clone)]
pub struct PoolEvent {
    pub topic: String,
    pub payload: Value,
    /// RFC 3339 timestamp taken at publish time.
    pub timestamp: String,
}

/// Broadcasts [`PoolEvent`]s to all subscribed control-plane connections.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish one event. No subscribers is fine.
    pub fn publish(&self, topic: &str, payload: Value) {
        let _ = self.tx.send(PoolEvent {
            topic: topic.to_string(),
            payload,
            timestamp: Utc::now().to_rfc3339(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }
}

/// Check a topic against a subscription pattern.
///
/// `*` matches everything; a trailing `*` matches by prefix
/// (`session.*` matches `session.closed`); anything else is exact.
pub fn topic_matches(topic: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return topic.starts_with(prefix);
    }
    topic == pattern
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(topic::SESSION_CREATED, json!({"sessionId": "s1"}));

        let ev = a.recv().await.unwrap();
        assert_eq!(ev.topic, "session.created");
        assert_eq!(ev.payload["sessionId"], "s1");
        assert_eq!(b.recv().await.unwrap().topic, "session.created");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_harmless() {
        let bus = EventBus::new();
        bus.publish(topic::POOL_DRAINING, json!({}));
    }

    #[test]
    fn wildcard_and_prefix_matching() {
        assert!(topic_matches("session.closed", "*"));
        assert!(topic_matches("session.closed", "session.*"));
        assert!(topic_matches("session.closed", "session.closed"));
        assert!(!topic_matches("session.closed", "page.*"));
        assert!(!topic_matches("session.closed", "session.created"));
    }
}
