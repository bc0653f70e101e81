//! Session and page records.
//!
//! A session owns an isolated browsing context and its child pages. The
//! engine binding is an identifier, not an owning reference — the pool
//! resolves it on demand, so replacing a crashed engine never rewrites
//! live session objects.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

use crate::engine::{ContextHandle, PageHandle};

use super::EngineId;

pub struct Session {
    pub id: String,
    pub engine_id: EngineId,
    pub context: Arc<dyn ContextHandle>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub pages: HashMap<String, Arc<dyn PageHandle>>,
    pub metadata: HashMap<String, String>,
    pub owner_id: Option<String>,
    // Capacity slot — released when the session record drops.
    _permit: OwnedSemaphorePermit,
}

impl Session {
    pub fn new(
        id: String,
        engine_id: EngineId,
        context: Arc<dyn ContextHandle>,
        owner_id: Option<String>,
        metadata: HashMap<String, String>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            engine_id,
            context,
            created_at: now,
            last_activity: now,
            pages: HashMap::new(),
            metadata,
            owner_id,
            _permit: permit,
        }
    }

    /// Record activity. `last_activity` never moves backwards, even if the
    /// wall clock does.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn idle_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_activity).num_seconds()
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            session_id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            created_at: self.created_at.to_rfc3339(),
            last_activity: self.last_activity.to_rfc3339(),
            page_count: self.pages.len(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Serialized session info, as returned by `session.info` and pool stats.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub created_at: String,
    pub last_activity: String,
    pub page_count: usize,
    pub metadata: HashMap<String, String>,
}

/// Why a session was closed — carried on the `session.closed` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Released,
    Expired,
    EngineDisconnected,
    Drained,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockDriver;
    use crate::engine::{EngineDriver, LaunchOptions};
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    async fn make_session() -> Session {
        let driver = MockDriver::new();
        let opts = LaunchOptions {
            headless: true,
            sandbox: true,
            viewport_width: 800,
            viewport_height: 600,
            user_agent: "test".to_string(),
        };
        let engine = driver.launch(&opts).await.unwrap();
        let context = engine.new_context().await.unwrap();
        let permit = Arc::new(Semaphore::new(1))
            .try_acquire_owned()
            .unwrap();
        Session::new(
            "s1".to_string(),
            EngineId(1),
            context,
            Some("owner".to_string()),
            HashMap::from([("job".to_string(), "42".to_string())]),
            permit,
        )
    }

    #[tokio::test]
    async fn touch_is_monotonic() {
        let mut session = make_session().await;
        let before = session.last_activity;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        session.touch();
        assert!(session.last_activity >= before);
    }

    #[tokio::test]
    async fn view_reflects_record() {
        let session = make_session().await;
        let view = session.view();
        assert_eq!(view.session_id, "s1");
        assert_eq!(view.owner_id.as_deref(), Some("owner"));
        assert_eq!(view.page_count, 0);
        assert_eq!(view.metadata.get("job").map(String::as_str), Some("42"));
    }
}
