//! Pool manager — the single logical owner of engines, sessions, and pages.
//!
//! All bookkeeping mutations (session/page create and close, engine list
//! changes, reaper sweeps, crash cleanup) are serialized behind one mutex.
//! Long-latency engine calls never run inside that critical section: they
//! re-enter only to read or update bookkeeping, so one session's slow
//! navigation cannot stall another session's operations.
//!
//! Admission control uses owned semaphore permits, so the capacity bound
//! holds even while a context creation is still in flight.

pub mod policy;
pub mod reaper;
pub mod session;

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DaemonConfig;
use crate::engine::{
    ContextHandle, EngineDriver, EngineError, EngineHandle, LaunchOptions, NavigationInfo,
    PageHandle, ScreenshotOptions,
};
use crate::error::{PoolError, PoolResult};
use crate::events::{topic, EventBus};

use policy::{EngineDescriptor, EngineSelector, FirstAvailable};
use session::{CloseReason, Session, SessionView};

/// Engine identity within the pool. Sessions hold this id and resolve the
/// engine through the pool, never an owning reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EngineId(pub u64);

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Launching,
    Active,
    /// Terminal. The slot is removed and a replacement scheduled.
    Disconnected,
}

pub struct EngineSlot {
    pub id: EngineId,
    pub handle: Arc<dyn EngineHandle>,
    pub state: EngineState,
    pub session_count: usize,
}

struct PoolState {
    engines: Vec<EngineSlot>,
    sessions: HashMap<String, Session>,
}

/// Pool statistics document, served by `pool.stats` and `get-stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total_engines: usize,
    pub active_engines: usize,
    pub max_engines: usize,
    pub active_sessions: usize,
    pub available_slots: usize,
    pub draining: bool,
    pub sessions: Vec<SessionView>,
}

pub struct PoolManager {
    config: Arc<DaemonConfig>,
    driver: Arc<dyn EngineDriver>,
    selector: Box<dyn EngineSelector>,
    bus: EventBus,
    state: Mutex<PoolState>,
    slots: Arc<Semaphore>,
    draining: AtomicBool,
    next_engine_id: AtomicU64,
}

impl From<EngineError> for PoolError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Launch(msg) => PoolError::EngineLaunchFailure(msg),
            EngineError::Navigation(msg) => PoolError::NavigationFailure(msg),
            EngineError::Script(msg) => PoolError::ScriptFailure(msg),
            EngineError::Disconnected => {
                PoolError::Internal("engine disconnected mid-operation".to_string())
            }
            EngineError::Other(msg) => PoolError::Internal(msg),
        }
    }
}

impl PoolManager {
    pub fn new(
        config: Arc<DaemonConfig>,
        driver: Arc<dyn EngineDriver>,
        bus: EventBus,
    ) -> Arc<Self> {
        Self::with_selector(config, driver, bus, Box::new(FirstAvailable))
    }

    pub fn with_selector(
        config: Arc<DaemonConfig>,
        driver: Arc<dyn EngineDriver>,
        bus: EventBus,
        selector: Box<dyn EngineSelector>,
    ) -> Arc<Self> {
        let max = config.max_engines;
        Arc::new(Self {
            config,
            driver,
            selector,
            bus,
            state: Mutex::new(PoolState {
                engines: Vec::new(),
                sessions: HashMap::new(),
            }),
            slots: Arc::new(Semaphore::new(max)),
            draining: AtomicBool::new(false),
            next_engine_id: AtomicU64::new(1),
        })
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Launch the initial engine set. Fatal if not a single engine comes up;
    /// a partial set starts degraded and schedules replacements for the
    /// shortfall.
    pub async fn start(self: &Arc<Self>) -> PoolResult<()> {
        let mut launched = 0usize;
        let mut last_err = String::new();
        for _ in 0..self.config.max_engines {
            match self.launch_engine().await {
                Ok(_) => launched += 1,
                Err(e) => {
                    warn!(err = %e, "initial engine launch failed");
                    last_err = e.to_string();
                }
            }
        }
        if launched == 0 {
            return Err(PoolError::EngineLaunchFailure(format!(
                "no engines could be launched: {last_err}"
            )));
        }
        if launched < self.config.max_engines {
            warn!(
                launched,
                target = self.config.max_engines,
                "starting degraded — scheduling replacement launches"
            );
            for _ in launched..self.config.max_engines {
                self.spawn_replacement();
            }
        }
        info!(engines = launched, "engine pool started");
        Ok(())
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Drain: reject new sessions, close everything, collect per-session
    /// errors without aborting the sweep, then shut the engines down.
    pub async fn drain(&self) -> Vec<(String, String)> {
        self.draining.store(true, Ordering::SeqCst);
        self.bus.publish(topic::POOL_DRAINING, json!({}));
        info!("drain started — new sessions rejected");

        let session_ids: Vec<String> = {
            let state = self.state.lock().await;
            state.sessions.keys().cloned().collect()
        };

        let mut errors = Vec::new();
        for id in session_ids {
            if let Err(e) = self.close_session_with(&id, CloseReason::Drained).await {
                warn!(id = %id, err = %e, "session close failed during drain");
                errors.push((id, e.to_string()));
            }
        }

        let engines: Vec<EngineSlot> = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.engines)
        };
        for slot in engines {
            if let Err(e) = slot.handle.close().await {
                warn!(engine = %slot.id, err = %e, "engine close failed during drain");
            }
        }

        info!(errors = errors.len(), "drain complete");
        errors
    }

    // ─── Engine management ───────────────────────────────────────────────────

    async fn launch_engine(self: &Arc<Self>) -> PoolResult<EngineId> {
        let opts = LaunchOptions::from_config(&self.config);
        let handle = self
            .driver
            .launch(&opts)
            .await
            .map_err(|e| PoolError::EngineLaunchFailure(e.to_string()))?;

        let id = EngineId(self.next_engine_id.fetch_add(1, Ordering::SeqCst));
        {
            let mut state = self.state.lock().await;
            state.engines.push(EngineSlot {
                id,
                handle: handle.clone(),
                state: EngineState::Launching,
                session_count: 0,
            });
        }

        let monitor = Arc::clone(self);
        let disconnected = handle.disconnected();
        tokio::spawn(async move {
            monitor.monitor_engine(id, disconnected).await;
        });

        // Selectable only once the monitor is in place.
        {
            let mut state = self.state.lock().await;
            if let Some(slot) = state.engines.iter_mut().find(|s| s.id == id) {
                slot.state = EngineState::Active;
            }
        }

        self.bus.publish(topic::ENGINE_LAUNCHED, json!({ "engineId": id }));
        info!(engine = %id, "engine launched");
        Ok(id)
    }

    async fn monitor_engine(
        self: Arc<Self>,
        id: EngineId,
        mut disconnected: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            if *disconnected.borrow() {
                break;
            }
            // A closed channel means the handle is gone — same thing.
            if disconnected.changed().await.is_err() {
                break;
            }
        }
        self.on_engine_disconnected(id).await;
    }

    /// Handle an engine disconnection. Runs on the monitor task, never inside
    /// a request's critical section.
    async fn on_engine_disconnected(self: &Arc<Self>, id: EngineId) {
        let bound_sessions: Vec<String> = {
            let mut state = self.state.lock().await;
            let Some(pos) = state.engines.iter().position(|s| s.id == id) else {
                // Already removed (drain or duplicate notification).
                return;
            };
            // Disconnected is terminal — mark, then drop from the active set.
            state.engines[pos].state = EngineState::Disconnected;
            state.engines.remove(pos);
            state
                .sessions
                .values()
                .filter(|s| s.engine_id == id)
                .map(|s| s.id.clone())
                .collect()
        };

        warn!(engine = %id, sessions = bound_sessions.len(), "engine disconnected");
        self.bus.publish(
            topic::ENGINE_DISCONNECTED,
            json!({ "engineId": id, "affectedSessions": bound_sessions.len() }),
        );

        for sid in bound_sessions {
            if let Err(e) = self
                .close_session_with(&sid, CloseReason::EngineDisconnected)
                .await
            {
                warn!(id = %sid, err = %e, "session cleanup after disconnect failed");
            }
        }

        if !self.is_draining() {
            self.spawn_replacement();
        }
    }

    /// Launch a replacement engine in the background, retrying with backoff
    /// until the pool is back at target size or the daemon is draining.
    fn spawn_replacement(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                if pool.is_draining() {
                    return;
                }
                {
                    let state = pool.state.lock().await;
                    if state.engines.len() >= pool.config.max_engines {
                        return;
                    }
                }
                match pool.launch_engine().await {
                    Ok(id) => {
                        info!(engine = %id, attempt, "replacement engine launched");
                        return;
                    }
                    Err(e) => {
                        let delay = replacement_backoff(attempt);
                        warn!(
                            err = %e,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "replacement launch failed — backing off"
                        );
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });
    }

    // ─── Sessions ────────────────────────────────────────────────────────────

    pub async fn create_session(
        &self,
        owner_id: Option<String>,
        metadata: HashMap<String, String>,
    ) -> PoolResult<SessionView> {
        if self.is_draining() {
            return Err(PoolError::Draining);
        }

        let permit = match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                return Err(PoolError::CapacityExceeded {
                    active: self.config.max_engines - self.slots.available_permits(),
                    max: self.config.max_engines,
                })
            }
        };

        let (engine_id, handle) = {
            let state = self.state.lock().await;
            let descriptors: Vec<EngineDescriptor> = state
                .engines
                .iter()
                .map(|s| EngineDescriptor {
                    id: s.id,
                    state: s.state,
                    session_count: s.session_count,
                })
                .collect();
            let Some(id) = self.selector.select(&descriptors) else {
                return Err(PoolError::Internal(
                    "no active engine available".to_string(),
                ));
            };
            let slot = state
                .engines
                .iter()
                .find(|s| s.id == id)
                .expect("selected engine must exist");
            (id, Arc::clone(&slot.handle))
        };

        // Context creation talks to the engine — outside the lock.
        let context: Arc<dyn ContextHandle> = handle.new_context().await.map_err(|e| {
            debug!(engine = %engine_id, err = %e, "context creation failed");
            PoolError::from(e)
        })?;

        let session_id = Uuid::new_v4().to_string();
        let view = {
            let mut state = self.state.lock().await;
            // The engine may have disconnected while the context was being
            // created; a session must never bind to a dead engine.
            let Some(slot) = state.engines.iter_mut().find(|s| s.id == engine_id) else {
                drop(state);
                let _ = context.close().await;
                return Err(PoolError::Internal(
                    "engine disconnected during session creation".to_string(),
                ));
            };
            slot.session_count += 1;
            let session = Session::new(
                session_id.clone(),
                engine_id,
                context,
                owner_id,
                metadata,
                permit,
            );
            let view = session.view();
            state.sessions.insert(session_id.clone(), session);
            view
        };

        self.bus.publish(
            topic::SESSION_CREATED,
            json!({ "session": view, "engineId": engine_id }),
        );
        info!(id = %session_id, engine = %engine_id, "session created");
        Ok(view)
    }

    /// Session info; refreshes `last_activity`.
    pub async fn session_info(&self, session_id: &str) -> PoolResult<SessionView> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| PoolError::session_not_found(session_id))?;
        session.touch();
        Ok(session.view())
    }

    pub async fn list_sessions(&self) -> Vec<SessionView> {
        let state = self.state.lock().await;
        state.sessions.values().map(Session::view).collect()
    }

    /// Close a session. Idempotent: `Ok(false)` when already absent.
    pub async fn close_session(&self, session_id: &str) -> PoolResult<bool> {
        self.close_session_with(session_id, CloseReason::Released)
            .await
    }

    async fn close_session_with(
        &self,
        session_id: &str,
        reason: CloseReason,
    ) -> PoolResult<bool> {
        let session = {
            let mut state = self.state.lock().await;
            let Some(session) = state.sessions.remove(session_id) else {
                return Ok(false);
            };
            if let Some(slot) = state
                .engines
                .iter_mut()
                .find(|s| s.id == session.engine_id)
            {
                slot.session_count = slot.session_count.saturating_sub(1);
            }
            session
        };

        for (page_id, page) in &session.pages {
            if let Err(e) = page.close().await {
                debug!(page = %page_id, err = %e, "page close failed");
            }
        }
        if let Err(e) = session.context.close().await {
            debug!(id = %session_id, err = %e, "context close failed");
        }

        self.bus.publish(
            topic::SESSION_CLOSED,
            json!({ "sessionId": session_id, "reason": reason }),
        );
        info!(id = %session_id, reason = ?reason, "session closed");
        Ok(true)
    }

    /// One reaper sweep: close every session idle past the timeout.
    /// Returns the closed session ids.
    pub async fn reap_expired(&self) -> Vec<String> {
        let timeout_secs = self.config.session_timeout_secs as i64;
        let now = chrono::Utc::now();
        let expired: Vec<String> = {
            let state = self.state.lock().await;
            state
                .sessions
                .values()
                .filter(|s| s.idle_secs(now) > timeout_secs)
                .map(|s| s.id.clone())
                .collect()
        };

        for id in &expired {
            info!(id = %id, "reaping expired session");
            if let Err(e) = self.close_session_with(id, CloseReason::Expired).await {
                error!(id = %id, err = %e, "reap close failed");
            }
        }
        expired
    }

    // ─── Pages ───────────────────────────────────────────────────────────────

    pub async fn create_page(
        &self,
        session_id: &str,
        url: Option<&str>,
    ) -> PoolResult<String> {
        if let Some(url) = url {
            self.check_domain(url)?;
        }

        let context = {
            let mut state = self.state.lock().await;
            let session = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| PoolError::session_not_found(session_id))?;
            session.touch();
            Arc::clone(&session.context)
        };

        let page = context.new_page().await.map_err(PoolError::from)?;

        if let Some(url) = url {
            let bound = Duration::from_secs(self.config.page_load_timeout_secs);
            match timeout(bound, page.navigate(url)).await {
                Err(_) => {
                    let _ = page.close().await;
                    return Err(PoolError::NavigationTimeout {
                        url: url.to_string(),
                        timeout_secs: self.config.page_load_timeout_secs,
                    });
                }
                Ok(Err(e)) => {
                    let _ = page.close().await;
                    return Err(PoolError::from(e));
                }
                Ok(Ok(_)) => {}
            }
        }

        let page_id = Uuid::new_v4().to_string();
        {
            let mut state = self.state.lock().await;
            let Some(session) = state.sessions.get_mut(session_id) else {
                // Session closed (reaped, drained) while the page was loading.
                drop(state);
                let _ = page.close().await;
                return Err(PoolError::session_not_found(session_id));
            };
            session.pages.insert(page_id.clone(), page);
            session.touch();
        }

        self.bus.publish(
            topic::PAGE_CREATED,
            json!({ "sessionId": session_id, "pageId": page_id, "url": url }),
        );
        debug!(session = %session_id, page = %page_id, "page created");
        Ok(page_id)
    }

    pub async fn close_page(&self, session_id: &str, page_id: &str) -> PoolResult<bool> {
        let page = {
            let mut state = self.state.lock().await;
            let session = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| PoolError::session_not_found(session_id))?;
            session.touch();
            match session.pages.remove(page_id) {
                Some(p) => p,
                None => return Ok(false),
            }
        };

        if let Err(e) = page.close().await {
            debug!(page = %page_id, err = %e, "page close failed");
        }
        self.bus.publish(
            topic::PAGE_CLOSED,
            json!({ "sessionId": session_id, "pageId": page_id }),
        );
        Ok(true)
    }

    pub async fn page_info(&self, session_id: &str, page_id: &str) -> PoolResult<NavigationInfo> {
        let page = self.page_handle(session_id, page_id).await?;
        page.info().await.map_err(PoolError::from)
    }

    // ─── Page actions ────────────────────────────────────────────────────────
    //
    // Each action resolves the page under the lock (refreshing activity),
    // runs the engine call outside it with a bound, and publishes a single
    // `action.performed` event after the mutation committed.

    pub async fn navigate(
        &self,
        session_id: &str,
        page_id: &str,
        url: &str,
        timeout_ms: Option<u64>,
    ) -> PoolResult<NavigationInfo> {
        self.check_domain(url)?;
        let page = self.page_handle(session_id, page_id).await?;

        let timeout_secs = timeout_ms
            .map(|ms| ms.div_ceil(1000))
            .unwrap_or(self.config.page_load_timeout_secs);
        let info = match timeout(Duration::from_secs(timeout_secs), page.navigate(url)).await {
            Err(_) => {
                return Err(PoolError::NavigationTimeout {
                    url: url.to_string(),
                    timeout_secs,
                })
            }
            Ok(Err(e)) => return Err(PoolError::from(e)),
            Ok(Ok(info)) => info,
        };

        self.touch_session(session_id).await;
        self.publish_action(session_id, page_id, "navigate", json!({ "url": url }));
        Ok(info)
    }

    pub async fn click(&self, session_id: &str, page_id: &str, selector: &str) -> PoolResult<()> {
        let page = self.page_handle(session_id, page_id).await?;
        self.bounded("click", page.click(selector)).await?;
        self.publish_action(session_id, page_id, "click", json!({ "selector": selector }));
        Ok(())
    }

    pub async fn type_text(
        &self,
        session_id: &str,
        page_id: &str,
        selector: &str,
        text: &str,
    ) -> PoolResult<()> {
        let page = self.page_handle(session_id, page_id).await?;
        self.bounded("type", page.type_text(selector, text)).await?;
        // The typed text stays out of the event payload.
        self.publish_action(session_id, page_id, "type", json!({ "selector": selector }));
        Ok(())
    }

    /// Execute caller-supplied script in the page context. Trust boundary:
    /// only the internal orchestrator reaches this; isolation is whatever
    /// the engine provides.
    pub async fn evaluate(
        &self,
        session_id: &str,
        page_id: &str,
        expression: &str,
    ) -> PoolResult<Value> {
        let page = self.page_handle(session_id, page_id).await?;
        let bound = Duration::from_secs(self.config.page_load_timeout_secs);
        let value = match timeout(bound, page.evaluate(expression)).await {
            Err(_) => {
                return Err(PoolError::ScriptFailure(format!(
                    "script timed out after {}s",
                    self.config.page_load_timeout_secs
                )))
            }
            Ok(Err(e)) => return Err(PoolError::from(e)),
            Ok(Ok(v)) => v,
        };
        self.publish_action(session_id, page_id, "evaluate", json!({}));
        Ok(value)
    }

    pub async fn screenshot(
        &self,
        session_id: &str,
        page_id: &str,
        opts: &ScreenshotOptions,
    ) -> PoolResult<Vec<u8>> {
        let page = self.page_handle(session_id, page_id).await?;
        let bytes = self.bounded("screenshot", page.screenshot(opts)).await?;
        self.publish_action(
            session_id,
            page_id,
            "screenshot",
            json!({ "format": opts.format, "fullPage": opts.full_page }),
        );
        Ok(bytes)
    }

    pub async fn content(&self, session_id: &str, page_id: &str) -> PoolResult<String> {
        let page = self.page_handle(session_id, page_id).await?;
        self.bounded("content", page.content()).await
    }

    pub async fn wait_for(
        &self,
        session_id: &str,
        page_id: &str,
        selector: &str,
        timeout_ms: u64,
    ) -> PoolResult<()> {
        let page = self.page_handle(session_id, page_id).await?;
        page.wait_for_selector(selector, Duration::from_millis(timeout_ms))
            .await
            .map_err(PoolError::from)
    }

    // ─── Stats ───────────────────────────────────────────────────────────────

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            total_engines: state.engines.len(),
            active_engines: state
                .engines
                .iter()
                .filter(|s| s.state == EngineState::Active)
                .count(),
            max_engines: self.config.max_engines,
            active_sessions: state.sessions.len(),
            available_slots: self.slots.available_permits(),
            draining: self.is_draining(),
            sessions: state.sessions.values().map(Session::view).collect(),
        }
    }

    pub async fn active_session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    async fn page_handle(
        &self,
        session_id: &str,
        page_id: &str,
    ) -> PoolResult<Arc<dyn PageHandle>> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| PoolError::session_not_found(session_id))?;
        session.touch();
        session
            .pages
            .get(page_id)
            .cloned()
            .ok_or_else(|| PoolError::page_not_found(page_id))
    }

    async fn touch_session(&self, session_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.touch();
        }
    }

    /// Run an engine call with the configured action bound.
    async fn bounded<T>(
        &self,
        action: &str,
        fut: impl std::future::Future<Output = Result<T, EngineError>>,
    ) -> PoolResult<T> {
        let bound = Duration::from_secs(self.config.page_load_timeout_secs);
        match timeout(bound, fut).await {
            Err(_) => Err(PoolError::Internal(format!(
                "'{action}' timed out after {}s",
                self.config.page_load_timeout_secs
            ))),
            Ok(result) => result.map_err(PoolError::from),
        }
    }

    fn publish_action(&self, session_id: &str, page_id: &str, action: &str, detail: Value) {
        self.bus.publish(
            topic::ACTION_PERFORMED,
            json!({
                "sessionId": session_id,
                "pageId": page_id,
                "action": action,
                "detail": detail,
            }),
        );
    }

    fn check_domain(&self, url: &str) -> PoolResult<()> {
        if self.config.domain_allowed(url) {
            Ok(())
        } else {
            Err(PoolError::NavigationFailure(format!(
                "domain of '{url}' is not in the allowlist"
            )))
        }
    }
}

/// Backoff for replacement launches: 500ms doubling up to 30s.
fn replacement_backoff(attempt: u32) -> Duration {
    const BASE_MS: u64 = 500;
    const MAX_MS: u64 = 30_000;
    let shifted = BASE_MS.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(shifted.min(MAX_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockDriver;

    fn test_config(max_engines: usize) -> Arc<DaemonConfig> {
        Arc::new(DaemonConfig {
            max_engines,
            engine_type: "mock".to_string(),
            ..DaemonConfig::default()
        })
    }

    async fn started_pool(max_engines: usize) -> (Arc<PoolManager>, Arc<MockDriver>, EventBus) {
        let driver = Arc::new(MockDriver::new());
        let bus = EventBus::new();
        let pool = PoolManager::new(test_config(max_engines), driver.clone(), bus.clone());
        pool.start().await.unwrap();
        (pool, driver, bus)
    }

    #[tokio::test]
    async fn start_launches_full_set() {
        let (_pool, driver, _bus) = started_pool(3).await;
        assert_eq!(driver.engines().len(), 3);
    }

    #[tokio::test]
    async fn start_fails_when_nothing_launches() {
        let driver = Arc::new(MockDriver::new());
        driver.fail_next_launches(2);
        let pool = PoolManager::new(test_config(2), driver.clone(), EventBus::new());
        let err = pool.start().await.unwrap_err();
        assert!(matches!(err, PoolError::EngineLaunchFailure(_)));
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let (pool, _driver, _bus) = started_pool(2).await;
        let a = pool.create_session(None, HashMap::new()).await.unwrap();
        let _b = pool.create_session(None, HashMap::new()).await.unwrap();

        let err = pool.create_session(None, HashMap::new()).await.unwrap_err();
        assert!(matches!(err, PoolError::CapacityExceeded { active: 2, max: 2 }));

        // Freeing a slot admits the next caller.
        assert!(pool.close_session(&a.session_id).await.unwrap());
        pool.create_session(None, HashMap::new()).await.unwrap();
    }

    #[tokio::test]
    async fn close_session_is_idempotent() {
        let (pool, _driver, _bus) = started_pool(1).await;
        let view = pool.create_session(None, HashMap::new()).await.unwrap();
        assert!(pool.close_session(&view.session_id).await.unwrap());
        assert!(!pool.close_session(&view.session_id).await.unwrap());
    }

    #[tokio::test]
    async fn session_info_unknown_id_is_not_found() {
        let (pool, _driver, _bus) = started_pool(1).await;
        let err = pool.session_info("nope").await.unwrap_err();
        assert!(matches!(err, PoolError::NotFound { .. }));
    }

    #[tokio::test]
    async fn page_lifecycle_and_navigation() {
        let (pool, _driver, _bus) = started_pool(1).await;
        let session = pool.create_session(None, HashMap::new()).await.unwrap();
        let page_id = pool
            .create_page(&session.session_id, Some("https://example.com"))
            .await
            .unwrap();

        let info = pool
            .navigate(&session.session_id, &page_id, "https://example.org", None)
            .await
            .unwrap();
        assert_eq!(info.url, "https://example.org");

        assert!(pool.close_page(&session.session_id, &page_id).await.unwrap());
        assert!(!pool.close_page(&session.session_id, &page_id).await.unwrap());
    }

    #[tokio::test]
    async fn bad_navigation_keeps_the_session() {
        let (pool, _driver, _bus) = started_pool(1).await;
        let session = pool.create_session(None, HashMap::new()).await.unwrap();
        let err = pool
            .create_page(&session.session_id, Some("gopher://old.example"))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::NavigationFailure(_)));
        // Session survives the failed navigation.
        assert!(pool.session_info(&session.session_id).await.is_ok());
    }

    #[tokio::test]
    async fn domain_allowlist_blocks_navigation() {
        let driver = Arc::new(MockDriver::new());
        let config = Arc::new(DaemonConfig {
            max_engines: 1,
            allowed_domains: vec!["example.com".to_string()],
            ..DaemonConfig::default()
        });
        let pool = PoolManager::new(config, driver, EventBus::new());
        pool.start().await.unwrap();

        let session = pool.create_session(None, HashMap::new()).await.unwrap();
        assert!(pool
            .create_page(&session.session_id, Some("https://example.com"))
            .await
            .is_ok());
        let err = pool
            .create_page(&session.session_id, Some("https://evil.example"))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::NavigationFailure(_)));
    }

    #[tokio::test]
    async fn disconnect_closes_bound_sessions_and_replaces_engine() {
        let (pool, driver, bus) = started_pool(1).await;
        let mut rx = bus.subscribe();
        let session = pool.create_session(None, HashMap::new()).await.unwrap();

        driver.engines()[0].sever();

        // Wait for the session.closed broadcast driven by the monitor task.
        let mut closed = false;
        for _ in 0..20 {
            match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                Ok(Ok(ev)) if ev.topic == topic::SESSION_CLOSED => {
                    assert_eq!(ev.payload["sessionId"], session.session_id.as_str());
                    assert_eq!(ev.payload["reason"], "engine_disconnected");
                    closed = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(closed, "expected session.closed after engine disconnect");
        assert_eq!(pool.active_session_count().await, 0);

        // A replacement engine comes up.
        for _ in 0..50 {
            if driver.launch_count() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(driver.launch_count() >= 2, "expected a replacement launch");
    }

    #[tokio::test]
    async fn drain_rejects_new_sessions_and_closes_existing() {
        let (pool, _driver, _bus) = started_pool(2).await;
        let a = pool.create_session(None, HashMap::new()).await.unwrap();
        let b = pool.create_session(None, HashMap::new()).await.unwrap();

        let errors = pool.drain().await;
        assert!(errors.is_empty());
        assert_eq!(pool.active_session_count().await, 0);

        let err = pool.create_session(None, HashMap::new()).await.unwrap_err();
        assert!(matches!(err, PoolError::Draining));

        // Both sessions are gone.
        assert!(pool.session_info(&a.session_id).await.is_err());
        assert!(pool.session_info(&b.session_id).await.is_err());
    }

    #[test]
    fn backoff_caps_out() {
        assert_eq!(replacement_backoff(0), Duration::from_millis(500));
        assert_eq!(replacement_backoff(1), Duration::from_millis(1000));
        assert_eq!(replacement_backoff(10), Duration::from_secs(30));
        assert_eq!(replacement_backoff(u32::MAX), Duration::from_secs(30));
    }
}
