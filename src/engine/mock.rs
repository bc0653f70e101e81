//! In-process fake engine.
//!
//! Used by the test suite and selectable with `engine_type = "mock"` for
//! smoke-testing a deployment without a browser installed. Faithful to the
//! trait contract: contexts and pages are tracked, operations fail once the
//! engine is "disconnected", and tests can sever an engine on demand.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use super::{
    ContextHandle, EngineDriver, EngineError, EngineHandle, EngineResult, LaunchOptions,
    NavigationInfo, PageHandle, ScreenshotOptions,
};

// Minimal PNG header so screenshot consumers see plausible bytes.
const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(Default)]
struct DriverState {
    engines: Vec<Arc<MockEngine>>,
    fail_next_launches: usize,
    navigation_delay: Duration,
}

/// Test-facing driver. Keep a concrete `Arc<MockDriver>` around to reach the
/// hooks after handing a trait-object clone to the pool.
#[derive(Default)]
pub struct MockDriver {
    state: Mutex<DriverState>,
    launch_count: AtomicUsize,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every engine ever launched, in launch order.
    pub fn engines(&self) -> Vec<Arc<MockEngine>> {
        self.state.lock().unwrap().engines.clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launch_count.load(Ordering::SeqCst)
    }

    /// Make the next `n` launch attempts fail.
    pub fn fail_next_launches(&self, n: usize) {
        self.state.lock().unwrap().fail_next_launches = n;
    }

    /// Delay applied to every navigation (drives timeout tests).
    pub fn set_navigation_delay(&self, delay: Duration) {
        self.state.lock().unwrap().navigation_delay = delay;
    }
}

#[async_trait]
impl EngineDriver for MockDriver {
    async fn launch(&self, _opts: &LaunchOptions) -> EngineResult<Arc<dyn EngineHandle>> {
        self.launch_count.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.fail_next_launches > 0 {
            state.fail_next_launches -= 1;
            return Err(EngineError::Launch("mock launch failure".to_string()));
        }
        let engine = Arc::new(MockEngine::new(state.navigation_delay));
        state.engines.push(engine.clone());
        Ok(engine)
    }
}

pub struct MockEngine {
    disconnect_tx: watch::Sender<bool>,
    navigation_delay: Duration,
    closed: AtomicBool,
}

impl MockEngine {
    fn new(navigation_delay: Duration) -> Self {
        let (disconnect_tx, _) = watch::channel(false);
        Self {
            disconnect_tx,
            navigation_delay,
            closed: AtomicBool::new(false),
        }
    }

    /// Simulate the engine process dying.
    pub fn sever(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.disconnect_tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> EngineResult<()> {
        if self.is_closed() {
            Err(EngineError::Disconnected)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EngineHandle for MockEngine {
    async fn new_context(&self) -> EngineResult<Arc<dyn ContextHandle>> {
        self.ensure_alive()?;
        Ok(Arc::new(MockContext {
            disconnect_rx: self.disconnect_tx.subscribe(),
            navigation_delay: self.navigation_delay,
            closed: AtomicBool::new(false),
        }))
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnect_tx.subscribe()
    }

    async fn close(&self) -> EngineResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.disconnect_tx.send(true);
        Ok(())
    }
}

struct MockContext {
    disconnect_rx: watch::Receiver<bool>,
    navigation_delay: Duration,
    closed: AtomicBool,
}

impl MockContext {
    fn ensure_alive(&self) -> EngineResult<()> {
        if *self.disconnect_rx.borrow() {
            return Err(EngineError::Disconnected);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Other("context closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContextHandle for MockContext {
    async fn new_page(&self) -> EngineResult<Arc<dyn PageHandle>> {
        self.ensure_alive()?;
        Ok(Arc::new(MockPage {
            url: Mutex::new("about:blank".to_string()),
            navigation_delay: self.navigation_delay,
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> EngineResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockPage {
    url: Mutex<String>,
    navigation_delay: Duration,
    closed: AtomicBool,
}

impl MockPage {
    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EngineError::Other("page closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn title_for(url: &str) -> String {
        format!("mock: {url}")
    }
}

#[async_trait]
impl PageHandle for MockPage {
    async fn navigate(&self, url: &str) -> EngineResult<NavigationInfo> {
        self.ensure_open()?;
        if !url.starts_with("http://") && !url.starts_with("https://") && url != "about:blank" {
            return Err(EngineError::Navigation(format!(
                "cannot navigate to '{url}': unsupported scheme"
            )));
        }
        if !self.navigation_delay.is_zero() {
            tokio::time::sleep(self.navigation_delay).await;
        }
        *self.url.lock().unwrap() = url.to_string();
        Ok(NavigationInfo {
            url: url.to_string(),
            title: Self::title_for(url),
        })
    }

    async fn click(&self, selector: &str) -> EngineResult<()> {
        self.ensure_open()?;
        if selector.contains("#missing") {
            return Err(EngineError::Other(format!(
                "no node found for selector '{selector}'"
            )));
        }
        Ok(())
    }

    async fn type_text(&self, selector: &str, _text: &str) -> EngineResult<()> {
        self.ensure_open()?;
        if selector.contains("#missing") {
            return Err(EngineError::Other(format!(
                "no node found for selector '{selector}'"
            )));
        }
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> EngineResult<Value> {
        self.ensure_open()?;
        if expression.starts_with("throw") {
            return Err(EngineError::Script(format!(
                "uncaught exception in '{expression}'"
            )));
        }
        // Deterministic echo so both control planes can be compared exactly.
        Ok(Value::String(expression.to_string()))
    }

    async fn screenshot(&self, opts: &ScreenshotOptions) -> EngineResult<Vec<u8>> {
        self.ensure_open()?;
        let mut bytes = PNG_MAGIC.to_vec();
        bytes.extend_from_slice(if opts.full_page { b"full" } else { b"view" });
        Ok(bytes)
    }

    async fn content(&self) -> EngineResult<String> {
        self.ensure_open()?;
        let url = self.url.lock().unwrap().clone();
        Ok(format!("<html><body data-url=\"{url}\"></body></html>"))
    }

    async fn info(&self) -> EngineResult<NavigationInfo> {
        self.ensure_open()?;
        let url = self.url.lock().unwrap().clone();
        let title = Self::title_for(&url);
        Ok(NavigationInfo { url, title })
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> EngineResult<()> {
        self.ensure_open()?;
        if selector.contains("#never") {
            tokio::time::sleep(timeout).await;
            return Err(EngineError::Other(format!(
                "selector '{selector}' did not appear within {}ms",
                timeout.as_millis()
            )));
        }
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> LaunchOptions {
        LaunchOptions {
            headless: true,
            sandbox: true,
            viewport_width: 800,
            viewport_height: 600,
            user_agent: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn launch_context_page_roundtrip() {
        let driver = MockDriver::new();
        let engine = driver.launch(&opts()).await.unwrap();
        let ctx = engine.new_context().await.unwrap();
        let page = ctx.new_page().await.unwrap();

        let nav = page.navigate("https://example.com").await.unwrap();
        assert_eq!(nav.url, "https://example.com");
        assert!(page.content().await.unwrap().contains("example.com"));
    }

    #[tokio::test]
    async fn severed_engine_rejects_new_contexts() {
        let driver = MockDriver::new();
        let _engine = driver.launch(&opts()).await.unwrap();
        let mock = &driver.engines()[0];
        mock.sever();
        assert!(matches!(
            mock.new_context().await,
            Err(EngineError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn sever_fires_disconnect_watch() {
        let driver = MockDriver::new();
        let engine = driver.launch(&opts()).await.unwrap();
        let mut rx = engine.disconnected();
        driver.engines()[0].sever();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn failed_launches_count_down() {
        let driver = MockDriver::new();
        driver.fail_next_launches(1);
        assert!(driver.launch(&opts()).await.is_err());
        assert!(driver.launch(&opts()).await.is_ok());
        assert_eq!(driver.launch_count(), 2);
    }

    #[tokio::test]
    async fn bad_scheme_is_a_navigation_error() {
        let driver = MockDriver::new();
        let engine = driver.launch(&opts()).await.unwrap();
        let page = engine
            .new_context()
            .await
            .unwrap()
            .new_page()
            .await
            .unwrap();
        assert!(matches!(
            page.navigate("file:///etc/passwd").await,
            Err(EngineError::Navigation(_))
        ));
    }
}
