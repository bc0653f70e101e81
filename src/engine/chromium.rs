//! Chromium engine driver — drives a real browser over CDP.
//!
//! Each launched engine owns one browser process; sessions map onto isolated
//! browser contexts, pages onto targets inside that context. The CDP event
//! handler task doubles as the disconnect detector: when the event stream
//! ends, the process is gone and the disconnect watch flips.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use super::{
    ContextHandle, EngineDriver, EngineError, EngineHandle, EngineResult, LaunchOptions,
    NavigationInfo, PageHandle, ScreenshotOptions,
};

const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
pub struct ChromiumDriver;

impl ChromiumDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EngineDriver for ChromiumDriver {
    async fn launch(&self, opts: &LaunchOptions) -> EngineResult<Arc<dyn EngineHandle>> {
        let mut builder = BrowserConfig::builder();
        if !opts.headless {
            builder = builder.with_head();
        }
        if !opts.sandbox {
            builder = builder.arg("--no-sandbox").arg("--disable-setuid-sandbox");
        }
        let config = builder
            .window_size(opts.viewport_width, opts.viewport_height)
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg(format!("--user-agent={}", opts.user_agent))
            .build()
            .map_err(EngineError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| EngineError::Launch(e.to_string()))?;

        let (disconnect_tx, _) = watch::channel(false);
        let tx = disconnect_tx.clone();
        tokio::spawn(async move {
            // The handler stream ends when the browser process goes away.
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            debug!("chromium event stream ended");
            let _ = tx.send(true);
        });

        Ok(Arc::new(ChromiumEngine {
            browser: Arc::new(Mutex::new(browser)),
            disconnect_tx,
        }))
    }
}

pub struct ChromiumEngine {
    browser: Arc<Mutex<Browser>>,
    disconnect_tx: watch::Sender<bool>,
}

#[async_trait]
impl EngineHandle for ChromiumEngine {
    async fn new_context(&self) -> EngineResult<Arc<dyn ContextHandle>> {
        let context_id: BrowserContextId = {
            let browser = self.browser.lock().await;
            let resp = browser
                .execute(CreateBrowserContextParams::default())
                .await
                .map_err(|e| EngineError::Other(e.to_string()))?;
            resp.browser_context_id.clone()
        };
        Ok(Arc::new(ChromiumContext {
            browser: Arc::clone(&self.browser),
            context_id,
        }))
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnect_tx.subscribe()
    }

    async fn close(&self) -> EngineResult<()> {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            warn!(err = %e, "browser close failed");
        }
        if let Err(e) = browser.wait().await {
            debug!(err = %e, "browser wait after close failed");
        }
        let _ = self.disconnect_tx.send(true);
        Ok(())
    }
}

struct ChromiumContext {
    browser: Arc<Mutex<Browser>>,
    context_id: BrowserContextId,
}

#[async_trait]
impl ContextHandle for ChromiumContext {
    async fn new_page(&self) -> EngineResult<Arc<dyn PageHandle>> {
        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(self.context_id.clone())
            .build()
            .map_err(EngineError::Other)?;
        let page = {
            let browser = self.browser.lock().await;
            browser
                .new_page(params)
                .await
                .map_err(|e| EngineError::Other(e.to_string()))?
        };
        Ok(Arc::new(ChromiumPage { page }))
    }

    async fn close(&self) -> EngineResult<()> {
        let browser = self.browser.lock().await;
        browser
            .execute(DisposeBrowserContextParams::new(self.context_id.clone()))
            .await
            .map_err(|e| EngineError::Other(e.to_string()))?;
        Ok(())
    }
}

struct ChromiumPage {
    page: Page,
}

impl ChromiumPage {
    async fn current_info(&self, fallback_url: &str) -> NavigationInfo {
        let url = self
            .page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| fallback_url.to_string());
        let title = self.page.get_title().await.ok().flatten().unwrap_or_default();
        NavigationInfo { url, title }
    }
}

#[async_trait]
impl PageHandle for ChromiumPage {
    async fn navigate(&self, url: &str) -> EngineResult<NavigationInfo> {
        self.page
            .goto(url)
            .await
            .map_err(|e| EngineError::Navigation(e.to_string()))?;
        // Settle — navigation errors past this point are soft (SPA redirects).
        let _ = self.page.wait_for_navigation().await;
        Ok(self.current_info(url).await)
    }

    async fn click(&self, selector: &str) -> EngineResult<()> {
        self.page
            .find_element(selector)
            .await
            .map_err(|e| EngineError::Other(e.to_string()))?
            .click()
            .await
            .map_err(|e| EngineError::Other(e.to_string()))?;
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> EngineResult<()> {
        self.page
            .find_element(selector)
            .await
            .map_err(|e| EngineError::Other(e.to_string()))?
            .click()
            .await
            .map_err(|e| EngineError::Other(e.to_string()))?
            .type_str(text)
            .await
            .map_err(|e| EngineError::Other(e.to_string()))?;
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> EngineResult<Value> {
        let result = self
            .page
            .evaluate(expression)
            .await
            .map_err(|e| EngineError::Script(e.to_string()))?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn screenshot(&self, opts: &ScreenshotOptions) -> EngineResult<Vec<u8>> {
        let format = match opts.format.as_str() {
            "jpeg" => CaptureScreenshotFormat::Jpeg,
            _ => CaptureScreenshotFormat::Png,
        };
        let mut builder = ScreenshotParams::builder()
            .format(format)
            .full_page(opts.full_page);
        if let Some(quality) = opts.quality {
            builder = builder.quality(quality as i64);
        }
        self.page
            .screenshot(builder.build())
            .await
            .map_err(|e| EngineError::Other(e.to_string()))
    }

    async fn content(&self) -> EngineResult<String> {
        self.page
            .content()
            .await
            .map_err(|e| EngineError::Other(e.to_string()))
    }

    async fn info(&self) -> EngineResult<NavigationInfo> {
        Ok(self.current_info("about:blank").await)
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> EngineResult<()> {
        let quoted = serde_json::to_string(selector)
            .map_err(|e| EngineError::Other(e.to_string()))?;
        let check = format!("document.querySelector({quoted}) !== null");
        let deadline = tokio::time::Instant::now() + timeout;

        while tokio::time::Instant::now() < deadline {
            let found: bool = self
                .page
                .evaluate(check.as_str())
                .await
                .map_err(|e| EngineError::Script(e.to_string()))?
                .into_value()
                .unwrap_or(false);
            if found {
                return Ok(());
            }
            tokio::time::sleep(SELECTOR_POLL_INTERVAL).await;
        }
        Err(EngineError::Other(format!(
            "selector '{selector}' did not appear within {}ms",
            timeout.as_millis()
        )))
    }

    async fn close(&self) -> EngineResult<()> {
        self.page
            .clone()
            .close()
            .await
            .map_err(|e| EngineError::Other(e.to_string()))
    }
}
