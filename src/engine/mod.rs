//! Engine adapter boundary.
//!
//! The underlying automation engine (a real browser) is an external
//! collaborator. This module defines the narrow trait surface the pool talks
//! through — launch, new-context, new-page, navigate, interact, capture —
//! and converts every engine failure into a typed [`EngineError`] so a raw
//! crash never reaches a caller.

pub mod chromium;
pub mod mock;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::DaemonConfig;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("launch failed: {0}")]
    Launch(String),
    #[error("engine disconnected")]
    Disconnected,
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("script failed: {0}")]
    Script(String),
    #[error("{0}")]
    Other(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Options applied when launching an engine process.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub headless: bool,
    pub sandbox: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub user_agent: String,
}

impl LaunchOptions {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            headless: config.headless,
            sandbox: config.sandbox_enabled,
            viewport_width: config.viewport_width,
            viewport_height: config.viewport_height,
            user_agent: config.user_agent.clone(),
        }
    }
}

/// Screenshot capture options (format/quality follow the CDP surface).
#[derive(Debug, Clone)]
pub struct ScreenshotOptions {
    pub full_page: bool,
    /// "png" or "jpeg".
    pub format: String,
    /// JPEG quality 0-100; ignored for PNG.
    pub quality: Option<u32>,
}

impl Default for ScreenshotOptions {
    fn default() -> Self {
        Self {
            full_page: false,
            format: "png".to_string(),
            quality: None,
        }
    }
}

/// Where a page ended up after navigation.
#[derive(Debug, Clone, Default)]
pub struct NavigationInfo {
    pub url: String,
    pub title: String,
}

/// Launches engine processes. One driver per daemon; the pool calls it for
/// the initial set and for crash replacements.
#[async_trait]
pub trait EngineDriver: Send + Sync {
    async fn launch(&self, opts: &LaunchOptions) -> EngineResult<Arc<dyn EngineHandle>>;
}

/// A single running engine process.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// Create an isolated browsing context inside this engine.
    async fn new_context(&self) -> EngineResult<Arc<dyn ContextHandle>>;

    /// Receiver that flips to `true` when the engine process goes away.
    /// The pool's monitor task watches this to trigger replacement.
    fn disconnected(&self) -> watch::Receiver<bool>;

    async fn close(&self) -> EngineResult<()>;
}

/// An isolated browsing context (one per session).
#[async_trait]
pub trait ContextHandle: Send + Sync {
    async fn new_page(&self) -> EngineResult<Arc<dyn PageHandle>>;
    async fn close(&self) -> EngineResult<()>;
}

/// A single browsable document.
#[async_trait]
pub trait PageHandle: Send + Sync {
    async fn navigate(&self, url: &str) -> EngineResult<NavigationInfo>;
    async fn click(&self, selector: &str) -> EngineResult<()>;
    async fn type_text(&self, selector: &str, text: &str) -> EngineResult<()>;
    /// Run caller-supplied script in the page context and return its value.
    async fn evaluate(&self, expression: &str) -> EngineResult<Value>;
    async fn screenshot(&self, opts: &ScreenshotOptions) -> EngineResult<Vec<u8>>;
    async fn content(&self) -> EngineResult<String>;
    async fn info(&self) -> EngineResult<NavigationInfo>;
    /// Poll until `selector` matches an element or `timeout` elapses.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> EngineResult<()>;
    async fn close(&self) -> EngineResult<()>;
}

/// Pick the driver named by `engine_type`.
pub fn driver_for(config: &DaemonConfig) -> EngineResult<Arc<dyn EngineDriver>> {
    match config.engine_type.as_str() {
        "chromium" => Ok(Arc::new(chromium::ChromiumDriver::new())),
        "mock" => Ok(Arc::new(mock::MockDriver::new())),
        other => Err(EngineError::Launch(format!(
            "unknown engine type '{other}' (expected \"chromium\" or \"mock\")"
        ))),
    }
}
