pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod ipc;
pub mod pool;
pub mod stream;

use std::sync::Arc;
use std::time::Instant;

use config::DaemonConfig;
use events::EventBus;
use pool::PoolManager;

/// Shared application state passed to every handler and background task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub pool: Arc<PoolManager>,
    pub bus: EventBus,
    pub started_at: Instant,
}

impl AppContext {
    pub fn new(config: Arc<DaemonConfig>, pool: Arc<PoolManager>, bus: EventBus) -> Self {
        Self {
            config,
            pool,
            bus,
            started_at: Instant::now(),
        }
    }
}
