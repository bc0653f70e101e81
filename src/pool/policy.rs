//! Engine selection policy.
//!
//! Selection is pluggable so a fairness or least-loaded policy can be
//! substituted without touching pool-core logic. The shipped default takes
//! the first active engine unconditionally — a documented simplification,
//! not a load-balancing guarantee.

use super::{EngineId, EngineState};

/// What a policy gets to see about each engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineDescriptor {
    pub id: EngineId,
    pub state: EngineState,
    pub session_count: usize,
}

pub trait EngineSelector: Send + Sync {
    /// Pick an engine for a new session. `None` when no engine is usable.
    fn select(&self, engines: &[EngineDescriptor]) -> Option<EngineId>;
}

/// First active engine in list order.
pub struct FirstAvailable;

impl EngineSelector for FirstAvailable {
    fn select(&self, engines: &[EngineDescriptor]) -> Option<EngineId> {
        engines
            .iter()
            .find(|e| e.state == EngineState::Active)
            .map(|e| e.id)
    }
}

/// Engine with the fewest bound sessions. Not the default; exists to prove
/// the seam carries its weight.
pub struct LeastLoaded;

impl EngineSelector for LeastLoaded {
    fn select(&self, engines: &[EngineDescriptor]) -> Option<EngineId> {
        engines
            .iter()
            .filter(|e| e.state == EngineState::Active)
            .min_by_key(|e| e.session_count)
            .map(|e| e.id)
    }
}
