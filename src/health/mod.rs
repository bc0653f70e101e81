//! Health surface derivation.
//!
//! `ready` answers "can a new session be admitted right now"; `status`
//! reports pool condition relative to its target size. Both are derived
//! from the same stats snapshot the control planes serve.

use serde::Serialize;

use crate::pool::PoolStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolHealth {
    pub ready: bool,
    pub status: HealthStatus,
    pub active_sessions: usize,
    pub available_slots: usize,
}

pub fn evaluate(stats: &PoolStats) -> PoolHealth {
    let ready = !stats.draining && stats.available_slots > 0 && stats.active_engines > 0;
    let status = if !stats.draining && stats.active_engines >= stats.max_engines {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };
    PoolHealth {
        ready,
        status,
        active_sessions: stats.active_sessions,
        available_slots: stats.available_slots,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(active_engines: usize, available: usize, draining: bool) -> PoolStats {
        PoolStats {
            total_engines: active_engines,
            active_engines,
            max_engines: 2,
            active_sessions: 2 - available,
            available_slots: available,
            draining,
            sessions: Vec::new(),
        }
    }

    #[test]
    fn full_pool_is_healthy_and_ready() {
        let h = evaluate(&stats(2, 2, false));
        assert!(h.ready);
        assert_eq!(h.status, HealthStatus::Healthy);
    }

    #[test]
    fn missing_engine_degrades_but_stays_ready() {
        let h = evaluate(&stats(1, 1, false));
        assert!(h.ready);
        assert_eq!(h.status, HealthStatus::Degraded);
    }

    #[test]
    fn saturated_pool_is_not_ready() {
        let h = evaluate(&stats(2, 0, false));
        assert!(!h.ready);
        assert_eq!(h.status, HealthStatus::Healthy);
    }

    #[test]
    fn draining_is_neither_ready_nor_healthy() {
        let h = evaluate(&stats(2, 2, true));
        assert!(!h.ready);
        assert_eq!(h.status, HealthStatus::Degraded);
    }
}
