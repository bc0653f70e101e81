//! Typed error taxonomy for pool and control-plane operations.
//!
//! Every failure a caller can observe resolves to one of these variants;
//! raw engine failures are converted at the `engine` module boundary and
//! never escape as unstructured panics.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    /// All pool slots are taken. The caller should back off and retry —
    /// the daemon itself never retries admission.
    #[error("engine pool at capacity ({active} active sessions, max {max})")]
    CapacityExceeded { active: usize, max: usize },

    /// Unknown session or page — typically already reaped, or a caller bug.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Navigation did not complete within the configured bound. The session
    /// survives; only the waiting caller is released.
    #[error("navigation to '{url}' timed out after {timeout_secs}s")]
    NavigationTimeout { url: String, timeout_secs: u64 },

    /// The engine rejected or aborted a navigation. Surfaced verbatim.
    #[error("navigation failed: {0}")]
    NavigationFailure(String),

    /// Caller-supplied script failed inside the page context.
    #[error("script execution failed: {0}")]
    ScriptFailure(String),

    /// An engine process could not be launched. Fatal at startup when the
    /// minimum pool cannot be reached; retried with backoff for replacements.
    #[error("engine launch failed: {0}")]
    EngineLaunchFailure(String),

    /// The daemon is shutting down and no longer accepts new work.
    #[error("pool is draining — new sessions are rejected")]
    Draining,

    /// Anything that should not happen. Always logged with full context.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PoolError {
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "session",
            id: id.into(),
        }
    }

    pub fn page_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "page",
            id: id.into(),
        }
    }

    /// Machine-readable code used by both control planes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "resource_exhausted",
            Self::NotFound { .. } => "not_found",
            Self::NavigationTimeout { .. } => "navigation_timeout",
            Self::NavigationFailure(_) => "navigation_failed",
            Self::ScriptFailure(_) => "script_failed",
            Self::EngineLaunchFailure(_) => "engine_failure",
            Self::Draining => "draining",
            Self::Internal(_) => "internal",
        }
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            PoolError::CapacityExceeded { active: 2, max: 2 }.code(),
            "resource_exhausted"
        );
        assert_eq!(PoolError::session_not_found("s1").code(), "not_found");
        assert_eq!(PoolError::Draining.code(), "draining");
    }

    #[test]
    fn not_found_names_the_resource() {
        let err = PoolError::page_not_found("p-123");
        assert_eq!(err.to_string(), "page 'p-123' not found");
    }
}
