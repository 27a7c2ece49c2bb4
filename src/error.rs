//! Structured error taxonomy for the core. `anyhow` carries errors at module boundaries
//! (config load, backend client calls); once an error reaches the scheduler, the policy
//! chain, or the session manager it is always a concrete `OrchestratorError` so those
//! layers can match on kind instead of classifying message strings.

use crate::model::ResourceInfo;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    #[error("auth: {0}")]
    Auth(String),

    #[error("capacity shortage: requested {requested:?}, available {available:?}")]
    CapacityShortage {
        requested: ResourceInfo,
        available: ResourceInfo,
    },

    #[error("backend failure: {0}")]
    BackendFailure(String),

    #[error("policy rejected by {policy_name}: {reason}")]
    PolicyRejection { policy_name: String, reason: String },

    #[error("no capacity available after exhausting all candidates")]
    NoCapacity,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("peer has no autonomous scheduler")]
    NoScheduler,

    #[error("fatal configuration: {0}")]
    FatalConfig(String),
}

impl OrchestratorError {
    /// The single configurable predicate the scheduler's non-escalation rule consults to
    /// decide whether a local failure should promote to peer delegation. Provider adapters
    /// map whatever raw error their backend client returns onto this enum at the boundary;
    /// this is where a backend that only exposes string errors plugs into
    /// `scheduler.local_error_classifier_patterns`.
    pub fn is_capacity_shortage(&self) -> bool {
        matches!(self, OrchestratorError::CapacityShortage { .. })
    }

    /// Classify a raw backend error string using a configurable pattern list, for backends
    /// whose client library has no structured error type of its own. `requested`/`available`
    /// are threaded through from the call site so a matched shortage carries real figures
    /// rather than zeroed-out placeholders.
    pub fn classify_backend_text(text: &str, shortage_patterns: &[String], requested: ResourceInfo, available: ResourceInfo) -> OrchestratorError {
        let lower = text.to_lowercase();
        if shortage_patterns.iter().any(|p| lower.contains(&p.to_lowercase())) {
            OrchestratorError::CapacityShortage { requested, available }
        } else {
            OrchestratorError::BackendFailure(text.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
