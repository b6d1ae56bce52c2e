//! Error types for the Canopy domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Canopy operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Orchestrator errors ---
    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable machine-readable kind, surfaced in error events and run records.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Provider(e) => e.kind(),
            Error::Store(e) => e.kind(),
            Error::Orchestrator(e) => e.kind(),
            Error::Config { .. } => "config",
            Error::Serialization(_) => "serialization",
            Error::Internal(_) => "internal",
        }
    }
}

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("No API key supplied and no default key configured")]
    MissingKey,

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Prompt blocked by provider policy: {0}")]
    BlockedByPolicy(String),

    #[error("Provider returned an empty completion")]
    EmptyCompletion,

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },
}

impl ProviderError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::MissingKey => "missing_key",
            ProviderError::Transport(_) => "transport_failure",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::BlockedByPolicy(_) => "blocked_by_policy",
            ProviderError::EmptyCompletion => "empty_completion",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::Api { .. } => "api_error",
        }
    }

    /// Whether a fresh attempt at the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transport(_) | ProviderError::RateLimited { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cross-session violation: {entity} belongs to a different session")]
    CrossSessionViolation { entity: String },

    #[error("Re-parenting {agent_id} under {parent_id} would create a cycle")]
    WouldCreateCycle { agent_id: String, parent_id: String },

    #[error("Run {run_id} is not pending (status: {status})")]
    RunAlreadyStartedOrFinished { run_id: String, status: String },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "not_found",
            StoreError::CrossSessionViolation { .. } => "cross_session_violation",
            StoreError::WouldCreateCycle { .. } => "would_create_cycle",
            StoreError::RunAlreadyStartedOrFinished { .. } => "run_already_started_or_finished",
            StoreError::Storage(_) => "storage",
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Snapshot unavailable: {0}")]
    SnapshotUnavailable(String),

    #[error("Run timed out after {0}s")]
    RunTimeout(u64),

    #[error("Event channel closed by consumer")]
    ChannelClosed,
}

impl OrchestratorError {
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::SnapshotUnavailable(_) => "snapshot_unavailable",
            OrchestratorError::RunTimeout(_) => "run_timeout",
            OrchestratorError::ChannelClosed => "channel_closed",
        }
    }
}
