// =============================================================================
// Error types
// =============================================================================
//
// Store errors are returned, never thrown: a version conflict is an expected
// outcome of optimistic concurrency and callers match on it. `ExitError` is
// what the engine and service surface to their callers.
// =============================================================================

use uuid::Uuid;

use crate::exit::state::Phase;
use crate::types::IntentStatus;

/// Errors returned by repository implementations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("position {0} not found")]
    PositionNotFound(Uuid),

    #[error("position state for {0} not found")]
    StateNotFound(Uuid),

    #[error("version mismatch on {entity} {id}: expected {expected}, found {actual}")]
    VersionConflict {
        entity: &'static str,
        id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("intent already exists for action key {0}")]
    IntentExists(String),

    #[error("intent {0} not found")]
    IntentNotFound(Uuid),

    #[error("intent {id} cannot move from {from} to {to}")]
    InvalidIntentTransition {
        id: Uuid,
        from: IntentStatus,
        to: IntentStatus,
    },

    #[error("exit profile {0} not found")]
    ProfileNotFound(String),

    #[error("exit profile {id} version {version} is already published")]
    ProfileVersionExists { id: String, version: u32 },

    #[error("phase of {id} cannot move from {from} to {to} without a reset")]
    PhaseRegression { id: Uuid, from: Phase, to: Phase },

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from the best-price collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PriceFeedError {
    #[error("no price available for {0}")]
    NotAvailable(String),

    #[error("price feed error: {0}")]
    Upstream(String),
}

/// Errors surfaced by the exit engine and the exit service.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExitError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("exit profile {0} not found")]
    ProfileNotFound(String),

    #[error("invalid exit profile {profile_id}: {reason}")]
    InvalidProfile { profile_id: String, reason: String },

    #[error("position {0} is closed")]
    PositionClosed(Uuid),

    #[error("exit disabled for position {0}")]
    ExitDisabled(Uuid),

    #[error("no available quantity on position {0}")]
    NoAvailableQty(Uuid),

    #[error("invalid quantity {0}")]
    InvalidQuantity(i64),
}

impl ExitError {
    /// Concurrency conflicts are retried on the next cycle and are never
    /// reported as user-visible failures.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}
