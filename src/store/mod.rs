// =============================================================================
// Persistence seams
// =============================================================================
//
// The engine talks to storage only through these traits. Every write that
// depends on a previous read carries the version it read; implementations
// must reject the write with `StoreError::VersionConflict` when the stored
// version has moved on, and must enforce `action_key` uniqueness on intents.
// =============================================================================

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::errors::StoreResult;
use crate::exit::control::ExitControl;
use crate::exit::profile::{ExitProfile, SymbolOverride};
use crate::exit::state::{Phase, PositionState};
use crate::intent::{ExitSignal, OrderIntent};
use crate::position::{HoldingSnapshot, Position};
use crate::types::{ControlMode, ExitMode, IntentStatus, PositionStatus};

pub use memory::InMemoryStore;

#[async_trait]
pub trait PositionRepository: Send + Sync {
    async fn get_position(&self, position_id: Uuid) -> StoreResult<Position>;

    /// OPEN positions, optionally restricted to one account.
    async fn open_positions(&self, account_id: Option<&str>) -> StoreResult<Vec<Position>>;

    async fn update_status(
        &self,
        position_id: Uuid,
        status: PositionStatus,
        expected_version: u64,
    ) -> StoreResult<Position>;

    async fn update_exit_mode(
        &self,
        position_id: Uuid,
        exit_mode: ExitMode,
        exit_profile_id: Option<String>,
        expected_version: u64,
    ) -> StoreResult<Position>;

    /// Apply a broker holding. Creates the position (and its FSM record) the
    /// first time an (account, symbol) is seen, updates qty/avg otherwise and
    /// closes it when qty reaches zero. A quantity decrease is booked as a
    /// fill against the position's SUBMITTED intents, oldest first.
    async fn sync_holding(&self, holding: &HoldingSnapshot) -> StoreResult<Position>;

    /// Return a CLOSING position to OPEN, with a fresh FSM episode, once no
    /// active intent holds any of its shares. `None` when nothing changed.
    async fn reopen_if_unlocked(&self, position_id: Uuid) -> StoreResult<Option<Position>>;
}

/// Everything one evaluation writes, committed atomically.
#[derive(Debug, Clone)]
pub struct EvaluationCommit {
    pub position_id: Uuid,
    /// Position version read at the start of the evaluation.
    pub expected_position_version: u64,
    /// State version read at the start of the evaluation.
    pub expected_state_version: u64,
    pub state: PositionState,
    /// Status to write on the position in the same transaction.
    pub position_status: Option<PositionStatus>,
}

#[async_trait]
pub trait PositionStateRepository: Send + Sync {
    async fn get_state(&self, position_id: Uuid) -> StoreResult<PositionState>;

    /// Compare-and-swap on both versions. Rejects a phase regression that is
    /// not accompanied by a new episode.
    async fn commit_evaluation(&self, commit: EvaluationCommit) -> StoreResult<PositionState>;

    /// Cache a volatility measure. Bumps the state version.
    async fn update_volatility(&self, position_id: Uuid, atr: Decimal) -> StoreResult<PositionState>;

    async fn phase(&self, position_id: Uuid) -> StoreResult<Phase> {
        Ok(self.get_state(position_id).await?.phase)
    }
}

#[async_trait]
pub trait ExitProfileRepository: Send + Sync {
    /// Latest published version.
    async fn get_profile(&self, profile_id: &str) -> StoreResult<ExitProfile>;

    async fn get_profile_version(&self, profile_id: &str, version: u32) -> StoreResult<ExitProfile>;

    /// Latest version of every active profile.
    async fn active_profiles(&self) -> StoreResult<Vec<ExitProfile>>;

    /// Publish a new immutable version. Re-publishing a version fails.
    async fn publish_profile(&self, profile: ExitProfile) -> StoreResult<()>;

    async fn set_profile_active(&self, profile_id: &str, active: bool) -> StoreResult<ExitProfile>;
}

#[async_trait]
pub trait SymbolOverrideRepository: Send + Sync {
    async fn get_override(&self, symbol: &str) -> StoreResult<Option<SymbolOverride>>;

    async fn all_overrides(&self) -> StoreResult<Vec<SymbolOverride>>;

    async fn upsert_override(&self, over: SymbolOverride) -> StoreResult<()>;

    /// Returns `true` when an override was removed.
    async fn delete_override(&self, symbol: &str) -> StoreResult<bool>;
}

#[async_trait]
pub trait ExitControlRepository: Send + Sync {
    async fn get_control(&self) -> StoreResult<ExitControl>;

    async fn update_control(
        &self,
        mode: ControlMode,
        reason: Option<String>,
        updated_by: &str,
    ) -> StoreResult<ExitControl>;
}

#[async_trait]
pub trait OrderIntentRepository: Send + Sync {
    /// Insert, failing with `IntentExists` when the action key is taken.
    async fn create_intent(&self, intent: OrderIntent) -> StoreResult<()>;

    async fn get_intent(&self, intent_id: Uuid) -> StoreResult<OrderIntent>;

    async fn intent_by_action_key(&self, action_key: &str) -> StoreResult<Option<OrderIntent>>;

    /// Move an intent to `to`. When `from` is given the current status must
    /// match it. The transition must be allowed by `IntentStatus`.
    async fn transition_intent(
        &self,
        intent_id: Uuid,
        from: Option<IntentStatus>,
        to: IntentStatus,
    ) -> StoreResult<OrderIntent>;

    /// Most recent first.
    async fn recent_intents(&self, limit: usize) -> StoreResult<Vec<OrderIntent>>;

    async fn intents_for_position(&self, position_id: Uuid) -> StoreResult<Vec<OrderIntent>>;

    /// Quantity held by active intents against a position.
    async fn locked_qty(&self, position_id: Uuid) -> StoreResult<i64>;
}

#[async_trait]
pub trait ExitSignalRepository: Send + Sync {
    async fn insert_signal(&self, signal: ExitSignal) -> StoreResult<()>;

    /// Most recent first.
    async fn signals_for_position(&self, position_id: Uuid, limit: usize) -> StoreResult<Vec<ExitSignal>>;
}

/// Handles to every repository the engine and service use.
#[derive(Clone)]
pub struct Repositories {
    pub positions: Arc<dyn PositionRepository>,
    pub states: Arc<dyn PositionStateRepository>,
    pub profiles: Arc<dyn ExitProfileRepository>,
    pub overrides: Arc<dyn SymbolOverrideRepository>,
    pub control: Arc<dyn ExitControlRepository>,
    pub intents: Arc<dyn OrderIntentRepository>,
    pub signals: Arc<dyn ExitSignalRepository>,
}

impl Repositories {
    /// Every repository backed by one in-memory store.
    pub fn from_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            positions: store.clone(),
            states: store.clone(),
            profiles: store.clone(),
            overrides: store.clone(),
            control: store.clone(),
            intents: store.clone(),
            signals: store,
        }
    }
}
