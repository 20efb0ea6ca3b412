// =============================================================================
// In-memory store — every repository behind one lock
// =============================================================================
//
// All tables live under a single `parking_lot::RwLock`, so any one method is
// a transaction: `commit_evaluation` checks both versions and writes the
// state and the position status without another writer interleaving.
// No lock is ever held across an `.await`.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::{StoreError, StoreResult};
use crate::exit::control::ExitControl;
use crate::exit::profile::{ExitProfile, SymbolOverride};
use crate::exit::state::{Phase, PositionState};
use crate::intent::{ExitSignal, OrderIntent};
use crate::position::{HoldingSnapshot, Position};
use crate::types::{ControlMode, ExitMode, IntentStatus, PositionStatus};

use super::{
    EvaluationCommit, ExitControlRepository, ExitProfileRepository, ExitSignalRepository,
    OrderIntentRepository, PositionRepository, PositionStateRepository, SymbolOverrideRepository,
};

struct Tables {
    positions: HashMap<Uuid, Position>,
    /// (account, symbol) -> latest position for that holding.
    by_holding: HashMap<(String, String), Uuid>,
    states: HashMap<Uuid, PositionState>,
    /// Published versions per profile id, ascending.
    profiles: HashMap<String, Vec<ExitProfile>>,
    overrides: HashMap<String, SymbolOverride>,
    control: ExitControl,
    intents: HashMap<Uuid, OrderIntent>,
    /// Creation order.
    intent_log: Vec<Uuid>,
    action_keys: HashMap<String, Uuid>,
    signals: VecDeque<ExitSignal>,
}

pub struct InMemoryStore {
    tables: RwLock<Tables>,
    max_signals: usize,
}

impl InMemoryStore {
    pub fn new(max_signals: usize) -> Self {
        Self {
            tables: RwLock::new(Tables {
                positions: HashMap::new(),
                by_holding: HashMap::new(),
                states: HashMap::new(),
                profiles: HashMap::new(),
                overrides: HashMap::new(),
                control: ExitControl::running(Utc::now()),
                intents: HashMap::new(),
                intent_log: Vec::new(),
                action_keys: HashMap::new(),
                signals: VecDeque::new(),
            }),
            max_signals: max_signals.max(1),
        }
    }

    /// Insert a position together with a fresh FSM record.
    pub fn insert_position(&self, position: Position) -> PositionState {
        let now = Utc::now();
        let state = PositionState::new(position.position_id, now);
        let mut t = self.tables.write();
        t.by_holding.insert(
            (position.account_id.clone(), position.symbol.clone()),
            position.position_id,
        );
        t.states.insert(position.position_id, state.clone());
        t.positions.insert(position.position_id, position);
        state
    }

    pub fn position_count(&self) -> usize {
        self.tables.read().positions.len()
    }
}

impl Tables {
    fn locked_qty(&self, position_id: Uuid) -> i64 {
        self.intents
            .values()
            .filter(|i| i.position_id == position_id)
            .map(OrderIntent::remaining_qty)
            .sum()
    }

    /// Book `filled` shares against the position's SUBMITTED intents, oldest
    /// first.
    fn book_fill(&mut self, position_id: Uuid, mut filled: i64) {
        let mut working: Vec<&mut OrderIntent> = self
            .intents
            .values_mut()
            .filter(|i| i.position_id == position_id && i.status == IntentStatus::Submitted)
            .collect();
        working.sort_by_key(|i| i.created_ts);
        for intent in working {
            if filled <= 0 {
                break;
            }
            let take = filled.min(intent.qty - intent.filled_qty).max(0);
            if take == 0 {
                continue;
            }
            intent.filled_qty += take;
            intent.updated_ts = Utc::now();
            filled -= take;
            debug!(
                intent_id = %intent.intent_id,
                filled = intent.filled_qty,
                qty = intent.qty,
                "fill booked against intent"
            );
        }
    }

    fn reopen_if_unlocked(&mut self, position_id: Uuid) -> StoreResult<Option<Position>> {
        let locked = self.locked_qty(position_id);
        let Tables {
            positions, states, ..
        } = self;
        let pos = positions
            .get_mut(&position_id)
            .ok_or(StoreError::PositionNotFound(position_id))?;
        if pos.status != PositionStatus::Closing || pos.qty <= 0 || locked > 0 {
            return Ok(None);
        }
        let state = states
            .get_mut(&position_id)
            .ok_or(StoreError::StateNotFound(position_id))?;

        let now = Utc::now();
        pos.status = PositionStatus::Open;
        pos.version += 1;
        pos.updated_ts = now;
        state.reset_to_open(pos.avg_price);
        state.version += 1;
        state.updated_ts = now;
        info!(
            position_id = %position_id,
            symbol = %pos.symbol,
            qty = pos.qty,
            episode = state.episode,
            "closing position has no working exit left, reopened"
        );
        Ok(Some(pos.clone()))
    }
}

fn check_version(entity: &'static str, id: Uuid, expected: u64, actual: u64) -> StoreResult<()> {
    if expected != actual {
        return Err(StoreError::VersionConflict {
            entity,
            id,
            expected,
            actual,
        });
    }
    Ok(())
}

// =============================================================================
// Positions
// =============================================================================

#[async_trait]
impl PositionRepository for InMemoryStore {
    async fn get_position(&self, position_id: Uuid) -> StoreResult<Position> {
        self.tables
            .read()
            .positions
            .get(&position_id)
            .cloned()
            .ok_or(StoreError::PositionNotFound(position_id))
    }

    async fn open_positions(&self, account_id: Option<&str>) -> StoreResult<Vec<Position>> {
        let t = self.tables.read();
        let mut open: Vec<Position> = t
            .positions
            .values()
            .filter(|p| p.is_open())
            .filter(|p| account_id.map_or(true, |a| p.account_id == a))
            .cloned()
            .collect();
        open.sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.entry_ts.cmp(&b.entry_ts)));
        Ok(open)
    }

    async fn update_status(
        &self,
        position_id: Uuid,
        status: PositionStatus,
        expected_version: u64,
    ) -> StoreResult<Position> {
        let mut t = self.tables.write();
        let pos = t
            .positions
            .get_mut(&position_id)
            .ok_or(StoreError::PositionNotFound(position_id))?;
        check_version("position", position_id, expected_version, pos.version)?;
        pos.status = status;
        pos.version += 1;
        pos.updated_ts = Utc::now();
        Ok(pos.clone())
    }

    async fn update_exit_mode(
        &self,
        position_id: Uuid,
        exit_mode: ExitMode,
        exit_profile_id: Option<String>,
        expected_version: u64,
    ) -> StoreResult<Position> {
        let mut t = self.tables.write();
        let pos = t
            .positions
            .get_mut(&position_id)
            .ok_or(StoreError::PositionNotFound(position_id))?;
        check_version("position", position_id, expected_version, pos.version)?;
        pos.exit_mode = exit_mode;
        pos.exit_profile_id = exit_profile_id;
        pos.version += 1;
        pos.updated_ts = Utc::now();
        Ok(pos.clone())
    }

    async fn sync_holding(&self, holding: &HoldingSnapshot) -> StoreResult<Position> {
        let now = Utc::now();
        let mut t = self.tables.write();
        let key = (holding.account_id.clone(), holding.symbol.clone());

        let existing = t
            .by_holding
            .get(&key)
            .copied()
            .filter(|id| t.positions.get(id).map_or(false, |p| p.status != PositionStatus::Closed));

        let Some(position_id) = existing else {
            if holding.qty <= 0 {
                // Already flat: report the last closed lot if there is one.
                if let Some(closed) = t.by_holding.get(&key).and_then(|id| t.positions.get(id)) {
                    return Ok(closed.clone());
                }
                return Err(StoreError::Backend(format!(
                    "no open position for {}/{} to close",
                    holding.account_id, holding.symbol
                )));
            }
            let position = Position::from_holding(holding, now);
            let id = position.position_id;
            info!(
                position_id = %id,
                account = %holding.account_id,
                symbol = %holding.symbol,
                qty = holding.qty,
                avg_price = %holding.avg_price,
                "position opened from holding"
            );
            t.by_holding.insert(key, id);
            t.states.insert(id, PositionState::new(id, now));
            t.positions.insert(id, position.clone());
            return Ok(position);
        };

        let previous_qty = {
            let Tables {
                positions, states, ..
            } = &mut *t;
            let pos = positions
                .get_mut(&position_id)
                .ok_or(StoreError::PositionNotFound(position_id))?;

            if holding.qty <= 0 {
                pos.qty = 0;
                pos.status = PositionStatus::Closed;
                pos.version += 1;
                pos.updated_ts = now;
                if let Some(state) = states.get_mut(&position_id) {
                    state.phase = Phase::Closed;
                    state.version += 1;
                    state.updated_ts = now;
                }
                info!(position_id = %position_id, symbol = %pos.symbol, "position closed by holding sync");
                return Ok(pos.clone());
            }

            let previous_qty = pos.qty;
            if pos.qty != holding.qty || pos.avg_price != holding.avg_price {
                debug!(
                    position_id = %position_id,
                    symbol = %pos.symbol,
                    qty_from = pos.qty,
                    qty_to = holding.qty,
                    avg_from = %pos.avg_price,
                    avg_to = %holding.avg_price,
                    "holding resynced"
                );
                pos.qty = holding.qty;
                pos.original_qty = pos.original_qty.max(holding.qty);
                pos.avg_price = holding.avg_price;
                pos.version += 1;
                pos.updated_ts = now;
            }
            previous_qty
        };

        if holding.qty < previous_qty {
            t.book_fill(position_id, previous_qty - holding.qty);
        }
        if let Some(reopened) = t.reopen_if_unlocked(position_id)? {
            return Ok(reopened);
        }
        t.positions
            .get(&position_id)
            .cloned()
            .ok_or(StoreError::PositionNotFound(position_id))
    }

    async fn reopen_if_unlocked(&self, position_id: Uuid) -> StoreResult<Option<Position>> {
        self.tables.write().reopen_if_unlocked(position_id)
    }
}

// =============================================================================
// FSM state
// =============================================================================

#[async_trait]
impl PositionStateRepository for InMemoryStore {
    async fn get_state(&self, position_id: Uuid) -> StoreResult<PositionState> {
        self.tables
            .read()
            .states
            .get(&position_id)
            .cloned()
            .ok_or(StoreError::StateNotFound(position_id))
    }

    async fn commit_evaluation(&self, commit: EvaluationCommit) -> StoreResult<PositionState> {
        let id = commit.position_id;
        let now = Utc::now();
        let mut t = self.tables.write();
        let Tables {
            positions, states, ..
        } = &mut *t;

        let pos = positions.get_mut(&id).ok_or(StoreError::PositionNotFound(id))?;
        check_version("position", id, commit.expected_position_version, pos.version)?;

        let stored = states.get_mut(&id).ok_or(StoreError::StateNotFound(id))?;
        check_version("position_state", id, commit.expected_state_version, stored.version)?;

        if commit.state.regresses(stored) {
            return Err(StoreError::PhaseRegression {
                id,
                from: stored.phase,
                to: commit.state.phase,
            });
        }

        let mut next = commit.state;
        next.version = stored.version + 1;
        next.updated_ts = now;
        *stored = next.clone();

        if let Some(status) = commit.position_status {
            pos.status = status;
            pos.version += 1;
            pos.updated_ts = now;
        }
        Ok(next)
    }

    async fn update_volatility(&self, position_id: Uuid, atr: Decimal) -> StoreResult<PositionState> {
        let mut t = self.tables.write();
        let state = t
            .states
            .get_mut(&position_id)
            .ok_or(StoreError::StateNotFound(position_id))?;
        state.volatility = Some(atr);
        state.version += 1;
        state.updated_ts = Utc::now();
        Ok(state.clone())
    }
}

// =============================================================================
// Profiles and overrides
// =============================================================================

#[async_trait]
impl ExitProfileRepository for InMemoryStore {
    async fn get_profile(&self, profile_id: &str) -> StoreResult<ExitProfile> {
        self.tables
            .read()
            .profiles
            .get(profile_id)
            .and_then(|versions| versions.last())
            .cloned()
            .ok_or_else(|| StoreError::ProfileNotFound(profile_id.to_string()))
    }

    async fn get_profile_version(&self, profile_id: &str, version: u32) -> StoreResult<ExitProfile> {
        self.tables
            .read()
            .profiles
            .get(profile_id)
            .and_then(|versions| versions.iter().find(|p| p.version == version))
            .cloned()
            .ok_or_else(|| StoreError::ProfileNotFound(format!("{profile_id}@{version}")))
    }

    async fn active_profiles(&self) -> StoreResult<Vec<ExitProfile>> {
        let t = self.tables.read();
        let mut out: Vec<ExitProfile> = t
            .profiles
            .values()
            .filter_map(|versions| versions.last())
            .filter(|p| p.is_active)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.profile_id.cmp(&b.profile_id));
        Ok(out)
    }

    async fn publish_profile(&self, profile: ExitProfile) -> StoreResult<()> {
        let mut t = self.tables.write();
        let versions = t.profiles.entry(profile.profile_id.clone()).or_default();
        if versions.iter().any(|p| p.version == profile.version) {
            return Err(StoreError::ProfileVersionExists {
                id: profile.profile_id,
                version: profile.version,
            });
        }
        versions.push(profile);
        versions.sort_by_key(|p| p.version);
        Ok(())
    }

    async fn set_profile_active(&self, profile_id: &str, active: bool) -> StoreResult<ExitProfile> {
        let mut t = self.tables.write();
        let latest = t
            .profiles
            .get_mut(profile_id)
            .and_then(|versions| versions.last_mut())
            .ok_or_else(|| StoreError::ProfileNotFound(profile_id.to_string()))?;
        latest.is_active = active;
        Ok(latest.clone())
    }
}

#[async_trait]
impl SymbolOverrideRepository for InMemoryStore {
    async fn get_override(&self, symbol: &str) -> StoreResult<Option<SymbolOverride>> {
        Ok(self.tables.read().overrides.get(symbol).cloned())
    }

    async fn all_overrides(&self) -> StoreResult<Vec<SymbolOverride>> {
        Ok(self.tables.read().overrides.values().cloned().collect())
    }

    async fn upsert_override(&self, over: SymbolOverride) -> StoreResult<()> {
        self.tables.write().overrides.insert(over.symbol.clone(), over);
        Ok(())
    }

    async fn delete_override(&self, symbol: &str) -> StoreResult<bool> {
        Ok(self.tables.write().overrides.remove(symbol).is_some())
    }
}

// =============================================================================
// Control
// =============================================================================

#[async_trait]
impl ExitControlRepository for InMemoryStore {
    async fn get_control(&self) -> StoreResult<ExitControl> {
        Ok(self.tables.read().control.clone())
    }

    async fn update_control(
        &self,
        mode: ControlMode,
        reason: Option<String>,
        updated_by: &str,
    ) -> StoreResult<ExitControl> {
        let mut t = self.tables.write();
        t.control = ExitControl {
            mode,
            reason,
            updated_by: updated_by.to_string(),
            updated_ts: Utc::now(),
        };
        Ok(t.control.clone())
    }
}

// =============================================================================
// Intents
// =============================================================================

#[async_trait]
impl OrderIntentRepository for InMemoryStore {
    async fn create_intent(&self, intent: OrderIntent) -> StoreResult<()> {
        let mut t = self.tables.write();
        if t.action_keys.contains_key(&intent.action_key) {
            return Err(StoreError::IntentExists(intent.action_key));
        }
        t.action_keys.insert(intent.action_key.clone(), intent.intent_id);
        t.intent_log.push(intent.intent_id);
        t.intents.insert(intent.intent_id, intent);
        Ok(())
    }

    async fn get_intent(&self, intent_id: Uuid) -> StoreResult<OrderIntent> {
        self.tables
            .read()
            .intents
            .get(&intent_id)
            .cloned()
            .ok_or(StoreError::IntentNotFound(intent_id))
    }

    async fn intent_by_action_key(&self, action_key: &str) -> StoreResult<Option<OrderIntent>> {
        let t = self.tables.read();
        Ok(t
            .action_keys
            .get(action_key)
            .and_then(|id| t.intents.get(id))
            .cloned())
    }

    async fn transition_intent(
        &self,
        intent_id: Uuid,
        from: Option<IntentStatus>,
        to: IntentStatus,
    ) -> StoreResult<OrderIntent> {
        let mut t = self.tables.write();
        let intent = t
            .intents
            .get_mut(&intent_id)
            .ok_or(StoreError::IntentNotFound(intent_id))?;
        let current = intent.status;
        if from.map_or(false, |f| f != current) || !current.can_transition_to(to) {
            return Err(StoreError::InvalidIntentTransition {
                id: intent_id,
                from: current,
                to,
            });
        }
        intent.status = to;
        intent.updated_ts = Utc::now();
        Ok(intent.clone())
    }

    async fn recent_intents(&self, limit: usize) -> StoreResult<Vec<OrderIntent>> {
        let t = self.tables.read();
        Ok(t
            .intent_log
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| t.intents.get(id))
            .cloned()
            .collect())
    }

    async fn intents_for_position(&self, position_id: Uuid) -> StoreResult<Vec<OrderIntent>> {
        let t = self.tables.read();
        Ok(t
            .intent_log
            .iter()
            .filter_map(|id| t.intents.get(id))
            .filter(|i| i.position_id == position_id)
            .cloned()
            .collect())
    }

    async fn locked_qty(&self, position_id: Uuid) -> StoreResult<i64> {
        Ok(self.tables.read().locked_qty(position_id))
    }
}

// =============================================================================
// Signal journal
// =============================================================================

#[async_trait]
impl ExitSignalRepository for InMemoryStore {
    async fn insert_signal(&self, signal: ExitSignal) -> StoreResult<()> {
        let mut t = self.tables.write();
        t.signals.push_back(signal);
        while t.signals.len() > self.max_signals {
            t.signals.pop_front();
        }
        Ok(())
    }

    async fn signals_for_position(&self, position_id: Uuid, limit: usize) -> StoreResult<Vec<ExitSignal>> {
        Ok(self
            .tables
            .read()
            .signals
            .iter()
            .rev()
            .filter(|s| s.position_id == position_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

// =============================================================================
// Tests
// =============================================================================
