// =============================================================================
// Exit service — operator and collaborator operations
// =============================================================================
//
// Everything outside the evaluation loop goes through here: the kill switch,
// manual exits, intent approval, per-position exit mode, symbol overrides,
// profile publishing, broker holding resync and volatility updates.
// =============================================================================

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{ExitError, StoreError};
use crate::exit::control::{ExitControl, Origin};
use crate::exit::emitter::{manual_action_key, EmitOutcome, EmitRequest, IntentEmitter};
use crate::exit::profile::{ExitProfile, SymbolOverride};
use crate::exit::state::{Phase, PositionState};
use crate::intent::{ExitSignal, OrderIntent};
use crate::position::{HoldingSnapshot, Position};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::store::{EvaluationCommit, Repositories};
use crate::types::{ControlMode, ExitMode, IntentKind, IntentStatus, PositionStatus, ReasonCode};

const MARK_CLOSING_ATTEMPTS: u32 = 3;

/// Operator request to exit (part of) a position now.
#[derive(Debug, Clone, Deserialize)]
pub struct ManualExitRequest {
    pub position_id: Uuid,
    /// Shares to exit. `None` exits everything available.
    #[serde(default)]
    pub qty: Option<i64>,
    /// Caller-chosen id. Retries with the same id return the same intent.
    #[serde(default)]
    pub request_id: Option<String>,
    pub requested_by: String,
}

pub struct ExitService {
    repos: Repositories,
    emitter: IntentEmitter,
    stats: Arc<EngineStats>,
}

impl ExitService {
    pub fn new(repos: Repositories, stats: Arc<EngineStats>) -> Self {
        Self {
            emitter: IntentEmitter::new(repos.intents.clone()),
            repos,
            stats,
        }
    }

    // ── Kill switch ─────────────────────────────────────────────────────

    pub async fn control(&self) -> Result<ExitControl, ExitError> {
        Ok(self.repos.control.get_control().await?)
    }

    pub async fn update_control(
        &self,
        mode: ControlMode,
        reason: Option<String>,
        updated_by: &str,
    ) -> Result<ExitControl, ExitError> {
        let previous = self.repos.control.get_control().await?;
        let control = self.repos.control.update_control(mode, reason, updated_by).await?;
        if previous.mode != control.mode {
            warn!(
                from = %previous.mode,
                to = %control.mode,
                by = %control.updated_by,
                reason = ?control.reason,
                "exit control changed"
            );
        }
        Ok(control)
    }

    // ── FSM inspection ──────────────────────────────────────────────────

    pub async fn position_phase(&self, position_id: Uuid) -> Result<Phase, ExitError> {
        Ok(self.repos.states.phase(position_id).await?)
    }

    pub async fn position_state(&self, position_id: Uuid) -> Result<PositionState, ExitError> {
        Ok(self.repos.states.get_state(position_id).await?)
    }

    pub async fn signals(&self, position_id: Uuid, limit: usize) -> Result<Vec<ExitSignal>, ExitError> {
        Ok(self.repos.signals.signals_for_position(position_id, limit).await?)
    }

    // ── Manual exit ─────────────────────────────────────────────────────

    /// Create a manual exit intent. Allowed under every kill-switch mode,
    /// refused when the position's exit mode is DISABLED. A retry of a
    /// recorded request returns its intent even when nothing is left to exit.
    pub async fn create_manual_exit(&self, req: &ManualExitRequest) -> Result<OrderIntent, ExitError> {
        let position = self.repos.positions.get_position(req.position_id).await?;
        if position.status == PositionStatus::Closed {
            return Err(ExitError::PositionClosed(position.position_id));
        }
        if let Some(qty) = req.qty {
            if qty <= 0 {
                return Err(ExitError::InvalidQuantity(qty));
            }
        }

        let state = self.repos.states.get_state(position.position_id).await?;
        let key = manual_action_key(position.position_id, state.episode, req.request_id.as_deref());
        if let Some(existing) = self.repos.intents.intent_by_action_key(&key).await? {
            debug!(
                intent_id = %existing.intent_id,
                action_key = %key,
                "manual exit already recorded"
            );
            return Ok(existing);
        }

        let exit_mode = self.effective_exit_mode(&position).await?;
        let locked = self.repos.intents.locked_qty(position.position_id).await?;
        let available = (position.qty - locked).max(0);
        if available == 0 {
            return Err(ExitError::NoAvailableQty(position.position_id));
        }
        let qty = req.qty.unwrap_or(available).min(available);
        let control = self.repos.control.get_control().await?;

        let request = EmitRequest {
            position: &position,
            exit_mode,
            reason: ReasonCode::Manual,
            qty,
            full_exit: qty >= position.qty,
            action_key: key,
            origin: Origin::Manual,
        };
        let intent = match self.emitter.emit(&request, &control).await? {
            EmitOutcome::Created(intent) => {
                info!(
                    intent_id = %intent.intent_id,
                    position_id = %position.position_id,
                    qty,
                    requested_by = %req.requested_by,
                    "manual exit created"
                );
                self.stats.record_manual_intent();
                intent
            }
            EmitOutcome::AlreadyRecorded(key) => self
                .repos
                .intents
                .intent_by_action_key(&key)
                .await?
                .ok_or_else(|| StoreError::Backend(format!("intent for {key} vanished")))?,
            EmitOutcome::Suppressed(_) => return Err(ExitError::ExitDisabled(position.position_id)),
        };

        if intent.kind == IntentKind::ExitFull && intent.status.is_active() {
            self.mark_full_exit(position.position_id).await?;
        }
        Ok(intent)
    }

    /// Close the FSM and mark the position CLOSING after a full manual exit.
    /// Retries a few times when the evaluation loop commits in between.
    async fn mark_full_exit(&self, position_id: Uuid) -> Result<(), ExitError> {
        for attempt in 1..=MARK_CLOSING_ATTEMPTS {
            let position = self.repos.positions.get_position(position_id).await?;
            if position.status != PositionStatus::Open {
                return Ok(());
            }
            let mut state = self.repos.states.get_state(position_id).await?;
            let expected_state_version = state.version;
            state.close();
            let commit = EvaluationCommit {
                position_id,
                expected_position_version: position.version,
                expected_state_version,
                state,
                position_status: Some(PositionStatus::Closing),
            };
            match self.repos.states.commit_evaluation(commit).await {
                Ok(_) => {
                    info!(position_id = %position_id, "position closing on manual full exit");
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!(position_id = %position_id, attempt, error = %e, "closing mark lost a race");
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!(
            position_id = %position_id,
            attempts = MARK_CLOSING_ATTEMPTS,
            "could not mark position closing after manual full exit"
        );
        Ok(())
    }

    async fn effective_exit_mode(&self, position: &Position) -> Result<ExitMode, ExitError> {
        let over = self.repos.overrides.get_override(&position.symbol).await?;
        Ok(over
            .filter(|o| o.enabled)
            .and_then(|o| o.exit_mode)
            .unwrap_or(position.exit_mode))
    }

    // ── Intents ─────────────────────────────────────────────────────────

    /// PENDING_APPROVAL -> NEW.
    pub async fn approve_intent(&self, intent_id: Uuid, by: &str) -> Result<OrderIntent, ExitError> {
        let intent = self
            .repos
            .intents
            .transition_intent(intent_id, Some(IntentStatus::PendingApproval), IntentStatus::New)
            .await?;
        info!(intent_id = %intent_id, by, "exit intent approved");
        Ok(intent)
    }

    /// PENDING_APPROVAL -> CANCELLED.
    pub async fn reject_intent(&self, intent_id: Uuid, by: &str) -> Result<OrderIntent, ExitError> {
        let intent = self
            .repos
            .intents
            .transition_intent(
                intent_id,
                Some(IntentStatus::PendingApproval),
                IntentStatus::Cancelled,
            )
            .await?;
        info!(intent_id = %intent_id, by, "exit intent rejected");
        self.release_position(&intent).await?;
        Ok(intent)
    }

    /// Status report from the execution side (SUBMITTED, FAILED, ...).
    pub async fn update_intent_status(
        &self,
        intent_id: Uuid,
        status: IntentStatus,
    ) -> Result<OrderIntent, ExitError> {
        let intent = self
            .repos
            .intents
            .transition_intent(intent_id, None, status)
            .await?;
        if !intent.status.is_active() {
            self.release_position(&intent).await?;
        }
        Ok(intent)
    }

    /// A dead intent no longer holds shares. A CLOSING position left with
    /// nothing working goes back to OPEN in a new episode.
    async fn release_position(&self, intent: &OrderIntent) -> Result<(), ExitError> {
        if let Some(position) = self.repos.positions.reopen_if_unlocked(intent.position_id).await? {
            info!(
                position_id = %position.position_id,
                intent_id = %intent.intent_id,
                status = %intent.status,
                "exit intent ended without a fill, position reopened"
            );
        }
        Ok(())
    }

    pub async fn recent_intents(&self, limit: usize) -> Result<Vec<OrderIntent>, ExitError> {
        Ok(self.repos.intents.recent_intents(limit).await?)
    }

    pub async fn intents_for_position(&self, position_id: Uuid) -> Result<Vec<OrderIntent>, ExitError> {
        Ok(self.repos.intents.intents_for_position(position_id).await?)
    }

    // ── Position exit settings ──────────────────────────────────────────

    /// Set exit mode and profile assignment. Fails with a version conflict
    /// when the position changed since `expected_version`.
    pub async fn set_exit_mode(
        &self,
        position_id: Uuid,
        exit_mode: ExitMode,
        exit_profile_id: Option<String>,
        expected_version: u64,
    ) -> Result<Position, ExitError> {
        if let Some(pid) = &exit_profile_id {
            self.require_profile(pid).await?;
        }
        let position = self
            .repos
            .positions
            .update_exit_mode(position_id, exit_mode, exit_profile_id, expected_version)
            .await?;
        info!(
            position_id = %position_id,
            exit_mode = %position.exit_mode,
            profile = ?position.exit_profile_id,
            "position exit settings updated"
        );
        Ok(position)
    }

    pub async fn set_symbol_override(&self, over: SymbolOverride) -> Result<(), ExitError> {
        if let Some(pid) = &over.profile_id {
            self.require_profile(pid).await?;
        }
        info!(
            symbol = %over.symbol,
            profile = ?over.profile_id,
            exit_mode = ?over.exit_mode,
            enabled = over.enabled,
            by = %over.created_by,
            "symbol override set"
        );
        Ok(self.repos.overrides.upsert_override(over).await?)
    }

    pub async fn clear_symbol_override(&self, symbol: &str) -> Result<bool, ExitError> {
        Ok(self.repos.overrides.delete_override(symbol).await?)
    }

    pub async fn symbol_overrides(&self) -> Result<Vec<SymbolOverride>, ExitError> {
        Ok(self.repos.overrides.all_overrides().await?)
    }

    async fn require_profile(&self, profile_id: &str) -> Result<(), ExitError> {
        match self.repos.profiles.get_profile(profile_id).await {
            Ok(_) => Ok(()),
            Err(StoreError::ProfileNotFound(_)) => Err(ExitError::ProfileNotFound(profile_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    // ── Profiles ────────────────────────────────────────────────────────

    /// Validate and publish a new immutable profile version.
    pub async fn publish_profile(&self, profile: ExitProfile) -> Result<(), ExitError> {
        profile
            .config
            .validate()
            .map_err(|reason| ExitError::InvalidProfile {
                profile_id: profile.profile_id.clone(),
                reason,
            })?;
        info!(
            profile_id = %profile.profile_id,
            version = profile.version,
            tiers = profile.config.tiers.len(),
            "exit profile published"
        );
        Ok(self.repos.profiles.publish_profile(profile).await?)
    }

    pub async fn active_profiles(&self) -> Result<Vec<ExitProfile>, ExitError> {
        Ok(self.repos.profiles.active_profiles().await?)
    }

    pub async fn set_profile_active(&self, profile_id: &str, active: bool) -> Result<ExitProfile, ExitError> {
        Ok(self.repos.profiles.set_profile_active(profile_id, active).await?)
    }

    // ── Collaborator inputs ─────────────────────────────────────────────

    pub async fn sync_holding(&self, holding: &HoldingSnapshot) -> Result<Position, ExitError> {
        Ok(self.repos.positions.sync_holding(holding).await?)
    }

    pub async fn update_volatility(&self, position_id: Uuid, atr: Decimal) -> Result<PositionState, ExitError> {
        if atr <= Decimal::ZERO {
            return Err(StoreError::Backend(format!("volatility must be positive, got {atr}")).into());
        }
        Ok(self.repos.states.update_volatility(position_id, atr).await?)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
