// =============================================================================
// Exit Monitor Loop — periodic evaluation of every open position
// =============================================================================
//
// Runs as a background Tokio task, waking every `evaluation_interval_ms` to:
//   1. Read the kill switch and symbol overrides once for the cycle.
//   2. List OPEN positions (optionally one account).
//   3. Evaluate positions concurrently, bounded by
//      `max_concurrent_evaluations`.
//
// Per position:
//   price (skip when stale/missing) -> profile (skip when unresolvable)
//   -> FSM record (reset on material avg-price change) -> locked qty
//   -> trigger evaluation -> position version re-check -> gate + emit
//   -> atomic commit of FSM record and status (CAS on both versions)
//
// A skipped position writes nothing. A version conflict writes nothing and is
// retried on the next cycle. Only an emitted (or already recorded) intent
// advances the phase. A fire whose shares are all locked by the intent with
// its own action key is treated as already recorded, so a lost commit is
// caught up even when nothing is left to exit.
//
// The monitor is spawned once at startup:
//
//   tokio::spawn(Arc::clone(&engine).run(Arc::clone(&shutdown)));
//
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::ExitError;
use crate::exit::control::{ExitControl, Origin, Suppression};
use crate::exit::emitter::{action_key, EmitOutcome, EmitRequest, IntentEmitter};
use crate::exit::profile::{OverrideSnapshot, ProfileResolver};
use crate::exit::state::AvgPriceCheck;
use crate::exit::trigger::{self, Decision, Firing, TriggerInput};
use crate::intent::ExitSignal;
use crate::position::Position;
use crate::price_feed::PriceFeed;
use crate::runtime_config::EngineConfig;
use crate::stats::EngineStats;
use crate::store::{EvaluationCommit, Repositories};
use crate::types::{ControlMode, IntentKind, PositionStatus, ReasonCode};

/// Why a position was not evaluated this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    NotOpen,
    StalePrice,
    PriceUnavailable,
    Profile,
}

/// Result of evaluating one position in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    NoTrigger,
    Emitted { reason: ReasonCode, intent_id: Uuid },
    AlreadyRecorded { reason: ReasonCode },
    Suppressed { reason: ReasonCode, by: Suppression },
    NoAvailableQty { reason: ReasonCode },
    Skipped(SkipReason),
    Conflict,
    Failed(String),
}

/// Summary of one evaluation cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub control_mode: ControlMode,
    pub positions: usize,
    pub emitted: usize,
    pub already_recorded: usize,
    pub suppressed: usize,
    pub no_trigger: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub failed: usize,
    #[serde(skip)]
    pub outcomes: HashMap<Uuid, EvaluationOutcome>,
}

impl CycleReport {
    fn push(&mut self, position_id: Uuid, outcome: EvaluationOutcome) {
        match &outcome {
            EvaluationOutcome::NoTrigger => self.no_trigger += 1,
            EvaluationOutcome::Emitted { .. } => self.emitted += 1,
            EvaluationOutcome::AlreadyRecorded { .. } => self.already_recorded += 1,
            EvaluationOutcome::Suppressed { .. } | EvaluationOutcome::NoAvailableQty { .. } => {
                self.suppressed += 1
            }
            EvaluationOutcome::Skipped(_) => self.skipped += 1,
            EvaluationOutcome::Conflict => self.conflicts += 1,
            EvaluationOutcome::Failed(_) => self.failed += 1,
        }
        self.outcomes.insert(position_id, outcome);
    }

    pub fn outcome(&self, position_id: Uuid) -> Option<&EvaluationOutcome> {
        self.outcomes.get(&position_id)
    }
}

/// Inputs read once per cycle and shared by every position.
struct CycleContext {
    control: ExitControl,
    overrides: OverrideSnapshot,
    now: DateTime<Utc>,
}

pub struct ExitEngine {
    repos: Repositories,
    prices: Arc<dyn PriceFeed>,
    resolver: ProfileResolver,
    emitter: IntentEmitter,
    config: EngineConfig,
    stats: Arc<EngineStats>,
}

impl ExitEngine {
    pub fn new(
        repos: Repositories,
        prices: Arc<dyn PriceFeed>,
        config: EngineConfig,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            resolver: ProfileResolver::new(repos.profiles.clone(), config.default_profile_id.clone()),
            emitter: IntentEmitter::new(repos.intents.clone()),
            repos,
            prices,
            config,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    /// Run the loop until `shutdown` is notified. An in-flight cycle always
    /// completes before the loop exits.
    pub async fn run(self: Arc<Self>, shutdown: Arc<Notify>) {
        info!(
            interval_ms = self.config.evaluation_interval_ms,
            max_concurrent = self.config.max_concurrent_evaluations,
            account = ?self.config.account_id,
            "exit engine started"
        );

        let mut ticker = interval(self.config.evaluation_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("exit engine stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(report) if report.emitted > 0 || report.failed > 0 => info!(
                            positions = report.positions,
                            emitted = report.emitted,
                            suppressed = report.suppressed,
                            skipped = report.skipped,
                            conflicts = report.conflicts,
                            failed = report.failed,
                            "exit cycle complete"
                        ),
                        Ok(report) => debug!(
                            positions = report.positions,
                            skipped = report.skipped,
                            conflicts = report.conflicts,
                            "exit cycle complete"
                        ),
                        Err(e) => error!(error = %e, "exit cycle failed"),
                    }
                }
            }
        }
    }

    /// Evaluate every open position once.
    pub async fn run_cycle(&self) -> Result<CycleReport, ExitError> {
        let started = Instant::now();
        let control = self.repos.control.get_control().await?;
        let overrides: OverrideSnapshot = self
            .repos
            .overrides
            .all_overrides()
            .await?
            .into_iter()
            .map(|o| (o.symbol.clone(), o))
            .collect();
        let positions = self
            .repos
            .positions
            .open_positions(self.config.account_id.as_deref())
            .await?;

        let ctx = CycleContext {
            control,
            overrides,
            now: Utc::now(),
        };

        let mut report = CycleReport {
            control_mode: ctx.control.mode,
            positions: positions.len(),
            ..CycleReport::default()
        };

        if positions.is_empty() {
            debug!("exit monitor: no open positions");
        }

        let ctx_ref = &ctx;
        let outcomes: Vec<(Uuid, EvaluationOutcome)> = stream::iter(positions)
            .map(|position| async move {
                let id = position.position_id;
                (id, self.evaluate_position(position, ctx_ref).await)
            })
            .buffer_unordered(self.config.max_concurrent_evaluations.max(1))
            .collect()
            .await;

        for (id, outcome) in outcomes {
            self.stats.record_outcome(&outcome);
            report.push(id, outcome);
        }
        self.stats.record_cycle(started.elapsed());
        Ok(report)
    }

    async fn evaluate_position(&self, position: Position, ctx: &CycleContext) -> EvaluationOutcome {
        let position_id = position.position_id;
        let symbol = position.symbol.clone();
        match self.try_evaluate(position, ctx).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_conflict() => {
                warn!(position_id = %position_id, symbol = %symbol, error = %e, "evaluation lost a version race");
                EvaluationOutcome::Conflict
            }
            Err(e) => {
                error!(position_id = %position_id, symbol = %symbol, error = %e, "evaluation failed");
                EvaluationOutcome::Failed(e.to_string())
            }
        }
    }

    async fn try_evaluate(
        &self,
        position: Position,
        ctx: &CycleContext,
    ) -> Result<EvaluationOutcome, ExitError> {
        let position_id = position.position_id;

        if !position.is_open() {
            return Ok(EvaluationOutcome::Skipped(SkipReason::NotOpen));
        }

        // ── 1. Price ────────────────────────────────────────────────────
        let best = match self.prices.best_price(&position.symbol).await {
            Ok(best) => best,
            Err(e) => {
                warn!(
                    position_id = %position_id,
                    symbol = %position.symbol,
                    error = %e,
                    "price unavailable, skipping position"
                );
                return Ok(EvaluationOutcome::Skipped(SkipReason::PriceUnavailable));
            }
        };
        if !best.is_fresh(ctx.now, self.config.price_freshness()) {
            warn!(
                position_id = %position_id,
                symbol = %position.symbol,
                price_ts = %best.ts,
                flagged_stale = best.is_stale,
                "stale price, skipping position"
            );
            return Ok(EvaluationOutcome::Skipped(SkipReason::StalePrice));
        }
        let price = best.exit_price();
        if price <= Decimal::ZERO {
            warn!(symbol = %position.symbol, price = %price, "non-positive price, skipping position");
            return Ok(EvaluationOutcome::Skipped(SkipReason::PriceUnavailable));
        }

        // ── 2. Profile ──────────────────────────────────────────────────
        let resolved = match self.resolver.resolve(&position, &ctx.overrides).await {
            Ok(resolved) => resolved,
            Err(ExitError::ProfileNotFound(profile_id)) => {
                error!(
                    position_id = %position_id,
                    symbol = %position.symbol,
                    profile_id = %profile_id,
                    "no exit profile resolvable, position left unevaluated"
                );
                return Ok(EvaluationOutcome::Skipped(SkipReason::Profile));
            }
            Err(e) => return Err(e),
        };

        // ── 3. FSM record and avg-price reset ───────────────────────────
        let stored = self.repos.states.get_state(position_id).await?;
        let mut state = stored.clone();
        match state.check_avg_price(position.avg_price, self.config.avg_price_reset_tolerance) {
            AvgPriceCheck::Unset => state.last_avg_price = Some(position.avg_price),
            AvgPriceCheck::Unchanged => {}
            AvgPriceCheck::Material(change) => {
                info!(
                    position_id = %position_id,
                    symbol = %position.symbol,
                    from = ?state.last_avg_price,
                    to = %position.avg_price,
                    change = %change,
                    phase = %state.phase,
                    episode = state.episode + 1,
                    "avg price moved, resetting exit state to OPEN"
                );
                state.reset_to_open(position.avg_price);
                self.stats.record_reset();
            }
        }

        // ── 4. Evaluate ─────────────────────────────────────────────────
        let locked = self.repos.intents.locked_qty(position_id).await?;
        let available_qty = (position.qty - locked).max(0);

        let decision = trigger::evaluate(&TriggerInput {
            position: &position,
            state: &state,
            profile: &resolved.profile.config,
            price,
            available_qty,
            now: ctx.now,
        });

        let (to_persist, position_status, outcome) = match decision {
            Decision::NoTrigger(observed) => (observed, None, EvaluationOutcome::NoTrigger),
            Decision::Fire { observed, firing } => {
                let key = action_key(position_id, observed.episode, observed.phase, firing.reason);
                let reason = firing.reason;
                if firing.qty <= 0 {
                    // Our own earlier intent may hold the shares while its
                    // state commit was lost. Catch the FSM up to it.
                    if let Some(existing) = self.repos.intents.intent_by_action_key(&key).await? {
                        debug!(
                            position_id = %position_id,
                            reason = %reason,
                            intent_id = %existing.intent_id,
                            "fire already recorded, catching up state"
                        );
                        let mut next = firing.next_state;
                        let status = if existing.kind == IntentKind::ExitFull && existing.status.is_active() {
                            next.close();
                            Some(PositionStatus::Closing)
                        } else {
                            None
                        };
                        (next, status, EvaluationOutcome::AlreadyRecorded { reason })
                    } else {
                        debug!(
                            position_id = %position_id,
                            reason = %reason,
                            locked,
                            "trigger fired with nothing left to exit"
                        );
                        self.journal(position_id, &firing, price, false, ctx.now).await;
                        (observed, None, EvaluationOutcome::NoAvailableQty { reason })
                    }
                } else {
                    // ── 5. Re-check before writing an intent ────────────
                    let current = self.repos.positions.get_position(position_id).await?;
                    if current.version != position.version {
                        warn!(
                            position_id = %position_id,
                            read = position.version,
                            now = current.version,
                            "position changed during evaluation, retrying next cycle"
                        );
                        return Ok(EvaluationOutcome::Conflict);
                    }

                    let request = EmitRequest {
                        position: &position,
                        exit_mode: resolved.exit_mode,
                        reason,
                        qty: firing.qty,
                        full_exit: firing.full_exit,
                        action_key: key,
                        origin: Origin::Automatic,
                    };
                    let emitted = self.emitter.emit(&request, &ctx.control).await?;
                    self.journal(position_id, &firing, price, emitted.is_recorded(), ctx.now)
                        .await;

                    let status = firing.full_exit.then_some(PositionStatus::Closing);
                    match emitted {
                        EmitOutcome::Created(intent) => (
                            firing.next_state,
                            status,
                            EvaluationOutcome::Emitted {
                                reason,
                                intent_id: intent.intent_id,
                            },
                        ),
                        EmitOutcome::AlreadyRecorded(_) => {
                            (firing.next_state, status, EvaluationOutcome::AlreadyRecorded { reason })
                        }
                        EmitOutcome::Suppressed(by) => {
                            (observed, None, EvaluationOutcome::Suppressed { reason, by })
                        }
                    }
                }
            }
        };

        // ── 6. Commit ───────────────────────────────────────────────────
        let commit = EvaluationCommit {
            position_id,
            expected_position_version: position.version,
            expected_state_version: stored.version,
            state: to_persist,
            position_status,
        };
        match self.repos.states.commit_evaluation(commit).await {
            Ok(_) => Ok(outcome),
            Err(e) if e.is_conflict() => {
                if let EvaluationOutcome::Emitted { reason, intent_id } = &outcome {
                    warn!(
                        position_id = %position_id,
                        reason = %reason,
                        intent_id = %intent_id,
                        error = %e,
                        "intent created but state commit lost a race, next cycle will catch up"
                    );
                    Ok(outcome)
                } else {
                    warn!(position_id = %position_id, error = %e, "state commit lost a race");
                    Ok(EvaluationOutcome::Conflict)
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort journal write. Failures are logged and never block an exit.
    async fn journal(
        &self,
        position_id: Uuid,
        firing: &Firing,
        price: Decimal,
        emitted: bool,
        now: DateTime<Utc>,
    ) {
        let signal = ExitSignal {
            signal_id: Uuid::new_v4(),
            position_id,
            rule: firing.reason,
            emitted,
            detail: firing.detail.clone(),
            price,
            evaluated_ts: now,
        };
        if let Err(e) = self.repos.signals.insert_signal(signal).await {
            warn!(position_id = %position_id, error = %e, "failed to journal exit signal");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
