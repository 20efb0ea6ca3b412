// =============================================================================
// Trigger evaluation — one pure step of the exit FSM
// =============================================================================
//
// `evaluate` takes the position, its FSM record, the resolved profile and the
// current price, and returns the record as observed this cycle plus at most
// one firing trigger. It performs no I/O and never mutates its input.
//
// Trigger classes:
//
//   Stop-loss tiers      live in every phase, fire on the first breach.
//   Live take-profit     TP1 in OPEN, TP2 in POST_TP1, TP3 in POST_TP2,
//                        fires after `confirm_ticks` consecutive breaches.
//   Stop floor           POST_TP1 / POST_TP2, debounced.
//   Trailing stop        POST_TP3_TRAILING against the HWM, debounced.
//   Time stop            optional, any live phase.
//
// When several fire on the same tick the most protective wins:
//
//   SL2 > SL1 > STOP_FLOOR > TRAIL > TP3 > TP2 > TP1 > TIME
//
// Quantities: tiers exit `floor(original_qty * qty_pct)` (minimum one share);
// stop floor, trailing and time stop exit everything. Both are clamped to
// the quantity not already held by active intents.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::exit::profile::{ExitProfileConfig, TierId, TierRule, TimeStopConfig};
use crate::exit::state::{Phase, PositionState, TriggerClass};
use crate::position::Position;
use crate::types::{ReasonCode, Side};

/// Inputs to one evaluation step.
#[derive(Debug, Clone, Copy)]
pub struct TriggerInput<'a> {
    pub position: &'a Position,
    pub state: &'a PositionState,
    pub profile: &'a ExitProfileConfig,
    /// Exit-side price for this cycle.
    pub price: Decimal,
    /// Position qty minus qty held by active intents.
    pub available_qty: i64,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TriggerKind {
    Tier(TierId),
    StopFloor,
    Trailing,
    TimeStop,
}

impl TriggerKind {
    pub fn reason(&self) -> ReasonCode {
        match self {
            Self::Tier(t) => t.reason(),
            Self::StopFloor => ReasonCode::StopFloor,
            Self::Trailing => ReasonCode::Trail,
            Self::TimeStop => ReasonCode::Time,
        }
    }

    /// Lower is more protective.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Tier(TierId::Sl2) => 0,
            Self::Tier(TierId::Sl1) => 1,
            Self::StopFloor => 2,
            Self::Trailing => 3,
            Self::Tier(TierId::Tp3) => 4,
            Self::Tier(TierId::Tp2) => 5,
            Self::Tier(TierId::Tp1) => 6,
            Self::TimeStop => 7,
        }
    }

    fn class(&self) -> Option<TriggerClass> {
        match self {
            Self::Tier(t) if t.is_stop_loss() => Some(TriggerClass::StopLoss),
            Self::Tier(_) => Some(TriggerClass::TakeProfit),
            Self::StopFloor => Some(TriggerClass::StopFloor),
            Self::Trailing => Some(TriggerClass::Trailing),
            Self::TimeStop => None,
        }
    }
}

/// The trigger that won this tick and what committing it means.
#[derive(Debug, Clone, PartialEq)]
pub struct Firing {
    pub trigger: TriggerKind,
    pub reason: ReasonCode,
    /// Shares to exit, already clamped to the available quantity.
    pub qty: i64,
    /// `qty` covers the whole position.
    pub full_exit: bool,
    /// Human-readable description for the signal journal.
    pub detail: String,
    /// FSM record to persist once an intent exists for this fire.
    pub next_state: PositionState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Nothing fires. Persist the observed record (counters, HWM).
    NoTrigger(PositionState),
    /// `observed` is what to persist if the fire is suppressed;
    /// `firing.next_state` is what to persist once an intent exists.
    Fire {
        observed: PositionState,
        firing: Firing,
    },
}

impl Decision {
    pub fn observed(&self) -> &PositionState {
        match self {
            Self::NoTrigger(s) => s,
            Self::Fire { observed, .. } => observed,
        }
    }

    pub fn firing(&self) -> Option<&Firing> {
        match self {
            Self::NoTrigger(_) => None,
            Self::Fire { firing, .. } => Some(firing),
        }
    }
}

struct Candidate<'a> {
    trigger: TriggerKind,
    rule: Option<&'a TierRule>,
    detail: String,
}

fn breached_below(side: Side, price: Decimal, level: Decimal) -> bool {
    match side {
        Side::Long => price <= level,
        Side::Short => price >= level,
    }
}

fn fired_already(rule: &TierRule, state: &PositionState) -> bool {
    rule.fire_once && state.fired.contains(&rule.tier)
}

fn time_stop_hit(
    cfg: &TimeStopConfig,
    position: &Position,
    best_price: Decimal,
    now: DateTime<Utc>,
) -> Option<String> {
    let days = position.holding_days(now);
    if cfg.max_hold_days > 0 && days >= i64::from(cfg.max_hold_days) {
        return Some(format!("held {days}d >= max {}d", cfg.max_hold_days));
    }
    if cfg.no_momentum_days > 0 && days >= i64::from(cfg.no_momentum_days) {
        let best = position.pnl_pct(best_price);
        if best < cfg.no_momentum_profit {
            return Some(format!(
                "held {days}d, best return {best} < {}",
                cfg.no_momentum_profit
            ));
        }
    }
    None
}

/// Evaluate one position for one tick.
pub fn evaluate(input: &TriggerInput<'_>) -> Decision {
    let TriggerInput {
        position,
        state,
        profile,
        price,
        available_qty,
        now,
    } = *input;

    let mut observed = state.clone();
    observed.last_eval_ts = Some(now);
    if state.phase == Phase::Closed {
        return Decision::NoTrigger(observed);
    }
    observed.update_hwm(position.side, price);

    let pnl = position.pnl_pct(price);
    let factor = profile.volatility_factor(state.volatility, position.avg_price);
    let mut candidates: Vec<Candidate<'_>> = Vec::new();

    // ── Stop-loss tiers: zero debounce ──────────────────────────────────
    let mut sl_breached = false;
    for rule in profile.stop_loss_tiers() {
        let threshold = rule.threshold(factor);
        if pnl <= threshold {
            sl_breached = true;
            if !fired_already(rule, state) {
                candidates.push(Candidate {
                    trigger: TriggerKind::Tier(rule.tier),
                    rule: Some(rule),
                    detail: format!("pnl {pnl} <= {threshold}"),
                });
            }
        }
    }
    observed.breach.record(TriggerClass::StopLoss, sl_breached);

    // ── Live take-profit tier ───────────────────────────────────────────
    match state.phase.live_take_profit().and_then(|t| profile.tier(t)) {
        Some(rule) => {
            let threshold = rule.threshold(factor);
            let ticks = observed
                .breach
                .record(TriggerClass::TakeProfit, pnl >= threshold);
            let needed = profile.confirm_ticks_for(rule);
            if ticks >= needed && !fired_already(rule, state) {
                candidates.push(Candidate {
                    trigger: TriggerKind::Tier(rule.tier),
                    rule: Some(rule),
                    detail: format!("pnl {pnl} >= {threshold} for {ticks}/{needed} ticks"),
                });
            }
        }
        None => observed.breach.clear(TriggerClass::TakeProfit),
    }

    // ── Stop floor ──────────────────────────────────────────────────────
    match (state.phase.stop_floor_live(), state.stop_floor_price) {
        (true, Some(floor)) => {
            let ticks = observed.breach.record(
                TriggerClass::StopFloor,
                breached_below(position.side, price, floor),
            );
            let needed = profile.stop_floor_confirm_ticks();
            if ticks >= needed {
                candidates.push(Candidate {
                    trigger: TriggerKind::StopFloor,
                    rule: None,
                    detail: format!("price {price} through floor {floor} for {ticks}/{needed} ticks"),
                });
            }
        }
        _ => observed.breach.clear(TriggerClass::StopFloor),
    }

    // ── Trailing stop ───────────────────────────────────────────────────
    match (state.phase.trailing_live(), observed.hwm_price) {
        (true, Some(hwm)) => {
            let trail = hwm * (Decimal::ONE - position.side.sign() * profile.trailing.pct_trail);
            let ticks = observed.breach.record(
                TriggerClass::Trailing,
                breached_below(position.side, price, trail),
            );
            let needed = profile.trailing_confirm_ticks();
            if ticks >= needed {
                candidates.push(Candidate {
                    trigger: TriggerKind::Trailing,
                    rule: None,
                    detail: format!("price {price} through trail {trail} (hwm {hwm}) for {ticks}/{needed} ticks"),
                });
            }
        }
        _ => observed.breach.clear(TriggerClass::Trailing),
    }

    // ── Time stop ───────────────────────────────────────────────────────
    if let Some(cfg) = &profile.time_stop {
        let best = observed.hwm_price.unwrap_or(price);
        if let Some(detail) = time_stop_hit(cfg, position, best, now) {
            candidates.push(Candidate {
                trigger: TriggerKind::TimeStop,
                rule: None,
                detail,
            });
        }
    }

    let Some(winner) = candidates.into_iter().min_by_key(|c| c.trigger.priority()) else {
        return Decision::NoTrigger(observed);
    };

    let wanted = match winner.rule {
        Some(rule) => rule.target_qty(position.original_qty),
        None => available_qty,
    };
    let qty = wanted.min(available_qty).max(0);
    let full_exit = qty > 0 && qty >= position.qty;

    let mut next_state = observed.clone();
    if let Some(class) = winner.trigger.class() {
        next_state.breach.clear(class);
    }
    if let TriggerKind::Tier(tier) = winner.trigger {
        next_state.fired.insert(tier);
    }
    if full_exit {
        next_state.advance(Phase::Closed, price);
    } else if let (TriggerKind::Tier(tier), Some(rule)) = (winner.trigger, winner.rule) {
        let target = if rule.starts_trailing() {
            Some(Phase::PostTp3Trailing)
        } else {
            Phase::after_take_profit(tier)
        };
        if let Some(target) = target {
            next_state.advance(target, price);
        }
        if let Some(profit) = rule.stop_floor_profit() {
            next_state.stop_floor_price = Some(position.price_at_pct(profit));
        }
    }

    let reason = winner.trigger.reason();
    Decision::Fire {
        observed,
        firing: Firing {
            trigger: winner.trigger,
            reason,
            qty,
            full_exit,
            detail: winner.detail,
            next_state,
        },
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::profile::{AtrConfig, ExitProfile};
    use crate::position::HoldingSnapshot;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn position(side: Side) -> Position {
        Position::from_holding(
            &HoldingSnapshot {
                account_id: "ACC".into(),
                symbol: "005930".into(),
                side,
                qty: 100,
                avg_price: dec!(10000),
            },
            Utc::now(),
        )
    }

    fn profile() -> ExitProfileConfig {
        ExitProfile::builtin_default("default", Utc::now()).config
    }

    fn fresh_state(pos: &Position) -> PositionState {
        let mut s = PositionState::new(pos.position_id, Utc::now());
        s.last_avg_price = Some(pos.avg_price);
        s
    }

    fn step(pos: &Position, state: &PositionState, cfg: &ExitProfileConfig, price: Decimal) -> Decision {
        evaluate(&TriggerInput {
            position: pos,
            state,
            profile: cfg,
            price,
            available_qty: pos.qty,
            now: Utc::now(),
        })
    }

    /// Run ticks, persisting observed state between them (as a suppressed or
    /// not-firing cycle would), and return the last decision.
    fn run(pos: &Position, state: &mut PositionState, cfg: &ExitProfileConfig, prices: &[Decimal]) -> Decision {
        let mut last = None;
        for p in prices {
            let d = step(pos, state, cfg, *p);
            *state = d.observed().clone();
            last = Some(d);
        }
        last.unwrap()
    }

    #[test]
    fn tp1_fires_on_second_confirming_tick() {
        let pos = position(Side::Long);
        let cfg = profile();
        let mut state = fresh_state(&pos);

        let first = step(&pos, &state, &cfg, dec!(10720));
        assert!(first.firing().is_none());
        assert_eq!(first.observed().breach.take_profit, 1);
        state = first.observed().clone();

        let second = step(&pos, &state, &cfg, dec!(10715));
        let firing = second.firing().expect("TP1 should fire");
        assert_eq!(firing.reason, ReasonCode::Tp1);
        assert_eq!(firing.qty, 25);
        assert!(!firing.full_exit);
        assert_eq!(firing.next_state.phase, Phase::PostTp1);
        assert_eq!(firing.next_state.stop_floor_price, Some(dec!(10060)));
        assert_eq!(firing.next_state.hwm_price, Some(dec!(10715)));
        assert_eq!(firing.next_state.breach.take_profit, 0);
    }

    #[test]
    fn debounce_needs_consecutive_ticks() {
        let pos = position(Side::Long);
        let cfg = profile();
        let mut state = fresh_state(&pos);
        let d = run(&pos, &mut state, &cfg, &[dec!(10720), dec!(10600), dec!(10720)]);
        assert!(d.firing().is_none());
        assert_eq!(state.breach.take_profit, 1);
    }

    #[test]
    fn stop_loss_fires_immediately() {
        let pos = position(Side::Long);
        let cfg = profile();
        let state = fresh_state(&pos);
        let d = step(&pos, &state, &cfg, dec!(9690));
        let f = d.firing().expect("SL1 should fire");
        assert_eq!(f.reason, ReasonCode::Sl1);
        assert_eq!(f.qty, 50);
        assert_eq!(f.next_state.phase, Phase::Open);
        assert!(f.next_state.fired.contains(&TierId::Sl1));
    }

    #[test]
    fn sl2_wins_over_sl1() {
        let pos = position(Side::Long);
        let cfg = profile();
        let state = fresh_state(&pos);
        let f = step(&pos, &state, &cfg, dec!(9400)).firing().cloned().unwrap();
        assert_eq!(f.reason, ReasonCode::Sl2);
        assert_eq!(f.qty, 100);
        assert!(f.full_exit);
        assert_eq!(f.next_state.phase, Phase::Closed);
    }

    #[test]
    fn sl1_fires_once_per_episode() {
        let pos = position(Side::Long);
        let cfg = profile();
        let mut state = fresh_state(&pos);
        state.fired.insert(TierId::Sl1);
        let d = step(&pos, &state, &cfg, dec!(9690));
        assert!(d.firing().is_none());
        assert_eq!(d.observed().breach.stop_loss, 1);
    }

    #[test]
    fn short_side_mirrors_thresholds() {
        let pos = position(Side::Short);
        let cfg = profile();
        let mut state = fresh_state(&pos);
        // Short wins when price falls 7%.
        let d = run(&pos, &mut state, &cfg, &[dec!(9280), dec!(9290)]);
        let f = d.firing().expect("short TP1");
        assert_eq!(f.reason, ReasonCode::Tp1);
        assert_eq!(f.next_state.stop_floor_price, Some(dec!(9940)));

        let fresh = fresh_state(&pos);
        let f = step(&pos, &fresh, &cfg, dec!(10310)).firing().cloned().unwrap();
        assert_eq!(f.reason, ReasonCode::Sl1);
    }

    #[test]
    fn stop_floor_after_tp1() {
        let pos = position(Side::Long);
        let cfg = profile();
        let mut state = fresh_state(&pos);
        state.advance(Phase::PostTp1, dec!(10700));
        state.stop_floor_price = Some(dec!(10060));

        let d = run(&pos, &mut state, &cfg, &[dec!(10050)]);
        assert!(d.firing().is_none());
        let d = step(&pos, &state, &cfg, dec!(10040));
        let f = d.firing().expect("stop floor");
        assert_eq!(f.reason, ReasonCode::StopFloor);
        assert_eq!(f.qty, 100);
        assert!(f.full_exit);
        assert_eq!(f.next_state.phase, Phase::Closed);
    }

    #[test]
    fn stop_floor_outranks_take_profit() {
        // Contrived: floor above the TP2 level so both breach together.
        let pos = position(Side::Long);
        let cfg = profile();
        let mut state = fresh_state(&pos);
        state.advance(Phase::PostTp1, dec!(11000));
        state.stop_floor_price = Some(dec!(12000));
        let d = run(&pos, &mut state, &cfg, &[dec!(11100), dec!(11100)]);
        assert_eq!(d.firing().unwrap().reason, ReasonCode::StopFloor);
    }

    #[test]
    fn tp3_starts_trailing_and_trail_fires() {
        let pos = position(Side::Long);
        let cfg = profile();
        let mut state = fresh_state(&pos);
        state.advance(Phase::PostTp2, dec!(11000));
        state.stop_floor_price = Some(dec!(10060));

        let d = run(&pos, &mut state, &cfg, &[dec!(11500), dec!(11550)]);
        let f = d.firing().cloned().expect("TP3");
        assert_eq!(f.reason, ReasonCode::Tp3);
        assert_eq!(f.qty, 20);
        assert_eq!(f.next_state.phase, Phase::PostTp3Trailing);
        assert_eq!(f.next_state.hwm_price, Some(dec!(11550)));

        let mut state = f.next_state;
        // New high, then a 4% give-back from 12000 (11520) held for 2 ticks.
        let d = run(&pos, &mut state, &cfg, &[dec!(12000), dec!(11510)]);
        assert!(d.firing().is_none());
        assert_eq!(state.hwm_price, Some(dec!(12000)));
        let f = step(&pos, &state, &cfg, dec!(11500)).firing().cloned().unwrap();
        assert_eq!(f.reason, ReasonCode::Trail);
        assert!(f.full_exit);
    }

    #[test]
    fn quantity_clamped_to_available() {
        let pos = position(Side::Long);
        let cfg = profile();
        let state = fresh_state(&pos);
        let d = evaluate(&TriggerInput {
            position: &pos,
            state: &state,
            profile: &cfg,
            price: dec!(9400),
            available_qty: 30,
            now: Utc::now(),
        });
        let f = d.firing().unwrap();
        assert_eq!(f.qty, 30);
        assert!(!f.full_exit);
        assert_eq!(f.next_state.phase, Phase::Open);
    }

    #[test]
    fn volatility_widens_thresholds() {
        let pos = position(Side::Long);
        let mut cfg = profile();
        cfg.atr = Some(AtrConfig {
            ref_pct: dec!(0.02),
            factor_min: dec!(0.7),
            factor_max: dec!(1.6),
        });
        let mut state = fresh_state(&pos);
        state.volatility = Some(dec!(300)); // 3% -> factor 1.5 -> SL1 at -4.5%

        assert!(step(&pos, &state, &cfg, dec!(9600)).firing().is_none());
        let f = step(&pos, &state, &cfg, dec!(9540)).firing().cloned().unwrap();
        assert_eq!(f.reason, ReasonCode::Sl1);
    }

    #[test]
    fn time_stop_exits_everything() {
        let mut pos = position(Side::Long);
        pos.entry_ts = Utc::now() - chrono::Duration::days(6);
        let mut cfg = profile();
        cfg.time_stop = Some(TimeStopConfig {
            max_hold_days: 0,
            no_momentum_days: 5,
            no_momentum_profit: dec!(0.02),
        });
        let state = fresh_state(&pos);
        let f = step(&pos, &state, &cfg, dec!(10100)).firing().cloned().unwrap();
        assert_eq!(f.reason, ReasonCode::Time);
        assert_eq!(f.qty, 100);

        // A 3% best return keeps the position.
        let mut state = fresh_state(&pos);
        state.hwm_price = Some(dec!(10300));
        assert!(step(&pos, &state, &cfg, dec!(10100)).firing().is_none());
    }

    #[test]
    fn closed_phase_never_fires() {
        let pos = position(Side::Long);
        let cfg = profile();
        let mut state = fresh_state(&pos);
        state.phase = Phase::Closed;
        assert!(step(&pos, &state, &cfg, dec!(5000)).firing().is_none());
    }

    #[test]
    fn evaluation_does_not_touch_version() {
        let pos = position(Side::Long);
        let cfg = profile();
        let mut state = fresh_state(&pos);
        state.version = 7;
        state.position_id = Uuid::new_v4();
        let d = step(&pos, &state, &cfg, dec!(10720));
        assert_eq!(d.observed().version, 7);
    }
}
