// =============================================================================
// Position FSM state — phase, high-water mark, stop floor, breach counters
// =============================================================================
//
// One record per position, persisted and versioned independently of the
// position row. The phase only moves forward within an episode:
//
//   OPEN ──TP1──▶ POST_TP1 ──TP2──▶ POST_TP2 ──TP3──▶ POST_TP3_TRAILING
//     │               │                │                     │
//     └───────────────┴── full exit ───┴─────────────────────┴──▶ CLOSED
//
// A material change in the position's average price starts a new episode:
// the record returns to OPEN and every cost-basis-derived field (HWM, floor,
// counters, fired tiers) is cleared in one step.
// =============================================================================

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::exit::profile::TierId;
use crate::types::Side;

// =============================================================================
// Phase
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Open,
    PostTp1,
    PostTp2,
    PostTp3Trailing,
    Closed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::PostTp1 => "POST_TP1",
            Self::PostTp2 => "POST_TP2",
            Self::PostTp3Trailing => "POST_TP3_TRAILING",
            Self::Closed => "CLOSED",
        }
    }

    /// The take-profit tier that can fire in this phase.
    pub fn live_take_profit(&self) -> Option<TierId> {
        match self {
            Self::Open => Some(TierId::Tp1),
            Self::PostTp1 => Some(TierId::Tp2),
            Self::PostTp2 => Some(TierId::Tp3),
            Self::PostTp3Trailing | Self::Closed => None,
        }
    }

    pub fn stop_floor_live(&self) -> bool {
        matches!(self, Self::PostTp1 | Self::PostTp2)
    }

    pub fn trailing_live(&self) -> bool {
        matches!(self, Self::PostTp3Trailing)
    }

    /// Phase reached after a partial take-profit on `tier`.
    pub fn after_take_profit(tier: TierId) -> Option<Phase> {
        match tier {
            TierId::Tp1 => Some(Self::PostTp1),
            TierId::Tp2 => Some(Self::PostTp2),
            TierId::Tp3 => Some(Self::PostTp3Trailing),
            TierId::Sl1 | TierId::Sl2 => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Breach counters
// =============================================================================

/// Trigger classes that keep their own consecutive-breach counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerClass {
    StopLoss,
    TakeProfit,
    StopFloor,
    Trailing,
}

/// Consecutive evaluation cycles each trigger class has been breached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreachCounters {
    pub stop_loss: u32,
    pub take_profit: u32,
    pub stop_floor: u32,
    pub trailing: u32,
}

impl BreachCounters {
    pub fn get(&self, class: TriggerClass) -> u32 {
        match class {
            TriggerClass::StopLoss => self.stop_loss,
            TriggerClass::TakeProfit => self.take_profit,
            TriggerClass::StopFloor => self.stop_floor,
            TriggerClass::Trailing => self.trailing,
        }
    }

    fn slot(&mut self, class: TriggerClass) -> &mut u32 {
        match class {
            TriggerClass::StopLoss => &mut self.stop_loss,
            TriggerClass::TakeProfit => &mut self.take_profit,
            TriggerClass::StopFloor => &mut self.stop_floor,
            TriggerClass::Trailing => &mut self.trailing,
        }
    }

    /// Increment on breach, zero otherwise. Returns the new count.
    pub fn record(&mut self, class: TriggerClass, breached: bool) -> u32 {
        let slot = self.slot(class);
        *slot = if breached { slot.saturating_add(1) } else { 0 };
        *slot
    }

    pub fn clear(&mut self, class: TriggerClass) {
        *self.slot(class) = 0;
    }
}

// =============================================================================
// Avg-price drift
// =============================================================================

/// Outcome of comparing the current avg price with the one the FSM last saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvgPriceCheck {
    /// First evaluation of this record: adopt the current avg price.
    Unset,
    /// Within tolerance.
    Unchanged,
    /// Relative change beyond tolerance. Reset required.
    Material(Decimal),
}

// =============================================================================
// PositionState
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub position_id: Uuid,
    pub phase: Phase,
    /// Incremented on every reset to OPEN. Scopes action keys.
    pub episode: u32,
    /// Best price since entry or since the last phase advance.
    #[serde(default)]
    pub hwm_price: Option<Decimal>,
    #[serde(default)]
    pub stop_floor_price: Option<Decimal>,
    /// Cached volatility measure (ATR in price units).
    #[serde(default)]
    pub volatility: Option<Decimal>,
    #[serde(default)]
    pub breach: BreachCounters,
    /// Fire-once tiers already fired in this episode.
    #[serde(default)]
    pub fired: BTreeSet<TierId>,
    /// Avg price this record was computed against.
    #[serde(default)]
    pub last_avg_price: Option<Decimal>,
    #[serde(default)]
    pub last_eval_ts: Option<DateTime<Utc>>,
    pub updated_ts: DateTime<Utc>,
    pub version: u64,
}

impl PositionState {
    pub fn new(position_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            position_id,
            phase: Phase::Open,
            episode: 0,
            hwm_price: None,
            stop_floor_price: None,
            volatility: None,
            breach: BreachCounters::default(),
            fired: BTreeSet::new(),
            last_avg_price: None,
            last_eval_ts: None,
            updated_ts: now,
            version: 1,
        }
    }

    pub fn check_avg_price(&self, avg_price: Decimal, tolerance: Decimal) -> AvgPriceCheck {
        let Some(last) = self.last_avg_price else {
            return AvgPriceCheck::Unset;
        };
        if last.is_zero() {
            return if avg_price.is_zero() {
                AvgPriceCheck::Unchanged
            } else {
                AvgPriceCheck::Material(Decimal::ONE)
            };
        }
        let change = ((avg_price - last) / last).abs();
        if change > tolerance {
            AvgPriceCheck::Material(change)
        } else {
            AvgPriceCheck::Unchanged
        }
    }

    /// Start a new episode against `new_avg`. Phase, HWM, stop floor, breach
    /// counters and fired tiers are all cleared together.
    pub fn reset_to_open(&mut self, new_avg: Decimal) {
        self.phase = Phase::Open;
        self.episode = self.episode.saturating_add(1);
        self.hwm_price = None;
        self.stop_floor_price = None;
        self.breach = BreachCounters::default();
        self.fired.clear();
        self.last_avg_price = Some(new_avg);
    }

    /// Fold the current price into the high-water mark.
    pub fn update_hwm(&mut self, side: Side, price: Decimal) {
        self.hwm_price = Some(match self.hwm_price {
            Some(hwm) => side.better(hwm, price),
            None => price,
        });
    }

    /// Move forward to `to`, seeding the HWM at `price` and zeroing the
    /// debounced counters. Returns `false` without changes when `to` is not
    /// ahead of the current phase.
    pub fn advance(&mut self, to: Phase, price: Decimal) -> bool {
        if to <= self.phase {
            return false;
        }
        self.phase = to;
        self.hwm_price = Some(price);
        self.breach.clear(TriggerClass::TakeProfit);
        self.breach.clear(TriggerClass::StopFloor);
        self.breach.clear(TriggerClass::Trailing);
        true
    }

    /// Move to CLOSED once a full exit is on record. The HWM is kept.
    pub fn close(&mut self) -> bool {
        if self.phase == Phase::Closed {
            return false;
        }
        self.phase = Phase::Closed;
        self.breach.clear(TriggerClass::TakeProfit);
        self.breach.clear(TriggerClass::StopFloor);
        self.breach.clear(TriggerClass::Trailing);
        true
    }

    /// A write of `self` over `stored` would move the phase backwards without
    /// starting a new episode.
    pub fn regresses(&self, stored: &PositionState) -> bool {
        self.phase < stored.phase && self.episode <= stored.episode
    }
}
