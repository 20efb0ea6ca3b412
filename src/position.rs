// =============================================================================
// Position — one tracked lot per (account, symbol)
// =============================================================================
//
// Column ownership:
//   qty, avg_price              -> broker resync (execution side)
//   status, exit_mode, profile  -> exit engine and operators
//
// Every mutation bumps `version`. Writers that act on a previously read row
// must present the version they read; the store rejects stale versions.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ExitMode, PositionStatus, Side};

/// A single tracked position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub position_id: Uuid,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    /// Current quantity in whole shares.
    pub qty: i64,
    /// Quantity at entry. Tier quantities are percentages of this.
    pub original_qty: i64,
    pub avg_price: Decimal,
    pub entry_ts: DateTime<Utc>,
    pub status: PositionStatus,
    pub exit_mode: ExitMode,
    /// Assigned exit profile. `None` falls back to the configured default.
    #[serde(default)]
    pub exit_profile_id: Option<String>,
    pub updated_ts: DateTime<Utc>,
    /// Optimistic lock counter.
    pub version: u64,
}

impl Position {
    /// Build a fresh OPEN position from a broker holding seen for the first time.
    pub fn from_holding(holding: &HoldingSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            position_id: Uuid::new_v4(),
            account_id: holding.account_id.clone(),
            symbol: holding.symbol.clone(),
            side: holding.side,
            qty: holding.qty,
            original_qty: holding.qty,
            avg_price: holding.avg_price,
            entry_ts: now,
            status: PositionStatus::Open,
            exit_mode: ExitMode::Enabled,
            exit_profile_id: None,
            updated_ts: now,
            version: 1,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Signed return relative to the average entry price, as a fraction
    /// (0.07 = +7%). Positive means the position is winning.
    pub fn pnl_pct(&self, price: Decimal) -> Decimal {
        if self.avg_price.is_zero() {
            return Decimal::ZERO;
        }
        self.side.sign() * (price - self.avg_price) / self.avg_price
    }

    /// Price at which the position shows `pct` return (signed fraction).
    pub fn price_at_pct(&self, pct: Decimal) -> Decimal {
        self.avg_price * (Decimal::ONE + self.side.sign() * pct)
    }

    /// Whole days the position has been held at `now`.
    pub fn holding_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_ts).num_days().max(0)
    }
}

/// One broker holding as reported by the resync path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingSnapshot {
    pub account_id: String,
    pub symbol: String,
    #[serde(default)]
    pub side: Side,
    pub qty: i64,
    pub avg_price: Decimal,
}
