// =============================================================================
// Order intents and the exit signal journal
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{IntentKind, IntentStatus, ReasonCode};

/// The unit of exactly-once exit emission. `action_key` is unique in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub intent_id: Uuid,
    pub position_id: Uuid,
    pub symbol: String,
    pub kind: IntentKind,
    pub qty: i64,
    /// Shares the broker has filled. Set by the holding resync.
    #[serde(default)]
    pub filled_qty: i64,
    pub reason_code: ReasonCode,
    pub action_key: String,
    pub status: IntentStatus,
    pub created_ts: DateTime<Utc>,
    pub updated_ts: DateTime<Utc>,
}

impl OrderIntent {
    /// Shares this intent still holds against its position.
    pub fn remaining_qty(&self) -> i64 {
        if self.status.is_active() {
            (self.qty - self.filled_qty).max(0)
        } else {
            0
        }
    }
}

/// Record of one fire decision, kept for debugging and backtests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitSignal {
    pub signal_id: Uuid,
    pub position_id: Uuid,
    pub rule: ReasonCode,
    /// `true` when an intent was created or already recorded for this fire.
    pub emitted: bool,
    pub detail: String,
    pub price: Decimal,
    pub evaluated_ts: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(qty: i64, filled_qty: i64, status: IntentStatus) -> OrderIntent {
        let now = Utc::now();
        OrderIntent {
            intent_id: Uuid::new_v4(),
            position_id: Uuid::new_v4(),
            symbol: "005930".into(),
            kind: IntentKind::ExitPartial,
            qty,
            filled_qty,
            reason_code: ReasonCode::Sl1,
            action_key: "k".into(),
            status,
            created_ts: now,
            updated_ts: now,
        }
    }

    #[test]
    fn remaining_qty_excludes_fills_and_terminal_intents() {
        assert_eq!(intent(50, 0, IntentStatus::New).remaining_qty(), 50);
        assert_eq!(intent(50, 20, IntentStatus::Submitted).remaining_qty(), 30);
        assert_eq!(intent(50, 50, IntentStatus::Submitted).remaining_qty(), 0);
        assert_eq!(intent(50, 0, IntentStatus::Rejected).remaining_qty(), 0);
    }

    #[test]
    fn filled_qty_defaults_when_absent() {
        let json = serde_json::json!({
            "intent_id": Uuid::nil(),
            "position_id": Uuid::nil(),
            "symbol": "005930",
            "kind": "EXIT_FULL",
            "qty": 10,
            "reason_code": "SL2",
            "action_key": "k",
            "status": "NEW",
            "created_ts": "2024-01-02T00:00:00Z",
            "updated_ts": "2024-01-02T00:00:00Z"
        });
        let intent: OrderIntent = serde_json::from_value(json).unwrap();
        assert_eq!(intent.filled_qty, 0);
    }
}
