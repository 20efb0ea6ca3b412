// =============================================================================
// Holdings book — file-backed stand-in for the broker and price collaborators
// =============================================================================
//
// The binary has no broker connection. It reads a JSON book every cycle and
// replays it into the engine:
//
//   {
//     "holdings":   [ { "account_id": "A1", "symbol": "005930",
//                       "qty": 100, "avg_price": "71000" } ],
//     "marks":      { "005930": "73500" },
//     "bids":       { "005930": "73400" },
//     "volatility": { "005930": "1400" }
//   }
//
// Marks are stamped with the time of the refresh.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::exit::service::ExitService;
use crate::position::HoldingSnapshot;
use crate::price_feed::{BestPrice, StaticPriceFeed};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Book {
    #[serde(default)]
    pub holdings: Vec<HoldingSnapshot>,
    #[serde(default)]
    pub marks: HashMap<String, Decimal>,
    #[serde(default)]
    pub bids: HashMap<String, Decimal>,
    /// ATR per symbol, in price units.
    #[serde(default)]
    pub volatility: HashMap<String, Decimal>,
}

/// What one refresh applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookRefresh {
    pub holdings: usize,
    pub marks: usize,
    pub failures: usize,
}

impl Book {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read book from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse book from {}", path.display()))
    }

    /// Publish marks and resync holdings. Per-row failures are logged and
    /// counted, never fatal.
    pub async fn apply(&self, service: &ExitService, feed: &StaticPriceFeed) -> BookRefresh {
        let now = Utc::now();
        let mut refresh = BookRefresh::default();

        for (symbol, price) in &self.marks {
            let mut best = BestPrice::new(symbol.clone(), *price, now);
            best.bid = self.bids.get(symbol).copied();
            feed.set(best);
            refresh.marks += 1;
        }

        for holding in &self.holdings {
            match service.sync_holding(holding).await {
                Ok(position) => {
                    refresh.holdings += 1;
                    if let Some(atr) = self.volatility.get(&holding.symbol) {
                        let known = service
                            .position_state(position.position_id)
                            .await
                            .ok()
                            .and_then(|s| s.volatility);
                        if position.is_open() && known != Some(*atr) {
                            if let Err(e) = service.update_volatility(position.position_id, *atr).await {
                                warn!(symbol = %holding.symbol, error = %e, "volatility update failed");
                                refresh.failures += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        account = %holding.account_id,
                        symbol = %holding.symbol,
                        error = %e,
                        "holding sync failed"
                    );
                    refresh.failures += 1;
                }
            }
        }

        debug!(
            holdings = refresh.holdings,
            marks = refresh.marks,
            failures = refresh.failures,
            "book applied"
        );
        refresh
    }
}
