// =============================================================================
// Best-price collaborator
// =============================================================================
//
// The exit engine does not fetch prices. It consumes the arbitrated best
// price per symbol through `PriceFeed` and refuses to act on anything the
// feed marks stale or that is older than the configured freshness window.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::PriceFeedError;

/// Best available price for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestPrice {
    pub symbol: String,
    pub price: Decimal,
    /// Best bid, when the feed has one.
    #[serde(default)]
    pub bid: Option<Decimal>,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub is_stale: bool,
}

impl BestPrice {
    pub fn new(symbol: impl Into<String>, price: Decimal, ts: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            bid: None,
            ts,
            is_stale: false,
        }
    }

    /// Price used for exit decisions: the bid when present, else the best price.
    pub fn exit_price(&self) -> Decimal {
        self.bid.unwrap_or(self.price)
    }

    /// Usable only when not flagged stale and not older than `max_age`.
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        !self.is_stale && now - self.ts <= max_age
    }
}

/// `GetBestPrice(symbol) -> (price, timestamp, isStale)`.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn best_price(&self, symbol: &str) -> Result<BestPrice, PriceFeedError>;
}

/// In-process price feed fed by whoever owns the marks (tests, the binary's
/// book loader).
#[derive(Debug, Default)]
pub struct StaticPriceFeed {
    prices: RwLock<HashMap<String, BestPrice>>,
}

impl StaticPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a fresh price stamped `ts`.
    pub fn set_price(&self, symbol: &str, price: Decimal, ts: DateTime<Utc>) {
        self.prices
            .write()
            .insert(symbol.to_string(), BestPrice::new(symbol, price, ts));
    }

    pub fn set(&self, best: BestPrice) {
        self.prices.write().insert(best.symbol.clone(), best);
    }

    /// Flag the current price for `symbol` as stale without changing it.
    pub fn mark_stale(&self, symbol: &str) {
        if let Some(p) = self.prices.write().get_mut(symbol) {
            p.is_stale = true;
        }
    }

    pub fn remove(&self, symbol: &str) {
        self.prices.write().remove(symbol);
    }
}

#[async_trait]
impl PriceFeed for StaticPriceFeed {
    async fn best_price(&self, symbol: &str) -> Result<BestPrice, PriceFeedError> {
        self.prices
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| PriceFeedError::NotAvailable(symbol.to_string()))
    }
}
