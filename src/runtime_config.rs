// =============================================================================
// Engine Configuration — evaluation cadence, freshness and reset tolerances
// =============================================================================
//
// Every tunable parameter of the exit engine lives here. Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an older
// config file.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_evaluation_interval_ms() -> u64 {
    3_000
}

fn default_price_freshness_secs() -> u64 {
    10
}

fn default_avg_price_reset_tolerance() -> Decimal {
    dec!(0.005)
}

fn default_max_concurrent_evaluations() -> usize {
    16
}

fn default_profile_id() -> String {
    "default".to_string()
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_reconcile_scan_limit() -> usize {
    500
}

fn default_max_recent_signals() -> usize {
    1_000
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the exit engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cadence of the evaluation loop.
    #[serde(default = "default_evaluation_interval_ms")]
    pub evaluation_interval_ms: u64,

    /// A best price older than this is treated as stale even when the price
    /// collaborator does not flag it.
    #[serde(default = "default_price_freshness_secs")]
    pub price_freshness_secs: u64,

    /// Relative avg-price change (0.005 = 0.5%) beyond which the FSM record is
    /// reset to OPEN.
    #[serde(default = "default_avg_price_reset_tolerance")]
    pub avg_price_reset_tolerance: Decimal,

    /// Upper bound on positions evaluated concurrently within one cycle.
    #[serde(default = "default_max_concurrent_evaluations")]
    pub max_concurrent_evaluations: usize,

    /// Profile used when neither a symbol override nor the position names one.
    #[serde(default = "default_profile_id")]
    pub default_profile_id: String,

    /// Restrict evaluation to one account. `None` evaluates every account.
    #[serde(default)]
    pub account_id: Option<String>,

    /// Cadence of the intent reconciliation pass.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// How many recent intents one reconciliation pass inspects.
    #[serde(default = "default_reconcile_scan_limit")]
    pub reconcile_scan_limit: usize,

    /// Cap on the in-memory exit signal journal.
    #[serde(default = "default_max_recent_signals")]
    pub max_recent_signals: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_ms: default_evaluation_interval_ms(),
            price_freshness_secs: default_price_freshness_secs(),
            avg_price_reset_tolerance: default_avg_price_reset_tolerance(),
            max_concurrent_evaluations: default_max_concurrent_evaluations(),
            default_profile_id: default_profile_id(),
            account_id: None,
            reconcile_interval_secs: default_reconcile_interval_secs(),
            reconcile_scan_limit: default_reconcile_scan_limit(),
            max_recent_signals: default_max_recent_signals(),
        }
    }
}

impl EngineConfig {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms.max(1))
    }

    pub fn price_freshness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.price_freshness_secs as i64)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            interval_ms = config.evaluation_interval_ms,
            default_profile = %config.default_profile_id,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}
