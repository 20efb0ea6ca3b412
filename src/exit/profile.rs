// =============================================================================
// Exit Profiles — tiered stop-loss / take-profit / trailing configuration
// =============================================================================
//
// A profile is a list of tier rules (SL1, SL2, TP1, TP2, TP3) sharing one
// shape, plus tier-specific behaviours carried as tagged variants:
//
//   ArmStopFloor:  on fire, arm a break-even-plus-buffer floor.
//   StartTrailing: on fire, hand the residual to the trailing stop.
//
// Thresholds are signed fractions of the average entry price (-0.03 = -3%).
// When a volatility measure is cached on the position state and the profile
// carries an ATR block, every tier threshold is scaled by
//
//   factor = clamp((atr / avg_price) / ref_pct, factor_min, factor_max)
//
// and then clamped in magnitude to the tier's optional [min_pct, max_pct].
//
// Profiles are immutable once published. A symbol override may substitute a
// different profile or force a different exit mode for one symbol.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{ExitError, StoreError};
use crate::position::Position;
use crate::store::ExitProfileRepository;
use crate::types::{ExitMode, ReasonCode};

fn default_confirm_ticks() -> u32 {
    2
}

// =============================================================================
// Tier rules
// =============================================================================

/// Identity of a configured trigger tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TierId {
    Sl1,
    Sl2,
    Tp1,
    Tp2,
    Tp3,
}

impl TierId {
    pub fn reason(&self) -> ReasonCode {
        match self {
            Self::Sl1 => ReasonCode::Sl1,
            Self::Sl2 => ReasonCode::Sl2,
            Self::Tp1 => ReasonCode::Tp1,
            Self::Tp2 => ReasonCode::Tp2,
            Self::Tp3 => ReasonCode::Tp3,
        }
    }

    pub fn is_stop_loss(&self) -> bool {
        matches!(self, Self::Sl1 | Self::Sl2)
    }
}

impl std::fmt::Display for TierId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.reason().fmt(f)
    }
}

/// Tier-specific behaviour applied when the tier fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TierBehavior {
    /// Arm a stop floor at `avg_price * (1 + profit_pct)` (mirrored for shorts).
    ArmStopFloor { profit_pct: Decimal },
    /// Move the residual quantity to full trailing-stop management.
    StartTrailing,
}

/// One trigger tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierRule {
    pub tier: TierId,
    /// Signed trigger move relative to avg price (SL < 0, TP > 0).
    pub base_pct: Decimal,
    /// Tightest allowed threshold after volatility scaling.
    #[serde(default)]
    pub min_pct: Option<Decimal>,
    /// Widest allowed threshold after volatility scaling.
    #[serde(default)]
    pub max_pct: Option<Decimal>,
    /// Fraction of the *original* quantity to exit.
    pub qty_pct: Decimal,
    /// Overrides the profile-level confirm ticks. Ignored for stop-loss tiers.
    #[serde(default)]
    pub confirm_ticks: Option<u32>,
    /// Fire at most once per position episode.
    #[serde(default)]
    pub fire_once: bool,
    #[serde(default)]
    pub behaviors: Vec<TierBehavior>,
}

impl TierRule {
    /// Effective signed threshold for a volatility factor.
    pub fn threshold(&self, factor: Decimal) -> Decimal {
        let raw = self.base_pct * factor;
        let sign = if self.base_pct.is_sign_negative() {
            dec!(-1)
        } else {
            dec!(1)
        };
        let mut magnitude = raw.abs();
        if let Some(min) = self.min_pct {
            magnitude = magnitude.max(min.abs());
        }
        if let Some(max) = self.max_pct {
            magnitude = magnitude.min(max.abs());
        }
        sign * magnitude
    }

    /// Shares to exit for an original quantity: `floor(original * qty_pct)`,
    /// never below one share.
    pub fn target_qty(&self, original_qty: i64) -> i64 {
        let raw = (Decimal::from(original_qty) * self.qty_pct).floor();
        let qty = raw.to_i64().unwrap_or(original_qty);
        qty.max(1)
    }

    pub fn stop_floor_profit(&self) -> Option<Decimal> {
        self.behaviors.iter().find_map(|b| match b {
            TierBehavior::ArmStopFloor { profit_pct } => Some(*profit_pct),
            TierBehavior::StartTrailing => None,
        })
    }

    pub fn starts_trailing(&self) -> bool {
        self.behaviors
            .iter()
            .any(|b| matches!(b, TierBehavior::StartTrailing))
    }
}

/// Trailing stop applied against the high-water mark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingConfig {
    /// Give-back from the HWM that counts as a breach (0.04 = 4%).
    pub pct_trail: Decimal,
    #[serde(default)]
    pub confirm_ticks: Option<u32>,
}

/// Volatility scaling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtrConfig {
    /// Reference ATR as a fraction of price (0.02 = 2%) that maps to factor 1.
    pub ref_pct: Decimal,
    pub factor_min: Decimal,
    pub factor_max: Decimal,
}

impl AtrConfig {
    pub fn factor(&self, atr: Decimal, avg_price: Decimal) -> Decimal {
        if avg_price.is_zero() || self.ref_pct.is_zero() {
            return Decimal::ONE;
        }
        let atr_pct = atr / avg_price;
        (atr_pct / self.ref_pct).clamp(self.factor_min, self.factor_max)
    }
}

/// Time-based exit rules. A zero day count disables that rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeStopConfig {
    #[serde(default)]
    pub max_hold_days: u32,
    #[serde(default)]
    pub no_momentum_days: u32,
    /// Minimum best return required to survive the no-momentum check.
    #[serde(default)]
    pub no_momentum_profit: Decimal,
}

// =============================================================================
// Profile
// =============================================================================

/// The rule set a profile applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitProfileConfig {
    /// Consecutive confirming cycles required by debounced triggers.
    #[serde(default = "default_confirm_ticks")]
    pub confirm_ticks: u32,
    pub tiers: Vec<TierRule>,
    pub trailing: TrailingConfig,
    #[serde(default)]
    pub atr: Option<AtrConfig>,
    #[serde(default)]
    pub time_stop: Option<TimeStopConfig>,
}

impl ExitProfileConfig {
    pub fn tier(&self, id: TierId) -> Option<&TierRule> {
        self.tiers.iter().find(|t| t.tier == id)
    }

    pub fn stop_loss_tiers(&self) -> impl Iterator<Item = &TierRule> {
        self.tiers.iter().filter(|t| t.tier.is_stop_loss())
    }

    pub fn confirm_ticks_for(&self, rule: &TierRule) -> u32 {
        rule.confirm_ticks.unwrap_or(self.confirm_ticks).max(1)
    }

    pub fn stop_floor_confirm_ticks(&self) -> u32 {
        self.confirm_ticks.max(1)
    }

    pub fn trailing_confirm_ticks(&self) -> u32 {
        self.trailing
            .confirm_ticks
            .unwrap_or(self.confirm_ticks)
            .max(1)
    }

    /// Threshold scaling factor for a cached volatility measure.
    pub fn volatility_factor(&self, atr: Option<Decimal>, avg_price: Decimal) -> Decimal {
        match (&self.atr, atr) {
            (Some(cfg), Some(atr)) => cfg.factor(atr, avg_price),
            _ => Decimal::ONE,
        }
    }

    /// Reject configurations the evaluator cannot act on safely.
    pub fn validate(&self) -> Result<(), String> {
        if self.confirm_ticks == 0 {
            return Err("confirm_ticks must be at least 1".into());
        }
        let mut seen = HashSet::new();
        for rule in &self.tiers {
            if !seen.insert(rule.tier) {
                return Err(format!("tier {} configured twice", rule.tier));
            }
            if rule.tier.is_stop_loss() && rule.base_pct >= Decimal::ZERO {
                return Err(format!("{} base_pct must be negative", rule.tier));
            }
            if !rule.tier.is_stop_loss() && rule.base_pct <= Decimal::ZERO {
                return Err(format!("{} base_pct must be positive", rule.tier));
            }
            if rule.qty_pct <= Decimal::ZERO || rule.qty_pct > Decimal::ONE {
                return Err(format!("{} qty_pct must be in (0, 1]", rule.tier));
            }
            if rule.tier.is_stop_loss() && !rule.behaviors.is_empty() {
                return Err(format!("{} cannot carry take-profit behaviours", rule.tier));
            }
        }
        if self.trailing.pct_trail <= Decimal::ZERO || self.trailing.pct_trail >= Decimal::ONE {
            return Err("trailing pct_trail must be in (0, 1)".into());
        }
        if let Some(atr) = &self.atr {
            if atr.ref_pct <= Decimal::ZERO || atr.factor_min > atr.factor_max {
                return Err("atr ref_pct must be positive and factor_min <= factor_max".into());
            }
        }
        Ok(())
    }
}

/// A named, versioned, immutable-once-published rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitProfile {
    pub profile_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: u32,
    pub config: ExitProfileConfig,
    pub is_active: bool,
    pub created_by: String,
    pub created_ts: DateTime<Utc>,
}

impl ExitProfile {
    /// The built-in profile published under `profile_id` at startup.
    ///
    /// SL1 -3% (50%, once), SL2 -5% (all), TP1 +7% (25%, arms +0.6% floor),
    /// TP2 +10% (25%, once), TP3 +15% (20%, then trail 4%), 2 confirm ticks.
    pub fn builtin_default(profile_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        let tier = |tier, base_pct, qty_pct| TierRule {
            tier,
            base_pct,
            min_pct: None,
            max_pct: None,
            qty_pct,
            confirm_ticks: None,
            fire_once: false,
            behaviors: Vec::new(),
        };

        let mut sl1 = tier(TierId::Sl1, dec!(-0.03), dec!(0.50));
        sl1.fire_once = true;
        let sl2 = tier(TierId::Sl2, dec!(-0.05), dec!(1.00));
        let mut tp1 = tier(TierId::Tp1, dec!(0.07), dec!(0.25));
        tp1.behaviors.push(TierBehavior::ArmStopFloor {
            profit_pct: dec!(0.006),
        });
        let mut tp2 = tier(TierId::Tp2, dec!(0.10), dec!(0.25));
        tp2.fire_once = true;
        let mut tp3 = tier(TierId::Tp3, dec!(0.15), dec!(0.20));
        tp3.behaviors.push(TierBehavior::StartTrailing);

        Self {
            profile_id: profile_id.into(),
            name: "Default tiered exit".to_string(),
            description: "Two stop-loss tiers, three take-profit tiers, 4% trail".to_string(),
            version: 1,
            config: ExitProfileConfig {
                confirm_ticks: default_confirm_ticks(),
                tiers: vec![sl1, sl2, tp1, tp2, tp3],
                trailing: TrailingConfig {
                    pct_trail: dec!(0.04),
                    confirm_ticks: None,
                },
                atr: None,
                time_stop: None,
            },
            is_active: true,
            created_by: "system".to_string(),
            created_ts: now,
        }
    }
}

/// Symbol-level override of profile and/or exit mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolOverride {
    pub symbol: String,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub exit_mode: Option<ExitMode>,
    pub enabled: bool,
    #[serde(default)]
    pub reason: String,
    pub created_by: String,
    pub created_ts: DateTime<Utc>,
}

/// Overrides read once per cycle, keyed by symbol.
pub type OverrideSnapshot = HashMap<String, SymbolOverride>;

// =============================================================================
// Resolver
// =============================================================================

/// Where the effective profile came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProfileSource {
    SymbolOverride,
    Position,
    Default,
}

/// The profile and exit mode that apply to one position this cycle.
#[derive(Debug, Clone)]
pub struct ResolvedProfile {
    pub profile: Arc<ExitProfile>,
    pub exit_mode: ExitMode,
    pub source: ProfileSource,
}

/// Resolves the effective profile for a position. Symbol overrides take
/// precedence over the position's own assignment, which takes precedence over
/// the configured default.
pub struct ProfileResolver {
    profiles: Arc<dyn ExitProfileRepository>,
    default_profile_id: String,
}

impl ProfileResolver {
    pub fn new(profiles: Arc<dyn ExitProfileRepository>, default_profile_id: impl Into<String>) -> Self {
        Self {
            profiles,
            default_profile_id: default_profile_id.into(),
        }
    }

    /// A missing profile is an error, never "no triggers": the caller must
    /// skip the position for this cycle rather than evaluate it unprotected.
    pub async fn resolve(
        &self,
        position: &Position,
        overrides: &OverrideSnapshot,
    ) -> Result<ResolvedProfile, ExitError> {
        let active_override = overrides.get(&position.symbol).filter(|o| o.enabled);

        let exit_mode = active_override
            .and_then(|o| o.exit_mode)
            .unwrap_or(position.exit_mode);

        let mut candidates: Vec<(&str, ProfileSource)> = Vec::with_capacity(2);
        if let Some(pid) = active_override.and_then(|o| o.profile_id.as_deref()) {
            candidates.push((pid, ProfileSource::SymbolOverride));
        }
        match position.exit_profile_id.as_deref() {
            Some(pid) => candidates.push((pid, ProfileSource::Position)),
            None => candidates.push((self.default_profile_id.as_str(), ProfileSource::Default)),
        }

        for (profile_id, source) in &candidates {
            match self.profiles.get_profile(profile_id).await {
                Ok(profile) if profile.is_active => {
                    debug!(
                        position_id = %position.position_id,
                        symbol = %position.symbol,
                        profile_id,
                        source = ?source,
                        exit_mode = %exit_mode,
                        "exit profile resolved"
                    );
                    return Ok(ResolvedProfile {
                        profile: Arc::new(profile),
                        exit_mode,
                        source: *source,
                    });
                }
                Ok(_) => {
                    warn!(
                        symbol = %position.symbol,
                        profile_id,
                        source = ?source,
                        "exit profile inactive, trying next candidate"
                    );
                }
                Err(StoreError::ProfileNotFound(_)) => {
                    warn!(
                        symbol = %position.symbol,
                        profile_id,
                        source = ?source,
                        "exit profile missing, trying next candidate"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        let first = candidates
            .first()
            .map(|(pid, _)| pid.to_string())
            .unwrap_or_default();
        Err(ExitError::ProfileNotFound(first))
    }
}

// =============================================================================
// Tests
// =============================================================================
