// =============================================================================
// Exit control — global kill switch and the emission gate
// =============================================================================
//
//   RUNNING       every trigger may emit
//   PAUSE_PROFIT  only loss-protective reasons (SL1, SL2, STOP_FLOOR) emit
//   PAUSE_ALL     automatic emission stops entirely
//
// The per-position exit mode is applied on top: DISABLED suppresses,
// MANUAL_ONLY parks automatic intents in PENDING_APPROVAL.
// Operator-requested manual exits bypass the kill switch but not DISABLED.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ControlMode, ExitMode, IntentStatus, ReasonCode};

/// Singleton control record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitControl {
    pub mode: ControlMode,
    #[serde(default)]
    pub reason: Option<String>,
    pub updated_by: String,
    pub updated_ts: DateTime<Utc>,
}

impl ExitControl {
    pub fn running(now: DateTime<Utc>) -> Self {
        Self {
            mode: ControlMode::Running,
            reason: None,
            updated_by: "system".to_string(),
            updated_ts: now,
        }
    }
}

/// Who asked for the exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Automatic,
    Manual,
}

/// Why an exit was not emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Suppression {
    PausedAll,
    PausedProfit,
    ExitDisabled,
}

impl std::fmt::Display for Suppression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PausedAll => write!(f, "PAUSE_ALL"),
            Self::PausedProfit => write!(f, "PAUSE_PROFIT"),
            Self::ExitDisabled => write!(f, "EXIT_DISABLED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    /// Create the intent with this initial status.
    Emit(IntentStatus),
    Suppressed(Suppression),
}

pub fn gate(
    control: &ExitControl,
    exit_mode: ExitMode,
    reason: ReasonCode,
    origin: Origin,
) -> GateVerdict {
    if exit_mode == ExitMode::Disabled {
        return GateVerdict::Suppressed(Suppression::ExitDisabled);
    }
    if origin == Origin::Manual {
        return GateVerdict::Emit(IntentStatus::New);
    }
    match control.mode {
        ControlMode::PauseAll => return GateVerdict::Suppressed(Suppression::PausedAll),
        ControlMode::PauseProfit if !reason.is_protective() => {
            return GateVerdict::Suppressed(Suppression::PausedProfit)
        }
        _ => {}
    }
    match exit_mode {
        ExitMode::ManualOnly => GateVerdict::Emit(IntentStatus::PendingApproval),
        _ => GateVerdict::Emit(IntentStatus::New),
    }
}
