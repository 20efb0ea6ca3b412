// =============================================================================
// Shared types used across the exit engine
// =============================================================================

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Direction of a position. Long profits when price rises, short when it falls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// `+1` for long, `-1` for short. Multiply a raw price move by this to get
    /// the move in the position's favour.
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Long => dec!(1),
            Self::Short => dec!(-1),
        }
    }

    /// The more favourable of two prices from this side's point of view.
    pub fn better(&self, a: Decimal, b: Decimal) -> Decimal {
        match self {
            Self::Long => a.max(b),
            Self::Short => a.min(b),
        }
    }
}

impl Default for Side {
    fn default() -> Self {
        Self::Long
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Lifecycle status of a position row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Closing => write!(f, "CLOSING"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Per-position switch for automatic exit emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitMode {
    /// Automatic intents are created ready for execution.
    Enabled,
    /// No intents are created; the FSM keeps tracking.
    Disabled,
    /// Automatic intents wait for an explicit approve/reject.
    ManualOnly,
}

impl Default for ExitMode {
    fn default() -> Self {
        Self::Enabled
    }
}

impl std::fmt::Display for ExitMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enabled => write!(f, "ENABLED"),
            Self::Disabled => write!(f, "DISABLED"),
            Self::ManualOnly => write!(f, "MANUAL_ONLY"),
        }
    }
}

/// Process-wide kill switch mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMode {
    Running,
    /// Take-profit side exits are held back; loss protection still fires.
    PauseProfit,
    /// All automatic exits are held back.
    PauseAll,
}

impl Default for ControlMode {
    fn default() -> Self {
        Self::Running
    }
}

impl std::fmt::Display for ControlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::PauseProfit => write!(f, "PAUSE_PROFIT"),
            Self::PauseAll => write!(f, "PAUSE_ALL"),
        }
    }
}

/// Why an exit intent was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Sl1,
    Sl2,
    Tp1,
    Tp2,
    Tp3,
    StopFloor,
    Trail,
    Time,
    Manual,
}

impl ReasonCode {
    /// Loss-protective reasons. These survive a `PauseProfit` kill switch.
    pub fn is_protective(&self) -> bool {
        matches!(self, Self::Sl1 | Self::Sl2 | Self::StopFloor)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sl1 => "SL1",
            Self::Sl2 => "SL2",
            Self::Tp1 => "TP1",
            Self::Tp2 => "TP2",
            Self::Tp3 => "TP3",
            Self::StopFloor => "STOP_FLOOR",
            Self::Trail => "TRAIL",
            Self::Time => "TIME",
            Self::Manual => "MANUAL",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of an order intent. The engine creates `PendingApproval` or `New`;
/// everything after that belongs to the execution collaborator or an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentStatus {
    PendingApproval,
    New,
    Submitted,
    Failed,
    Rejected,
    Duplicate,
    Cancelled,
}

impl IntentStatus {
    /// Intents in these states still hold quantity against the position.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::PendingApproval | Self::New | Self::Submitted)
    }

    /// Whether the execution collaborator or an operator may move an intent
    /// from `self` to `next`.
    pub fn can_transition_to(&self, next: IntentStatus) -> bool {
        use IntentStatus::*;
        matches!(
            (self, next),
            (PendingApproval, New)
                | (PendingApproval, Cancelled)
                | (New, Submitted)
                | (New, Failed)
                | (New, Duplicate)
                | (New, Cancelled)
                | (Submitted, Failed)
                | (Submitted, Rejected)
                | (Submitted, Duplicate)
        )
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PendingApproval => write!(f, "PENDING_APPROVAL"),
            Self::New => write!(f, "NEW"),
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Duplicate => write!(f, "DUPLICATE"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Whether an intent closes the whole position or only part of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentKind {
    ExitPartial,
    ExitFull,
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExitPartial => write!(f, "EXIT_PARTIAL"),
            Self::ExitFull => write!(f, "EXIT_FULL"),
        }
    }
}
