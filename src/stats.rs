// =============================================================================
// Engine statistics — lock-free counters for operators
// =============================================================================
//
// Every subsystem holds an `Arc<EngineStats>` and bumps counters with relaxed
// atomics. `snapshot()` produces a serialisable copy for logging or an
// external status surface.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::exit::monitor::{EvaluationOutcome, SkipReason};

#[derive(Debug, Default)]
pub struct EngineStats {
    cycles: AtomicU64,
    positions_evaluated: AtomicU64,
    intents_created: AtomicU64,
    already_recorded: AtomicU64,
    suppressed: AtomicU64,
    no_available_qty: AtomicU64,
    price_skips: AtomicU64,
    profile_errors: AtomicU64,
    conflicts: AtomicU64,
    failures: AtomicU64,
    resets: AtomicU64,
    manual_intents: AtomicU64,
    duplicates_cancelled: AtomicU64,
    last_cycle_ms: AtomicU64,
    /// Unix millis of the last completed cycle, 0 when none.
    last_cycle_at: AtomicI64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub positions_evaluated: u64,
    pub intents_created: u64,
    pub already_recorded: u64,
    pub suppressed: u64,
    pub no_available_qty: u64,
    pub price_skips: u64,
    pub profile_errors: u64,
    pub conflicts: u64,
    pub failures: u64,
    pub resets: u64,
    pub manual_intents: u64,
    pub duplicates_cancelled: u64,
    pub last_cycle_ms: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_outcome(&self, outcome: &EvaluationOutcome) {
        let counter = match outcome {
            EvaluationOutcome::NoTrigger => None,
            EvaluationOutcome::Emitted { .. } => Some(&self.intents_created),
            EvaluationOutcome::AlreadyRecorded { .. } => Some(&self.already_recorded),
            EvaluationOutcome::Suppressed { .. } => Some(&self.suppressed),
            EvaluationOutcome::NoAvailableQty { .. } => Some(&self.no_available_qty),
            EvaluationOutcome::Skipped(SkipReason::Profile) => Some(&self.profile_errors),
            EvaluationOutcome::Skipped(SkipReason::NotOpen) => None,
            EvaluationOutcome::Skipped(_) => Some(&self.price_skips),
            EvaluationOutcome::Conflict => Some(&self.conflicts),
            EvaluationOutcome::Failed(_) => Some(&self.failures),
        };
        if !matches!(outcome, EvaluationOutcome::Skipped(_)) {
            self.positions_evaluated.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(c) = counter {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cycle(&self, elapsed: Duration) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.last_cycle_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.last_cycle_at
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_manual_intent(&self) {
        self.manual_intents.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicates_cancelled(&self, n: u64) {
        self.duplicates_cancelled.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let at = self.last_cycle_at.load(Ordering::Relaxed);
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            positions_evaluated: self.positions_evaluated.load(Ordering::Relaxed),
            intents_created: self.intents_created.load(Ordering::Relaxed),
            already_recorded: self.already_recorded.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            no_available_qty: self.no_available_qty.load(Ordering::Relaxed),
            price_skips: self.price_skips.load(Ordering::Relaxed),
            profile_errors: self.profile_errors.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            manual_intents: self.manual_intents.load(Ordering::Relaxed),
            duplicates_cancelled: self.duplicates_cancelled.load(Ordering::Relaxed),
            last_cycle_ms: self.last_cycle_ms.load(Ordering::Relaxed),
            last_cycle_at: if at == 0 {
                None
            } else {
                Utc.timestamp_millis_opt(at).single()
            },
        }
    }
}
