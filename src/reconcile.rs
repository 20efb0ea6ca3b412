// =============================================================================
// Intent Reconciliation — clean up duplicate active exit intents
// =============================================================================
//
// Action keys are scoped by episode, so the same (position, reason) can end up
// with two active intents when an avg-price reset lands between an emit and
// its state commit. Each pass keeps the newest active intent of every
// (position, reason) group and cancels older ones that have not reached the
// broker yet. MANUAL intents are never grouped: each request id is its own
// exit, so two of them on one position are not duplicates.
//
// SAFETY POLICY: intents already SUBMITTED are never touched. Duplicates in
// that state are logged for an operator to resolve.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::ExitError;
use crate::intent::OrderIntent;
use crate::stats::EngineStats;
use crate::store::OrderIntentRepository;
use crate::types::{IntentStatus, ReasonCode};

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

/// Summary of a single reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileResult {
    /// Intents inspected.
    pub scanned: usize,
    /// Groups holding more than one active intent.
    pub duplicate_groups: usize,
    pub cancelled: usize,
    /// Older duplicates left alone because they were already submitted.
    pub submitted_duplicates: usize,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Run one reconciliation pass over the `scan_limit` most recent intents.
pub async fn reconcile_once(
    intents: &dyn OrderIntentRepository,
    scan_limit: usize,
) -> Result<ReconcileResult, ExitError> {
    let now = Utc::now();
    let recent = intents.recent_intents(scan_limit).await?;
    debug!(scanned = recent.len(), "intent reconciliation started");

    let mut groups: HashMap<(Uuid, ReasonCode), Vec<&OrderIntent>> = HashMap::new();
    for intent in recent
        .iter()
        .filter(|i| i.status.is_active() && i.reason_code != ReasonCode::Manual)
    {
        groups
            .entry((intent.position_id, intent.reason_code))
            .or_default()
            .push(intent);
    }

    let mut result = ReconcileResult {
        scanned: recent.len(),
        duplicate_groups: 0,
        cancelled: 0,
        submitted_duplicates: 0,
        timestamp: now,
    };

    for ((position_id, reason), mut group) in groups {
        if group.len() < 2 {
            continue;
        }
        result.duplicate_groups += 1;
        group.sort_by_key(|i| i.created_ts);
        let Some((newest, older)) = group.split_last() else {
            continue;
        };

        for stale in older {
            if stale.status == IntentStatus::Submitted {
                warn!(
                    position_id = %position_id,
                    reason = %reason,
                    intent_id = %stale.intent_id,
                    kept = %newest.intent_id,
                    "duplicate intent already submitted, leaving for operator"
                );
                result.submitted_duplicates += 1;
                continue;
            }
            match intents
                .transition_intent(stale.intent_id, Some(stale.status), IntentStatus::Cancelled)
                .await
            {
                Ok(_) => {
                    warn!(
                        position_id = %position_id,
                        reason = %reason,
                        cancelled = %stale.intent_id,
                        kept = %newest.intent_id,
                        "cancelled duplicate exit intent"
                    );
                    result.cancelled += 1;
                }
                // Status moved since the scan; the next pass will see it.
                Err(e) => warn!(
                    intent_id = %stale.intent_id,
                    error = %e,
                    "failed to cancel duplicate intent"
                ),
            }
        }
    }

    if result.cancelled > 0 {
        info!(
            cancelled = result.cancelled,
            groups = result.duplicate_groups,
            "intent reconciliation cancelled duplicates"
        );
    }
    Ok(result)
}

/// Reconcile every `every` until `shutdown` is notified.
pub async fn run_reconciliation(
    intents: Arc<dyn OrderIntentRepository>,
    stats: Arc<EngineStats>,
    every: std::time::Duration,
    scan_limit: usize,
    shutdown: Arc<Notify>,
) {
    info!(interval_secs = every.as_secs(), scan_limit, "intent reconciliation started");
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                info!("intent reconciliation stopping");
                break;
            }
            _ = ticker.tick() => {
                match reconcile_once(intents.as_ref(), scan_limit).await {
                    Ok(r) => stats.record_duplicates_cancelled(r.cancelled as u64),
                    Err(e) => error!(error = %e, "intent reconciliation failed"),
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
