// =============================================================================
// Intent emission — exactly-once order intents keyed by action key
// =============================================================================
//
// Action key: `{position_id}:{episode}:{phase}:{reason}`
//
// The key names the logical exit, not the attempt: re-evaluating the same
// fire in the same phase yields the same key, and the store's unique index
// turns the second insert into `AlreadyRecorded`. The episode component lets
// the same reason fire again after an avg-price reset. Manual exits drop the
// phase and carry the caller's request id instead.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::{ExitError, StoreError};
use crate::exit::control::{gate, ExitControl, GateVerdict, Origin, Suppression};
use crate::exit::state::Phase;
use crate::intent::OrderIntent;
use crate::position::Position;
use crate::store::OrderIntentRepository;
use crate::types::{ExitMode, IntentKind, ReasonCode};

pub fn action_key(position_id: Uuid, episode: u32, phase: Phase, reason: ReasonCode) -> String {
    format!("{position_id}:{episode}:{phase}:{reason}")
}

/// Manual exits are keyed by the caller's request id so that retries of one
/// request collapse while distinct requests do not. Without a request id one
/// manual exit per episode is allowed. The phase is left out: a full manual
/// exit closes the FSM, and a retry must still find its intent.
pub fn manual_action_key(position_id: Uuid, episode: u32, request_id: Option<&str>) -> String {
    let base = format!("{position_id}:{episode}:{}", ReasonCode::Manual);
    match request_id {
        Some(id) => format!("{base}:{id}"),
        None => base,
    }
}

/// One exit the caller wants recorded.
#[derive(Debug, Clone)]
pub struct EmitRequest<'a> {
    pub position: &'a Position,
    pub exit_mode: ExitMode,
    pub reason: ReasonCode,
    pub qty: i64,
    pub full_exit: bool,
    pub action_key: String,
    pub origin: Origin,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EmitOutcome {
    Created(OrderIntent),
    /// An intent with this action key already exists.
    AlreadyRecorded(String),
    Suppressed(Suppression),
}

impl EmitOutcome {
    /// An intent exists for the request after this call.
    pub fn is_recorded(&self) -> bool {
        matches!(self, Self::Created(_) | Self::AlreadyRecorded(_))
    }
}

pub struct IntentEmitter {
    intents: Arc<dyn OrderIntentRepository>,
}

impl IntentEmitter {
    pub fn new(intents: Arc<dyn OrderIntentRepository>) -> Self {
        Self { intents }
    }

    /// Gate the request against `control` and the exit mode, then insert.
    pub async fn emit(
        &self,
        request: &EmitRequest<'_>,
        control: &ExitControl,
    ) -> Result<EmitOutcome, ExitError> {
        let status = match gate(control, request.exit_mode, request.reason, request.origin) {
            GateVerdict::Emit(status) => status,
            GateVerdict::Suppressed(why) => {
                debug!(
                    position_id = %request.position.position_id,
                    reason = %request.reason,
                    suppressed_by = %why,
                    "exit suppressed"
                );
                return Ok(EmitOutcome::Suppressed(why));
            }
        };

        if request.qty <= 0 {
            return Err(ExitError::InvalidQuantity(request.qty));
        }

        let now = Utc::now();
        let intent = OrderIntent {
            intent_id: Uuid::new_v4(),
            position_id: request.position.position_id,
            symbol: request.position.symbol.clone(),
            kind: if request.full_exit {
                IntentKind::ExitFull
            } else {
                IntentKind::ExitPartial
            },
            qty: request.qty,
            filled_qty: 0,
            reason_code: request.reason,
            action_key: request.action_key.clone(),
            status,
            created_ts: now,
            updated_ts: now,
        };

        match self.intents.create_intent(intent.clone()).await {
            Ok(()) => {
                info!(
                    intent_id = %intent.intent_id,
                    position_id = %intent.position_id,
                    symbol = %intent.symbol,
                    reason = %intent.reason_code,
                    qty = intent.qty,
                    kind = %intent.kind,
                    status = %intent.status,
                    action_key = %intent.action_key,
                    "exit intent created"
                );
                Ok(EmitOutcome::Created(intent))
            }
            Err(StoreError::IntentExists(key)) => {
                debug!(action_key = %key, "exit intent already recorded");
                Ok(EmitOutcome::AlreadyRecorded(key))
            }
            Err(e) => Err(e.into()),
        }
    }
}
