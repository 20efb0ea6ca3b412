//! End-to-end exit scenarios.
//!
//! Drives the evaluation loop one cycle at a time against the in-memory store
//! and a static price feed, the same wiring the binary uses.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use exit_engine::exit::profile::ExitProfile;
use exit_engine::exit::state::TriggerClass;
use exit_engine::position::{HoldingSnapshot, Position};
use exit_engine::price_feed::{BestPrice, PriceFeed, StaticPriceFeed};
use exit_engine::stats::EngineStats;
use exit_engine::store::{
    InMemoryStore, OrderIntentRepository, PositionRepository, PositionStateRepository, Repositories,
};
use exit_engine::types::{ControlMode, ExitMode, IntentKind, IntentStatus, PositionStatus, ReasonCode, Side};
use exit_engine::{
    CycleReport, EngineConfig, EvaluationOutcome, ExitEngine, ExitService, Phase, PriceFeedError,
};

// =============================================================================
// Harness
// =============================================================================

const SYMBOL: &str = "005930";

struct Desk {
    store: Arc<InMemoryStore>,
    feed: Arc<StaticPriceFeed>,
    engine: ExitEngine,
    service: ExitService,
}

async fn desk() -> Desk {
    let feed = Arc::new(StaticPriceFeed::new());
    let store = Arc::new(InMemoryStore::new(100));
    let repos = Repositories::from_memory(store.clone());
    let stats = Arc::new(EngineStats::new());
    let service = ExitService::new(repos.clone(), Arc::clone(&stats));
    service
        .publish_profile(ExitProfile::builtin_default("default", Utc::now()))
        .await
        .unwrap();
    let engine = ExitEngine::new(repos, feed.clone(), EngineConfig::default(), stats);
    Desk {
        store,
        feed,
        engine,
        service,
    }
}

fn holding(qty: i64, avg_price: Decimal) -> HoldingSnapshot {
    HoldingSnapshot {
        account_id: "ACC-1".into(),
        symbol: SYMBOL.into(),
        side: Side::Long,
        qty,
        avg_price,
    }
}

async fn enter(d: &Desk) -> Position {
    d.service.sync_holding(&holding(100, dec!(10000))).await.unwrap()
}

async fn tick(d: &Desk, price: Decimal) -> CycleReport {
    d.feed.set_price(SYMBOL, price, Utc::now());
    d.engine.run_cycle().await.unwrap()
}

async fn intents(d: &Desk, position_id: Uuid) -> Vec<exit_engine::intent::OrderIntent> {
    d.service.intents_for_position(position_id).await.unwrap()
}

fn emitted(report: &CycleReport, id: Uuid) -> Option<ReasonCode> {
    match report.outcome(id) {
        Some(EvaluationOutcome::Emitted { reason, .. }) => Some(*reason),
        _ => None,
    }
}

// =============================================================================
// Take-profit ladder
// =============================================================================

mod take_profit {
    use super::*;

    #[tokio::test]
    async fn tp1_fires_on_second_confirming_tick() {
        let d = desk().await;
        let pos = enter(&d).await;

        let r = tick(&d, dec!(10720)).await;
        assert_eq!(r.outcome(pos.position_id), Some(&EvaluationOutcome::NoTrigger));
        assert!(intents(&d, pos.position_id).await.is_empty());

        let r = tick(&d, dec!(10715)).await;
        assert_eq!(emitted(&r, pos.position_id), Some(ReasonCode::Tp1));

        let all = intents(&d, pos.position_id).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].reason_code, ReasonCode::Tp1);
        assert_eq!(all[0].status, IntentStatus::New);
        assert_eq!(all[0].kind, IntentKind::ExitPartial);
        assert_eq!(all[0].qty, 25);

        let state = d.service.position_state(pos.position_id).await.unwrap();
        assert_eq!(state.phase, Phase::PostTp1);
        assert_eq!(state.stop_floor_price, Some(dec!(10060)));
    }

    #[tokio::test]
    async fn one_tick_short_of_confirmation_never_fires() {
        let d = desk().await;
        let pos = enter(&d).await;

        // Breach, drop back, breach again: the counter restarts each time.
        for price in [dec!(10720), dec!(10600), dec!(10720), dec!(10500), dec!(10750)] {
            tick(&d, price).await;
        }
        assert!(intents(&d, pos.position_id).await.is_empty());
        assert_eq!(
            d.service.position_phase(pos.position_id).await.unwrap(),
            Phase::Open
        );
        let state = d.service.position_state(pos.position_id).await.unwrap();
        assert_eq!(state.breach.get(TriggerClass::TakeProfit), 1);
    }

    #[tokio::test]
    async fn stop_floor_exits_the_rest_after_tp1() {
        let d = desk().await;
        let pos = enter(&d).await;
        tick(&d, dec!(10720)).await;
        tick(&d, dec!(10720)).await;

        tick(&d, dec!(10050)).await;
        let r = tick(&d, dec!(10040)).await;
        assert_eq!(emitted(&r, pos.position_id), Some(ReasonCode::StopFloor));

        let floor = intents(&d, pos.position_id)
            .await
            .into_iter()
            .find(|i| i.reason_code == ReasonCode::StopFloor)
            .unwrap();
        // 25 are already locked by the TP1 intent.
        assert_eq!(floor.qty, 75);
        assert_eq!(floor.kind, IntentKind::ExitPartial);
    }
}

// =============================================================================
// Stop-loss precedence
// =============================================================================

mod stop_loss {
    use super::*;

    #[tokio::test]
    async fn stop_loss_fires_without_debounce() {
        let d = desk().await;
        let pos = enter(&d).await;

        let r = tick(&d, dec!(9650)).await;
        assert_eq!(emitted(&r, pos.position_id), Some(ReasonCode::Sl1));
        assert_eq!(intents(&d, pos.position_id).await[0].qty, 50);
    }

    #[tokio::test]
    async fn stop_loss_wins_over_a_confirmed_stop_floor() {
        let d = desk().await;
        let pos = enter(&d).await;
        tick(&d, dec!(10720)).await;
        tick(&d, dec!(10720)).await;

        // First floor tick, then a gap down through both floor and SL1.
        tick(&d, dec!(10050)).await;
        let r = tick(&d, dec!(9650)).await;
        assert_eq!(emitted(&r, pos.position_id), Some(ReasonCode::Sl1));

        let reasons: Vec<_> = intents(&d, pos.position_id)
            .await
            .iter()
            .map(|i| i.reason_code)
            .collect();
        assert!(reasons.contains(&ReasonCode::Sl1));
        assert!(!reasons.contains(&ReasonCode::StopFloor));
    }

    #[tokio::test]
    async fn sl2_full_exit_moves_position_to_closing() {
        let d = desk().await;
        let pos = enter(&d).await;

        let r = tick(&d, dec!(9400)).await;
        assert_eq!(emitted(&r, pos.position_id), Some(ReasonCode::Sl2));

        let all = intents(&d, pos.position_id).await;
        let intent = &all[0];
        assert_eq!(intent.kind, IntentKind::ExitFull);
        assert_eq!(intent.qty, 100);

        let position = d.store.get_position(pos.position_id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Closing);
        assert_eq!(
            d.service.position_phase(pos.position_id).await.unwrap(),
            Phase::Closed
        );

        for _ in 0..3 {
            tick(&d, dec!(9300)).await;
        }
        assert_eq!(intents(&d, pos.position_id).await.len(), 1);
    }
}

// =============================================================================
// Kill switch and exit modes
// =============================================================================

mod control {
    use super::*;

    #[tokio::test]
    async fn pause_all_tracks_breach_then_emits_once_on_resume() {
        let d = desk().await;
        let pos = enter(&d).await;
        d.service
            .update_control(ControlMode::PauseAll, Some("broker maintenance".into()), "ops")
            .await
            .unwrap();

        tick(&d, dec!(9650)).await;
        let r = tick(&d, dec!(9650)).await;
        assert!(matches!(
            r.outcome(pos.position_id),
            Some(EvaluationOutcome::Suppressed { reason: ReasonCode::Sl1, .. })
        ));
        assert!(intents(&d, pos.position_id).await.is_empty());
        let state = d.service.position_state(pos.position_id).await.unwrap();
        assert_eq!(state.breach.get(TriggerClass::StopLoss), 2);
        assert_eq!(state.phase, Phase::Open);

        d.service
            .update_control(ControlMode::Running, None, "ops")
            .await
            .unwrap();
        let r = tick(&d, dec!(9650)).await;
        assert_eq!(emitted(&r, pos.position_id), Some(ReasonCode::Sl1));
        tick(&d, dec!(9650)).await;
        assert_eq!(intents(&d, pos.position_id).await.len(), 1);
    }

    #[tokio::test]
    async fn pause_profit_holds_tp_but_lets_stop_loss_through() {
        let d = desk().await;
        let pos = enter(&d).await;
        d.service
            .update_control(ControlMode::PauseProfit, None, "ops")
            .await
            .unwrap();

        tick(&d, dec!(10720)).await;
        let r = tick(&d, dec!(10720)).await;
        assert!(matches!(
            r.outcome(pos.position_id),
            Some(EvaluationOutcome::Suppressed { reason: ReasonCode::Tp1, .. })
        ));
        assert_eq!(
            d.service.position_phase(pos.position_id).await.unwrap(),
            Phase::Open
        );

        let r = tick(&d, dec!(9650)).await;
        assert_eq!(emitted(&r, pos.position_id), Some(ReasonCode::Sl1));
    }

    #[tokio::test]
    async fn manual_only_waits_for_approval() {
        let d = desk().await;
        let pos = enter(&d).await;
        d.service
            .set_exit_mode(pos.position_id, ExitMode::ManualOnly, None, pos.version)
            .await
            .unwrap();

        let r = tick(&d, dec!(9650)).await;
        let intent_id = match r.outcome(pos.position_id) {
            Some(EvaluationOutcome::Emitted { intent_id, .. }) => *intent_id,
            other => panic!("expected an intent, got {other:?}"),
        };
        let pending = d.store.get_intent(intent_id).await.unwrap();
        assert_eq!(pending.status, IntentStatus::PendingApproval);

        let approved = d.service.approve_intent(intent_id, "trader").await.unwrap();
        assert_eq!(approved.status, IntentStatus::New);
        assert!(d.service.approve_intent(intent_id, "trader").await.is_err());
    }

    #[tokio::test]
    async fn disabled_position_keeps_tracking_without_intents() {
        let d = desk().await;
        let pos = enter(&d).await;
        d.service
            .set_exit_mode(pos.position_id, ExitMode::Disabled, None, pos.version)
            .await
            .unwrap();

        tick(&d, dec!(9400)).await;
        assert!(intents(&d, pos.position_id).await.is_empty());
        let state = d.service.position_state(pos.position_id).await.unwrap();
        assert_eq!(state.breach.get(TriggerClass::StopLoss), 1);
        assert_eq!(state.hwm_price, Some(dec!(9400)));
    }
}

// =============================================================================
// Price freshness
// =============================================================================

mod prices {
    use super::*;

    #[tokio::test]
    async fn stale_price_writes_nothing() {
        let d = desk().await;
        let pos = enter(&d).await;
        let before = d.service.position_state(pos.position_id).await.unwrap();

        d.feed.set_price(SYMBOL, dec!(9000), Utc::now());
        d.feed.mark_stale(SYMBOL);
        d.engine.run_cycle().await.unwrap();

        d.feed
            .set_price(SYMBOL, dec!(9000), Utc::now() - chrono::Duration::minutes(5));
        d.engine.run_cycle().await.unwrap();

        assert!(intents(&d, pos.position_id).await.is_empty());
        assert_eq!(d.service.position_state(pos.position_id).await.unwrap(), before);
        assert_eq!(d.service.stats().price_skips, 2);
    }

    #[tokio::test]
    async fn missing_price_skips_position() {
        let d = desk().await;
        let pos = enter(&d).await;
        let r = d.engine.run_cycle().await.unwrap();
        assert_eq!(
            r.outcome(pos.position_id),
            Some(&EvaluationOutcome::Skipped(exit_engine::SkipReason::PriceUnavailable))
        );
    }
}

// =============================================================================
// Races with the position sync path
// =============================================================================

mod races {
    use super::*;
    use exit_engine::intent::OrderIntent;
    use exit_engine::errors::StoreResult;

    /// Price feed that applies one broker holding the first time it is asked
    /// for a price, i.e. after the cycle has read the position.
    struct RacingFeed {
        prices: Arc<StaticPriceFeed>,
        store: Arc<InMemoryStore>,
        holding: Mutex<Option<HoldingSnapshot>>,
    }

    #[async_trait]
    impl PriceFeed for RacingFeed {
        async fn best_price(&self, symbol: &str) -> Result<BestPrice, PriceFeedError> {
            let pending = self.holding.lock().take();
            if let Some(h) = pending {
                self.store.sync_holding(&h).await.unwrap();
            }
            self.prices.best_price(symbol).await
        }
    }

    /// Intent store that bumps the FSM record's version the first time the
    /// engine asks for locked quantity, i.e. after it has read the state.
    struct RacingIntents {
        store: Arc<InMemoryStore>,
        bump: Mutex<Option<Uuid>>,
    }

    #[async_trait]
    impl OrderIntentRepository for RacingIntents {
        async fn create_intent(&self, intent: OrderIntent) -> StoreResult<()> {
            self.store.create_intent(intent).await
        }

        async fn get_intent(&self, intent_id: Uuid) -> StoreResult<OrderIntent> {
            self.store.get_intent(intent_id).await
        }

        async fn intent_by_action_key(&self, action_key: &str) -> StoreResult<Option<OrderIntent>> {
            self.store.intent_by_action_key(action_key).await
        }

        async fn transition_intent(
            &self,
            intent_id: Uuid,
            from: Option<IntentStatus>,
            to: IntentStatus,
        ) -> StoreResult<OrderIntent> {
            self.store.transition_intent(intent_id, from, to).await
        }

        async fn recent_intents(&self, limit: usize) -> StoreResult<Vec<OrderIntent>> {
            self.store.recent_intents(limit).await
        }

        async fn intents_for_position(&self, position_id: Uuid) -> StoreResult<Vec<OrderIntent>> {
            self.store.intents_for_position(position_id).await
        }

        async fn locked_qty(&self, position_id: Uuid) -> StoreResult<i64> {
            let pending = self.bump.lock().take();
            if let Some(id) = pending {
                self.store.update_volatility(id, dec!(150)).await.unwrap();
            }
            self.store.locked_qty(position_id).await
        }
    }

    #[tokio::test]
    async fn holding_change_mid_cycle_conflicts_without_an_intent() {
        let mut d = desk().await;
        let racing = Arc::new(RacingFeed {
            prices: d.feed.clone(),
            store: d.store.clone(),
            holding: Mutex::new(None),
        });
        d.engine = ExitEngine::new(
            Repositories::from_memory(d.store.clone()),
            racing.clone(),
            EngineConfig::default(),
            Arc::new(EngineStats::new()),
        );
        let pos = enter(&d).await;
        *racing.holding.lock() = Some(holding(80, dec!(10000)));

        let r = tick(&d, dec!(9650)).await;
        assert_eq!(r.outcome(pos.position_id), Some(&EvaluationOutcome::Conflict));
        assert!(intents(&d, pos.position_id).await.is_empty());

        // Next cycle sees the new quantity and exits normally.
        let r = tick(&d, dec!(9650)).await;
        assert_eq!(emitted(&r, pos.position_id), Some(ReasonCode::Sl1));
        let all = intents(&d, pos.position_id).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].qty, 50);
    }

    #[tokio::test]
    async fn lost_state_commit_is_caught_up_by_the_action_key() {
        let mut d = desk().await;
        let racing = Arc::new(RacingIntents {
            store: d.store.clone(),
            bump: Mutex::new(None),
        });
        let mut repos = Repositories::from_memory(d.store.clone());
        repos.intents = racing.clone();
        d.engine = ExitEngine::new(
            repos,
            d.feed.clone(),
            EngineConfig::default(),
            Arc::new(EngineStats::new()),
        );
        let pos = enter(&d).await;
        *racing.bump.lock() = Some(pos.position_id);

        let r = tick(&d, dec!(9650)).await;
        assert_eq!(emitted(&r, pos.position_id), Some(ReasonCode::Sl1));
        let state = d.store.get_state(pos.position_id).await.unwrap();
        assert!(state.fired.is_empty());

        // SL1 is derived again, hits the existing key and the state catches up.
        let r = tick(&d, dec!(9650)).await;
        assert_eq!(
            r.outcome(pos.position_id),
            Some(&EvaluationOutcome::AlreadyRecorded { reason: ReasonCode::Sl1 })
        );
        let state = d.store.get_state(pos.position_id).await.unwrap();
        assert_eq!(state.fired.len(), 1);
        assert_eq!(intents(&d, pos.position_id).await.len(), 1);
    }

    #[tokio::test]
    async fn lost_full_exit_commit_still_closes_the_position() {
        let mut d = desk().await;
        let racing = Arc::new(RacingIntents {
            store: d.store.clone(),
            bump: Mutex::new(None),
        });
        let mut repos = Repositories::from_memory(d.store.clone());
        repos.intents = racing.clone();
        d.engine = ExitEngine::new(
            repos,
            d.feed.clone(),
            EngineConfig::default(),
            Arc::new(EngineStats::new()),
        );
        let pos = enter(&d).await;
        *racing.bump.lock() = Some(pos.position_id);

        let r = tick(&d, dec!(9400)).await;
        assert_eq!(emitted(&r, pos.position_id), Some(ReasonCode::Sl2));
        let position = d.store.get_position(pos.position_id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Open);

        // Every share is locked by the SL2 intent; its key still matches.
        let r = tick(&d, dec!(9400)).await;
        assert_eq!(
            r.outcome(pos.position_id),
            Some(&EvaluationOutcome::AlreadyRecorded { reason: ReasonCode::Sl2 })
        );
        let position = d.store.get_position(pos.position_id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Closing);
        assert_eq!(
            d.service.position_phase(pos.position_id).await.unwrap(),
            Phase::Closed
        );
        let all = intents(&d, pos.position_id).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].kind, IntentKind::ExitFull);

        let r = tick(&d, dec!(9400)).await;
        assert_eq!(r.positions, 0);
    }
}

// =============================================================================
// Average-price reset
// =============================================================================

mod episodes {
    use super::*;

    #[tokio::test]
    async fn averaging_down_starts_a_new_episode() {
        let d = desk().await;
        let pos = enter(&d).await;
        tick(&d, dec!(10720)).await;
        tick(&d, dec!(10720)).await;
        assert_eq!(
            d.service.position_phase(pos.position_id).await.unwrap(),
            Phase::PostTp1
        );

        // Broker fills the TP1 order and the trader buys more lower.
        d.service.sync_holding(&holding(150, dec!(9800))).await.unwrap();
        tick(&d, dec!(9900)).await;

        let state = d.service.position_state(pos.position_id).await.unwrap();
        assert_eq!(state.phase, Phase::Open);
        assert_eq!(state.episode, 1);
        assert_eq!(state.stop_floor_price, None);
        assert_eq!(d.service.stats().resets, 1);

        // The new episode keys its TP1 independently of the first one.
        tick(&d, dec!(10490)).await;
        let r = tick(&d, dec!(10490)).await;
        assert_eq!(emitted(&r, pos.position_id), Some(ReasonCode::Tp1));
        let keys: Vec<_> = intents(&d, pos.position_id)
            .await
            .into_iter()
            .map(|i| i.action_key)
            .collect();
        assert!(keys.contains(&format!("{}:0:OPEN:TP1", pos.position_id)));
        assert!(keys.contains(&format!("{}:1:OPEN:TP1", pos.position_id)));
    }
}

// =============================================================================
// Execution feedback: fills, failures and rejections
// =============================================================================

mod execution {
    use super::*;
    use exit_engine::exit::service::ManualExitRequest;

    #[tokio::test]
    async fn filled_stop_loss_frees_shares_for_the_next_tier() {
        let d = desk().await;
        let pos = enter(&d).await;

        let r = tick(&d, dec!(9650)).await;
        assert_eq!(emitted(&r, pos.position_id), Some(ReasonCode::Sl1));
        let sl1 = intents(&d, pos.position_id).await[0].clone();
        d.service
            .update_intent_status(sl1.intent_id, IntentStatus::Submitted)
            .await
            .unwrap();

        // The broker fills SL1; the holding drops to 50.
        d.service.sync_holding(&holding(50, dec!(10000))).await.unwrap();
        assert_eq!(d.store.locked_qty(pos.position_id).await.unwrap(), 0);

        let r = tick(&d, dec!(9400)).await;
        assert_eq!(emitted(&r, pos.position_id), Some(ReasonCode::Sl2));
        let sl2 = intents(&d, pos.position_id)
            .await
            .into_iter()
            .find(|i| i.reason_code == ReasonCode::Sl2)
            .unwrap();
        assert_eq!(sl2.qty, 50);
        assert_eq!(sl2.kind, IntentKind::ExitFull);
        let position = d.store.get_position(pos.position_id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Closing);
    }

    #[tokio::test]
    async fn rejected_full_exit_reopens_and_is_evaluated_again() {
        let d = desk().await;
        let pos = enter(&d).await;
        d.service
            .set_exit_mode(pos.position_id, ExitMode::ManualOnly, None, pos.version)
            .await
            .unwrap();

        let r = tick(&d, dec!(9400)).await;
        let intent_id = match r.outcome(pos.position_id) {
            Some(EvaluationOutcome::Emitted { intent_id, .. }) => *intent_id,
            other => panic!("expected an intent, got {other:?}"),
        };
        let position = d.store.get_position(pos.position_id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Closing);

        d.service.reject_intent(intent_id, "trader").await.unwrap();
        let position = d.store.get_position(pos.position_id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        let state = d.service.position_state(pos.position_id).await.unwrap();
        assert_eq!(state.phase, Phase::Open);
        assert_eq!(state.episode, 1);

        let r = tick(&d, dec!(9400)).await;
        assert_eq!(emitted(&r, pos.position_id), Some(ReasonCode::Sl2));
        let keys: Vec<_> = intents(&d, pos.position_id)
            .await
            .into_iter()
            .map(|i| i.action_key)
            .collect();
        assert_eq!(
            keys,
            vec![
                format!("{}:0:OPEN:SL2", pos.position_id),
                format!("{}:1:OPEN:SL2", pos.position_id),
            ]
        );
    }

    #[tokio::test]
    async fn retried_full_manual_exit_returns_the_first_intent() {
        let d = desk().await;
        let pos = enter(&d).await;
        let req = ManualExitRequest {
            position_id: pos.position_id,
            qty: None,
            request_id: Some("desk-7".into()),
            requested_by: "trader".into(),
        };

        let first = d.service.create_manual_exit(&req).await.unwrap();
        assert_eq!(first.kind, IntentKind::ExitFull);
        let position = d.store.get_position(pos.position_id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Closing);
        assert_eq!(
            d.service.position_phase(pos.position_id).await.unwrap(),
            Phase::Closed
        );

        // The loop no longer evaluates it, and the retry resolves to the same intent.
        let r = tick(&d, dec!(9400)).await;
        assert_eq!(r.positions, 0);
        let again = d.service.create_manual_exit(&req).await.unwrap();
        assert_eq!(again.intent_id, first.intent_id);
        assert_eq!(intents(&d, pos.position_id).await.len(), 1);
    }
}
