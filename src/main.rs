// =============================================================================
// Exit Engine — Main Entry Point
// =============================================================================
//
// Wires the in-memory store, publishes the built-in default profile and runs
// the evaluation and reconciliation loops until Ctrl+C. With EXIT_ENGINE_BOOK
// set, holdings and marks are replayed from that JSON file every cycle.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use exit_engine::book::Book;
use exit_engine::exit::profile::ExitProfile;
use exit_engine::price_feed::StaticPriceFeed;
use exit_engine::reconcile::run_reconciliation;
use exit_engine::stats::EngineStats;
use exit_engine::store::{InMemoryStore, Repositories};
use exit_engine::{EngineConfig, ExitEngine, ExitService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path =
        std::env::var("EXIT_ENGINE_CONFIG").unwrap_or_else(|_| "exit_engine.json".to_string());
    let config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });

    info!(
        interval_ms = config.evaluation_interval_ms,
        freshness_secs = config.price_freshness_secs,
        default_profile = %config.default_profile_id,
        "Exit engine starting up"
    );

    // ── 2. Store, profiles, services ─────────────────────────────────────
    let store = Arc::new(InMemoryStore::new(config.max_recent_signals));
    let repos = Repositories::from_memory(store);
    let stats = Arc::new(EngineStats::new());
    let feed = Arc::new(StaticPriceFeed::new());
    let service = Arc::new(ExitService::new(repos.clone(), Arc::clone(&stats)));

    service
        .publish_profile(ExitProfile::builtin_default(
            config.default_profile_id.clone(),
            Utc::now(),
        ))
        .await?;

    // One Notify per loop: a stored permit reaches a loop even if it is
    // mid-cycle when the signal arrives.
    let mut tasks = Vec::new();
    let mut stops: Vec<Arc<Notify>> = Vec::new();
    let mut stop_signal = || {
        let n = Arc::new(Notify::new());
        stops.push(Arc::clone(&n));
        n
    };

    // ── 3. Book replay (stand-in for broker + price feed) ────────────────
    if let Ok(book_path) = std::env::var("EXIT_ENGINE_BOOK") {
        let book = Book::load(&book_path)?;
        let refresh = book.apply(&service, &feed).await;
        info!(path = %book_path, holdings = refresh.holdings, marks = refresh.marks, "Book loaded");

        let svc = Arc::clone(&service);
        let book_feed = Arc::clone(&feed);
        let stop = stop_signal();
        let every = config.evaluation_interval();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = interval.tick() => match Book::load(&book_path) {
                        Ok(book) => {
                            book.apply(&svc, &book_feed).await;
                        }
                        Err(e) => warn!(error = %e, "Book refresh failed, keeping last marks"),
                    },
                }
            }
        }));
    } else {
        warn!("EXIT_ENGINE_BOOK not set, running with no positions or prices");
    }

    // ── 4. Evaluation loop ───────────────────────────────────────────────
    let engine = Arc::new(ExitEngine::new(
        repos.clone(),
        feed,
        config.clone(),
        Arc::clone(&stats),
    ));
    tasks.push(tokio::spawn(Arc::clone(&engine).run(stop_signal())));

    // ── 5. Reconciliation loop ───────────────────────────────────────────
    tasks.push(tokio::spawn(run_reconciliation(
        repos.intents.clone(),
        Arc::clone(&stats),
        config.reconcile_interval(),
        config.reconcile_scan_limit,
        stop_signal(),
    )));

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping loops");

    for stop in &stops {
        stop.notify_one();
    }
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Task ended abnormally");
        }
    }

    let snapshot = service.stats();
    info!(
        cycles = snapshot.cycles,
        intents = snapshot.intents_created,
        suppressed = snapshot.suppressed,
        conflicts = snapshot.conflicts,
        "Exit engine shut down complete."
    );
    Ok(())
}
