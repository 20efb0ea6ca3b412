// =============================================================================
// Exit Engine — library root
// =============================================================================
//
// Evaluates open equity positions against tiered exit profiles and records
// exit order intents exactly once. Execution of those intents belongs to a
// separate collaborator.
// =============================================================================

pub mod book;
pub mod errors;
pub mod exit;
pub mod intent;
pub mod position;
pub mod price_feed;
pub mod reconcile;
pub mod runtime_config;
pub mod stats;
pub mod store;
pub mod types;

pub use errors::{ExitError, PriceFeedError, StoreError};
pub use exit::monitor::{CycleReport, EvaluationOutcome, ExitEngine, SkipReason};
pub use exit::service::{ExitService, ManualExitRequest};
pub use exit::state::Phase;
pub use runtime_config::EngineConfig;
