// =============================================================================
// Exit Management Module
// =============================================================================
//
// Tiered exit FSM per position (SL1/SL2, TP1..TP3, stop floor, trailing),
// idempotent intent emission behind a kill switch, and the background monitor
// loop that evaluates all open positions every few seconds.

pub mod control;
pub mod emitter;
pub mod monitor;
pub mod profile;
pub mod service;
pub mod state;
pub mod trigger;
