//! Multi-level Markov choice experiment.
//!
//! Participants make repeated two-alternative choices. Each choice moves
//! them through a hidden reward graph; the engine previews options, records
//! responses, and hands completed trials to a persistence sink.

pub mod config;
pub mod engine;
pub mod logging;
pub mod participant;
pub mod server;
pub mod session;
pub mod storage;
pub mod task;
pub mod verify;
