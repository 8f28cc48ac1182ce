//! Runtime checks of the engine's bookkeeping invariants.

pub mod invariants;

pub use invariants::{check_all, InvariantViolation};
