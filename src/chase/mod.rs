pub mod engine;
pub mod state;

pub use engine::{BatchChaseEntry, ChaseEngine};
pub use state::{ChaseOutcome, ChaseSpec, ChaseState, ChaseStatus};
