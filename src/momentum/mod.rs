pub mod engine;
pub mod profile;
pub mod state;

pub use engine::{MomentumEngine, MomentumRequest};
pub use profile::SurfProfile;
pub use state::{MomentumState, SurfPhase};
