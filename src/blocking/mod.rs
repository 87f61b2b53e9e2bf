pub mod engine;

pub use engine::{BlockedCandidate, BlockingEngine, BlockingStrategy};
