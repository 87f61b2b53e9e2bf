pub mod pipeline;

pub use pipeline::{ScoringPipeline, STAGE_A_MIN_COMBINED};
