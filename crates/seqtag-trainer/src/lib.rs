//! # Seqtag Trainer
//!
//! Fits the CRF head of a sequence tagger on emission scores produced by an
//! external encoder, and writes accuracy plus strict/lenient span-F1 reports.
//! The `seqtag` binary wraps both workflows.

pub mod data;
pub mod report;
pub mod trainer;

pub use data::{EmissionExample, ScoredSentence, Sentence};
pub use report::ScoresReport;
pub use trainer::{CrfTrainer, EncodedExample, EpochStats, TrainOutcome, TrainerConfig};
