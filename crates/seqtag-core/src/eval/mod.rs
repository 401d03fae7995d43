//! Partial-match span evaluation: extraction, matching and aggregation.

pub mod corpus;
pub mod matcher;
pub mod metrics;
pub mod spans;

pub use corpus::{Evaluation, check_alignment, score_corpus, token_accuracy};
pub use matcher::{OverlapPolicy, SpanMatcher, SpanPair};
pub use metrics::{CorpusScores, Counts, ScoreAggregator, Scores, TypeCounts};
pub use spans::{Span, SpanSource, extract_spans};
