//! # Seqtag Core
//!
//! Decode-and-score engine for sequence taggers: a linear-chain CRF layer
//! (training loss, Viterbi decoding, gradients) and a partial-match span
//! evaluator with a configurable overlap tolerance.
//!
//! ## Quick Start
//!
//! ```rust
//! use seqtag_core::{CrfLayer, EvalConfig, TagVocabulary, score_corpus};
//!
//! let vocab = TagVocabulary::from_sequences([["O", "B-PER", "I-PER"]], Some("<pad>"));
//! let layer = CrfLayer::zeros(vocab.len()).unwrap().with_pad(0).unwrap();
//!
//! let emissions = vec![vec![0.0, 2.0, 0.5, 0.0], vec![0.0, 0.1, 0.2, 1.5]];
//! let predicted = layer.decode(&emissions).unwrap().tags;
//! assert_eq!(vocab.decode(&predicted).unwrap(), vec!["O", "I-PER"]);
//!
//! let gold = vec![vocab.encode(&["B-PER", "I-PER"]).unwrap()];
//! let scores = score_corpus(&gold, &[predicted], &vocab, &EvalConfig::lenient()).unwrap();
//! assert_eq!(scores.micro.f1, 1.0);
//! ```
pub mod config;
pub mod crf;
pub mod error;
pub mod eval;
pub mod model;
pub mod tags;

// Re-export primary API
pub use config::{EvalConfig, LENIENT_OVERLAP, STRICT_OVERLAP};
pub use crf::{CrfGradients, CrfLayer, Decoded, TensorCrf, crf_decode, crf_loss};
pub use error::{Result, SeqtagError};
pub use eval::{
    CorpusScores, Counts, Evaluation, OverlapPolicy, ScoreAggregator, Scores, Span, SpanMatcher,
    SpanSource, extract_spans, score_corpus, token_accuracy,
};
pub use model::{CrfSnapshot, TaggerHead, TaggerKind};
pub use tags::{TagId, TagVocabulary};
