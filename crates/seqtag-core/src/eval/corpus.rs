//! # Corpus Scoring
//!
//! Entry points that score whole corpora of gold and predicted tag-id
//! sequences. Sentences are aligned by position, so both corpora must have
//! the same shape.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{EvalConfig, LENIENT_OVERLAP, STRICT_OVERLAP};
use crate::error::{Result, SeqtagError};
use crate::eval::matcher::SpanMatcher;
use crate::eval::metrics::{CorpusScores, ScoreAggregator, TypeCounts};
use crate::eval::spans::{SpanSource, extract_spans};
use crate::tags::{TagId, TagVocabulary};

/// Check that both corpora have the same number of sentences and that
/// paired sentences have the same length.
pub fn check_alignment(gold: &[Vec<TagId>], predicted: &[Vec<TagId>]) -> Result<()> {
    if gold.len() != predicted.len() {
        return Err(SeqtagError::CorpusSize {
            gold: gold.len(),
            predicted: predicted.len(),
        });
    }
    match gold
        .iter()
        .zip(predicted)
        .position(|(g, p)| g.len() != p.len())
    {
        Some(sentence) => Err(SeqtagError::SentenceLength {
            sentence,
            gold: gold[sentence].len(),
            predicted: predicted[sentence].len(),
        }),
        None => Ok(()),
    }
}

/// Span-level precision, recall and F1 per type plus micro and macro
/// averages.
pub fn score_corpus(
    gold: &[Vec<TagId>],
    predicted: &[Vec<TagId>],
    vocab: &TagVocabulary,
    config: &EvalConfig,
) -> Result<CorpusScores> {
    let matcher = config.matcher()?;
    check_alignment(gold, predicted)?;
    if gold.is_empty() {
        warn!("scoring an empty corpus");
    }

    let counts = if config.parallel {
        gold.par_iter()
            .zip(predicted.par_iter())
            .map(|(g, p)| sentence_counts(g, p, vocab, &matcher))
            .try_reduce(TypeCounts::new, |a, b| Ok(a + b))?
    } else {
        gold.iter()
            .zip(predicted)
            .map(|(g, p)| sentence_counts(g, p, vocab, &matcher))
            .sum::<Result<TypeCounts>>()?
    };

    let mut aggregator = ScoreAggregator::new();
    aggregator.add_counts(counts);
    let scores = aggregator.finish(config.overlap_ratio);
    debug!(
        sentences = gold.len(),
        overlap_ratio = config.overlap_ratio,
        f1 = scores.micro.f1,
        "scored corpus"
    );
    Ok(scores)
}

fn sentence_counts(
    gold: &[TagId],
    predicted: &[TagId],
    vocab: &TagVocabulary,
    matcher: &SpanMatcher,
) -> Result<TypeCounts> {
    let gold_spans = extract_spans(gold, vocab, SpanSource::Gold)?;
    let pred_spans = extract_spans(predicted, vocab, SpanSource::Predicted)?;
    Ok(matcher.count(&gold_spans, &pred_spans))
}

/// Fraction of non-pad gold positions whose predicted tag equals the gold
/// tag. An empty corpus scores 0.
pub fn token_accuracy(
    gold: &[Vec<TagId>],
    predicted: &[Vec<TagId>],
    vocab: &TagVocabulary,
) -> Result<f64> {
    check_alignment(gold, predicted)?;
    let mut aggregator = ScoreAggregator::new();
    for (g, p) in gold.iter().zip(predicted) {
        let (correct, total) = sentence_tokens(g, p, vocab)?;
        aggregator.add_tokens(correct, total);
    }
    Ok(aggregator.token_accuracy())
}

fn sentence_tokens(gold: &[TagId], predicted: &[TagId], vocab: &TagVocabulary) -> Result<(usize, usize)> {
    let (mut correct, mut total) = (0, 0);
    for (&g, &p) in gold.iter().zip(predicted) {
        vocab.label(g)?;
        vocab.label(p)?;
        if vocab.is_pad(g) {
            continue;
        }
        total += 1;
        if g == p {
            correct += 1;
        }
    }
    Ok((correct, total))
}

/// Token accuracy plus strict and lenient span scores for one corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub accuracy: f64,
    pub strict: CorpusScores,
    pub lenient: CorpusScores,
}

impl Evaluation {
    /// Evaluate at [`STRICT_OVERLAP`] and [`LENIENT_OVERLAP`].
    pub fn run(gold: &[Vec<TagId>], predicted: &[Vec<TagId>], vocab: &TagVocabulary) -> Result<Self> {
        Self::run_with(gold, predicted, vocab, &EvalConfig::default())
    }

    /// Like [`Evaluation::run`], taking the overlap policy and parallelism
    /// from `config`. Its overlap ratio is ignored.
    pub fn run_with(
        gold: &[Vec<TagId>],
        predicted: &[Vec<TagId>],
        vocab: &TagVocabulary,
        config: &EvalConfig,
    ) -> Result<Self> {
        let accuracy = token_accuracy(gold, predicted, vocab)?;
        let strict = score_corpus(gold, predicted, vocab, &config.with_overlap_ratio(STRICT_OVERLAP))?;
        let lenient = score_corpus(gold, predicted, vocab, &config.with_overlap_ratio(LENIENT_OVERLAP))?;
        Ok(Self {
            accuracy,
            strict,
            lenient,
        })
    }
}
