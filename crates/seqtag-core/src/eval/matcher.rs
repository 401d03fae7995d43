//! # Span Matching
//!
//! Greedy, deterministic alignment of predicted spans to gold spans of the
//! same type under an overlap threshold.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SeqtagError};
use crate::eval::metrics::{Counts, TypeCounts};
use crate::eval::spans::Span;

/// Denominator of the overlap score between a gold and a predicted span.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// `|gold ∩ pred| / max(|gold|, |pred|)`
    #[default]
    MaxLength,
    /// `|gold ∩ pred| / |gold ∪ pred|`
    Union,
    /// `|gold ∩ pred| / |gold|`
    Gold,
}

impl OverlapPolicy {
    pub fn score(&self, gold: &Span, predicted: &Span) -> f64 {
        let shared = gold.intersection(predicted);
        if shared == 0 {
            return 0.0;
        }
        let denominator = match self {
            OverlapPolicy::MaxLength => gold.len().max(predicted.len()),
            OverlapPolicy::Union => gold.union(predicted),
            OverlapPolicy::Gold => gold.len(),
        };
        shared as f64 / denominator as f64
    }
}

/// An accepted gold/predicted pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanPair {
    /// The matched gold span.
    pub gold: Span,
    /// The predicted span it was matched with.
    pub predicted: Span,
    /// Overlap score under the matcher's policy, in `[overlap_ratio, 1]`.
    pub overlap: f64,
}

/// Matches spans whose overlap score reaches `overlap_ratio`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpanMatcher {
    overlap_ratio: f64,
    policy: OverlapPolicy,
}

impl SpanMatcher {
    /// # Errors
    /// [`SeqtagError::InvalidOverlapRatio`] unless `0 < overlap_ratio <= 1`.
    pub fn new(overlap_ratio: f64) -> Result<Self> {
        validate_ratio(overlap_ratio)?;
        Ok(Self {
            overlap_ratio,
            policy: OverlapPolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: OverlapPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn overlap_ratio(&self) -> f64 {
        self.overlap_ratio
    }

    pub fn policy(&self) -> OverlapPolicy {
        self.policy
    }

    /// Accepted pairs, grouped by type in sorted type order and in
    /// acceptance order within a type.
    ///
    /// Candidates (same type, overlap >= ratio) are visited by overlap
    /// descending, then gold start, then predicted start; a pair is accepted
    /// when neither span has been used yet.
    pub fn align(&self, gold: &[Span], predicted: &[Span]) -> Vec<SpanPair> {
        let mut pairs = Vec::new();
        for (_, (gold, predicted)) in group_by_kind(gold, predicted) {
            for (g, p, overlap) in self.match_kind(&gold, &predicted) {
                pairs.push(SpanPair {
                    gold: gold[g].clone(),
                    predicted: predicted[p].clone(),
                    overlap,
                });
            }
        }
        pairs
    }

    /// Per-type TP/FP/FN for one sentence.
    pub fn count(&self, gold: &[Span], predicted: &[Span]) -> TypeCounts {
        let mut counts = TypeCounts::new();
        for (kind, (gold, predicted)) in group_by_kind(gold, predicted) {
            let tp = self.match_kind(&gold, &predicted).len();
            counts.record(
                kind,
                Counts::new(tp, predicted.len() - tp, gold.len() - tp),
            );
        }
        counts
    }

    /// Greedy matching within one type. Returns `(gold index, predicted
    /// index, overlap)` in acceptance order.
    fn match_kind(&self, gold: &[&Span], predicted: &[&Span]) -> Vec<(usize, usize, f64)> {
        let mut candidates = Vec::new();
        for (g, gold_span) in gold.iter().enumerate() {
            for (p, pred_span) in predicted.iter().enumerate() {
                let overlap = self.policy.score(gold_span, pred_span);
                if overlap > 0.0 && overlap >= self.overlap_ratio {
                    candidates.push((g, p, overlap));
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(Ordering::Equal)
                .then_with(|| gold[a.0].start.cmp(&gold[b.0].start))
                .then_with(|| predicted[a.1].start.cmp(&predicted[b.1].start))
        });

        let mut gold_used = vec![false; gold.len()];
        let mut pred_used = vec![false; predicted.len()];
        candidates
            .into_iter()
            .filter(|&(g, p, _)| {
                if gold_used[g] || pred_used[p] {
                    return false;
                }
                gold_used[g] = true;
                pred_used[p] = true;
                true
            })
            .collect()
    }
}

pub(crate) fn validate_ratio(overlap_ratio: f64) -> Result<()> {
    if overlap_ratio > 0.0 && overlap_ratio <= 1.0 {
        Ok(())
    } else {
        Err(SeqtagError::InvalidOverlapRatio(overlap_ratio))
    }
}

type KindGroups<'a> = BTreeMap<&'a str, (Vec<&'a Span>, Vec<&'a Span>)>;

fn group_by_kind<'a>(gold: &'a [Span], predicted: &'a [Span]) -> KindGroups<'a> {
    let mut groups: KindGroups<'a> = BTreeMap::new();
    for span in gold {
        groups.entry(span.kind.as_str()).or_default().0.push(span);
    }
    for span in predicted {
        groups.entry(span.kind.as_str()).or_default().1.push(span);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::spans::SpanSource;
    use rstest::rstest;

    fn gold(start: usize, end: usize, kind: &str) -> Span {
        Span::new(start, end, kind, SpanSource::Gold)
    }

    fn pred(start: usize, end: usize, kind: &str) -> Span {
        Span::new(start, end, kind, SpanSource::Predicted)
    }

    #[rstest]
    #[case(0.0)]
    #[case(-0.5)]
    #[case(1.0001)]
    #[case(f64::NAN)]
    fn test_invalid_ratio(#[case] ratio: f64) {
        assert!(matches!(
            SpanMatcher::new(ratio),
            Err(SeqtagError::InvalidOverlapRatio(_))
        ));
    }

    #[rstest]
    #[case(0.999, Counts::new(0, 1, 1))]
    #[case(0.5, Counts::new(1, 0, 0))]
    fn test_half_overlap(#[case] ratio: f64, #[case] expected: Counts) {
        let matcher = SpanMatcher::new(ratio).unwrap();
        let counts = matcher.count(&[gold(1, 2, "PER")], &[pred(1, 1, "PER")]);
        assert_eq!(counts.get("PER"), Some(expected));
    }

    #[rstest]
    #[case(OverlapPolicy::MaxLength, 2.0 / 4.0)]
    #[case(OverlapPolicy::Union, 2.0 / 5.0)]
    #[case(OverlapPolicy::Gold, 2.0 / 3.0)]
    fn test_policies(#[case] policy: OverlapPolicy, #[case] expected: f64) {
        assert_eq!(policy.score(&gold(0, 2, "X"), &pred(1, 4, "X")), expected);
    }

    #[test]
    fn test_types_never_match_each_other() {
        let matcher = SpanMatcher::new(0.5).unwrap();
        let counts = matcher.count(&[gold(0, 1, "PER")], &[pred(0, 1, "LOC")]);
        assert_eq!(counts.get("PER"), Some(Counts::new(0, 0, 1)));
        assert_eq!(counts.get("LOC"), Some(Counts::new(0, 1, 0)));
    }

    #[test]
    fn test_greedy_prefers_highest_overlap() {
        // One long prediction overlaps two gold spans; the better overlap wins
        // and the other gold span stays unmatched.
        let matcher = SpanMatcher::new(0.3).unwrap();
        let gold_spans = [gold(0, 1, "X"), gold(2, 4, "X")];
        let pred_spans = [pred(0, 4, "X")];
        let pairs = matcher.align(&gold_spans, &pred_spans);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].gold, gold_spans[1]);
        assert_eq!(pairs[0].overlap, 0.6);
        assert_eq!(
            matcher.count(&gold_spans, &pred_spans).get("X"),
            Some(Counts::new(1, 0, 1))
        );
    }

    #[test]
    fn test_ties_break_on_gold_start() {
        let matcher = SpanMatcher::new(0.5).unwrap();
        let gold_spans = [gold(2, 3, "X"), gold(0, 1, "X")];
        let pred_spans = [pred(1, 2, "X")];
        let pairs = matcher.align(&gold_spans, &pred_spans);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].gold.start, 0);
    }

    #[test]
    fn test_each_span_used_once() {
        let matcher = SpanMatcher::new(0.5).unwrap();
        let gold_spans = [gold(0, 1, "X")];
        let pred_spans = [pred(0, 1, "X"), pred(0, 1, "X")];
        assert_eq!(
            matcher.count(&gold_spans, &pred_spans).get("X"),
            Some(Counts::new(1, 1, 0))
        );
    }

    #[test]
    fn test_empty_inputs() {
        let matcher = SpanMatcher::new(1.0).unwrap();
        assert!(matcher.count(&[], &[]).is_empty());
        assert!(matcher.align(&[], &[pred(0, 0, "X")]).is_empty());
    }
}
