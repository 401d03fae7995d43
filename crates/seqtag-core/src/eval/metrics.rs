//! # Score Aggregation
//!
//! True-positive / false-positive / false-negative counts and the precision,
//! recall and F1 derived from them. Counts form a commutative monoid, so
//! per-sentence results can be reduced in any order.

use std::collections::BTreeMap;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// TP/FP/FN counts for one type, or for all types combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    /// Matched gold/predicted pairs.
    pub tp: usize,
    /// Predicted spans left unmatched.
    pub fp: usize,
    /// Gold spans left unmatched.
    #[serde(rename = "fn")]
    pub fn_: usize,
}

impl Counts {
    pub fn new(tp: usize, fp: usize, fn_: usize) -> Self {
        Self { tp, fp, fn_ }
    }

    /// `TP / (TP + FP)`, or 0 when nothing was predicted.
    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    /// `TP / (TP + FN)`, or 0 when there is nothing to find.
    pub fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    /// Harmonic mean of precision and recall, or 0 when both are 0.
    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) }
    }

    /// Number of gold spans.
    pub fn support(&self) -> usize {
        self.tp + self.fn_
    }

    pub fn scores(&self) -> Scores {
        Scores {
            precision: self.precision(),
            recall: self.recall(),
            f1: self.f1(),
            support: self.support(),
        }
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl Add for Counts {
    type Output = Counts;

    fn add(self, rhs: Counts) -> Counts {
        Counts {
            tp: self.tp + rhs.tp,
            fp: self.fp + rhs.fp,
            fn_: self.fn_ + rhs.fn_,
        }
    }
}

impl AddAssign for Counts {
    fn add_assign(&mut self, rhs: Counts) {
        *self = *self + rhs;
    }
}

impl Sum for Counts {
    fn sum<I: Iterator<Item = Counts>>(iter: I) -> Counts {
        iter.fold(Counts::default(), Add::add)
    }
}

/// Precision, recall and F1 in `[0, 1]`, plus the gold support.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Counts keyed by span type, in sorted type order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCounts(BTreeMap<String, Counts>);

impl TypeCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `counts` to the entry for `kind`.
    pub fn record(&mut self, kind: &str, counts: Counts) {
        match self.0.get_mut(kind) {
            Some(entry) => *entry += counts,
            None => {
                self.0.insert(kind.to_string(), counts);
            }
        }
    }

    /// Fold another map into this one.
    pub fn merge(&mut self, other: TypeCounts) {
        for (kind, counts) in other.0 {
            *self.0.entry(kind).or_default() += counts;
        }
    }

    pub fn get(&self, kind: &str) -> Option<Counts> {
        self.0.get(kind).copied()
    }

    /// Counts summed over every type.
    pub fn total(&self) -> Counts {
        self.0.values().copied().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Counts)> {
        self.0.iter().map(|(kind, &counts)| (kind.as_str(), counts))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Add for TypeCounts {
    type Output = TypeCounts;

    fn add(mut self, rhs: TypeCounts) -> TypeCounts {
        self.merge(rhs);
        self
    }
}

impl Sum for TypeCounts {
    fn sum<I: Iterator<Item = TypeCounts>>(iter: I) -> TypeCounts {
        iter.fold(TypeCounts::new(), Add::add)
    }
}

/// Scores for a whole corpus at one overlap ratio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusScores {
    pub overlap_ratio: f64,
    pub per_type: BTreeMap<String, Scores>,
    /// Counts summed across types before dividing.
    pub micro: Scores,
    /// Unweighted mean of the per-type scores.
    pub macro_avg: Scores,
}

/// Running corpus accumulator: span counts per type and token agreement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreAggregator {
    counts: TypeCounts,
    tokens_correct: usize,
    tokens_total: usize,
}

impl ScoreAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_counts(&mut self, counts: TypeCounts) {
        self.counts.merge(counts);
    }

    /// Record `correct` matching tokens out of `total` scored ones.
    pub fn add_tokens(&mut self, correct: usize, total: usize) {
        debug_assert!(correct <= total);
        self.tokens_correct += correct;
        self.tokens_total += total;
    }

    /// Combine with another accumulator, e.g. one filled by another worker.
    pub fn merge(&mut self, other: ScoreAggregator) {
        self.counts.merge(other.counts);
        self.tokens_correct += other.tokens_correct;
        self.tokens_total += other.tokens_total;
    }

    pub fn counts(&self) -> &TypeCounts {
        &self.counts
    }

    pub fn micro(&self) -> Scores {
        self.counts.total().scores()
    }

    pub fn macro_avg(&self) -> Scores {
        if self.counts.is_empty() {
            return Scores::default();
        }
        let n = self.counts.len() as f64;
        let (mut precision, mut recall, mut f1, mut support) = (0.0, 0.0, 0.0, 0);
        for (_, counts) in self.counts.iter() {
            precision += counts.precision();
            recall += counts.recall();
            f1 += counts.f1();
            support += counts.support();
        }
        Scores {
            precision: precision / n,
            recall: recall / n,
            f1: f1 / n,
            support,
        }
    }

    /// Fraction of scored tokens tagged correctly; 0 if no token was scored.
    pub fn token_accuracy(&self) -> f64 {
        ratio(self.tokens_correct, self.tokens_total)
    }

    pub fn finish(&self, overlap_ratio: f64) -> CorpusScores {
        CorpusScores {
            overlap_ratio,
            per_type: self
                .counts
                .iter()
                .map(|(kind, counts)| (kind.to_string(), counts.scores()))
                .collect(),
            micro: self.micro(),
            macro_avg: self.macro_avg(),
        }
    }
}
