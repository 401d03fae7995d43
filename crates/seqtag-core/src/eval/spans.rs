//! # Span Extraction
//!
//! Converts BIO tag sequences into typed, inclusive token spans.
//!
//! Malformed input is recovered leniently: an `I-X` with no open span of
//! type `X` starts a new span instead of being dropped. Pad tokens close the
//! open span without starting one.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::tags::{Prefix, TagId, TagVocabulary};

/// Which side of the comparison a span came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SpanSource {
    /// Extracted from reference annotations.
    Gold,
    /// Extracted from system output.
    Predicted,
}

/// A typed span with inclusive token bounds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    /// First token index.
    pub start: usize,
    /// Last token index (inclusive).
    pub end: usize,
    /// Semantic type, e.g. `PER` from `B-PER`.
    pub kind: String,
    /// Gold or predicted.
    pub source: SpanSource,
}

impl Span {
    pub fn new(start: usize, end: usize, kind: impl Into<String>, source: SpanSource) -> Self {
        debug_assert!(start <= end);
        Self {
            start,
            end,
            kind: kind.into(),
            source,
        }
    }

    /// Number of tokens covered.
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    /// Number of tokens shared with `other`.
    pub fn intersection(&self, other: &Span) -> usize {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start > end { 0 } else { end - start + 1 }
    }

    /// Number of tokens covered by either span, counting any gap between
    /// them as well.
    pub fn union(&self, other: &Span) -> usize {
        self.len() + other.len() - self.intersection(other)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.kind, self.start, self.end)
    }
}

/// Extract the ordered list of spans from a tag-id sequence.
///
/// # Errors
/// [`crate::SeqtagError::UnknownTagId`] if a tag is outside the vocabulary.
pub fn extract_spans(tags: &[TagId], vocab: &TagVocabulary, source: SpanSource) -> Result<Vec<Span>> {
    let mut spans = Vec::new();
    let mut open: Option<(usize, &str)> = None;

    for (pos, &id) in tags.iter().enumerate() {
        let label = vocab.label(id)?;
        match (label.prefix(), label.kind()) {
            (Prefix::Begin, Some(kind)) => {
                close(&mut spans, open.take(), pos, source);
                open = Some((pos, kind));
            }
            (Prefix::Inside | Prefix::Bare, Some(kind)) => match open {
                Some((_, current)) if current == kind => {}
                _ => {
                    if label.prefix() == Prefix::Inside {
                        debug!(position = pos, label = label.as_str(), "I- tag without open span, starting a new one");
                    }
                    close(&mut spans, open.take(), pos, source);
                    open = Some((pos, kind));
                }
            },
            _ => close(&mut spans, open.take(), pos, source),
        }
    }
    close(&mut spans, open, tags.len(), source);

    Ok(spans)
}

/// Push the open span, which ends just before `next`.
fn close(spans: &mut Vec<Span>, open: Option<(usize, &str)>, next: usize, source: SpanSource) {
    if let Some((start, kind)) = open {
        spans.push(Span::new(start, next - 1, kind, source));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SeqtagError;
    use crate::tags::DEFAULT_PAD;
    use quickcheck::{Arbitrary, Gen, QuickCheck, TestResult};
    use rstest::rstest;

    fn vocab() -> TagVocabulary {
        TagVocabulary::from_sequences(
            [vec!["O", "B-PER", "I-PER", "B-LOC", "I-LOC", "Claim"]],
            Some(DEFAULT_PAD),
        )
    }

    fn spans_of(labels: &[&str]) -> Vec<(usize, usize, String)> {
        let vocab = vocab();
        let ids = vocab.encode(labels).unwrap();
        extract_spans(&ids, &vocab, SpanSource::Gold)
            .unwrap()
            .into_iter()
            .map(|span| (span.start, span.end, span.kind))
            .collect()
    }

    fn owned(spans: &[(usize, usize, &str)]) -> Vec<(usize, usize, String)> {
        spans
            .iter()
            .map(|&(start, end, kind)| (start, end, kind.to_string()))
            .collect()
    }

    #[rstest]
    #[case(&["O", "B-PER", "I-PER", "O"], &[(1, 2, "PER")])]
    #[case(&["O", "I-LOC", "I-LOC", "O"], &[(1, 2, "LOC")])]
    #[case(&["B-PER", "B-PER", "I-PER"], &[(0, 0, "PER"), (1, 2, "PER")])]
    #[case(&["B-PER", "I-LOC", "I-LOC"], &[(0, 0, "PER"), (1, 2, "LOC")])]
    #[case(&["B-LOC", "I-LOC", "I-LOC"], &[(0, 2, "LOC")])]
    #[case(&["O", "O"], &[])]
    #[case(&["B-PER", "<pad>", "I-PER"], &[(0, 0, "PER"), (2, 2, "PER")])]
    #[case(&["Claim", "Claim", "O", "Claim"], &[(0, 1, "Claim"), (3, 3, "Claim")])]
    #[case(&[], &[])]
    fn test_extract(#[case] labels: &[&str], #[case] expected: &[(usize, usize, &str)]) {
        assert_eq!(spans_of(labels), owned(expected));
    }

    #[test]
    fn test_unknown_id_is_fatal() {
        let vocab = vocab();
        assert!(matches!(
            extract_spans(&[1, 42], &vocab, SpanSource::Predicted),
            Err(SeqtagError::UnknownTagId { id: 42, .. })
        ));
    }

    #[test]
    fn test_intersection_and_union() {
        let a = Span::new(1, 4, "X", SpanSource::Gold);
        let b = Span::new(3, 6, "X", SpanSource::Predicted);
        let c = Span::new(6, 7, "X", SpanSource::Predicted);
        assert_eq!(a.len(), 4);
        assert_eq!(a.intersection(&b), 2);
        assert_eq!(a.union(&b), 6);
        assert_eq!(a.intersection(&c), 0);
        assert_eq!(a.to_string(), "(X, 1, 4)");
    }

    /// Well-formed spans laid out left to right with `O` gaps between them.
    #[derive(Debug, Clone)]
    struct Layout(Vec<(usize, usize, &'static str)>);

    impl Arbitrary for Layout {
        fn arbitrary(g: &mut Gen) -> Self {
            let count = usize::arbitrary(g) % 5;
            let mut pos = 0;
            let mut spans = Vec::with_capacity(count);
            for _ in 0..count {
                let gap = usize::arbitrary(g) % 3;
                let len = 1 + usize::arbitrary(g) % 4;
                let kind = *g.choose(&["PER", "LOC"]).unwrap_or(&"PER");
                spans.push((pos + gap, pos + gap + len - 1, kind));
                pos += gap + len;
            }
            Layout(spans)
        }
    }

    impl Layout {
        fn labels(&self) -> Vec<String> {
            let len = self.0.last().map_or(0, |&(_, end, _)| end + 1);
            let mut labels = vec!["O".to_string(); len];
            for &(start, end, kind) in &self.0 {
                labels[start] = format!("B-{kind}");
                for label in &mut labels[start + 1..=end] {
                    *label = format!("I-{kind}");
                }
            }
            labels
        }
    }

    #[test]
    fn test_property_round_trip() {
        fn property(layout: Layout) -> TestResult {
            let labels = layout.labels();
            let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
            TestResult::from_bool(spans_of(&refs) == owned(&layout.0))
        }
        QuickCheck::new()
            .tests(1000)
            .quickcheck(property as fn(Layout) -> TestResult);
    }
}
