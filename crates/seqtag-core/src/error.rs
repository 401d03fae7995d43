use thiserror::Error;

use crate::tags::TagId;

/// Errors that can occur while decoding or scoring tag sequences.
#[derive(Debug, Error)]
pub enum SeqtagError {
    /// An emission row does not have one score per tag.
    #[error("emission row {row} has {actual} scores, expected {expected}")]
    EmissionWidth {
        /// Offending row (token position).
        row: usize,
        /// Number of tags the layer was built for.
        expected: usize,
        /// Number of scores found in the row.
        actual: usize,
    },

    /// The gold sequence length differs from the number of emission rows.
    #[error("gold sequence has {actual} tags but the emission matrix has {expected} rows")]
    SequenceLength {
        /// Number of emission rows.
        expected: usize,
        /// Number of gold tags.
        actual: usize,
    },

    /// The transition matrix is not square of size K.
    #[error("transition matrix must be {expected}x{expected}, got a row of length {actual}")]
    TransitionShape {
        /// Expected side length.
        expected: usize,
        /// Offending row length (or row count).
        actual: usize,
    },

    /// A start or end score vector does not have length K.
    #[error("{which} score vector has length {actual}, expected {expected}")]
    BoundaryLength {
        /// `"start"` or `"end"`.
        which: &'static str,
        /// Number of tags.
        expected: usize,
        /// Length found.
        actual: usize,
    },

    /// A CRF layer needs at least one tag.
    #[error("a CRF layer needs at least one tag")]
    NoTags,

    /// A score is NaN or positive infinity.
    #[error("non-finite score {value} in {location}")]
    NonFiniteScore {
        /// Where the score was found.
        location: String,
        /// The offending value.
        value: f64,
    },

    /// Every path through the lattice scores negative infinity.
    #[error("no viable path: {0}")]
    NoViablePath(String),

    /// The overlap ratio is outside `(0, 1]`.
    #[error("overlap ratio must be in (0, 1], got {0}")]
    InvalidOverlapRatio(f64),

    /// Gold and predicted corpora do not contain the same number of sentences.
    #[error("gold corpus has {gold} sentences but the predicted corpus has {predicted}")]
    CorpusSize {
        /// Number of gold sentences.
        gold: usize,
        /// Number of predicted sentences.
        predicted: usize,
    },

    /// A gold and a predicted sentence differ in length.
    #[error("sentence {sentence}: gold has {gold} tags but prediction has {predicted}")]
    SentenceLength {
        /// Sentence index in the corpus.
        sentence: usize,
        /// Gold length.
        gold: usize,
        /// Predicted length.
        predicted: usize,
    },

    /// A tag id is outside `[0, K)`.
    #[error("unknown tag id {id} (vocabulary has {size} tags)")]
    UnknownTagId {
        /// The offending id.
        id: TagId,
        /// Vocabulary size.
        size: usize,
    },

    /// A tag label is not in the vocabulary.
    #[error("unknown tag label {0:?}")]
    UnknownTagLabel(String),

    /// A stored vocabulary is internally inconsistent.
    #[error("invalid tag vocabulary: {0}")]
    InvalidVocabulary(String),

    /// A tagger architecture name was not recognised.
    #[error("unknown tagger kind {0:?}, expected BiRNN, BiRNNCNN or BiRNNCNNCRF")]
    UnknownTaggerKind(String),

    /// The tensor backend failed.
    #[error("tensor backend error: {0}")]
    Tensor(String),
}

impl From<candle_core::Error> for SeqtagError {
    fn from(err: candle_core::Error) -> Self {
        SeqtagError::Tensor(err.to_string())
    }
}

/// Result type alias for seqtag operations.
pub type Result<T> = std::result::Result<T, SeqtagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = SeqtagError::InvalidOverlapRatio(1.5);
        assert_eq!(err.to_string(), "overlap ratio must be in (0, 1], got 1.5");

        let err = SeqtagError::SequenceLength {
            expected: 4,
            actual: 3,
        };
        assert!(err.to_string().contains("3 tags"));

        let err = SeqtagError::UnknownTagLabel("B-FOO".into());
        assert!(err.to_string().contains("B-FOO"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SeqtagError>();
    }
}
