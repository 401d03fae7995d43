//! # Tag Vocabulary
//!
//! Bidirectional mapping between tag strings and dense integer ids.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SeqtagError};
use crate::tags::TagId;
use crate::tags::label::TagLabel;

/// Conventional padding label.
pub const DEFAULT_PAD: &str = "<pad>";

/// Dense, contiguous tag ids with an optional reserved pad id.
///
/// Ids are assigned in first-seen order, so building from the same corpus
/// always yields the same vocabulary. When a pad label is configured it gets
/// id 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTagVocabulary")]
pub struct TagVocabulary {
    labels: Vec<TagLabel>,
    index: HashMap<String, TagId>,
    pad: Option<TagId>,
}

/// Serialized form, checked before it becomes a [`TagVocabulary`].
#[derive(Deserialize)]
struct RawTagVocabulary {
    labels: Vec<TagLabel>,
    index: HashMap<String, TagId>,
    pad: Option<TagId>,
}

impl TryFrom<RawTagVocabulary> for TagVocabulary {
    type Error = SeqtagError;

    fn try_from(raw: RawTagVocabulary) -> Result<Self> {
        let invalid = |msg: String| -> Result<Self> { Err(SeqtagError::InvalidVocabulary(msg)) };

        if raw.index.len() != raw.labels.len() {
            return invalid(format!(
                "{} index entries for {} labels",
                raw.index.len(),
                raw.labels.len()
            ));
        }
        for (id, label) in raw.labels.iter().enumerate() {
            if raw.index.get(label.as_str()) != Some(&id) {
                return invalid(format!("label {:?} is not indexed as id {id}", label.as_str()));
            }
            let expected_pad = raw.pad == Some(id);
            if label.is_pad() != expected_pad {
                return invalid(format!("label {:?} disagrees with pad id {:?}", label.as_str(), raw.pad));
            }
            if !label.is_pad() && *label != TagLabel::parse(label.as_str()) {
                return invalid(format!("label {:?} has a mismatched prefix or type", label.as_str()));
            }
        }
        if let Some(pad) = raw.pad.filter(|&pad| pad >= raw.labels.len()) {
            return Err(SeqtagError::UnknownTagId {
                id: pad,
                size: raw.labels.len(),
            });
        }

        Ok(Self {
            labels: raw.labels,
            index: raw.index,
            pad: raw.pad,
        })
    }
}

impl TagVocabulary {
    /// Create an empty vocabulary without a pad label.
    pub fn new() -> Self {
        Self {
            labels: Vec::new(),
            index: HashMap::new(),
            pad: None,
        }
    }

    /// Create a vocabulary whose id 0 is reserved for `pad`.
    pub fn with_pad(pad: &str) -> Self {
        let mut vocab = Self::new();
        vocab.index.insert(pad.to_string(), 0);
        vocab.labels.push(TagLabel::pad(pad));
        vocab.pad = Some(0);
        vocab
    }

    /// Build a vocabulary from tag-string sequences.
    pub fn from_sequences<I, S, T>(sequences: I, pad: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let mut vocab = match pad {
            Some(pad) => Self::with_pad(pad),
            None => Self::new(),
        };
        for sequence in sequences {
            for tag in sequence {
                vocab.add(tag.as_ref());
            }
        }
        vocab
    }

    /// Insert a label if it is new and return its id.
    pub fn add(&mut self, label: &str) -> TagId {
        if let Some(&id) = self.index.get(label) {
            return id;
        }
        let id = self.labels.len();
        self.labels.push(TagLabel::parse(label));
        self.index.insert(label.to_string(), id);
        id
    }

    /// Look up the id of a label.
    pub fn id(&self, label: &str) -> Option<TagId> {
        self.index.get(label).copied()
    }

    /// Look up the label of an id.
    pub fn label(&self, id: TagId) -> Result<&TagLabel> {
        self.labels.get(id).ok_or(SeqtagError::UnknownTagId {
            id,
            size: self.labels.len(),
        })
    }

    /// Convert labels to ids.
    pub fn encode<S: AsRef<str>>(&self, labels: &[S]) -> Result<Vec<TagId>> {
        labels
            .iter()
            .map(|label| {
                self.id(label.as_ref())
                    .ok_or_else(|| SeqtagError::UnknownTagLabel(label.as_ref().to_string()))
            })
            .collect()
    }

    /// Convert ids back to labels.
    pub fn decode(&self, ids: &[TagId]) -> Result<Vec<&str>> {
        ids.iter()
            .map(|&id| self.label(id).map(TagLabel::as_str))
            .collect()
    }

    /// Number of tags, pad included.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Check if the vocabulary has no tags at all.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// The reserved pad id, if any.
    pub fn pad_id(&self) -> Option<TagId> {
        self.pad
    }

    /// Check if `id` is the pad id.
    pub fn is_pad(&self, id: TagId) -> bool {
        self.pad == Some(id)
    }

    /// All labels in id order.
    pub fn labels(&self) -> &[TagLabel] {
        &self.labels
    }

    /// Sorted, deduplicated semantic types (`PER`, `ORG`, ...).
    pub fn types(&self) -> Vec<&str> {
        self.labels
            .iter()
            .filter_map(TagLabel::kind)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl Default for TagVocabulary {
    fn default() -> Self {
        Self::new()
    }
}
