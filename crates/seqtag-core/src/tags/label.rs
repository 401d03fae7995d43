//! # BIO Tag Labels
//!
//! Decomposes tag strings such as `B-PER`, `I-ORG` or `O` into a boundary
//! prefix and a semantic type.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Boundary prefix of a tag label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Prefix {
    /// `B-X`: first token of a span.
    Begin,
    /// `I-X`: continuation of a span.
    Inside,
    /// `O`: outside any span.
    Outside,
    /// A label without a boundary prefix (`Claim`, `PER`).
    Bare,
    /// The reserved padding label.
    Pad,
}

/// A parsed tag label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagLabel {
    raw: String,
    prefix: Prefix,
    kind: Option<String>,
}

impl TagLabel {
    /// Parse a tag string.
    ///
    /// `B-X` and `I-X` need a non-empty type after the dash; anything that is
    /// neither those nor `O` is kept whole as a bare label.
    pub fn parse(raw: &str) -> Self {
        let (prefix, kind) = match raw {
            "O" => (Prefix::Outside, None),
            _ => match raw.split_once('-') {
                Some(("B", kind)) if !kind.is_empty() => (Prefix::Begin, Some(kind.to_string())),
                Some(("I", kind)) if !kind.is_empty() => (Prefix::Inside, Some(kind.to_string())),
                _ => (Prefix::Bare, Some(raw.to_string())),
            },
        };

        Self {
            raw: raw.to_string(),
            prefix,
            kind,
        }
    }

    /// Build the padding label.
    pub fn pad(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            prefix: Prefix::Pad,
            kind: None,
        }
    }

    /// The label as it was written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The boundary prefix.
    pub fn prefix(&self) -> Prefix {
        self.prefix
    }

    /// The semantic type, if the label belongs to a span.
    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    /// Check if this is the padding label.
    pub fn is_pad(&self) -> bool {
        self.prefix == Prefix::Pad
    }
}

impl fmt::Display for TagLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("B-PER", Prefix::Begin, Some("PER"))]
    #[case("I-ORG", Prefix::Inside, Some("ORG"))]
    #[case("O", Prefix::Outside, None)]
    #[case("B-Major-Claim", Prefix::Begin, Some("Major-Claim"))]
    #[case("Claim", Prefix::Bare, Some("Claim"))]
    #[case("B-", Prefix::Bare, Some("B-"))]
    #[case("E-LOC", Prefix::Bare, Some("E-LOC"))]
    fn test_parse(#[case] raw: &str, #[case] prefix: Prefix, #[case] kind: Option<&str>) {
        let label = TagLabel::parse(raw);
        assert_eq!(label.prefix(), prefix);
        assert_eq!(label.kind(), kind);
        assert_eq!(label.to_string(), raw);
    }

    #[test]
    fn test_pad_label() {
        let label = TagLabel::pad("<pad>");
        assert!(label.is_pad());
        assert_eq!(label.kind(), None);
        assert!(!TagLabel::parse("O").is_pad());
    }
}
