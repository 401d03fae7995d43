//! # Tagger Heads
//!
//! The output layer that sits on top of an encoder's emission scores. Every
//! tagger variant exposes the same `loss` / `decode` contract; only the
//! `*Crf` variants decode with a CRF.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crf::layer::{CrfLayer, argmax, log_sum_exp, validate_emissions};
use crate::error::{Result, SeqtagError};
use crate::tags::TagId;

/// Tagger architectures: encoder type × presence of a CRF decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaggerKind {
    /// Bidirectional RNN over word embeddings, softmax output.
    BiRnn,
    /// BiRNN with a character-level CNN, softmax output.
    BiRnnCnn,
    /// BiRNN with a character-level CNN, CRF output.
    BiRnnCnnCrf,
}

impl TaggerKind {
    pub const ALL: [TaggerKind; 3] = [TaggerKind::BiRnn, TaggerKind::BiRnnCnn, TaggerKind::BiRnnCnnCrf];

    pub fn has_crf(&self) -> bool {
        matches!(self, TaggerKind::BiRnnCnnCrf)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaggerKind::BiRnn => "BiRNN",
            TaggerKind::BiRnnCnn => "BiRNNCNN",
            TaggerKind::BiRnnCnnCrf => "BiRNNCNNCRF",
        }
    }
}

impl fmt::Display for TaggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaggerKind {
    type Err = SeqtagError;

    fn from_str(s: &str) -> Result<Self> {
        TaggerKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| SeqtagError::UnknownTaggerKind(s.to_string()))
    }
}

/// Output layer turning emissions into a loss and a tag sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaggerHead {
    /// Independent per-token softmax.
    Softmax {
        /// Number of tags K.
        num_tags: usize,
        /// Tag never predicted and skipped by the loss.
        pad: Option<TagId>,
    },
    /// Linear-chain CRF.
    Crf(CrfLayer),
}

impl TaggerHead {
    /// The head a tagger of `kind` uses, with untrained parameters.
    pub fn for_kind(kind: TaggerKind, num_tags: usize, pad: Option<TagId>) -> Result<Self> {
        if num_tags == 0 {
            return Err(SeqtagError::NoTags);
        }
        if let Some(pad) = pad.filter(|&pad| pad >= num_tags) {
            return Err(SeqtagError::UnknownTagId { id: pad, size: num_tags });
        }
        if !kind.has_crf() {
            return Ok(TaggerHead::Softmax { num_tags, pad });
        }
        let layer = CrfLayer::zeros(num_tags)?;
        Ok(TaggerHead::Crf(match pad {
            Some(pad) => layer.with_pad(pad)?,
            None => layer,
        }))
    }

    pub fn num_tags(&self) -> usize {
        match self {
            TaggerHead::Softmax { num_tags, .. } => *num_tags,
            TaggerHead::Crf(layer) => layer.num_tags(),
        }
    }

    /// Training loss for one sentence.
    ///
    /// The softmax head sums per-token cross-entropy over non-pad gold
    /// positions; the CRF head returns the sequence negative log-likelihood.
    pub fn loss(&self, emissions: &[Vec<f64>], gold: &[TagId]) -> Result<f64> {
        match self {
            TaggerHead::Crf(layer) => layer.loss(emissions, gold),
            TaggerHead::Softmax { num_tags, pad } => {
                validate_emissions(emissions, *num_tags)?;
                check_gold(emissions, gold, *num_tags)?;
                let mut loss = 0.0;
                for (row, &tag) in emissions.iter().zip(gold) {
                    if *pad == Some(tag) {
                        continue;
                    }
                    let masked = masked_row(row, *pad);
                    let log_z = log_sum_exp(&masked);
                    if log_z == f64::NEG_INFINITY || masked[tag] == f64::NEG_INFINITY {
                        return Err(SeqtagError::NoViablePath(format!(
                            "gold tag {tag} has zero probability"
                        )));
                    }
                    loss += log_z - masked[tag];
                }
                Ok(loss)
            }
        }
    }

    /// Best tag sequence. The softmax head picks each token's highest
    /// scoring non-pad tag, lowest id first on ties.
    pub fn decode(&self, emissions: &[Vec<f64>]) -> Result<Vec<TagId>> {
        match self {
            TaggerHead::Crf(layer) => Ok(layer.decode(emissions)?.tags),
            TaggerHead::Softmax { num_tags, pad } => {
                validate_emissions(emissions, *num_tags)?;
                emissions
                    .iter()
                    .enumerate()
                    .map(|(pos, row)| {
                        let (tag, score) = argmax(masked_row(row, *pad).into_iter());
                        if score == f64::NEG_INFINITY {
                            Err(SeqtagError::NoViablePath(format!("token {pos} has no finite score")))
                        } else {
                            Ok(tag)
                        }
                    })
                    .collect()
            }
        }
    }

    pub fn crf(&self) -> Option<&CrfLayer> {
        match self {
            TaggerHead::Crf(layer) => Some(layer),
            TaggerHead::Softmax { .. } => None,
        }
    }
}

fn masked_row(row: &[f64], pad: Option<TagId>) -> Vec<f64> {
    let mut row = row.to_vec();
    if let Some(pad) = pad {
        row[pad] = f64::NEG_INFINITY;
    }
    row
}

fn check_gold(emissions: &[Vec<f64>], gold: &[TagId], num_tags: usize) -> Result<()> {
    if gold.len() != emissions.len() {
        return Err(SeqtagError::SequenceLength {
            expected: emissions.len(),
            actual: gold.len(),
        });
    }
    match gold.iter().find(|&&tag| tag >= num_tags) {
        Some(&id) => Err(SeqtagError::UnknownTagId { id, size: num_tags }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("BiRNN", TaggerKind::BiRnn)]
    #[case("birnncnn", TaggerKind::BiRnnCnn)]
    #[case("BiRNNCNNCRF", TaggerKind::BiRnnCnnCrf)]
    fn test_parse_kind(#[case] raw: &str, #[case] expected: TaggerKind) {
        let kind: TaggerKind = raw.parse().unwrap();
        assert_eq!(kind, expected);
        assert_eq!(kind.has_crf(), expected == TaggerKind::BiRnnCnnCrf);
    }

    #[test]
    fn test_unknown_kind() {
        assert!(matches!(
            "BiLSTM".parse::<TaggerKind>(),
            Err(SeqtagError::UnknownTaggerKind(name)) if name == "BiLSTM"
        ));
    }

    #[test]
    fn test_for_kind_picks_head() {
        let softmax = TaggerHead::for_kind(TaggerKind::BiRnnCnn, 4, Some(0)).unwrap();
        assert!(softmax.crf().is_none());
        let crf = TaggerHead::for_kind(TaggerKind::BiRnnCnnCrf, 4, Some(0)).unwrap();
        assert_eq!(crf.crf().map(CrfLayer::pad), Some(Some(0)));
        assert!(TaggerHead::for_kind(TaggerKind::BiRnn, 2, Some(5)).is_err());
    }

    #[test]
    fn test_softmax_loss_and_decode() {
        let head = TaggerHead::for_kind(TaggerKind::BiRnn, 3, Some(0)).unwrap();
        let emissions = vec![vec![5.0, 0.0, 0.0], vec![5.0, 1.0, 2.0], vec![0.0, 0.0, 0.0]];

        // Pad never wins and ties go to the lowest id.
        assert_eq!(head.decode(&emissions).unwrap(), vec![1, 2, 1]);

        let loss = head.loss(&emissions, &[1, 2, 0]).unwrap();
        let expected = 2f64.ln() + (1.0 + 1f64.exp()).ln() - 1.0;
        assert!((loss - expected).abs() < 1e-12);
    }

    #[test]
    fn test_heads_share_contract() {
        let emissions = vec![vec![0.2, 1.0, 0.1], vec![0.0, 0.3, 2.0]];
        for kind in TaggerKind::ALL {
            let head = TaggerHead::for_kind(kind, 3, None).unwrap();
            assert_eq!(head.num_tags(), 3);
            assert_eq!(head.decode(&emissions).unwrap(), vec![1, 2]);
            assert!(head.loss(&emissions, &[1, 2]).unwrap() >= 0.0);
            assert!(matches!(
                head.loss(&emissions, &[1]),
                Err(SeqtagError::SequenceLength { .. })
            ));
        }
    }
}
