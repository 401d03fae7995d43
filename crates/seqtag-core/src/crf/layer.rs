//! # Linear-Chain CRF Layer
//!
//! Turns per-token emission scores into a globally consistent tag sequence
//! (Viterbi) and provides the negative log-likelihood training loss (forward
//! algorithm). All accumulation happens in log-space.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SeqtagError};
use crate::tags::TagId;

/// Learned CRF parameters: a K×K transition matrix plus start and end scores.
///
/// `transitions[i][j]` scores moving from tag `i` to tag `j`. Deserializing
/// re-runs the same shape, score and pad checks as [`CrfLayer::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCrfLayer")]
pub struct CrfLayer {
    num_tags: usize,
    transitions: Vec<Vec<f64>>,
    start: Vec<f64>,
    end: Vec<f64>,
    pad: Option<TagId>,
}

#[derive(Deserialize)]
struct RawCrfLayer {
    num_tags: usize,
    transitions: Vec<Vec<f64>>,
    start: Vec<f64>,
    end: Vec<f64>,
    pad: Option<TagId>,
}

impl TryFrom<RawCrfLayer> for CrfLayer {
    type Error = SeqtagError;

    fn try_from(raw: RawCrfLayer) -> Result<Self> {
        let layer = CrfLayer::new(raw.transitions, raw.start, raw.end)?;
        if layer.num_tags != raw.num_tags {
            return Err(SeqtagError::TransitionShape {
                expected: raw.num_tags,
                actual: layer.num_tags,
            });
        }
        match raw.pad {
            Some(pad) => layer.with_pad(pad),
            None => Ok(layer),
        }
    }
}

/// Result of Viterbi decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// Best tag per token.
    pub tags: Vec<TagId>,
    /// Score of the best path, start and end scores included.
    pub score: f64,
}

/// Mutable views over the parameters. Shapes cannot change through it.
pub struct CrfParamsMut<'a> {
    /// K×K transition scores, `[from][to]`.
    pub transitions: &'a mut [Vec<f64>],
    /// Score of starting a sequence in each tag.
    pub start: &'a mut [f64],
    /// Score of ending a sequence in each tag.
    pub end: &'a mut [f64],
}

impl CrfLayer {
    /// Create a layer from explicit parameters.
    ///
    /// # Errors
    /// Returns a configuration error if the transition matrix is not K×K,
    /// if start/end do not have length K, or if any score is NaN or `+inf`.
    /// `-inf` is accepted and forbids the corresponding transition.
    pub fn new(transitions: Vec<Vec<f64>>, start: Vec<f64>, end: Vec<f64>) -> Result<Self> {
        let num_tags = transitions.len();
        if num_tags == 0 {
            return Err(SeqtagError::NoTags);
        }
        for (i, row) in transitions.iter().enumerate() {
            if row.len() != num_tags {
                return Err(SeqtagError::TransitionShape {
                    expected: num_tags,
                    actual: row.len(),
                });
            }
            for (j, &value) in row.iter().enumerate() {
                check_score(value, || format!("transitions[{i}][{j}]"))?;
            }
        }
        for (which, scores) in [("start", &start), ("end", &end)] {
            if scores.len() != num_tags {
                return Err(SeqtagError::BoundaryLength {
                    which,
                    expected: num_tags,
                    actual: scores.len(),
                });
            }
            for (j, &value) in scores.iter().enumerate() {
                check_score(value, || format!("{which}[{j}]"))?;
            }
        }

        Ok(Self {
            num_tags,
            transitions,
            start,
            end,
            pad: None,
        })
    }

    /// Create a layer with every score set to zero.
    pub fn zeros(num_tags: usize) -> Result<Self> {
        Self::new(
            vec![vec![0.0; num_tags]; num_tags],
            vec![0.0; num_tags],
            vec![0.0; num_tags],
        )
    }

    /// Reserve `pad` as the padding tag.
    ///
    /// The pad tag is never decoded, and gold sequences are cut at their
    /// first pad tag before the loss is computed.
    pub fn with_pad(mut self, pad: TagId) -> Result<Self> {
        if pad >= self.num_tags {
            return Err(SeqtagError::UnknownTagId {
                id: pad,
                size: self.num_tags,
            });
        }
        self.pad = Some(pad);
        Ok(self)
    }

    /// Number of tags K.
    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    /// K×K transition scores; `transitions()[i][j]` scores tag `i` followed by `j`.
    pub fn transitions(&self) -> &[Vec<f64>] {
        &self.transitions
    }

    /// Score added when a sequence starts in each tag.
    pub fn start(&self) -> &[f64] {
        &self.start
    }

    /// Score added when a sequence ends in each tag.
    pub fn end(&self) -> &[f64] {
        &self.end
    }

    /// The masked padding tag, if any.
    pub fn pad(&self) -> Option<TagId> {
        self.pad
    }

    /// Borrow the parameters for an in-place gradient update.
    pub fn params_mut(&mut self) -> CrfParamsMut<'_> {
        CrfParamsMut {
            transitions: &mut self.transitions,
            start: &mut self.start,
            end: &mut self.end,
        }
    }

    /// Check that every emission row has K finite (or `-inf`) scores.
    pub fn validate_emissions(&self, emissions: &[Vec<f64>]) -> Result<()> {
        validate_emissions(emissions, self.num_tags)
    }

    /// Emission score with the pad column masked out.
    #[inline]
    pub(crate) fn emission(&self, row: &[f64], tag: TagId) -> f64 {
        if self.pad == Some(tag) {
            f64::NEG_INFINITY
        } else {
            row[tag]
        }
    }

    /// Number of leading gold positions before the first pad tag.
    pub(crate) fn effective_len(&self, gold: &[TagId]) -> usize {
        match self.pad {
            Some(pad) => gold.iter().position(|&tag| tag == pad).unwrap_or(gold.len()),
            None => gold.len(),
        }
    }

    /// Score of one tag path: emissions at the path's tags, transitions
    /// between consecutive tags, plus start and end scores.
    pub fn path_score(&self, emissions: &[Vec<f64>], tags: &[TagId]) -> Result<f64> {
        self.validate_emissions(emissions)?;
        self.check_tags(emissions, tags)?;
        Ok(self.path_score_unchecked(emissions, tags))
    }

    pub(crate) fn path_score_unchecked(&self, emissions: &[Vec<f64>], tags: &[TagId]) -> f64 {
        let (Some(&first), Some(&last)) = (tags.first(), tags.last()) else {
            return 0.0;
        };

        let mut score = self.start[first] + self.emission(&emissions[0], first);
        for t in 1..tags.len() {
            score += self.transitions[tags[t - 1]][tags[t]] + self.emission(&emissions[t], tags[t]);
        }
        score + self.end[last]
    }

    /// Log-partition function over all tag paths (forward algorithm).
    ///
    /// # Errors
    /// [`SeqtagError::NoViablePath`] if every path scores `-inf`.
    pub fn log_partition(&self, emissions: &[Vec<f64>]) -> Result<f64> {
        self.validate_emissions(emissions)?;
        if emissions.is_empty() {
            return Ok(0.0);
        }
        let alphas = self.forward(emissions);
        self.finish_partition(&alphas[alphas.len() - 1])
    }

    /// Forward log-scores `alpha[t][j]` for every position.
    pub(crate) fn forward(&self, emissions: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let k = self.num_tags;
        let mut alphas = Vec::with_capacity(emissions.len());
        alphas.push(
            (0..k)
                .map(|j| self.start[j] + self.emission(&emissions[0], j))
                .collect::<Vec<_>>(),
        );

        let mut scratch = vec![0.0; k];
        for row in &emissions[1..] {
            let prev = &alphas[alphas.len() - 1];
            let next = (0..k)
                .map(|j| {
                    for i in 0..k {
                        scratch[i] = prev[i] + self.transitions[i][j];
                    }
                    log_sum_exp(&scratch) + self.emission(row, j)
                })
                .collect::<Vec<_>>();
            alphas.push(next);
        }
        alphas
    }

    pub(crate) fn finish_partition(&self, last_alpha: &[f64]) -> Result<f64> {
        let finals: Vec<f64> = last_alpha
            .iter()
            .zip(&self.end)
            .map(|(alpha, end)| alpha + end)
            .collect();
        let log_z = log_sum_exp(&finals);
        if log_z == f64::NEG_INFINITY {
            return Err(SeqtagError::NoViablePath(
                "every tag path scores -inf".to_string(),
            ));
        }
        Ok(log_z)
    }

    /// Negative log-likelihood of the gold path: `log Z - score(gold)`.
    ///
    /// Always `>= 0`. An empty sequence has zero loss.
    pub fn loss(&self, emissions: &[Vec<f64>], gold: &[TagId]) -> Result<f64> {
        self.validate_emissions(emissions)?;
        self.check_tags(emissions, gold)?;

        let len = self.effective_len(gold);
        if len == 0 {
            return Ok(0.0);
        }
        let (emissions, gold) = (&emissions[..len], &gold[..len]);

        let gold_score = self.path_score_unchecked(emissions, gold);
        if gold_score == f64::NEG_INFINITY {
            return Err(SeqtagError::NoViablePath(
                "gold path scores -inf".to_string(),
            ));
        }
        let alphas = self.forward(emissions);
        let log_z = self.finish_partition(&alphas[len - 1])?;

        Ok((log_z - gold_score).max(0.0))
    }

    /// Highest-scoring tag sequence (Viterbi).
    ///
    /// Ties between predecessors or final tags resolve to the lowest tag id.
    pub fn decode(&self, emissions: &[Vec<f64>]) -> Result<Decoded> {
        self.validate_emissions(emissions)?;
        let seq_len = emissions.len();
        if seq_len == 0 {
            return Ok(Decoded {
                tags: Vec::new(),
                score: 0.0,
            });
        }

        let k = self.num_tags;
        let mut score: Vec<f64> = (0..k)
            .map(|j| self.start[j] + self.emission(&emissions[0], j))
            .collect();
        // backptr[t - 1][j] = best predecessor of tag j at position t
        let mut backptr: Vec<Vec<TagId>> = Vec::with_capacity(seq_len - 1);

        for row in &emissions[1..] {
            let mut next = vec![f64::NEG_INFINITY; k];
            let mut pointers = vec![0; k];

            for curr in 0..k {
                let (best_prev, best_score) =
                    argmax((0..k).map(|prev| score[prev] + self.transitions[prev][curr]));
                next[curr] = best_score + self.emission(row, curr);
                pointers[curr] = best_prev;
            }

            score = next;
            backptr.push(pointers);
        }

        let (mut best_tag, best_score) =
            argmax(score.iter().zip(&self.end).map(|(score, end)| score + end));
        if best_score == f64::NEG_INFINITY {
            return Err(SeqtagError::NoViablePath(
                "every tag path scores -inf".to_string(),
            ));
        }

        let mut tags = vec![0; seq_len];
        tags[seq_len - 1] = best_tag;
        for (pos, pointers) in backptr.iter().enumerate().rev() {
            best_tag = pointers[best_tag];
            tags[pos] = best_tag;
        }

        debug!(tokens = seq_len, tags = k, score = best_score, "viterbi decode");
        Ok(Decoded {
            tags,
            score: best_score,
        })
    }

    fn check_tags(&self, emissions: &[Vec<f64>], tags: &[TagId]) -> Result<()> {
        if tags.len() != emissions.len() {
            return Err(SeqtagError::SequenceLength {
                expected: emissions.len(),
                actual: tags.len(),
            });
        }
        match tags.iter().find(|&&tag| tag >= self.num_tags) {
            Some(&id) => Err(SeqtagError::UnknownTagId {
                id,
                size: self.num_tags,
            }),
            None => Ok(()),
        }
    }
}

/// Check that every row has `num_tags` scores and none is NaN or `+inf`.
pub(crate) fn validate_emissions(emissions: &[Vec<f64>], num_tags: usize) -> Result<()> {
    for (row_idx, row) in emissions.iter().enumerate() {
        if row.len() != num_tags {
            return Err(SeqtagError::EmissionWidth {
                row: row_idx,
                expected: num_tags,
                actual: row.len(),
            });
        }
        for (j, &value) in row.iter().enumerate() {
            check_score(value, || format!("emissions[{row_idx}][{j}]"))?;
        }
    }
    Ok(())
}

fn check_score(value: f64, location: impl FnOnce() -> String) -> Result<()> {
    if value.is_nan() || value == f64::INFINITY {
        return Err(SeqtagError::NonFiniteScore {
            location: location(),
            value,
        });
    }
    Ok(())
}

/// `log Σ exp(x_i)`, shifted by the maximum so large magnitudes cannot overflow.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Index and value of the maximum; the first index wins on exact ties.
pub(crate) fn argmax(values: impl Iterator<Item = f64>) -> (usize, f64) {
    let mut best = (0, f64::NEG_INFINITY);
    for (idx, value) in values.enumerate() {
        if idx == 0 || value > best.1 {
            best = (idx, value);
        }
    }
    best
}
