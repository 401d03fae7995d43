//! # Forward-Backward Gradients
//!
//! Analytic gradient of the CRF loss for callers that train without an
//! autodiff backend. The gradient of `log Z - score(gold)` is the expected
//! feature count under the model minus the observed count on the gold path.

use serde::{Deserialize, Serialize};

use crate::crf::layer::{CrfLayer, log_sum_exp};
use crate::error::{Result, SeqtagError};
use crate::tags::TagId;

/// Posterior marginals of a CRF over one sentence.
#[derive(Debug, Clone, PartialEq)]
pub struct Marginals {
    /// `log Z`.
    pub log_partition: f64,
    /// `nodes[t][j] = P(y_t = j)`.
    pub nodes: Vec<Vec<f64>>,
    /// `edges[i][j] = Σ_t P(y_{t-1} = i, y_t = j)`.
    pub edges: Vec<Vec<f64>>,
}

/// Gradient of the loss with respect to every input of the CRF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrfGradients {
    /// N×K, one row per token. Zero from the first gold pad onwards.
    pub emissions: Vec<Vec<f64>>,
    /// K×K, same layout as [`CrfLayer::transitions`].
    pub transitions: Vec<Vec<f64>>,
    /// Length K.
    pub start: Vec<f64>,
    /// Length K.
    pub end: Vec<f64>,
}

impl CrfGradients {
    /// All-zero gradients for N tokens and K tags.
    pub fn zeros(seq_len: usize, num_tags: usize) -> Self {
        Self {
            emissions: vec![vec![0.0; num_tags]; seq_len],
            transitions: vec![vec![0.0; num_tags]; num_tags],
            start: vec![0.0; num_tags],
            end: vec![0.0; num_tags],
        }
    }

    /// Add another sentence's parameter gradients. Emission gradients are
    /// per-sentence and are left untouched.
    pub fn accumulate(&mut self, other: &CrfGradients) {
        for (row, other_row) in self.transitions.iter_mut().zip(&other.transitions) {
            for (g, o) in row.iter_mut().zip(other_row) {
                *g += o;
            }
        }
        for (g, o) in self.start.iter_mut().zip(&other.start) {
            *g += o;
        }
        for (g, o) in self.end.iter_mut().zip(&other.end) {
            *g += o;
        }
    }

    /// Multiply the parameter gradients by `factor`.
    pub fn scale(&mut self, factor: f64) {
        self.transitions
            .iter_mut()
            .flatten()
            .chain(self.start.iter_mut())
            .chain(self.end.iter_mut())
            .for_each(|g| *g *= factor);
    }

    /// L2 norm over transitions, start and end.
    pub fn param_norm(&self) -> f64 {
        self.transitions
            .iter()
            .flatten()
            .chain(&self.start)
            .chain(&self.end)
            .map(|g| g * g)
            .sum::<f64>()
            .sqrt()
    }
}

impl CrfLayer {
    /// Backward log-scores `beta[t][i]`: log-sum of every path suffix that
    /// continues from tag `i` at position `t`, end score included.
    fn backward(&self, emissions: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let k = self.num_tags();
        let seq_len = emissions.len();
        let mut betas = vec![vec![0.0; k]; seq_len];
        betas[seq_len - 1] = self.end().to_vec();

        let mut scratch = vec![0.0; k];
        for t in (0..seq_len - 1).rev() {
            for i in 0..k {
                for j in 0..k {
                    scratch[j] = self.transitions()[i][j]
                        + self.emission(&emissions[t + 1], j)
                        + betas[t + 1][j];
                }
                betas[t][i] = log_sum_exp(&scratch);
            }
        }
        betas
    }

    /// Node and edge posterior marginals via forward-backward.
    pub fn marginals(&self, emissions: &[Vec<f64>]) -> Result<Marginals> {
        self.validate_emissions(emissions)?;
        let k = self.num_tags();
        if emissions.is_empty() {
            return Ok(Marginals {
                log_partition: 0.0,
                nodes: Vec::new(),
                edges: vec![vec![0.0; k]; k],
            });
        }

        let alphas = self.forward(emissions);
        let betas = self.backward(emissions);
        let log_z = self.finish_partition(&alphas[alphas.len() - 1])?;

        let nodes = alphas
            .iter()
            .zip(&betas)
            .map(|(alpha, beta)| {
                alpha
                    .iter()
                    .zip(beta)
                    .map(|(a, b)| (a + b - log_z).exp())
                    .collect()
            })
            .collect();

        let mut edges = vec![vec![0.0; k]; k];
        for t in 1..emissions.len() {
            for (i, row) in edges.iter_mut().enumerate() {
                for (j, edge) in row.iter_mut().enumerate() {
                    let log_p = alphas[t - 1][i]
                        + self.transitions()[i][j]
                        + self.emission(&emissions[t], j)
                        + betas[t][j]
                        - log_z;
                    *edge += log_p.exp();
                }
            }
        }

        Ok(Marginals {
            log_partition: log_z,
            nodes,
            edges,
        })
    }

    /// Loss and its gradient with respect to emissions, transitions, start
    /// and end. Positions from the first gold pad tag onwards get zero
    /// emission gradient.
    pub fn loss_and_gradients(
        &self,
        emissions: &[Vec<f64>],
        gold: &[TagId],
    ) -> Result<(f64, CrfGradients)> {
        let loss = self.loss(emissions, gold)?;
        let mut grads = CrfGradients::zeros(emissions.len(), self.num_tags());

        let len = self.effective_len(gold);
        if len == 0 {
            return Ok((loss, grads));
        }
        let (emissions, gold) = (&emissions[..len], &gold[..len]);
        let marginals = self.marginals(emissions)?;
        if !marginals.log_partition.is_finite() {
            return Err(SeqtagError::NoViablePath(
                "log partition is not finite".to_string(),
            ));
        }

        for (t, node) in marginals.nodes.iter().enumerate() {
            grads.emissions[t].copy_from_slice(node);
            grads.emissions[t][gold[t]] -= 1.0;
        }
        grads.transitions = marginals.edges;
        for pair in gold.windows(2) {
            grads.transitions[pair[0]][pair[1]] -= 1.0;
        }
        grads.start.copy_from_slice(&marginals.nodes[0]);
        grads.start[gold[0]] -= 1.0;
        grads.end.copy_from_slice(&marginals.nodes[len - 1]);
        grads.end[gold[len - 1]] -= 1.0;

        Ok((loss, grads))
    }
}
