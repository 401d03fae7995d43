//! Linear-chain CRF: loss, Viterbi decoding, analytic gradients and a
//! candle-backed variant for autodiff.

pub mod gradient;
pub mod layer;
pub mod tensor;

pub use gradient::{CrfGradients, Marginals};
pub use layer::{CrfLayer, CrfParamsMut, Decoded, log_sum_exp};
pub use tensor::TensorCrf;

use crate::error::Result;
use crate::tags::TagId;

/// Negative log-likelihood of `gold` under the given CRF parameters.
pub fn crf_loss(
    emissions: &[Vec<f64>],
    gold: &[TagId],
    transitions: &[Vec<f64>],
    start: &[f64],
    end: &[f64],
) -> Result<f64> {
    CrfLayer::new(transitions.to_vec(), start.to_vec(), end.to_vec())?.loss(emissions, gold)
}

/// Best tag sequence under the given CRF parameters.
pub fn crf_decode(
    emissions: &[Vec<f64>],
    transitions: &[Vec<f64>],
    start: &[f64],
    end: &[f64],
) -> Result<Vec<TagId>> {
    let layer = CrfLayer::new(transitions.to_vec(), start.to_vec(), end.to_vec())?;
    Ok(layer.decode(emissions)?.tags)
}
