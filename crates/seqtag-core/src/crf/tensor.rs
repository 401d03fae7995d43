//! # Tensor CRF
//!
//! The CRF loss on candle tensors, so gradients can flow back into an
//! encoder through autodiff instead of the hand-written forward-backward.

use candle_core::{DType, Device, IndexOp, Tensor, Var};
use candle_nn::{Optimizer, SGD};

use crate::crf::gradient::CrfGradients;
use crate::crf::layer::{CrfLayer, validate_emissions};
use crate::error::{Result, SeqtagError};
use crate::tags::TagId;

/// CRF whose parameters live in candle `Var`s so the loss can be
/// backpropagated together with an encoder's graph.
pub struct TensorCrf {
    num_tags: usize,
    pad: Option<TagId>,
    transitions: Var,
    start: Var,
    end: Var,
    device: Device,
}

impl TensorCrf {
    /// Copy the parameters of `layer` into trainable tensors on `device`.
    pub fn from_layer(layer: &CrfLayer, device: &Device) -> Result<Self> {
        let k = layer.num_tags();
        let flat: Vec<f64> = layer.transitions().iter().flatten().copied().collect();
        let transitions = Var::from_tensor(&Tensor::from_vec(flat, (k, k), device)?)?;
        let start = Var::from_tensor(&Tensor::new(layer.start(), device)?)?;
        let end = Var::from_tensor(&Tensor::new(layer.end(), device)?)?;

        Ok(Self {
            num_tags: k,
            pad: layer.pad(),
            transitions,
            start,
            end,
            device: device.clone(),
        })
    }

    /// Read the current parameters back into a [`CrfLayer`].
    pub fn to_layer(&self) -> Result<CrfLayer> {
        let layer = CrfLayer::new(
            self.transitions.as_tensor().to_vec2::<f64>()?,
            self.start.as_tensor().to_vec1::<f64>()?,
            self.end.as_tensor().to_vec1::<f64>()?,
        )?;
        match self.pad {
            Some(pad) => layer.with_pad(pad),
            None => Ok(layer),
        }
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The trainable parameters, for handing to an optimizer.
    pub fn vars(&self) -> Vec<Var> {
        vec![self.transitions.clone(), self.start.clone(), self.end.clone()]
    }

    /// Differentiable negative log-likelihood of `gold` given an N×K
    /// emission tensor. Returns a 0-d F64 tensor.
    pub fn loss(&self, emissions: &Tensor, gold: &[TagId]) -> Result<Tensor> {
        let (seq_len, width) = emissions.dims2()?;
        if width != self.num_tags {
            return Err(SeqtagError::EmissionWidth {
                row: 0,
                expected: self.num_tags,
                actual: width,
            });
        }
        if gold.len() != seq_len {
            return Err(SeqtagError::SequenceLength {
                expected: seq_len,
                actual: gold.len(),
            });
        }
        if let Some(&id) = gold.iter().find(|&&tag| tag >= self.num_tags) {
            return Err(SeqtagError::UnknownTagId {
                id,
                size: self.num_tags,
            });
        }

        let len = match self.pad {
            Some(pad) => gold.iter().position(|&tag| tag == pad).unwrap_or(seq_len),
            None => seq_len,
        };
        if len == 0 {
            return Ok(Tensor::zeros((), DType::F64, &self.device)?);
        }

        let emissions = emissions.to_dtype(DType::F64)?.narrow(0, 0, len)?;
        let emissions = match self.pad_mask()? {
            Some(mask) => emissions.broadcast_add(&mask)?,
            None => emissions,
        };

        let log_z = self.log_partition(&emissions)?;
        if log_z.to_scalar::<f64>()? == f64::NEG_INFINITY {
            return Err(SeqtagError::NoViablePath(
                "every tag path scores -inf".to_string(),
            ));
        }
        let gold_score = self.gold_score(&emissions, &gold[..len])?;
        if gold_score.to_scalar::<f64>()? == f64::NEG_INFINITY {
            return Err(SeqtagError::NoViablePath(
                "gold path scores -inf".to_string(),
            ));
        }

        Ok(log_z.sub(&gold_score)?)
    }

    /// Loss plus the gradient of every input, obtained by backpropagation.
    pub fn gradients(&self, emissions: &[Vec<f64>], gold: &[TagId]) -> Result<(f64, CrfGradients)> {
        validate_emissions(emissions, self.num_tags)?;
        let seq_len = emissions.len();
        let mut grads = CrfGradients::zeros(seq_len, self.num_tags);
        if seq_len == 0 {
            return Ok((0.0, grads));
        }

        let flat: Vec<f64> = emissions.iter().flatten().copied().collect();
        let input = Var::from_tensor(&Tensor::from_vec(flat, (seq_len, self.num_tags), &self.device)?)?;
        let loss = self.loss(input.as_tensor(), gold)?;
        let value = loss.to_scalar::<f64>()?;
        let store = loss.backward()?;

        if let Some(g) = store.get(input.as_tensor()) {
            grads.emissions = g.to_vec2::<f64>()?;
        }
        if let Some(g) = store.get(self.transitions.as_tensor()) {
            grads.transitions = g.to_vec2::<f64>()?;
        }
        if let Some(g) = store.get(self.start.as_tensor()) {
            grads.start = g.to_vec1::<f64>()?;
        }
        if let Some(g) = store.get(self.end.as_tensor()) {
            grads.end = g.to_vec1::<f64>()?;
        }

        Ok((value, grads))
    }

    /// One plain SGD update on a single sentence. Returns the loss before the
    /// update.
    pub fn sgd_step(&self, emissions: &Tensor, gold: &[TagId], learning_rate: f64) -> Result<f64> {
        let loss = self.loss(emissions, gold)?;
        let value = loss.to_scalar::<f64>()?;
        let mut sgd = SGD::new(self.vars(), learning_rate)?;
        sgd.backward_step(&loss)?;
        Ok(value)
    }

    fn pad_mask(&self) -> Result<Option<Tensor>> {
        let Some(pad) = self.pad else {
            return Ok(None);
        };
        let mut mask = vec![0.0f64; self.num_tags];
        mask[pad] = f64::NEG_INFINITY;
        Ok(Some(Tensor::new(mask.as_slice(), &self.device)?))
    }

    fn log_partition(&self, emissions: &Tensor) -> Result<Tensor> {
        let seq_len = emissions.dim(0)?;
        let mut alpha = self.start.as_tensor().add(&emissions.i(0)?)?;
        for t in 1..seq_len {
            // scores[i][j] = alpha[i] + transitions[i][j]
            let scores = alpha
                .unsqueeze(1)?
                .broadcast_add(self.transitions.as_tensor())?;
            alpha = log_sum_exp(&scores, 0)?.add(&emissions.i(t)?)?;
        }
        log_sum_exp(&alpha.add(self.end.as_tensor())?, 0)
    }

    fn gold_score(&self, emissions: &Tensor, gold: &[TagId]) -> Result<Tensor> {
        let mut terms = Vec::with_capacity(2 * gold.len() + 1);
        terms.push(self.start.as_tensor().i(gold[0])?);
        for (t, &tag) in gold.iter().enumerate() {
            terms.push(emissions.i((t, tag))?);
            if t > 0 {
                terms.push(self.transitions.as_tensor().i((gold[t - 1], tag))?);
            }
        }
        terms.push(self.end.as_tensor().i(gold[gold.len() - 1])?);
        Ok(Tensor::stack(&terms, 0)?.sum_all()?)
    }
}

/// Max-shifted log-sum-exp along `dim`; the dimension is removed.
fn log_sum_exp(xs: &Tensor, dim: usize) -> Result<Tensor> {
    let max = xs.max_keepdim(dim)?;
    let summed = xs.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?.log()?;
    Ok(summed.add(&max)?.squeeze(dim)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-8;

    fn layer() -> CrfLayer {
        CrfLayer::new(
            vec![
                vec![0.5, -0.2, 0.1],
                vec![-1.0, 0.8, 0.0],
                vec![0.3, 0.3, -0.4],
            ],
            vec![0.2, -0.1, 0.0],
            vec![-0.3, 0.1, 0.4],
        )
        .unwrap()
    }

    fn emissions() -> Vec<Vec<f64>> {
        vec![
            vec![1.0, 0.2, -0.5],
            vec![0.1, 0.9, 0.3],
            vec![-0.2, 0.4, 1.1],
        ]
    }

    fn assert_all_close(a: &[f64], b: &[f64]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < TOLERANCE, "{x} != {y}");
        }
    }

    #[test]
    fn test_loss_matches_layer() {
        let layer = layer();
        let crf = TensorCrf::from_layer(&layer, &Device::Cpu).unwrap();
        let gold = vec![0, 2, 1];
        let (loss, _) = crf.gradients(&emissions(), &gold).unwrap();
        let expected = layer.loss(&emissions(), &gold).unwrap();
        assert!((loss - expected).abs() < TOLERANCE);
    }

    #[test]
    fn test_backprop_matches_forward_backward() {
        let layer = layer();
        let crf = TensorCrf::from_layer(&layer, &Device::Cpu).unwrap();
        let gold = vec![1, 1, 2];
        let (_, autodiff) = crf.gradients(&emissions(), &gold).unwrap();
        let (_, analytic) = layer.loss_and_gradients(&emissions(), &gold).unwrap();

        for (a, b) in autodiff.emissions.iter().zip(&analytic.emissions) {
            assert_all_close(a, b);
        }
        for (a, b) in autodiff.transitions.iter().zip(&analytic.transitions) {
            assert_all_close(a, b);
        }
        assert_all_close(&autodiff.start, &analytic.start);
        assert_all_close(&autodiff.end, &analytic.end);
    }

    #[test]
    fn test_pad_truncates_gold() {
        let layer = CrfLayer::zeros(3).unwrap().with_pad(0).unwrap();
        let crf = TensorCrf::from_layer(&layer, &Device::Cpu).unwrap();
        let (loss, grads) = crf.gradients(&emissions(), &[1, 2, 0]).unwrap();
        let expected = layer.loss(&emissions()[..2], &[1, 2]).unwrap();
        assert!((loss - expected).abs() < TOLERANCE);
        assert!(grads.emissions[2].iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_sgd_step_reduces_loss() {
        let crf = TensorCrf::from_layer(&layer(), &Device::Cpu).unwrap();
        let flat: Vec<f64> = emissions().into_iter().flatten().collect();
        let input = Tensor::from_vec(flat, (3, 3), &Device::Cpu).unwrap();
        let gold = vec![2, 0, 1];

        let before = crf.sgd_step(&input, &gold, 0.1).unwrap();
        let after = crf.loss(&input, &gold).unwrap().to_scalar::<f64>().unwrap();
        assert!(after < before);

        let updated = crf.to_layer().unwrap();
        assert_ne!(updated.transitions(), layer().transitions());
    }

    #[test]
    fn test_shape_errors() {
        let crf = TensorCrf::from_layer(&layer(), &Device::Cpu).unwrap();
        assert!(matches!(
            crf.gradients(&[vec![0.0, 1.0]], &[0]),
            Err(SeqtagError::EmissionWidth { .. })
        ));
        assert!(matches!(
            crf.gradients(&emissions(), &[0, 1]),
            Err(SeqtagError::SequenceLength { .. })
        ));
    }
}
