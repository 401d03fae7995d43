//! Training loop for a CRF head on top of fixed encoder emissions.
//!
//! Mini-batch SGD with momentum, an `lr / (1 + decay * epoch)` schedule and
//! L2 gradient clipping. After every epoch the dev set is decoded and the
//! parameters are snapshotted when the strict dev F1 improves.

use anyhow::{Context, Result, bail};
use oorandom::Rand64;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use seqtag_core::crf::CrfGradients;
use seqtag_core::{
    CrfLayer, CrfSnapshot, EvalConfig, STRICT_OVERLAP, TagId, TagVocabulary, TaggerHead, TaggerKind, score_corpus,
    token_accuracy,
};
use tracing::{debug, info, warn};

use crate::data::EmissionExample;

/// Hyper-parameters of [`CrfTrainer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    /// Per-epoch decay of the learning rate; 0 disables the schedule.
    pub lr_decay: f64,
    pub momentum: f64,
    /// Maximum L2 norm of the batch gradient.
    pub clip_grad: f64,
    pub batch_size: usize,
    pub seed: u64,
    /// Keep the best-on-dev parameters instead of the last ones.
    pub save_best: bool,
    /// Overlap ratio used to pick the best epoch.
    pub dev_overlap_ratio: f64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 200,
            learning_rate: 0.01,
            lr_decay: 0.05,
            momentum: 0.9,
            clip_grad: 5.0,
            batch_size: 10,
            seed: 42,
            save_best: true,
            dev_overlap_ratio: STRICT_OVERLAP,
        }
    }
}

impl TrainerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_lr_decay(mut self, lr_decay: f64) -> Self {
        self.lr_decay = lr_decay;
        self
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_clip_grad(mut self, clip_grad: f64) -> Self {
        self.clip_grad = clip_grad;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_save_best(mut self, save_best: bool) -> Self {
        self.save_best = save_best;
        self
    }

    /// Learning rate used during `epoch` (1-based).
    pub fn learning_rate_at(&self, epoch: usize) -> f64 {
        if self.lr_decay > 0.0 {
            self.learning_rate / (1.0 + self.lr_decay * epoch as f64)
        } else {
            self.learning_rate
        }
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch size must be at least 1");
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            bail!("learning rate must be positive, got {}", self.learning_rate);
        }
        if !(0.0..1.0).contains(&self.momentum) {
            bail!("momentum must be in [0, 1), got {}", self.momentum);
        }
        if self.clip_grad.is_nan() || self.clip_grad <= 0.0 {
            bail!("gradient clip norm must be positive, got {}", self.clip_grad);
        }
        EvalConfig::new()
            .with_overlap_ratio(self.dev_overlap_ratio)
            .validate()?;
        Ok(())
    }
}

/// A sentence with encoded gold tags.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedExample {
    pub tags: Vec<TagId>,
    pub emissions: Vec<Vec<f64>>,
}

impl EncodedExample {
    pub fn encode(example: &EmissionExample, vocab: &TagVocabulary) -> Result<Self> {
        Ok(Self {
            tags: vocab.encode(&example.tags)?,
            emissions: example.emissions.clone(),
        })
    }
}

/// Encode a whole dataset, naming the offending record on failure.
pub fn encode_examples(examples: &[EmissionExample], vocab: &TagVocabulary) -> Result<Vec<EncodedExample>> {
    examples
        .iter()
        .enumerate()
        .map(|(idx, example)| EncodedExample::encode(example, vocab).with_context(|| format!("record {idx}")))
        .collect()
}

/// Per-epoch training record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub learning_rate: f64,
    /// Summed training loss over all batches.
    pub loss: f64,
    pub dev_accuracy: f64,
    pub dev_f1: f64,
    /// Whether this epoch produced the kept snapshot.
    pub best: bool,
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub best: CrfSnapshot,
    pub history: Vec<EpochStats>,
}

/// Fits the transitions, start and end scores of a [`CrfLayer`].
pub struct CrfTrainer {
    config: TrainerConfig,
    layer: CrfLayer,
    velocity: CrfGradients,
    rng: Rand64,
}

impl CrfTrainer {
    pub fn new(layer: CrfLayer, config: TrainerConfig) -> Self {
        let velocity = CrfGradients::zeros(0, layer.num_tags());
        let rng = Rand64::new(u128::from(config.seed));
        Self {
            config,
            layer,
            velocity,
            rng,
        }
    }

    pub fn layer(&self) -> &CrfLayer {
        &self.layer
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Train for `config.epochs` epochs and return the kept snapshot.
    pub fn fit(
        &mut self,
        train: &[EncodedExample],
        dev: &[EncodedExample],
        vocab: &TagVocabulary,
    ) -> Result<TrainOutcome> {
        self.config.validate()?;
        if train.is_empty() {
            bail!("training set is empty");
        }
        if dev.is_empty() {
            warn!("dev set is empty, every epoch scores F1 = 0");
        }
        info!(
            train = train.len(),
            dev = dev.len(),
            epochs = self.config.epochs,
            tags = self.layer.num_tags(),
            "starting CRF training"
        );

        let mut best: Option<CrfSnapshot> = None;
        let mut history = Vec::with_capacity(self.config.epochs);

        for epoch in 1..=self.config.epochs {
            let learning_rate = self.config.learning_rate_at(epoch);
            let loss = self.run_epoch(train, learning_rate)?;
            let (dev_accuracy, dev_f1) = evaluate(&self.layer, dev, vocab, self.config.dev_overlap_ratio)?;

            let snapshot = CrfSnapshot::capture(&self.layer, epoch, dev_f1);
            let improved = best.as_ref().is_none_or(|kept| snapshot.improves_on(kept));
            let kept = improved || !self.config.save_best;
            if kept {
                best = Some(snapshot);
            }

            info!(
                epoch,
                loss,
                dev_accuracy,
                dev_f1,
                best = improved,
                "{}epoch {epoch}/{}",
                if improved { "[BEST] " } else { "" },
                self.config.epochs
            );
            history.push(EpochStats {
                epoch,
                learning_rate,
                loss,
                dev_accuracy,
                dev_f1,
                best: kept,
            });
        }

        let best = match best {
            Some(best) => best,
            None => {
                let (_, dev_f1) = evaluate(&self.layer, dev, vocab, self.config.dev_overlap_ratio)?;
                CrfSnapshot::capture(&self.layer, 0, dev_f1)
            }
        };
        Ok(TrainOutcome { best, history })
    }

    /// One pass over `train` in a seeded random order. Returns the summed loss.
    fn run_epoch(&mut self, train: &[EncodedExample], learning_rate: f64) -> Result<f64> {
        let order = shuffled(train.len(), &mut self.rng);
        let mut loss_sum = 0.0;
        for (step, batch) in order.chunks(self.config.batch_size).enumerate() {
            let batch: Vec<&EncodedExample> = batch.iter().map(|&idx| &train[idx]).collect();
            let loss = self.step(&batch, learning_rate)?;
            if step % 50 == 0 {
                debug!(step, loss, "batch");
            }
            loss_sum += loss;
        }
        Ok(loss_sum)
    }

    /// Batch-averaged gradient, clipped, then one momentum SGD update.
    /// Returns the batch-averaged loss.
    fn step(&mut self, batch: &[&EncodedExample], learning_rate: f64) -> Result<f64> {
        let layer = &self.layer;
        let results = batch
            .par_iter()
            .map(|example| layer.loss_and_gradients(&example.emissions, &example.tags))
            .collect::<seqtag_core::Result<Vec<_>>>()?;

        let mut gradient = CrfGradients::zeros(0, layer.num_tags());
        let mut loss = 0.0;
        for (example_loss, example_grads) in &results {
            loss += example_loss;
            gradient.accumulate(example_grads);
        }
        let scale = 1.0 / batch.len() as f64;
        gradient.scale(scale);

        let norm = gradient.param_norm();
        if norm > self.config.clip_grad {
            gradient.scale(self.config.clip_grad / norm);
        }

        self.velocity.scale(self.config.momentum);
        self.velocity.accumulate(&gradient);

        let params = self.layer.params_mut();
        for (row, velocity_row) in params.transitions.iter_mut().zip(&self.velocity.transitions) {
            for (weight, v) in row.iter_mut().zip(velocity_row) {
                *weight -= learning_rate * v;
            }
        }
        for (weight, v) in params.start.iter_mut().zip(&self.velocity.start) {
            *weight -= learning_rate * v;
        }
        for (weight, v) in params.end.iter_mut().zip(&self.velocity.end) {
            *weight -= learning_rate * v;
        }

        Ok(loss * scale)
    }
}

/// Decode `examples` with `layer` and return (token accuracy, micro F1).
pub fn evaluate(
    layer: &CrfLayer,
    examples: &[EncodedExample],
    vocab: &TagVocabulary,
    overlap_ratio: f64,
) -> Result<(f64, f64)> {
    let predicted = predict(layer, examples)?;
    let gold: Vec<Vec<TagId>> = examples.iter().map(|example| example.tags.clone()).collect();
    let accuracy = token_accuracy(&gold, &predicted, vocab)?;
    let config = EvalConfig::new().with_overlap_ratio(overlap_ratio).with_parallel(true);
    let scores = score_corpus(&gold, &predicted, vocab, &config)?;
    Ok((accuracy, scores.micro.f1))
}

/// Viterbi-decode every example in parallel.
pub fn predict(layer: &CrfLayer, examples: &[EncodedExample]) -> Result<Vec<Vec<TagId>>> {
    let predicted = examples
        .par_iter()
        .map(|example| layer.decode(&example.emissions).map(|decoded| decoded.tags))
        .collect::<seqtag_core::Result<Vec<_>>>()?;
    Ok(predicted)
}

/// Decode every example with `head` in parallel.
pub fn predict_with_head(head: &TaggerHead, examples: &[EncodedExample]) -> Result<Vec<Vec<TagId>>> {
    let predicted = examples
        .par_iter()
        .map(|example| head.decode(&example.emissions))
        .collect::<seqtag_core::Result<Vec<_>>>()?;
    Ok(predicted)
}

/// The output layer a `kind` tagger decodes with, given trained CRF
/// parameters. Softmax kinds ignore the CRF and take each token's argmax.
pub fn tagger_head(kind: TaggerKind, snapshot: &CrfSnapshot, vocab: &TagVocabulary) -> Result<TaggerHead> {
    if snapshot.layer.num_tags() != vocab.len() {
        bail!(
            "CRF has {} tags but the vocabulary has {}",
            snapshot.layer.num_tags(),
            vocab.len()
        );
    }
    if snapshot.layer.pad() != vocab.pad_id() {
        bail!(
            "CRF pad id {:?} differs from the vocabulary pad id {:?}",
            snapshot.layer.pad(),
            vocab.pad_id()
        );
    }
    if kind.has_crf() {
        Ok(TaggerHead::Crf(snapshot.layer.clone()))
    } else {
        Ok(TaggerHead::for_kind(kind, vocab.len(), vocab.pad_id())?)
    }
}

/// Fisher-Yates permutation of `0..len`.
fn shuffled(len: usize, rng: &mut Rand64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    for i in (1..len).rev() {
        let j = rng.rand_range(0..(i as u64 + 1)) as usize;
        order.swap(i, j);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use seqtag_core::tags::DEFAULT_PAD;

    /// Emissions that slightly prefer `O` everywhere; only the transitions
    /// can learn that `I-X` follows `B-X`.
    fn dataset(vocab: &TagVocabulary) -> Vec<EncodedExample> {
        let tags = [
            vec!["B-X", "I-X", "O"],
            vec!["O", "B-X", "I-X"],
            vec!["B-X", "I-X", "I-X"],
            vec!["O", "O", "B-X"],
        ];
        tags.iter()
            .map(|labels| {
                let ids = vocab.encode(labels).unwrap();
                let emissions = ids
                    .iter()
                    .enumerate()
                    .map(|(pos, &id)| {
                        let mut row = vec![0.0; vocab.len()];
                        row[vocab.id("O").unwrap()] = 0.3;
                        if pos == 0 || labels[pos].starts_with('B') {
                            row[id] += 1.0;
                        }
                        row
                    })
                    .collect();
                EncodedExample { tags: ids, emissions }
            })
            .collect()
    }

    fn vocab() -> TagVocabulary {
        TagVocabulary::from_sequences([["O", "B-X", "I-X"]], Some(DEFAULT_PAD))
    }

    fn layer(vocab: &TagVocabulary) -> CrfLayer {
        CrfLayer::zeros(vocab.len()).unwrap().with_pad(0).unwrap()
    }

    #[test]
    fn test_shuffle_is_seeded_permutation() {
        let a = shuffled(20, &mut Rand64::new(42));
        let b = shuffled(20, &mut Rand64::new(42));
        assert_eq!(a, b);
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
    }

    #[rstest]
    #[case(1, 0.01 / 1.05)]
    #[case(10, 0.01 / 1.5)]
    fn test_learning_rate_schedule(#[case] epoch: usize, #[case] expected: f64) {
        let config = TrainerConfig::default();
        assert!((config.learning_rate_at(epoch) - expected).abs() < 1e-15);
        assert_eq!(config.with_lr_decay(0.0).learning_rate_at(epoch), 0.01);
    }

    #[test]
    fn test_training_reduces_loss_and_learns_transitions() {
        let vocab = vocab();
        let data = dataset(&vocab);
        let config = TrainerConfig::new()
            .with_epochs(30)
            .with_learning_rate(0.1)
            .with_batch_size(2);
        let mut trainer = CrfTrainer::new(layer(&vocab), config);
        let outcome = trainer.fit(&data, &data, &vocab).unwrap();

        assert_eq!(outcome.history.len(), 30);
        let first = outcome.history[0].loss;
        let last = outcome.history[29].loss;
        assert!(last < first, "loss did not decrease: {first} -> {last}");

        let b = vocab.id("B-X").unwrap();
        let i = vocab.id("I-X").unwrap();
        let o = vocab.id("O").unwrap();
        let learned = trainer.layer().transitions();
        assert!(learned[b][i] > learned[b][o]);
        assert!(outcome.best.dev_f1 >= outcome.history[0].dev_f1);
    }

    #[test]
    fn test_same_seed_same_result() {
        let vocab = vocab();
        let data = dataset(&vocab);
        let config = TrainerConfig::new().with_epochs(3).with_batch_size(3);
        let run = || {
            let mut trainer = CrfTrainer::new(layer(&vocab), config.clone());
            trainer.fit(&data, &data, &vocab).unwrap().best
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_save_last_keeps_final_epoch() {
        let vocab = vocab();
        let data = dataset(&vocab);
        let config = TrainerConfig::new().with_epochs(4).with_save_best(false);
        let mut trainer = CrfTrainer::new(layer(&vocab), config);
        let outcome = trainer.fit(&data, &data, &vocab).unwrap();
        assert_eq!(outcome.best.epoch, 4);
        assert_eq!(&outcome.best.layer, trainer.layer());
        assert!(outcome.history.iter().all(|stats| stats.best));
    }

    #[test]
    fn test_history_marks_kept_epochs() {
        let vocab = vocab();
        let data = dataset(&vocab);
        let mut trainer = CrfTrainer::new(layer(&vocab), TrainerConfig::new().with_epochs(5));
        let outcome = trainer.fit(&data, &data, &vocab).unwrap();

        let last_kept = outcome.history.iter().rev().find(|stats| stats.best).unwrap();
        assert_eq!(last_kept.epoch, outcome.best.epoch);
        assert_eq!(last_kept.dev_f1, outcome.best.dev_f1);
    }

    #[test]
    fn test_tagger_head_follows_kind() {
        let vocab = vocab();
        let b = vocab.id("B-X").unwrap();
        let i = vocab.id("I-X").unwrap();
        let o = vocab.id("O").unwrap();

        let mut layer = layer(&vocab);
        layer.params_mut().transitions[b][i] = 5.0;
        let snapshot = CrfSnapshot::capture(&layer, 3, 0.5);
        let mut emissions = vec![vec![0.0; vocab.len()]; 2];
        emissions[0][b] = 1.0;
        emissions[1][o] = 1.0;
        let examples = vec![EncodedExample {
            tags: vec![b, i],
            emissions,
        }];

        let crf = tagger_head(TaggerKind::BiRnnCnnCrf, &snapshot, &vocab).unwrap();
        assert_eq!(crf.crf(), Some(&layer));
        assert_eq!(predict_with_head(&crf, &examples).unwrap(), vec![vec![b, i]]);
        assert_eq!(predict_with_head(&crf, &examples).unwrap(), predict(&layer, &examples).unwrap());

        let softmax = tagger_head(TaggerKind::BiRnn, &snapshot, &vocab).unwrap();
        assert!(softmax.crf().is_none());
        assert_eq!(predict_with_head(&softmax, &examples).unwrap(), vec![vec![b, o]]);
    }

    #[test]
    fn test_tagger_head_rejects_foreign_vocabulary() {
        let vocab = vocab();
        let snapshot = CrfSnapshot::capture(&CrfLayer::zeros(2).unwrap(), 1, 0.0);
        assert!(tagger_head(TaggerKind::BiRnnCnnCrf, &snapshot, &vocab).is_err());

        let unpadded = CrfSnapshot::capture(&CrfLayer::zeros(vocab.len()).unwrap(), 1, 0.0);
        assert!(tagger_head(TaggerKind::BiRnnCnnCrf, &unpadded, &vocab).is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let vocab = vocab();
        let data = dataset(&vocab);
        let mut trainer = CrfTrainer::new(layer(&vocab), TrainerConfig::new().with_batch_size(0));
        assert!(trainer.fit(&data, &data, &vocab).is_err());
        let mut trainer = CrfTrainer::new(layer(&vocab), TrainerConfig::new());
        assert!(trainer.fit(&[], &data, &vocab).is_err());
    }

    #[test]
    fn test_clipping_bounds_update() {
        let vocab = vocab();
        let data = dataset(&vocab);
        let config = TrainerConfig::new()
            .with_momentum(0.0)
            .with_clip_grad(1e-3)
            .with_learning_rate(1.0);
        let mut trainer = CrfTrainer::new(layer(&vocab), config);
        let batch: Vec<&EncodedExample> = data.iter().collect();
        trainer.step(&batch, 1.0).unwrap();

        let moved: f64 = trainer
            .layer()
            .transitions()
            .iter()
            .flatten()
            .chain(trainer.layer().start())
            .chain(trainer.layer().end())
            .map(|w| w * w)
            .sum::<f64>()
            .sqrt();
        assert!(moved <= 1e-3 + 1e-12);
    }
}
