//! seqtag command-line tool
//!
//! Scores system output against gold tags, trains CRF heads on encoder
//! emissions, and decodes with a trained checkpoint.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use seqtag_core::tags::DEFAULT_PAD;
use seqtag_core::{CrfLayer, CrfSnapshot, EvalConfig, Evaluation, OverlapPolicy, TagVocabulary, TaggerKind};
use seqtag_trainer::data::{encode_tags, read_emissions, read_scored_conll};
use seqtag_trainer::trainer::{encode_examples, predict, predict_with_head, tagger_head};
use seqtag_trainer::{CrfTrainer, ScoresReport, TrainerConfig};
use tracing::{Level, info};

/// CLI arguments
#[derive(Parser)]
#[command(name = "seqtag")]
#[command(about = "Train CRF tagger heads and score tag sequences")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log per-batch and per-sentence diagnostics
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Score a `token gold predicted` file
    Evaluate {
        /// Three-column CoNLL file
        #[arg(short, long)]
        input: PathBuf,

        /// Where to write the text report (printed to stdout otherwise)
        #[arg(short, long)]
        report: Option<PathBuf>,

        /// Overlap denominator: max-length, union or gold
        #[arg(long, default_value = "max-length", value_parser = parse_policy)]
        policy: OverlapPolicy,
    },
    /// Fit a CRF head on JSON-lines emission datasets
    TrainCrf {
        #[arg(long)]
        train: PathBuf,

        #[arg(long)]
        dev: PathBuf,

        /// Scored with the kept parameters after training
        #[arg(long)]
        test: Option<PathBuf>,

        /// Output checkpoint (JSON)
        #[arg(short, long, default_value = "crf-checkpoint.json")]
        checkpoint: PathBuf,

        /// Where to write the text report
        #[arg(short, long)]
        report: Option<PathBuf>,

        /// Tagger architecture; must have a CRF head
        #[arg(long, default_value = "BiRNNCNNCRF")]
        model: TaggerKind,

        #[arg(long, default_value_t = 200)]
        epochs: usize,

        #[arg(long, default_value_t = 0.01)]
        lr: f64,

        #[arg(long, default_value_t = 0.05)]
        lr_decay: f64,

        #[arg(long, default_value_t = 0.9)]
        momentum: f64,

        #[arg(long, default_value_t = 5.0)]
        clip_grad: f64,

        #[arg(long, default_value_t = 10)]
        batch_size: usize,

        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Keep the last epoch's parameters instead of the best on dev
        #[arg(long)]
        save_last: bool,
    },
    /// Decode emissions with a trained checkpoint and score them
    Predict {
        #[arg(short, long)]
        checkpoint: PathBuf,

        /// JSON-lines emission file; its gold tags are used for scoring
        #[arg(short, long)]
        input: PathBuf,

        /// Output `gold predicted` file (CoNLL layout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Decode as this architecture instead of the checkpoint's; the
        /// non-CRF kinds take each token's argmax
        #[arg(long)]
        model: Option<TaggerKind>,
    },
}

/// Trained parameters together with the tag order of their columns.
#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    model: TaggerKind,
    vocabulary: TagVocabulary,
    snapshot: CrfSnapshot,
}

fn parse_policy(raw: &str) -> std::result::Result<OverlapPolicy, String> {
    match raw.to_ascii_lowercase().replace('_', "-").as_str() {
        "max-length" => Ok(OverlapPolicy::MaxLength),
        "union" => Ok(OverlapPolicy::Union),
        "gold" => Ok(OverlapPolicy::Gold),
        other => Err(format!("unknown overlap policy {other:?}")),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    match cli.command {
        Commands::Evaluate { input, report, policy } => evaluate(&input, report.as_deref(), policy),
        Commands::TrainCrf {
            train,
            dev,
            test,
            checkpoint,
            report,
            model,
            epochs,
            lr,
            lr_decay,
            momentum,
            clip_grad,
            batch_size,
            seed,
            save_last,
        } => {
            let config = TrainerConfig::new()
                .with_epochs(epochs)
                .with_learning_rate(lr)
                .with_lr_decay(lr_decay)
                .with_momentum(momentum)
                .with_clip_grad(clip_grad)
                .with_batch_size(batch_size)
                .with_seed(seed)
                .with_save_best(!save_last);
            train_crf(model, &train, &dev, test.as_deref(), &checkpoint, report.as_deref(), config)
        }
        Commands::Predict {
            checkpoint,
            input,
            output,
            model,
        } => run_predict(&checkpoint, &input, output.as_deref(), model),
    }
}

fn evaluate(input: &Path, report: Option<&Path>, policy: OverlapPolicy) -> Result<()> {
    let sentences = read_scored_conll(input)?;
    info!(sentences = sentences.len(), path = %input.display(), "loaded system output");

    let vocab = TagVocabulary::from_sequences(
        sentences.iter().flat_map(|s| [&s.gold, &s.predicted]),
        Some(DEFAULT_PAD),
    );
    let gold: Vec<Vec<String>> = sentences.iter().map(|s| s.gold.clone()).collect();
    let predicted: Vec<Vec<String>> = sentences.iter().map(|s| s.predicted.clone()).collect();
    let gold = encode_tags(&vocab, &gold)?;
    let predicted = encode_tags(&vocab, &predicted)?;

    let config = EvalConfig::new().with_overlap_policy(policy).with_parallel(true);
    let evaluation = Evaluation::run_with(&gold, &predicted, &vocab, &config)?;
    let scores = ScoresReport::new("INPUT", evaluation)
        .with_setting("input", input.display())
        .with_setting("overlap_policy", format!("{policy:?}"));
    emit(&scores, report)
}

fn train_crf(
    model: TaggerKind,
    train: &Path,
    dev: &Path,
    test: Option<&Path>,
    checkpoint: &Path,
    report: Option<&Path>,
    config: TrainerConfig,
) -> Result<()> {
    if !model.has_crf() {
        bail!("{model} has no CRF head; use BiRNNCNNCRF");
    }
    let train_set = read_emissions(train)?;
    let dev_set = read_emissions(dev)?;
    let test_set = test.map(read_emissions).transpose()?;

    let vocab = TagVocabulary::from_sequences(
        train_set
            .iter()
            .chain(&dev_set)
            .chain(test_set.iter().flatten())
            .map(|example| &example.tags),
        Some(DEFAULT_PAD),
    );
    info!(tags = vocab.len(), types = ?vocab.types(), "built tag vocabulary");

    let train_set = encode_examples(&train_set, &vocab).context("train set")?;
    let dev_set = encode_examples(&dev_set, &vocab).context("dev set")?;
    let pad = vocab.pad_id().unwrap_or_default();
    let layer = CrfLayer::zeros(vocab.len())?.with_pad(pad)?;

    let mut trainer = CrfTrainer::new(layer, config.clone());
    let outcome = trainer.fit(&train_set, &dev_set, &vocab)?;
    info!(
        epoch = outcome.best.epoch,
        dev_f1 = outcome.best.dev_f1,
        "training finished"
    );

    let saved = Checkpoint {
        model,
        vocabulary: vocab,
        snapshot: outcome.best,
    };
    let json = serde_json::to_string_pretty(&saved).context("failed to serialize checkpoint")?;
    fs::write(checkpoint, json).with_context(|| format!("failed to write {}", checkpoint.display()))?;
    info!(path = %checkpoint.display(), "checkpoint saved");

    let (name, examples) = match test_set {
        Some(test_set) => ("TEST", encode_examples(&test_set, &saved.vocabulary).context("test set")?),
        None => ("DEV", dev_set),
    };
    let predicted = predict(&saved.snapshot.layer, &examples)?;
    let gold: Vec<_> = examples.into_iter().map(|example| example.tags).collect();
    let evaluation = Evaluation::run(&gold, &predicted, &saved.vocabulary)?;

    let scores = ScoresReport::new(name, evaluation)
        .with_setting("model", model)
        .with_setting("train", train.display())
        .with_setting("dev", dev.display())
        .with_setting("epochs", config.epochs)
        .with_setting("learning_rate", config.learning_rate)
        .with_setting("lr_decay", config.lr_decay)
        .with_setting("momentum", config.momentum)
        .with_setting("clip_grad", config.clip_grad)
        .with_setting("batch_size", config.batch_size)
        .with_setting("seed", config.seed)
        .with_setting("save_best", config.save_best)
        .with_best_epoch(saved.snapshot.epoch);
    emit(&scores, report)
}

fn run_predict(checkpoint: &Path, input: &Path, output: Option<&Path>, model: Option<TaggerKind>) -> Result<()> {
    let raw = fs::read_to_string(checkpoint).with_context(|| format!("failed to read {}", checkpoint.display()))?;
    let saved: Checkpoint =
        serde_json::from_str(&raw).with_context(|| format!("invalid checkpoint {}", checkpoint.display()))?;

    let model = model.unwrap_or(saved.model);
    let head = tagger_head(model, &saved.snapshot, &saved.vocabulary)
        .with_context(|| format!("checkpoint {} does not match its vocabulary", checkpoint.display()))?;
    info!(%model, tags = head.num_tags(), "decoding");

    let examples = encode_examples(&read_emissions(input)?, &saved.vocabulary)?;
    let predicted = predict_with_head(&head, &examples)?;

    if let Some(output) = output {
        let sentences = examples
            .iter()
            .zip(&predicted)
            .map(|(example, tags)| -> seqtag_core::Result<String> {
                let gold = saved.vocabulary.decode(&example.tags)?;
                let tags = saved.vocabulary.decode(tags)?;
                Ok(gold.iter().zip(tags).map(|(gold, tag)| format!("{gold} {tag}\n")).collect())
            })
            .collect::<seqtag_core::Result<Vec<_>>>()?;
        fs::write(output, sentences.join("\n")).with_context(|| format!("failed to write {}", output.display()))?;
        info!(path = %output.display(), "predictions written");
    }

    let gold: Vec<_> = examples.into_iter().map(|example| example.tags).collect();
    let evaluation = Evaluation::run(&gold, &predicted, &saved.vocabulary)?;
    let scores = ScoresReport::new("INPUT", evaluation)
        .with_setting("model", model)
        .with_setting("checkpoint", checkpoint.display())
        .with_best_epoch(saved.snapshot.epoch);
    emit(&scores, None)
}

fn emit(scores: &ScoresReport, report: Option<&Path>) -> Result<()> {
    match report {
        Some(path) => scores.write_to(path),
        None => {
            print!("{}", scores.render());
            Ok(())
        }
    }
}
