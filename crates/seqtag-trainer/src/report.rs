//! Plain-text scores report: the run settings followed by token accuracy and
//! strict/lenient span scores, all in percent.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use seqtag_core::{CorpusScores, Evaluation};
use tracing::info;

/// A rendered-on-demand report for one evaluated corpus.
#[derive(Debug, Clone)]
pub struct ScoresReport {
    /// `name = value` lines printed above the results.
    settings: Vec<(String, String)>,
    /// Corpus name shown in the results header, e.g. `TEST`.
    corpus: String,
    /// Epoch whose parameters produced the predictions, if trained.
    best_epoch: Option<usize>,
    evaluation: Evaluation,
}

impl ScoresReport {
    pub fn new(corpus: impl Into<String>, evaluation: Evaluation) -> Self {
        Self {
            settings: Vec::new(),
            corpus: corpus.into(),
            best_epoch: None,
            evaluation,
        }
    }

    pub fn with_setting(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.settings.push((name.into(), value.to_string()));
        self
    }

    pub fn with_best_epoch(mut self, epoch: usize) -> Self {
        self.best_epoch = Some(epoch);
        self
    }

    pub fn evaluation(&self) -> &Evaluation {
        &self.evaluation
    }

    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Render and write to `path`, replacing any existing file.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.render()).with_context(|| format!("failed to write report {}", path.display()))?;
        info!(path = %path.display(), "scores report written");
        Ok(())
    }
}

impl fmt::Display for ScoresReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.settings {
            writeln!(f, "{name:<20} = {value}")?;
        }
        if !self.settings.is_empty() {
            writeln!(f)?;
        }

        write!(f, "Results on {}", self.corpus)?;
        if let Some(epoch) = self.best_epoch {
            write!(f, " (best epoch = {epoch})")?;
        }
        writeln!(f, ": Accuracy = {:.2}.", self.evaluation.accuracy * 100.0)?;
        write_scores_line(f, &self.evaluation.strict)?;
        write_scores_line(f, &self.evaluation.lenient)?;

        if !self.evaluation.strict.per_type.is_empty() {
            writeln!(f)?;
            writeln!(f, "{:<16} {:>8} {:>8} {:>8} {:>8}", "type", "F1", "P", "R", "support")?;
            for (kind, scores) in &self.evaluation.strict.per_type {
                writeln!(
                    f,
                    "{kind:<16} {:>8.2} {:>8.2} {:>8.2} {:>8}",
                    scores.f1 * 100.0,
                    scores.precision * 100.0,
                    scores.recall * 100.0,
                    scores.support
                )?;
            }
        }
        Ok(())
    }
}

fn write_scores_line(f: &mut fmt::Formatter<'_>, scores: &CorpusScores) -> fmt::Result {
    let percent = (scores.overlap_ratio * 100.0).round();
    writeln!(
        f,
        "match_alpha_ratio = {:.1} | F1-{percent}% = {:.2}, Precision-{percent}% = {:.2}, Recall-{percent}% = {:.2}.",
        scores.overlap_ratio,
        scores.micro.f1 * 100.0,
        scores.micro.precision * 100.0,
        scores.micro.recall * 100.0,
    )
}
