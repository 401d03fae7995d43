//! Data loading: CoNLL-style tag files and JSON-lines emission datasets.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use seqtag_core::{TagId, TagVocabulary};

/// Marker line that separates documents in CoNLL-2003 files.
const DOCSTART: &str = "-DOCSTART-";

/// One tagged sentence.
#[derive(Debug, Clone, PartialEq)]
pub struct Sentence {
    pub tokens: Vec<String>,
    pub tags: Vec<String>,
}

/// One sentence of a system-output file: token, gold tag, predicted tag.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredSentence {
    pub tokens: Vec<String>,
    pub gold: Vec<String>,
    pub predicted: Vec<String>,
}

/// Emission scores produced by an external encoder for one sentence, with
/// its gold tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionExample {
    pub tags: Vec<String>,
    pub emissions: Vec<Vec<f64>>,
}

/// Read a CoNLL file: whitespace-separated columns, token first, one token
/// per line, blank lines between sentences. The tag is taken from
/// `tag_column`, or from the last column when `None`.
pub fn read_conll<P: AsRef<Path>>(path: P, tag_column: Option<usize>) -> Result<Vec<Sentence>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    parse_conll(BufReader::new(file), tag_column)
        .with_context(|| format!("failed to parse {}", path.display()))
}

pub fn parse_conll<R: BufRead>(reader: R, tag_column: Option<usize>) -> Result<Vec<Sentence>> {
    let sentences = parse_rows(reader, |columns, line_no| {
        let tag = match tag_column {
            Some(col) => columns.get(col),
            None => columns.last(),
        };
        match tag {
            Some(tag) if columns.len() >= 2 => Ok((columns[0].to_string(), tag.to_string())),
            _ => bail!("line {line_no}: expected a token and a tag column"),
        }
    })?;

    Ok(sentences
        .into_iter()
        .map(|rows| {
            let (tokens, tags) = rows.into_iter().unzip();
            Sentence { tokens, tags }
        })
        .collect())
}

/// Read a three-column system-output file (`token gold predicted`); extra
/// middle columns are ignored, gold and predicted are the last two.
pub fn read_scored_conll<P: AsRef<Path>>(path: P) -> Result<Vec<ScoredSentence>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    parse_scored_conll(BufReader::new(file)).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn parse_scored_conll<R: BufRead>(reader: R) -> Result<Vec<ScoredSentence>> {
    let sentences = parse_rows(reader, |columns, line_no| match columns {
        [token, .., gold, predicted] => {
            Ok((token.to_string(), gold.to_string(), predicted.to_string()))
        }
        _ => bail!("line {line_no}: expected token, gold and predicted columns"),
    })?;

    Ok(sentences
        .into_iter()
        .map(|rows| {
            let mut sentence = ScoredSentence {
                tokens: Vec::with_capacity(rows.len()),
                gold: Vec::with_capacity(rows.len()),
                predicted: Vec::with_capacity(rows.len()),
            };
            for (token, gold, predicted) in rows {
                sentence.tokens.push(token);
                sentence.gold.push(gold);
                sentence.predicted.push(predicted);
            }
            sentence
        })
        .collect())
}

/// Split a CoNLL stream into sentences, mapping each token line with `row`.
fn parse_rows<R, T, F>(reader: R, mut row: F) -> Result<Vec<Vec<T>>>
where
    R: BufRead,
    F: FnMut(&[&str], usize) -> Result<T>,
{
    let mut sentences = Vec::new();
    let mut current = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();

        if line.is_empty() {
            if !current.is_empty() {
                sentences.push(std::mem::take(&mut current));
            }
            continue;
        }
        if line.starts_with(DOCSTART) {
            continue;
        }

        let columns: Vec<&str> = line.split_whitespace().collect();
        current.push(row(&columns, idx + 1)?);
    }

    if !current.is_empty() {
        sentences.push(current);
    }
    Ok(sentences)
}

/// Read a JSON-lines file of [`EmissionExample`]s, one per line.
pub fn read_emissions<P: AsRef<Path>>(path: P) -> Result<Vec<EmissionExample>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut examples = Vec::new();

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let example: EmissionExample = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid emission record", path.display(), idx + 1))?;
        if example.tags.len() != example.emissions.len() {
            bail!(
                "{}:{}: {} tags but {} emission rows",
                path.display(),
                idx + 1,
                example.tags.len(),
                example.emissions.len()
            );
        }
        examples.push(example);
    }
    Ok(examples)
}

/// Encode tag-string sequences into ids.
pub fn encode_tags<S: AsRef<str>>(vocab: &TagVocabulary, sequences: &[Vec<S>]) -> Result<Vec<Vec<TagId>>> {
    sequences
        .iter()
        .enumerate()
        .map(|(idx, tags)| {
            vocab
                .encode(tags)
                .with_context(|| format!("sentence {idx}"))
        })
        .collect()
}
