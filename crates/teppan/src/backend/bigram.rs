//! A character-level bigram language model.
//!
//! Token `0` is end of sequence (also used for padding and as the start
//! context), token `1` stands for characters never seen in the corpus and
//! every distinct corpus character gets its own id after that.

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

use super::{LanguageModel, ModelLoader};
use crate::error::{Error, Result};
use crate::padding::PaddedBatch;

const EOS: u32 = 0;
const UNKNOWN: u32 = 1;
const FIRST_CHAR: u32 = 2;

/// Next-character model over smoothed bigram counts.
///
/// Trained line by line: each line starts from the start context and ends
/// with end of sequence. Scores are log probabilities conditioned on the
/// last real token of each sequence.
#[derive(Debug, Clone)]
pub struct CharBigram {
    chars: Vec<char>,
    ids: HashMap<char, u32>,
    /// `log_probs[prev][next]`
    log_probs: Vec<Vec<f32>>,
}

impl CharBigram {
    /// Add-`smoothing` estimate of the bigram distribution of `corpus`
    pub fn train(corpus: &str, smoothing: f32) -> Result<Self> {
        let mut chars: Vec<char> = corpus.chars().filter(|c| *c != '\n' && *c != '\r').collect();
        chars.sort_unstable();
        chars.dedup();
        if chars.is_empty() {
            return Err(Error::Model("corpus has no characters to learn from".to_string()));
        }
        if !smoothing.is_finite() || smoothing <= 0.0 {
            return Err(Error::Model(format!("smoothing must be positive, got {}", smoothing)));
        }

        let ids: HashMap<char, u32> = chars
            .iter()
            .enumerate()
            .map(|(i, c)| (*c, i as u32 + FIRST_CHAR))
            .collect();
        let vocab = chars.len() + FIRST_CHAR as usize;

        let mut counts = vec![vec![0u32; vocab]; vocab];
        for line in corpus.lines().filter(|line| !line.trim().is_empty()) {
            let mut prev = EOS as usize;
            for c in line.chars().filter(|c| *c != '\r') {
                let next = ids[&c] as usize;
                counts[prev][next] += 1;
                prev = next;
            }
            counts[prev][EOS as usize] += 1;
        }

        let log_probs = counts
            .iter()
            .map(|row| {
                let total: f32 = row.iter().map(|&c| c as f32 + smoothing).sum::<f32>() - smoothing;
                row.iter()
                    .enumerate()
                    .map(|(next, &count)| {
                        if next == UNKNOWN as usize {
                            f32::NEG_INFINITY
                        } else {
                            ((count as f32 + smoothing) / total).ln()
                        }
                    })
                    .collect()
            })
            .collect();

        Ok(Self { chars, ids, log_probs })
    }

    /// Train on the contents of a text file
    pub fn from_file<P: AsRef<Path>>(path: P, smoothing: f32) -> Result<Self> {
        let path = path.as_ref();
        let corpus = std::fs::read_to_string(path)
            .map_err(|e| Error::Model(format!("cannot read corpus {}: {}", path.display(), e)))?;
        Self::train(&corpus, smoothing)
    }

    /// Number of token ids, special tokens included
    pub fn vocab_size(&self) -> usize {
        self.log_probs.len()
    }
}

impl LanguageModel for CharBigram {
    type Logits = Vec<Vec<f32>>;

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text
            .chars()
            .map(|c| self.ids.get(&c).copied().unwrap_or(UNKNOWN))
            .collect())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        let mut text = String::with_capacity(tokens.len());
        for &token in tokens {
            if token < FIRST_CHAR {
                continue;
            }
            match self.chars.get((token - FIRST_CHAR) as usize) {
                Some(c) => text.push(*c),
                None => return Err(Error::Model(format!("token {} is outside the vocabulary", token))),
            }
        }
        Ok(text)
    }

    fn eos_token(&self) -> u32 {
        EOS
    }

    fn pad_token(&self) -> u32 {
        EOS
    }

    fn forward(&mut self, batch: &PaddedBatch) -> Result<Vec<Vec<f32>>> {
        Ok((0..batch.len())
            .map(|i| {
                // unknown characters condition like the start of a line
                let context = match batch.last_token(i) {
                    Some(token) if token >= FIRST_CHAR => token as usize,
                    _ => EOS as usize,
                };
                self.log_probs[context].clone()
            })
            .collect())
    }
}

/// Loads a [`CharBigram`] by training it on the corpus file named by the
/// model identifier
#[derive(Debug, Clone)]
pub struct CharBigramLoader {
    smoothing: f32,
}

impl CharBigramLoader {
    pub fn new(smoothing: f32) -> Self {
        Self { smoothing }
    }
}

impl Default for CharBigramLoader {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl ModelLoader for CharBigramLoader {
    type Model = CharBigram;

    fn load(&self, model_id: &str) -> Result<CharBigram> {
        let model = CharBigram::from_file(model_id, self.smoothing)?;
        info!(corpus = model_id, vocab = model.vocab_size(), "trained character bigram model");
        Ok(model)
    }
}
