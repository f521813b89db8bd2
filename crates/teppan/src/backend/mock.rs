use std::time::Duration;

use super::LanguageModel;
use crate::error::{Error, Result};
use crate::padding::PaddedBatch;

const VOCAB: usize = 257;

/// A byte-level model that keeps repeating the first byte of each sequence.
///
/// Token `0` is end of sequence and padding; byte `b` is token `b + 1`. The
/// scores are sharp enough that sampling at any sane temperature is
/// deterministic.
#[derive(Debug, Clone, Default)]
pub(crate) struct EchoModel {
    /// Emit end of sequence once a sequence holds this many tokens
    pub eos_after: Option<usize>,
    /// Report a model failure for batches containing this text
    pub fail_on: Option<String>,
    /// Panic on batches containing this text
    pub panic_on: Option<String>,
    /// Sleep this long in every forward pass
    pub delay: Option<Duration>,
}

impl EchoModel {
    pub fn eos_after(tokens: usize) -> Self {
        Self {
            eos_after: Some(tokens),
            ..Self::default()
        }
    }
}

impl LanguageModel for EchoModel {
    type Logits = Vec<Vec<f32>>;

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(|b| b as u32 + 1).collect())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        let bytes: Vec<u8> = tokens
            .iter()
            .filter(|&&t| t != 0)
            .map(|&t| (t - 1) as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token(&self) -> u32 {
        0
    }

    fn pad_token(&self) -> u32 {
        0
    }

    fn forward(&mut self, batch: &PaddedBatch) -> Result<Vec<Vec<f32>>> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let mut rows = Vec::with_capacity(batch.len());
        for i in 0..batch.len() {
            let sequence = batch.sequence(i);
            let text = self.decode(sequence)?;
            if let Some(needle) = &self.panic_on {
                if text.contains(needle.as_str()) {
                    panic!("echo model asked to panic on {:?}", text);
                }
            }
            if let Some(needle) = &self.fail_on {
                if text.contains(needle.as_str()) {
                    return Err(Error::Model(format!("cannot score {:?}", text)));
                }
            }

            let finished = self.eos_after.is_some_and(|n| sequence.len() >= n);
            let next = match sequence.first() {
                Some(&first) if !finished => first as usize,
                _ => 0,
            };
            let mut row = vec![-1.0e4; VOCAB];
            row[next] = 0.0;
            rows.push(row);
        }
        Ok(rows)
    }
}
