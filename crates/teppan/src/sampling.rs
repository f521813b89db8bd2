//! Next-token sampling from a row of scores.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};

/// Temperature-scaled softmax.
///
/// A temperature of zero (or below) puts all of the mass on the highest score.
pub fn softmax_with_temperature(logits: &[f32], temperature: f32) -> Vec<f32> {
    if logits.is_empty() {
        return Vec::new();
    }
    if temperature <= 0.0 {
        let mut probs = vec![0.0; logits.len()];
        probs[argmax(logits)] = 1.0;
        return probs;
    }

    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| ((l - max) / temperature).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index of the largest score (the first one on ties)
pub fn argmax(logits: &[f32]) -> usize {
    let mut best = 0;
    for (i, &value) in logits.iter().enumerate() {
        if value > logits[best] {
            best = i;
        }
    }
    best
}

/// Draw an index from a probability vector given a uniform sample in `[0, 1)`
pub fn multinomial_index(probs: &[f32], sample: f32) -> usize {
    let mut cumsum = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if cumsum > sample {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}

/// Temperature sampler with its own random state.
///
/// Seeded samplers are reproducible; unseeded ones draw their seed from the
/// operating system.
pub struct Sampler {
    temperature: f32,
    rng: StdRng,
}

impl Sampler {
    pub fn new(temperature: f32, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { temperature, rng }
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Sample one token id from a row of scores
    pub fn sample(&mut self, logits: &[f32]) -> Result<u32> {
        if logits.is_empty() {
            return Err(Error::Model("empty score row".to_string()));
        }
        if logits.iter().any(|l| l.is_nan()) {
            return Err(Error::Model("score row contains NaN".to_string()));
        }
        if self.temperature <= 0.0 {
            return Ok(argmax(logits) as u32);
        }
        let probs = softmax_with_temperature(logits, self.temperature);
        let sample: f32 = self.rng.r#gen();
        Ok(multinomial_index(&probs, sample) as u32)
    }
}
