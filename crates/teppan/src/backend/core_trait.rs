use crate::error::Result;
use crate::padding::PaddedBatch;

/// Next-token scores for a batch: one row per sequence, one column per
/// vocabulary entry.
///
/// Implemented for plain nested vectors and, behind feature flags, for the
/// tensor types of the supported tensor libraries.
pub trait Logits {
    /// Consume the scores and return them row by row
    fn into_rows(self) -> Result<Vec<Vec<f32>>>;
}

impl Logits for Vec<Vec<f32>> {
    fn into_rows(self) -> Result<Vec<Vec<f32>>> {
        Ok(self)
    }
}

/// # LanguageModel
///
/// The capability the model worker needs from a model runtime: a tokenizer
/// and a forward pass producing next-token scores.
///
/// A model lives on the worker thread for its whole life and is only ever
/// called from there, so implementations need not be `Send` or `Sync`.
///
/// ## Forward pass
///
/// The input is a left-padded `(batch, width)` token batch. The output holds
/// one score row per sequence, for the position after its last real token.
pub trait LanguageModel: 'static {
    type Logits: Logits;

    /// Tokenize text
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Turn token ids back into text, skipping special tokens
    fn decode(&self, tokens: &[u32]) -> Result<String>;

    /// The end-of-sequence token id
    fn eos_token(&self) -> u32;

    /// The id used to pad sequences to a common width
    fn pad_token(&self) -> u32;

    /// Score the next token of every sequence in the batch
    fn forward(&mut self, batch: &PaddedBatch) -> Result<Self::Logits>;
}

/// Loads a model from an identifier (a path, a hub id, ...).
///
/// The loader is shared with the executor bridge, which calls it on the
/// worker thread every time the worker is (re)started.
pub trait ModelLoader: Send + Sync + 'static {
    type Model: LanguageModel;

    fn load(&self, model_id: &str) -> Result<Self::Model>;
}

impl<F, M> ModelLoader for F
where
    F: Fn(&str) -> Result<M> + Send + Sync + 'static,
    M: LanguageModel,
{
    type Model = M;

    fn load(&self, model_id: &str) -> Result<M> {
        self(model_id)
    }
}
