use async_trait::async_trait;

use crate::error::Result;
use crate::stream::TokenStream;

/// # BatchGenerator
///
/// Run-to-completion generation for a set of prompts.
///
/// ## Implementation Notes
///
/// Prompts are admitted together and batched with whatever else is waiting.
/// The caller drives the batches itself until the queue is drained, so a
/// result may be produced by another caller's round; either way each prompt
/// gets exactly its own generated text.
#[async_trait]
pub trait BatchGenerator {
    /// Generate text for every prompt.
    ///
    /// # Returns
    ///
    /// The generated texts in the order of `prompts`. Each text is the prompt
    /// followed by its continuation.
    async fn generate_batch(&self, prompts: Vec<String>) -> Result<Vec<String>>;
}

/// # StreamingGenerator
///
/// Token-by-token generation for a single prompt.
#[async_trait]
pub trait StreamingGenerator {
    /// Admit a prompt and return the stream its tokens are delivered on.
    ///
    /// # Async Behavior
    ///
    /// Returns as soon as the request is admitted. Tokens are produced by the
    /// background scheduling loop and pushed to the stream as they become
    /// available; the stream ends after its terminal event.
    async fn generate_stream(&self, prompt: String) -> Result<TokenStream>;
}
