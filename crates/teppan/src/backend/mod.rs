//! # Model Backends
//!
//! The model runtime is an external collaborator: the pipeline only needs a
//! [`LanguageModel`] that tokenizes text and scores the next token of a
//! padded batch, and a [`ModelLoader`] that builds one from a model
//! identifier.
//!
//! ## Feature Flags
//!
//! - `candle`: scores may be returned as a Candle `Tensor`
//! - `burn`: scores may be returned as a Burn `Tensor<B, 2>`
//!
//! [`CharBigram`] is a small self-contained model trained from a text corpus,
//! enough to run the whole pipeline without a tensor library.

mod bigram;
mod core_trait;

#[cfg_attr(docsrs, doc(cfg(feature = "candle")))]
#[cfg(feature = "candle")]
/// Candle tensors as next-token scores.
///
/// This module is only available when the `candle` feature flag is enabled.
pub mod candle;

#[cfg_attr(docsrs, doc(cfg(feature = "burn")))]
#[cfg(feature = "burn")]
/// Burn tensors as next-token scores.
///
/// This module is only available when the `burn` feature flag is enabled.
pub mod burn;

#[cfg(test)]
pub(crate) mod mock;

pub use bigram::{CharBigram, CharBigramLoader};
pub use core_trait::{LanguageModel, Logits, ModelLoader};
