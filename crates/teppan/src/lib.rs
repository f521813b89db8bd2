//! # Teppan
//!
//! Batched text generation with real-time token streaming.
//!
//! ## Overview
//!
//! Teppan turns a stream of independent generation requests into rounds of
//! batched model invocations and fans the decoded tokens back out to the
//! clients that asked for them, as they are produced.
//!
//! Key components include:
//!
//! - An admission queue handing out fixed-size batches in arrival order
//! - A model worker owning the loaded model on its own thread
//! - An executor bridge carrying batches to the worker and back
//! - A scheduling loop advancing streaming requests one token per round
//! - Per-request token streams consumed by the requesting task
//!
//! ## Architecture
//!
//! ### Requests
//!
//! Every request is tracked by a generation context keyed by a UUID. Streaming
//! requests get a [`TokenStream`]; run-to-completion requests resolve to the
//! full generated text through [`BatchGenerator::generate_batch`].
//!
//! ### Scheduling
//!
//! Streaming contexts are advanced round-robin: after each step every context
//! that is not finished goes back to the tail of the queue, so any number of
//! concurrent streams share the fixed batch size fairly. A stream ends when
//! the model emits end of sequence or after `max_tokens` tokens.
//!
//! ### Isolation
//!
//! The model never runs on the async runtime. The worker thread receives
//! tagged tasks over a bounded channel and replies over another one; a worker
//! that stops answering is torn down and restarted on the next round.
//!
//! ## Features
//!
//! - **candle** - Accept Candle tensors as model scores
//! - **burn** - Accept Burn tensors as model scores
//!
//! ## Example
//!
//! ```ignore
//! use futures::StreamExt;
//! use teppan::{CharBigramLoader, Engine, EngineConfig, StreamingGenerator, StreamEvent};
//!
//! async fn example() -> teppan::Result<()> {
//!     let engine = Engine::start(EngineConfig::new("corpus.txt"), CharBigramLoader::default()).await?;
//!
//!     let mut stream = engine.generate_stream("Hello, I am".to_string()).await?;
//!     while let Some(event) = stream.next().await {
//!         if let StreamEvent::Token { token, .. } = event {
//!             print!("{}", token);
//!         }
//!     }
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

mod bridge;
mod completion;
mod context;
mod core_trait;
mod engine;
mod handle;
mod queue;
mod scheduler;
mod stream;
mod worker;

pub mod backend;
pub mod config;
pub mod error;
pub mod padding;
pub mod protocol;
pub mod sampling;

pub use backend::{CharBigram, CharBigramLoader, LanguageModel, Logits, ModelLoader};
pub use bridge::ExecutorBridge;
pub use completion::PendingCompletion;
pub use config::{EngineConfig, WorkerConfig};
pub use context::{ContextSnapshot, GenerationContext, Mode};
pub use core_trait::{BatchGenerator, StreamingGenerator};
pub use engine::Engine;
pub use error::{Error, Result};
pub use handle::LoopHandle;
pub use queue::{AdmissionQueue, StepSummary};
pub use stream::{StreamEvent, StreamSender, TokenStream};
pub use worker::ModelWorker;
