//! # Generation Context
//!
//! Per-request state tracking a single generation request from admission to
//! its terminal signal.
//!
//! A context owns the producer half of its sink: a token channel for streaming
//! requests, a one-shot channel for run-to-completion requests submitted
//! through [`crate::AdmissionQueue::submit_awaiting`], or nothing at all for
//! bare submissions whose result is read back through a lookup.
//!
//! Once a context is finished nothing more is written to its sink, and exactly
//! one terminal signal has been sent.

use serde::Serialize;
use uuid::Uuid;

use crate::completion::CompletionSender;
use crate::error::Error;
use crate::stream::{StreamEvent, StreamSender};

/// How a request is processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Generated in one run-to-completion round
    Complete,
    /// Generated one token per scheduling round
    Stream,
}

pub(crate) enum Sink {
    Stream(StreamSender),
    Completion(CompletionSender),
}

pub struct GenerationContext {
    /// Unique identifier for this request
    id: Uuid,

    /// The prompt as submitted
    prompt: String,

    /// Text generated so far (the full text once a completion settles)
    generated: String,

    /// Number of tokens delivered to the sink
    token_count: usize,

    finished: bool,

    mode: Mode,

    sink: Option<Sink>,

    /// Whether the id currently sits in the admission order
    pub(crate) queued: bool,

    /// Rounds lost to an unavailable worker
    pub(crate) retries: u32,
}

impl GenerationContext {
    pub(crate) fn new(prompt: String, mode: Mode, sink: Option<Sink>) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt,
            generated: String::new(),
            token_count: 0,
            finished: false,
            mode,
            sink,
            queued: false,
            retries: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn generated(&self) -> &str {
        &self.generated
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_streaming(&self) -> bool {
        self.mode == Mode::Stream
    }

    /// The text the model sees next round: prompt plus everything generated
    pub fn input_text(&self) -> String {
        let mut text = String::with_capacity(self.prompt.len() + self.generated.len());
        text.push_str(&self.prompt);
        text.push_str(&self.generated);
        text
    }

    /// Deliver one token and count it.
    ///
    /// Returns `false` when nothing was delivered because the context is
    /// already finished or the consumer has gone away.
    pub(crate) fn push_token(&mut self, token: &str) -> bool {
        if self.finished {
            return false;
        }
        if let Some(Sink::Stream(sender)) = &self.sink {
            let event = StreamEvent::Token {
                token: token.to_string(),
                sequence_id: self.id,
            };
            if sender.send(event).is_err() {
                return false;
            }
        }
        self.generated.push_str(token);
        self.token_count += 1;
        true
    }

    /// Finish successfully and send the terminal signal
    pub(crate) fn close(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        match self.sink.take() {
            Some(Sink::Stream(sender)) => {
                let _ = sender.send(StreamEvent::End { sequence_id: self.id });
            }
            Some(Sink::Completion(sender)) => {
                let _ = sender.send(Ok(self.generated.clone()));
            }
            None => {}
        }
    }

    /// Record a full completion and settle the request
    pub(crate) fn complete(&mut self, text: String) {
        if self.finished {
            return;
        }
        self.generated = text;
        self.close();
    }

    /// Finish with an error as the terminal signal
    pub(crate) fn fail(&mut self, error: &Error) {
        if self.finished {
            return;
        }
        self.finished = true;
        match self.sink.take() {
            Some(Sink::Stream(sender)) => {
                let _ = sender.send(StreamEvent::Error {
                    sequence_id: self.id,
                    message: error.to_string(),
                });
            }
            Some(Sink::Completion(sender)) => {
                let _ = sender.send(Err(error.clone()));
            }
            None => {}
        }
    }

    /// Whether the context still owns a sink someone is waiting on
    pub(crate) fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            id: self.id,
            prompt: self.prompt.clone(),
            generated: self.generated.clone(),
            token_count: self.token_count,
            finished: self.finished,
            mode: self.mode,
        }
    }
}

/// A read-only copy of a generation context
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextSnapshot {
    pub id: Uuid,
    pub prompt: String,
    pub generated: String,
    pub token_count: usize,
    pub finished: bool,
    pub mode: Mode,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{mpsc, oneshot};

    fn streaming() -> (GenerationContext, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = GenerationContext::new("Hello".into(), Mode::Stream, Some(Sink::Stream(tx)));
        (ctx, rx)
    }

    #[test]
    fn test_new_contexts_have_unique_ids() {
        let a = GenerationContext::new("a".into(), Mode::Complete, None);
        let b = GenerationContext::new("a".into(), Mode::Complete, None);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.token_count(), 0);
        assert!(!a.is_finished());
        assert!(!a.is_streaming());
    }

    #[test]
    fn test_push_token_delivers_and_counts() {
        let (mut ctx, mut rx) = streaming();
        assert!(ctx.push_token(","));
        assert!(ctx.push_token(" world"));

        assert_eq!(ctx.token_count(), 2);
        assert_eq!(ctx.generated(), ", world");
        assert_eq!(ctx.input_text(), "Hello, world");
        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEvent::Token { token: ",".into(), sequence_id: ctx.id() }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEvent::Token { token: " world".into(), sequence_id: ctx.id() }
        );
    }

    #[test]
    fn test_nothing_is_delivered_after_close() {
        let (mut ctx, mut rx) = streaming();
        ctx.push_token("a");
        ctx.close();
        ctx.close();
        assert!(!ctx.push_token("b"));
        ctx.fail(&Error::ShutDown);

        assert!(ctx.is_finished());
        assert_eq!(ctx.token_count(), 1);
        assert!(matches!(rx.try_recv().unwrap(), StreamEvent::Token { .. }));
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::End { sequence_id: ctx.id() });
        // sink dropped after the single terminal signal
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[test]
    fn test_push_token_reports_departed_client() {
        let (mut ctx, rx) = streaming();
        drop(rx);
        assert!(!ctx.push_token("a"));
        assert_eq!(ctx.token_count(), 0);
    }

    #[test]
    fn test_fail_sends_error_event() {
        let (mut ctx, mut rx) = streaming();
        ctx.fail(&Error::WorkerUnavailable("gone".into()));
        match rx.try_recv().unwrap() {
            StreamEvent::Error { sequence_id, message } => {
                assert_eq!(sequence_id, ctx.id());
                assert!(message.contains("gone"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_complete_resolves_completion_sink() {
        let (tx, rx) = oneshot::channel();
        let mut ctx = GenerationContext::new("p".into(), Mode::Complete, Some(Sink::Completion(tx)));
        ctx.complete("p and more".into());
        assert_eq!(rx.await.unwrap().unwrap(), "p and more");
        assert_eq!(ctx.snapshot().generated, "p and more");
        assert!(ctx.snapshot().finished);
    }
}
