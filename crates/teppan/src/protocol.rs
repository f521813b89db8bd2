//! Typed messages exchanged between the executor bridge and the model worker.
//!
//! Every task is tagged with what it asks for and every result carries the
//! same tag back, so the bridge can tell a reply to a step from a reply to a
//! run-to-completion request.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// One prompt in a batch, keyed by the request it belongs to.
///
/// For streaming requests the prompt is the original prompt followed by
/// everything generated so far: the worker recomputes the full prefix each
/// round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub request_id: Uuid,
    pub prompt: String,
}

/// Full generation for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub request_id: Uuid,
    pub generated_text: String,
}

/// One incremental token for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutput {
    pub request_id: Uuid,
    pub token: String,
    pub is_finished: bool,
}

/// Work sent to the model worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Generate each prompt until end of sequence or the length cap
    Complete(Vec<BatchEntry>),
    /// Produce exactly one token per prompt
    Step(Vec<BatchEntry>),
    /// Exit the worker loop
    Stop,
}

/// Replies from the model worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    /// The model is loaded and the worker accepts tasks
    Ready,
    /// The model could not be loaded; the worker has exited
    LoadFailed(String),
    Complete(Vec<Completion>),
    Step(Vec<StepOutput>),
    /// The model failed on this batch; the worker keeps running
    Failed(String),
}

/// The tag carried by tasks and results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Ready,
    Complete,
    Step,
    Stop,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Ready => "ready",
            TaskKind::Complete => "complete",
            TaskKind::Step => "step",
            TaskKind::Stop => "stop",
        };
        f.write_str(name)
    }
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::Complete(_) => TaskKind::Complete,
            Task::Step(_) => TaskKind::Step,
            Task::Stop => TaskKind::Stop,
        }
    }
}

impl TaskResult {
    /// The tag of this result; `None` for failures, which answer any task
    pub fn kind(&self) -> Option<TaskKind> {
        match self {
            TaskResult::Ready | TaskResult::LoadFailed(_) => Some(TaskKind::Ready),
            TaskResult::Complete(_) => Some(TaskKind::Complete),
            TaskResult::Step(_) => Some(TaskKind::Step),
            TaskResult::Failed(_) => None,
        }
    }
}

/// Check that a result set answers exactly the requests of a batch.
///
/// Ordering is irrelevant; missing, unknown or duplicated ids are a
/// protocol violation.
pub(crate) fn ensure_answers<I>(batch: &[BatchEntry], answered: I) -> Result<()>
where
    I: IntoIterator<Item = Uuid>,
{
    let expected: HashSet<Uuid> = batch.iter().map(|entry| entry.request_id).collect();
    let mut seen = HashSet::with_capacity(expected.len());
    for id in answered {
        if !expected.contains(&id) {
            return Err(Error::Protocol(format!("result for request {id} that was not in the batch")));
        }
        if !seen.insert(id) {
            return Err(Error::Protocol(format!("duplicate result for request {id}")));
        }
    }
    if seen.len() != expected.len() {
        return Err(Error::Protocol(format!(
            "expected {} results, got {}",
            expected.len(),
            seen.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(prompt: &str) -> BatchEntry {
        BatchEntry {
            request_id: Uuid::new_v4(),
            prompt: prompt.to_string(),
        }
    }

    #[test]
    fn test_task_kinds() {
        assert_eq!(Task::Complete(vec![]).kind(), TaskKind::Complete);
        assert_eq!(Task::Step(vec![]).kind(), TaskKind::Step);
        assert_eq!(Task::Stop.kind(), TaskKind::Stop);
        assert_eq!(TaskResult::Step(vec![]).kind(), Some(TaskKind::Step));
        assert_eq!(TaskResult::LoadFailed("x".into()).kind(), Some(TaskKind::Ready));
        assert_eq!(TaskResult::Failed("x".into()).kind(), None);
    }

    #[test]
    fn test_ensure_answers_accepts_any_order() {
        let batch = vec![entry("a"), entry("b"), entry("c")];
        let answered = vec![batch[2].request_id, batch[0].request_id, batch[1].request_id];
        assert!(ensure_answers(&batch, answered).is_ok());
    }

    #[test]
    fn test_ensure_answers_rejects_missing() {
        let batch = vec![entry("a"), entry("b")];
        let err = ensure_answers(&batch, vec![batch[0].request_id]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_ensure_answers_rejects_duplicates_and_strangers() {
        let batch = vec![entry("a"), entry("b")];
        let dup = vec![batch[0].request_id, batch[0].request_id];
        assert!(ensure_answers(&batch, dup).is_err());

        let stranger = vec![batch[0].request_id, Uuid::new_v4()];
        assert!(ensure_answers(&batch, stranger).is_err());
    }

    #[test]
    fn test_step_output_serializes_with_request_id() {
        let id = Uuid::nil();
        let output = StepOutput {
            request_id: id,
            token: "lo".into(),
            is_finished: false,
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["token"], "lo");
        assert_eq!(json["request_id"], id.to_string());
    }
}
