//! # Model Worker
//!
//! The isolated execution unit that owns the loaded model. It runs on its
//! own OS thread, talks to the rest of the pipeline only through the task and
//! result channels, and answers one task at a time.
//!
//! Every round recomputes the full prefix of every sequence; there is no
//! attention cache to carry between rounds.

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::backend::{LanguageModel, Logits, ModelLoader};
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::padding::pad_batch;
use crate::protocol::{BatchEntry, Completion, StepOutput, Task, TaskResult};
use crate::sampling::Sampler;

pub struct ModelWorker<M: LanguageModel> {
    model: M,
    sampler: Sampler,
    max_length: usize,
}

impl<M: LanguageModel> ModelWorker<M> {
    pub fn new(model: M, config: &WorkerConfig) -> Self {
        Self {
            model,
            sampler: Sampler::new(config.temperature, config.seed),
            max_length: config.max_length,
        }
    }

    /// Sample the next token of every sequence
    fn sample_next(&mut self, sequences: &[Vec<u32>]) -> Result<Vec<u32>> {
        let batch = pad_batch(sequences, self.model.pad_token());
        let rows = self.model.forward(&batch)?.into_rows()?;
        if rows.len() != sequences.len() {
            return Err(Error::Model(format!(
                "model returned {} score rows for {} sequences",
                rows.len(),
                sequences.len()
            )));
        }
        rows.iter().map(|row| self.sampler.sample(row)).collect()
    }

    /// Produce exactly one token per prompt.
    ///
    /// A token equal to end of sequence is reported with `is_finished` set.
    pub fn run_one_step(&mut self, batch: &[BatchEntry]) -> Result<Vec<StepOutput>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let sequences = batch
            .iter()
            .map(|entry| self.model.encode(&entry.prompt))
            .collect::<Result<Vec<_>>>()?;
        let next = self.sample_next(&sequences)?;

        let eos = self.model.eos_token();
        batch
            .iter()
            .zip(next)
            .map(|(entry, token)| -> Result<StepOutput> {
                Ok(StepOutput {
                    request_id: entry.request_id,
                    token: self.model.decode(&[token])?,
                    is_finished: token == eos,
                })
            })
            .collect()
    }

    /// Generate every prompt until end of sequence or the length cap.
    ///
    /// All unfinished sequences advance together, one sampled token per
    /// round. The cap counts prompt tokens. Each result is the prompt
    /// followed by the decoded continuation.
    pub fn run_to_completion(&mut self, batch: &[BatchEntry]) -> Result<Vec<Completion>> {
        let mut sequences = batch
            .iter()
            .map(|entry| self.model.encode(&entry.prompt))
            .collect::<Result<Vec<_>>>()?;
        let prompt_lengths: Vec<usize> = sequences.iter().map(Vec::len).collect();
        let mut active: Vec<usize> = (0..sequences.len())
            .filter(|&i| sequences[i].len() < self.max_length)
            .collect();

        let eos = self.model.eos_token();
        while !active.is_empty() {
            let inputs: Vec<Vec<u32>> = active.iter().map(|&i| sequences[i].clone()).collect();
            let next = self.sample_next(&inputs)?;
            let mut still_active = Vec::with_capacity(active.len());
            for (&i, token) in active.iter().zip(next) {
                if token == eos {
                    continue;
                }
                sequences[i].push(token);
                if sequences[i].len() < self.max_length {
                    still_active.push(i);
                }
            }
            active = still_active;
        }

        batch
            .iter()
            .zip(sequences.iter().zip(prompt_lengths))
            .map(|(entry, (tokens, prompt_len))| -> Result<Completion> {
                let continuation = self.model.decode(&tokens[prompt_len..])?;
                Ok(Completion {
                    request_id: entry.request_id,
                    generated_text: format!("{}{}", entry.prompt, continuation),
                })
            })
            .collect()
    }

    /// Answer one task; `None` means the worker should exit
    pub fn handle(&mut self, task: Task) -> Option<TaskResult> {
        let result = match task {
            Task::Complete(batch) => self.run_to_completion(&batch).map(TaskResult::Complete),
            Task::Step(batch) => self.run_one_step(&batch).map(TaskResult::Step),
            Task::Stop => return None,
        };
        Some(result.unwrap_or_else(|e| {
            error!(error = %e, "model failed on batch");
            match e {
                Error::Model(message) => TaskResult::Failed(message),
                other => TaskResult::Failed(other.to_string()),
            }
        }))
    }

    /// Serve tasks until `Stop` arrives or either channel closes
    pub fn run(mut self, mut tasks: mpsc::Receiver<Task>, results: mpsc::Sender<TaskResult>) {
        while let Some(task) = tasks.blocking_recv() {
            let kind = task.kind();
            let Some(result) = self.handle(task) else {
                break;
            };
            debug!(task = %kind, "task done");
            if results.blocking_send(result).is_err() {
                debug!("result channel closed");
                break;
            }
        }
        info!("model worker exiting");
    }
}

/// Start a worker thread: load the model, report readiness, then serve tasks.
///
/// The load outcome is the first message on `results`: [`TaskResult::Ready`]
/// or [`TaskResult::LoadFailed`].
pub(crate) fn spawn_worker<L: ModelLoader>(
    loader: Arc<L>,
    model_id: String,
    config: WorkerConfig,
    tasks: mpsc::Receiver<Task>,
    results: mpsc::Sender<TaskResult>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("teppan-model-worker".to_string())
        .spawn(move || {
            info!(model = %model_id, "loading model");
            let model = match loader.load(&model_id) {
                Ok(model) => model,
                Err(e) => {
                    error!(model = %model_id, error = %e, "model failed to load");
                    let _ = results.blocking_send(TaskResult::LoadFailed(e.to_string()));
                    return;
                }
            };
            if results.blocking_send(TaskResult::Ready).is_err() {
                return;
            }
            info!(model = %model_id, "model worker ready");
            ModelWorker::new(model, &config).run(tasks, results);
        })
        .map_err(|e| Error::WorkerStart(e.to_string()))
}
