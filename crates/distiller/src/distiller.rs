//! The distillation loop
//!
//! Every question is sent `roll_out_size` times through the router. Each
//! returned sequence becomes one [`DistillationRecord`] with the reasoning
//! split from the final response.

use crate::dataset::QaPair;
use crate::router::ModelRouter;
use chrono::{DateTime, Utc};
use distillr_common::config::{ClientDescriptor, DistillArgs};
use distillr_common::{DistillError, Result, METRICS};
use distillr_engine::{ChatRequest, FinishReason, GenerationOverrides, Response};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Base delay between attempts; grows linearly with the attempt number
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// One synthetic training example
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistillationRecord {
    pub id: String,
    /// Index of the source pair in the dataset
    pub index: usize,
    pub question: String,
    pub reference_answer: Option<String>,
    pub reasoning: String,
    pub response: String,
    pub model: String,
    pub client_id: String,
    pub rollout: usize,
    /// Position among the sequences returned by one request
    pub sequence: usize,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub finish_reason: FinishReason,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a distillation run
#[derive(Debug, Clone)]
pub struct DistillSummary {
    pub records: usize,
    /// Requests that failed after every attempt
    pub failures: usize,
    pub output_path: PathBuf,
    pub elapsed: Duration,
}

/// Split generated text into `(reasoning, response)`
///
/// Reasoning reported separately by the backend wins. Otherwise a leading
/// `<think>` block is taken as reasoning; an unclosed block is all
/// reasoning. Text with only a closing `</think>` comes from templates that
/// open the block in the prompt, so everything before it is reasoning.
pub fn split_reasoning(text: &str, reasoning: Option<&str>) -> (String, String) {
    if let Some(reasoning) = reasoning.map(str::trim).filter(|r| !r.is_empty()) {
        let (_, response) = split_reasoning(text, None);
        return (reasoning.to_string(), response);
    }

    let trimmed = text.trim_start();
    if let Some(rest) = trimmed.strip_prefix(THINK_OPEN) {
        return match rest.find(THINK_CLOSE) {
            Some(end) => (
                rest[..end].trim().to_string(),
                rest[end + THINK_CLOSE.len()..].trim().to_string(),
            ),
            None => (rest.trim().to_string(), String::new()),
        };
    }

    match text.find(THINK_CLOSE) {
        Some(end) if !text[..end].contains(THINK_OPEN) => (
            text[..end].trim().to_string(),
            text[end + THINK_CLOSE.len()..].trim().to_string(),
        ),
        _ => (String::new(), text.trim().to_string()),
    }
}

/// One (pair, rollout) unit of work
struct WorkItem {
    pair: QaPair,
    rollout: usize,
    request: ChatRequest,
}

/// Drives generation for a whole dataset
pub struct Distiller {
    args: DistillArgs,
    router: Arc<ModelRouter>,
    pairs: Vec<QaPair>,
    model: Option<String>,
    overrides: GenerationOverrides,
}

impl Distiller {
    pub fn new(args: DistillArgs, router: Arc<ModelRouter>, pairs: Vec<QaPair>) -> Self {
        Self {
            args,
            router,
            pairs,
            model: None,
            overrides: GenerationOverrides::default(),
        }
    }

    /// Only route to clients serving `model`
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_overrides(mut self, overrides: GenerationOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Where [`Distiller::distill`] writes the dataset
    pub fn output_file(&self) -> PathBuf {
        self.args.output_dir.join(&self.args.output_path)
    }

    fn work_items(&self) -> Vec<WorkItem> {
        let mut items = Vec::with_capacity(self.pairs.len() * self.args.roll_out_size);
        for pair in &self.pairs {
            for rollout in 0..self.args.roll_out_size {
                let request = ChatRequest::user(pair.question.clone())
                    .with_system(self.args.meta_prompt.clone())
                    .with_overrides(self.overrides.clone());
                items.push(WorkItem {
                    pair: pair.clone(),
                    rollout,
                    request,
                });
            }
        }
        items
    }

    /// Generate records for every pair without writing them
    ///
    /// Returns the records in (pair, rollout, sequence) order and the number
    /// of requests that failed after every attempt.
    pub async fn generate(&self) -> (Vec<DistillationRecord>, usize) {
        let items = self.work_items();
        let total = items.len();
        let semaphore = Arc::new(Semaphore::new(self.args.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        info!(
            pairs = self.pairs.len(),
            roll_out_size = self.args.roll_out_size,
            requests = total,
            max_concurrency = self.args.max_concurrency,
            "Starting distillation"
        );

        for item in items {
            let semaphore = Arc::clone(&semaphore);
            let router = Arc::clone(&self.router);
            let model = self.model.clone();
            let max_try = self.args.max_try.max(1);

            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        chat_with_retry(&router, model.as_deref(), &item.request, max_try).await
                    }
                    Err(_) => Err(DistillError::internal("Concurrency limiter closed")),
                };
                (item, result)
            });
        }

        let mut records = Vec::new();
        let mut failures = 0;
        let mut completed = 0;
        let progress_step = (total / 10).max(1);

        while let Some(joined) = tasks.join_next().await {
            completed += 1;
            match joined {
                Ok((item, Ok((descriptor, responses)))) => {
                    debug!(
                        index = item.pair.index,
                        rollout = item.rollout,
                        client = %descriptor.id,
                        sequences = responses.len(),
                        "Request completed"
                    );
                    records.extend(to_records(&item, &descriptor, responses));
                }
                Ok((item, Err(e))) => {
                    failures += 1;
                    error!(
                        index = item.pair.index,
                        rollout = item.rollout,
                        "Request failed after all attempts: {}",
                        e
                    );
                }
                Err(e) => {
                    failures += 1;
                    error!("Distillation task panicked: {}", e);
                }
            }

            if completed % progress_step == 0 || completed == total {
                info!(completed, total, failures, "Distillation progress");
            }
        }

        records.sort_by_key(|r| (r.index, r.rollout, r.sequence));
        (records, failures)
    }

    /// Generate every record and write the dataset as a JSON array
    pub async fn distill(&self) -> Result<DistillSummary> {
        let start = Instant::now();
        let (records, failures) = self.generate().await;

        let output_path = self.output_file();
        write_records(&output_path, &records).await?;

        let summary = DistillSummary {
            records: records.len(),
            failures,
            output_path,
            elapsed: start.elapsed(),
        };
        info!(
            records = summary.records,
            failures = summary.failures,
            output = %summary.output_path.display(),
            elapsed = ?summary.elapsed,
            "Distillation finished"
        );
        Ok(summary)
    }
}

/// Call a routed client, retrying retryable errors on a freshly selected client
async fn chat_with_retry(
    router: &ModelRouter,
    model: Option<&str>,
    request: &ChatRequest,
    max_try: u32,
) -> Result<(ClientDescriptor, Vec<Response>)> {
    let mut attempt = 0;

    loop {
        attempt += 1;

        let err = match router.acquire(model).await {
            Ok(guard) => {
                METRICS.inference.requests_total.inc();
                METRICS.inference.active_requests.inc();
                let timer = METRICS.inference.request_duration.start_timer();

                let result = guard.engine.chat(request.clone()).await;

                timer.observe_duration();
                METRICS.inference.active_requests.dec();

                match result {
                    Ok(responses) => {
                        router.mark_healthy(guard.id()).await;
                        METRICS.inference.requests_success.inc();
                        for response in &responses {
                            METRICS
                                .inference
                                .completion_tokens_total
                                .inc_by(response.response_length as u64);
                        }
                        if let Some(first) = responses.first() {
                            METRICS
                                .inference
                                .prompt_tokens_total
                                .inc_by(first.prompt_length as u64);
                        }
                        return Ok((guard.descriptor.clone(), responses));
                    }
                    Err(e) => {
                        METRICS.inference.requests_failed.inc();
                        if e.is_retryable() {
                            router.mark_failed(guard.id()).await;
                        }
                        warn!(client = %guard.id(), attempt, "Chat request failed: {}", e);
                        e
                    }
                }
            }
            Err(e) => e,
        };

        if !err.is_retryable() || attempt >= max_try {
            return Err(err);
        }
        tokio::time::sleep(RETRY_BACKOFF * attempt).await;
    }
}

fn to_records(
    item: &WorkItem,
    descriptor: &ClientDescriptor,
    responses: Vec<Response>,
) -> Vec<DistillationRecord> {
    let created_at = Utc::now();
    responses
        .into_iter()
        .enumerate()
        .map(|(sequence, response)| {
            let (reasoning, answer) =
                split_reasoning(&response.response_text, response.reasoning_text.as_deref());
            DistillationRecord {
                id: Uuid::new_v4().to_string(),
                index: item.pair.index,
                question: item.pair.question.clone(),
                reference_answer: item.pair.answer.clone(),
                reasoning,
                response: answer,
                model: descriptor.model.clone(),
                client_id: descriptor.id.clone(),
                rollout: item.rollout,
                sequence,
                prompt_tokens: response.prompt_length,
                completion_tokens: response.response_length,
                finish_reason: response.finish_reason,
                created_at,
            }
        })
        .collect()
}

/// Write `records` as a pretty JSON array, creating parent directories
async fn write_records(path: &Path, records: &[DistillationRecord]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_string_pretty(records)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
