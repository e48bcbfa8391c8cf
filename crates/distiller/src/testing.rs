//! Fake engines for router and distiller tests

use async_trait::async_trait;
use distillr_common::{DistillError, Result};
use distillr_engine::{ChatEngine, ChatRequest, DeltaStream, FinishReason, Response};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Answers `<think>thinking about Q</think>answer to Q` for question Q
pub(crate) struct ScriptedEngine {
    name: String,
    calls: AtomicUsize,
    failures_left: AtomicUsize,
    fatal: bool,
    healthy: AtomicBool,
    separate_reasoning: bool,
    delay: Option<Duration>,
}

impl ScriptedEngine {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            fatal: false,
            healthy: AtomicBool::new(true),
            separate_reasoning: false,
            delay: None,
        }
    }

    /// Fail the first `n` calls with a retryable error
    pub(crate) fn failing(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every call with a non-retryable error
    pub(crate) fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    /// Report reasoning in `reasoning_text` instead of inline tags
    pub(crate) fn separate_reasoning(mut self) -> Self {
        self.separate_reasoning = true;
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatEngine for ScriptedEngine {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: ChatRequest) -> Result<Vec<Response>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.fatal {
            return Err(DistillError::api(400, "bad request"));
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DistillError::connection("connection reset"));
        }

        let question = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let n = request.overrides.num_return_sequences.unwrap_or(1).max(1);

        Ok((0..n)
            .map(|_| {
                let (text, reasoning) = if self.separate_reasoning {
                    (
                        format!("answer to {}", question),
                        Some(format!("thinking about {}", question)),
                    )
                } else {
                    (
                        format!("<think>thinking about {}</think>answer to {}", question, question),
                        None,
                    )
                };
                Response {
                    response_text: text,
                    reasoning_text: reasoning,
                    response_length: 4,
                    prompt_length: request.full_messages().len(),
                    finish_reason: FinishReason::Stop,
                }
            })
            .collect())
    }

    async fn stream_chat(&self, _request: ChatRequest) -> Result<DeltaStream> {
        Err(DistillError::engine("streaming not scripted"))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.healthy.load(Ordering::SeqCst))
    }
}
