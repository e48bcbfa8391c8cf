//! OpenAI-compatible HTTP engine
//!
//! Talks to any server exposing `/chat/completions` and `/models` (vLLM,
//! SGLang, llama.cpp server, hosted APIs).

use crate::chat::{
    ChatEngine, ChatRequest, DeltaStream, FinishReason, Response, SamplingParams,
};
use async_trait::async_trait;
use distillr_common::config::{ClientDescriptor, GeneratingArgs};
use distillr_common::{DistillError, Result};
use distillr_proto::{
    parse_stream_line, ApiErrorBody, ChatCompletionRequest, ChatCompletionResponse, StreamLine,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

/// Chat engine backed by a remote OpenAI-compatible endpoint
pub struct RemoteEngine {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    defaults: GeneratingArgs,
}

fn map_reqwest(e: reqwest::Error) -> DistillError {
    if e.is_timeout() {
        DistillError::timeout(e.to_string())
    } else if e.is_connect() {
        DistillError::connection(e.to_string())
    } else {
        DistillError::Http(e)
    }
}

impl RemoteEngine {
    pub fn new(
        endpoint: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        defaults: GeneratingArgs,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(map_reqwest)?;

        Ok(Self {
            http,
            base_url: endpoint.trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            defaults,
        })
    }

    /// Build an engine for `descriptor`, reading its API key from the environment
    pub fn from_descriptor(
        descriptor: &ClientDescriptor,
        defaults: GeneratingArgs,
        timeout: Duration,
    ) -> Result<Self> {
        let api_key = match &descriptor.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                DistillError::config(format!(
                    "Client {}: environment variable {} is not set",
                    descriptor.id, var
                ))
            })?),
            None => None,
        };

        Self::new(
            &descriptor.endpoint,
            descriptor.model.clone(),
            api_key,
            defaults,
            timeout,
        )
    }

    fn completion_request(&self, request: &ChatRequest, stream: bool) -> ChatCompletionRequest {
        let params = SamplingParams::resolve(&self.defaults, &request.overrides);

        ChatCompletionRequest {
            model: self.model.clone(),
            messages: request.full_messages(),
            max_tokens: Some(params.max_new_tokens),
            temperature: Some(params.temperature),
            top_p: Some(params.top_p),
            // Not part of the OpenAI schema; only sent when the caller asks for it.
            top_k: request.overrides.top_k.filter(|k| *k > 0),
            repetition_penalty: (params.repetition_penalty != 1.0)
                .then_some(params.repetition_penalty),
            n: (params.n > 1).then_some(params.n),
            stop: params.stop,
            seed: params.seed,
            stream,
        }
    }

    fn with_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn post_completion(&self, body: &ChatCompletionRequest) -> Result<reqwest::Response> {
        if body.messages.is_empty() {
            return Err(DistillError::invalid_input("Chat request has no messages"));
        }

        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, model = %self.model, stream = body.stream, "Sending chat completion");

        let response = self
            .with_auth(self.http.post(&url).json(body))
            .send()
            .await
            .map_err(map_reqwest)?;

        check_status(response).await
    }
}

/// Turn a non-2xx response into `DistillError::Api`
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ApiErrorBody>(&text) {
        Ok(body) => body.error.message,
        Err(_) if text.is_empty() => status.to_string(),
        Err(_) => text,
    };
    Err(DistillError::api(status.as_u16(), message))
}

/// Map each choice to a [`Response`]
///
/// Servers only report total usage, so with several choices the completion
/// token count is split evenly between them.
fn into_responses(body: ChatCompletionResponse) -> Vec<Response> {
    let usage = body.usage.unwrap_or_default();
    let mut choices = body.choices;
    choices.sort_by_key(|c| c.index);

    let n = choices.len().max(1);
    choices
        .into_iter()
        .map(|choice| Response {
            response_text: choice.message.content.unwrap_or_default(),
            reasoning_text: choice.message.reasoning_content.filter(|r| !r.is_empty()),
            response_length: usage.completion_tokens / n,
            prompt_length: usage.prompt_tokens,
            finish_reason: choice
                .finish_reason
                .map(FinishReason::from)
                .unwrap_or_else(|| FinishReason::Other("unknown".to_string())),
        })
        .collect()
}

/// Forward SSE deltas of choice 0 to `tx`
///
/// Reasoning deltas are wrapped in `<think>...</think>` so the stream carries
/// the same text a reasoning model emits inline.
async fn pump_sse(response: reqwest::Response, tx: mpsc::UnboundedSender<Result<String>>) {
    let mut bytes = Box::pin(response.bytes_stream());
    let mut buffer: Vec<u8> = Vec::new();
    let mut in_reasoning = false;

    let send = |text: String| tx.send(Ok(text)).is_ok();

    'outer: while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(map_reqwest(e)));
                return;
            }
        };
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);

            let parsed = match parse_stream_line(&line) {
                None => continue,
                Some(Ok(parsed)) => parsed,
                Some(Err(e)) => {
                    warn!("Malformed stream chunk: {}", e);
                    let _ = tx.send(Err(DistillError::Serialization(e)));
                    return;
                }
            };

            let chunk = match parsed {
                StreamLine::Done => break 'outer,
                StreamLine::Chunk(chunk) => chunk,
            };

            for choice in chunk.choices.into_iter().filter(|c| c.index == 0) {
                if let Some(reasoning) = choice.delta.reasoning_content.filter(|r| !r.is_empty()) {
                    let text = if in_reasoning {
                        reasoning
                    } else {
                        in_reasoning = true;
                        format!("<think>{}", reasoning)
                    };
                    if !send(text) {
                        return;
                    }
                }
                if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                    let text = if in_reasoning {
                        in_reasoning = false;
                        format!("</think>{}", content)
                    } else {
                        content
                    };
                    if !send(text) {
                        return;
                    }
                }
            }
        }
    }

    if in_reasoning {
        send("</think>".to_string());
    }
}

#[async_trait]
impl ChatEngine for RemoteEngine {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat(&self, request: ChatRequest) -> Result<Vec<Response>> {
        let body = self.completion_request(&request, false);
        let response = self.post_completion(&body).await?;
        let completion: ChatCompletionResponse = response.json().await.map_err(map_reqwest)?;

        if completion.choices.is_empty() {
            return Err(DistillError::api(200, "Completion returned no choices"));
        }
        Ok(into_responses(completion))
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<DeltaStream> {
        let body = self.completion_request(&request, true);
        let response = self.post_completion(&body).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_sse(response, tx));
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .with_auth(self.http.get(&url))
            .send()
            .await
            .map_err(map_reqwest)?;
        Ok(response.status().is_success())
    }
}
