//! Chat engine abstraction
//!
//! Every backend (the in-process GGUF engine or a remote OpenAI-compatible
//! server) is driven through [`ChatEngine`], so the router and the distiller
//! never care where a generation actually runs.

use async_trait::async_trait;
use distillr_common::config::GeneratingArgs;
use distillr_common::Result;
use distillr_proto::ChatMessage;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// Fallback completion budget when neither the request nor the config set one
pub const DEFAULT_MAX_NEW_TOKENS: usize = 4096;

/// Incremental text deltas of the first returned sequence
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Why a sequence stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FinishReason {
    /// EOS token or a stop string
    Stop,
    /// Token budget exhausted
    Length,
    /// Backend-specific reason
    Other(String),
}

impl From<&str> for FinishReason {
    fn from(reason: &str) -> Self {
        match reason {
            "stop" | "eos" => FinishReason::Stop,
            "length" => FinishReason::Length,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

impl From<String> for FinishReason {
    fn from(reason: String) -> Self {
        FinishReason::from(reason.as_str())
    }
}

impl From<FinishReason> for String {
    fn from(reason: FinishReason) -> Self {
        reason.to_string()
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinishReason::Stop => write!(f, "stop"),
            FinishReason::Length => write!(f, "length"),
            FinishReason::Other(reason) => write!(f, "{}", reason),
        }
    }
}

/// One generated sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Generated text
    pub response_text: String,

    /// Reasoning reported separately by the backend, if any
    pub reasoning_text: Option<String>,

    /// Generated token count
    pub response_length: usize,

    /// Prompt token count
    pub prompt_length: usize,

    pub finish_reason: FinishReason,
}

/// Per-request sampling overrides; unset fields fall back to the engine defaults
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOverrides {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub repetition_penalty: Option<f64>,
    pub max_new_tokens: Option<usize>,
    pub num_return_sequences: Option<usize>,
    pub stop: Option<Vec<String>>,
    pub seed: Option<u64>,
}

/// Fully resolved sampling parameters for one request
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: usize,
    pub repetition_penalty: f64,
    pub max_new_tokens: usize,
    /// Number of sequences to return
    pub n: usize,
    pub stop: Vec<String>,
    pub skip_special_tokens: bool,
    pub seed: Option<u64>,
}

impl SamplingParams {
    /// Merge request overrides over configured defaults
    ///
    /// `repetition_penalty` and `top_p` must be positive, so a value that
    /// resolves to zero is replaced by 1.0 (disabled).
    pub fn resolve(defaults: &GeneratingArgs, overrides: &GenerationOverrides) -> Self {
        let max_new_tokens = match overrides.max_new_tokens.unwrap_or(defaults.max_new_tokens) {
            0 => DEFAULT_MAX_NEW_TOKENS,
            n => n,
        };

        Self {
            temperature: overrides.temperature.unwrap_or(defaults.temperature),
            top_p: positive_or_one(overrides.top_p.unwrap_or(defaults.top_p)),
            top_k: overrides.top_k.unwrap_or(defaults.top_k),
            repetition_penalty: positive_or_one(
                overrides
                    .repetition_penalty
                    .unwrap_or(defaults.repetition_penalty),
            ),
            max_new_tokens,
            n: overrides
                .num_return_sequences
                .unwrap_or(defaults.num_return_sequences)
                .max(1),
            stop: overrides
                .stop
                .clone()
                .unwrap_or_else(|| defaults.stop.clone()),
            skip_special_tokens: defaults.skip_special_tokens,
            seed: overrides.seed.or(defaults.seed),
        }
    }
}

fn positive_or_one(value: f64) -> f64 {
    if value > 0.0 {
        value
    } else {
        1.0
    }
}

/// A chat generation request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// System prompt placed before `messages`
    pub system: Option<String>,
    pub overrides: GenerationOverrides,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Single-turn request for `prompt`
    pub fn user(prompt: impl Into<String>) -> Self {
        Self::new(vec![ChatMessage::user(prompt)])
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_overrides(mut self, overrides: GenerationOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Messages with the system prompt, if any, prepended
    pub fn full_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if let Some(system) = self.system.as_deref().filter(|s| !s.is_empty()) {
            messages.push(ChatMessage::system(system));
        }
        messages.extend(self.messages.iter().cloned());
        messages
    }
}

/// A backend that turns chat requests into generated sequences
#[async_trait]
pub trait ChatEngine: Send + Sync {
    /// Name of the model this engine serves
    fn model_name(&self) -> &str;

    /// Generate and return one [`Response`] per requested sequence
    async fn chat(&self, request: ChatRequest) -> Result<Vec<Response>>;

    /// Stream text deltas of the first sequence as they are produced
    async fn stream_chat(&self, request: ChatRequest) -> Result<DeltaStream>;

    /// Whether the engine can currently serve requests
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
