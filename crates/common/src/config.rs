//! Configuration structures for Distillr
//!
//! This module defines all configuration types used by the engines, the router
//! and the distiller. Configurations are loaded from YAML files and can be
//! overridden by `DISTILLR__SECTION__FIELD` environment variables.

use crate::error::{DistillError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for a distillation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistillrConfig {
    /// Model configuration
    pub model: ModelArgs,

    /// Default sampling parameters
    #[serde(default)]
    pub generating: GeneratingArgs,

    /// Dataset configuration
    pub data: DataArgs,

    /// Distillation run configuration
    #[serde(default)]
    pub distill: DistillArgs,

    /// Model backends available to the router
    #[serde(default)]
    pub clients: Vec<ClientDescriptor>,

    /// Router configuration
    #[serde(default)]
    pub router: RouterConfig,

    /// Local engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Which kind of engine serves a model
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InferBackend {
    /// In-process GGUF inference
    Local,

    /// OpenAI-compatible HTTP endpoint
    Remote,
}

impl Default for InferBackend {
    fn default() -> Self {
        InferBackend::Remote
    }
}

impl std::fmt::Display for InferBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InferBackend::Local => write!(f, "local"),
            InferBackend::Remote => write!(f, "remote"),
        }
    }
}

/// Compute device for the local engine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

impl Default for DeviceKind {
    fn default() -> Self {
        DeviceKind::Cpu
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArgs {
    /// Path to a GGUF file (local) or the served model name (remote)
    pub model_name_or_path: String,

    /// Backend used for the implied default client
    #[serde(default)]
    pub infer_backend: InferBackend,

    /// Maximum prompt + completion length for the local engine
    #[serde(default = "default_max_model_len")]
    pub max_model_len: usize,

    /// Compute device for the local engine
    #[serde(default)]
    pub device: DeviceKind,

    /// CUDA ordinal when `device` is `cuda`
    #[serde(default)]
    pub cuda_device_id: usize,

    /// Explicit `tokenizer.json`; defaults to one next to the GGUF file
    pub tokenizer_path: Option<PathBuf>,

    /// Chat template override (`chatml`, `llama3`, `llama2`, `plain`)
    pub chat_format: Option<String>,
}

/// Default sampling parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratingArgs {
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_top_p")]
    pub top_p: f64,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f64,

    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    #[serde(default = "default_num_return_sequences")]
    pub num_return_sequences: usize,

    /// Stop strings applied to every request
    #[serde(default)]
    pub stop: Vec<String>,

    #[serde(default = "default_true")]
    pub skip_special_tokens: bool,

    /// Sampling seed (local engine only)
    pub seed: Option<u64>,
}

impl Default for GeneratingArgs {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            repetition_penalty: default_repetition_penalty(),
            max_new_tokens: default_max_new_tokens(),
            num_return_sequences: default_num_return_sequences(),
            stop: Vec::new(),
            skip_special_tokens: true,
            seed: None,
        }
    }
}

/// Dataset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataArgs {
    /// `.json` (array) or `.jsonl` file of question/answer rows
    pub dataset_path: PathBuf,

    #[serde(default = "default_question_field")]
    pub question_field: String,

    #[serde(default = "default_answer_field")]
    pub answer_field: String,

    /// Only distil the first N rows
    pub max_samples: Option<usize>,
}

/// Synthetic data generation method
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DistillMethod {
    /// One chat call per rollout, reasoning split from the response
    Basic,
}

impl Default for DistillMethod {
    fn default() -> Self {
        DistillMethod::Basic
    }
}

/// Distillation run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistillArgs {
    #[serde(default)]
    pub method: DistillMethod,

    /// Directory the synthetic dataset is written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// File name (or path relative to `output_dir`) of the synthetic dataset
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,

    /// System prompt sent with every question; empty disables it
    #[serde(default)]
    pub meta_prompt: String,

    /// Independent generations per question
    #[serde(default = "default_roll_out_size")]
    pub roll_out_size: usize,

    /// Maximum requests in flight
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Attempts per request, including the first
    #[serde(default = "default_max_try")]
    pub max_try: u32,
}

impl Default for DistillArgs {
    fn default() -> Self {
        Self {
            method: DistillMethod::Basic,
            output_dir: default_output_dir(),
            output_path: default_output_path(),
            meta_prompt: String::new(),
            roll_out_size: default_roll_out_size(),
            max_concurrency: default_max_concurrency(),
            max_try: default_max_try(),
        }
    }
}

/// A backend the router can send requests to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientDescriptor {
    /// Unique client identifier
    pub id: String,

    /// Base URL (remote) or GGUF path (local)
    pub endpoint: String,

    /// Model name requests are routed by
    pub model: String,

    #[serde(default)]
    pub backend: InferBackend,

    /// Environment variable holding the bearer token
    pub api_key_env: Option<String>,

    /// Relative capacity; higher weights receive more requests
    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Health check interval in seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Consecutive failures before a client is marked unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval(),
            failure_threshold: default_failure_threshold(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Local engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub batching: BatchingConfig,
}

/// Batching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Maximum batch size
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Batching window in milliseconds
    #[serde(default = "default_batching_window")]
    pub batching_window_ms: u64,

    /// Maximum queue size
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// How long a request may wait in the queue before it is failed
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            batching_window_ms: default_batching_window(),
            max_queue_size: default_max_queue_size(),
            queue_timeout_ms: default_queue_timeout(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub structured_logging: bool,

    /// Write Prometheus metrics next to the output dataset
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            structured_logging: false,
            enable_metrics: true,
        }
    }
}

/// Default value functions
fn default_max_model_len() -> usize {
    4096
}

fn default_temperature() -> f64 {
    0.95
}

fn default_top_p() -> f64 {
    0.7
}

fn default_top_k() -> usize {
    50
}

fn default_repetition_penalty() -> f64 {
    1.0
}

fn default_max_new_tokens() -> usize {
    4096
}

fn default_num_return_sequences() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_question_field() -> String {
    "question".to_string()
}

fn default_answer_field() -> String {
    "answer".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_output_path() -> PathBuf {
    PathBuf::from("synthetic_dataset.json")
}

fn default_roll_out_size() -> usize {
    1
}

fn default_max_concurrency() -> usize {
    8
}

fn default_max_try() -> u32 {
    3
}

fn default_weight() -> u32 {
    1
}

fn default_health_check_interval() -> u64 {
    5
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    300
}

fn default_max_batch_size() -> usize {
    8
}

fn default_batching_window() -> u64 {
    5
}

fn default_max_queue_size() -> usize {
    512
}

fn default_queue_timeout() -> u64 {
    600_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DistillrConfig {
    /// Load configuration from a YAML file, applying environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DistillError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix("DISTILLR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| {
                DistillError::Config(format!(
                    "Failed to read config file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let config: DistillrConfig = settings.try_deserialize().map_err(|e| {
            DistillError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML text without environment overrides
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: DistillrConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.model.model_name_or_path.trim().is_empty() {
            return Err(DistillError::config("model.model_name_or_path is empty"));
        }

        let clients = self.effective_clients();
        if clients.is_empty() {
            return Err(DistillError::config(
                "No clients configured and model.infer_backend is not local",
            ));
        }

        let mut seen = HashSet::new();
        for client in &clients {
            if !seen.insert(client.id.as_str()) {
                return Err(DistillError::config(format!(
                    "Duplicate client id: {}",
                    client.id
                )));
            }
            if client.endpoint.trim().is_empty() {
                return Err(DistillError::config(format!(
                    "Client {} has an empty endpoint",
                    client.id
                )));
            }
            if client.weight == 0 {
                return Err(DistillError::config(format!(
                    "Client {} has weight 0",
                    client.id
                )));
            }
        }

        let gen = &self.generating;
        if gen.temperature < 0.0 {
            return Err(DistillError::config("generating.temperature must be >= 0"));
        }
        if !(gen.top_p > 0.0 && gen.top_p <= 1.0) {
            return Err(DistillError::config("generating.top_p must be in (0, 1]"));
        }
        if gen.num_return_sequences == 0 {
            return Err(DistillError::config(
                "generating.num_return_sequences must be >= 1",
            ));
        }

        let distill = &self.distill;
        if distill.roll_out_size == 0 {
            return Err(DistillError::config("distill.roll_out_size must be >= 1"));
        }
        if distill.max_concurrency == 0 {
            return Err(DistillError::config("distill.max_concurrency must be >= 1"));
        }
        if distill.max_try == 0 {
            return Err(DistillError::config("distill.max_try must be >= 1"));
        }

        let batching = &self.engine.batching;
        if batching.max_batch_size == 0 || batching.max_queue_size == 0 {
            return Err(DistillError::config(
                "engine.batching sizes must be greater than zero",
            ));
        }

        Ok(())
    }

    /// Configured clients plus the implied local client, if any
    ///
    /// With `infer_backend: local` and no client pointing at
    /// `model_name_or_path`, a client with id `local` is added for it.
    pub fn effective_clients(&self) -> Vec<ClientDescriptor> {
        let mut clients = self.clients.clone();

        if self.model.infer_backend == InferBackend::Local
            && !clients
                .iter()
                .any(|c| c.backend == InferBackend::Local && c.endpoint == self.model.model_name_or_path)
        {
            clients.push(ClientDescriptor {
                id: "local".to_string(),
                endpoint: self.model.model_name_or_path.clone(),
                model: self.model.model_name_or_path.clone(),
                backend: InferBackend::Local,
                api_key_env: None,
                weight: default_weight(),
            });
        }

        clients
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.router.request_timeout_secs)
    }

    /// Get batching window as Duration
    pub fn batching_window(&self) -> Duration {
        Duration::from_millis(self.engine.batching.batching_window_ms)
    }

    /// Full path of the synthetic dataset file
    pub fn output_file(&self) -> PathBuf {
        self.distill.output_dir.join(&self.distill.output_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const REMOTE_CONFIG: &str = r#"
model:
  model_name_or_path: deepseek-r1
data:
  dataset_path: data/qa.json
distill:
  roll_out_size: 2
  meta_prompt: "Think step by step."
clients:
  - id: r1-a
    endpoint: http://localhost:8000/v1
    model: deepseek-r1
  - id: r1-b
    endpoint: http://localhost:8001/v1
    model: deepseek-r1
    weight: 2
"#;

    #[test]
    fn test_config_defaults() {
        let config = DistillrConfig::from_yaml_str(REMOTE_CONFIG).unwrap();

        assert_eq!(config.model.infer_backend, InferBackend::Remote);
        assert_eq!(config.generating.max_new_tokens, 4096);
        assert_eq!(config.generating.num_return_sequences, 1);
        assert_eq!(config.distill.method, DistillMethod::Basic);
        assert_eq!(config.distill.max_try, 3);
        assert_eq!(config.router.failure_threshold, 3);
        assert_eq!(config.clients[1].weight, 2);
        assert_eq!(config.clients[0].backend, InferBackend::Remote);
        assert_eq!(
            config.output_file(),
            PathBuf::from("output").join("synthetic_dataset.json")
        );
    }

    #[test]
    fn test_config_validation_missing_clients() {
        let yaml = r#"
model:
  model_name_or_path: some-model
data:
  dataset_path: qa.json
"#;
        assert!(DistillrConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_implied_local_client() {
        let yaml = r#"
model:
  model_name_or_path: /models/qwen.gguf
  infer_backend: local
data:
  dataset_path: qa.jsonl
"#;
        let config = DistillrConfig::from_yaml_str(yaml).unwrap();
        let clients = config.effective_clients();

        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].id, "local");
        assert_eq!(clients[0].backend, InferBackend::Local);
        assert_eq!(clients[0].endpoint, "/models/qwen.gguf");
    }

    #[test]
    fn test_config_validation_duplicate_ids() {
        let yaml = r#"
model:
  model_name_or_path: m
data:
  dataset_path: qa.json
clients:
  - { id: a, endpoint: "http://x/v1", model: m }
  - { id: a, endpoint: "http://y/v1", model: m }
"#;
        let err = DistillrConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate client id"));
    }

    #[test]
    fn test_config_validation_bad_rollout() {
        let yaml = r#"
model:
  model_name_or_path: m
data:
  dataset_path: qa.json
distill:
  roll_out_size: 0
clients:
  - { id: a, endpoint: "http://x/v1", model: m }
"#;
        assert!(DistillrConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_unknown_method_rejected() {
        let yaml = r#"
model:
  model_name_or_path: m
data:
  dataset_path: qa.json
distill:
  method: tree-search
clients:
  - { id: a, endpoint: "http://x/v1", model: m }
"#;
        assert!(DistillrConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(REMOTE_CONFIG.as_bytes()).unwrap();

        let config = DistillrConfig::from_file(file.path()).unwrap();
        assert_eq!(config.clients.len(), 2);
        assert_eq!(config.distill.roll_out_size, 2);
        assert_eq!(config.distill.meta_prompt, "Think step by step.");

        // Environment variables override the file.
        std::env::set_var("DISTILLR__DISTILL__ROLL_OUT_SIZE", "4");
        std::env::set_var("DISTILLR__DISTILL__META_PROMPT", "Think.");
        let overridden = DistillrConfig::from_file(file.path());
        std::env::remove_var("DISTILLR__DISTILL__ROLL_OUT_SIZE");
        std::env::remove_var("DISTILLR__DISTILL__META_PROMPT");

        let overridden = overridden.unwrap();
        assert_eq!(overridden.distill.roll_out_size, 4);
        assert_eq!(overridden.distill.meta_prompt, "Think.");
        assert_eq!(overridden.clients.len(), 2);
    }

    #[test]
    fn test_from_file_missing() {
        let err = DistillrConfig::from_file("/nonexistent/distill.yaml").unwrap_err();
        assert!(matches!(err, DistillError::Config(_)));
    }
}
