//! Quantized GGUF inference with candle

use crate::chat::{FinishReason, SamplingParams};
use crate::chat_template::ChatFormat;
use crate::local::{GenerationBackend, SequenceOutput};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::{quantized_llama, quantized_qwen2};
use distillr_common::config::{DeviceKind, ModelArgs};
use distillr_common::{DistillError, Result};
use distillr_proto::ChatMessage;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

/// Tokens considered by the repetition penalty
const REPEAT_LAST_N: usize = 64;

fn model_err(e: candle_core::Error) -> DistillError {
    DistillError::model(e.to_string())
}

enum Weights {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

impl Weights {
    fn forward(&mut self, input: &Tensor, index_pos: usize) -> candle_core::Result<Tensor> {
        match self {
            Weights::Llama(w) => w.forward(input, index_pos),
            Weights::Qwen2(w) => w.forward(input, index_pos),
        }
    }
}

/// Pick the compute device, falling back to CPU when CUDA is unavailable
pub fn select_device(kind: DeviceKind, cuda_device_id: usize) -> Device {
    match kind {
        DeviceKind::Cpu => Device::Cpu,
        DeviceKind::Cuda => match Device::new_cuda(cuda_device_id) {
            Ok(device) => {
                info!(cuda_device_id, "Using CUDA device");
                device
            }
            Err(e) => {
                warn!(error = %e, "CUDA unavailable, falling back to CPU");
                Device::Cpu
            }
        },
    }
}

/// A quantized Llama-family or Qwen2 model loaded from a GGUF file
pub struct GgufBackend {
    model_name: String,
    weights: Weights,
    tokenizer: Tokenizer,
    format: ChatFormat,
    stop_ids: HashSet<u32>,
    device: Device,
    max_model_len: usize,
}

impl GgufBackend {
    /// Load weights from `path` and the tokenizer from `tokenizer_path` or a
    /// `tokenizer.json` next to the model file
    pub fn load(model_name: impl Into<String>, path: &Path, args: &ModelArgs) -> Result<Self> {
        let model_name = model_name.into();
        let device = select_device(args.device, args.cuda_device_id);

        let mut file = std::fs::File::open(path).map_err(|e| {
            DistillError::model(format!("Failed to open {}: {}", path.display(), e))
        })?;
        let content = gguf_file::Content::read(&mut file).map_err(model_err)?;

        let arch = match content.metadata.get("general.architecture") {
            Some(gguf_file::Value::String(s)) => s.clone(),
            _ => "llama".to_string(),
        };
        info!(model = %model_name, path = %path.display(), architecture = %arch, "Loading GGUF model");

        let weights = match arch.as_str() {
            "qwen2" => Weights::Qwen2(
                quantized_qwen2::ModelWeights::from_gguf(content, &mut file, &device)
                    .map_err(model_err)?,
            ),
            _ => Weights::Llama(
                quantized_llama::ModelWeights::from_gguf(content, &mut file, &device)
                    .map_err(model_err)?,
            ),
        };

        let tokenizer_path = args
            .tokenizer_path
            .clone()
            .unwrap_or_else(|| default_tokenizer_path(path));
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            DistillError::tokenizer(format!(
                "Failed to load {}: {}",
                tokenizer_path.display(),
                e
            ))
        })?;

        let format = match &args.chat_format {
            Some(name) => name.parse()?,
            None => ChatFormat::detect(&arch, |t| tokenizer.token_to_id(t).is_some()),
        };
        let stop_ids = format
            .stop_tokens()
            .iter()
            .filter_map(|t| tokenizer.token_to_id(t))
            .collect();

        info!(model = %model_name, chat_format = ?format, "GGUF model loaded");

        Ok(Self {
            model_name,
            weights,
            tokenizer,
            format,
            stop_ids,
            device,
            max_model_len: args.max_model_len,
        })
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| DistillError::tokenizer(e.to_string()))
    }
}

fn default_tokenizer_path(model_path: &Path) -> PathBuf {
    model_path.with_file_name("tokenizer.json")
}

fn sampling(params: &SamplingParams) -> Sampling {
    if params.temperature <= 0.0 {
        return Sampling::ArgMax;
    }
    let temperature = params.temperature;
    match (params.top_k, params.top_p < 1.0) {
        (0, false) => Sampling::All { temperature },
        (0, true) => Sampling::TopP {
            p: params.top_p,
            temperature,
        },
        (k, false) => Sampling::TopK { k, temperature },
        (k, true) => Sampling::TopKThenTopP {
            k,
            p: params.top_p,
            temperature,
        },
    }
}

/// Byte offset of the earliest stop string in `text`
fn find_stop(text: &str, stops: &[String]) -> Option<usize> {
    stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
}

/// Largest char boundary of `text` at or below `index`
fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Decodes generated tokens a few at a time
///
/// Only the tokens since the last emitted piece are decoded, together with
/// the piece before them so tokenizers that strip leading spaces stay
/// consistent. A piece ending in an incomplete UTF-8 sequence is held until
/// a later token completes it.
#[derive(Debug, Default)]
struct IncrementalDecoder {
    prev_index: usize,
    current_index: usize,
}

impl IncrementalDecoder {
    fn step(
        &mut self,
        tokens: &[u32],
        decode: impl Fn(&[u32]) -> Result<String>,
    ) -> Result<Option<String>> {
        let prev_text = if self.current_index > self.prev_index {
            decode(&tokens[self.prev_index..self.current_index])?
        } else {
            String::new()
        };
        let text = decode(&tokens[self.prev_index..])?;

        if text.len() > prev_text.len()
            && text.is_char_boundary(prev_text.len())
            && !text.ends_with('\u{FFFD}')
        {
            self.prev_index = self.current_index;
            self.current_index = tokens.len();
            Ok(Some(text[prev_text.len()..].to_string()))
        } else {
            Ok(None)
        }
    }

    /// Whatever is still held back once generation ends
    fn rest(&self, tokens: &[u32], decode: impl Fn(&[u32]) -> Result<String>) -> Result<String> {
        if tokens.len() <= self.current_index {
            return Ok(String::new());
        }
        let prev_text = if self.current_index > self.prev_index {
            decode(&tokens[self.prev_index..self.current_index])?
        } else {
            String::new()
        };
        let text = decode(&tokens[self.prev_index..])?;
        Ok(text
            .get(prev_text.len()..)
            .map(str::to_string)
            .unwrap_or_default())
    }
}

fn continue_input(input: &mut Tensor, next: u32, device: &Device) -> Result<()> {
    *input = Tensor::new(&[next], device)
        .and_then(|t| t.unsqueeze(0))
        .map_err(model_err)?;
    Ok(())
}

impl GenerationBackend for GgufBackend {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn encode_chat(&self, messages: &[ChatMessage]) -> Result<Vec<u32>> {
        let prompt = self.format.render(messages);
        let encoding = self
            .tokenizer
            .encode(prompt, false)
            .map_err(|e| DistillError::tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn generate(
        &mut self,
        prompt_ids: &[u32],
        params: &SamplingParams,
        seed: u64,
        on_delta: &mut dyn FnMut(&str) -> bool,
    ) -> Result<SequenceOutput> {
        if prompt_ids.is_empty() {
            return Err(DistillError::invalid_input("Prompt encoded to zero tokens"));
        }
        if prompt_ids.len() >= self.max_model_len {
            return Err(DistillError::invalid_input(format!(
                "Prompt has {} tokens, model limit is {}",
                prompt_ids.len(),
                self.max_model_len
            )));
        }

        let budget = params
            .max_new_tokens
            .min(self.max_model_len - prompt_ids.len());
        // Text that could still turn into a stop string is held back.
        let holdback = params
            .stop
            .iter()
            .map(|s| s.len().saturating_sub(1))
            .max()
            .unwrap_or(0);

        let mut processor = LogitsProcessor::from_sampling(seed, sampling(params));
        let mut decoder = IncrementalDecoder::default();
        let mut token_ids: Vec<u32> = Vec::new();
        let mut text = String::new();
        let mut emitted = 0;
        let mut finish_reason = FinishReason::Length;
        let mut hit_stop_string = false;

        let mut input = Tensor::new(prompt_ids, &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(model_err)?;
        let mut pos = 0;

        for _ in 0..budget {
            let logits = self
                .weights
                .forward(&input, pos)
                .and_then(|l| l.squeeze(0))
                .and_then(|l| l.to_dtype(DType::F32))
                .map_err(model_err)?;
            pos += input.dim(1).map_err(model_err)?;

            let logits = if params.repetition_penalty == 1.0 {
                logits
            } else {
                let start = token_ids.len().saturating_sub(REPEAT_LAST_N);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    params.repetition_penalty as f32,
                    &token_ids[start..],
                )
                .map_err(model_err)?
            };

            let next = processor.sample(&logits).map_err(model_err)?;
            if self.stop_ids.contains(&next) {
                finish_reason = FinishReason::Stop;
                break;
            }
            token_ids.push(next);

            let skip = params.skip_special_tokens;
            if let Some(piece) = decoder.step(&token_ids, |ids| self.decode(ids, skip))? {
                let scan_from = floor_char_boundary(&text, text.len().saturating_sub(holdback));
                text.push_str(&piece);

                if let Some(at) = find_stop(&text[scan_from..], &params.stop) {
                    text.truncate(scan_from + at);
                    finish_reason = FinishReason::Stop;
                    hit_stop_string = true;
                    break;
                }

                let safe = floor_char_boundary(&text, text.len().saturating_sub(holdback));
                if safe > emitted {
                    if !on_delta(&text[emitted..safe]) {
                        finish_reason = FinishReason::Other("abort".to_string());
                        break;
                    }
                    emitted = safe;
                }
            }

            continue_input(&mut input, next, &self.device)?;
        }

        if !hit_stop_string {
            let skip = params.skip_special_tokens;
            text.push_str(&decoder.rest(&token_ids, |ids| self.decode(ids, skip))?);
        }

        if text.len() > emitted && text.is_char_boundary(emitted) {
            on_delta(&text[emitted..]);
        }

        debug!(
            prompt_tokens = prompt_ids.len(),
            completion_tokens = token_ids.len(),
            finish_reason = %finish_reason,
            "Sequence generated"
        );

        Ok(SequenceOutput {
            text,
            token_ids,
            finish_reason,
        })
    }
}
