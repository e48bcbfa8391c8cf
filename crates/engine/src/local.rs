//! In-process chat engine
//!
//! [`LocalEngine`] puts an inference backend behind the [`ChatEngine`]
//! interface. Requests are queued on a [`BatchScheduler`]; a single engine
//! task drains batches and runs each request on tokio's blocking pool, since
//! token generation is CPU/GPU bound.

use crate::batching::{BatchScheduler, GenerationRequest, RequestSink};
use crate::chat::{
    ChatEngine, ChatRequest, DeltaStream, FinishReason, Response, SamplingParams,
};
use async_trait::async_trait;
use distillr_common::config::{BatchingConfig, GeneratingArgs};
use distillr_common::{DistillError, Result, METRICS};
use distillr_proto::ChatMessage;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One finished sequence
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceOutput {
    pub text: String,
    pub token_ids: Vec<u32>,
    pub finish_reason: FinishReason,
}

/// All sequences generated for one request
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutput {
    pub request_id: String,
    pub prompt_token_ids: Vec<u32>,
    pub outputs: Vec<SequenceOutput>,
}

impl RequestOutput {
    /// One [`Response`] per sequence
    pub fn into_responses(self) -> Vec<Response> {
        let prompt_length = self.prompt_token_ids.len();
        self.outputs
            .into_iter()
            .map(|output| Response {
                response_length: output.token_ids.len(),
                response_text: output.text,
                reasoning_text: None,
                prompt_length,
                finish_reason: output.finish_reason,
            })
            .collect()
    }
}

/// The inference engine a [`LocalEngine`] drives
///
/// Implementations own the model weights and tokenizer. Calls are serialized
/// by the engine, so `generate` may use `&mut self` for its KV cache.
pub trait GenerationBackend: Send + 'static {
    /// Name requests are routed by
    fn model_name(&self) -> &str;

    /// Apply the chat template and tokenize
    fn encode_chat(&self, messages: &[ChatMessage]) -> Result<Vec<u32>>;

    /// Generate one sequence
    ///
    /// `on_delta` receives each newly decoded piece of text and returns
    /// `false` to abort generation.
    fn generate(
        &mut self,
        prompt_ids: &[u32],
        params: &SamplingParams,
        seed: u64,
        on_delta: &mut dyn FnMut(&str) -> bool,
    ) -> Result<SequenceOutput>;
}

type SharedBackend = Arc<Mutex<Box<dyn GenerationBackend>>>;

/// Chat engine backed by an in-process [`GenerationBackend`]
pub struct LocalEngine {
    model_name: String,
    defaults: GeneratingArgs,
    scheduler: Arc<BatchScheduler>,
    worker: JoinHandle<()>,
}

impl LocalEngine {
    /// Start the engine loop on the current tokio runtime
    pub fn start<B: GenerationBackend>(
        backend: B,
        defaults: GeneratingArgs,
        batching: BatchingConfig,
    ) -> Self {
        let model_name = backend.model_name().to_string();
        let boxed: Box<dyn GenerationBackend> = Box::new(backend);
        let backend: SharedBackend = Arc::new(Mutex::new(boxed));
        let scheduler = BatchScheduler::new(batching);

        let worker = tokio::spawn(run_engine_loop(backend, Arc::clone(&scheduler)));

        info!(model = %model_name, "Local engine started");

        Self {
            model_name,
            defaults,
            scheduler,
            worker,
        }
    }

    /// Number of requests waiting for the engine
    pub fn queue_depth(&self) -> usize {
        self.scheduler.queue_depth()
    }

    fn submit(
        &self,
        request: ChatRequest,
        deltas: Option<mpsc::UnboundedSender<Result<String>>>,
    ) -> Result<oneshot::Receiver<Result<RequestOutput>>> {
        if request.messages.is_empty() {
            return Err(DistillError::invalid_input("Chat request has no messages"));
        }

        let params = SamplingParams::resolve(&self.defaults, &request.overrides);
        let (done, rx) = oneshot::channel();
        let generation = GenerationRequest {
            request_id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            messages: request.full_messages(),
            params,
            arrival_time: Instant::now(),
            sink: RequestSink { done, deltas },
        };

        debug!(request_id = %generation.request_id, "Submitting request to local engine");

        self.scheduler.submit(generation).map_err(|(_, err)| err)?;
        Ok(rx)
    }
}

impl Drop for LocalEngine {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        self.worker.abort();
    }
}

#[async_trait]
impl ChatEngine for LocalEngine {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn chat(&self, request: ChatRequest) -> Result<Vec<Response>> {
        let rx = self.submit(request, None)?;
        let output = rx
            .await
            .map_err(|_| DistillError::engine("Local engine dropped the request"))??;
        Ok(output.into_responses())
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<DeltaStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        // The final output is not needed; deltas end when the sender drops.
        let _done = self.submit(request, Some(tx))?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.worker.is_finished() && self.scheduler.is_healthy())
    }
}

/// Main engine processing loop
async fn run_engine_loop(backend: SharedBackend, scheduler: Arc<BatchScheduler>) {
    info!("Starting local engine loop");

    let queue_timeout = scheduler.queue_timeout();

    while let Some(batch) = scheduler.next_batch().await {
        METRICS.engine.batch_size.observe(batch.len() as f64);
        let start = Instant::now();
        let batch_len = batch.len();

        for request in batch.requests {
            let waited = request.arrival_time.elapsed();
            METRICS.engine.queue_time.observe(waited.as_secs_f64());

            if request.sink.is_abandoned() {
                debug!(request_id = %request.request_id, "Caller went away, skipping request");
                continue;
            }

            if waited > queue_timeout {
                warn!(request_id = %request.request_id, ?waited, "Request expired in queue");
                request.sink.fail(DistillError::timeout(format!(
                    "Request waited {:?} in the local engine queue",
                    waited
                )));
                continue;
            }

            let backend = Arc::clone(&backend);
            if let Err(e) = tokio::task::spawn_blocking(move || execute(&backend, request)).await {
                error!("Generation task panicked: {}", e);
            }
        }

        debug!(
            "Processed batch of {} requests in {:?}",
            batch_len,
            start.elapsed()
        );
    }

    info!("Local engine loop stopped");
}

/// Run every sequence of one request and deliver the result
fn execute(backend: &Mutex<Box<dyn GenerationBackend>>, request: GenerationRequest) {
    let GenerationRequest {
        request_id,
        messages,
        params,
        sink,
        ..
    } = request;

    let mut backend = backend.lock();

    let prompt_token_ids = match backend.encode_chat(&messages) {
        Ok(ids) => ids,
        Err(e) => {
            sink.fail(e);
            return;
        }
    };

    let base_seed = params
        .seed
        .unwrap_or_else(|| Uuid::new_v4().as_u64_pair().0);

    let mut outputs = Vec::with_capacity(params.n);
    for index in 0..params.n {
        let deltas = if index == 0 { sink.deltas.as_ref() } else { None };
        let mut on_delta = |delta: &str| match deltas {
            Some(tx) => tx.send(Ok(delta.to_string())).is_ok(),
            None => true,
        };

        let seed = base_seed.wrapping_add(index as u64);
        match backend.generate(&prompt_token_ids, &params, seed, &mut on_delta) {
            Ok(output) => outputs.push(output),
            Err(e) => {
                warn!(request_id = %request_id, "Generation failed: {}", e);
                sink.fail(e);
                return;
            }
        }
    }

    debug!(
        request_id = %request_id,
        sequences = outputs.len(),
        prompt_tokens = prompt_token_ids.len(),
        "Request finished"
    );

    let _ = sink.done.send(Ok(RequestOutput {
        request_id,
        prompt_token_ids,
        outputs,
    }));
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chat::GenerationOverrides;
    use tokio_stream::StreamExt;

    /// Deterministic backend: answers with the last user message, one word per token
    pub(crate) struct EchoBackend {
        pub(crate) name: String,
    }

    impl EchoBackend {
        pub(crate) fn new() -> Self {
            Self { name: "echo".to_string() }
        }
    }

    impl GenerationBackend for EchoBackend {
        fn model_name(&self) -> &str {
            &self.name
        }

        fn encode_chat(&self, messages: &[ChatMessage]) -> Result<Vec<u32>> {
            let text = messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            Ok(text.split_whitespace().map(|w| w.len() as u32).collect())
        }

        fn generate(
            &mut self,
            prompt_ids: &[u32],
            params: &SamplingParams,
            seed: u64,
            on_delta: &mut dyn FnMut(&str) -> bool,
        ) -> Result<SequenceOutput> {
            if prompt_ids.is_empty() {
                return Err(DistillError::invalid_input("empty prompt"));
            }

            let words: Vec<String> = prompt_ids.iter().map(|id| format!("w{} ", id)).collect();
            let mut text = String::new();
            let mut token_ids = Vec::new();
            let mut finish_reason = FinishReason::Stop;

            for (i, word) in words.iter().enumerate() {
                if i >= params.max_new_tokens {
                    finish_reason = FinishReason::Length;
                    break;
                }
                text.push_str(word);
                token_ids.push(seed as u32);
                if !on_delta(word) {
                    finish_reason = FinishReason::Other("abort".into());
                    break;
                }
            }

            Ok(SequenceOutput {
                text,
                token_ids,
                finish_reason,
            })
        }
    }

    fn engine() -> LocalEngine {
        LocalEngine::start(
            EchoBackend::new(),
            GeneratingArgs::default(),
            BatchingConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_chat_passes_backend_output_through() {
        let engine = engine();

        let responses = engine.chat(ChatRequest::user("one two three")).await.unwrap();

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].response_text, "w3 w3 w5 ");
        assert_eq!(responses[0].response_length, 3);
        assert_eq!(responses[0].prompt_length, 3);
        assert_eq!(responses[0].finish_reason, FinishReason::Stop);
        assert!(responses[0].reasoning_text.is_none());
    }

    #[tokio::test]
    async fn test_chat_returns_n_sequences() {
        let engine = engine();
        let request = ChatRequest::user("a bb").with_overrides(GenerationOverrides {
            num_return_sequences: Some(3),
            seed: Some(7),
            ..Default::default()
        });

        let responses = engine.chat(request).await.unwrap();

        assert_eq!(responses.len(), 3);
        assert!(responses.iter().all(|r| r.response_text == "w1 w2 "));
    }

    #[tokio::test]
    async fn test_chat_respects_token_budget() {
        let engine = engine();
        let request = ChatRequest::user("a b c d").with_overrides(GenerationOverrides {
            max_new_tokens: Some(2),
            ..Default::default()
        });

        let responses = engine.chat(request).await.unwrap();
        assert_eq!(responses[0].response_text, "w1 w1 ");
        assert_eq!(responses[0].finish_reason, FinishReason::Length);
    }

    #[tokio::test]
    async fn test_stream_chat_matches_chat() {
        let engine = engine();

        let full = engine.chat(ChatRequest::user("x yy zzz")).await.unwrap();
        let mut stream = engine.stream_chat(ChatRequest::user("x yy zzz")).await.unwrap();

        let mut streamed = String::new();
        while let Some(delta) = stream.next().await {
            streamed.push_str(&delta.unwrap());
        }

        assert_eq!(streamed, full[0].response_text);
    }

    #[tokio::test]
    async fn test_system_prompt_reaches_backend() {
        let engine = engine();

        let responses = engine
            .chat(ChatRequest::user("hi").with_system("be nice"))
            .await
            .unwrap();

        assert_eq!(responses[0].prompt_length, 3);
    }

    #[tokio::test]
    async fn test_backend_error_propagates() {
        let engine = engine();

        let err = engine.chat(ChatRequest::user("   ")).await.unwrap_err();
        assert!(matches!(err, DistillError::InvalidInput(_)));

        let err = engine.chat(ChatRequest::new(Vec::new())).await.unwrap_err();
        assert!(matches!(err, DistillError::InvalidInput(_)));
    }

    /// Echo backend that blocks for `delay` per sequence and counts generations
    struct SlowBackend {
        inner: EchoBackend,
        delay: std::time::Duration,
        calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl GenerationBackend for SlowBackend {
        fn model_name(&self) -> &str {
            self.inner.model_name()
        }

        fn encode_chat(&self, messages: &[ChatMessage]) -> Result<Vec<u32>> {
            self.inner.encode_chat(messages)
        }

        fn generate(
            &mut self,
            prompt_ids: &[u32],
            params: &SamplingParams,
            seed: u64,
            on_delta: &mut dyn FnMut(&str) -> bool,
        ) -> Result<SequenceOutput> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.inner.generate(prompt_ids, params, seed, on_delta)
        }
    }

    fn slow_engine(
        delay_ms: u64,
        queue_timeout_ms: u64,
    ) -> (LocalEngine, Arc<std::sync::atomic::AtomicUsize>) {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let backend = SlowBackend {
            inner: EchoBackend::new(),
            delay: std::time::Duration::from_millis(delay_ms),
            calls: Arc::clone(&calls),
        };
        let engine = LocalEngine::start(
            backend,
            GeneratingArgs::default(),
            BatchingConfig {
                queue_timeout_ms,
                ..BatchingConfig::default()
            },
        );
        (engine, calls)
    }

    #[tokio::test]
    async fn test_request_expires_in_queue() {
        let (engine, calls) = slow_engine(200, 50);

        let (first, second) = tokio::join!(
            engine.chat(ChatRequest::user("one")),
            engine.chat(ChatRequest::user("two"))
        );

        assert_eq!(first.unwrap()[0].response_text, "w3 ");
        assert!(matches!(second, Err(DistillError::Timeout(_))));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_request_is_not_generated() {
        let (engine, calls) = slow_engine(100, 600_000);
        let engine = Arc::new(engine);

        let running = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.chat(ChatRequest::user("first")).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let gave_up = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            engine.chat(ChatRequest::user("second")),
        )
        .await;
        assert!(gave_up.is_err());

        assert!(running.await.unwrap().is_ok());
        let third = engine.chat(ChatRequest::user("third")).await.unwrap();
        assert_eq!(third[0].response_text, "w5 ");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_health_check() {
        let engine = engine();
        assert!(engine.health_check().await.unwrap());
        assert_eq!(engine.model_name(), "echo");
    }
}
