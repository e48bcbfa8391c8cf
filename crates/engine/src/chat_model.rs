//! Blocking and async facade over a [`ChatEngine`]
//!
//! A [`ChatModel`] owns one background thread running a single persistent
//! tokio event loop. Every engine call, sync or async, runs on that loop:
//! blocking callers submit the call and wait on a oneshot, async callers
//! await the same oneshot. This lets plain threads drive engines whose
//! background tasks must stay on one runtime.

use crate::chat::{ChatEngine, ChatRequest, DeltaStream, Response};
use crate::gguf::GgufBackend;
use crate::local::LocalEngine;
use crate::remote::RemoteEngine;
use distillr_common::config::{ClientDescriptor, InferBackend};
use distillr_common::{DistillError, DistillrConfig, Result};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

const LOOP_THREAD_NAME: &str = "distillr-chat-loop";

/// Build the engine serving `descriptor`
///
/// Local engines spawn their scheduler task, so this must run inside a tokio
/// runtime.
pub fn build_engine(
    descriptor: &ClientDescriptor,
    config: &DistillrConfig,
) -> Result<Arc<dyn ChatEngine>> {
    match descriptor.backend {
        InferBackend::Local => {
            let backend = GgufBackend::load(
                descriptor.model.clone(),
                Path::new(&descriptor.endpoint),
                &config.model,
            )?;
            Ok(Arc::new(LocalEngine::start(
                backend,
                config.generating.clone(),
                config.engine.batching.clone(),
            )))
        }
        InferBackend::Remote => Ok(Arc::new(RemoteEngine::from_descriptor(
            descriptor,
            config.generating.clone(),
            config.request_timeout(),
        )?)),
    }
}

/// Blocking iterator over the text deltas of a streamed chat
pub struct DeltaIter {
    rx: std::sync::mpsc::Receiver<Result<String>>,
}

impl Iterator for DeltaIter {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

/// Chat engine bound to its own event loop thread
pub struct ChatModel {
    engine: Arc<dyn ChatEngine>,
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ChatModel {
    /// Engine for `model.model_name_or_path` using `model.infer_backend`
    ///
    /// A remote model is looked up among the configured clients by model name.
    pub fn new(config: &DistillrConfig) -> Result<Self> {
        let name = &config.model.model_name_or_path;
        let descriptor = config
            .effective_clients()
            .into_iter()
            .find(|c| {
                c.backend == config.model.infer_backend
                    && (c.model == *name || c.endpoint == *name)
            })
            .ok_or_else(|| {
                DistillError::config(format!(
                    "No {} client configured for model {}",
                    config.model.infer_backend, name
                ))
            })?;

        Self::from_descriptor(&descriptor, config)
    }

    pub fn from_descriptor(descriptor: &ClientDescriptor, config: &DistillrConfig) -> Result<Self> {
        let descriptor = descriptor.clone();
        let config = config.clone();
        Self::with_engine(move || build_engine(&descriptor, &config))
    }

    /// Start the event loop and construct the engine inside it
    pub fn with_engine<F>(build: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Arc<dyn ChatEngine>>,
    {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(LOOP_THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));

                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                debug!("Chat event loop stopped");
            })?;

        let handle = handle_rx
            .recv()
            .map_err(|_| DistillError::internal("Event loop thread exited during startup"))??;

        let engine = {
            let _guard = handle.enter();
            build()
        };

        let mut model = Self {
            engine: Arc::new(NullEngine),
            handle,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        };
        // On failure `model` drops here, which stops the loop.
        model.engine = engine?;

        info!(model = %model.engine.model_name(), "Chat model ready");
        Ok(model)
    }

    pub fn model_name(&self) -> &str {
        self.engine.model_name()
    }

    /// The wrapped engine
    pub fn engine(&self) -> Arc<dyn ChatEngine> {
        Arc::clone(&self.engine)
    }

    fn submit(&self, request: ChatRequest) -> oneshot::Receiver<Result<Vec<Response>>> {
        let engine = Arc::clone(&self.engine);
        let (tx, rx) = oneshot::channel();
        self.handle.spawn(async move {
            let _ = tx.send(engine.chat(request).await);
        });
        rx
    }

    /// Generate on the event loop, blocking the calling thread
    ///
    /// Fails when called from inside a tokio runtime; use [`ChatModel::achat`] there.
    pub fn chat(&self, request: ChatRequest) -> Result<Vec<Response>> {
        ensure_blocking_allowed()?;
        self.submit(request)
            .blocking_recv()
            .map_err(|_| DistillError::engine("Chat event loop stopped"))?
    }

    pub async fn achat(&self, request: ChatRequest) -> Result<Vec<Response>> {
        self.submit(request)
            .await
            .map_err(|_| DistillError::engine("Chat event loop stopped"))?
    }

    /// Stream deltas as a blocking iterator
    pub fn stream_chat(&self, request: ChatRequest) -> Result<DeltaIter> {
        ensure_blocking_allowed()?;
        let engine = Arc::clone(&self.engine);
        let (tx, rx) = std::sync::mpsc::channel();

        self.handle.spawn(async move {
            match engine.stream_chat(request).await {
                Ok(mut stream) => {
                    while let Some(delta) = stream.next().await {
                        if tx.send(delta).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                }
            }
        });

        Ok(DeltaIter { rx })
    }

    pub async fn astream_chat(&self, request: ChatRequest) -> Result<DeltaStream> {
        let engine = Arc::clone(&self.engine);
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        self.handle.spawn(async move {
            let mut stream = match engine.stream_chat(request).await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            while let Some(delta) = stream.next().await {
                if tx.send(delta).is_err() {
                    break;
                }
            }
        });

        ready_rx
            .await
            .map_err(|_| DistillError::engine("Chat event loop stopped"))??;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    pub fn health_check(&self) -> Result<bool> {
        ensure_blocking_allowed()?;
        let engine = Arc::clone(&self.engine);
        let (tx, rx) = oneshot::channel();
        self.handle.spawn(async move {
            let _ = tx.send(engine.health_check().await);
        });
        rx.blocking_recv()
            .map_err(|_| DistillError::engine("Chat event loop stopped"))?
    }
}

fn ensure_blocking_allowed() -> Result<()> {
    if Handle::try_current().is_ok() {
        return Err(DistillError::invalid_input(
            "Blocking chat call made from inside an async runtime",
        ));
    }
    Ok(())
}

impl Drop for ChatModel {
    fn drop(&mut self) {
        // Release the engine while the loop is still running so its tasks
        // are aborted on their own runtime.
        self.engine = Arc::new(NullEngine);
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Placeholder engine held while a [`ChatModel`] is being built or torn down
struct NullEngine;

#[async_trait::async_trait]
impl ChatEngine for NullEngine {
    fn model_name(&self) -> &str {
        ""
    }

    async fn chat(&self, _request: ChatRequest) -> Result<Vec<Response>> {
        Err(DistillError::engine("Chat model is not running"))
    }

    async fn stream_chat(&self, _request: ChatRequest) -> Result<DeltaStream> {
        Err(DistillError::engine("Chat model is not running"))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::FinishReason;
    use crate::local::tests::EchoBackend;
    use distillr_common::config::{BatchingConfig, GeneratingArgs};

    fn local_model() -> ChatModel {
        ChatModel::with_engine(|| {
            Ok(Arc::new(LocalEngine::start(
                EchoBackend::new(),
                GeneratingArgs::default(),
                BatchingConfig::default(),
            )) as Arc<dyn ChatEngine>)
        })
        .unwrap()
    }

    /// Reports the thread each call runs on
    struct ThreadProbe;

    #[async_trait::async_trait]
    impl ChatEngine for ThreadProbe {
        fn model_name(&self) -> &str {
            "probe"
        }

        async fn chat(&self, _request: ChatRequest) -> Result<Vec<Response>> {
            let thread = std::thread::current().name().unwrap_or_default().to_string();
            Ok(vec![Response {
                response_text: thread,
                reasoning_text: None,
                response_length: 0,
                prompt_length: 0,
                finish_reason: FinishReason::Stop,
            }])
        }

        async fn stream_chat(&self, _request: ChatRequest) -> Result<DeltaStream> {
            Err(DistillError::engine("streaming not supported"))
        }
    }

    #[test]
    fn test_sync_chat_passes_through() {
        let model = local_model();

        let direct = model.chat(ChatRequest::user("one two")).unwrap();
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].response_text, "w3 w3 ");
        assert_eq!(model.model_name(), "echo");
        assert!(model.health_check().unwrap());
    }

    #[test]
    fn test_sync_stream_chat() {
        let model = local_model();

        let deltas: Vec<String> = model
            .stream_chat(ChatRequest::user("a bb ccc"))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(deltas, vec!["w1 ", "w2 ", "w3 "]);
    }

    #[test]
    fn test_calls_run_on_loop_thread() {
        let model = ChatModel::with_engine(|| Ok(Arc::new(ThreadProbe) as Arc<dyn ChatEngine>)).unwrap();

        let responses = model.chat(ChatRequest::user("where?")).unwrap();
        assert_eq!(responses[0].response_text, LOOP_THREAD_NAME);

        let err = model.stream_chat(ChatRequest::user("x")).unwrap().next().unwrap();
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_async_calls() {
        let model = local_model();

        let responses = model.achat(ChatRequest::user("hello there")).await.unwrap();
        assert_eq!(responses[0].response_text, "w5 w5 ");

        let mut stream = model.astream_chat(ChatRequest::user("hello there")).await.unwrap();
        let mut text = String::new();
        while let Some(delta) = stream.next().await {
            text.push_str(&delta.unwrap());
        }
        assert_eq!(text, responses[0].response_text);

        // Blocking entry points refuse to run inside a runtime.
        assert!(model.chat(ChatRequest::user("hi")).is_err());
    }

    #[test]
    fn test_failed_build_stops_loop() {
        let result = ChatModel::with_engine(|| Err(DistillError::model("no weights")));
        assert!(matches!(result, Err(DistillError::Model(_))));
    }

    #[test]
    fn test_new_requires_matching_client() {
        let config = DistillrConfig::from_yaml_str(
            r#"
model:
  model_name_or_path: other-model
data:
  dataset_path: qa.json
clients:
  - { id: a, endpoint: "http://127.0.0.1:1/v1", model: r1 }
"#,
        )
        .unwrap();

        let err = ChatModel::new(&config).err().unwrap();
        assert!(matches!(err, DistillError::Config(_)));
    }

    #[test]
    fn test_new_remote() {
        let config = DistillrConfig::from_yaml_str(
            r#"
model:
  model_name_or_path: r1
data:
  dataset_path: qa.json
clients:
  - { id: a, endpoint: "http://127.0.0.1:1/v1", model: r1 }
"#,
        )
        .unwrap();

        let model = ChatModel::new(&config).unwrap();
        assert_eq!(model.model_name(), "r1");
        let err = model.chat(ChatRequest::user("hi")).unwrap_err();
        assert!(err.is_retryable());
    }
}
