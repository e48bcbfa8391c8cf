//! Request queue for the local engine
//!
//! Generation requests are pushed onto a lock-free queue and drained by the
//! engine loop in batches. A batch is dispatched as soon as `max_batch_size`
//! requests are queued or the batching window expires, whichever comes first.

use crate::chat::SamplingParams;
use crate::local::RequestOutput;
use crossbeam::queue::SegQueue;
use distillr_common::config::BatchingConfig;
use distillr_common::{DistillError, Result, METRICS};
use distillr_proto::ChatMessage;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::timeout;
use tracing::{debug, trace};

/// Request identifier
pub type RequestId = String;

/// Where the engine delivers a request's result
#[derive(Debug)]
pub struct RequestSink {
    /// Final output of all sequences
    pub done: oneshot::Sender<Result<RequestOutput>>,

    /// Text deltas of the first sequence, for streaming callers
    pub deltas: Option<mpsc::UnboundedSender<Result<String>>>,
}

impl RequestSink {
    /// True when nobody is waiting for either the final output or deltas
    pub fn is_abandoned(&self) -> bool {
        self.done.is_closed() && self.deltas.as_ref().map_or(true, |tx| tx.is_closed())
    }

    /// Deliver a failure to every listener
    pub fn fail(self, err: DistillError) {
        if let Some(tx) = &self.deltas {
            let _ = tx.send(Err(DistillError::engine(err.to_string())));
        }
        let _ = self.done.send(Err(err));
    }
}

/// A single generation request waiting to be batched
#[derive(Debug)]
pub struct GenerationRequest {
    /// Unique request identifier
    pub request_id: RequestId,

    /// Conversation, system prompt included
    pub messages: Vec<ChatMessage>,

    /// Resolved sampling parameters
    pub params: SamplingParams,

    /// Request arrival time
    pub arrival_time: Instant,

    pub sink: RequestSink,
}

/// Batched requests ready for processing
#[derive(Debug)]
pub struct RequestBatch {
    /// Requests in this batch
    pub requests: Vec<GenerationRequest>,

    /// Batch creation time
    pub creation_time: Instant,
}

impl RequestBatch {
    /// Create a new empty batch
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
            creation_time: Instant::now(),
        }
    }

    /// Add a request to the batch
    pub fn add(&mut self, request: GenerationRequest) {
        self.requests.push(request);
    }

    /// Get the batch size
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Check if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Get the age of the batch (time since creation)
    pub fn age(&self) -> Duration {
        self.creation_time.elapsed()
    }
}

impl Default for RequestBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Batch scheduler with configurable window
///
/// Rejects new requests once `max_queue_size` requests are waiting.
pub struct BatchScheduler {
    /// Configuration
    config: BatchingConfig,

    /// Request queue (lock-free)
    queue: SegQueue<GenerationRequest>,

    /// Current queue depth
    queue_depth: AtomicUsize,

    /// Shutdown flag
    shutdown: AtomicBool,

    /// Notification for new requests
    notify: Notify,
}

impl BatchScheduler {
    /// Create a new batch scheduler
    pub fn new(config: BatchingConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue: SegQueue::new(),
            queue_depth: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// Submit a request to the scheduler
    ///
    /// Returns the request back inside the error if the queue is full or the
    /// scheduler has shut down.
    pub fn submit(&self, request: GenerationRequest) -> std::result::Result<(), (GenerationRequest, DistillError)> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err((request, DistillError::engine("Engine is shutting down")));
        }

        if self.queue_depth.load(Ordering::Acquire) >= self.config.max_queue_size {
            return Err((
                request,
                DistillError::queue_full("Request queue is full, rejecting new request"),
            ));
        }

        self.queue.push(request);
        let depth = self.queue_depth.fetch_add(1, Ordering::AcqRel) + 1;
        METRICS.engine.queue_depth.set(depth as i64);
        self.notify.notify_one();

        trace!("Request submitted, queue depth: {}", depth);

        Ok(())
    }

    fn pop(&self) -> Option<GenerationRequest> {
        let request = self.queue.pop()?;
        let depth = self.queue_depth.fetch_sub(1, Ordering::AcqRel) - 1;
        METRICS.engine.queue_depth.set(depth as i64);
        Some(request)
    }

    /// Get the next batch of requests
    ///
    /// Waits for the first request, then keeps collecting for up to the
    /// batching window. Returns `None` once the scheduler is shut down.
    pub async fn next_batch(&self) -> Option<RequestBatch> {
        let batching_window = Duration::from_millis(self.config.batching_window_ms);
        let mut batch = RequestBatch::new();

        // Wait for first request
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }

            if let Some(req) = self.pop() {
                batch.add(req);
                break;
            }

            self.notify.notified().await;
        }

        // Collect more requests within batching window
        let start = Instant::now();
        while batch.len() < self.config.max_batch_size && start.elapsed() < batching_window {
            if let Some(req) = self.pop() {
                batch.add(req);
            } else {
                let remaining = batching_window.saturating_sub(start.elapsed());
                if remaining.is_zero() {
                    break;
                }

                let _ = timeout(remaining, self.notify.notified()).await;
            }
        }

        debug!("Created batch: {} requests, age: {:?}", batch.len(), batch.age());

        Some(batch)
    }

    /// Get the current queue depth
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Acquire)
    }

    /// Check if the queue is healthy (not saturated)
    pub fn is_healthy(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire)
            && self.queue_depth() < (self.config.max_queue_size * 9 / 10).max(1)
    }

    /// Maximum time a request may wait before generation starts
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.config.queue_timeout_ms)
    }

    /// Shutdown the scheduler and fail every queued request
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        while let Some(req) = self.pop() {
            req.sink.fail(DistillError::engine("Engine shut down before the request ran"));
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distillr_common::config::GeneratingArgs;
    use crate::chat::GenerationOverrides;

    fn request(
        id: usize,
    ) -> (
        GenerationRequest,
        oneshot::Receiver<Result<RequestOutput>>,
    ) {
        let (done, rx) = oneshot::channel();
        let req = GenerationRequest {
            request_id: format!("req-{}", id),
            messages: vec![ChatMessage::user("hello")],
            params: SamplingParams::resolve(
                &GeneratingArgs::default(),
                &GenerationOverrides::default(),
            ),
            arrival_time: Instant::now(),
            sink: RequestSink { done, deltas: None },
        };
        (req, rx)
    }

    fn config(max_batch_size: usize, max_queue_size: usize) -> BatchingConfig {
        BatchingConfig {
            max_batch_size,
            batching_window_ms: 10,
            max_queue_size,
            queue_timeout_ms: 1000,
        }
    }

    #[tokio::test]
    async fn test_batch_scheduler() {
        let scheduler = BatchScheduler::new(config(4, 100));

        let mut receivers = Vec::new();
        for i in 0..3 {
            let (req, rx) = request(i);
            scheduler.submit(req).unwrap();
            receivers.push(rx);
        }

        let batch = scheduler.next_batch().await.unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.requests[0].request_id, "req-0");
        assert_eq!(scheduler.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_batch_respects_max_size() {
        let scheduler = BatchScheduler::new(config(2, 100));

        let mut receivers = Vec::new();
        for i in 0..5 {
            let (req, rx) = request(i);
            scheduler.submit(req).unwrap();
            receivers.push(rx);
        }

        assert_eq!(scheduler.next_batch().await.unwrap().len(), 2);
        assert_eq!(scheduler.next_batch().await.unwrap().len(), 2);
        assert_eq!(scheduler.next_batch().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_backpressure() {
        let scheduler = BatchScheduler::new(config(4, 5));

        let mut receivers = Vec::new();
        for i in 0..10 {
            let (req, rx) = request(i);
            receivers.push(rx);

            let result = scheduler.submit(req);
            if i < 5 {
                assert!(result.is_ok());
            } else {
                let (_, err) = result.unwrap_err();
                assert!(matches!(err, DistillError::QueueFull(_)));
            }
        }

        assert_eq!(scheduler.queue_depth(), 5);
        assert!(!scheduler.is_healthy());
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_requests() {
        let scheduler = BatchScheduler::new(config(4, 10));

        let (req, rx) = request(0);
        scheduler.submit(req).unwrap();
        scheduler.shutdown();

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(DistillError::Engine(_))));
        assert!(scheduler.next_batch().await.is_none());

        let (req, _rx) = request(1);
        assert!(scheduler.submit(req).is_err());
    }

    #[tokio::test]
    async fn test_next_batch_wakes_on_submit() {
        let scheduler = BatchScheduler::new(config(4, 10));

        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.next_batch().await.map(|b| b.len()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let (req, _rx) = request(0);
        scheduler.submit(req).unwrap();

        assert_eq!(waiter.await.unwrap(), Some(1));
    }
}
