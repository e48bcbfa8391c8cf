//! Metrics collection for Distillr
//!
//! This module provides Prometheus metrics for observability of the engines,
//! the router and the distiller loop.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for Distillr
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub inference: InferenceMetrics,
    pub engine: EngineMetrics,
    pub router: RouterMetrics,
}

/// Generation request metrics
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    /// Total number of generation requests
    pub requests_total: IntCounter,

    /// Total number of successful requests
    pub requests_success: IntCounter,

    /// Total number of failed requests
    pub requests_failed: IntCounter,

    /// Request duration histogram
    pub request_duration: Histogram,

    /// Prompt tokens processed
    pub prompt_tokens_total: IntCounter,

    /// Completion tokens generated
    pub completion_tokens_total: IntCounter,

    /// Current active requests
    pub active_requests: IntGauge,
}

/// Local engine metrics
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    /// Current depth of the request queue
    pub queue_depth: IntGauge,

    /// Batch size histogram
    pub batch_size: Histogram,

    /// Time requests spend queued before generation starts
    pub queue_time: Histogram,
}

/// Router metrics
#[derive(Debug, Clone)]
pub struct RouterMetrics {
    /// Requests routed
    pub requests_routed: IntCounter,

    /// Registered clients
    pub active_clients: IntGauge,

    /// Clients currently marked unhealthy
    pub unhealthy_clients: IntGauge,

    /// Requests rejected because no client could serve them
    pub no_clients_available: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("valid counter definition")
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).expect("valid gauge definition")
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("valid histogram definition")
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let inference = InferenceMetrics {
            requests_total: counter(
                "distill_requests_total",
                "Total number of generation requests",
            ),
            requests_success: counter(
                "distill_requests_success_total",
                "Total number of successful generation requests",
            ),
            requests_failed: counter(
                "distill_requests_failed_total",
                "Total number of failed generation requests",
            ),
            request_duration: histogram(
                "distill_request_duration_seconds",
                "Generation request duration in seconds",
                vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0],
            ),
            prompt_tokens_total: counter(
                "distill_prompt_tokens_total",
                "Total number of prompt tokens processed",
            ),
            completion_tokens_total: counter(
                "distill_completion_tokens_total",
                "Total number of completion tokens generated",
            ),
            active_requests: gauge(
                "distill_active_requests",
                "Current number of in-flight generation requests",
            ),
        };

        let engine = EngineMetrics {
            queue_depth: gauge(
                "engine_queue_depth",
                "Current depth of the local engine request queue",
            ),
            batch_size: histogram(
                "engine_batch_size",
                "Batch size distribution",
                vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0],
            ),
            queue_time: histogram(
                "engine_queue_time_seconds",
                "Time requests spend queued before generation",
                vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0],
            ),
        };

        let router = RouterMetrics {
            requests_routed: counter(
                "router_requests_routed_total",
                "Total number of requests routed",
            ),
            active_clients: gauge("router_active_clients", "Current number of registered clients"),
            unhealthy_clients: gauge(
                "router_unhealthy_clients",
                "Current number of unhealthy clients",
            ),
            no_clients_available: counter(
                "router_no_clients_available_total",
                "Total requests rejected because no client was available",
            ),
        };

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(inference.requests_total.clone()),
            Box::new(inference.requests_success.clone()),
            Box::new(inference.requests_failed.clone()),
            Box::new(inference.request_duration.clone()),
            Box::new(inference.prompt_tokens_total.clone()),
            Box::new(inference.completion_tokens_total.clone()),
            Box::new(inference.active_requests.clone()),
            Box::new(engine.queue_depth.clone()),
            Box::new(engine.batch_size.clone()),
            Box::new(engine.queue_time.clone()),
            Box::new(router.requests_routed.clone()),
            Box::new(router.active_clients.clone()),
            Box::new(router.unhealthy_clients.clone()),
            Box::new(router.no_clients_available.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .expect("metric names are unique within the registry");
        }

        MetricsRegistry {
            registry,
            inference,
            engine,
            router,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        // Record some metrics
        metrics.inference.requests_total.inc();
        metrics.inference.active_requests.inc();
        metrics.engine.queue_depth.set(10);
        metrics.router.requests_routed.inc_by(3);

        // Gather metrics
        let output = metrics.gather();
        assert!(output.contains("distill_requests_total"));
        assert!(output.contains("engine_queue_depth 10"));
        assert!(output.contains("router_requests_routed_total 3"));
    }

    #[test]
    fn test_histogram_timer() {
        let metrics = MetricsRegistry::new();
        {
            let _timer = metrics.inference.request_duration.start_timer();
        }
        assert_eq!(metrics.inference.request_duration.get_sample_count(), 1);
    }
}
