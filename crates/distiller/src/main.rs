//! Distillr - Main Entry Point
//!
//! Loads the configuration, builds the model clients and runs one
//! distillation pass over the dataset.

use anyhow::{Context, Result};
use distillr::{load_qa_pairs, parse_clients, Distiller, ModelRouter};
use distillr_common::config::ObservabilityConfig;
use distillr_common::{DistillrConfig, METRICS};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "distillr={level},distillr_engine={level},distillr_common={level}",
            level = observability.log_level
        )
        .into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if observability.structured_logging {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path =
        std::env::var("DISTILLR_CONFIG").unwrap_or_else(|_| "configs/distill.yaml".to_string());

    let config = DistillrConfig::from_file(&config_path)
        .with_context(|| format!("loading config from {}", config_path))?;

    init_tracing(&config.observability);

    info!("Starting Distillr");
    info!(
        "Configuration loaded: model={}, backend={}, dataset={}",
        config.model.model_name_or_path,
        config.model.infer_backend,
        config.data.dataset_path.display()
    );

    // Build clients and router
    let descriptors = config.effective_clients();
    let clients = parse_clients(&descriptors, &config).context("building model clients")?;
    let router = Arc::new(
        ModelRouter::with_clients(&config.router, clients)
            .await
            .context("registering clients")?,
    );

    // Start health check task
    let health_check_handle = Arc::clone(&router).start_health_checks();

    let pairs = load_qa_pairs(&config.data).context("loading dataset")?;
    let distiller = Distiller::new(config.distill.clone(), Arc::clone(&router), pairs);

    info!("Distillr running, writing to {}", distiller.output_file().display());

    // Wait for completion or shutdown signal
    let outcome = tokio::select! {
        _ = signal::ctrl_c() => {
            warn!("Received shutdown signal, no output written");
            None
        }
        summary = distiller.distill() => Some(summary.context("running distillation")?),
    };

    health_check_handle.abort();

    if config.observability.enable_metrics {
        let metrics_path = config.distill.output_dir.join("metrics.prom");
        if let Err(e) = tokio::fs::create_dir_all(&config.distill.output_dir).await {
            warn!("Failed to create {}: {}", config.distill.output_dir.display(), e);
        } else if let Err(e) = tokio::fs::write(&metrics_path, METRICS.gather()).await {
            warn!("Failed to write {}: {}", metrics_path.display(), e);
        } else {
            info!("Metrics written to {}", metrics_path.display());
        }
    }

    if let Some(summary) = outcome {
        info!(
            "Wrote {} records ({} failed requests) to {} in {:.1?}",
            summary.records,
            summary.failures,
            summary.output_path.display(),
            summary.elapsed
        );
    }

    info!("Distillr shutdown complete");
    Ok(())
}
