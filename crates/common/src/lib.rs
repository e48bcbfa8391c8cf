//! Distillr common library
//!
//! This crate contains shared code used across Distillr components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::DistillrConfig;
pub use error::{DistillError, Result};
pub use metrics::{MetricsRegistry, METRICS};
