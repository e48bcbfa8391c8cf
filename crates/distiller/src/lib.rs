//! Distillr
//!
//! Generates reasoning traces for a question/answer dataset by routing chat
//! requests across local and remote model clients.

pub mod client;
pub mod dataset;
pub mod distiller;
pub mod router;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{parse_clients, Client};
pub use dataset::{load_qa_pairs, QaPair};
pub use distiller::{split_reasoning, DistillSummary, DistillationRecord, Distiller};
pub use router::{ClientGuard, ModelRouter};
