//! Distillr chat engines
//!
//! A [`ChatEngine`] turns chat requests into generated sequences. Two
//! implementations are provided:
//!
//! - [`LocalEngine`]: queues requests on a [`BatchScheduler`] and runs them on
//!   an in-process [`GenerationBackend`] such as [`GgufBackend`];
//! - [`RemoteEngine`]: calls an OpenAI-compatible server over HTTP.
//!
//! [`ChatModel`] wraps either one behind blocking and async entry points that
//! share a single background event loop.

pub mod batching;
pub mod chat;
pub mod chat_model;
pub mod chat_template;
pub mod gguf;
pub mod local;
pub mod remote;

pub use batching::BatchScheduler;
pub use chat::{
    ChatEngine, ChatRequest, DeltaStream, FinishReason, GenerationOverrides, Response,
    SamplingParams,
};
pub use chat_model::{build_engine, ChatModel, DeltaIter};
pub use chat_template::ChatFormat;
pub use gguf::GgufBackend;
pub use local::{GenerationBackend, LocalEngine, RequestOutput, SequenceOutput};
pub use remote::RemoteEngine;
