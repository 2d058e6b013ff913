//! nano-batch: a minimalistic inference request scheduler in Rust.
//!
//! This crate implements the batching core of an inference server:
//! - Priority request queues with admission and timeout policies
//! - Dynamic batching of stateless requests
//! - Sequence batching of stateful request streams on fixed slots
//! - Per-instance workers driving a pluggable execution backend

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod scheduler;

pub use config::{
    ControlInputConfig, DynamicBatchingConfig, InputConfig, ModelConfig, SequenceBatchingConfig,
};
pub use crate::core::completion::{Completion, InferResponse, InferResult, OutputTensor, RequestStats};
pub use crate::core::policy::{QueuePolicy, TimeoutAction};
pub use crate::core::request::{
    CorrelationId, InferenceRequest, ParameterValue, PriorityLevel, RequestId, RequestKind,
    SequenceFlags,
};
pub use engine::{Backend, EchoBackend, ModelScheduler, Outcome, StatisticsSnapshot};
pub use error::{BackendError, Error, RequestError, Result};
pub use scheduler::{Batch, BatchKind};
