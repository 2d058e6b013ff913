//! Core infrastructure for nano-batch.
//!
//! This module contains the fundamental building blocks:
//! - InferenceRequest and its one-shot Completion
//! - QueuePolicy for admission and timeouts
//! - PriorityQueues holding admitted, not-yet-batched requests
//! - SlotTable for stateful sequence slots

pub mod completion;
pub mod policy;
pub mod queue;
pub mod request;
pub mod slot;
