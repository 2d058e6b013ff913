//! Scheduling engine.
//!
//! This module contains:
//! - The execution [`Backend`] interface
//! - Per-instance workers that run batches and deliver outcomes
//! - [`ModelScheduler`], the front end's entry point for one model
//! - Per-model statistics

pub mod backend;
mod coordinator;
pub mod model;
pub mod stats;

pub use backend::{Backend, EchoBackend, Outcome};
pub use model::ModelScheduler;
pub use stats::{ModelStatistics, StatisticsSnapshot};
