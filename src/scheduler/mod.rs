//! Batch formation.
//!
//! This module handles:
//! - Dynamic batching of stateless requests across priority levels
//! - Sequence batching of correlated requests on fixed slots
//! - The [`Batch`] handed to the execution backend
//!
//! Both batchers are plain state machines driven by the engine's instance
//! workers. They never block and never fire completions themselves: requests
//! that fail during formation are handed back in [`Formed::failed`] so the
//! caller can complete them after releasing its lock.

pub mod batch;
pub mod dynamic;
pub mod sequence;

use std::fmt;
use std::time::Instant;

use crate::config::ModelConfig;
use crate::core::request::InferenceRequest;
use crate::error::{Rejected, RequestError, Result};

pub use batch::{Batch, BatchEntry, BatchKind, DispatchRecord, SlotControl};
pub use dynamic::{BatcherState, DynamicBatcher};
pub use sequence::SequenceBatcher;

/// A request that failed inside the scheduler, with its terminal error.
pub type Failed = (InferenceRequest, RequestError);

/// Result of one formation attempt for an instance.
#[derive(Debug, Default)]
pub struct Formed {
    /// Batch to execute now, if one closed.
    pub batch: Option<Batch>,
    /// Requests to complete with an error.
    pub failed: Vec<Failed>,
    /// When to try again if nothing new arrives; `None` waits for a signal.
    pub wake_at: Option<Instant>,
}

impl Formed {
    fn idle(failed: Vec<Failed>, wake_at: Option<Instant>) -> Self {
        Self {
            batch: None,
            failed,
            wake_at,
        }
    }
}

/// A batching strategy for one model.
///
/// Each instance has at most one batch outstanding: after
/// [`try_form_batch`](Batcher::try_form_batch) returns a batch for an
/// instance, the caller must report it through
/// [`on_complete`](Batcher::on_complete) before asking for the next one.
pub trait Batcher: Send + fmt::Debug {
    fn kind(&self) -> BatchKind;

    /// Admit a request.
    ///
    /// # Errors
    ///
    /// Hands the request back with the rejection reason; the caller completes it.
    fn enqueue(
        &mut self,
        request: InferenceRequest,
        now: Instant,
    ) -> std::result::Result<(), Rejected<InferenceRequest>>;

    /// Close a batch for `instance` if one is due.
    fn try_form_batch(&mut self, instance: usize, now: Instant) -> Formed;

    /// Record that the batch dispatched to `instance` finished.
    ///
    /// Returns requests the completion orphaned, to be failed by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SlotTable`](crate::Error::SlotTable) when the records
    /// do not match the batcher's bookkeeping. The instance must stop.
    fn on_complete(
        &mut self,
        instance: usize,
        records: &[DispatchRecord],
        now: Instant,
    ) -> Result<Vec<Failed>>;

    /// Stop scheduling onto `instance`, returning requests only it could run.
    fn halt_instance(&mut self, instance: usize) -> Vec<InferenceRequest>;

    /// Remove every waiting request.
    fn drain(&mut self) -> Vec<InferenceRequest>;

    /// Requests admitted but not yet dispatched.
    fn num_pending(&self) -> usize;
}

/// Build the batcher the configuration asks for.
pub fn for_config(config: &ModelConfig) -> Box<dyn Batcher> {
    match &config.sequence_batching {
        Some(_) => Box::new(SequenceBatcher::new(config, Instant::now())),
        None => Box::new(DynamicBatcher::new(config)),
    }
}
