//! Execution backend interface.
//!
//! The scheduler never looks inside tensors beyond stacking them. A
//! [`Backend`] receives a formed [`Batch`] and returns one [`Outcome`] per
//! real request, in [`Batch::requests`] order. Padding entries of sequence
//! batches get no outcome.

use crate::core::completion::OutputTensor;
use crate::error::BackendError;
use crate::scheduler::Batch;

/// Result of executing one request of a batch.
pub type Outcome = std::result::Result<Vec<OutputTensor>, BackendError>;

/// Executes batches for a model.
///
/// `execute` is called from instance worker threads, one batch per instance at
/// a time, and may block for as long as the computation takes. Returning `Err`
/// fails every request of the batch with the same message.
pub trait Backend: Send + Sync {
    fn execute(
        &self,
        instance: usize,
        batch: &Batch,
    ) -> std::result::Result<Vec<Outcome>, BackendError>;
}

impl<F> Backend for F
where
    F: Fn(usize, &Batch) -> std::result::Result<Vec<Outcome>, BackendError> + Send + Sync,
{
    fn execute(
        &self,
        instance: usize,
        batch: &Batch,
    ) -> std::result::Result<Vec<Outcome>, BackendError> {
        self(instance, batch)
    }
}

/// Backend that returns every request's inputs as its outputs.
///
/// ```
/// use std::sync::Arc;
/// use nano_batch::engine::{Backend, EchoBackend};
///
/// let backend: Arc<dyn Backend> = Arc::new(EchoBackend);
/// # let _ = backend;
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoBackend;

impl Backend for EchoBackend {
    fn execute(
        &self,
        _instance: usize,
        batch: &Batch,
    ) -> std::result::Result<Vec<Outcome>, BackendError> {
        Ok(batch
            .requests()
            .map(|request| {
                Ok(request
                    .inputs()
                    .iter()
                    .map(|input| OutputTensor::new(input.name.clone(), input.tensor.clone()))
                    .collect())
            })
            .collect())
    }
}
