//! Per-instance scheduling workers.
//!
//! Each model instance runs one worker thread:
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────┐
//!   │ lock ─► try_form_batch ─► batch? ──no──► wait(deadline) ─┐│
//!   │  ▲                          │yes                         ││
//!   │  │                    unlock, execute                    ││
//!   │  │                          │                            ││
//!   │  │            lock, on_complete, unlock                  ││
//!   │  │                          │                            ││
//!   │  └──────────── deliver outcomes ◄────────────────────────┘│
//!   └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Completions always fire with the lock released, so a completion callback
//! may submit new requests. A panicking callback is logged and contained; a
//! panic anywhere else in the loop halts the instance.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use super::backend::{Backend, Outcome};
use super::stats::ModelStatistics;
use crate::core::completion::{InferResponse, InferResult, OutputTensor, RequestStats};
use crate::core::queue::QueuedRequest;
use crate::core::request::InferenceRequest;
use crate::error::{BackendError, Error, RequestError, Result};
use crate::scheduler::{Batch, Batcher, Failed};

/// Mutable scheduling state of one model, guarded by [`Shared::state`].
#[derive(Debug)]
pub(crate) struct SchedulerState {
    pub batcher: Box<dyn Batcher>,
    pub shutdown: bool,
    pub halted: Vec<bool>,
}

impl SchedulerState {
    pub fn live_instances(&self) -> usize {
        self.halted.iter().filter(|halted| !**halted).count()
    }
}

/// Everything the producers and the workers of one model share.
pub(crate) struct Shared {
    pub model: String,
    pub state: Mutex<SchedulerState>,
    pub signal: Condvar,
    pub backend: Arc<dyn Backend>,
    pub stats: ModelStatistics,
}

impl Shared {
    pub fn new(
        model: String,
        batcher: Box<dyn Batcher>,
        instances: usize,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            model,
            state: Mutex::new(SchedulerState {
                batcher,
                shutdown: false,
                halted: vec![false; instances],
            }),
            signal: Condvar::new(),
            backend,
            stats: ModelStatistics::new(),
        }
    }

    /// Complete a request, recording the outcome.
    pub fn finish(&self, request: InferenceRequest, result: InferResult) {
        let request_id = request.id();
        match &result {
            Ok(response) => self.stats.record_success(&response.stats),
            Err(err) => {
                debug!(
                    model = %self.model,
                    request_id,
                    code = err.code(),
                    "request failed"
                );
                self.stats.record_failure(err);
            }
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| request.complete(result))) {
            error!(
                model = %self.model,
                request_id,
                panic = %panic_message(payload.as_ref()),
                "completion callback panicked"
            );
        }
    }

    pub fn fail_all(&self, failed: Vec<Failed>) {
        for (request, error) in failed {
            self.finish(request, Err(error));
        }
    }

    pub fn fail_with(&self, requests: Vec<InferenceRequest>, error: &RequestError) {
        for request in requests {
            self.finish(request, Err(error.clone()));
        }
    }

    /// Take `instance` out of service and fail what only it could run.
    fn halt(&self, instance: usize, reason: &Error) {
        let orphaned = {
            let mut state = self.state.lock();
            if let Some(halted) = state.halted.get_mut(instance) {
                *halted = true;
            }
            let mut orphaned = state.batcher.halt_instance(instance);
            if state.live_instances() == 0 {
                orphaned.extend(state.batcher.drain());
            }
            orphaned
        };
        error!(
            model = %self.model,
            instance,
            error = %reason,
            orphaned = orphaned.len(),
            "instance halted"
        );
        self.signal.notify_all();
        let error = RequestError::Unavailable(format!(
            "instance {instance} of model '{}' halted: {reason}",
            self.model
        ));
        self.fail_with(orphaned, &error);
    }

    /// Run one batch on the backend and settle every request in it.
    ///
    /// # Errors
    ///
    /// Returns the fault that must halt the instance: a backend panic or a
    /// slot table that no longer matches the batch.
    fn execute(&self, instance: usize, batch: Batch) -> Result<()> {
        let size = batch.num_requests();
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.backend.execute(instance, &batch)
        }));
        let compute = started.elapsed();
        self.stats.record_batch(size, compute);

        let (outcomes, fault) = match result {
            Ok(outcomes) => (outcomes, None),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let err = BackendError::new(format!("backend panicked: {message}"));
                (Err(err), Some(Error::BackendPanic { instance, message }))
            }
        };
        debug!(
            model = %self.model,
            instance,
            batch_size = size,
            compute_us = compute.as_micros() as u64,
            ok = outcomes.is_ok(),
            "batch executed"
        );

        let records = batch.records();
        let dispatched_at = batch.formed_at();
        let requests = batch.into_requests();

        let orphaned = {
            let mut state = self.state.lock();
            state
                .batcher
                .on_complete(instance, &records, Instant::now())
        };
        self.signal.notify_all();

        self.deliver(requests, outcomes, dispatched_at, compute, size);
        match orphaned {
            Ok(failed) => self.fail_all(failed),
            Err(err) => return Err(err),
        }
        fault.map_or(Ok(()), Err)
    }

    fn deliver(
        &self,
        requests: Vec<QueuedRequest>,
        outcomes: std::result::Result<Vec<Outcome>, BackendError>,
        dispatched_at: Instant,
        compute: Duration,
        batch_size: usize,
    ) {
        let outcomes = match outcomes {
            Ok(outcomes) => outcomes,
            Err(err) => {
                warn!(model = %self.model, batch_size, error = %err, "backend failed batch");
                let error = RequestError::from(err);
                for entry in requests {
                    self.finish(entry.request, Err(error.clone()));
                }
                return;
            }
        };

        if outcomes.len() != requests.len() {
            warn!(
                model = %self.model,
                expected = requests.len(),
                got = outcomes.len(),
                "backend returned wrong number of outcomes"
            );
        }
        let mut outcomes = outcomes.into_iter();
        for entry in requests {
            let stats = RequestStats {
                queue: dispatched_at.saturating_duration_since(entry.enqueued_at),
                compute,
                batch_size,
            };
            let result = match outcomes.next() {
                Some(Ok(outputs)) => Ok(InferResponse {
                    request_id: entry.request.id(),
                    outputs: select_outputs(outputs, entry.request.requested_outputs()),
                    stats,
                }),
                Some(Err(err)) => Err(RequestError::from(err)),
                None => Err(RequestError::BackendExecution(
                    "backend returned no outcome for request".into(),
                )),
            };
            self.finish(entry.request, result);
        }
    }
}

/// Keep only the requested outputs; an empty request list keeps all.
fn select_outputs(outputs: Vec<OutputTensor>, requested: &[String]) -> Vec<OutputTensor> {
    if requested.is_empty() {
        return outputs;
    }
    outputs
        .into_iter()
        .filter(|output| requested.contains(&output.name))
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Worker loop for one instance; returns on shutdown or halt.
pub(crate) fn run_instance(shared: Arc<Shared>, instance: usize) {
    info!(model = %shared.model, instance, "instance worker started");
    let fault = match panic::catch_unwind(AssertUnwindSafe(|| serve(&shared, instance))) {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err),
        Err(payload) => Some(Error::WorkerPanic {
            instance,
            message: panic_message(payload.as_ref()),
        }),
    };
    match fault {
        Some(err) => shared.halt(instance, &err),
        None => info!(model = %shared.model, instance, "instance worker stopped"),
    }
}

/// Form and execute batches until shutdown.
///
/// # Errors
///
/// Returns the fault that must halt the instance.
fn serve(shared: &Shared, instance: usize) -> Result<()> {
    loop {
        let formed = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return Ok(());
                }
                let formed = state.batcher.try_form_batch(instance, Instant::now());
                if formed.batch.is_some() || !formed.failed.is_empty() {
                    break formed;
                }
                match formed.wake_at {
                    Some(deadline) => {
                        trace!(model = %shared.model, instance, "waiting for deadline");
                        shared.signal.wait_until(&mut state, deadline);
                    }
                    None => shared.signal.wait(&mut state),
                }
            }
        };

        shared.fail_all(formed.failed);
        if let Some(batch) = formed.batch {
            shared.execute(instance, batch)?;
        }
    }
}
