//! Per-model scheduler facade.
//!
//! [`ModelScheduler`] owns the batcher, one worker thread per instance and
//! the statistics of one model. Front ends only call
//! [`submit`](ModelScheduler::submit); every result, including rejections,
//! arrives through the request's completion.
//!
//! ## Submission Flow
//!
//! ```text
//!   submit(req)
//!       │
//!       ├─ kind does not match the model ─────► INVALID_REQUEST
//!       ├─ shut down or every instance halted ─► UNAVAILABLE
//!       │
//!       ▼
//!   lock ─► batcher.enqueue ─► rejected? ──yes──► complete(Err) outside the lock
//!       │
//!       └─ notify workers
//! ```

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::backend::Backend;
use super::coordinator::{self, Shared};
use super::stats::StatisticsSnapshot;
use crate::config::ModelConfig;
use crate::core::request::{InferenceRequest, RequestKind};
use crate::error::{RequestError, Result};
use crate::scheduler::{self, BatchKind};

/// Request scheduler for one loaded model.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use candle_core::{DType, Device, Tensor};
/// use nano_batch::core::completion::Completion;
/// use nano_batch::engine::EchoBackend;
/// use nano_batch::{InferenceRequest, ModelConfig, ModelScheduler};
///
/// let scheduler = ModelScheduler::start(ModelConfig::default(), Arc::new(EchoBackend)).unwrap();
///
/// let (completion, rx) = Completion::channel();
/// let input = Tensor::ones(3, DType::F32, &Device::Cpu).unwrap();
/// scheduler
///     .submit(InferenceRequest::new(1, completion).with_input("INPUT0", input))
///     .unwrap();
///
/// let response = rx.recv().unwrap();
/// assert_eq!(response.request_id, 1);
/// assert!(response.output("INPUT0").is_some());
/// scheduler.shutdown();
/// ```
pub struct ModelScheduler {
    config: ModelConfig,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ModelScheduler {
    /// Validate `config` and start one worker per instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) for an invalid
    /// configuration and [`Error::Io`](crate::Error::Io) if a worker thread
    /// cannot be spawned.
    pub fn start(config: ModelConfig, backend: Arc<dyn Backend>) -> Result<Self> {
        config.validate()?;
        let batcher = scheduler::for_config(&config);
        let kind = batcher.kind();
        let shared = Arc::new(Shared::new(
            config.name.clone(),
            batcher,
            config.instance_count,
            backend,
        ));

        let scheduler = Self {
            config,
            shared,
            workers: Mutex::new(Vec::new()),
        };
        for instance in 0..scheduler.config.instance_count {
            let shared = Arc::clone(&scheduler.shared);
            // On error, dropping `scheduler` stops the workers already spawned.
            let handle = thread::Builder::new()
                .name(format!("{}-instance-{instance}", scheduler.config.name))
                .spawn(move || coordinator::run_instance(shared, instance))?;
            scheduler.workers.lock().push(handle);
        }

        info!(
            model = %scheduler.config.name,
            instances = scheduler.config.instance_count,
            batching = ?kind,
            max_batch_size = scheduler.config.effective_max_batch_size(),
            "model scheduler started"
        );
        Ok(scheduler)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn batch_kind(&self) -> BatchKind {
        if self.config.sequence_batching.is_some() {
            BatchKind::Sequence
        } else {
            BatchKind::Dynamic
        }
    }

    /// Admit a request.
    ///
    /// On success the request's completion fires later from a worker thread.
    ///
    /// # Errors
    ///
    /// A rejected request has already been completed with the returned error
    /// by the time this returns.
    pub fn submit(&self, request: InferenceRequest) -> std::result::Result<(), RequestError> {
        if let Some(error) = self.classify(&request) {
            return self.reject(request, error);
        }

        let rejected = {
            let mut state = self.shared.state.lock();
            if state.shutdown || state.live_instances() == 0 {
                Some((
                    request,
                    RequestError::Unavailable(format!("model '{}' is not ready", self.config.name)),
                ))
            } else {
                state
                    .batcher
                    .enqueue(request, Instant::now())
                    .err()
                    .map(|rejected| (rejected.request, rejected.error))
            }
        };

        match rejected {
            None => {
                self.shared.signal.notify_all();
                Ok(())
            }
            Some((request, error)) => self.reject(request, error),
        }
    }

    /// Check the request kind against the model's batching mode.
    fn classify(&self, request: &InferenceRequest) -> Option<RequestError> {
        match (request.kind(), self.batch_kind()) {
            (RequestKind::Stateless, BatchKind::Sequence) => Some(RequestError::InvalidRequest(
                format!("model '{}' requires a correlation id", self.config.name),
            )),
            (RequestKind::Sequence(id), BatchKind::Dynamic) => {
                Some(RequestError::InvalidRequest(format!(
                    "model '{}' does not support sequences (correlation id {id})",
                    self.config.name
                )))
            }
            _ => None,
        }
    }

    fn reject(
        &self,
        request: InferenceRequest,
        error: RequestError,
    ) -> std::result::Result<(), RequestError> {
        debug!(
            model = %self.config.name,
            request_id = request.id(),
            kind = request.kind().as_str(),
            code = error.code(),
            "request rejected"
        );
        self.shared.finish(request, Err(error.clone()));
        Err(error)
    }

    /// Whether the model accepts requests: not shut down and at least one
    /// instance running.
    pub fn is_ready(&self) -> bool {
        let state = self.shared.state.lock();
        !state.shutdown && state.live_instances() > 0
    }

    /// Requests admitted but not yet dispatched.
    pub fn num_pending(&self) -> usize {
        self.shared.state.lock().batcher.num_pending()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Stop accepting requests, fail everything still waiting and join the workers.
    ///
    /// Batches already inside the backend finish normally. Calling this more
    /// than once is harmless.
    pub fn shutdown(&self) {
        let drained = {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                Vec::new()
            } else {
                state.shutdown = true;
                state.batcher.drain()
            }
        };
        self.shared.signal.notify_all();
        if !drained.is_empty() {
            info!(model = %self.config.name, drained = drained.len(), "failing queued requests on shutdown");
        }
        let error = RequestError::Unavailable(format!("model '{}' is shutting down", self.config.name));
        self.shared.fail_with(drained, &error);

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!(model = %self.config.name, worker = %name, "worker thread panicked");
            }
        }
    }
}

impl Drop for ModelScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ModelScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelScheduler")
            .field("model", &self.config.name)
            .field("instances", &self.config.instance_count)
            .finish()
    }
}
