//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use candle_core::{DType, Device, Tensor};
use parking_lot::{Condvar, Mutex};

use nano_batch::core::completion::ResponseReceiver;
use nano_batch::scheduler::SlotControl;
use nano_batch::{
    Backend, BackendError, Batch, BatchKind, Completion, DynamicBatchingConfig, EchoBackend,
    InferResult, InferenceRequest, ModelConfig, Outcome, SequenceBatchingConfig, SequenceFlags,
};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("warn"))
        .with_test_writer()
        .try_init();
}

// ========== Configs ==========

pub fn dynamic_config(max_batch_size: usize, preferred: &[usize], delay_micros: u64) -> ModelConfig {
    ModelConfig {
        name: "dynamic-test".into(),
        max_batch_size,
        dynamic_batching: Some(DynamicBatchingConfig {
            preferred_batch_size: preferred.to_vec(),
            max_queue_delay_micros: delay_micros,
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn sequence_config(slots: usize, blocking: bool) -> ModelConfig {
    ModelConfig {
        name: "sequence-test".into(),
        max_batch_size: slots,
        dynamic_batching: None,
        sequence_batching: Some(SequenceBatchingConfig {
            max_candidate_sequences: slots,
            blocking,
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ========== Requests ==========

pub fn vector(len: usize, value: f32) -> Tensor {
    Tensor::full(value, len, &Device::Cpu).unwrap()
}

pub fn zeros(dims: &[usize]) -> Tensor {
    Tensor::zeros(dims, DType::F32, &Device::Cpu).unwrap()
}

pub fn request(id: u64) -> (InferenceRequest, ResponseReceiver) {
    let (completion, rx) = Completion::channel();
    (InferenceRequest::new(id, completion), rx)
}

pub fn seq_request(id: u64, corr: u64, flags: SequenceFlags) -> (InferenceRequest, ResponseReceiver) {
    let (completion, rx) = Completion::channel();
    (
        InferenceRequest::new(id, completion).with_sequence(corr, flags),
        rx,
    )
}

/// Wait for a result, failing the test if none arrives.
pub fn recv(rx: &ResponseReceiver) -> InferResult {
    rx.recv_timeout(RECV_TIMEOUT)
        .expect("request did not complete in time")
}

/// Poll `cond` until it holds or the receive timeout passes.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + RECV_TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

// ========== Gate ==========

#[derive(Default)]
struct GateState {
    open: bool,
    entered: usize,
}

/// Holds backend calls until the test opens it.
#[derive(Default)]
pub struct Gate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Called from the backend: announce arrival and block until open.
    pub fn pass(&self) {
        let mut state = self.state.lock();
        state.entered += 1;
        self.cv.notify_all();
        while !state.open {
            self.cv.wait(&mut state);
        }
    }

    /// Block until `n` backend calls are parked at the gate.
    pub fn wait_entered(&self, n: usize) {
        let deadline = Instant::now() + RECV_TIMEOUT;
        let mut state = self.state.lock();
        while state.entered < n {
            if self.cv.wait_until(&mut state, deadline).timed_out() {
                panic!("backend was never called");
            }
        }
    }

    pub fn open(&self) {
        self.state.lock().open = true;
        self.cv.notify_all();
    }
}

// ========== Backend ==========

/// What the backend saw for one batch.
#[derive(Debug, Clone)]
pub struct RecordedBatch {
    pub instance: usize,
    pub kind: BatchKind,
    pub len: usize,
    pub request_ids: Vec<u64>,
    pub controls: Vec<SlotControl>,
}

/// Echo backend that records every batch and can hold, fail or panic.
#[derive(Default)]
pub struct RecordingBackend {
    batches: Mutex<Vec<RecordedBatch>>,
    hold: Option<(Arc<Gate>, Vec<u64>)>,
    fail_with: Option<String>,
    panic_on: Option<u64>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park batches containing any of `ids` at `gate`.
    pub fn holding(mut self, gate: Arc<Gate>, ids: &[u64]) -> Self {
        self.hold = Some((gate, ids.to_vec()));
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.fail_with = Some(message.to_string());
        self
    }

    pub fn panicking_on(mut self, id: u64) -> Self {
        self.panic_on = Some(id);
        self
    }

    pub fn batches(&self) -> Vec<RecordedBatch> {
        self.batches.lock().clone()
    }

    /// Request ids in the order the backend received them.
    pub fn executed_ids(&self) -> Vec<u64> {
        self.batches
            .lock()
            .iter()
            .flat_map(|batch| batch.request_ids.clone())
            .collect()
    }
}

impl Backend for RecordingBackend {
    fn execute(&self, instance: usize, batch: &Batch) -> Result<Vec<Outcome>, BackendError> {
        let request_ids = batch.request_ids();
        self.batches.lock().push(RecordedBatch {
            instance,
            kind: batch.kind(),
            len: batch.len(),
            request_ids: request_ids.clone(),
            controls: batch
                .entries()
                .iter()
                .filter_map(|entry| entry.control())
                .collect(),
        });

        if let Some((gate, ids)) = &self.hold {
            if request_ids.iter().any(|id| ids.contains(id)) {
                gate.pass();
            }
        }
        if let Some(id) = self.panic_on {
            if request_ids.contains(&id) {
                panic!("backend crashed on request {id}");
            }
        }
        if let Some(message) = &self.fail_with {
            return Err(BackendError::new(message.clone()));
        }
        EchoBackend.execute(instance, batch)
    }
}
