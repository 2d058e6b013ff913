//! One-shot completion for inference requests.
//!
//! A [`Completion`] is consumed by value when it fires, so a request can be
//! completed at most once. Dropping one that never fired delivers
//! [`RequestError::Unavailable`], so it also fires at least once.

use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

use candle_core::Tensor;

use crate::core::request::RequestId;
use crate::error::RequestError;

/// Result delivered to the submitter of a request.
pub type InferResult = std::result::Result<InferResponse, RequestError>;

/// One named output tensor.
#[derive(Debug, Clone)]
pub struct OutputTensor {
    pub name: String,
    pub tensor: Tensor,
}

impl OutputTensor {
    pub fn new(name: impl Into<String>, tensor: Tensor) -> Self {
        Self {
            name: name.into(),
            tensor,
        }
    }
}

/// Per-request timing, mirroring what a serving front end reports back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestStats {
    /// Time between admission and dispatch.
    pub queue: Duration,
    /// Time spent inside the backend for the request's batch.
    pub compute: Duration,
    /// Number of requests executed together.
    pub batch_size: usize,
}

/// Successful response for one request.
#[derive(Debug, Clone)]
pub struct InferResponse {
    pub request_id: RequestId,
    pub outputs: Vec<OutputTensor>,
    pub stats: RequestStats,
}

impl InferResponse {
    /// Find an output by name.
    pub fn output(&self, name: &str) -> Option<&Tensor> {
        self.outputs
            .iter()
            .find(|output| output.name == name)
            .map(|output| &output.tensor)
    }
}

enum Sink {
    Channel(SyncSender<InferResult>),
    Callback(Box<dyn FnOnce(InferResult) + Send>),
}

/// Completion continuation registered by the front end.
pub struct Completion {
    sink: Option<Sink>,
}

impl Completion {
    /// Create a completion paired with a receiver.
    ///
    /// ```
    /// use nano_batch::core::completion::Completion;
    /// use nano_batch::RequestError;
    ///
    /// let (completion, rx) = Completion::channel();
    /// completion.complete(Err(RequestError::QueueFull));
    /// assert_eq!(rx.recv().unwrap_err(), RequestError::QueueFull);
    /// ```
    pub fn channel() -> (Self, ResponseReceiver) {
        let (tx, rx) = mpsc::sync_channel(1);
        (
            Self {
                sink: Some(Sink::Channel(tx)),
            },
            ResponseReceiver { rx },
        )
    }

    /// Create a completion that invokes `f` with the result.
    ///
    /// `f` runs on whichever thread completes the request (a producer for
    /// synchronous rejections, a worker otherwise) and must not block.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce(InferResult) + Send + 'static,
    {
        Self {
            sink: Some(Sink::Callback(Box::new(f))),
        }
    }

    /// A completion that discards its result.
    pub fn detached() -> Self {
        Self::from_fn(|_| {})
    }

    /// Deliver the result.
    pub fn complete(mut self, result: InferResult) {
        self.fire(result);
    }

    fn fire(&mut self, result: InferResult) {
        match self.sink.take() {
            // The receiver may be gone; the request still counts as completed.
            Some(Sink::Channel(tx)) => {
                let _ = tx.send(result);
            }
            Some(Sink::Callback(f)) => f(result),
            None => {}
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.sink.is_some() {
            self.fire(Err(RequestError::Unavailable(
                "request dropped before completion".to_string(),
            )));
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.sink {
            Some(Sink::Channel(_)) => "channel",
            Some(Sink::Callback(_)) => "callback",
            None => "fired",
        };
        f.debug_struct("Completion").field("sink", &kind).finish()
    }
}

/// Receiving half of [`Completion::channel`].
#[derive(Debug)]
pub struct ResponseReceiver {
    rx: Receiver<InferResult>,
}

impl ResponseReceiver {
    /// Block until the request completes.
    pub fn recv(&self) -> InferResult {
        self.rx.recv().unwrap_or_else(|_| {
            Err(RequestError::Unavailable(
                "completion channel closed".to_string(),
            ))
        })
    }

    /// Block for at most `timeout`; `None` if the request has not completed yet.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<InferResult> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(RequestError::Unavailable(
                "completion channel closed".to_string(),
            ))),
        }
    }

    /// Non-blocking poll.
    pub fn try_recv(&self) -> Option<InferResult> {
        self.rx.try_recv().ok()
    }
}
