//! Error types for nano-batch.
//!
//! Two layers live here. [`RequestError`] is the terminal outcome of a single
//! inference request and always travels through the request's completion.
//! [`Error`] covers everything else: configuration, startup and faults that
//! halt a model instance.

use thiserror::Error;

use crate::core::request::CorrelationId;

/// Result type alias for nano-batch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-batch.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The slot table no longer matches what was dispatched.
    #[error("corrupted slot table on instance {instance}: {detail}")]
    SlotTable { instance: usize, detail: String },

    /// The backend panicked while executing a batch.
    #[error("backend panicked on instance {instance}: {message}")]
    BackendPanic { instance: usize, message: String },

    /// A scheduling worker panicked outside the backend.
    #[error("worker panicked on instance {instance}: {message}")]
    WorkerPanic { instance: usize, message: String },

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Terminal error for one inference request.
///
/// Every variant is delivered through the request's completion exactly once.
/// Nothing here is retried by the scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The target priority queue is at `max_queue_size`.
    #[error("queue is full")]
    QueueFull,

    /// The request waited longer than its timeout under a `REJECT` policy.
    #[error("request timeout expired")]
    TimeoutExpired,

    /// A continuation or end request arrived for an unbound correlation id.
    #[error("sequence {0} not found")]
    SequenceNotFound(CorrelationId),

    /// A new sequence found no free slot and the batcher is non-blocking.
    #[error("no available sequence slot")]
    NoAvailableSlot,

    /// A request of the sequence timed out, failing the whole sequence.
    #[error("sequence {0} timed out")]
    SequenceTimeout(CorrelationId),

    /// The execution backend failed.
    #[error("backend execution error: {0}")]
    BackendExecution(String),

    /// The request is malformed or incompatible with the model.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The model instance is halted or the scheduler is shutting down.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl RequestError {
    /// Stable error code, suitable for front ends.
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueueFull => "QUEUE_FULL",
            Self::TimeoutExpired => "TIMEOUT_EXPIRED",
            Self::SequenceNotFound(_) => "SEQUENCE_NOT_FOUND",
            Self::NoAvailableSlot => "NO_AVAILABLE_SLOT",
            Self::SequenceTimeout(_) => "SEQUENCE_TIMEOUT",
            Self::BackendExecution(_) => "BACKEND_EXECUTION_ERROR",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Unavailable(_) => "UNAVAILABLE",
        }
    }

    /// Whether the error was produced at admission time.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::QueueFull | Self::SequenceNotFound(_) | Self::NoAvailableSlot
        )
    }
}

impl From<BackendError> for RequestError {
    fn from(err: BackendError) -> Self {
        Self::BackendExecution(err.0)
    }
}

/// Failure reported by an execution backend.
///
/// The message is propagated verbatim to every affected request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    /// Create a backend error from any message.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<candle_core::Error> for BackendError {
    fn from(err: candle_core::Error) -> Self {
        Self(err.to_string())
    }
}

/// A request refused by a queue or batcher, handed back with its reason.
///
/// The caller owns the request again and must complete it with `error`.
#[derive(Debug)]
pub struct Rejected<R> {
    pub request: R,
    pub error: RequestError,
}

impl<R> Rejected<R> {
    pub fn new(request: R, error: RequestError) -> Self {
        Self { request, error }
    }
}

