//! Inference requests.
//!
//! A request is created by a front end, owned by the scheduler's queues or
//! slot table while waiting, moved into a [`Batch`](crate::scheduler::Batch)
//! on dispatch, and consumed when its completion fires.

use std::collections::HashMap;
use std::time::Instant;

use candle_core::Tensor;

use crate::core::completion::{Completion, InferResult};

/// Unique identifier for a request.
pub type RequestId = u64;

/// Identifier grouping the requests of one sequence.
pub type CorrelationId = u64;

/// Priority level; 1 is the highest, 0 means "use the model default".
pub type PriorityLevel = u32;

/// Sequence control flags carried by a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SequenceFlags {
    pub start: bool,
    pub end: bool,
}

impl SequenceFlags {
    /// Continuation request.
    pub const NONE: Self = Self {
        start: false,
        end: false,
    };
    /// First request of a sequence.
    pub const START: Self = Self {
        start: true,
        end: false,
    };
    /// Last request of a sequence.
    pub const END: Self = Self {
        start: false,
        end: true,
    };
    /// Single-request sequence.
    pub const START_END: Self = Self {
        start: true,
        end: true,
    };
}

/// Kind of scheduling a request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Independent request, eligible for dynamic batching.
    Stateless,
    /// Part of a correlated stream bound to a sequence slot.
    Sequence(CorrelationId),
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stateless => "stateless",
            Self::Sequence(_) => "sequence",
        }
    }
}

/// Request parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterValue {
    Int(i64),
    Bool(bool),
    String(String),
}

impl ParameterValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Int(v) => Some(*v != 0),
            _ => None,
        }
    }
}

/// One named input tensor.
#[derive(Debug, Clone)]
pub struct InputTensor {
    pub name: String,
    pub tensor: Tensor,
}

/// A single client-submitted unit of work.
///
/// Priority and correlation id are fixed by the builder methods before
/// submission; once the request is enqueued nothing can change them.
///
/// # Example
///
/// ```
/// use candle_core::{DType, Device, Tensor};
/// use nano_batch::core::completion::Completion;
/// use nano_batch::core::request::{InferenceRequest, RequestKind, SequenceFlags};
///
/// let (completion, _rx) = Completion::channel();
/// let input = Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap();
/// let request = InferenceRequest::new(7, completion)
///     .with_sequence(42, SequenceFlags::START)
///     .with_priority(1)
///     .with_input("INPUT0", input);
///
/// assert_eq!(request.kind(), RequestKind::Sequence(42));
/// assert!(request.flags().start);
/// ```
#[derive(Debug)]
pub struct InferenceRequest {
    id: RequestId,
    correlation_id: Option<CorrelationId>,
    flags: SequenceFlags,
    priority: PriorityLevel,
    timeout_micros: Option<u64>,
    inputs: Vec<InputTensor>,
    requested_outputs: Vec<String>,
    parameters: HashMap<String, ParameterValue>,
    arrival_time: Instant,
    completion: Completion,
}

impl InferenceRequest {
    /// Create a stateless request with default priority.
    pub fn new(id: RequestId, completion: Completion) -> Self {
        Self {
            id,
            correlation_id: None,
            flags: SequenceFlags::NONE,
            priority: 0,
            timeout_micros: None,
            inputs: Vec::new(),
            requested_outputs: Vec::new(),
            parameters: HashMap::new(),
            arrival_time: Instant::now(),
            completion,
        }
    }

    /// Build a request from front-end parameters.
    ///
    /// Recognized keys are `sequence_id`, `sequence_start`, `sequence_end`,
    /// `priority` and `timeout`; every parameter is also kept verbatim. A
    /// `sequence_id` of 0 means "no sequence".
    pub fn from_parameters(
        id: RequestId,
        parameters: HashMap<String, ParameterValue>,
        completion: Completion,
    ) -> Self {
        let mut request = Self::new(id, completion);
        let int = |key: &str| parameters.get(key).and_then(ParameterValue::as_int);
        let flag = |key: &str| {
            parameters
                .get(key)
                .and_then(ParameterValue::as_bool)
                .unwrap_or(false)
        };

        if let Some(seq) = int("sequence_id").filter(|&v| v > 0) {
            request.correlation_id = Some(seq as CorrelationId);
            request.flags = SequenceFlags {
                start: flag("sequence_start"),
                end: flag("sequence_end"),
            };
        }
        if let Some(priority) = int("priority").filter(|&v| v > 0) {
            request.priority = u32::try_from(priority).unwrap_or(u32::MAX);
        }
        request.timeout_micros = int("timeout").filter(|&v| v > 0).map(|v| v as u64);
        request.parameters = parameters;
        request
    }

    // ========== Builders ==========

    /// Bind the request to a sequence.
    pub fn with_sequence(mut self, correlation_id: CorrelationId, flags: SequenceFlags) -> Self {
        self.correlation_id = Some(correlation_id);
        self.flags = flags;
        self
    }

    /// Set the priority level.
    pub fn with_priority(mut self, priority: PriorityLevel) -> Self {
        self.priority = priority;
        self
    }

    /// Request a queue timeout, subject to the level's override policy.
    pub fn with_timeout_micros(mut self, micros: u64) -> Self {
        self.timeout_micros = Some(micros);
        self
    }

    /// Attach an input tensor.
    pub fn with_input(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.inputs.push(InputTensor {
            name: name.into(),
            tensor,
        });
        self
    }

    /// Ask for a specific output; an empty list means all outputs.
    pub fn with_requested_output(mut self, name: impl Into<String>) -> Self {
        self.requested_outputs.push(name.into());
        self
    }

    /// Attach a free-form parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: ParameterValue) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    // ========== Getters ==========

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn kind(&self) -> RequestKind {
        match self.correlation_id {
            Some(id) => RequestKind::Sequence(id),
            None => RequestKind::Stateless,
        }
    }

    pub fn flags(&self) -> SequenceFlags {
        self.flags
    }

    pub fn priority(&self) -> PriorityLevel {
        self.priority
    }

    pub fn timeout_micros(&self) -> Option<u64> {
        self.timeout_micros
    }

    pub fn inputs(&self) -> &[InputTensor] {
        &self.inputs
    }

    /// Find an input by name.
    pub fn input(&self, name: &str) -> Option<&Tensor> {
        self.inputs
            .iter()
            .find(|input| input.name == name)
            .map(|input| &input.tensor)
    }

    pub fn requested_outputs(&self) -> &[String] {
        &self.requested_outputs
    }

    pub fn parameters(&self) -> &HashMap<String, ParameterValue> {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&ParameterValue> {
        self.parameters.get(key)
    }

    /// Time the request was admitted (creation time until then).
    pub fn arrival_time(&self) -> Instant {
        self.arrival_time
    }

    // ========== Lifecycle ==========

    /// Stamp the admission time.
    pub(crate) fn mark_arrival(&mut self, now: Instant) {
        self.arrival_time = now;
    }

    /// Fire the completion, consuming the request.
    pub fn complete(self, result: InferResult) {
        self.completion.complete(result);
    }
}
