//! Batches handed to the execution backend.
//!
//! A [`Batch`] owns its requests from dispatch until the coordinator splits
//! the backend's outcomes back onto them. Dynamic batches hold one entry per
//! request. Sequence batches hold one entry per slot of the instance, in slot
//! order, so the backend can keep per-slot state by position.
//!
//! ```text
//!   sequence batch, 4 slots:
//!   ┌──────────┬──────────┬──────────┬──────────┐
//!   │ slot 0   │ slot 1   │ slot 2   │ slot 3   │
//!   │ R(START) │ padding  │ R        │ padding  │
//!   │ corr=11  │ corr=12  │ corr=13  │ free     │
//!   │ ready=1  │ ready=0  │ ready=1  │ ready=0  │
//!   └──────────┴──────────┴──────────┴──────────┘
//! ```

use std::collections::HashMap;
use std::time::Instant;

use candle_core::{Device, Tensor};

use crate::config::ControlInputConfig;
use crate::core::queue::QueuedRequest;
use crate::core::request::{CorrelationId, InferenceRequest, RequestId};

/// Which batcher formed a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchKind {
    Dynamic,
    Sequence,
}

/// Control values for one sequence slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotControl {
    /// First request of the sequence: initialize slot state.
    pub start: bool,
    /// Last request of the sequence: tear down slot state afterwards.
    pub end: bool,
    /// The slot carries a real request this round.
    pub ready: bool,
    /// Sequence bound to the slot, `None` for a free slot.
    pub correlation_id: Option<CorrelationId>,
}

/// One position in a batch.
#[derive(Debug)]
pub struct BatchEntry {
    slot: Option<usize>,
    control: Option<SlotControl>,
    request: Option<QueuedRequest>,
}

impl BatchEntry {
    /// Entry of a dynamic batch.
    pub(crate) fn request(entry: QueuedRequest) -> Self {
        Self {
            slot: None,
            control: None,
            request: Some(entry),
        }
    }

    /// Entry of a sequence batch carrying a request.
    pub(crate) fn slot_request(slot: usize, entry: QueuedRequest) -> Self {
        let flags = entry.request.flags();
        let control = SlotControl {
            start: flags.start,
            end: flags.end,
            ready: true,
            correlation_id: entry.request.correlation_id(),
        };
        Self {
            slot: Some(slot),
            control: Some(control),
            request: Some(entry),
        }
    }

    /// Control-only entry for a slot without a ready request.
    pub(crate) fn padding(slot: usize, correlation_id: Option<CorrelationId>) -> Self {
        Self {
            slot: Some(slot),
            control: Some(SlotControl {
                correlation_id,
                ..Default::default()
            }),
            request: None,
        }
    }

    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    pub fn control(&self) -> Option<SlotControl> {
        self.control
    }

    pub fn inference_request(&self) -> Option<&InferenceRequest> {
        self.request.as_ref().map(|entry| &entry.request)
    }

    pub fn is_padding(&self) -> bool {
        self.request.is_none()
    }
}

/// What the scheduler needs to remember about a dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRecord {
    pub request_id: RequestId,
    pub slot: Option<usize>,
    pub correlation_id: Option<CorrelationId>,
    pub end: bool,
}

/// An execution unit handed to the backend.
#[derive(Debug)]
pub struct Batch {
    kind: BatchKind,
    instance: usize,
    entries: Vec<BatchEntry>,
    control_input: Option<ControlInputConfig>,
    formed_at: Instant,
}

impl Batch {
    pub(crate) fn dynamic(instance: usize, entries: Vec<QueuedRequest>, now: Instant) -> Self {
        Self {
            kind: BatchKind::Dynamic,
            instance,
            entries: entries.into_iter().map(BatchEntry::request).collect(),
            control_input: None,
            formed_at: now,
        }
    }

    pub(crate) fn sequence(
        instance: usize,
        entries: Vec<BatchEntry>,
        control_input: ControlInputConfig,
        now: Instant,
    ) -> Self {
        Self {
            kind: BatchKind::Sequence,
            instance,
            entries,
            control_input: Some(control_input),
            formed_at: now,
        }
    }

    pub fn kind(&self) -> BatchKind {
        self.kind
    }

    /// Instance the batch was formed for.
    pub fn instance(&self) -> usize {
        self.instance
    }

    /// Number of entries, padding included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of real requests.
    pub fn num_requests(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_padding()).count()
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    /// Real requests in entry order; backend outcomes follow this order.
    pub fn requests(&self) -> impl Iterator<Item = &InferenceRequest> {
        self.entries.iter().filter_map(BatchEntry::inference_request)
    }

    pub fn request_ids(&self) -> Vec<RequestId> {
        self.requests().map(InferenceRequest::id).collect()
    }

    pub fn formed_at(&self) -> Instant {
        self.formed_at
    }

    /// Names of the control signals, for sequence batches.
    pub fn control_input(&self) -> Option<&ControlInputConfig> {
        self.control_input.as_ref()
    }

    /// Stack input `name` of every entry along a new leading batch dimension.
    ///
    /// Padding entries, and entries lacking the input, contribute zeros shaped
    /// like the first present tensor.
    ///
    /// # Errors
    ///
    /// Fails if no entry carries the input or the shapes differ.
    pub fn stacked_input(&self, name: &str) -> candle_core::Result<Tensor> {
        let template = self
            .requests()
            .find_map(|request| request.input(name))
            .ok_or_else(|| candle_core::Error::Msg(format!("no entry carries input '{name}'")))?;
        let tensors = self
            .entries
            .iter()
            .map(|entry| match entry.inference_request().and_then(|r| r.input(name)) {
                Some(tensor) => Ok(tensor.clone()),
                None => template.zeros_like(),
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Tensor::stack(&tensors, 0)
    }

    /// Per-slot control tensors, named per the model's control input mapping.
    ///
    /// Returns `(name, tensor)` pairs for START, END, READY and the
    /// correlation id, each an `i64` vector with one element per slot. Empty
    /// for dynamic batches.
    pub fn control_tensors(&self) -> candle_core::Result<Vec<(String, Tensor)>> {
        let Some(names) = &self.control_input else {
            return Ok(Vec::new());
        };
        let controls: Vec<SlotControl> = self
            .entries
            .iter()
            .map(|entry| entry.control().unwrap_or_default())
            .collect();
        let n = controls.len();
        let column = |f: &dyn Fn(&SlotControl) -> i64| -> candle_core::Result<Tensor> {
            let values: Vec<i64> = controls.iter().map(f).collect();
            Tensor::from_vec(values, n, &Device::Cpu)
        };
        Ok(vec![
            (names.start.clone(), column(&|c| i64::from(c.start))?),
            (names.end.clone(), column(&|c| i64::from(c.end))?),
            (names.ready.clone(), column(&|c| i64::from(c.ready))?),
            (
                names.correlation_id.clone(),
                column(&|c| c.correlation_id.map_or(0, |id| id as i64))?,
            ),
        ])
    }

    /// Dispatch records for every real request, in entry order.
    pub(crate) fn records(&self) -> Vec<DispatchRecord> {
        self.entries
            .iter()
            .filter_map(|entry| {
                entry.inference_request().map(|request| DispatchRecord {
                    request_id: request.id(),
                    slot: entry.slot,
                    correlation_id: request.correlation_id(),
                    end: request.flags().end,
                })
            })
            .collect()
    }

    /// Give up ownership of the requests, in entry order.
    pub(crate) fn into_requests(self) -> Vec<QueuedRequest> {
        self.entries
            .into_iter()
            .filter_map(|entry| entry.request)
            .collect()
    }
}

/// Per-input shapes of the requests already taken into a batch.
///
/// Requests sharing a batch must agree on the shape of every input they send,
/// or the backend cannot stack them.
#[derive(Debug, Default)]
pub(crate) struct InputShapes(HashMap<String, Vec<usize>>);

impl InputShapes {
    /// Whether `request` stacks with everything recorded so far.
    pub fn fits(&self, request: &InferenceRequest) -> bool {
        request.inputs().iter().all(|input| {
            self.0
                .get(&input.name)
                .map_or(true, |dims| dims.as_slice() == input.tensor.dims())
        })
    }

    pub fn record(&mut self, request: &InferenceRequest) {
        for input in request.inputs() {
            self.0
                .entry(input.name.clone())
                .or_insert_with(|| input.tensor.dims().to_vec());
        }
    }
}
