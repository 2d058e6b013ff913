//! Dynamic batcher for stateless requests.
//!
//! Requests wait in per-priority queues until a batch closes. A batch closes
//! when one of these holds:
//!
//! - enough requests are pending to fill the preferred batch size
//! - the oldest pending request has waited `max_queue_delay`
//! - a request under a `DELAY` policy passed its timeout
//!
//! ## Per-instance state
//!
//! ```text
//!   ┌──────┐  enqueue  ┌──────────────┐  close  ┌───────┐  take  ┌────────────┐
//!   │ Idle │ ────────► │ Accumulating │ ──────► │ Ready │ ─────► │ Dispatched │
//!   └──────┘           └──────────────┘         └───────┘        └────────────┘
//!      ▲                                                               │
//!      └────────────────────────── on_complete ────────────────────────┘
//! ```
//!
//! Expired `DELAY` entries are taken first, highest level first, together
//! with every entry ahead of them in their level so FIFO order holds. The
//! rest of the batch is filled in priority order.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::batch::{Batch, BatchKind, DispatchRecord, InputShapes};
use super::{Batcher, Failed, Formed};
use crate::config::{check_inputs, InputConfig, ModelConfig, QueueLayout};
use crate::core::queue::{PriorityQueues, QueuedRequest};
use crate::core::request::{InferenceRequest, PriorityLevel};
use crate::error::{Rejected, RequestError, Result};

/// Batching state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatcherState {
    /// Nothing pending.
    Idle,
    /// Requests pending, waiting for a closing condition.
    Accumulating,
    /// A batch closed and is being assembled.
    Ready,
    /// A batch is executing on the instance.
    Dispatched,
}

impl BatcherState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Accumulating => "Accumulating",
            Self::Ready => "Ready",
            Self::Dispatched => "Dispatched",
        }
    }
}

/// Why a candidate did not join the batch.
enum Skip {
    /// Fails on its own; formation goes on.
    Invalid(QueuedRequest, String),
    /// Cannot share a batch with what was taken; formation stops.
    Incompatible(QueuedRequest),
}

/// Groups stateless requests into batches.
#[derive(Debug)]
pub struct DynamicBatcher {
    queues: PriorityQueues,
    inputs: Vec<InputConfig>,
    max_batch_size: usize,
    preferred_batch_size: usize,
    max_queue_delay: Duration,
    delay_closes_across_levels: bool,
    states: Vec<BatcherState>,
}

impl DynamicBatcher {
    /// Create a batcher for `config`.
    ///
    /// Without a `dynamic_batching` block every request runs alone.
    pub fn new(config: &ModelConfig) -> Self {
        let instances = config.instance_count.max(1);
        let inputs = config.inputs.clone();
        match &config.dynamic_batching {
            Some(db) => Self {
                queues: PriorityQueues::new(&db.queue_layout()),
                inputs,
                max_batch_size: config.effective_max_batch_size(),
                preferred_batch_size: config.preferred_batch_size(),
                max_queue_delay: Duration::from_micros(db.max_queue_delay_micros),
                delay_closes_across_levels: db.delay_closes_across_levels,
                states: vec![BatcherState::Idle; instances],
            },
            None => Self {
                queues: PriorityQueues::new(&QueueLayout::default()),
                inputs,
                max_batch_size: 1,
                preferred_batch_size: 1,
                max_queue_delay: Duration::ZERO,
                delay_closes_across_levels: false,
                states: vec![BatcherState::Idle; instances],
            },
        }
    }

    /// Current state of `instance`.
    pub fn state(&self, instance: usize) -> BatcherState {
        self.states
            .get(instance)
            .copied()
            .unwrap_or(BatcherState::Idle)
    }

    pub fn queues(&self) -> &PriorityQueues {
        &self.queues
    }

    fn set_state(&mut self, instance: usize, state: BatcherState) {
        if let Some(slot) = self.states.get_mut(instance) {
            *slot = state;
        }
    }

    /// Whether an expired `DELAY` entry forces the batch closed now.
    ///
    /// Unless configured otherwise only the highest pending level counts;
    /// expired entries further down ride along with the next batch that closes.
    fn delay_forces_close(&self, now: Instant) -> bool {
        if self.delay_closes_across_levels {
            return self.queues.has_urgent(now);
        }
        self.queues
            .highest_pending_level()
            .and_then(|level| self.queues.level(level))
            .is_some_and(|queue| queue.urgent_len(now) > 0)
    }

    /// Try to add `entry` to the batch being assembled.
    fn admit(
        &self,
        entry: QueuedRequest,
        shapes: &mut InputShapes,
    ) -> std::result::Result<QueuedRequest, Skip> {
        if let Err(reason) = check_inputs(&self.inputs, &entry.request) {
            return Err(Skip::Invalid(entry, reason));
        }
        if !shapes.fits(&entry.request) {
            return Err(Skip::Incompatible(entry));
        }
        shapes.record(&entry.request);
        Ok(entry)
    }

    /// Take up to `limit` requests: expired `DELAY` prefixes first, then priority order.
    fn collect(&mut self, limit: usize, now: Instant, failed: &mut Vec<Failed>) -> Vec<QueuedRequest> {
        let mut taken = Vec::with_capacity(limit);
        let mut shapes = InputShapes::default();

        let urgent = self.queues.urgent_lens(now);
        let mut blocked = false;
        'levels: for (idx, count) in urgent.into_iter().enumerate() {
            let level = idx as PriorityLevel + 1;
            for _ in 0..count {
                if taken.len() >= limit {
                    break 'levels;
                }
                let Some(entry) = self.queues.pop_level(level) else {
                    break;
                };
                if !self.place(entry, &mut shapes, &mut taken, failed) {
                    blocked = true;
                    break 'levels;
                }
            }
        }

        while !blocked && taken.len() < limit {
            let Some(entry) = self.queues.pop_front() else {
                break;
            };
            blocked = !self.place(entry, &mut shapes, &mut taken, failed);
        }
        taken
    }

    /// Returns `false` when the entry went back to its queue and formation must stop.
    fn place(
        &mut self,
        entry: QueuedRequest,
        shapes: &mut InputShapes,
        taken: &mut Vec<QueuedRequest>,
        failed: &mut Vec<Failed>,
    ) -> bool {
        match self.admit(entry, shapes) {
            Ok(entry) => {
                taken.push(entry);
                true
            }
            Err(Skip::Invalid(entry, reason)) => {
                debug!(request_id = entry.request.id(), %reason, "rejecting invalid request");
                failed.push((entry.request, RequestError::InvalidRequest(reason)));
                true
            }
            Err(Skip::Incompatible(entry)) => {
                trace!(request_id = entry.request.id(), "shape differs, closing batch early");
                self.queues.push_front(entry);
                false
            }
        }
    }
}

impl Batcher for DynamicBatcher {
    fn kind(&self) -> BatchKind {
        BatchKind::Dynamic
    }

    fn enqueue(
        &mut self,
        request: InferenceRequest,
        now: Instant,
    ) -> std::result::Result<(), Rejected<InferenceRequest>> {
        self.queues.enqueue(request, now)
    }

    fn try_form_batch(&mut self, instance: usize, now: Instant) -> Formed {
        let mut failed: Vec<Failed> = self
            .queues
            .take_expired(now)
            .into_iter()
            .map(|entry| {
                debug!(request_id = entry.request.id(), waited = ?entry.waited(now), "queue timeout expired");
                (entry.request, RequestError::TimeoutExpired)
            })
            .collect();

        let Some(oldest) = self.queues.oldest_enqueued() else {
            self.set_state(instance, BatcherState::Idle);
            return Formed::idle(failed, None);
        };

        let pending = self.queues.len();
        let window_end = oldest + self.max_queue_delay;
        let full = pending >= self.preferred_batch_size;
        let window_elapsed = now >= window_end;
        let forced = self.delay_forces_close(now);

        if !(full || window_elapsed || forced) {
            self.set_state(instance, BatcherState::Accumulating);
            let wake_at = self
                .queues
                .next_deadline_after(now)
                .map_or(window_end, |deadline| deadline.min(window_end));
            return Formed::idle(failed, Some(wake_at));
        }

        self.set_state(instance, BatcherState::Ready);
        let limit = if window_elapsed || forced {
            self.max_batch_size
        } else {
            self.preferred_batch_size
        };
        let entries = self.collect(limit, now, &mut failed);
        if entries.is_empty() {
            self.set_state(instance, BatcherState::Idle);
            return Formed::idle(failed, None);
        }

        debug!(
            instance,
            size = entries.len(),
            pending,
            full,
            window_elapsed,
            forced,
            "closed dynamic batch"
        );
        self.set_state(instance, BatcherState::Dispatched);
        Formed {
            batch: Some(Batch::dynamic(instance, entries, now)),
            failed,
            wake_at: None,
        }
    }

    fn on_complete(
        &mut self,
        instance: usize,
        _records: &[DispatchRecord],
        _now: Instant,
    ) -> Result<Vec<Failed>> {
        self.set_state(instance, BatcherState::Idle);
        Ok(Vec::new())
    }

    fn halt_instance(&mut self, instance: usize) -> Vec<InferenceRequest> {
        self.set_state(instance, BatcherState::Idle);
        Vec::new()
    }

    fn drain(&mut self) -> Vec<InferenceRequest> {
        self.queues
            .drain_all()
            .into_iter()
            .map(|entry| entry.request)
            .collect()
    }

    fn num_pending(&self) -> usize {
        self.queues.len()
    }
}
