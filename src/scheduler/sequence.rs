//! Sequence batcher for stateful models.
//!
//! Every correlation id is pinned to one slot of one instance from its
//! `START` until its `END` completes. Each slot runs at most one request at a
//! time, so a sequence reaches the backend strictly in submission order.
//!
//! ```text
//!   enqueue(req, corr)
//!        │
//!        ├─ bound to an Active slot ───────────────► slot pipeline
//!        ├─ START, free slot somewhere ── bind ────► slot pipeline
//!        ├─ START, no free slot, blocking ─────────► backlog (+ followers)
//!        ├─ START, no free slot, non-blocking ─────► NO_AVAILABLE_SLOT
//!        └─ no START, unbound ─────────────────────► SEQUENCE_NOT_FOUND
//! ```
//!
//! A batch always covers every slot of the instance in index order. Slots
//! without a ready request get a control-only padding entry, as do ready slots
//! whose next request does not stack with the ones already taken.
//!
//! Requests are checked against the declared inputs on arrival; a bad one
//! fails alone and its sequence keeps its slot.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::batch::{Batch, BatchEntry, BatchKind, DispatchRecord, InputShapes};
use super::{Batcher, Failed, Formed};
use crate::config::{check_inputs, ControlInputConfig, InputConfig, ModelConfig, QueueLayout};
use crate::core::policy::QueuePolicy;
use crate::core::queue::{PriorityQueues, QueuedRequest};
use crate::core::request::{CorrelationId, InferenceRequest};
use crate::core::slot::{SequenceSlot, SlotState, SlotTable};
use crate::error::{Error, Rejected, RequestError, Result};

/// Binds correlated request streams to fixed slots.
#[derive(Debug)]
pub struct SequenceBatcher {
    tables: Vec<SlotTable>,
    halted: Vec<bool>,
    /// Correlation id to `(instance, slot)`.
    bindings: HashMap<CorrelationId, (usize, usize)>,
    /// `START` requests waiting for a free slot.
    backlog: PriorityQueues,
    /// Requests that arrived behind a `START` still in the backlog.
    followers: HashMap<CorrelationId, Vec<QueuedRequest>>,
    /// Sequences failed by a timeout and when; they stay failed until a new
    /// `START` or until the retention period passes.
    timed_out: HashMap<CorrelationId, Instant>,
    timed_out_retention: Duration,
    inputs: Vec<InputConfig>,
    policy: QueuePolicy,
    blocking: bool,
    idle_timeout: Option<Duration>,
    control_input: ControlInputConfig,
}

impl SequenceBatcher {
    pub fn new(config: &ModelConfig, now: Instant) -> Self {
        let seq = config.sequence_batching.clone().unwrap_or_default();
        let instances = config.instance_count.max(1);
        let slots = seq.max_candidate_sequences.max(1);
        Self {
            tables: (0..instances)
                .map(|instance| SlotTable::new(instance, slots, now))
                .collect(),
            halted: vec![false; instances],
            bindings: HashMap::new(),
            backlog: PriorityQueues::new(&QueueLayout::single(seq.queue_policy.clone())),
            followers: HashMap::new(),
            timed_out: HashMap::new(),
            timed_out_retention: Duration::from_micros(seq.timed_out_retention_microseconds),
            inputs: config.inputs.clone(),
            policy: seq.queue_policy,
            blocking: seq.blocking,
            idle_timeout: (seq.max_sequence_idle_microseconds > 0)
                .then(|| Duration::from_micros(seq.max_sequence_idle_microseconds)),
            control_input: seq.control_input,
        }
    }

    /// Slot table of `instance`.
    pub fn table(&self, instance: usize) -> Option<&SlotTable> {
        self.tables.get(instance)
    }

    /// `(instance, slot)` currently bound to `correlation_id`.
    pub fn binding(&self, correlation_id: CorrelationId) -> Option<(usize, usize)> {
        self.bindings.get(&correlation_id).copied()
    }

    /// Number of sequences waiting for a slot.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Number of timed-out correlation ids still remembered.
    pub fn num_timed_out(&self) -> usize {
        self.timed_out.len()
    }

    fn is_timed_out(&self, correlation_id: CorrelationId, now: Instant) -> bool {
        self.timed_out
            .get(&correlation_id)
            .is_some_and(|&at| now.saturating_duration_since(at) < self.timed_out_retention)
    }

    /// Drop timed-out ids older than the retention period.
    fn forget_timed_out(&mut self, now: Instant) {
        let retention = self.timed_out_retention;
        self.timed_out
            .retain(|_, &mut at| now.saturating_duration_since(at) < retention);
    }

    /// Bind to the lowest free slot, scanning instances in order.
    fn bind_free(&mut self, correlation_id: CorrelationId, now: Instant) -> Option<(usize, usize)> {
        for (instance, table) in self.tables.iter_mut().enumerate() {
            if self.halted[instance] {
                continue;
            }
            if let Some(index) = table.bind(correlation_id, now) {
                self.bindings.insert(correlation_id, (instance, index));
                return Some((instance, index));
            }
        }
        None
    }

    fn push_backlog(
        &mut self,
        request: InferenceRequest,
        correlation_id: CorrelationId,
        now: Instant,
    ) -> std::result::Result<(), Rejected<InferenceRequest>> {
        match self.backlog.enqueue(request, now) {
            Ok(()) => {
                debug!(correlation_id, backlog = self.backlog.len(), "sequence waiting for a slot");
                self.followers.insert(correlation_id, Vec::new());
                Ok(())
            }
            Err(rejected) if !self.blocking => Err(Rejected::new(
                rejected.request,
                RequestError::NoAvailableSlot,
            )),
            Err(rejected) => Err(rejected),
        }
    }

    /// Fail everything queued behind a backlogged `START`.
    fn fail_followers(
        &mut self,
        correlation_id: CorrelationId,
        now: Instant,
        failed: &mut Vec<Failed>,
    ) {
        if let Some(followers) = self.followers.remove(&correlation_id) {
            failed.extend(
                followers
                    .into_iter()
                    .map(|entry| (entry.request, RequestError::SequenceTimeout(correlation_id))),
            );
        }
        self.timed_out.insert(correlation_id, now);
    }

    /// Apply timeouts to sequences that never got a slot.
    fn expire_backlog(&mut self, now: Instant, failed: &mut Vec<Failed>) {
        for entry in self.backlog.take_expired(now) {
            let correlation_id = entry.request.correlation_id().unwrap_or_default();
            debug!(correlation_id, "sequence start timed out waiting for a slot");
            failed.push((entry.request, RequestError::TimeoutExpired));
            self.fail_followers(correlation_id, now, failed);
        }

        let stalled: Vec<CorrelationId> = self
            .followers
            .iter()
            .filter(|(_, entries)| entries.iter().any(|entry| entry.is_rejectable(now)))
            .map(|(&correlation_id, _)| correlation_id)
            .collect();
        for correlation_id in stalled {
            let starts = self
                .backlog
                .remove_where(|entry| entry.request.correlation_id() == Some(correlation_id));
            failed.extend(
                starts
                    .into_iter()
                    .map(|entry| (entry.request, RequestError::SequenceTimeout(correlation_id))),
            );
            self.fail_followers(correlation_id, now, failed);
        }
    }

    /// Tear down timed-out sequences and reclaim idle slots.
    ///
    /// Every live instance is checked, so a request stuck behind a busy
    /// instance still fails at its deadline. A slot with a request in flight
    /// stays `Ending` and is released when that request completes.
    fn expire_slots(&mut self, now: Instant, failed: &mut Vec<Failed>) {
        for (instance, table) in self.tables.iter_mut().enumerate() {
            if self.halted[instance] {
                continue;
            }
            let mut timed_out = Vec::new();
            let mut idle = Vec::new();
            for slot in table.iter() {
                let Some(correlation_id) = slot.correlation_id() else {
                    continue;
                };
                if slot.pending().any(|entry| entry.is_rejectable(now)) {
                    timed_out.push((slot.index(), correlation_id));
                } else if let Some(limit) = self.idle_timeout {
                    if slot.state() == SlotState::Active
                        && slot.is_quiescent()
                        && now.saturating_duration_since(slot.last_activity()) >= limit
                    {
                        idle.push((slot.index(), correlation_id));
                    }
                }
            }

            for (index, correlation_id) in timed_out {
                warn!(instance, slot = index, correlation_id, "sequence timed out, tearing down slot");
                let leftovers = table.begin_teardown(index);
                failed.extend(
                    leftovers
                        .into_iter()
                        .map(|entry| (entry.request, RequestError::SequenceTimeout(correlation_id))),
                );
                self.timed_out.insert(correlation_id, now);
                if let Some(request_id) = table.slot(index).and_then(SequenceSlot::in_flight) {
                    debug!(instance, slot = index, correlation_id, request_id, "slot release waits for in-flight request");
                    continue;
                }
                match table.release(index, now) {
                    Ok(_) => {
                        self.bindings.remove(&correlation_id);
                    }
                    Err(err) => {
                        error!(instance, slot = index, correlation_id, error = %err, "failed to release timed-out slot");
                    }
                }
            }

            for (index, correlation_id) in idle {
                match table.release(index, now) {
                    Ok(_) => {
                        info!(instance, slot = index, correlation_id, "reclaimed idle sequence slot");
                        self.bindings.remove(&correlation_id);
                    }
                    Err(err) => {
                        error!(instance, slot = index, correlation_id, error = %err, "failed to release idle slot");
                    }
                }
            }
        }
    }

    /// Move backlogged sequences into free slots of `instance`.
    fn fill_free_slots(&mut self, instance: usize, now: Instant, failed: &mut Vec<Failed>) {
        let table = &mut self.tables[instance];
        let mut skipped = Vec::new();
        while table.has_free_slot() {
            let Some(entry) = self.backlog.pop_front() else {
                break;
            };
            let Some(correlation_id) = entry.request.correlation_id() else {
                failed.push((
                    entry.request,
                    RequestError::InvalidRequest("sequence request without correlation id".into()),
                ));
                continue;
            };
            // The previous sequence under this id is still tearing down.
            if self.bindings.contains_key(&correlation_id) {
                skipped.push(entry);
                continue;
            }
            let Some(index) = table.bind(correlation_id, now) else {
                skipped.push(entry);
                break;
            };
            self.bindings.insert(correlation_id, (instance, index));
            if let Some(slot) = table.slot_mut(index) {
                slot.push(entry, now);
                for follower in self.followers.remove(&correlation_id).unwrap_or_default() {
                    slot.push(follower, now);
                }
            }
            debug!(instance, slot = index, correlation_id, "bound backlogged sequence");
        }
        for entry in skipped.into_iter().rev() {
            self.backlog.push_front(entry);
        }
    }

    /// Earliest instant at which a timeout could change what any live
    /// instance holds.
    fn next_wake(&self, now: Instant) -> Option<Instant> {
        let live = || {
            self.tables
                .iter()
                .zip(&self.halted)
                .filter(|(_, halted)| !**halted)
                .flat_map(|(table, _)| table.iter())
        };
        let slot_deadlines = live()
            .flat_map(SequenceSlot::pending)
            .filter_map(|entry| entry.deadline);
        let follower_deadlines = self
            .followers
            .values()
            .flatten()
            .filter_map(|entry| entry.deadline);
        let idle_deadlines = live()
            .filter(|slot| slot.state() == SlotState::Active && slot.is_quiescent())
            .filter_map(|slot| self.idle_timeout.map(|limit| slot.last_activity() + limit));

        slot_deadlines
            .chain(follower_deadlines)
            .chain(idle_deadlines)
            .filter(|&deadline| deadline > now)
            .chain(self.backlog.next_deadline_after(now))
            .min()
    }
}

impl Batcher for SequenceBatcher {
    fn kind(&self) -> BatchKind {
        BatchKind::Sequence
    }

    fn enqueue(
        &mut self,
        request: InferenceRequest,
        now: Instant,
    ) -> std::result::Result<(), Rejected<InferenceRequest>> {
        let Some(correlation_id) = request.correlation_id() else {
            return Err(Rejected::new(
                request,
                RequestError::InvalidRequest("sequence model requires a correlation id".into()),
            ));
        };
        let start = request.flags().start;

        if !start && self.is_timed_out(correlation_id, now) {
            return Err(Rejected::new(
                request,
                RequestError::SequenceTimeout(correlation_id),
            ));
        }
        if let Err(reason) = check_inputs(&self.inputs, &request) {
            debug!(correlation_id, request_id = request.id(), %reason, "rejecting invalid sequence request");
            return Err(Rejected::new(request, RequestError::InvalidRequest(reason)));
        }
        if start {
            self.timed_out.remove(&correlation_id);
        }

        if let Some(followers) = self.followers.get_mut(&correlation_id) {
            followers.push(QueuedRequest::admit(request, &self.policy, now));
            return Ok(());
        }

        if let Some(&(instance, index)) = self.bindings.get(&correlation_id) {
            if let Some(slot) = self.tables[instance]
                .slot_mut(index)
                .filter(|slot| slot.state() == SlotState::Active)
            {
                slot.push(QueuedRequest::admit(request, &self.policy, now), now);
                return Ok(());
            }
            // The sequence under this id already sent its END.
            if !start {
                return Err(Rejected::new(
                    request,
                    RequestError::SequenceNotFound(correlation_id),
                ));
            }
            return self.push_backlog(request, correlation_id, now);
        }

        if !start {
            return Err(Rejected::new(
                request,
                RequestError::SequenceNotFound(correlation_id),
            ));
        }

        if let Some((instance, index)) = self.bind_free(correlation_id, now) {
            debug!(instance, slot = index, correlation_id, "bound sequence");
            if let Some(slot) = self.tables[instance].slot_mut(index) {
                slot.push(QueuedRequest::admit(request, &self.policy, now), now);
            }
            return Ok(());
        }

        if !self.blocking {
            return Err(Rejected::new(request, RequestError::NoAvailableSlot));
        }
        self.push_backlog(request, correlation_id, now)
    }

    fn try_form_batch(&mut self, instance: usize, now: Instant) -> Formed {
        let mut failed = Vec::new();
        if self.halted.get(instance).copied().unwrap_or(true) {
            return Formed::idle(failed, None);
        }

        self.forget_timed_out(now);
        self.expire_backlog(now, &mut failed);
        self.expire_slots(now, &mut failed);
        self.fill_free_slots(instance, now, &mut failed);

        if !self.tables[instance].iter().any(SequenceSlot::is_ready) {
            let wake_at = self.next_wake(now);
            return Formed::idle(failed, wake_at);
        }

        let mut shapes = InputShapes::default();
        let entries: Vec<BatchEntry> = self.tables[instance]
            .iter_mut()
            .map(|slot| {
                let index = slot.index();
                let fits = slot
                    .pending()
                    .next()
                    .is_some_and(|next| shapes.fits(&next.request));
                match fits.then(|| slot.dispatch(now)).flatten() {
                    Some(entry) => {
                        shapes.record(&entry.request);
                        BatchEntry::slot_request(index, entry)
                    }
                    None => BatchEntry::padding(index, slot.correlation_id()),
                }
            })
            .collect();
        let batch = Batch::sequence(instance, entries, self.control_input.clone(), now);
        debug!(
            instance,
            slots = batch.len(),
            ready = batch.num_requests(),
            "formed sequence batch"
        );
        Formed {
            batch: Some(batch),
            failed,
            wake_at: None,
        }
    }

    fn on_complete(
        &mut self,
        instance: usize,
        records: &[DispatchRecord],
        now: Instant,
    ) -> Result<Vec<Failed>> {
        let mut failed = Vec::new();
        let table = self.tables.get_mut(instance).ok_or_else(|| Error::SlotTable {
            instance,
            detail: "no slot table for instance".into(),
        })?;
        for record in records {
            let (Some(index), Some(correlation_id)) = (record.slot, record.correlation_id) else {
                return Err(Error::SlotTable {
                    instance,
                    detail: format!("request {} completed without a slot", record.request_id),
                });
            };
            if self.bindings.get(&correlation_id) != Some(&(instance, index)) {
                return Err(Error::SlotTable {
                    instance,
                    detail: format!(
                        "sequence {correlation_id} completed on slot {index} but is bound to {:?}",
                        self.bindings.get(&correlation_id)
                    ),
                });
            }
            let Some(leftovers) = table.complete(index, correlation_id, record.request_id, now)?
            else {
                continue;
            };
            self.bindings.remove(&correlation_id);
            debug!(instance, slot = index, correlation_id, "sequence slot freed");
            let timed_out = self
                .timed_out
                .get(&correlation_id)
                .is_some_and(|&at| now.saturating_duration_since(at) < self.timed_out_retention);
            let error = if timed_out {
                RequestError::SequenceTimeout(correlation_id)
            } else {
                RequestError::SequenceNotFound(correlation_id)
            };
            failed.extend(
                leftovers
                    .into_iter()
                    .map(|entry| (entry.request, error.clone())),
            );
        }
        Ok(failed)
    }

    fn halt_instance(&mut self, instance: usize) -> Vec<InferenceRequest> {
        let Some(table) = self.tables.get_mut(instance) else {
            return Vec::new();
        };
        self.halted[instance] = true;
        let bound: Vec<(CorrelationId, usize)> = self
            .bindings
            .iter()
            .filter(|(_, &(owner, _))| owner == instance)
            .map(|(&correlation_id, &(_, index))| (correlation_id, index))
            .collect();
        let mut orphaned = Vec::new();
        for (correlation_id, index) in bound {
            self.bindings.remove(&correlation_id);
            orphaned.extend(table.begin_teardown(index).into_iter().map(|entry| entry.request));
        }
        orphaned
    }

    fn drain(&mut self) -> Vec<InferenceRequest> {
        let mut drained: Vec<InferenceRequest> = self
            .backlog
            .drain_all()
            .into_iter()
            .map(|entry| entry.request)
            .collect();
        for (_, followers) in self.followers.drain() {
            drained.extend(followers.into_iter().map(|entry| entry.request));
        }
        for table in &mut self.tables {
            for index in 0..table.num_slots() {
                drained.extend(table.begin_teardown(index).into_iter().map(|entry| entry.request));
            }
        }
        drained
    }

    fn num_pending(&self) -> usize {
        let in_slots: usize = self
            .tables
            .iter()
            .flat_map(SlotTable::iter)
            .map(SequenceSlot::num_pending)
            .sum();
        let following: usize = self.followers.values().map(Vec::len).sum();
        self.backlog.len() + following + in_slots
    }
}
