//! Sequence slots for stateful execution.
//!
//! Each model instance owns a fixed [`SlotTable`]. A slot is a lane the
//! backend keeps per-sequence state in, identified by its position, so a
//! sequence must stay on the same slot from its `START` to its `END`.
//!
//! ## Slot lifecycle
//!
//! ```text
//!            bind(corr_id)              END dispatched
//!   ┌──────┐ ───────────► ┌────────┐ ───────────────► ┌────────┐
//!   │ Free │              │ Active │                  │ Ending │
//!   └──────┘ ◄─────────── └────────┘                  └────────┘
//!       ▲      idle / timeout                              │
//!       └──────────────────────────────────────────────────┘
//!                        END completed
//! ```
//!
//! Freed slots go back on a free list that hands out the lowest index first.

use std::collections::{BTreeSet, VecDeque};
use std::time::Instant;

use crate::core::queue::QueuedRequest;
use crate::core::request::{CorrelationId, RequestId};
use crate::error::{Error, Result};

/// State of a sequence slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// Not bound to any sequence.
    Free,
    /// Bound, between the accepted `START` and the accepted `END`.
    Active,
    /// The final request is in flight, or the sequence is being torn down.
    Ending,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "Free",
            Self::Active => "Active",
            Self::Ending => "Ending",
        }
    }
}

/// One fixed execution slot.
#[derive(Debug)]
pub struct SequenceSlot {
    index: usize,
    correlation_id: Option<CorrelationId>,
    state: SlotState,
    last_activity: Instant,
    /// Requests of the bound sequence not yet dispatched, in order.
    pending: VecDeque<QueuedRequest>,
    /// Request currently inside the backend, if any.
    in_flight: Option<RequestId>,
}

impl SequenceSlot {
    fn new(index: usize, now: Instant) -> Self {
        Self {
            index,
            correlation_id: None,
            state: SlotState::Free,
            last_activity: now,
            pending: VecDeque::new(),
            in_flight: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn in_flight(&self) -> Option<RequestId> {
        self.in_flight
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &QueuedRequest> {
        self.pending.iter()
    }

    /// Whether a request can be dispatched from this slot right now.
    pub fn is_ready(&self) -> bool {
        self.state == SlotState::Active && self.in_flight.is_none() && !self.pending.is_empty()
    }

    /// Whether the sequence has nothing queued or running.
    pub fn is_quiescent(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    /// Queue a request behind the sequence's earlier requests.
    pub fn push(&mut self, entry: QueuedRequest, now: Instant) {
        self.last_activity = now;
        self.pending.push_back(entry);
    }

    /// Take the next request for dispatch and mark it in flight.
    ///
    /// An `END` request moves the slot to [`SlotState::Ending`].
    pub fn dispatch(&mut self, now: Instant) -> Option<QueuedRequest> {
        if !self.is_ready() {
            return None;
        }
        let entry = self.pending.pop_front()?;
        self.in_flight = Some(entry.request.id());
        self.last_activity = now;
        if entry.request.flags().end {
            self.state = SlotState::Ending;
        }
        Some(entry)
    }

    /// Record completion of the in-flight request.
    ///
    /// # Errors
    ///
    /// Returns the id the slot expected when `request_id` is not in flight here.
    fn complete(
        &mut self,
        request_id: RequestId,
        now: Instant,
    ) -> std::result::Result<(), Option<RequestId>> {
        if self.in_flight != Some(request_id) {
            return Err(self.in_flight);
        }
        self.in_flight = None;
        self.last_activity = now;
        Ok(())
    }

    /// Remove pending requests matching `pred`.
    pub fn remove_pending<F>(&mut self, mut pred: F) -> Vec<QueuedRequest>
    where
        F: FnMut(&QueuedRequest) -> bool,
    {
        let (removed, kept): (Vec<_>, Vec<_>) = self.pending.drain(..).partition(|e| pred(e));
        self.pending = kept.into();
        removed
    }
}

/// Fixed set of sequence slots for one model instance.
///
/// # Example
///
/// ```
/// use std::time::Instant;
/// use nano_batch::core::slot::{SlotState, SlotTable};
///
/// let now = Instant::now();
/// let mut table = SlotTable::new(0, 2, now);
///
/// let slot = table.bind(1001, now).unwrap();
/// assert_eq!(slot, 0);
/// assert_eq!(table.slot(slot).unwrap().state(), SlotState::Active);
/// assert_eq!(table.num_free_slots(), 1);
///
/// table.release(slot, now).unwrap();
/// assert_eq!(table.num_free_slots(), 2);
/// ```
#[derive(Debug)]
pub struct SlotTable {
    instance: usize,
    slots: Vec<SequenceSlot>,
    free_list: BTreeSet<usize>,
}

impl SlotTable {
    /// Create a table of `num_slots` free slots for `instance`.
    pub fn new(instance: usize, num_slots: usize, now: Instant) -> Self {
        Self {
            instance,
            slots: (0..num_slots).map(|i| SequenceSlot::new(i, now)).collect(),
            free_list: (0..num_slots).collect(),
        }
    }

    pub fn instance(&self) -> usize {
        self.instance
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn num_free_slots(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_active_slots(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }

    pub fn has_free_slot(&self) -> bool {
        !self.free_list.is_empty()
    }

    pub fn slot(&self, index: usize) -> Option<&SequenceSlot> {
        self.slots.get(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut SequenceSlot> {
        self.slots.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SequenceSlot> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SequenceSlot> {
        self.slots.iter_mut()
    }

    /// Bind `correlation_id` to the lowest free slot.
    ///
    /// Returns `None` when every slot is taken.
    pub fn bind(&mut self, correlation_id: CorrelationId, now: Instant) -> Option<usize> {
        let index = self.free_list.pop_first()?;
        let slot = &mut self.slots[index];
        slot.correlation_id = Some(correlation_id);
        slot.state = SlotState::Active;
        slot.last_activity = now;
        Some(index)
    }

    /// Record completion of `request_id` on slot `index`.
    ///
    /// When the slot was `Ending` it is freed, and the requests that were
    /// queued behind the sequence's end are returned as `Some(leftovers)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SlotTable`] if the slot is not bound to
    /// `correlation_id` or is not running `request_id`.
    pub fn complete(
        &mut self,
        index: usize,
        correlation_id: CorrelationId,
        request_id: RequestId,
        now: Instant,
    ) -> Result<Option<Vec<QueuedRequest>>> {
        let instance = self.instance;
        let slot = self.slots.get_mut(index).ok_or_else(|| Error::SlotTable {
            instance,
            detail: format!("slot {index} does not exist"),
        })?;
        if slot.correlation_id != Some(correlation_id) {
            return Err(Error::SlotTable {
                instance,
                detail: format!(
                    "slot {index} bound to {:?}, completion for sequence {correlation_id}",
                    slot.correlation_id
                ),
            });
        }
        slot.complete(request_id, now).map_err(|expected| Error::SlotTable {
            instance,
            detail: format!(
                "slot {index} has {expected:?} in flight, completion for request {request_id}"
            ),
        })?;

        if slot.state == SlotState::Ending {
            return self.release(index, now).map(Some);
        }
        Ok(None)
    }

    /// Free slot `index`, returning requests still queued on it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SlotTable`] when the slot is already free or still has
    /// a request in flight.
    pub fn release(&mut self, index: usize, now: Instant) -> Result<Vec<QueuedRequest>> {
        let instance = self.instance;
        let slot = self.slots.get_mut(index).ok_or_else(|| Error::SlotTable {
            instance,
            detail: format!("slot {index} does not exist"),
        })?;
        if slot.state == SlotState::Free {
            return Err(Error::SlotTable {
                instance,
                detail: format!("slot {index} released twice"),
            });
        }
        if let Some(request_id) = slot.in_flight {
            return Err(Error::SlotTable {
                instance,
                detail: format!("slot {index} released with request {request_id} in flight"),
            });
        }
        slot.correlation_id = None;
        slot.state = SlotState::Free;
        slot.last_activity = now;
        let leftovers = slot.pending.drain(..).collect();
        self.free_list.insert(index);
        Ok(leftovers)
    }

    /// Mark a slot for teardown; it is released once its in-flight request completes.
    pub fn begin_teardown(&mut self, index: usize) -> Vec<QueuedRequest> {
        match self.slots.get_mut(index) {
            Some(slot) if slot.state != SlotState::Free => {
                slot.state = SlotState::Ending;
                slot.pending.drain(..).collect()
            }
            _ => Vec::new(),
        }
    }
}
