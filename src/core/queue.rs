//! Per-priority FIFO request queues with admission control.
//!
//! ```text
//!   enqueue(req)                                   batcher
//!        │                                            │
//!        ▼                                            ▼
//!   resolve level ──► policy.has_room? ──no──► Rejected(QUEUE_FULL)
//!        │                   │yes
//!        │                   ▼
//!        │        ┌──────────────────────┐
//!        │        │ level 1  [a][b][c]   │ ◄── drained first
//!        │        │ level 2  [d][e]      │
//!        │        │ level 3  [f]         │
//!        │        └──────────────────────┘
//! ```
//!
//! Timeouts are not driven by a timer per request. Each entry carries the
//! deadline resolved at admission, and batchers check it when they consider
//! the entry ([`PriorityQueues::take_expired`], [`PriorityQueue::urgent_len`]).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::QueueLayout;
use crate::core::policy::{QueuePolicy, TimeoutAction};
use crate::core::request::{InferenceRequest, PriorityLevel};
use crate::error::{Rejected, RequestError};

/// An admitted request with the policy decisions frozen at admission.
#[derive(Debug)]
pub struct QueuedRequest {
    pub request: InferenceRequest,
    /// Admission time.
    pub enqueued_at: Instant,
    /// Instant after which the timeout action applies.
    pub deadline: Option<Instant>,
    /// Action resolved from the level's policy.
    pub timeout_action: TimeoutAction,
}

impl QueuedRequest {
    /// Admit `request` under `policy`, stamping its arrival time.
    pub fn admit(mut request: InferenceRequest, policy: &QueuePolicy, now: Instant) -> Self {
        request.mark_arrival(now);
        let deadline = policy
            .effective_timeout(request.timeout_micros())
            .map(|timeout| now + timeout);
        Self {
            request,
            enqueued_at: now,
            deadline,
            timeout_action: policy.timeout_action,
        }
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Expired under a `REJECT` policy: must be dropped.
    pub fn is_rejectable(&self, now: Instant) -> bool {
        self.timeout_action == TimeoutAction::Reject && self.is_expired(now)
    }

    /// Expired under a `DELAY` policy: must go out in the next batch.
    pub fn is_urgent(&self, now: Instant) -> bool {
        self.timeout_action == TimeoutAction::Delay && self.is_expired(now)
    }

    /// Time spent waiting so far.
    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }
}

/// FIFO queue for a single priority level.
#[derive(Debug)]
pub struct PriorityQueue {
    level: PriorityLevel,
    policy: QueuePolicy,
    entries: VecDeque<QueuedRequest>,
}

impl PriorityQueue {
    pub fn new(level: PriorityLevel, policy: QueuePolicy) -> Self {
        Self {
            level,
            policy,
            entries: VecDeque::new(),
        }
    }

    pub fn level(&self) -> PriorityLevel {
        self.level
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn front(&self) -> Option<&QueuedRequest> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedRequest> {
        self.entries.iter()
    }

    /// Append to the tail if the policy allows it.
    pub fn push(
        &mut self,
        request: InferenceRequest,
        now: Instant,
    ) -> Result<(), Rejected<InferenceRequest>> {
        if !self.policy.has_room(self.entries.len()) {
            return Err(Rejected::new(request, RequestError::QueueFull));
        }
        let entry = QueuedRequest::admit(request, &self.policy, now);
        self.entries.push_back(entry);
        Ok(())
    }

    /// Put an entry back at the head, keeping its original admission data.
    pub fn push_front(&mut self, entry: QueuedRequest) {
        self.entries.push_front(entry);
    }

    pub fn pop_front(&mut self) -> Option<QueuedRequest> {
        self.entries.pop_front()
    }

    /// Remove every entry matching `pred`, preserving the order of the rest.
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<QueuedRequest>
    where
        F: FnMut(&QueuedRequest) -> bool,
    {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if pred(&entry) {
                removed.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        removed
    }

    /// Number of head entries that must leave in the next batch.
    ///
    /// That is everything up to and including the last expired `DELAY` entry,
    /// so taking them keeps FIFO order within the level.
    pub fn urgent_len(&self, now: Instant) -> usize {
        self.entries
            .iter()
            .rposition(|entry| entry.is_urgent(now))
            .map_or(0, |pos| pos + 1)
    }

    /// Earliest deadline among entries that is still ahead of `now`.
    pub fn next_deadline_after(&self, now: Instant) -> Option<Instant> {
        self.entries
            .iter()
            .filter_map(|entry| entry.deadline)
            .filter(|&deadline| deadline > now)
            .min()
    }

    fn drain(&mut self) -> impl Iterator<Item = QueuedRequest> + '_ {
        self.entries.drain(..)
    }
}

/// The full set of priority queues for one scheduler.
///
/// Levels are 1-based; level 1 is always drained first.
///
/// # Example
///
/// ```
/// use std::time::Instant;
/// use nano_batch::config::QueueLayout;
/// use nano_batch::core::completion::Completion;
/// use nano_batch::core::queue::PriorityQueues;
/// use nano_batch::core::request::InferenceRequest;
///
/// let mut layout = QueueLayout::default();
/// layout.levels = 2;
/// layout.default_level = 2;
/// let mut queues = PriorityQueues::new(&layout);
///
/// let now = Instant::now();
/// queues.enqueue(InferenceRequest::new(1, Completion::detached()), now).unwrap();
/// queues
///     .enqueue(InferenceRequest::new(2, Completion::detached()).with_priority(1), now)
///     .unwrap();
///
/// assert_eq!(queues.pop_front().unwrap().request.id(), 2);
/// assert_eq!(queues.pop_front().unwrap().request.id(), 1);
/// ```
#[derive(Debug)]
pub struct PriorityQueues {
    queues: Vec<PriorityQueue>,
    default_level: PriorityLevel,
}

impl PriorityQueues {
    pub fn new(layout: &QueueLayout) -> Self {
        let levels = layout.levels.max(1);
        let queues = (1..=levels)
            .map(|level| PriorityQueue::new(level, layout.policy_for(level).clone()))
            .collect();
        Self {
            queues,
            default_level: layout.default_level.clamp(1, levels),
        }
    }

    /// Number of priority levels.
    pub fn num_levels(&self) -> usize {
        self.queues.len()
    }

    /// Map a request priority to a level: 0 and unknown levels use the default.
    pub fn resolve_level(&self, priority: PriorityLevel) -> PriorityLevel {
        if priority == 0 || priority as usize > self.queues.len() {
            self.default_level
        } else {
            priority
        }
    }

    /// Queue for `level` (1-based).
    pub fn level(&self, level: PriorityLevel) -> Option<&PriorityQueue> {
        (level as usize)
            .checked_sub(1)
            .and_then(|idx| self.queues.get(idx))
    }

    /// Admit a request into the queue of its level.
    ///
    /// # Errors
    ///
    /// Hands the request back with [`RequestError::QueueFull`] when the level
    /// is at capacity. Nothing already queued is evicted.
    pub fn enqueue(
        &mut self,
        request: InferenceRequest,
        now: Instant,
    ) -> Result<(), Rejected<InferenceRequest>> {
        let level = self.resolve_level(request.priority());
        self.queues[level as usize - 1].push(request, now)
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(PriorityQueue::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(PriorityQueue::is_empty)
    }

    /// Iterate all entries in dequeue order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedRequest> {
        self.queues.iter().flat_map(PriorityQueue::iter)
    }

    /// Next entry in dequeue order without removing it.
    pub fn peek(&self) -> Option<&QueuedRequest> {
        self.queues.iter().find_map(PriorityQueue::front)
    }

    /// Highest non-empty level.
    pub fn highest_pending_level(&self) -> Option<PriorityLevel> {
        self.queues.iter().find(|q| !q.is_empty()).map(PriorityQueue::level)
    }

    /// Remove the next entry: highest level first, FIFO within a level.
    pub fn pop_front(&mut self) -> Option<QueuedRequest> {
        self.queues.iter_mut().find_map(PriorityQueue::pop_front)
    }

    /// Return an entry to the head of its level.
    pub fn push_front(&mut self, entry: QueuedRequest) {
        let level = self.resolve_level(entry.request.priority());
        self.queues[level as usize - 1].push_front(entry);
    }

    /// Pop the head of a specific level.
    pub fn pop_level(&mut self, level: PriorityLevel) -> Option<QueuedRequest> {
        (level as usize)
            .checked_sub(1)
            .and_then(|idx| self.queues.get_mut(idx))
            .and_then(PriorityQueue::pop_front)
    }

    /// Remove entries that expired under a `REJECT` policy.
    pub fn take_expired(&mut self, now: Instant) -> Vec<QueuedRequest> {
        self.remove_where(|entry| entry.is_rejectable(now))
    }

    /// Remove every entry matching `pred`, across all levels.
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<QueuedRequest>
    where
        F: FnMut(&QueuedRequest) -> bool,
    {
        self.queues
            .iter_mut()
            .flat_map(|queue| queue.remove_where(&mut pred))
            .collect()
    }

    /// Per-level count of head entries that are due in the next batch.
    pub fn urgent_lens(&self, now: Instant) -> Vec<usize> {
        self.queues.iter().map(|q| q.urgent_len(now)).collect()
    }

    /// Whether any level holds an expired `DELAY` entry.
    pub fn has_urgent(&self, now: Instant) -> bool {
        self.queues.iter().any(|q| q.urgent_len(now) > 0)
    }

    /// Admission time of the oldest queued entry.
    pub fn oldest_enqueued(&self) -> Option<Instant> {
        self.queues
            .iter()
            .filter_map(|q| q.front().map(|entry| entry.enqueued_at))
            .min()
    }

    /// Earliest timeout deadline across all levels that is still ahead of `now`.
    pub fn next_deadline_after(&self, now: Instant) -> Option<Instant> {
        self.queues
            .iter()
            .filter_map(|queue| queue.next_deadline_after(now))
            .min()
    }

    /// Remove everything, in dequeue order.
    pub fn drain_all(&mut self) -> Vec<QueuedRequest> {
        self.queues
            .iter_mut()
            .flat_map(|queue| queue.drain().collect::<Vec<_>>())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::completion::Completion;

    fn request(id: u64, priority: u32) -> InferenceRequest {
        InferenceRequest::new(id, Completion::detached()).with_priority(priority)
    }

    fn layout(levels: u32, default_level: u32) -> QueueLayout {
        QueueLayout {
            levels,
            default_level,
            ..Default::default()
        }
    }

    #[test]
    fn test_fifo_within_level() {
        let mut queues = PriorityQueues::new(&layout(1, 1));
        let now = Instant::now();
        for id in 0..5 {
            queues.enqueue(request(id, 0), now).unwrap();
        }
        let order: Vec<_> = std::iter::from_fn(|| queues.pop_front())
            .map(|e| e.request.id())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_unknown_priority_uses_default_level() {
        let queues = PriorityQueues::new(&layout(3, 2));
        assert_eq!(queues.resolve_level(0), 2);
        assert_eq!(queues.resolve_level(9), 2);
        assert_eq!(queues.resolve_level(3), 3);
    }

    #[test]
    fn test_queue_full_rejects_without_eviction() {
        let mut layout = layout(2, 1);
        layout.level_policies.insert(
            1,
            QueuePolicy {
                max_queue_size: 2,
                ..Default::default()
            },
        );
        let mut queues = PriorityQueues::new(&layout);
        let now = Instant::now();
        queues.enqueue(request(1, 1), now).unwrap();
        queues.enqueue(request(2, 1), now).unwrap();

        let rejected = queues.enqueue(request(3, 1), now).unwrap_err();
        assert_eq!(rejected.error, RequestError::QueueFull);
        assert_eq!(rejected.request.id(), 3);
        assert_eq!(queues.len(), 2);

        // Level 2 is unbounded.
        queues.enqueue(request(4, 2), now).unwrap();
        assert_eq!(queues.len(), 3);
    }

    #[test]
    fn test_take_expired_reject_only() {
        let mut layout = layout(2, 1);
        layout.level_policies.insert(
            1,
            QueuePolicy {
                timeout_micros: 10,
                ..Default::default()
            },
        );
        layout.level_policies.insert(
            2,
            QueuePolicy {
                timeout_micros: 10,
                timeout_action: TimeoutAction::Delay,
                ..Default::default()
            },
        );
        let mut queues = PriorityQueues::new(&layout);
        let now = Instant::now();
        queues.enqueue(request(1, 1), now).unwrap();
        queues.enqueue(request(2, 2), now).unwrap();

        let later = now + Duration::from_millis(1);
        let expired = queues.take_expired(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].request.id(), 1);
        assert!(queues.has_urgent(later));
        assert_eq!(queues.urgent_lens(later), vec![0, 1]);
    }

    #[test]
    fn test_urgent_len_covers_older_entries() {
        let mut queue = PriorityQueue::new(
            1,
            QueuePolicy {
                timeout_action: TimeoutAction::Delay,
                allow_timeout_override: true,
                ..Default::default()
            },
        );
        let now = Instant::now();
        queue.push(request(1, 1), now).unwrap();
        queue.push(request(2, 1).with_timeout_micros(5), now).unwrap();
        queue.push(request(3, 1), now).unwrap();

        let later = now + Duration::from_millis(1);
        assert_eq!(queue.urgent_len(later), 2);
    }

    #[test]
    fn test_remove_where_preserves_order() {
        let mut queues = PriorityQueues::new(&layout(1, 1));
        let now = Instant::now();
        for id in 0..6 {
            queues.enqueue(request(id, 0), now).unwrap();
        }
        let removed = queues.remove_where(|e| e.request.id() % 2 == 0);
        assert_eq!(removed.len(), 3);
        let rest: Vec<_> = queues.iter().map(|e| e.request.id()).collect();
        assert_eq!(rest, vec![1, 3, 5]);
    }
}
