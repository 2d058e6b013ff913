//! Queue admission and timeout policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What happens to a request that outlives its timeout while queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutAction {
    /// Drop the request and fail it with `TIMEOUT_EXPIRED`.
    #[default]
    Reject,
    /// Keep the request; it closes the forming batch and rides in the next one.
    Delay,
}

/// Admission and timeout rules for one priority level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuePolicy {
    /// Maximum queued requests at this level (0 = unbounded).
    pub max_queue_size: usize,
    /// Action taken on expired requests.
    pub timeout_action: TimeoutAction,
    /// Queue timeout in microseconds (0 = no timeout).
    #[serde(alias = "default_timeout_microseconds")]
    pub timeout_micros: u64,
    /// Allow requests to carry their own, shorter, timeout.
    pub allow_timeout_override: bool,
}

impl QueuePolicy {
    /// Whether a level holding `len` requests can take one more.
    pub fn has_room(&self, len: usize) -> bool {
        self.max_queue_size == 0 || len < self.max_queue_size
    }

    /// Resolve the timeout for a request that asked for `requested` microseconds.
    ///
    /// An override is honored only when the policy allows it and it is not
    /// longer than the policy's own timeout. A zero override is ignored.
    ///
    /// ```
    /// use std::time::Duration;
    /// use nano_batch::core::policy::QueuePolicy;
    ///
    /// let policy = QueuePolicy {
    ///     timeout_micros: 1_000,
    ///     allow_timeout_override: true,
    ///     ..Default::default()
    /// };
    /// assert_eq!(policy.effective_timeout(Some(200)), Some(Duration::from_micros(200)));
    /// assert_eq!(policy.effective_timeout(Some(5_000)), Some(Duration::from_micros(1_000)));
    /// assert_eq!(policy.effective_timeout(None), Some(Duration::from_micros(1_000)));
    /// ```
    pub fn effective_timeout(&self, requested: Option<u64>) -> Option<Duration> {
        let overridden = requested.filter(|&micros| {
            micros > 0
                && self.allow_timeout_override
                && (self.timeout_micros == 0 || micros <= self.timeout_micros)
        });
        match overridden {
            Some(micros) => Some(Duration::from_micros(micros)),
            None if self.timeout_micros > 0 => Some(Duration::from_micros(self.timeout_micros)),
            None => None,
        }
    }
}
