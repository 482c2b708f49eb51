//! Backoff for transient backend errors.
//!
//! Tracks consecutive submit/poll failures per idempotency key. Each failure
//! doubles the wait before the next call, up to a cap; once the failure
//! count reaches the threshold the caller gives up and fails the block.
//! State is per replica and in memory: a replica that restarts starts over.

use std::collections::HashMap;
use std::time::Duration;

use pipegrid_core::{ExecutorSettings, exponential_delay_secs};
use tracing::{debug, warn};

/// What to do after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffVerdict {
    /// Try again at this instant (epoch seconds).
    RetryAt(u64),
    /// Threshold reached; escalate to a block failure.
    Exhausted { failures: u32 },
}

#[derive(Debug, Clone, Copy)]
struct BackoffState {
    failures: u32,
    next_try_at: u64,
}

#[derive(Debug)]
pub struct BackoffTracker {
    entries: HashMap<String, BackoffState>,
    max_failures: u32,
    base: Duration,
    max: Duration,
}

impl BackoffTracker {
    pub fn new(max_failures: u32, base: Duration, max: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_failures: max_failures.max(1),
            base,
            max,
        }
    }

    pub fn from_settings(settings: &ExecutorSettings) -> Self {
        Self::new(
            settings.max_transient_failures,
            settings.transient_backoff_base,
            settings.transient_backoff_max,
        )
    }

    /// Whether a call for `key` may be made at `now`.
    pub fn ready(&self, key: &str, now: u64) -> bool {
        self.entries.get(key).is_none_or(|s| now >= s.next_try_at)
    }

    pub fn record_failure(&mut self, key: &str, now: u64) -> BackoffVerdict {
        let state = self.entries.entry(key.to_string()).or_insert(BackoffState {
            failures: 0,
            next_try_at: now,
        });
        state.failures += 1;

        if state.failures >= self.max_failures {
            let failures = state.failures;
            self.entries.remove(key);
            warn!(%key, failures, "transient failure threshold reached");
            return BackoffVerdict::Exhausted { failures };
        }

        state.next_try_at = now + exponential_delay_secs(self.base, self.max, state.failures);
        debug!(%key, failures = state.failures, retry_at = state.next_try_at, "backing off");
        BackoffVerdict::RetryAt(state.next_try_at)
    }

    /// A call for `key` went through; forget its failures.
    pub fn record_success(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// Consecutive failures currently recorded for `key`.
    pub fn failures(&self, key: &str) -> u32 {
        self.entries.get(key).map_or(0, |s| s.failures)
    }

    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}
