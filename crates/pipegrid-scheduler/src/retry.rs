//! Block retry policy.

use std::time::Duration;

use pipegrid_core::{RetrySettings, exponential_delay_secs};
use pipegrid_state::BlockRun;

/// Exponential backoff between block attempts. The retry budget itself
/// lives on each block run (`max_retries`), resolved at run creation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            backoff_base: settings.backoff_base,
            backoff_max: settings.backoff_max,
        }
    }

    /// Whether a failure of the block's current attempt earns another attempt.
    pub fn should_retry(&self, block: &BlockRun) -> bool {
        block.attempt <= block.max_retries
    }

    /// Earliest start of retry number `retry` (1-based).
    pub fn next_attempt_at(&self, retry: u32, now: u64) -> u64 {
        now + exponential_delay_secs(self.backoff_base, self.backoff_max, retry)
    }
}

#[cfg(test)]
mod tests {
    use pipegrid_state::{BlockDef, ExecutorKind};

    use super::*;

    #[test]
    fn budget_allows_max_retries_plus_one_attempts() {
        let def = BlockDef {
            id: "b".to_string(),
            upstream: vec![],
            executor: ExecutorKind::Local,
            max_retries: 2,
            command: String::new(),
        };
        let mut block = BlockRun::pending("r", &def, 0);
        let policy = RetryPolicy::default();

        let mut attempts = 1;
        while policy.should_retry(&block) {
            block.attempt += 1;
            attempts += 1;
        }
        assert_eq!(attempts, 3);
    }

    #[test]
    fn backoff_grows_per_retry() {
        let policy = RetryPolicy {
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(12),
        };
        assert_eq!(policy.next_attempt_at(1, 100), 105);
        assert_eq!(policy.next_attempt_at(2, 100), 110);
        assert_eq!(policy.next_attempt_at(3, 100), 112);
    }
}
