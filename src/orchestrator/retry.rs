//! Whole-test retry accounting and flakiness detection.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

/// Tracks attempts per test and flags tests that passed only on retry.
///
/// Counters live per test only while the test executes; [`finish`]
/// folds them into running totals.
///
/// [`finish`]: RetryTracker::finish
#[derive(Clone, Default)]
pub struct RetryTracker {
    /// Per executing test: (attempts, successes).
    attempts: Arc<Mutex<HashMap<String, (u32, u32)>>>,
    finished: Arc<Mutex<RetryStats>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets earlier executions of `test_id`.
    pub fn reset(&self, test_id: &str) {
        self.attempts.lock().remove(test_id);
    }

    /// Whether another attempt is allowed given `max_retries`.
    pub fn should_retry(&self, test_id: &str, max_retries: u32) -> bool {
        self.attempts(test_id) <= max_retries
    }

    pub fn record_attempt(&self, test_id: &str, success: bool) {
        let mut attempts = self.attempts.lock();
        let entry = attempts.entry(test_id.to_string()).or_insert((0, 0));
        entry.0 = entry.0.saturating_add(1);
        if success {
            entry.1 = entry.1.saturating_add(1);
        }
    }

    /// Settles the counters of a finished execution into the totals.
    pub fn finish(&self, test_id: &str) {
        let Some((attempts, successes)) = self.attempts.lock().remove(test_id) else {
            return;
        };
        let mut finished = self.finished.lock();
        finished.total_tests += 1;
        finished.total_retries += attempts.saturating_sub(1) as usize;
        if is_flaky(attempts, successes) {
            finished.flaky_tests += 1;
        }
    }

    /// Tests with counters that have not been settled yet.
    pub fn in_flight(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn attempts(&self, test_id: &str) -> u32 {
        self.attempts
            .lock()
            .get(test_id)
            .map(|(count, _)| *count)
            .unwrap_or(0)
    }

    /// A test is flaky if it passed after at least one failed attempt.
    pub fn is_flaky(&self, test_id: &str) -> bool {
        self.attempts
            .lock()
            .get(test_id)
            .is_some_and(|&(attempts, successes)| is_flaky(attempts, successes))
    }

    /// Totals over settled executions plus the ones still running.
    pub fn stats(&self) -> RetryStats {
        let mut stats = *self.finished.lock();
        let attempts = self.attempts.lock();
        stats.total_tests += attempts.len();
        stats.total_retries += attempts
            .values()
            .map(|(count, _)| count.saturating_sub(1) as usize)
            .sum::<usize>();
        stats.flaky_tests += attempts.values().filter(|(a, s)| is_flaky(*a, *s)).count();
        stats
    }
}

fn is_flaky(attempts: u32, successes: u32) -> bool {
    attempts > 1 && successes > 0 && successes < attempts
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    /// Executions, counting a resubmitted test once per run.
    pub total_tests: usize,
    /// Attempts beyond the first, summed over all tests.
    pub total_retries: usize,
    pub flaky_tests: usize,
}
