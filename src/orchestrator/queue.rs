//! Priority work queue with timeout eviction.
//!
//! Entries are kept sorted by `(priority rank, enqueue sequence)`: CRITICAL
//! before HIGH before MEDIUM before LOW, and first-come first-served within a
//! band. The sequence number is assigned at enqueue time and survives
//! reprioritization, so a re-ranked test keeps its place relative to older
//! and newer tests of its new band.
//!
//! The queue lock is never held across an `.await` and events are published
//! only after it is released.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{GridError, GridResult};
use crate::events::{Event, EventSink, TestStatusEvent};
use crate::model::{Priority, TestDefinition, TestStatus};

pub const QUEUE_TIMEOUT_ERROR: &str = "Test waited too long in queue";
pub const QUEUE_CLEARED_ERROR: &str = "Test queue cleared";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub max_size: usize,
    /// Longest time a test may wait before the sweep times it out.
    pub timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_size: 100,
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

struct QueueEntry {
    test: TestDefinition,
    seq: u64,
    enqueued: Instant,
}

impl QueueEntry {
    fn key(&self) -> (u8, u64) {
        (self.test.priority.rank(), self.seq)
    }
}

/// One queued test as reported by [`WorkQueue::snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItem {
    pub id: String,
    pub name: String,
    pub status: TestStatus,
    pub priority: Priority,
    pub queued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub length: usize,
    pub max_size: usize,
    pub items: Vec<QueueItem>,
}

pub struct WorkQueue {
    entries: Mutex<Vec<QueueEntry>>,
    next_seq: AtomicU64,
    settings: QueueSettings,
    events: Arc<dyn EventSink>,
}

impl WorkQueue {
    pub fn new(settings: QueueSettings, events: Arc<dyn EventSink>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            settings,
            events,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Queues `test` and returns its 0-based position.
    ///
    /// Fails with [`GridError::QueueFull`] at capacity, leaving the queue
    /// unchanged.
    pub fn enqueue(&self, mut test: TestDefinition) -> GridResult<usize> {
        let (position, event) = {
            let mut entries = self.entries.lock();
            if entries.len() >= self.settings.max_size {
                return Err(GridError::QueueFull {
                    max: self.settings.max_size,
                });
            }
            if !test.transition(TestStatus::Queued, None) {
                return Err(GridError::AlreadySubmitted(test.id));
            }
            let entry = QueueEntry {
                seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                enqueued: Instant::now(),
                test,
            };
            let event = TestStatusEvent::from(&entry.test);
            let key = entry.key();
            let position = entries.partition_point(|e| e.key() <= key);
            entries.insert(position, entry);
            (position, event)
        };

        tracing::debug!(test_id = %event.test_id, position, "test queued");
        self.events.publish(&Event::TestStatus(event));
        Ok(position)
    }

    /// Removes and returns the next test to run.
    pub fn dequeue(&self) -> Option<TestDefinition> {
        let mut entries = self.entries.lock();
        if entries.is_empty() {
            None
        } else {
            Some(entries.remove(0).test)
        }
    }

    /// Changes a queued test's priority and returns its new position.
    pub fn reprioritize(&self, id: &str, priority: Priority) -> GridResult<usize> {
        let (position, event) = {
            let mut entries = self.entries.lock();
            let index = entries
                .iter()
                .position(|e| e.test.id == id)
                .ok_or_else(|| GridError::test_not_found(id))?;
            let mut entry = entries.remove(index);
            entry.test.priority = priority;
            let event = TestStatusEvent::from(&entry.test);
            let key = entry.key();
            let position = entries.partition_point(|e| e.key() <= key);
            entries.insert(position, entry);
            (position, event)
        };

        self.events.publish(&Event::TestStatus(event));
        Ok(position)
    }

    /// 0-based position of a queued test.
    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.entries.lock().iter().position(|e| e.test.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position_of(id).is_some()
    }

    /// Takes a test out of the queue without changing its status.
    pub fn remove(&self, id: &str) -> Option<TestDefinition> {
        let mut entries = self.entries.lock();
        let index = entries.iter().position(|e| e.test.id == id)?;
        Some(entries.remove(index).test)
    }

    /// Times out every test that has waited longer than the queue timeout.
    ///
    /// Returns the evicted tests, already in TIMEOUT status.
    pub fn sweep_timeouts(&self) -> Vec<TestDefinition> {
        let timeout = self.settings.timeout;
        let expired: Vec<QueueEntry> = {
            let mut entries = self.entries.lock();
            let (expired, keep): (Vec<_>, Vec<_>) = entries
                .drain(..)
                .partition(|e| e.enqueued.elapsed() > timeout);
            *entries = keep;
            expired
        };

        self.finish_all(expired, TestStatus::Timeout, QUEUE_TIMEOUT_ERROR)
    }

    /// Cancels and removes every queued test.
    pub fn clear(&self) -> Vec<TestDefinition> {
        let drained: Vec<QueueEntry> = self.entries.lock().drain(..).collect();
        self.finish_all(drained, TestStatus::Cancelled, QUEUE_CLEARED_ERROR)
    }

    fn finish_all(
        &self,
        entries: Vec<QueueEntry>,
        status: TestStatus,
        reason: &str,
    ) -> Vec<TestDefinition> {
        entries
            .into_iter()
            .map(|entry| {
                let mut test = entry.test;
                test.transition(status, Some(reason.to_string()));
                tracing::info!(test_id = %test.id, status = %status, "{}", reason);
                self.events
                    .publish(&Event::TestStatus(TestStatusEvent::from(&test)));
                test
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let entries = self.entries.lock();
        QueueSnapshot {
            length: entries.len(),
            max_size: self.settings.max_size,
            items: entries
                .iter()
                .map(|e| QueueItem {
                    id: e.test.id.clone(),
                    name: e.test.name.clone(),
                    status: e.test.status,
                    priority: e.test.priority,
                    queued_at: e.test.queued_at,
                })
                .collect(),
        }
    }
}
