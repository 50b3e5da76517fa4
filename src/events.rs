//! Lifecycle notifications.
//!
//! Every state change in the scheduler is published as an [`Event`] to an
//! [`EventSink`]. Publishing is synchronous and must not block: sinks either
//! handle the event inline (logging, counting) or hand it to a channel.
//!
//! Each event carries topic strings keyed by entity id and by entity type,
//! e.g. `/topic/tests/{id}/status` and `/topic/tests/status`, so transports
//! can route them without inspecting payloads.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::model::{
    LogEntry, Priority, Suite, SuiteResult, TestDefinition, TestResult, TestStatus, WorkerStatus,
};
use crate::orchestrator::autoscaler::{AutoScalerOptions, ScaleEvent};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestStatusEvent {
    pub test_id: String,
    pub name: String,
    pub status: TestStatus,
    pub priority: Priority,
    pub worker_id: Option<String>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl From<&TestDefinition> for TestStatusEvent {
    fn from(test: &TestDefinition) -> Self {
        Self {
            test_id: test.id.clone(),
            name: test.name.clone(),
            status: test.status,
            priority: test.priority,
            worker_id: test.worker_id.clone(),
            error: test.error.clone(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkerChange {
    Created,
    Removed,
    Reset,
    Acquired,
    Released,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerEvent {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub change: WorkerChange,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuiteStatusEvent {
    pub suite_id: String,
    pub name: String,
    pub status: TestStatus,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl From<&Suite> for SuiteStatusEvent {
    fn from(suite: &Suite) -> Self {
        Self {
            suite_id: suite.id.clone(),
            name: suite.name.clone(),
            status: suite.status,
            error: suite.error.clone(),
            at: Utc::now(),
        }
    }
}

/// A notification published by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    TestStatus(TestStatusEvent),
    TestResult(Box<TestResult>),
    TestLog(LogEntry),
    WorkerStatus(WorkerEvent),
    /// The autoscaler was enabled or disabled.
    AutoScalerStatus(AutoScalerOptions),
    AutoScalerOptions(AutoScalerOptions),
    Scaled(ScaleEvent),
    SuiteStatus(SuiteStatusEvent),
    SuiteResult(Box<SuiteResult>),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TestStatus(_) => "test_status",
            Self::TestResult(_) => "test_result",
            Self::TestLog(_) => "test_log",
            Self::WorkerStatus(_) => "worker_status",
            Self::AutoScalerStatus(_) => "autoscaler_status",
            Self::AutoScalerOptions(_) => "autoscaler_options",
            Self::Scaled(_) => "scaled",
            Self::SuiteStatus(_) => "suite_status",
            Self::SuiteResult(_) => "suite_result",
        }
    }

    /// Entity-specific topic first, then the entity-type topic.
    pub fn topics(&self) -> Vec<String> {
        match self {
            Self::TestStatus(e) => vec![
                format!("/topic/tests/{}/status", e.test_id),
                "/topic/tests/status".to_string(),
            ],
            Self::TestResult(r) => vec![
                format!("/topic/tests/{}/result", r.test_id),
                "/topic/tests/results".to_string(),
            ],
            Self::TestLog(entry) => match &entry.test_id {
                Some(id) => vec![format!("/topic/tests/{id}/logs")],
                None => vec!["/topic/logs".to_string()],
            },
            Self::WorkerStatus(e) => vec![
                format!("/topic/workers/{}/status", e.worker_id),
                "/topic/workers/status".to_string(),
            ],
            Self::AutoScalerStatus(_) | Self::AutoScalerOptions(_) => {
                vec!["/topic/autoscaler/status".to_string()]
            }
            Self::Scaled(_) => vec!["/topic/autoscaler/events".to_string()],
            Self::SuiteStatus(e) => vec![
                format!("/topic/test-suites/{}/status", e.suite_id),
                "/topic/test-suites/status".to_string(),
            ],
            Self::SuiteResult(r) => vec![
                format!("/topic/test-suites/{}/result", r.suite_id),
                "/topic/test-suites/results".to_string(),
            ],
        }
    }

    pub fn matches_topic(&self, topic: &str) -> bool {
        self.topics().iter().any(|t| t == topic)
    }
}

/// Receives scheduler notifications.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &Event);
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn publish(&self, event: &Event) {
        (**self).publish(event)
    }
}

/// A sink that drops everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: &Event) {}
}

/// Fans events out to several sinks in order.
pub struct MultiSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn with_sink<S: EventSink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl Default for MultiSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for MultiSink {
    fn publish(&self, event: &Event) {
        for sink in &self.sinks {
            sink.publish(event);
        }
    }
}

/// Mirrors every event into the `tracing` log at debug level.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: &Event) {
        match event {
            Event::TestStatus(e) => {
                debug!(test_id = %e.test_id, status = %e.status, "test status changed")
            }
            Event::WorkerStatus(e) => {
                debug!(worker_id = %e.worker_id, status = %e.status, change = ?e.change, "worker status changed")
            }
            Event::Scaled(e) => debug!(
                direction = ?e.direction,
                previous = e.previous_workers,
                current = e.new_workers,
                "pool scaled"
            ),
            other => debug!(kind = other.kind(), topic = ?other.topics().first(), "event"),
        }
    }
}

/// Keeps every published event in memory.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Events published on `topic`, oldest first.
    pub fn on_topic(&self, topic: &str) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.matches_topic(topic))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}

/// Broadcast bus with per-topic subscriptions.
///
/// Slow subscribers miss events rather than blocking publishers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Stream of events published on `topic` from now on.
    pub fn subscribe_topic(&self, topic: impl Into<String>) -> impl Stream<Item = Event> + Send {
        let topic = topic.into();
        BroadcastStream::new(self.sender.subscribe())
            .filter_map(move |item| item.ok().filter(|event| event.matches_topic(&topic)))
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: &Event) {
        // No subscribers is fine.
        let _ = self.sender.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TestDefinition;

    fn status_event(test: &TestDefinition) -> Event {
        Event::TestStatus(TestStatusEvent::from(test))
    }

    #[test]
    fn test_topics_cover_entity_and_type() {
        let test = TestDefinition::new("login").with_id("t-1");
        let topics = status_event(&test).topics();
        assert_eq!(topics, vec!["/topic/tests/t-1/status", "/topic/tests/status"]);
    }

    #[test]
    fn test_multi_sink_fans_out() {
        let first = Arc::new(RecordingSink::new());
        let second = Arc::new(RecordingSink::new());
        let sink = MultiSink::new()
            .with_sink(first.clone())
            .with_sink(second.clone())
            .with_sink(NullSink);

        sink.publish(&status_event(&TestDefinition::new("a")));

        assert_eq!(first.events().len(), 1);
        assert_eq!(second.events().len(), 1);
    }

    #[test]
    fn test_recording_sink_filters_by_topic() {
        let sink = RecordingSink::new();
        sink.publish(&status_event(&TestDefinition::new("a").with_id("a")));
        sink.publish(&status_event(&TestDefinition::new("b").with_id("b")));

        assert_eq!(sink.on_topic("/topic/tests/a/status").len(), 1);
        assert_eq!(sink.on_topic("/topic/tests/status").len(), 2);
    }

    #[tokio::test]
    async fn test_bus_topic_subscription() {
        let bus = EventBus::new(16);
        let stream = bus.subscribe_topic("/topic/tests/b/status");
        tokio::pin!(stream);

        bus.publish(&status_event(&TestDefinition::new("a").with_id("a")));
        bus.publish(&status_event(&TestDefinition::new("b").with_id("b")));

        let event = stream.next().await.unwrap();
        match event {
            Event::TestStatus(e) => assert_eq!(e.test_id, "b"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_bus_without_subscribers_does_not_fail() {
        let bus = EventBus::default();
        bus.publish(&status_event(&TestDefinition::new("a")));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
