//! Queue-driven pool scaling.
//!
//! Each tick compares the queue length to the number of idle workers:
//!
//! | Condition | Action |
//! |-----------|--------|
//! | `queue >= scale_up_threshold` and no idle worker | add `scale_up_step` workers, capped at `max_workers` |
//! | `queue <= scale_down_threshold` and more than one idle worker | remove `scale_down_step` idle workers, floored at `min_workers` |
//!
//! A [`ScaleEvent`] is published only when the pool size actually changed.
//! The scaler never runs tests and never reorders the queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{AutoScalerConfig, PoolConfig};
use crate::error::GridResult;
use crate::events::{Event, EventSink};
use crate::orchestrator::pool::WorkerPool;
use crate::orchestrator::queue::WorkQueue;

/// Runtime options of the autoscaler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoScalerOptions {
    pub enabled: bool,
    pub check_interval_ms: u64,
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up_threshold: usize,
    pub scale_down_threshold: usize,
    pub scale_up_step: usize,
    pub scale_down_step: usize,
}

impl AutoScalerOptions {
    pub fn from_config(autoscaler: &AutoScalerConfig, pool: &PoolConfig) -> Self {
        Self {
            enabled: autoscaler.enabled,
            check_interval_ms: autoscaler.check_interval_ms,
            min_workers: pool.min_workers,
            max_workers: pool.max_workers,
            scale_up_threshold: autoscaler.scale_up_threshold,
            scale_down_threshold: autoscaler.scale_down_threshold,
            scale_up_step: autoscaler.scale_up_step,
            scale_down_step: autoscaler.scale_down_step,
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }
}

impl Default for AutoScalerOptions {
    fn default() -> Self {
        Self::from_config(&AutoScalerConfig::default(), &PoolConfig::default())
    }
}

/// Partial update; only the `Some` fields are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoScalerUpdate {
    pub enabled: Option<bool>,
    pub check_interval_ms: Option<u64>,
    pub min_workers: Option<usize>,
    pub max_workers: Option<usize>,
    pub scale_up_threshold: Option<usize>,
    pub scale_down_threshold: Option<usize>,
    pub scale_up_step: Option<usize>,
    pub scale_down_step: Option<usize>,
}

impl AutoScalerUpdate {
    fn apply(&self, options: &mut AutoScalerOptions) {
        if let Some(v) = self.enabled {
            options.enabled = v;
        }
        if let Some(v) = self.check_interval_ms {
            options.check_interval_ms = v;
        }
        if let Some(v) = self.min_workers {
            options.min_workers = v;
        }
        if let Some(v) = self.max_workers {
            options.max_workers = v;
        }
        if let Some(v) = self.scale_up_threshold {
            options.scale_up_threshold = v;
        }
        if let Some(v) = self.scale_down_threshold {
            options.scale_down_threshold = v;
        }
        if let Some(v) = self.scale_up_step {
            options.scale_up_step = v;
        }
        if let Some(v) = self.scale_down_step {
            options.scale_down_step = v;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScaleDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaleEvent {
    pub direction: ScaleDirection,
    pub previous_workers: usize,
    pub new_workers: usize,
    pub queue_length: usize,
    pub idle_workers: usize,
    pub at: DateTime<Utc>,
}

pub struct AutoScaler {
    options: RwLock<AutoScalerOptions>,
    pool: Arc<WorkerPool>,
    queue: Arc<WorkQueue>,
    events: Arc<dyn EventSink>,
    wake: Notify,
}

impl AutoScaler {
    pub fn new(
        options: AutoScalerOptions,
        pool: Arc<WorkerPool>,
        queue: Arc<WorkQueue>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            options: RwLock::new(options),
            pool,
            queue,
            events,
            wake: Notify::new(),
        }
    }

    pub fn options(&self) -> AutoScalerOptions {
        self.options.read().clone()
    }

    /// Applies a partial update. Worker bounds are pushed to the pool.
    pub fn update_options(&self, update: &AutoScalerUpdate) -> GridResult<AutoScalerOptions> {
        let mut next = self.options();
        update.apply(&mut next);
        self.pool.set_limits(next.min_workers, next.max_workers)?;

        let previous = std::mem::replace(&mut *self.options.write(), next.clone());
        if previous.enabled != next.enabled {
            info!(enabled = next.enabled, "Autoscaler toggled");
            self.events.publish(&Event::AutoScalerStatus(next.clone()));
        }
        if previous != next {
            self.events.publish(&Event::AutoScalerOptions(next.clone()));
        }
        self.wake.notify_one();
        Ok(next)
    }

    pub fn set_enabled(&self, enabled: bool) -> GridResult<AutoScalerOptions> {
        self.update_options(&AutoScalerUpdate {
            enabled: Some(enabled),
            ..Default::default()
        })
    }

    /// Requests an immediate evaluation from the running loop.
    pub fn nudge(&self) {
        self.wake.notify_one();
    }

    /// Runs one evaluation. Returns the scale event when the pool size
    /// changed.
    pub async fn tick(&self) -> Option<ScaleEvent> {
        let options = self.options();
        if !options.enabled {
            return None;
        }

        let queue_length = self.queue.len();
        let idle = self.pool.idle_count();
        let previous = self.pool.len();

        let direction = if queue_length >= options.scale_up_threshold && idle == 0 {
            self.scale_up(options.scale_up_step).await;
            ScaleDirection::Up
        } else if queue_length <= options.scale_down_threshold && idle > 1 {
            self.pool.scale_down(options.scale_down_step).await;
            ScaleDirection::Down
        } else {
            return None;
        };

        let current = self.pool.len();
        if current == previous {
            debug!(?direction, workers = current, "Scaling had no effect");
            return None;
        }

        info!(
            "Scaled {:?} from {} to {} workers (queue: {}, idle: {})",
            direction, previous, current, queue_length, idle
        );
        let event = ScaleEvent {
            direction,
            previous_workers: previous,
            new_workers: current,
            queue_length,
            idle_workers: idle,
            at: Utc::now(),
        };
        self.events.publish(&Event::Scaled(event.clone()));
        Some(event)
    }

    async fn scale_up(&self, step: usize) {
        for _ in 0..step {
            if let Err(e) = self.pool.create_worker().await {
                debug!("Scale up stopped: {}", e);
                break;
            }
        }
    }

    /// Evaluates on every interval tick or nudge until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let interval = self.options().check_interval();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = self.wake.notified() => {}
            }
            if shutdown.is_cancelled() {
                break;
            }
            self.tick().await;
        }
        debug!("Autoscaler loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::model::TestDefinition;
    use crate::orchestrator::pool::PoolSettings;
    use crate::orchestrator::queue::QueueSettings;
    use crate::store::MemoryStore;

    struct Fixture {
        scaler: Arc<AutoScaler>,
        pool: Arc<WorkerPool>,
        queue: Arc<WorkQueue>,
        sink: Arc<RecordingSink>,
    }

    fn fixture(min: usize, max: usize) -> Fixture {
        let sink = Arc::new(RecordingSink::new());
        let pool = Arc::new(WorkerPool::new(
            PoolSettings {
                min_workers: min,
                max_workers: max,
                idle_timeout: Duration::from_secs(60),
            },
            Arc::new(MemoryStore::new()),
            sink.clone(),
        ));
        let queue = Arc::new(WorkQueue::new(QueueSettings::default(), sink.clone()));
        let options = AutoScalerOptions {
            enabled: true,
            min_workers: min,
            max_workers: max,
            ..AutoScalerOptions::default()
        };
        let scaler = Arc::new(AutoScaler::new(
            options,
            pool.clone(),
            queue.clone(),
            sink.clone(),
        ));
        Fixture {
            scaler,
            pool,
            queue,
            sink,
        }
    }

    fn enqueue(queue: &WorkQueue, n: usize) {
        for i in 0..n {
            queue
                .enqueue(TestDefinition::new(format!("t{i}")))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_scales_up_by_one_step_when_backlogged() {
        let f = fixture(1, 5);
        f.pool.initialize().await;
        let _busy = f.pool.acquire_idle().await.unwrap();
        enqueue(&f.queue, 3);

        let event = f.scaler.tick().await.unwrap();
        assert_eq!(event.direction, ScaleDirection::Up);
        assert_eq!(event.previous_workers, 1);
        assert_eq!(event.new_workers, 2);
        assert_eq!(event.queue_length, 3);
        assert_eq!(event.idle_workers, 0);
        assert_eq!(f.pool.len(), 2);
        assert_eq!(f.sink.on_topic("/topic/autoscaler/events").len(), 1);
    }

    #[tokio::test]
    async fn test_no_scale_up_with_idle_workers() {
        let f = fixture(1, 5);
        f.pool.initialize().await;
        enqueue(&f.queue, 3);
        assert!(f.scaler.tick().await.is_none());
        assert_eq!(f.pool.len(), 1);
    }

    #[tokio::test]
    async fn test_scale_up_capped_at_max() {
        let f = fixture(0, 2);
        let _a = f.pool.acquire_idle().await.unwrap();
        let _b = f.pool.acquire_idle().await.unwrap();
        enqueue(&f.queue, 4);

        assert!(f.scaler.tick().await.is_none());
        assert_eq!(f.pool.len(), 2);
        assert!(f.sink.on_topic("/topic/autoscaler/events").is_empty());
    }

    #[tokio::test]
    async fn test_scales_down_idle_surplus() {
        let f = fixture(1, 5);
        for _ in 0..3 {
            f.pool.create_worker().await.unwrap();
        }

        let event = f.scaler.tick().await.unwrap();
        assert_eq!(event.direction, ScaleDirection::Down);
        assert_eq!(event.new_workers, 2);

        f.scaler.tick().await.unwrap();
        assert_eq!(f.pool.len(), 1);
        assert!(f.scaler.tick().await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_scaler_is_silent() {
        let f = fixture(1, 5);
        f.scaler.set_enabled(false).unwrap();
        f.pool.initialize().await;
        let _busy = f.pool.acquire_idle().await.unwrap();
        enqueue(&f.queue, 5);
        assert!(f.scaler.tick().await.is_none());
    }

    #[tokio::test]
    async fn test_partial_update_and_events() {
        let f = fixture(1, 5);
        let options = f
            .scaler
            .update_options(&AutoScalerUpdate {
                max_workers: Some(8),
                scale_up_step: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(options.max_workers, 8);
        assert_eq!(options.scale_up_step, 2);
        assert_eq!(options.min_workers, 1);
        assert!(options.enabled);
        assert_eq!(f.pool.limits().max_workers, 8);

        let events = f.sink.events();
        assert!(matches!(events.last(), Some(Event::AutoScalerOptions(_))));
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, Event::AutoScalerStatus(_)))
        );

        f.scaler.set_enabled(false).unwrap();
        let toggles = f
            .sink
            .on_topic("/topic/autoscaler/status")
            .into_iter()
            .filter(|e| matches!(e, Event::AutoScalerStatus(o) if !o.enabled))
            .count();
        assert_eq!(toggles, 1);
    }

    #[tokio::test]
    async fn test_invalid_bounds_rejected() {
        let f = fixture(1, 5);
        assert!(
            f.scaler
                .update_options(&AutoScalerUpdate {
                    min_workers: Some(9),
                    ..Default::default()
                })
                .is_err()
        );
        assert_eq!(f.scaler.options().min_workers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_reacts_to_nudge() {
        let f = fixture(0, 3);
        f.scaler
            .update_options(&AutoScalerUpdate {
                check_interval_ms: Some(3_600_000),
                ..Default::default()
            })
            .unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(f.scaler.clone().run(shutdown.clone()));

        enqueue(&f.queue, 2);
        f.scaler.nudge();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.pool.len(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
