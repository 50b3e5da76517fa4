//! Worker pool with bounded size and idle reclamation.
//!
//! The [`WorkerPool`] owns the live set of workers. A worker runs at most one
//! test at a time: [`acquire_idle`](WorkerPool::acquire_idle) flips a worker
//! from IDLE to BUSY under its map-shard lock and hands out a
//! [`WorkerLease`], and only [`release`](WorkerPool::release) flips it back.
//!
//! Membership changes (create, remove, reclaim) are serialized by a single
//! lock so that concurrent creators can never push the pool past
//! `max_workers` and concurrent reclaimers can never drop it below
//! `min_workers`. Store writes and notifications happen after every lock is
//! released.
//!
//! # Example
//!
//! ```ignore
//! let pool = WorkerPool::new(settings, store, events);
//! pool.initialize().await;
//!
//! if let Some(lease) = pool.acquire_idle().await {
//!     // ... run one test on lease.worker_id() ...
//!     pool.release(lease.worker_id()).await;
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{GridError, GridResult};
use crate::events::{Event, EventSink, WorkerChange, WorkerEvent};
use crate::model::{Worker, WorkerStatus};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub min_workers: usize,
    pub max_workers: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_workers: 3,
            max_workers: 10,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolLimits {
    pub min_workers: usize,
    pub max_workers: usize,
}

/// Worker counts by status plus the current bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    /// Workers retired since the pool was created.
    pub offline: usize,
    pub error: usize,
    pub min_workers: usize,
    pub max_workers: usize,
}

/// Exclusive claim on a BUSY worker.
///
/// The token fires when the worker is force-removed while holding the lease.
#[derive(Debug, Clone)]
pub struct WorkerLease {
    worker_id: String,
    token: CancellationToken,
}

impl WorkerLease {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

struct Slot {
    worker: Worker,
    idle_since: Instant,
    token: Option<CancellationToken>,
}

impl Slot {
    fn new(worker: Worker, token: Option<CancellationToken>) -> Self {
        Self {
            worker,
            idle_since: Instant::now(),
            token,
        }
    }

    fn claim(&mut self) -> WorkerLease {
        let token = CancellationToken::new();
        self.worker.set_status(WorkerStatus::Busy);
        self.token = Some(token.clone());
        WorkerLease {
            worker_id: self.worker.id.clone(),
            token,
        }
    }
}

pub struct WorkerPool {
    workers: DashMap<String, Slot>,
    limits: RwLock<PoolLimits>,
    idle_timeout: Duration,
    membership: Mutex<()>,
    retired: AtomicUsize,
    store: Arc<dyn Store>,
    events: Arc<dyn EventSink>,
}

impl WorkerPool {
    pub fn new(settings: PoolSettings, store: Arc<dyn Store>, events: Arc<dyn EventSink>) -> Self {
        Self {
            workers: DashMap::new(),
            limits: RwLock::new(PoolLimits {
                min_workers: settings.min_workers,
                max_workers: settings.max_workers,
            }),
            idle_timeout: settings.idle_timeout,
            membership: Mutex::new(()),
            retired: AtomicUsize::new(0),
            store,
            events,
        }
    }

    /// Creates workers until the pool holds `min_workers`.
    pub async fn initialize(&self) -> usize {
        let min = self.limits().min_workers;
        let mut created = 0;
        while self.len() < min {
            match self.create_worker().await {
                Ok(_) => created += 1,
                Err(e) => {
                    warn!("Stopped pool initialization: {}", e);
                    break;
                }
            }
        }
        info!("Worker pool initialized with {} workers", self.len());
        created
    }

    /// Adds one IDLE worker.
    pub async fn create_worker(&self) -> GridResult<Worker> {
        let worker = self.insert(WorkerStatus::Idle)?.0;
        self.record(&worker, WorkerChange::Created).await;
        Ok(worker)
    }

    fn insert(&self, status: WorkerStatus) -> GridResult<(Worker, Option<WorkerLease>)> {
        let _membership = self.membership.lock();
        let max = self.limits.read().max_workers;
        if self.workers.len() >= max {
            return Err(GridError::PoolExhausted { max });
        }
        let mut slot = Slot::new(Worker::new(WorkerStatus::Idle), None);
        let lease = (status == WorkerStatus::Busy).then(|| slot.claim());
        let worker = slot.worker.clone();
        self.workers.insert(worker.id.clone(), slot);
        Ok((worker, lease))
    }

    /// Claims an IDLE worker, creating one when none is idle and the pool is
    /// below its maximum. Never waits.
    pub async fn acquire_idle(&self) -> Option<WorkerLease> {
        if let Some((lease, worker)) = self.claim_idle() {
            self.record(&worker, WorkerChange::Acquired).await;
            return Some(lease);
        }
        match self.insert(WorkerStatus::Busy) {
            Ok((worker, lease)) => {
                self.record(&worker, WorkerChange::Created).await;
                lease
            }
            Err(_) => None,
        }
    }

    fn claim_idle(&self) -> Option<(WorkerLease, Worker)> {
        for mut slot in self.workers.iter_mut() {
            if slot.worker.status == WorkerStatus::Idle {
                let lease = slot.claim();
                return Some((lease, slot.worker.clone()));
            }
        }
        None
    }

    /// Claims a specific worker, which must be IDLE.
    pub async fn acquire(&self, worker_id: &str) -> GridResult<WorkerLease> {
        let (lease, worker) = {
            let mut slot = self
                .workers
                .get_mut(worker_id)
                .ok_or_else(|| GridError::worker_not_found(worker_id))?;
            if slot.worker.status != WorkerStatus::Idle {
                return Err(GridError::WorkerBusy(worker_id.to_string()));
            }
            let lease = slot.claim();
            (lease, slot.worker.clone())
        };
        self.record(&worker, WorkerChange::Acquired).await;
        Ok(lease)
    }

    /// Records which test a BUSY worker is running.
    pub async fn assign(&self, worker_id: &str, test_id: &str) {
        let worker = self.workers.get_mut(worker_id).map(|mut slot| {
            slot.worker.current_test = Some(test_id.to_string());
            slot.worker.clone()
        });
        if let Some(worker) = worker {
            self.persist(&worker).await;
        }
    }

    /// Returns a BUSY worker to IDLE. False if the worker is gone or not busy.
    pub async fn release(&self, worker_id: &str) -> bool {
        let worker = self.workers.get_mut(worker_id).and_then(|mut slot| {
            if slot.worker.status != WorkerStatus::Busy {
                return None;
            }
            slot.worker.set_status(WorkerStatus::Idle);
            slot.worker.current_test = None;
            slot.token = None;
            slot.idle_since = Instant::now();
            Some(slot.worker.clone())
        });
        match worker {
            Some(worker) => {
                self.record(&worker, WorkerChange::Released).await;
                true
            }
            None => false,
        }
    }

    /// Puts a worker into ERROR until it is [`reset`](Self::reset).
    pub async fn mark_error(&self, worker_id: &str, reason: &str) -> bool {
        let worker = self.workers.get_mut(worker_id).map(|mut slot| {
            slot.worker.set_status(WorkerStatus::Error);
            slot.worker.error = Some(reason.to_string());
            slot.worker.current_test = None;
            slot.token = None;
            slot.worker.clone()
        });
        match worker {
            Some(worker) => {
                warn!(worker_id = %worker.id, "Worker marked as failed: {}", reason);
                self.record(&worker, WorkerChange::Failed).await;
                true
            }
            None => false,
        }
    }

    /// Returns an ERROR worker to IDLE.
    pub async fn reset(&self, worker_id: &str) -> GridResult<Worker> {
        let worker = {
            let mut slot = self
                .workers
                .get_mut(worker_id)
                .ok_or_else(|| GridError::worker_not_found(worker_id))?;
            if slot.worker.status == WorkerStatus::Busy {
                return Err(GridError::WorkerBusy(worker_id.to_string()));
            }
            slot.worker.set_status(WorkerStatus::Idle);
            slot.worker.error = None;
            slot.idle_since = Instant::now();
            slot.worker.clone()
        };
        self.record(&worker, WorkerChange::Reset).await;
        Ok(worker)
    }

    /// Retires a worker. A BUSY worker's running test is cancelled.
    pub async fn remove_worker(&self, worker_id: &str) -> bool {
        let removed = {
            let _membership = self.membership.lock();
            self.workers.remove(worker_id)
        };
        match removed {
            Some((_, slot)) => {
                self.retire(slot).await;
                true
            }
            None => false,
        }
    }

    /// Removes idle workers that exceeded the idle timeout, longest idle
    /// first, keeping enough workers for `queued_unserved` waiting tests and
    /// never going below `min_workers`.
    pub async fn reclaim_idle(&self, queued_unserved: usize) -> Vec<String> {
        let timeout = self.idle_timeout;
        let removed = {
            let _membership = self.membership.lock();
            let min = self.limits.read().min_workers;
            let excess = self
                .workers
                .len()
                .saturating_sub(queued_unserved)
                .saturating_sub(min);
            self.remove_longest_idle(excess, |idle_for| idle_for >= timeout)
        };

        let ids = removed.iter().map(|s| s.worker.id.clone()).collect();
        for slot in removed {
            info!(worker_id = %slot.worker.id, "Reclaiming idle worker");
            self.retire(slot).await;
        }
        ids
    }

    /// Removes up to `count` IDLE workers, longest idle first, never going
    /// below `min_workers`. Returns how many were removed.
    pub async fn scale_down(&self, count: usize) -> usize {
        let removed = {
            let _membership = self.membership.lock();
            let min = self.limits.read().min_workers;
            let allowed = count.min(self.workers.len().saturating_sub(min));
            self.remove_longest_idle(allowed, |_| true)
        };

        let count = removed.len();
        for slot in removed {
            self.retire(slot).await;
        }
        count
    }

    /// Caller holds the membership lock.
    fn remove_longest_idle(
        &self,
        limit: usize,
        eligible: impl Fn(Duration) -> bool,
    ) -> Vec<Slot> {
        if limit == 0 {
            return Vec::new();
        }
        let mut candidates: Vec<(String, Instant)> = self
            .workers
            .iter()
            .filter(|s| s.worker.status == WorkerStatus::Idle && eligible(s.idle_since.elapsed()))
            .map(|s| (s.key().clone(), s.idle_since))
            .collect();
        candidates.sort_by_key(|(_, since)| *since);

        candidates
            .into_iter()
            .filter_map(|(id, _)| {
                self.workers
                    .remove_if(&id, |_, s| s.worker.status == WorkerStatus::Idle)
                    .map(|(_, slot)| slot)
            })
            .take(limit)
            .collect()
    }

    async fn retire(&self, mut slot: Slot) {
        if let Some(token) = slot.token.take() {
            warn!(worker_id = %slot.worker.id, "Removing busy worker, cancelling its test");
            token.cancel();
        }
        slot.worker.set_status(WorkerStatus::Offline);
        slot.worker.current_test = None;
        self.retired.fetch_add(1, Ordering::SeqCst);
        self.record(&slot.worker, WorkerChange::Removed).await;
    }

    /// Cancels the tests of every BUSY worker.
    pub fn cancel_all(&self) {
        for slot in self.workers.iter() {
            if let Some(token) = &slot.token {
                token.cancel();
            }
        }
    }

    /// Updates the bounds. Workers above a lowered maximum are left to
    /// reclamation and scale-down.
    pub fn set_limits(&self, min_workers: usize, max_workers: usize) -> GridResult<()> {
        if max_workers == 0 || min_workers > max_workers {
            return Err(GridError::Config(format!(
                "invalid worker bounds: min {min_workers}, max {max_workers}"
            )));
        }
        *self.limits.write() = PoolLimits {
            min_workers,
            max_workers,
        };
        debug!(min_workers, max_workers, "Pool limits updated");
        Ok(())
    }

    pub fn limits(&self) -> PoolLimits {
        *self.limits.read()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    fn count(&self, status: WorkerStatus) -> usize {
        self.workers
            .iter()
            .filter(|s| s.worker.status == status)
            .count()
    }

    pub fn idle_count(&self) -> usize {
        self.count(WorkerStatus::Idle)
    }

    pub fn busy_count(&self) -> usize {
        self.count(WorkerStatus::Busy)
    }

    pub fn status(&self) -> PoolStatus {
        let limits = self.limits();
        let (mut idle, mut busy, mut error) = (0, 0, 0);
        for slot in self.workers.iter() {
            match slot.worker.status {
                WorkerStatus::Idle => idle += 1,
                WorkerStatus::Busy => busy += 1,
                WorkerStatus::Error => error += 1,
                WorkerStatus::Offline => {}
            }
        }
        PoolStatus {
            total: idle + busy + error,
            idle,
            busy,
            offline: self.retired.load(Ordering::SeqCst),
            error,
            min_workers: limits.min_workers,
            max_workers: limits.max_workers,
        }
    }

    pub fn workers(&self) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self.workers.iter().map(|s| s.worker.clone()).collect();
        workers.sort_by_key(|w| w.created_at);
        workers
    }

    pub fn get(&self, worker_id: &str) -> Option<Worker> {
        self.workers.get(worker_id).map(|s| s.worker.clone())
    }

    async fn record(&self, worker: &Worker, change: WorkerChange) {
        self.persist(worker).await;
        self.events.publish(&Event::WorkerStatus(WorkerEvent {
            worker_id: worker.id.clone(),
            status: worker.status,
            change,
            at: Utc::now(),
        }));
    }

    async fn persist(&self, worker: &Worker) {
        if let Err(e) = self.store.save_worker(worker).await {
            warn!(worker_id = %worker.id, "Failed to persist worker: {}", e);
        }
    }
}
