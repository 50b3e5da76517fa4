//! Test scheduling and orchestration.
//!
//! The [`Orchestrator`] owns every moving part and is the only entry point
//! callers need.
//!
//! # Architecture
//!
//! ```text
//!   submit() ──► WorkQueue ◄──── timeout sweep (QUEUED → TIMEOUT)
//!                   │
//!                   │ dispatcher: acquire_idle() + dequeue()
//!                   ▼
//!              WorkerPool ◄───── AutoScaler (queue depth vs idle workers)
//!                   │              idle reclamation
//!                   │ WorkerLease
//!                   ▼
//!            ExecutionEngine ──► BrowserDriver / ActionRegistry
//!                   │
//!                   ├──► Store (tests, results, workers)
//!                   └──► EventSink (status, logs, results)
//!
//!   run_suite() ──► preconditions ──► members via submit() ──► postconditions
//! ```
//!
//! # Execution Flow
//!
//! 1. **Submission**: the test is recorded and queued by priority
//! 2. **Dispatch**: whenever a worker can be leased, the head of the queue
//!    is handed to the engine on its own task
//! 3. **Execution**: steps run with retry and continue-on-failure policy
//! 4. **Completion**: the result is persisted, the worker goes back to IDLE
//!    and the dispatcher looks at the queue again
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use testgrid::driver::MemoryDriver;
//! use testgrid::model::{Step, TestDefinition};
//! use testgrid::orchestrator::Orchestrator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = Orchestrator::builder(Arc::new(MemoryDriver::lenient())).build();
//!     orchestrator.start().await;
//!
//!     let test = TestDefinition::new("home page").with_step(Step::navigate("https://example.test"));
//!     let outcome = orchestrator.submit(test).await?.wait().await?;
//!     println!("{}: {}", outcome.test.name, outcome.test.status);
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod autoscaler;
pub mod engine;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod steps;
pub mod suite;
pub mod variables;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::driver::{ActionRegistry, BrowserDriver};
use crate::error::{GridError, GridResult};
use crate::events::{Event, EventSink, NullSink, TestStatusEvent};
use crate::model::{Priority, TestDefinition, TestResult, TestStatus, Worker};
use crate::report::Summary;
use crate::store::{MemoryStore, Store};

pub use autoscaler::{AutoScaler, AutoScalerOptions, AutoScalerUpdate, ScaleDirection, ScaleEvent};
pub use engine::{EngineSettings, ExecutionEngine};
pub use pool::{PoolSettings, PoolStatus, WorkerLease, WorkerPool};
pub use queue::{QueueSettings, QueueSnapshot, WorkQueue};
pub use retry::{RetryStats, RetryTracker};

use steps::panic_message;

const CANCELLED_BY_REQUEST: &str = "Test cancelled";

/// Runtime settings of an [`Orchestrator`], usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub queue: QueueSettings,
    pub pool: PoolSettings,
    pub autoscaler: AutoScalerOptions,
    pub engine: EngineSettings,
    pub sweep_interval: Duration,
    pub reclaim_interval: Duration,
    /// How long finished tests stay in memory for status queries.
    pub retention: Duration,
    /// Dispatcher fallback period when no wake-up arrives.
    pub dispatch_poll: Duration,
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            queue: QueueSettings {
                max_size: config.queue.max_size,
                timeout: config.queue.timeout(),
            },
            pool: PoolSettings {
                min_workers: config.pool.min_workers,
                max_workers: config.pool.max_workers,
                idle_timeout: config.pool.idle_timeout(),
            },
            autoscaler: AutoScalerOptions::from_config(&config.autoscaler, &config.pool),
            engine: EngineSettings {
                test_retry_delay: Duration::from_millis(config.execution.test_retry_delay_ms),
            },
            sweep_interval: config.queue.sweep_interval(),
            reclaim_interval: config.pool.reclaim_interval(),
            retention: config.queue.retention(),
            dispatch_poll: Duration::from_millis(config.execution.dispatch_poll_ms.max(1)),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Final state of one submission.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub test: TestDefinition,
    /// Absent when the test never ran (queue timeout, cancellation while
    /// queued, shutdown).
    pub result: Option<TestResult>,
}

impl TestOutcome {
    pub fn status(&self) -> TestStatus {
        self.test.status
    }

    pub fn success(&self) -> bool {
        self.test.status == TestStatus::Completed
    }
}

/// Resolves once the submitted test reaches a terminal status.
#[derive(Debug)]
pub struct ExecutionHandle {
    test_id: String,
    rx: oneshot::Receiver<TestOutcome>,
}

impl ExecutionHandle {
    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub async fn wait(self) -> GridResult<TestOutcome> {
        self.rx.await.map_err(|_| {
            GridError::Cancelled(format!(
                "orchestrator stopped before test {} finished",
                self.test_id
            ))
        })
    }
}

struct TestRecord {
    test: TestDefinition,
    result: Option<TestResult>,
    /// Lease token while the test is running.
    token: Option<CancellationToken>,
    /// Set when a cancel arrives between dequeue and launch.
    cancel_requested: bool,
    finished: Option<Instant>,
    waiter: Option<oneshot::Sender<TestOutcome>>,
}

impl TestRecord {
    fn new(test: TestDefinition, waiter: oneshot::Sender<TestOutcome>) -> Self {
        Self {
            test,
            result: None,
            token: None,
            cancel_requested: false,
            finished: None,
            waiter: Some(waiter),
        }
    }
}

/// Assembles an [`Orchestrator`] from its collaborators.
pub struct OrchestratorBuilder {
    settings: OrchestratorSettings,
    driver: Arc<dyn BrowserDriver>,
    registry: ActionRegistry,
    store: Arc<dyn Store>,
    events: Arc<dyn EventSink>,
}

impl OrchestratorBuilder {
    pub fn settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn config(self, config: &Config) -> Self {
        self.settings(OrchestratorSettings::from(config))
    }

    pub fn registry(mut self, registry: ActionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Orchestrator {
        let Self {
            settings,
            driver,
            registry,
            store,
            events,
        } = self;

        let queue = Arc::new(WorkQueue::new(settings.queue.clone(), events.clone()));
        let pool = Arc::new(WorkerPool::new(
            settings.pool.clone(),
            store.clone(),
            events.clone(),
        ));
        let autoscaler_options = AutoScalerOptions {
            min_workers: settings.pool.min_workers,
            max_workers: settings.pool.max_workers,
            ..settings.autoscaler.clone()
        };
        let autoscaler = Arc::new(AutoScaler::new(
            autoscaler_options,
            pool.clone(),
            queue.clone(),
            events.clone(),
        ));
        let engine = Arc::new(ExecutionEngine::new(
            driver,
            Arc::new(registry),
            pool.clone(),
            store.clone(),
            events.clone(),
            settings.engine.clone(),
        ));

        Orchestrator {
            inner: Arc::new(Inner {
                settings,
                queue,
                pool,
                autoscaler,
                engine,
                store,
                events,
                records: DashMap::new(),
                suites: DashMap::new(),
                dispatch: Notify::new(),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                executions: TaskTracker::new(),
                started: AtomicBool::new(false),
            }),
        }
    }
}

/// The scheduler: queue, pool, autoscaler and engine behind one handle.
///
/// Cloning is cheap; clones share state. Dispatch and the periodic sweeps
/// only run between [`start`](Self::start) and [`shutdown`](Self::shutdown);
/// submissions made before `start` wait in the queue.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    settings: OrchestratorSettings,
    queue: Arc<WorkQueue>,
    pool: Arc<WorkerPool>,
    autoscaler: Arc<AutoScaler>,
    engine: Arc<ExecutionEngine>,
    store: Arc<dyn Store>,
    events: Arc<dyn EventSink>,
    records: DashMap<String, TestRecord>,
    /// Tokens of running suites.
    suites: DashMap<String, CancellationToken>,
    dispatch: Notify,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    executions: TaskTracker,
    started: AtomicBool,
}

impl Orchestrator {
    /// Starts a builder with an in-memory store, no event sink and default
    /// settings.
    pub fn builder(driver: Arc<dyn BrowserDriver>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            settings: OrchestratorSettings::default(),
            driver,
            registry: ActionRegistry::default(),
            store: Arc::new(MemoryStore::new()),
            events: Arc::new(NullSink),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.inner.engine
    }

    /// Creates the minimum workers and spawns the dispatcher, the queue
    /// sweep, idle reclamation and the autoscaler. Calling it twice is a
    /// no-op.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.pool.initialize().await;

        let inner = &self.inner;
        let handles = vec![
            tokio::spawn(inner.clone().dispatch_loop()),
            tokio::spawn(inner.clone().sweep_loop()),
            tokio::spawn(inner.clone().reclaim_loop()),
            tokio::spawn(
                inner
                    .autoscaler
                    .clone()
                    .run(inner.shutdown.child_token()),
            ),
        ];
        inner.tasks.lock().extend(handles);
        info!(
            "Orchestrator started with {} workers (max {})",
            inner.pool.len(),
            inner.pool.limits().max_workers
        );
    }

    /// Stops background loops, cancels queued and running tests and waits
    /// for running executions to wind down.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        for suite in inner.suites.iter() {
            suite.value().cancel();
        }

        for test in inner.queue.clear() {
            inner.finish_unexecuted(test).await;
        }
        inner.pool.cancel_all();

        let handles = std::mem::take(&mut *inner.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        inner.executions.close();
        inner.executions.wait().await;
        info!("Orchestrator stopped");
    }

    // ---- submission ----------------------------------------------------

    /// Queues a test for the next available worker.
    ///
    /// A test rejected by the queue is recorded as CANCELLED with the
    /// rejection reason.
    pub async fn submit(&self, mut test: TestDefinition) -> GridResult<ExecutionHandle> {
        test.reset_for_submission();
        // Stamps queued_at; the queue keeps the stamp.
        test.transition(TestStatus::Queued, None);
        let handle = self.inner.register(&test)?;
        self.inner.save_test(&test).await;

        match self.inner.queue.enqueue(test.clone()) {
            Ok(position) => {
                debug!(test_id = %test.id, position, "Test queued");
                self.inner.dispatch.notify_one();
                Ok(handle)
            }
            Err(e) => {
                self.inner.records.remove(&test.id);
                test.transition(TestStatus::Cancelled, Some(e.to_string()));
                self.inner.save_test(&test).await;
                Err(e)
            }
        }
    }

    /// Submits each test independently; one rejection does not affect the
    /// others.
    pub async fn submit_batch(
        &self,
        tests: impl IntoIterator<Item = TestDefinition>,
    ) -> Vec<GridResult<ExecutionHandle>> {
        let mut handles = Vec::new();
        for test in tests {
            handles.push(self.submit(test).await);
        }
        handles
    }

    /// Runs a test directly on the given worker, which must be IDLE.
    pub async fn submit_to_worker(
        &self,
        test: TestDefinition,
        worker_id: &str,
    ) -> GridResult<ExecutionHandle> {
        let lease = self.inner.pool.acquire(worker_id).await?;
        self.run_on(test, lease).await
    }

    /// Runs the test on an idle worker right away when one can be leased;
    /// otherwise queues it and asks the autoscaler to re-evaluate.
    pub async fn submit_auto(&self, test: TestDefinition) -> GridResult<ExecutionHandle> {
        if self.inner.queue.is_empty()
            && let Some(lease) = self.inner.pool.acquire_idle().await
        {
            return self.run_on(test, lease).await;
        }
        let handle = self.submit(test).await?;
        self.inner.autoscaler.nudge();
        Ok(handle)
    }

    async fn run_on(
        &self,
        mut test: TestDefinition,
        lease: WorkerLease,
    ) -> GridResult<ExecutionHandle> {
        test.reset_for_submission();
        let handle = match self.inner.register(&test) {
            Ok(handle) => handle,
            Err(e) => {
                self.inner.pool.release(lease.worker_id()).await;
                return Err(e);
            }
        };
        self.inner.save_test(&test).await;
        self.inner.launch(test, lease);
        Ok(handle)
    }

    // ---- queue ---------------------------------------------------------

    /// Cancels a queued or running test and returns its status afterwards.
    ///
    /// A queued test becomes CANCELLED at once; a running test is cancelled
    /// cooperatively and reports CANCELLED when its engine stops. Finished
    /// tests are left as they are.
    pub async fn cancel_test(&self, test_id: &str) -> GridResult<TestStatus> {
        let inner = &self.inner;
        if let Some(mut test) = inner.queue.remove(test_id) {
            test.transition(TestStatus::Cancelled, Some(CANCELLED_BY_REQUEST.to_string()));
            info!(test_id, "Cancelled queued test");
            inner
                .events
                .publish(&Event::TestStatus(TestStatusEvent::from(&test)));
            inner.finish_unexecuted(test).await;
            return Ok(TestStatus::Cancelled);
        }

        let mut record = inner
            .records
            .get_mut(test_id)
            .ok_or_else(|| GridError::test_not_found(test_id))?;
        let status = record.test.status;
        if status.is_terminal() {
            return Ok(status);
        }
        let status = match &record.token {
            Some(token) => {
                token.cancel();
                TestStatus::Running
            }
            None => {
                record.cancel_requested = true;
                status
            }
        };
        info!(test_id, "Cancellation requested for running test");
        Ok(status)
    }

    /// Cancels every queued test. Returns how many were cancelled.
    pub async fn clear_queue(&self) -> usize {
        let cleared = self.inner.queue.clear();
        let count = cleared.len();
        for test in cleared {
            self.inner.finish_unexecuted(test).await;
        }
        count
    }

    pub fn reprioritize(&self, test_id: &str, priority: Priority) -> GridResult<usize> {
        self.inner.queue.reprioritize(test_id, priority)
    }

    pub fn position_of(&self, test_id: &str) -> Option<usize> {
        self.inner.queue.position_of(test_id)
    }

    pub fn queue_status(&self) -> QueueSnapshot {
        self.inner.queue.snapshot()
    }

    // ---- workers -------------------------------------------------------

    pub fn pool_status(&self) -> PoolStatus {
        self.inner.pool.status()
    }

    pub fn workers(&self) -> Vec<Worker> {
        self.inner.pool.workers()
    }

    pub async fn create_worker(&self) -> GridResult<Worker> {
        let worker = self.inner.pool.create_worker().await?;
        self.inner.dispatch.notify_one();
        Ok(worker)
    }

    /// Deregisters a worker. A test running on it is cancelled.
    pub async fn remove_worker(&self, worker_id: &str) -> bool {
        self.inner.pool.remove_worker(worker_id).await
    }

    pub async fn reset_worker(&self, worker_id: &str) -> GridResult<Worker> {
        let worker = self.inner.pool.reset(worker_id).await?;
        self.inner.dispatch.notify_one();
        Ok(worker)
    }

    // ---- autoscaler ----------------------------------------------------

    pub fn autoscaler_options(&self) -> AutoScalerOptions {
        self.inner.autoscaler.options()
    }

    pub fn update_autoscaler(&self, update: &AutoScalerUpdate) -> GridResult<AutoScalerOptions> {
        self.inner.autoscaler.update_options(update)
    }

    pub fn set_autoscaler_enabled(&self, enabled: bool) -> GridResult<AutoScalerOptions> {
        self.inner.autoscaler.set_enabled(enabled)
    }

    /// Runs one autoscaler evaluation now.
    pub async fn autoscale_now(&self) -> Option<ScaleEvent> {
        let event = self.inner.autoscaler.tick().await;
        if event.is_some() {
            self.inner.dispatch.notify_one();
        }
        event
    }

    // ---- queries -------------------------------------------------------

    /// Current state of a test.
    ///
    /// Finished tests are answered from memory while retained. Active tests
    /// come from the store, which the engine updates as the test moves on,
    /// falling back to the submitted record when the store cannot answer.
    pub async fn test_status(&self, test_id: &str) -> GridResult<TestDefinition> {
        let retained = self
            .inner
            .records
            .get(test_id)
            .map(|record| record.test.clone());
        if let Some(test) = &retained
            && test.status.is_terminal()
        {
            return Ok(test.clone());
        }

        match self.inner.store.find_test(test_id).await {
            Ok(Some(stored)) => Ok(stored),
            Ok(None) => retained.ok_or_else(|| GridError::test_not_found(test_id)),
            Err(e) => match retained {
                Some(test) => {
                    debug!(test_id, "Store lookup failed, using retained record: {}", e);
                    Ok(test)
                }
                None => Err(e.into()),
            },
        }
    }

    /// Every execution result of a test, oldest first.
    pub async fn results_for_test(&self, test_id: &str) -> GridResult<Vec<TestResult>> {
        Ok(self.inner.store.find_results_by_test(test_id).await?)
    }

    /// Counts over every stored test and result.
    pub async fn summary(&self) -> GridResult<Summary> {
        let tests = self.inner.store.all_tests().await?;
        let results = self.inner.store.all_results().await?;
        let retry = self.inner.engine.retries().stats();
        Ok(Summary::from_records(&tests, &results, retry.flaky_tests))
    }
}

impl Inner {
    fn register(&self, test: &TestDefinition) -> GridResult<ExecutionHandle> {
        let (tx, rx) = oneshot::channel();
        match self.records.entry(test.id.clone()) {
            Entry::Occupied(mut entry) if entry.get().test.status.is_terminal() => {
                entry.insert(TestRecord::new(test.clone(), tx));
            }
            Entry::Occupied(_) => return Err(GridError::AlreadySubmitted(test.id.clone())),
            Entry::Vacant(entry) => {
                entry.insert(TestRecord::new(test.clone(), tx));
            }
        }
        Ok(ExecutionHandle {
            test_id: test.id.clone(),
            rx,
        })
    }

    /// Hands a test to the engine on its own task.
    fn launch(self: &Arc<Self>, test: TestDefinition, lease: WorkerLease) {
        if let Some(mut record) = self.records.get_mut(&test.id) {
            record.token = Some(lease.token().clone());
            if record.cancel_requested {
                lease.token().cancel();
            }
        }

        let inner = self.clone();
        let submitted = test.clone();
        let worker_id = lease.worker_id().to_string();
        self.executions.spawn(async move {
            let run = AssertUnwindSafe(inner.engine.run(test, lease)).catch_unwind();
            match run.await {
                Ok((test, result)) => inner.complete(test, Some(result)),
                Err(panic) => {
                    let message = format!("Execution panicked: {}", panic_message(panic.as_ref()));
                    inner.abandon(submitted, &worker_id, message).await;
                }
            }
            inner.dispatch.notify_one();
        });
    }

    /// Fails a test whose execution task panicked and frees its worker.
    async fn abandon(&self, mut test: TestDefinition, worker_id: &str, message: String) {
        error!(test_id = %test.id, worker_id, "{}", message);
        self.pool.release(worker_id).await;

        test.worker_id = Some(worker_id.to_string());
        test.transition(TestStatus::Running, None);
        test.transition(TestStatus::Failed, Some(message.clone()));
        let mut result = TestResult::unexecuted(&test, TestStatus::Failed, Some(message));
        result.worker_id = test.worker_id.clone();
        if let Err(e) = self.store.save_result(&result).await {
            warn!(test_id = %test.id, "Failed to persist test result: {}", e);
        }
        self.save_test(&test).await;
        self.events
            .publish(&Event::TestStatus(TestStatusEvent::from(&test)));
        self.events
            .publish(&Event::TestResult(Box::new(result.clone())));
        self.complete(test, Some(result));
    }

    async fn finish_unexecuted(&self, test: TestDefinition) {
        self.save_test(&test).await;
        self.complete(test, None);
    }

    fn complete(&self, test: TestDefinition, result: Option<TestResult>) {
        let waiter = self.records.get_mut(&test.id).and_then(|mut record| {
            record.test = test.clone();
            record.result = result.clone();
            record.token = None;
            record.finished = Some(Instant::now());
            record.waiter.take()
        });
        if let Some(waiter) = waiter {
            // The caller may have dropped its handle.
            let _ = waiter.send(TestOutcome { test, result });
        }
    }

    async fn save_test(&self, test: &TestDefinition) {
        if let Err(e) = self.store.save_test(test).await {
            warn!(test_id = %test.id, "Failed to persist test: {}", e);
        }
    }

    async fn dispatch_ready(self: &Arc<Self>) {
        while !self.queue.is_empty() && !self.shutdown.is_cancelled() {
            let Some(lease) = self.pool.acquire_idle().await else {
                break;
            };
            match self.queue.dequeue() {
                Some(test) => {
                    debug!(test_id = %test.id, worker_id = lease.worker_id(), "Dispatching test");
                    self.launch(test, lease);
                }
                None => {
                    self.pool.release(lease.worker_id()).await;
                    break;
                }
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            self.dispatch_ready().await;
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.dispatch.notified() => {}
                _ = tokio::time::sleep(self.settings.dispatch_poll) => {}
            }
        }
        debug!("Dispatcher stopped");
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.settings.sweep_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => self.sweep().await,
            }
        }
    }

    /// Times out stale queue entries and forgets finished tests past the
    /// retention window.
    async fn sweep(&self) {
        let expired = self.queue.sweep_timeouts();
        if !expired.is_empty() {
            warn!("{} queued tests timed out", expired.len());
        }
        for test in expired {
            self.finish_unexecuted(test).await;
        }

        let retention = self.settings.retention;
        self.records.retain(|_, record| {
            record
                .finished
                .is_none_or(|finished| finished.elapsed() < retention)
        });
    }

    async fn reclaim_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.settings.reclaim_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let reclaimed = self.pool.reclaim_idle(self.queue.len()).await;
                    if !reclaimed.is_empty() {
                        info!("Reclaimed {} idle workers", reclaimed.len());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ElementState, MemoryDriver};
    use crate::events::RecordingSink;
    use crate::model::Step;

    fn settings(min: usize, max: usize) -> OrchestratorSettings {
        OrchestratorSettings {
            pool: PoolSettings {
                min_workers: min,
                max_workers: max,
                idle_timeout: Duration::from_secs(300),
            },
            engine: EngineSettings {
                test_retry_delay: Duration::from_millis(10),
            },
            dispatch_poll: Duration::from_millis(50),
            ..OrchestratorSettings::default()
        }
    }

    fn orchestrator(min: usize, max: usize) -> (Orchestrator, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let driver = MemoryDriver::new().with_element("#go", ElementState::default());
        let orchestrator = Orchestrator::builder(Arc::new(driver))
            .settings(settings(min, max))
            .events(sink.clone())
            .build();
        (orchestrator, sink)
    }

    fn quick(name: &str) -> TestDefinition {
        TestDefinition::new(name)
            .with_screenshots(false)
            .with_step(Step::click("#go"))
    }

    #[tokio::test]
    async fn test_submit_runs_to_completion() {
        let (orchestrator, _) = orchestrator(1, 2);
        orchestrator.start().await;

        let outcome = orchestrator.submit(quick("a")).await.unwrap().wait().await.unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.result.unwrap().steps.len(), 1);

        let status = orchestrator.test_status(&outcome.test.id).await.unwrap();
        assert_eq!(status.status, TestStatus::Completed);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_resubmitting_active_test_rejected() {
        let (orchestrator, _) = orchestrator(1, 1);
        let test = quick("dup");
        let _handle = orchestrator.submit(test.clone()).await.unwrap();
        assert!(matches!(
            orchestrator.submit(test).await,
            Err(GridError::AlreadySubmitted(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_queued_test() {
        let (orchestrator, sink) = orchestrator(1, 1);
        let handle = orchestrator.submit(quick("waiting")).await.unwrap();
        let id = handle.test_id().to_string();

        assert_eq!(
            orchestrator.cancel_test(&id).await.unwrap(),
            TestStatus::Cancelled
        );
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.status(), TestStatus::Cancelled);
        assert!(outcome.result.is_none());
        assert_eq!(orchestrator.queue_status().length, 0);
        assert!(
            sink.on_topic(&format!("/topic/tests/{id}/status"))
                .iter()
                .any(|e| matches!(e, Event::TestStatus(s) if s.status == TestStatus::Cancelled))
        );

        assert_eq!(
            orchestrator.cancel_test(&id).await.unwrap(),
            TestStatus::Cancelled
        );
        assert!(matches!(
            orchestrator.cancel_test("nope").await,
            Err(GridError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_submit_to_busy_worker_rejected() {
        let (orchestrator, _) = orchestrator(1, 1);
        orchestrator.start().await;
        let worker = orchestrator.workers()[0].id.clone();

        let slow = TestDefinition::new("slow")
            .with_screenshots(false)
            .with_step(Step::new(crate::model::ActionKind::Wait).with_value("200"));
        let handle = orchestrator.submit_to_worker(slow, &worker).await.unwrap();
        assert!(matches!(
            orchestrator.submit_to_worker(quick("second"), &worker).await,
            Err(GridError::WorkerBusy(_))
        ));
        assert!(handle.wait().await.unwrap().success());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_queue_cancels_everything() {
        let (orchestrator, _) = orchestrator(1, 1);
        let handles: Vec<_> = orchestrator
            .submit_batch((0..3).map(|i| quick(&format!("t{i}"))))
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(orchestrator.clear_queue().await, 3);
        for handle in handles {
            assert_eq!(handle.wait().await.unwrap().status(), TestStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn test_queue_full_rejected_in_batch() {
        let mut settings = settings(1, 1);
        settings.queue.max_size = 2;
        let orchestrator = Orchestrator::builder(Arc::new(MemoryDriver::lenient()))
            .settings(settings)
            .build();

        let results = orchestrator
            .submit_batch((0..3).map(|i| quick(&format!("t{i}"))))
            .await;
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(GridError::QueueFull { max: 2 })));
        assert_eq!(orchestrator.queue_status().length, 2);
    }

    #[tokio::test]
    async fn test_queued_test_is_stored_with_queue_time() {
        let (orchestrator, _) = orchestrator(1, 1);
        let handle = orchestrator.submit(quick("waiting")).await.unwrap();

        let stored = orchestrator.test_status(handle.test_id()).await.unwrap();
        assert_eq!(stored.status, TestStatus::Queued);
        assert!(stored.queued_at.is_some());
        assert_eq!(
            stored.queued_at,
            orchestrator.queue_status().items[0].queued_at
        );
    }

    struct CrashingDriver;

    #[async_trait::async_trait]
    impl BrowserDriver for CrashingDriver {
        fn name(&self) -> &str {
            "crashing"
        }

        async fn open_session(
            &self,
            _options: &crate::model::BrowserOptions,
        ) -> crate::driver::DriverResult<Box<dyn crate::driver::BrowserSession>> {
            panic!("browser process crashed");
        }
    }

    #[tokio::test]
    async fn test_panicking_execution_fails_test_and_frees_worker() {
        let sink = Arc::new(RecordingSink::new());
        let orchestrator = Orchestrator::builder(Arc::new(CrashingDriver))
            .settings(settings(1, 1))
            .events(sink.clone())
            .build();
        orchestrator.start().await;

        let handle = orchestrator.submit(quick("crash")).await.unwrap();
        let id = handle.test_id().to_string();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.status(), TestStatus::Failed);
        let error = outcome.test.error.clone().unwrap();
        assert!(error.contains("browser process crashed"));
        let result = outcome.result.unwrap();
        assert!(!result.success);
        assert!(result.worker_id.is_some());

        let workers = orchestrator.workers();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].status, crate::model::WorkerStatus::Idle);
        assert_eq!(
            orchestrator.test_status(&id).await.unwrap().status,
            TestStatus::Failed
        );
        assert_eq!(orchestrator.results_for_test(&id).await.unwrap().len(), 1);
        assert!(
            sink.on_topic(&format!("/topic/tests/{id}/result"))
                .iter()
                .any(|e| matches!(e, Event::TestResult(_)))
        );
        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout_sweep() {
        let mut settings = settings(0, 1);
        settings.queue.timeout = Duration::from_secs(5);
        settings.sweep_interval = Duration::from_secs(1);
        settings.pool.max_workers = 1;
        let orchestrator = Orchestrator::builder(Arc::new(MemoryDriver::lenient()))
            .settings(settings)
            .build();
        orchestrator.start().await;

        let blocker = TestDefinition::new("blocker")
            .with_screenshots(false)
            .with_step(
                Step::new(crate::model::ActionKind::Wait)
                    .with_value("20000")
                    .with_timeout(Duration::from_secs(60)),
            );
        let blocker = orchestrator.submit(blocker).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let starved = orchestrator.submit(quick("starved")).await.unwrap();

        let outcome = starved.wait().await.unwrap();
        assert_eq!(outcome.status(), TestStatus::Timeout);
        assert_eq!(
            outcome.test.error.as_deref(),
            Some(queue::QUEUE_TIMEOUT_ERROR)
        );

        orchestrator.cancel_test(blocker.test_id()).await.unwrap();
        assert_eq!(blocker.wait().await.unwrap().status(), TestStatus::Cancelled);
        orchestrator.shutdown().await;
    }
}
