//! Runs one test on one leased worker.
//!
//! The engine owns the per-execution state machine:
//!
//! ```text
//! QUEUED ──► RUNNING ──┬──► COMPLETED   every step passed (or none exist)
//!                      ├──► FAILED      last attempt failed, or no session
//!                      └──► CANCELLED   the lease token fired
//! ```
//!
//! A failed attempt is retried from the first step, after
//! `test_retry_delay`, until `max_retries + 1` attempts were made. Only the
//! last attempt's step results and screenshots are kept.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pool::{WorkerLease, WorkerPool};
use super::retry::RetryTracker;
use super::steps::{
    AttemptOutcome, AttemptReport, CANCELLED_ERROR, ExecutionLog, StepExecutor, StepPolicy, pause,
};
use crate::driver::{ActionRegistry, BrowserDriver, BrowserSession};
use crate::events::{Event, EventSink, TestStatusEvent};
use crate::model::{
    LogEntry, Step, SuiteConfig, TestDefinition, TestResult, TestStatus, Variables,
};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Pause between whole-test attempts.
    pub test_retry_delay: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            test_retry_delay: Duration::from_secs(3),
        }
    }
}

pub struct ExecutionEngine {
    driver: Arc<dyn BrowserDriver>,
    registry: Arc<ActionRegistry>,
    pool: Arc<WorkerPool>,
    store: Arc<dyn Store>,
    events: Arc<dyn EventSink>,
    retries: RetryTracker,
    settings: EngineSettings,
}

impl ExecutionEngine {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        registry: Arc<ActionRegistry>,
        pool: Arc<WorkerPool>,
        store: Arc<dyn Store>,
        events: Arc<dyn EventSink>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            driver,
            registry,
            pool,
            store,
            events,
            retries: RetryTracker::new(),
            settings,
        }
    }

    pub fn retries(&self) -> &RetryTracker {
        &self.retries
    }

    /// Runs `test` to a terminal status on the leased worker, then returns
    /// the worker to the pool. Cancelling the lease token stops the run at
    /// the next step boundary or delay.
    pub async fn run(
        &self,
        mut test: TestDefinition,
        lease: WorkerLease,
    ) -> (TestDefinition, TestResult) {
        let worker_id = lease.worker_id().to_string();
        let token = lease.token().clone();

        if !test.transition(TestStatus::Running, None) {
            warn!(test_id = %test.id, status = %test.status, "Refusing to run test that is not queued");
            self.pool.release(&worker_id).await;
            let result = TestResult::unexecuted(&test, test.status, test.error.clone());
            return (test, result);
        }
        test.worker_id = Some(worker_id.clone());
        self.pool.assign(&worker_id, &test.id).await;
        self.save_test(&test).await;
        self.events
            .publish(&Event::TestStatus(TestStatusEvent::from(&test)));

        let mut result = TestResult::start(&test, Some(worker_id.clone()));
        let mut log = ExecutionLog::new(
            Some(test.id.clone()),
            Some(worker_id.clone()),
            self.events.clone(),
        );
        log.info(format!("Starting test '{}' on worker {}", test.name, worker_id));

        let browser = test.browser.clone().unwrap_or_default();
        let session = match self.driver.open_session(&browser).await {
            Ok(session) => session,
            Err(e) => {
                let message = e.to_string();
                log.error(&message);
                self.pool.mark_error(&worker_id, &message).await;
                let status = if token.is_cancelled() {
                    TestStatus::Cancelled
                } else {
                    TestStatus::Failed
                };
                self.finalize(&mut test, &mut result, &mut log, status, Some(message))
                    .await;
                self.publish_outcome(&test, &result);
                return (test, result);
            }
        };

        let outcome = self
            .attempts(&mut test, &mut result, session.as_ref(), &token, &mut log)
            .await;
        self.retries.finish(&test.id);

        if test.screenshots_enabled() && outcome != AttemptOutcome::Cancelled {
            match session.screenshot("final").await {
                Ok(reference) => result.screenshots.push(reference),
                Err(e) => log.warn(format!("Failed to take final screenshot: {e}")),
            }
        }
        if let Err(e) = session.close().await {
            log.warn(format!("Failed to close browser session: {e}"));
        }

        // A cancel arriving after every step passed does not undo the pass.
        let (status, error) = match outcome {
            AttemptOutcome::Cancelled => (TestStatus::Cancelled, Some(CANCELLED_ERROR.to_string())),
            AttemptOutcome::Passed => (TestStatus::Completed, None),
            AttemptOutcome::Failed(_) if token.is_cancelled() => {
                (TestStatus::Cancelled, Some(CANCELLED_ERROR.to_string()))
            }
            AttemptOutcome::Failed(message) => (TestStatus::Failed, Some(message)),
        };
        self.finalize(&mut test, &mut result, &mut log, status, error)
            .await;
        self.pool.release(&worker_id).await;
        self.publish_outcome(&test, &result);
        (test, result)
    }

    fn publish_outcome(&self, test: &TestDefinition, result: &TestResult) {
        self.events
            .publish(&Event::TestStatus(TestStatusEvent::from(test)));
        self.events
            .publish(&Event::TestResult(Box::new(result.clone())));
    }

    async fn attempts(
        &self,
        test: &mut TestDefinition,
        result: &mut TestResult,
        session: &dyn BrowserSession,
        token: &CancellationToken,
        log: &mut ExecutionLog,
    ) -> AttemptOutcome {
        if let Some(base_url) = test.base_url.clone() {
            let timeout = test.browser.clone().unwrap_or_default().timeout();
            if let Err(e) = session.navigate(&base_url, timeout).await {
                let message = format!("Failed to open base URL {base_url}: {e}");
                log.error(&message);
                return AttemptOutcome::Failed(message);
            }
        }

        let policy = StepPolicy {
            screenshots: test.screenshots_enabled(),
            continue_on_failure: test.continues_on_failure(),
            defaults: test.step_options.clone(),
        };
        let executor = StepExecutor::new(&self.registry, session, token, policy);
        let total = test.max_retries.saturating_add(1);
        self.retries.reset(&test.id);

        loop {
            let attempt = self.retries.attempts(&test.id).saturating_add(1);
            if attempt > 1 {
                log.info(format!("Retrying test (attempt {attempt} of {total})"));
                result.reset_attempt();
                if !pause(token, self.settings.test_retry_delay).await {
                    return AttemptOutcome::Cancelled;
                }
            }

            let mut variables = test.variables.clone();
            let AttemptReport {
                outcome,
                steps,
                screenshots,
            } = executor
                .run(&test.steps, &mut variables, &test.metadata, log)
                .await;
            result.attempts = attempt;
            result.steps = steps;
            result.screenshots.extend(screenshots);
            self.retries
                .record_attempt(&test.id, outcome == AttemptOutcome::Passed);

            match outcome {
                AttemptOutcome::Failed(message)
                    if self.retries.should_retry(&test.id, test.max_retries) =>
                {
                    log.warn(format!("Attempt {attempt} failed: {message}"));
                }
                outcome => {
                    test.variables = variables;
                    if self.retries.is_flaky(&test.id) {
                        info!(test_id = %test.id, "Test passed after {} attempts", attempt);
                    }
                    return outcome;
                }
            }
        }
    }

    async fn finalize(
        &self,
        test: &mut TestDefinition,
        result: &mut TestResult,
        log: &mut ExecutionLog,
        status: TestStatus,
        error: Option<String>,
    ) {
        log.info(format!("Test '{}' finished with status {}", test.name, status));
        result.logs = log.take();
        result.finish(status, error.clone());
        test.transition(status, error);

        if let Err(e) = self.store.save_result(result).await {
            warn!(test_id = %test.id, "Failed to persist test result: {}", e);
        }
        self.save_test(test).await;
        debug!(test_id = %test.id, status = %status, attempts = result.attempts, "Execution finished");
    }

    async fn save_test(&self, test: &TestDefinition) {
        if let Err(e) = self.store.save_test(test).await {
            warn!(test_id = %test.id, "Failed to persist test: {}", e);
        }
    }

    /// Runs suite pre- or postconditions in a session of their own.
    ///
    /// Conditions stop at their first failing step.
    pub async fn run_conditions(
        &self,
        label: &str,
        steps: &[Step],
        config: &SuiteConfig,
        variables: &mut Variables,
        token: &CancellationToken,
    ) -> (AttemptReport, Vec<LogEntry>) {
        let mut log = ExecutionLog::new(None, None, self.events.clone());
        if steps.is_empty() {
            let report = AttemptReport {
                outcome: AttemptOutcome::Passed,
                steps: Vec::new(),
                screenshots: Vec::new(),
            };
            return (report, log.take());
        }

        log.info(format!("Running {} {} steps", steps.len(), label));
        let browser = config.browser.clone().unwrap_or_default();
        let session = match self.driver.open_session(&browser).await {
            Ok(session) => session,
            Err(e) => {
                let message = format!("{label}: {e}");
                log.error(&message);
                let report = AttemptReport {
                    outcome: AttemptOutcome::Failed(message),
                    steps: Vec::new(),
                    screenshots: Vec::new(),
                };
                return (report, log.take());
            }
        };

        let policy = StepPolicy {
            screenshots: config.take_screenshots,
            continue_on_failure: false,
            defaults: config.step_options.clone(),
        };
        let metadata = Variables::new();
        let report = StepExecutor::new(&self.registry, session.as_ref(), token, policy)
            .run(steps, variables, &metadata, &mut log)
            .await;
        if let Err(e) = session.close().await {
            log.warn(format!("Failed to close {label} session: {e}"));
        }
        (report, log.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ElementState, MemoryDriver};
    use crate::events::RecordingSink;
    use crate::model::{StepOptions, WorkerStatus};
    use crate::orchestrator::pool::PoolSettings;
    use crate::store::MemoryStore;
    use serde_json::json;

    struct Fixture {
        engine: ExecutionEngine,
        pool: Arc<WorkerPool>,
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
        driver: MemoryDriver,
    }

    fn fixture(driver: MemoryDriver) -> Fixture {
        fixture_with_registry(driver, ActionRegistry::default())
    }

    fn fixture_with_registry(driver: MemoryDriver, registry: ActionRegistry) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::new());
        let pool = Arc::new(WorkerPool::new(
            PoolSettings {
                min_workers: 1,
                max_workers: 2,
                idle_timeout: Duration::from_secs(60),
            },
            store.clone(),
            sink.clone(),
        ));
        let engine = ExecutionEngine::new(
            Arc::new(driver.clone()),
            Arc::new(registry),
            pool.clone(),
            store.clone(),
            sink.clone(),
            EngineSettings {
                test_retry_delay: Duration::from_millis(50),
            },
        );
        Fixture {
            engine,
            pool,
            store,
            sink,
            driver,
        }
    }

    fn driver() -> MemoryDriver {
        MemoryDriver::new()
            .with_element("#ok", ElementState::with_text("ready"))
            .with_element("#next", ElementState::default())
    }

    #[tokio::test]
    async fn test_passing_test_completes_and_releases_worker() {
        let f = fixture(driver());
        let lease = f.pool.acquire_idle().await.unwrap();
        let test = TestDefinition::new("smoke")
            .with_step(Step::navigate("https://app.test"))
            .with_step(Step::verify_text("#ok", "ready"));

        let (test, result) = f.engine.run(test, lease.clone()).await;
        assert_eq!(test.status, TestStatus::Completed);
        assert!(test.completed_at.is_some());
        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.worker_id.as_deref(), Some(lease.worker_id()));
        assert!(!result.logs.is_empty());
        assert_eq!(result.screenshots.len(), 1);

        let worker = f.pool.get(lease.worker_id()).unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert!(worker.current_test.is_none());

        assert_eq!(f.store.find_results_by_test(&test.id).await.unwrap().len(), 1);
        let stored = f.store.find_test(&test.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TestStatus::Completed);
        assert_eq!(f.driver.open_sessions(), 0);

        let statuses: Vec<_> = f
            .sink
            .on_topic(&format!("/topic/tests/{}/status", test.id))
            .into_iter()
            .filter_map(|e| match e {
                Event::TestStatus(s) => Some(s.status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![TestStatus::Running, TestStatus::Completed]);
        assert_eq!(f.sink.on_topic(&format!("/topic/tests/{}/result", test.id)).len(), 1);
    }

    #[tokio::test]
    async fn test_zero_steps_succeed() {
        let f = fixture(driver());
        let lease = f.pool.acquire_idle().await.unwrap();
        let (test, result) = f.engine.run(TestDefinition::new("empty"), lease).await;
        assert_eq!(test.status, TestStatus::Completed);
        assert!(result.steps.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_whole_test_retry_keeps_last_attempt_only() {
        let f = fixture(driver().flaky("#next", 2));
        let lease = f.pool.acquire_idle().await.unwrap();
        let test = TestDefinition::new("flaky")
            .with_screenshots(false)
            .with_max_retries(2)
            .with_step(Step::verify_text("#ok", "ready"))
            .with_step(Step::click("#next"));

        let (test, result) = f.engine.run(test, lease).await;
        assert_eq!(test.status, TestStatus::Completed);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.steps.len(), 2);
        assert!(result.steps.iter().all(|s| s.success));
        assert_eq!(f.engine.retries().stats().flaky_tests, 1);
        assert_eq!(f.engine.retries().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_largest_retry_counts_run_once_when_passing() {
        let f = fixture(driver());
        let lease = f.pool.acquire_idle().await.unwrap();
        let test = TestDefinition::new("unbounded")
            .with_screenshots(false)
            .with_max_retries(u32::MAX)
            .with_step(Step::click("#next").with_options(StepOptions {
                retries: u32::MAX,
                ..Default::default()
            }));

        let (test, result) = f.engine.run(test, lease.clone()).await;
        assert_eq!(test.status, TestStatus::Completed);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(
            f.pool.get(lease.worker_id()).unwrap().status,
            WorkerStatus::Idle
        );
    }

    /// Clicks, then cancels the execution it belongs to.
    struct CancelAfterClick(Arc<parking_lot::Mutex<Option<CancellationToken>>>);

    #[async_trait::async_trait]
    impl crate::driver::ActionHandler for CancelAfterClick {
        async fn execute(
            &self,
            _cx: &mut crate::driver::ActionContext<'_>,
        ) -> crate::driver::DriverResult<()> {
            if let Some(token) = self.0.lock().as_ref() {
                token.cancel();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancel_after_last_step_keeps_completed() {
        let slot = Arc::new(parking_lot::Mutex::new(None));
        let registry = ActionRegistry::with_defaults().with_handler(
            crate::model::ActionKind::Click,
            CancelAfterClick(slot.clone()),
        );
        let f = fixture_with_registry(driver(), registry);
        let lease = f.pool.acquire_idle().await.unwrap();
        *slot.lock() = Some(lease.token().clone());

        let test = TestDefinition::new("late cancel")
            .with_screenshots(false)
            .with_step(Step::verify_text("#ok", "ready"))
            .with_step(Step::click("#next"));
        let (test, result) = f.engine.run(test, lease.clone()).await;

        assert!(lease.token().is_cancelled());
        assert_eq!(test.status, TestStatus::Completed);
        assert!(result.success);
        assert!(test.error.is_none());
    }

    #[tokio::test]
    async fn test_cancel_before_failure_reports_cancelled() {
        let slot = Arc::new(parking_lot::Mutex::new(None));
        let registry = ActionRegistry::with_defaults().with_handler(
            crate::model::ActionKind::Click,
            CancelAfterClick(slot.clone()),
        );
        let f = fixture_with_registry(driver(), registry);
        let lease = f.pool.acquire_idle().await.unwrap();
        *slot.lock() = Some(lease.token().clone());

        let test = TestDefinition::new("cancel then fail")
            .with_screenshots(false)
            .with_continue_on_failure(true)
            .with_step(Step::verify_text("#missing", "ready"))
            .with_step(Step::click("#next"));
        let (test, _) = f.engine.run(test, lease).await;
        assert_eq!(test.status, TestStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_fails() {
        let f = fixture(driver());
        let lease = f.pool.acquire_idle().await.unwrap();
        let test = TestDefinition::new("broken")
            .with_max_retries(2)
            .with_step(Step::click("#missing"))
            .with_step(Step::click("#next"));

        let (test, result) = f.engine.run(test, lease).await;
        assert_eq!(test.status, TestStatus::Failed);
        assert!(!result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.steps.len(), 1);
        assert!(test.error.as_deref().unwrap().contains("#missing"));
        let opened = f
            .driver
            .journal()
            .iter()
            .filter(|e| *e == "click #missing")
            .count();
        assert_eq!(opened, 3);
    }

    #[tokio::test]
    async fn test_session_failure_marks_worker_error() {
        let f = fixture(driver().fail_sessions(1));
        let lease = f.pool.acquire_idle().await.unwrap();

        let (test, result) = f
            .engine
            .run(TestDefinition::new("no browser").with_step(Step::click("#ok")), lease.clone())
            .await;
        assert_eq!(test.status, TestStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("browser session"));
        assert_eq!(
            f.pool.get(lease.worker_id()).unwrap().status,
            WorkerStatus::Error
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_lease_stops_execution() {
        let f = fixture(driver().with_action_delay(Duration::from_millis(100)));
        let lease = f.pool.acquire_idle().await.unwrap();
        let test = TestDefinition::new("long").with_steps(
            (0..10).map(|_| Step::click("#next")),
        );

        let token = lease.token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            token.cancel();
        });

        let (test, result) = f.engine.run(test, lease.clone()).await;
        assert_eq!(test.status, TestStatus::Cancelled);
        assert_eq!(result.status, TestStatus::Cancelled);
        assert!(result.steps.len() < 10);
        assert_eq!(
            f.pool.get(lease.worker_id()).unwrap().status,
            WorkerStatus::Idle
        );
        assert_eq!(f.driver.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_variables_flow_between_steps() {
        let f = fixture(driver());
        let lease = f.pool.acquire_idle().await.unwrap();
        let test = TestDefinition::new("vars")
            .with_variable("greeting", json!("hello"))
            .with_metadata("env", json!("staging"))
            .with_step(
                Step::new(crate::model::ActionKind::SetVariable)
                    .with_target("copy")
                    .with_value("${greeting} from ${env}"),
            )
            .with_step(Step::fill("#next", "${copy}"));

        let (test, _) = f.engine.run(test, lease).await;
        assert_eq!(test.status, TestStatus::Completed);
        assert_eq!(test.variables["copy"], json!("hello from staging"));
        assert!(
            f.driver
                .journal()
                .contains(&"fill #next hello from staging".to_string())
        );
    }

    #[tokio::test]
    async fn test_base_url_visited_first() {
        let f = fixture(driver());
        let lease = f.pool.acquire_idle().await.unwrap();
        let test = TestDefinition::new("base")
            .with_base_url("https://app.test")
            .with_step(Step::click("#next"));

        f.engine.run(test, lease).await;
        let journal = f.driver.journal();
        assert_eq!(journal[0], "navigate https://app.test");
        assert_eq!(journal[1], "click #next");
    }

    #[tokio::test]
    async fn test_conditions_run_in_own_session() {
        let f = fixture(driver());
        let steps = [
            Step::navigate("https://app.test/setup"),
            Step::click("#missing").with_options(StepOptions {
                continue_on_failure: true,
                ..Default::default()
            }),
            Step::click("#next"),
        ];
        let config = SuiteConfig {
            take_screenshots: false,
            ..Default::default()
        };

        let (report, logs) = f
            .engine
            .run_conditions(
                "precondition",
                &steps,
                &config,
                &mut Variables::new(),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(report.outcome, AttemptOutcome::Failed(_)));
        assert_eq!(report.steps.len(), 3);
        assert!(!logs.is_empty());
        assert_eq!(f.driver.sessions_opened(), 1);
        assert_eq!(f.driver.open_sessions(), 0);
        assert!(f.pool.is_empty());
    }
}
