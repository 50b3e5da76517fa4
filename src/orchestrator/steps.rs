//! Runs one attempt of a step list against an open browser session.
//!
//! For every step, in order:
//!
//! 1. Check the cancellation token.
//! 2. Sleep the step's `delay` (cancellable).
//! 3. Take the "before" screenshot when requested.
//! 4. Dispatch through the [`ActionRegistry`] up to `retries + 1` times,
//!    sleeping `retry_delay` between attempts. Each dispatch is bounded by the
//!    step timeout, and a panicking driver counts as a failed attempt.
//! 5. On success, take the "after" screenshot when requested (always for the
//!    `screenshot` action). On failure, take an error screenshot and stop
//!    unless the test or the step continues on failure.
//!
//! All screenshots are skipped when the test disables them.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::variables::resolve_step;
use crate::driver::{ActionContext, ActionRegistry, BrowserSession, DriverError, ResolvedStep};
use crate::events::{Event, EventSink};
use crate::model::{ActionKind, LogEntry, LogLevel, Step, StepOptions, StepResult, Variables};

pub(crate) const CANCELLED_ERROR: &str = "Execution cancelled";

/// Log lines of one execution. Each line is kept, traced and published as
/// it happens.
pub struct ExecutionLog {
    test_id: Option<String>,
    worker_id: Option<String>,
    entries: Vec<LogEntry>,
    events: Arc<dyn EventSink>,
}

impl ExecutionLog {
    pub fn new(
        test_id: Option<String>,
        worker_id: Option<String>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            test_id,
            worker_id,
            entries: Vec::new(),
            events,
        }
    }

    pub fn debug(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Debug, message.into());
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Info, message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Error, message.into());
    }

    fn push(&mut self, level: LogLevel, message: String) {
        let test_id = self.test_id.as_deref().unwrap_or("-");
        match level {
            LogLevel::Debug => debug!(test_id, "{}", message),
            LogLevel::Info => info!(test_id, "{}", message),
            LogLevel::Warn => warn!(test_id, "{}", message),
            LogLevel::Error => error!(test_id, "{}", message),
        }
        let entry = LogEntry::new(level, message, self.test_id.clone(), self.worker_id.clone());
        self.events.publish(&Event::TestLog(entry.clone()));
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn take(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.entries)
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Passed,
    /// Holds the first step failure.
    Failed(String),
    Cancelled,
}

#[derive(Debug)]
pub struct AttemptReport {
    pub outcome: AttemptOutcome,
    pub steps: Vec<StepResult>,
    pub screenshots: Vec<String>,
}

/// Step-level policy inherited from the test or suite.
#[derive(Debug, Clone, Default)]
pub struct StepPolicy {
    pub screenshots: bool,
    pub continue_on_failure: bool,
    pub defaults: Option<StepOptions>,
}

enum Dispatch {
    Passed,
    Failed(String),
    Cancelled,
}

pub struct StepExecutor<'a> {
    registry: &'a ActionRegistry,
    session: &'a dyn BrowserSession,
    token: &'a CancellationToken,
    policy: StepPolicy,
}

impl<'a> StepExecutor<'a> {
    pub fn new(
        registry: &'a ActionRegistry,
        session: &'a dyn BrowserSession,
        token: &'a CancellationToken,
        policy: StepPolicy,
    ) -> Self {
        Self {
            registry,
            session,
            token,
            policy,
        }
    }

    pub async fn run(
        &self,
        steps: &[Step],
        variables: &mut Variables,
        metadata: &Variables,
        log: &mut ExecutionLog,
    ) -> AttemptReport {
        let mut report = AttemptReport {
            outcome: AttemptOutcome::Passed,
            steps: Vec::with_capacity(steps.len()),
            screenshots: Vec::new(),
        };
        let mut first_failure = None;
        let mut cancelled = false;

        for (index, step) in steps.iter().enumerate() {
            if self.token.is_cancelled() {
                log.warn(format!("Cancelled before step {}", index + 1));
                cancelled = true;
                break;
            }

            let options = step.effective_options(self.policy.defaults.as_ref());
            let mut result = StepResult::start(index, step);
            log.info(format!(
                "Executing step {}/{}: {}",
                index + 1,
                steps.len(),
                result.description
            ));

            if !pause(self.token, options.delay()).await {
                result.finish(false, Some(CANCELLED_ERROR.to_string()));
                report.steps.push(result);
                cancelled = true;
                break;
            }

            if options.screenshot_before {
                self.capture(&format!("step-{index}-before"), &mut report, log)
                    .await;
            }

            let resolved = resolve_step(index, step, options, variables, metadata);
            match self.dispatch_with_retries(&resolved, variables, log).await {
                Dispatch::Passed => {
                    log.info(format!("Step {} completed successfully", index + 1));
                    if resolved.options.screenshot_after || step.action == ActionKind::Screenshot {
                        result.screenshot =
                            self.capture(&format!("step-{index}"), &mut report, log).await;
                    }
                    result.finish(true, None);
                    report.steps.push(result);
                }
                Dispatch::Cancelled => {
                    result.finish(false, Some(CANCELLED_ERROR.to_string()));
                    report.steps.push(result);
                    cancelled = true;
                    break;
                }
                Dispatch::Failed(message) => {
                    log.error(format!("Step {} failed: {}", index + 1, message));
                    result.screenshot = self
                        .capture(&format!("step-{index}-error"), &mut report, log)
                        .await;
                    first_failure.get_or_insert_with(|| {
                        format!("Step {} ({}) failed: {}", index + 1, result.description, message)
                    });
                    result.finish(false, Some(message));
                    report.steps.push(result);

                    if !(self.policy.continue_on_failure || resolved.options.continue_on_failure) {
                        break;
                    }
                    log.warn("Continuing test execution despite step failure");
                }
            }
        }

        report.outcome = if cancelled {
            AttemptOutcome::Cancelled
        } else {
            match first_failure {
                Some(message) => AttemptOutcome::Failed(message),
                None => AttemptOutcome::Passed,
            }
        };
        report
    }

    async fn dispatch_with_retries(
        &self,
        step: &ResolvedStep,
        variables: &mut Variables,
        log: &mut ExecutionLog,
    ) -> Dispatch {
        let attempts = step.options.retries.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                log.info(format!("Retrying step (attempt {attempt} of {attempts})"));
                if !pause(self.token, step.options.retry_delay()).await {
                    return Dispatch::Cancelled;
                }
            }
            if self.token.is_cancelled() {
                return Dispatch::Cancelled;
            }
            match self.dispatch(step, variables).await {
                Dispatch::Failed(message) => {
                    if attempts > 1 {
                        log.warn(format!("Step attempt {attempt} failed: {message}"));
                    }
                    last_error = message;
                }
                other => return other,
            }
        }
        Dispatch::Failed(last_error)
    }

    async fn dispatch(&self, step: &ResolvedStep, variables: &mut Variables) -> Dispatch {
        let mut cx = ActionContext {
            session: self.session,
            step,
            variables,
        };
        let call = AssertUnwindSafe(self.registry.dispatch(&mut cx)).catch_unwind();

        tokio::select! {
            _ = self.token.cancelled() => Dispatch::Cancelled,
            outcome = tokio::time::timeout(step.timeout, call) => match outcome {
                Ok(Ok(Ok(()))) => Dispatch::Passed,
                Ok(Ok(Err(e))) => Dispatch::Failed(e.to_string()),
                Ok(Err(panic)) => Dispatch::Failed(format!(
                    "Driver panicked: {}",
                    panic_message(panic.as_ref())
                )),
                Err(_) => Dispatch::Failed(
                    DriverError::Timeout {
                        timeout: step.timeout,
                        message: format!("step {}", step.action),
                    }
                    .to_string(),
                ),
            },
        }
    }

    /// Screenshot failures are logged and never fail the step.
    async fn capture(
        &self,
        label: &str,
        report: &mut AttemptReport,
        log: &mut ExecutionLog,
    ) -> Option<String> {
        if !self.policy.screenshots {
            return None;
        }
        match self.session.screenshot(label).await {
            Ok(reference) => {
                report.screenshots.push(reference.clone());
                Some(reference)
            }
            Err(e) => {
                log.warn(format!("Failed to take screenshot {label}: {e}"));
                None
            }
        }
    }
}

/// Sleeps for `duration` unless the token fires first. False when cancelled.
pub(crate) async fn pause(token: &CancellationToken, duration: Duration) -> bool {
    if duration.is_zero() {
        return !token.is_cancelled();
    }
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{BrowserDriver, ElementState, MemoryDriver};
    use crate::events::{NullSink, RecordingSink};
    use crate::model::BrowserOptions;
    use serde_json::json;

    fn log() -> ExecutionLog {
        ExecutionLog::new(Some("t1".into()), Some("w1".into()), Arc::new(NullSink))
    }

    fn policy() -> StepPolicy {
        StepPolicy {
            screenshots: true,
            ..Default::default()
        }
    }

    fn login_driver() -> MemoryDriver {
        MemoryDriver::new()
            .with_element("#user", ElementState::default())
            .with_element("#submit", ElementState::default())
            .with_element("#banner", ElementState::with_text("Welcome, alice"))
    }

    async fn run(
        driver: &MemoryDriver,
        steps: &[Step],
        policy: StepPolicy,
        variables: &mut Variables,
    ) -> AttemptReport {
        let registry = ActionRegistry::default();
        let session = driver.open_session(&BrowserOptions::default()).await.unwrap();
        let token = CancellationToken::new();
        let executor = StepExecutor::new(&registry, session.as_ref(), &token, policy);
        executor
            .run(steps, variables, &Variables::new(), &mut log())
            .await
    }

    #[tokio::test]
    async fn test_all_steps_pass_in_order() {
        let driver = login_driver();
        let mut variables = Variables::from([("user".to_string(), json!("alice"))]);
        let steps = [
            Step::navigate("https://app.test/login"),
            Step::fill("#user", "${user}"),
            Step::click("#submit"),
            Step::verify_text("#banner", "Welcome, ${user}"),
        ];

        let report = run(&driver, &steps, policy(), &mut variables).await;
        assert_eq!(report.outcome, AttemptOutcome::Passed);
        assert_eq!(report.steps.len(), 4);
        assert!(report.steps.iter().all(|s| s.success));
        assert_eq!(
            report.steps.iter().map(|s| s.index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert!(report.screenshots.is_empty());
        assert!(driver.journal().contains(&"fill #user alice".to_string()));
    }

    #[tokio::test]
    async fn test_failure_stops_remaining_steps() {
        let driver = login_driver();
        let steps = [
            Step::click("#missing"),
            Step::click("#submit"),
        ];

        let report = run(&driver, &steps, policy(), &mut Variables::new()).await;
        assert!(matches!(report.outcome, AttemptOutcome::Failed(ref m) if m.contains("#missing")));
        assert_eq!(report.steps.len(), 1);
        assert!(!report.steps[0].success);
        assert!(report.steps[0].screenshot.is_some());
        assert_eq!(report.screenshots.len(), 1);
        assert!(!driver.journal().contains(&"click #submit".to_string()));
    }

    #[tokio::test]
    async fn test_step_flag_continues_after_failure() {
        let driver = login_driver();
        let lenient_step = Step::click("#missing").with_options(StepOptions {
            continue_on_failure: true,
            ..Default::default()
        });
        let steps = [lenient_step, Step::click("#submit")];

        let report = run(&driver, &steps, policy(), &mut Variables::new()).await;
        assert!(matches!(report.outcome, AttemptOutcome::Failed(_)));
        assert_eq!(report.steps.len(), 2);
        assert!(!report.steps[0].success);
        assert!(report.steps[1].success);
    }

    #[tokio::test]
    async fn test_test_flag_continues_after_failure() {
        let driver = login_driver();
        let steps = [Step::click("#missing"), Step::click("#submit")];
        let policy = StepPolicy {
            continue_on_failure: true,
            ..policy()
        };

        let report = run(&driver, &steps, policy, &mut Variables::new()).await;
        assert_eq!(report.steps.len(), 2);
        assert!(report.steps[1].success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_retries_recover_flaky_element() {
        let driver = login_driver().flaky("#submit", 2);
        let step = Step::click("#submit").with_options(StepOptions {
            retries: 2,
            retry_delay_ms: 10,
            ..Default::default()
        });

        let report = run(&driver, &[step], policy(), &mut Variables::new()).await;
        assert_eq!(report.outcome, AttemptOutcome::Passed);
        let clicks = driver
            .journal()
            .iter()
            .filter(|e| *e == "click #submit")
            .count();
        assert_eq!(clicks, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_retries_exhausted() {
        let driver = login_driver().flaky("#submit", 5);
        let step = Step::click("#submit").with_options(StepOptions {
            retries: 1,
            retry_delay_ms: 10,
            ..Default::default()
        });

        let report = run(&driver, &[step], policy(), &mut Variables::new()).await;
        assert!(matches!(report.outcome, AttemptOutcome::Failed(ref m) if m.contains("transient")));
    }

    #[tokio::test]
    async fn test_driver_panic_becomes_step_failure() {
        let driver = login_driver().panic_on("#submit");
        let report = run(&driver, &[Step::click("#submit")], policy(), &mut Variables::new()).await;
        assert!(matches!(report.outcome, AttemptOutcome::Failed(ref m) if m.contains("panicked")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout() {
        let driver = login_driver().with_action_delay(Duration::from_secs(5));
        let step = Step::click("#submit").with_timeout(Duration::from_millis(100));

        let report = run(&driver, &[step], policy(), &mut Variables::new()).await;
        assert!(matches!(report.outcome, AttemptOutcome::Failed(ref m) if m.contains("Timed out")));
    }

    #[tokio::test]
    async fn test_screenshot_options_and_action() {
        let driver = login_driver();
        let steps = [
            Step::click("#submit").with_options(StepOptions {
                screenshot_before: true,
                screenshot_after: true,
                ..Default::default()
            }),
            Step::new(ActionKind::Screenshot),
        ];

        let report = run(&driver, &steps, policy(), &mut Variables::new()).await;
        assert_eq!(report.screenshots.len(), 3);
        assert!(report.steps[1].screenshot.is_some());

        let disabled = StepPolicy::default();
        let report = run(&driver, &steps, disabled, &mut Variables::new()).await;
        assert!(report.screenshots.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_first_step() {
        let driver = login_driver();
        let registry = ActionRegistry::default();
        let session = driver.open_session(&BrowserOptions::default()).await.unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let executor = StepExecutor::new(&registry, session.as_ref(), &token, policy());
        let report = executor
            .run(&[Step::click("#submit")], &mut Variables::new(), &Variables::new(), &mut log())
            .await;
        assert_eq!(report.outcome, AttemptOutcome::Cancelled);
        assert!(report.steps.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_delay() {
        let driver = login_driver();
        let registry = ActionRegistry::default();
        let session = driver.open_session(&BrowserOptions::default()).await.unwrap();
        let token = CancellationToken::new();
        let step = Step::click("#submit").with_options(StepOptions {
            delay_ms: 60_000,
            ..Default::default()
        });

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let executor = StepExecutor::new(&registry, session.as_ref(), &token, policy());
        let report = executor
            .run(&[step], &mut Variables::new(), &Variables::new(), &mut log())
            .await;
        assert_eq!(report.outcome, AttemptOutcome::Cancelled);
        assert_eq!(report.steps[0].error.as_deref(), Some(CANCELLED_ERROR));
        assert!(!driver.journal().contains(&"click #submit".to_string()));
    }

    #[tokio::test]
    async fn test_log_lines_are_published() {
        let sink = Arc::new(RecordingSink::new());
        let mut log = ExecutionLog::new(Some("t9".into()), None, sink.clone());
        log.info("hello");
        log.error("boom");

        assert_eq!(log.entries().len(), 2);
        assert_eq!(sink.on_topic("/topic/tests/t9/logs").len(), 2);
        assert_eq!(log.take()[1].level, LogLevel::Error);
        assert!(log.entries().is_empty());
    }
}
