//! Suite execution on top of the [`Orchestrator`] queue.
//!
//! A suite run goes through preconditions, members and postconditions.
//! Members are submitted through the regular queue, so they compete for
//! workers like any other test. The [`SuiteResult`] is persisted and
//! published after every member so progress is visible while it runs.

use futures::StreamExt;
use futures::stream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Orchestrator;
use super::steps::AttemptOutcome;
use crate::error::{GridError, GridResult};
use crate::events::{Event, SuiteStatusEvent};
use crate::model::{
    ExecutionStrategy, Suite, SuiteResult, TestDefinition, TestResult, TestStatus, Variables,
};

const PRECONDITION_FAILED: &str = "precondition failed";
const POSTCONDITION_FAILED: &str = "postcondition failed";
const SUITE_CANCELLED: &str = "Suite cancelled";

impl Orchestrator {
    /// Runs a suite to completion and returns its result.
    pub async fn run_suite(&self, suite: Suite) -> GridResult<SuiteResult> {
        let token = self.claim_suite(&suite)?;
        Ok(self.execute_suite(suite, token).await)
    }

    /// Starts a suite in the background. The suite can be cancelled as soon
    /// as this returns.
    pub fn start_suite(&self, suite: Suite) -> GridResult<JoinHandle<SuiteResult>> {
        let token = self.claim_suite(&suite)?;
        let orchestrator = self.clone();
        Ok(tokio::spawn(async move {
            orchestrator.execute_suite(suite, token).await
        }))
    }

    /// Stops a running suite: queued members are cancelled, running members
    /// are cancelled cooperatively and no further members start.
    pub fn cancel_suite(&self, suite_id: &str) -> GridResult<()> {
        let token = self
            .inner
            .suites
            .get(suite_id)
            .ok_or_else(|| GridError::suite_not_found(suite_id))?;
        info!(suite_id, "Cancelling suite");
        token.cancel();
        Ok(())
    }

    pub fn is_suite_running(&self, suite_id: &str) -> bool {
        self.inner.suites.contains_key(suite_id)
    }

    /// Every run of a suite, oldest first.
    pub async fn suite_results(&self, suite_id: &str) -> GridResult<Vec<SuiteResult>> {
        Ok(self.inner.store.find_suite_results_by_suite(suite_id).await?)
    }

    pub async fn suite_result(&self, result_id: &str) -> GridResult<SuiteResult> {
        self.inner
            .store
            .find_suite_result(result_id)
            .await?
            .ok_or_else(|| GridError::NotFound {
                kind: "Suite result",
                id: result_id.to_string(),
            })
    }

    fn claim_suite(&self, suite: &Suite) -> GridResult<CancellationToken> {
        use dashmap::mapref::entry::Entry;

        match self.inner.suites.entry(suite.id.clone()) {
            Entry::Occupied(_) => Err(GridError::AlreadySubmitted(suite.id.clone())),
            Entry::Vacant(entry) => {
                let token = self.inner.shutdown.child_token();
                entry.insert(token.clone());
                Ok(token)
            }
        }
    }

    async fn execute_suite(&self, mut suite: Suite, token: CancellationToken) -> SuiteResult {
        suite.reset_for_run();
        suite.transition(TestStatus::Running, None);
        let mut result = SuiteResult::start(&suite);
        info!(
            suite_id = %suite.id,
            "Running suite {} with {} tests ({:?})",
            suite.name,
            suite.tests.len(),
            suite.strategy
        );
        self.save_suite(&suite).await;
        self.publish_suite(&suite);
        self.record_progress(&result).await;

        let mut variables = Variables::new();
        let (pre, _) = self
            .inner
            .engine
            .run_conditions(
                "precondition",
                &suite.preconditions,
                &suite.config,
                &mut variables,
                &token,
            )
            .await;
        result.precondition_results = pre.steps;
        let pre_passed = matches!(pre.outcome, AttemptOutcome::Passed);

        if pre_passed {
            let members: Vec<TestDefinition> = suite
                .tests
                .iter()
                .cloned()
                .map(|mut member| {
                    suite.config.apply_to(&mut member);
                    for (name, value) in &variables {
                        member
                            .variables
                            .entry(name.clone())
                            .or_insert_with(|| value.clone());
                    }
                    member
                })
                .collect();
            match suite.strategy {
                ExecutionStrategy::Sequential => {
                    self.run_sequential(&suite, members, &token, &mut result)
                        .await
                }
                ExecutionStrategy::Parallel { max_parallel } => {
                    self.run_parallel(members, max_parallel, &token, &mut result)
                        .await
                }
            }
        } else {
            warn!(suite_id = %suite.id, "Preconditions failed, skipping {} tests", suite.tests.len());
            result.not_run = suite.tests.iter().map(|t| t.id.clone()).collect();
        }

        // Postconditions run even after cancellation; only shutdown stops them.
        let cleanup = self.inner.shutdown.child_token();
        let (post, _) = self
            .inner
            .engine
            .run_conditions(
                "postcondition",
                &suite.postconditions,
                &suite.config,
                &mut variables,
                &cleanup,
            )
            .await;
        result.postcondition_results = post.steps;
        let post_passed = matches!(post.outcome, AttemptOutcome::Passed);

        let (status, error) = if token.is_cancelled() {
            (TestStatus::Cancelled, Some(SUITE_CANCELLED.to_string()))
        } else if !pre_passed {
            (TestStatus::Failed, Some(PRECONDITION_FAILED.to_string()))
        } else if !post_passed {
            (TestStatus::Failed, Some(POSTCONDITION_FAILED.to_string()))
        } else {
            let unsuccessful = result.total() - result.successful();
            if unsuccessful == 0 {
                (TestStatus::Completed, None)
            } else {
                (
                    TestStatus::Failed,
                    Some(format!("{} of {} tests failed", unsuccessful, result.total())),
                )
            }
        };

        result.finish(status, error.clone());
        suite.transition(status, error);
        info!(
            suite_id = %suite.id,
            "Suite {} finished: {} ({}/{} passed)",
            suite.name,
            status,
            result.successful(),
            result.total()
        );

        self.save_suite(&suite).await;
        self.record_progress(&result).await;
        self.publish_suite(&suite);
        self.inner.suites.remove(&suite.id);
        result
    }

    async fn run_sequential(
        &self,
        suite: &Suite,
        members: Vec<TestDefinition>,
        token: &CancellationToken,
        result: &mut SuiteResult,
    ) {
        let mut members = members.into_iter();
        for member in members.by_ref() {
            let Some(test_result) = self.run_member(member.clone(), token).await else {
                result.not_run.push(member.id);
                break;
            };
            let failed = test_result.status != TestStatus::Completed;
            result.test_results.push(test_result);
            self.record_progress(result).await;

            if failed && suite.stop_on_first_failure {
                info!(suite_id = %suite.id, "Stopping suite after first failure");
                break;
            }
        }
        result.not_run.extend(members.map(|m| m.id));
    }

    async fn run_parallel(
        &self,
        members: Vec<TestDefinition>,
        max_parallel: usize,
        token: &CancellationToken,
        result: &mut SuiteResult,
    ) {
        let mut outcomes = stream::iter(members)
            .map(|member| async move {
                let id = member.id.clone();
                (id, self.run_member(member, token).await)
            })
            .buffer_unordered(max_parallel.max(1));

        while let Some((id, outcome)) = outcomes.next().await {
            match outcome {
                Some(test_result) => {
                    result.test_results.push(test_result);
                    self.record_progress(result).await;
                }
                None => result.not_run.push(id),
            }
        }
    }

    /// Submits one member and waits for it. Returns `None` when the suite
    /// was cancelled before the member could start.
    async fn run_member(
        &self,
        member: TestDefinition,
        token: &CancellationToken,
    ) -> Option<TestResult> {
        if token.is_cancelled() {
            return None;
        }

        let handle = match self.submit(member.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(test_id = %member.id, "Suite member rejected: {}", e);
                return Some(TestResult::unexecuted(
                    &member,
                    TestStatus::Failed,
                    Some(e.to_string()),
                ));
            }
        };

        let test_id = handle.test_id().to_string();
        let wait = handle.wait();
        tokio::pin!(wait);
        let outcome = tokio::select! {
            outcome = &mut wait => outcome,
            _ = token.cancelled() => {
                if let Err(e) = self.cancel_test(&test_id).await {
                    debug!(test_id, "Member already gone: {}", e);
                }
                wait.await
            }
        };

        Some(match outcome {
            Ok(outcome) => match outcome.result {
                Some(result) => result,
                None => TestResult::unexecuted(
                    &outcome.test,
                    outcome.test.status,
                    outcome.test.error.clone(),
                ),
            },
            Err(e) => TestResult::unexecuted(&member, TestStatus::Cancelled, Some(e.to_string())),
        })
    }

    async fn record_progress(&self, result: &SuiteResult) {
        if let Err(e) = self.inner.store.save_suite_result(result).await {
            warn!(suite_id = %result.suite_id, "Failed to persist suite result: {}", e);
        }
        self.inner
            .events
            .publish(&Event::SuiteResult(Box::new(result.clone())));
    }

    async fn save_suite(&self, suite: &Suite) {
        if let Err(e) = self.inner.store.save_suite(suite).await {
            warn!(suite_id = %suite.id, "Failed to persist suite: {}", e);
        }
    }

    fn publish_suite(&self, suite: &Suite) {
        self.inner
            .events
            .publish(&Event::SuiteStatus(SuiteStatusEvent::from(suite)));
    }
}
