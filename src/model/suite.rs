//! Test suites and their aggregated results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::step::{Step, StepOptions, StepResult};
use super::test::{BrowserOptions, TestDefinition, TestResult, TestStatus, new_id};

fn default_max_parallel() -> usize {
    3
}

fn default_true() -> bool {
    true
}

/// How suite members are issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecutionStrategy {
    /// One member at a time, in declaration order.
    #[default]
    Sequential,
    /// Up to `max_parallel` members in flight.
    Parallel {
        #[serde(default = "default_max_parallel")]
        max_parallel: usize,
    },
}

/// Configuration shared by every member of a suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteConfig {
    #[serde(default)]
    pub browser: Option<BrowserOptions>,

    #[serde(default = "default_true")]
    pub take_screenshots: bool,

    #[serde(default = "default_true")]
    pub continue_on_failure: bool,

    #[serde(default)]
    pub step_options: Option<StepOptions>,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            browser: None,
            take_screenshots: true,
            continue_on_failure: true,
            step_options: None,
        }
    }
}

impl SuiteConfig {
    /// Fills the member's unset fields from this configuration.
    ///
    /// Fields the member sets explicitly are left alone.
    pub fn apply_to(&self, test: &mut TestDefinition) {
        if test.browser.is_none() {
            test.browser = self.browser.clone();
        }
        if test.take_screenshots.is_none() {
            test.take_screenshots = Some(self.take_screenshots);
        }
        if test.continue_on_failure.is_none() {
            test.continue_on_failure = Some(self.continue_on_failure);
        }
        if test.step_options.is_none() {
            test.step_options = self.step_options.clone();
        }
    }
}

/// A named group of tests run together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suite {
    #[serde(default = "new_id")]
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub tests: Vec<TestDefinition>,

    #[serde(default)]
    pub config: SuiteConfig,

    #[serde(default)]
    pub strategy: ExecutionStrategy,

    #[serde(default)]
    pub stop_on_first_failure: bool,

    #[serde(default)]
    pub preconditions: Vec<Step>,

    #[serde(default)]
    pub postconditions: Vec<Step>,

    #[serde(default)]
    pub status: TestStatus,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub error: Option<String>,
}

impl Suite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            description: None,
            tags: Vec::new(),
            tests: Vec::new(),
            config: SuiteConfig::default(),
            strategy: ExecutionStrategy::default(),
            stop_on_first_failure: false,
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            status: TestStatus::Queued,
            created_at: Some(Utc::now()),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn with_test(mut self, test: TestDefinition) -> Self {
        self.tests.push(test);
        self
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_config(mut self, config: SuiteConfig) -> Self {
        self.config = config;
        self
    }

    pub fn stop_on_first_failure(mut self, stop: bool) -> Self {
        self.stop_on_first_failure = stop;
        self
    }

    pub fn with_precondition(mut self, step: Step) -> Self {
        self.preconditions.push(step);
        self
    }

    pub fn with_postcondition(mut self, step: Step) -> Self {
        self.postconditions.push(step);
        self
    }

    /// Same rules as [`TestDefinition::transition`].
    pub fn transition(&mut self, next: TestStatus, error: Option<String>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        match next {
            TestStatus::Queued => {}
            TestStatus::Running => self.started_at = Some(now),
            _ => self.completed_at = Some(now),
        }
        self.status = next;
        if error.is_some() {
            self.error = error;
        }
        true
    }

    pub(crate) fn reset_for_run(&mut self) {
        self.status = TestStatus::Queued;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
    }
}

/// Outcome of one suite run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteResult {
    pub id: String,
    pub suite_id: String,
    pub suite_name: String,
    pub status: TestStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub test_results: Vec<TestResult>,
    pub precondition_results: Vec<StepResult>,
    pub postcondition_results: Vec<StepResult>,
    /// Ids of members that were never issued.
    pub not_run: Vec<String>,
    pub error: Option<String>,
}

impl SuiteResult {
    pub fn start(suite: &Suite) -> Self {
        Self {
            id: new_id(),
            suite_id: suite.id.clone(),
            suite_name: suite.name.clone(),
            status: TestStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            test_results: Vec::new(),
            precondition_results: Vec::new(),
            postcondition_results: Vec::new(),
            not_run: Vec::new(),
            error: None,
        }
    }

    pub fn finish(&mut self, status: TestStatus, error: Option<String>) {
        self.status = status;
        if error.is_some() {
            self.error = error;
        }
        self.ended_at = Some(Utc::now());
    }

    pub fn total(&self) -> usize {
        self.test_results.len() + self.not_run.len()
    }

    fn count(&self, status: TestStatus) -> usize {
        self.test_results
            .iter()
            .filter(|r| r.status == status)
            .count()
    }

    pub fn successful(&self) -> usize {
        self.count(TestStatus::Completed)
    }

    /// Failed and timed-out members.
    pub fn failed(&self) -> usize {
        self.count(TestStatus::Failed) + self.count(TestStatus::Timeout)
    }

    pub fn cancelled(&self) -> usize {
        self.count(TestStatus::Cancelled)
    }

    pub fn queued(&self) -> usize {
        self.count(TestStatus::Queued)
    }

    pub fn running(&self) -> usize {
        self.count(TestStatus::Running)
    }

    /// Percentage of recorded members that completed, 0 to 100.
    pub fn success_rate(&self) -> f64 {
        if self.test_results.is_empty() {
            return 0.0;
        }
        self.successful() as f64 * 100.0 / self.test_results.len() as f64
    }

    pub fn total_duration_ms(&self) -> u64 {
        match self.ended_at {
            Some(end) => (end - self.started_at).num_milliseconds().max(0) as u64,
            None => (Utc::now() - self.started_at).num_milliseconds().max(0) as u64,
        }
    }
}
