//! Run summaries and console output.
//!
//! [`Summary`] aggregates stored tests and results; [`ConsoleReporter`] is an
//! [`EventSink`] that drives a progress bar while a run is in flight, and
//! [`print_summary`] renders the final counts.

pub mod junit;

pub use junit::JUnitReport;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use serde::Serialize;

use crate::events::{Event, EventSink};
use crate::model::{SuiteResult, TestDefinition, TestResult, TestStatus};

/// Counts over stored tests and results.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub total_tests: usize,
    pub status_counts: BTreeMap<TestStatus, usize>,
    pub total_results: usize,
    pub success_count: usize,
    pub failure_count: usize,
    /// Fraction of results that succeeded, 0.0 to 1.0.
    pub success_rate: f64,
    /// Tests that passed only after a retry.
    pub flaky_tests: usize,
}

impl Summary {
    pub fn from_records(tests: &[TestDefinition], results: &[TestResult], flaky_tests: usize) -> Self {
        let success_count = results.iter().filter(|r| r.success).count();
        Self {
            total_tests: tests.len(),
            status_counts: status_counts(tests.iter()),
            total_results: results.len(),
            success_count,
            failure_count: results.len() - success_count,
            success_rate: success_rate(success_count, results.len()),
            flaky_tests,
        }
    }

    /// A summary of one run, counted from its results alone.
    pub fn from_results(results: &[TestResult], flaky_tests: usize) -> Self {
        let mut status_counts = BTreeMap::new();
        for result in results {
            *status_counts.entry(result.status).or_insert(0) += 1;
        }
        let success_count = results.iter().filter(|r| r.success).count();
        Self {
            total_tests: results.len(),
            status_counts,
            total_results: results.len(),
            success_count,
            failure_count: results.len() - success_count,
            success_rate: success_rate(success_count, results.len()),
            flaky_tests,
        }
    }

    pub fn count(&self, status: TestStatus) -> usize {
        self.status_counts.get(&status).copied().unwrap_or(0)
    }

    /// True when every test completed and no result failed.
    pub fn all_passed(&self) -> bool {
        self.failure_count == 0 && self.count(TestStatus::Completed) == self.total_tests
    }
}

fn success_rate(successes: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        successes as f64 / total as f64
    }
}

/// Status counts of the tests that finished within `[from, to]`.
pub fn status_counts_between(
    tests: &[TestDefinition],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> BTreeMap<TestStatus, usize> {
    status_counts(tests.iter().filter(|t| {
        t.completed_at
            .is_some_and(|completed| completed >= from && completed <= to)
    }))
}

fn status_counts<'a>(tests: impl Iterator<Item = &'a TestDefinition>) -> BTreeMap<TestStatus, usize> {
    let mut counts = BTreeMap::new();
    for test in tests {
        *counts.entry(test.status).or_insert(0) += 1;
    }
    counts
}

/// Prints a summary of a run to the console.
pub fn print_summary(summary: &Summary, suites: &[SuiteResult], duration: Duration) {
    println!();
    println!("Test Results:");
    println!("  Total:     {}", summary.total_tests);
    println!(
        "  Passed:    {}",
        console::style(summary.count(TestStatus::Completed)).green()
    );
    println!(
        "  Failed:    {}",
        console::style(summary.count(TestStatus::Failed)).red()
    );

    let timed_out = summary.count(TestStatus::Timeout);
    if timed_out > 0 {
        println!("  Timed out: {}", console::style(timed_out).red());
    }
    let cancelled = summary.count(TestStatus::Cancelled);
    if cancelled > 0 {
        println!("  Cancelled: {}", console::style(cancelled).yellow());
    }
    if summary.flaky_tests > 0 {
        println!("  Flaky:     {}", console::style(summary.flaky_tests).yellow());
    }
    println!("  Success rate: {:.1}%", summary.success_rate * 100.0);
    println!("  Duration:  {:?}", duration);

    if !suites.is_empty() {
        println!();
        println!("Suites:");
        for suite in suites {
            let status = match suite.status {
                TestStatus::Completed => console::style("PASS").green(),
                TestStatus::Cancelled => console::style("CANC").yellow(),
                _ => console::style("FAIL").red(),
            };
            println!(
                "  {} {} ({}/{} passed)",
                status,
                suite.suite_name,
                suite.successful(),
                suite.total()
            );
            if let Some(error) = &suite.error {
                println!("       {}", console::style(error).dim());
            }
        }
    }

    println!();
    if summary.all_passed() && suites.iter().all(|s| s.status == TestStatus::Completed) {
        println!("{}", console::style("All tests passed!").green().bold());
    } else {
        println!("{}", console::style("Some tests failed.").red().bold());
    }
}

/// Shows progress in the terminal as test results arrive.
pub struct ConsoleReporter {
    progress: Mutex<Option<ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    /// Starts the progress bar for `total` expected results.
    pub fn start(&self, total: usize) {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        *self.progress.lock() = Some(pb);
    }

    pub fn finish(&self) {
        if let Some(pb) = self.progress.lock().take() {
            pb.finish_and_clear();
        }
    }

    fn line(&self, message: String) {
        match self.progress.lock().as_ref() {
            Some(pb) => pb.println(message),
            None => println!("{message}"),
        }
    }
}

impl EventSink for ConsoleReporter {
    fn publish(&self, event: &Event) {
        match event {
            Event::TestStatus(status) if self.verbose && status.status == TestStatus::Running => {
                self.line(format!("Running: {}", status.name));
            }
            Event::TestResult(result) => {
                if let Some(pb) = self.progress.lock().as_ref() {
                    pb.inc(1);
                }
                let label = match result.status {
                    TestStatus::Completed => console::style("PASS").green(),
                    TestStatus::Cancelled => console::style("CANC").yellow(),
                    TestStatus::Timeout => console::style("TIME").red(),
                    _ => console::style("FAIL").red(),
                };
                if self.verbose || !result.success {
                    self.line(format!("{} {}", label, result.name));
                    if let Some(error) = &result.error {
                        self.line(format!("     {}", console::style(error).dim()));
                    }
                }
            }
            _ => {}
        }
    }
}
