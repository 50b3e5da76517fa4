//! JUnit XML report generation.
//!
//! Suite results become `<testsuite>` elements and their members
//! `<testcase>` elements, which CI systems (Jenkins, GitLab CI, GitHub
//! Actions) render natively.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="3" failures="1" errors="0" skipped="0" time="1.234">
//!   <testsuite name="checkout" tests="3" failures="1" errors="0" skipped="0" time="1.234">
//!     <testcase classname="checkout" name="add to cart" time="0.100"/>
//!     <testcase classname="checkout" name="pay" time="0.150">
//!       <failure message="Step 2 (click #pay) failed: element not found" type="StepFailure">
//!         step 2 click #pay: element not found
//!       </failure>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! Failed members become `<failure>`, timeouts `<error>`, and cancelled or
//! never-run members `<skipped>`.

use std::path::Path;

use anyhow::Context;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::model::{SuiteResult, TestResult, TestStatus};

/// One `<testsuite>` element.
#[derive(Debug, Clone)]
struct SuiteEntry {
    name: String,
    results: Vec<TestResult>,
    not_run: Vec<String>,
    time_secs: f64,
}

impl SuiteEntry {
    fn count(&self, status: TestStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    fn tests(&self) -> usize {
        self.results.len() + self.not_run.len()
    }

    fn failures(&self) -> usize {
        self.count(TestStatus::Failed)
    }

    fn errors(&self) -> usize {
        self.count(TestStatus::Timeout)
    }

    fn skipped(&self) -> usize {
        self.count(TestStatus::Cancelled) + self.not_run.len()
    }
}

/// Collects suite and standalone results and renders them as JUnit XML.
#[derive(Debug, Clone, Default)]
pub struct JUnitReport {
    suites: Vec<SuiteEntry>,
}

impl JUnitReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_suite(mut self, result: &SuiteResult) -> Self {
        self.suites.push(SuiteEntry {
            name: result.suite_name.clone(),
            results: result.test_results.clone(),
            not_run: result.not_run.clone(),
            time_secs: result.total_duration_ms() as f64 / 1000.0,
        });
        self
    }

    /// Adds standalone tests as one `<testsuite>` named `name`.
    pub fn with_tests(mut self, name: impl Into<String>, results: &[TestResult]) -> Self {
        if results.is_empty() {
            return self;
        }
        self.suites.push(SuiteEntry {
            name: name.into(),
            results: results.to_vec(),
            not_run: Vec::new(),
            time_secs: results.iter().map(|r| r.duration_ms).sum::<u64>() as f64 / 1000.0,
        });
        self
    }

    pub fn to_xml(&self) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let tests: usize = self.suites.iter().map(SuiteEntry::tests).sum();
        let failures: usize = self.suites.iter().map(SuiteEntry::failures).sum();
        let errors: usize = self.suites.iter().map(SuiteEntry::errors).sum();
        let skipped: usize = self.suites.iter().map(SuiteEntry::skipped).sum();
        let time: f64 = self.suites.iter().map(|s| s.time_secs).sum();

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", tests.to_string().as_str()));
        testsuites.push_attribute(("failures", failures.to_string().as_str()));
        testsuites.push_attribute(("errors", errors.to_string().as_str()));
        testsuites.push_attribute(("skipped", skipped.to_string().as_str()));
        testsuites.push_attribute(("time", format!("{:.3}", time).as_str()));
        writer.write_event(Event::Start(testsuites))?;

        for suite in &self.suites {
            write_suite(&mut writer, suite)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;
        Ok(String::from_utf8(writer.into_inner())?)
    }

    /// Writes the report, creating parent directories as needed.
    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, self.to_xml()?)
            .with_context(|| format!("Failed to write JUnit XML to {}", path.display()))?;
        tracing::info!("JUnit XML written to: {}", path.display());
        Ok(())
    }
}

fn write_suite<W: std::io::Write>(writer: &mut Writer<W>, suite: &SuiteEntry) -> anyhow::Result<()> {
    let mut testsuite = BytesStart::new("testsuite");
    testsuite.push_attribute(("name", sanitize(&suite.name).as_str()));
    testsuite.push_attribute(("tests", suite.tests().to_string().as_str()));
    testsuite.push_attribute(("failures", suite.failures().to_string().as_str()));
    testsuite.push_attribute(("errors", suite.errors().to_string().as_str()));
    testsuite.push_attribute(("skipped", suite.skipped().to_string().as_str()));
    testsuite.push_attribute(("time", format!("{:.3}", suite.time_secs).as_str()));
    writer.write_event(Event::Start(testsuite))?;

    for result in &suite.results {
        write_testcase(writer, &suite.name, result)?;
    }
    for id in &suite.not_run {
        let mut testcase = BytesStart::new("testcase");
        testcase.push_attribute(("classname", sanitize(&suite.name).as_str()));
        testcase.push_attribute(("name", sanitize(id).as_str()));
        testcase.push_attribute(("time", "0.000"));
        writer.write_event(Event::Start(testcase))?;
        let mut skipped = BytesStart::new("skipped");
        skipped.push_attribute(("message", "not run"));
        writer.write_event(Event::Empty(skipped))?;
        writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    classname: &str,
    result: &TestResult,
) -> anyhow::Result<()> {
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", sanitize(classname).as_str()));
    testcase.push_attribute(("name", sanitize(&result.name).as_str()));
    testcase.push_attribute((
        "time",
        format!("{:.3}", result.duration_ms as f64 / 1000.0).as_str(),
    ));

    let (element, kind) = match result.status {
        TestStatus::Completed => {
            writer.write_event(Event::Empty(testcase))?;
            return Ok(());
        }
        TestStatus::Timeout => ("error", "Timeout"),
        TestStatus::Cancelled | TestStatus::Queued => ("skipped", "Cancelled"),
        TestStatus::Failed | TestStatus::Running => ("failure", "StepFailure"),
    };

    writer.write_event(Event::Start(testcase))?;
    let mut detail = BytesStart::new(element);
    if let Some(message) = &result.error {
        detail.push_attribute(("message", sanitize(message).as_str()));
    }
    if element == "skipped" {
        writer.write_event(Event::Empty(detail))?;
    } else {
        detail.push_attribute(("type", kind));
        writer.write_event(Event::Start(detail))?;
        let steps: Vec<String> = result
            .failed_steps()
            .map(|s| {
                format!(
                    "step {} {}: {}",
                    s.index + 1,
                    s.description,
                    s.error.as_deref().unwrap_or("failed")
                )
            })
            .collect();
        if !steps.is_empty() {
            writer.write_event(Event::Text(BytesText::new(&sanitize(&steps.join("\n")))))?;
        }
        writer.write_event(Event::End(BytesEnd::new(element)))?;
    }

    if !result.logs.is_empty() {
        let out: Vec<String> = result
            .logs
            .iter()
            .map(|entry| format!("[{}] {}", entry.level, entry.message))
            .collect();
        writer.write_event(Event::Start(BytesStart::new("system-out")))?;
        writer.write_event(Event::Text(BytesText::new(&sanitize(&out.join("\n")))))?;
        writer.write_event(Event::End(BytesEnd::new("system-out")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// Drops characters XML 1.0 cannot carry. Escaping is left to the writer.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}
