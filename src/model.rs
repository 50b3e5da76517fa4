//! Core data types shared by the queue, pool, engine and suite runner.
//!
//! - [`TestDefinition`] and its [`TestStatus`] lifecycle
//! - [`Step`] with [`ActionKind`], [`StepOptions`] and [`StepResult`]
//! - [`TestResult`] and streamed [`LogEntry`] lines
//! - [`Worker`] and [`WorkerStatus`]
//! - [`Suite`] and [`SuiteResult`]

pub mod step;
pub mod suite;
pub mod worker;

pub use step::{ActionKind, LocatorStrategy, Step, StepOptions, StepResult};
pub use suite::{ExecutionStrategy, Suite, SuiteConfig, SuiteResult};
pub use test::{
    BrowserKind, BrowserOptions, LogEntry, LogLevel, Priority, TestDefinition, TestResult,
    TestStatus, Variables,
};
pub use worker::{Worker, WorkerStatus};
