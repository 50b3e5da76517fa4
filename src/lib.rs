//! testgrid: browser test orchestration across a pool of workers.
//!
//! Tests are queued by priority, dispatched to workers leased from an
//! elastic pool and executed step by step against a browser driver. Suites
//! group tests with shared configuration and run them sequentially or in
//! parallel.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Orchestrator**: queue, worker pool, autoscaler and execution engine
//!   behind one handle
//! - **Driver**: the browser boundary and the action dispatch table
//! - **Store**: persistence of tests, results, workers and suites
//! - **Events**: lifecycle notifications keyed by topic
//! - **Report**: summaries, console progress and JUnit XML
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use testgrid::config::load_config;
//! use testgrid::driver::MemoryDriver;
//! use testgrid::orchestrator::Orchestrator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("testgrid.toml"))?;
//!     let orchestrator = Orchestrator::builder(Arc::new(MemoryDriver::lenient()))
//!         .config(&config)
//!         .build();
//!     orchestrator.start().await;
//!     // ... submit tests, run suites ...
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod model;
pub mod orchestrator;
pub mod report;
pub mod store;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use driver::{ActionRegistry, BrowserDriver, BrowserSession, MemoryDriver};
pub use error::{GridError, GridResult};
pub use events::{Event, EventSink};
pub use model::{Priority, Step, Suite, SuiteResult, TestDefinition, TestResult, TestStatus};
pub use orchestrator::{ExecutionHandle, Orchestrator, TestOutcome};
pub use store::{FileStore, MemoryStore, Store};
