//! Browser automation boundary.
//!
//! The engine never talks to a browser directly. It opens a
//! [`BrowserSession`] through a [`BrowserDriver`] and runs each step through
//! the [`ActionRegistry`](actions::ActionRegistry), whose handlers call the
//! session's primitive operations.
//!
//! # Implementing a driver
//!
//! ```ignore
//! #[async_trait]
//! impl BrowserDriver for MyDriver {
//!     fn name(&self) -> &str { "my-driver" }
//!
//!     async fn open_session(&self, options: &BrowserOptions)
//!         -> DriverResult<Box<dyn BrowserSession>> {
//!         Ok(Box::new(MySession::launch(options).await?))
//!     }
//! }
//! ```
//!
//! [`memory::MemoryDriver`] simulates a page in memory and is used by the
//! CLI's dry runs and by the test suite.

pub mod actions;
pub mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{ActionKind, BrowserOptions, LocatorStrategy, StepOptions};

pub use actions::{ActionContext, ActionHandler, ActionRegistry};
pub use memory::{ElementState, MemoryDriver};

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Failed to open browser session: {0}")]
    SessionFailed(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Timed out after {timeout:?}: {message}")]
    Timeout { timeout: Duration, message: String },

    #[error("Unsupported action: {0}")]
    Unsupported(String),

    #[error("Invalid step: {0}")]
    InvalidStep(String),

    #[error("Driver error: {0}")]
    Other(#[from] anyhow::Error),
}

/// An element address: strategy plus target string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub strategy: LocatorStrategy,
    pub target: String,
}

impl Locator {
    pub fn new(strategy: LocatorStrategy, target: impl Into<String>) -> Self {
        Self {
            strategy,
            target: target.into(),
        }
    }

    pub fn css(selector: impl Into<String>) -> Self {
        Self::new(LocatorStrategy::Css, selector)
    }

    /// Single selector string for this locator.
    pub fn selector(&self) -> String {
        self.strategy.selector(&self.target)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.selector())
    }
}

/// Pointer and focus interactions that take only a locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interaction {
    Click,
    DoubleClick,
    RightClick,
    Hover,
    Focus,
    ScrollIntoView,
    Check,
    Uncheck,
}

/// A step with placeholders substituted, ready to execute.
#[derive(Debug, Clone)]
pub struct ResolvedStep {
    pub index: usize,
    pub action: ActionKind,
    pub target: Option<String>,
    pub strategy: LocatorStrategy,
    pub value: Option<String>,
    pub attribute: Option<String>,
    pub timeout: Duration,
    pub options: StepOptions,
}

impl ResolvedStep {
    pub fn target(&self) -> DriverResult<&str> {
        self.target
            .as_deref()
            .ok_or_else(|| DriverError::InvalidStep(format!("{} requires a target", self.action)))
    }

    pub fn value(&self) -> DriverResult<&str> {
        self.value
            .as_deref()
            .ok_or_else(|| DriverError::InvalidStep(format!("{} requires a value", self.action)))
    }

    pub fn locator(&self) -> DriverResult<Locator> {
        Ok(Locator::new(self.strategy, self.target()?))
    }

    /// Parses `value` as milliseconds, falling back to `default` when unset.
    pub fn value_millis(&self, default: u64) -> DriverResult<Duration> {
        match self.value.as_deref().map(str::trim) {
            None | Some("") => Ok(Duration::from_millis(default)),
            Some(raw) => raw.parse::<u64>().map(Duration::from_millis).map_err(|_| {
                DriverError::InvalidStep(format!("{}: '{raw}' is not a duration in ms", self.action))
            }),
        }
    }
}

/// One open browser context, used by a single execution at a time.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    fn id(&self) -> &str;

    async fn navigate(&self, url: &str, timeout: Duration) -> DriverResult<()>;

    async fn current_url(&self) -> DriverResult<String>;

    async fn interact(
        &self,
        locator: &Locator,
        interaction: Interaction,
        force: bool,
    ) -> DriverResult<()>;

    /// Replaces the element's value.
    async fn fill(&self, locator: &Locator, text: &str) -> DriverResult<()>;

    /// Types text key by key, appending to the current value.
    async fn type_text(&self, locator: &Locator, text: &str) -> DriverResult<()>;

    async fn select(&self, locator: &Locator, option: &str) -> DriverResult<()>;

    async fn press(&self, key: &str, locator: Option<&Locator>) -> DriverResult<()>;

    async fn drag_and_drop(&self, source: &Locator, destination: &Locator) -> DriverResult<()>;

    async fn text(&self, locator: &Locator) -> DriverResult<String>;

    async fn attribute(&self, locator: &Locator, name: &str) -> DriverResult<Option<String>>;

    async fn wait_for_element(&self, locator: &Locator, timeout: Duration) -> DriverResult<()>;

    async fn wait_for_navigation(&self, timeout: Duration) -> DriverResult<()>;

    async fn evaluate(&self, script: &str) -> DriverResult<serde_json::Value>;

    /// Captures the page and returns a reference to the stored image.
    async fn screenshot(&self, label: &str) -> DriverResult<String>;

    async fn close(&self) -> DriverResult<()>;
}

/// Opens browser sessions.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    fn name(&self) -> &str;

    async fn open_session(&self, options: &BrowserOptions)
    -> DriverResult<Box<dyn BrowserSession>>;
}
