//! Step definitions, per-step options and step results.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The action a step performs.
///
/// Names parse case-insensitively and ignore `-`, `_` and spaces, so
/// `wait-for-element`, `waitForElement` and `WAIT_FOR_ELEMENT` are the same
/// action. Unknown names parse to [`ActionKind::Custom`] and resolve through
/// the action registry at run time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ActionKind {
    Navigate,
    Click,
    Type,
    Fill,
    Wait,
    WaitForNavigation,
    WaitForElement,
    Press,
    PressEnter,
    Select,
    Check,
    Uncheck,
    VerifyText,
    VerifyUrl,
    Expect,
    Screenshot,
    Hover,
    DoubleClick,
    RightClick,
    Focus,
    ScrollIntoView,
    DragAndDrop,
    Evaluate,
    SetVariable,
    GetText,
    GetAttribute,
    Custom(String),
}

impl ActionKind {
    /// Every built-in action, in declaration order.
    pub const BUILTIN: [ActionKind; 26] = [
        Self::Navigate,
        Self::Click,
        Self::Type,
        Self::Fill,
        Self::Wait,
        Self::WaitForNavigation,
        Self::WaitForElement,
        Self::Press,
        Self::PressEnter,
        Self::Select,
        Self::Check,
        Self::Uncheck,
        Self::VerifyText,
        Self::VerifyUrl,
        Self::Expect,
        Self::Screenshot,
        Self::Hover,
        Self::DoubleClick,
        Self::RightClick,
        Self::Focus,
        Self::ScrollIntoView,
        Self::DragAndDrop,
        Self::Evaluate,
        Self::SetVariable,
        Self::GetText,
        Self::GetAttribute,
    ];

    /// Canonical kebab-case name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Navigate => "navigate",
            Self::Click => "click",
            Self::Type => "type",
            Self::Fill => "fill",
            Self::Wait => "wait",
            Self::WaitForNavigation => "wait-for-navigation",
            Self::WaitForElement => "wait-for-element",
            Self::Press => "press",
            Self::PressEnter => "press-enter",
            Self::Select => "select",
            Self::Check => "check",
            Self::Uncheck => "uncheck",
            Self::VerifyText => "verify-text",
            Self::VerifyUrl => "verify-url",
            Self::Expect => "expect",
            Self::Screenshot => "screenshot",
            Self::Hover => "hover",
            Self::DoubleClick => "double-click",
            Self::RightClick => "right-click",
            Self::Focus => "focus",
            Self::ScrollIntoView => "scroll-into-view",
            Self::DragAndDrop => "drag-and-drop",
            Self::Evaluate => "evaluate",
            Self::SetVariable => "set-variable",
            Self::GetText => "get-text",
            Self::GetAttribute => "get-attribute",
            Self::Custom(name) => name,
        }
    }

    /// Whether this action needs an element locator.
    pub fn needs_target(&self) -> bool {
        matches!(
            self,
            Self::Click
                | Self::Type
                | Self::Fill
                | Self::WaitForElement
                | Self::Select
                | Self::Check
                | Self::Uncheck
                | Self::VerifyText
                | Self::Expect
                | Self::Hover
                | Self::DoubleClick
                | Self::RightClick
                | Self::Focus
                | Self::ScrollIntoView
                | Self::DragAndDrop
                | Self::GetText
                | Self::GetAttribute
                | Self::SetVariable
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err("Invalid action: empty name".to_string());
        }
        let compact: String = trimmed
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .flat_map(char::to_lowercase)
            .collect();

        let kind = match compact.as_str() {
            "navigate" | "goto" => Self::Navigate,
            "click" => Self::Click,
            "type" => Self::Type,
            "fill" => Self::Fill,
            "wait" => Self::Wait,
            "waitfornavigation" => Self::WaitForNavigation,
            "waitforelement" | "waitforselector" => Self::WaitForElement,
            "press" => Self::Press,
            "pressenter" => Self::PressEnter,
            "select" => Self::Select,
            "check" => Self::Check,
            "uncheck" => Self::Uncheck,
            "verifytext" => Self::VerifyText,
            "verifyurl" => Self::VerifyUrl,
            "expect" => Self::Expect,
            "screenshot" => Self::Screenshot,
            "hover" => Self::Hover,
            "doubleclick" => Self::DoubleClick,
            "rightclick" => Self::RightClick,
            "focus" => Self::Focus,
            "scrollintoview" => Self::ScrollIntoView,
            "draganddrop" => Self::DragAndDrop,
            "evaluate" => Self::Evaluate,
            "setvariable" => Self::SetVariable,
            "gettext" => Self::GetText,
            "getattribute" => Self::GetAttribute,
            _ => Self::Custom(trimmed.to_string()),
        };
        Ok(kind)
    }
}

impl TryFrom<String> for ActionKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ActionKind> for String {
    fn from(kind: ActionKind) -> Self {
        kind.as_str().to_string()
    }
}

/// How a step's target string addresses an element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocatorStrategy {
    Id,
    Class,
    Name,
    Xpath,
    #[default]
    Css,
}

impl LocatorStrategy {
    /// Renders `target` as a single selector string for this strategy.
    pub fn selector(&self, target: &str) -> String {
        match self {
            Self::Id => format!("#{target}"),
            Self::Class => format!(".{target}"),
            Self::Name => format!("[name=\"{target}\"]"),
            Self::Xpath => format!("xpath={target}"),
            Self::Css => target.to_string(),
        }
    }
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

/// Per-step execution options.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `force` | false |
/// | `wait_for_animations` | true |
/// | `delay_ms` | 0 |
/// | `retries` | 0 |
/// | `retry_delay_ms` | 1000 |
/// | `screenshot_before` / `screenshot_after` | false |
/// | `continue_on_failure` | false |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOptions {
    #[serde(default)]
    pub force: bool,

    #[serde(default = "default_true")]
    pub wait_for_animations: bool,

    /// Pause before the step runs.
    #[serde(default)]
    pub delay_ms: u64,

    /// Extra attempts after the first failure of this step.
    #[serde(default)]
    pub retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub screenshot_before: bool,

    #[serde(default)]
    pub screenshot_after: bool,

    #[serde(default)]
    pub continue_on_failure: bool,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            force: false,
            wait_for_animations: true,
            delay_ms: 0,
            retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
            screenshot_before: false,
            screenshot_after: false,
            continue_on_failure: false,
        }
    }
}

impl StepOptions {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_step_timeout_ms() -> u64 {
    30_000
}

/// One browser action within a test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub action: ActionKind,

    /// Element locator, or URL for `navigate`.
    #[serde(default)]
    pub target: Option<String>,

    #[serde(default)]
    pub strategy: LocatorStrategy,

    #[serde(default)]
    pub value: Option<String>,

    /// Attribute name read by `get-attribute`.
    #[serde(default)]
    pub attribute: Option<String>,

    #[serde(default = "default_step_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub options: Option<StepOptions>,
}

impl Step {
    pub fn new(action: ActionKind) -> Self {
        Self {
            action,
            target: None,
            strategy: LocatorStrategy::default(),
            value: None,
            attribute: None,
            timeout_ms: default_step_timeout_ms(),
            description: None,
            options: None,
        }
    }

    pub fn navigate(url: impl Into<String>) -> Self {
        Self::new(ActionKind::Navigate).with_target(url)
    }

    pub fn click(selector: impl Into<String>) -> Self {
        Self::new(ActionKind::Click).with_target(selector)
    }

    pub fn fill(selector: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(ActionKind::Fill)
            .with_target(selector)
            .with_value(text)
    }

    pub fn verify_text(selector: impl Into<String>, expected: impl Into<String>) -> Self {
        Self::new(ActionKind::VerifyText)
            .with_target(selector)
            .with_value(expected)
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_strategy(mut self, strategy: LocatorStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_options(mut self, options: StepOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Step options, falling back to the given defaults, then to
    /// [`StepOptions::default`].
    pub fn effective_options(&self, defaults: Option<&StepOptions>) -> StepOptions {
        self.options
            .clone()
            .or_else(|| defaults.cloned())
            .unwrap_or_default()
    }

    /// Human-readable label used in logs and results.
    pub fn label(&self) -> String {
        if let Some(description) = &self.description {
            return description.clone();
        }
        match &self.target {
            Some(target) => format!("{} {}", self.action, target),
            None => self.action.to_string(),
        }
    }
}

/// Outcome of one step within one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub action: ActionKind,
    pub description: String,
    pub success: bool,
    pub error: Option<String>,
    pub screenshot: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn start(index: usize, step: &Step) -> Self {
        Self {
            index,
            action: step.action.clone(),
            description: step.label(),
            success: false,
            error: None,
            screenshot: None,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: 0,
        }
    }

    pub fn finish(&mut self, success: bool, error: Option<String>) {
        let now = Utc::now();
        self.success = success;
        self.error = error;
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.ended_at = Some(now);
    }
}
