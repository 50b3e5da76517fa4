//! In-memory browser simulation.
//!
//! [`MemoryDriver`] models a single page per session: a URL, a map of
//! selector to [`ElementState`], the focused element and pressed keys. It
//! executes no scripts and renders nothing. Screenshots are references of the
//! form `memory://{session}/{n}-{label}.png`.
//!
//! In strict mode (the default) actions on unknown selectors fail with
//! [`DriverError::ElementNotFound`]. [`MemoryDriver::lenient`] creates
//! unknown elements on first touch, which lets arbitrary plans dry-run.
//!
//! Fault injection hooks: [`flaky`](MemoryDriver::flaky),
//! [`fail_sessions`](MemoryDriver::fail_sessions),
//! [`panic_on`](MemoryDriver::panic_on) and
//! [`with_action_delay`](MemoryDriver::with_action_delay).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{BrowserDriver, BrowserSession, DriverError, DriverResult, Interaction, Locator};
use crate::model::BrowserOptions;

/// Simulated state of one element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementState {
    #[serde(default)]
    pub text: String,

    #[serde(default)]
    pub value: String,

    #[serde(default)]
    pub attributes: HashMap<String, String>,

    #[serde(default)]
    pub checked: bool,

    #[serde(default)]
    pub hidden: bool,

    /// Allowed values for `select`; empty accepts anything.
    #[serde(default)]
    pub options: Vec<String>,
}

impl ElementState {
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_options(mut self, options: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }
}

/// State shared between a driver and every session it opened.
#[derive(Default)]
struct Shared {
    journal: Mutex<Vec<String>>,
    flaky: Mutex<HashMap<String, u32>>,
    session_failures: AtomicU32,
    sessions_opened: AtomicUsize,
    open_sessions: AtomicUsize,
    max_concurrent: AtomicUsize,
}

/// Browser driver that simulates pages in memory.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    elements: HashMap<String, ElementState>,
    lenient: bool,
    action_delay: Duration,
    panic_selector: Option<String>,
    shared: Arc<Shared>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A driver that creates unknown elements on first use.
    pub fn lenient() -> Self {
        Self {
            lenient: true,
            ..Self::default()
        }
    }

    /// Seeds an element into every session opened from now on.
    pub fn with_element(mut self, selector: impl Into<String>, element: ElementState) -> Self {
        self.elements.insert(selector.into(), element);
        self
    }

    pub fn with_elements(mut self, elements: HashMap<String, ElementState>) -> Self {
        self.elements.extend(elements);
        self
    }

    /// Every session operation sleeps this long first.
    pub fn with_action_delay(mut self, delay: Duration) -> Self {
        self.action_delay = delay;
        self
    }

    /// The next `failures` actions on `selector` fail, across all sessions.
    pub fn flaky(self, selector: impl Into<String>, failures: u32) -> Self {
        self.shared.flaky.lock().insert(selector.into(), failures);
        self
    }

    /// The next `count` calls to `open_session` fail.
    pub fn fail_sessions(self, count: u32) -> Self {
        self.shared.session_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Any interaction with `selector` panics.
    pub fn panic_on(mut self, selector: impl Into<String>) -> Self {
        self.panic_selector = Some(selector.into());
        self
    }

    /// Every action performed so far, e.g. `"fill #user alice"`.
    pub fn journal(&self) -> Vec<String> {
        self.shared.journal.lock().clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.shared.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.shared.open_sessions.load(Ordering::SeqCst)
    }

    /// Highest number of sessions open at the same time.
    pub fn max_concurrent_sessions(&self) -> usize {
        self.shared.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserDriver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open_session(
        &self,
        options: &BrowserOptions,
    ) -> DriverResult<Box<dyn BrowserSession>> {
        let shared = &self.shared;
        let failed = shared
            .session_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DriverError::SessionFailed(format!(
                "{:?} could not be launched",
                options.browser
            )));
        }

        let number = shared.sessions_opened.fetch_add(1, Ordering::SeqCst) + 1;
        let open = shared.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        shared.max_concurrent.fetch_max(open, Ordering::SeqCst);

        Ok(Box::new(MemorySession {
            id: format!("session-{number}"),
            page: Mutex::new(Page {
                url: "about:blank".to_string(),
                elements: self.elements.clone(),
                focused: None,
                keys: Vec::new(),
                navigations: 0,
                screenshots: 0,
            }),
            lenient: self.lenient,
            action_delay: self.action_delay,
            panic_selector: self.panic_selector.clone(),
            closed: AtomicUsize::new(0),
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct Page {
    url: String,
    elements: HashMap<String, ElementState>,
    focused: Option<String>,
    keys: Vec<String>,
    navigations: u64,
    screenshots: u64,
}

pub struct MemorySession {
    id: String,
    page: Mutex<Page>,
    lenient: bool,
    action_delay: Duration,
    panic_selector: Option<String>,
    closed: AtomicUsize,
    shared: Arc<Shared>,
}

impl MemorySession {
    async fn begin(&self, entry: String) {
        if !self.action_delay.is_zero() {
            tokio::time::sleep(self.action_delay).await;
        }
        self.shared.journal.lock().push(entry);
    }

    fn check_injected(&self, selector: &str) -> DriverResult<()> {
        if self.panic_selector.as_deref() == Some(selector) {
            panic!("memory driver crashed on {selector}");
        }
        let mut flaky = self.shared.flaky.lock();
        if let Some(remaining) = flaky.get_mut(selector)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(DriverError::Other(anyhow::anyhow!(
                "transient failure on {selector}"
            )));
        }
        Ok(())
    }

    /// Runs `f` against the element, creating it first in lenient mode.
    fn with_element<R>(
        &self,
        locator: &Locator,
        f: impl FnOnce(&mut ElementState) -> DriverResult<R>,
    ) -> DriverResult<R> {
        let selector = locator.selector();
        self.check_injected(&selector)?;
        let mut page = self.page.lock();
        if self.lenient {
            let element = page.elements.entry(selector).or_default();
            return f(element);
        }
        match page.elements.get_mut(&selector) {
            Some(element) => f(element),
            None => Err(DriverError::ElementNotFound(selector)),
        }
    }
}

#[async_trait]
impl BrowserSession for MemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str, _timeout: Duration) -> DriverResult<()> {
        self.begin(format!("navigate {url}")).await;
        self.check_injected(url)?;
        if url.trim().is_empty() {
            return Err(DriverError::InvalidStep("empty URL".to_string()));
        }
        let mut page = self.page.lock();
        page.url = url.to_string();
        page.navigations += 1;
        Ok(())
    }

    async fn current_url(&self) -> DriverResult<String> {
        Ok(self.page.lock().url.clone())
    }

    async fn interact(
        &self,
        locator: &Locator,
        interaction: Interaction,
        force: bool,
    ) -> DriverResult<()> {
        self.begin(format!("{interaction:?} {locator}").to_lowercase())
            .await;
        self.with_element(locator, |element| {
            if element.hidden && !force && interaction != Interaction::ScrollIntoView {
                return Err(DriverError::AssertionFailed(format!(
                    "{locator} is not visible"
                )));
            }
            match interaction {
                Interaction::Check => element.checked = true,
                Interaction::Uncheck => element.checked = false,
                _ => {}
            }
            Ok(())
        })?;
        if interaction == Interaction::Focus || interaction == Interaction::Click {
            self.page.lock().focused = Some(locator.selector());
        }
        Ok(())
    }

    async fn fill(&self, locator: &Locator, text: &str) -> DriverResult<()> {
        self.begin(format!("fill {locator} {text}")).await;
        self.with_element(locator, |element| {
            element.value = text.to_string();
            Ok(())
        })
    }

    async fn type_text(&self, locator: &Locator, text: &str) -> DriverResult<()> {
        self.begin(format!("type {locator} {text}")).await;
        self.with_element(locator, |element| {
            element.value.push_str(text);
            Ok(())
        })
    }

    async fn select(&self, locator: &Locator, option: &str) -> DriverResult<()> {
        self.begin(format!("select {locator} {option}")).await;
        self.with_element(locator, |element| {
            if !element.options.is_empty() && !element.options.iter().any(|o| o == option) {
                return Err(DriverError::AssertionFailed(format!(
                    "{locator} has no option '{option}'"
                )));
            }
            element.value = option.to_string();
            Ok(())
        })
    }

    async fn press(&self, key: &str, locator: Option<&Locator>) -> DriverResult<()> {
        match locator {
            Some(locator) => {
                self.begin(format!("press {key} {locator}")).await;
                self.with_element(locator, |_| Ok(()))?;
            }
            None => self.begin(format!("press {key}")).await,
        }
        self.page.lock().keys.push(key.to_string());
        Ok(())
    }

    async fn drag_and_drop(&self, source: &Locator, destination: &Locator) -> DriverResult<()> {
        self.begin(format!("drag {source} {destination}")).await;
        self.with_element(source, |_| Ok(()))?;
        self.with_element(destination, |_| Ok(()))
    }

    async fn text(&self, locator: &Locator) -> DriverResult<String> {
        self.begin(format!("text {locator}")).await;
        self.with_element(locator, |element| Ok(element.text.clone()))
    }

    async fn attribute(&self, locator: &Locator, name: &str) -> DriverResult<Option<String>> {
        self.begin(format!("attribute {locator} {name}")).await;
        self.with_element(locator, |element| Ok(element.attributes.get(name).cloned()))
    }

    async fn wait_for_element(&self, locator: &Locator, timeout: Duration) -> DriverResult<()> {
        self.begin(format!("wait-for {locator}")).await;
        let visible = self.with_element(locator, |element| Ok(!element.hidden));
        match visible {
            Ok(true) => Ok(()),
            Ok(false) | Err(DriverError::ElementNotFound(_)) => Err(DriverError::Timeout {
                timeout,
                message: format!("waiting for {locator}"),
            }),
            Err(e) => Err(e),
        }
    }

    async fn wait_for_navigation(&self, timeout: Duration) -> DriverResult<()> {
        self.begin("wait-for-navigation".to_string()).await;
        if self.lenient || self.page.lock().navigations > 0 {
            Ok(())
        } else {
            Err(DriverError::Timeout {
                timeout,
                message: "waiting for navigation".to_string(),
            })
        }
    }

    async fn evaluate(&self, script: &str) -> DriverResult<serde_json::Value> {
        self.begin(format!("evaluate {script}")).await;
        Ok(serde_json::Value::Null)
    }

    async fn screenshot(&self, label: &str) -> DriverResult<String> {
        self.begin(format!("screenshot {label}")).await;
        let mut page = self.page.lock();
        page.screenshots += 1;
        Ok(format!(
            "memory://{}/{}-{}.png",
            self.id, page.screenshots, label
        ))
    }

    async fn close(&self) -> DriverResult<()> {
        if self.closed.fetch_add(1, Ordering::SeqCst) == 0 {
            self.shared.open_sessions.fetch_sub(1, Ordering::SeqCst);
            self.shared.journal.lock().push(format!("close {}", self.id));
        }
        Ok(())
    }
}
