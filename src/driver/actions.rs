//! Action dispatch table.
//!
//! Each [`ActionKind`] maps to an [`ActionHandler`]. The built-in handlers
//! translate a [`ResolvedStep`] into [`BrowserSession`] calls; callers can
//! register handlers for new action names or replace built-in ones without
//! touching the step executor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{BrowserSession, DriverError, DriverResult, Interaction, Locator, ResolvedStep};
use crate::model::{ActionKind, Variables};

const DEFAULT_WAIT_MS: u64 = 1000;

/// Everything a handler may touch while running one step.
pub struct ActionContext<'a> {
    pub session: &'a dyn BrowserSession,
    pub step: &'a ResolvedStep,
    /// Variables of the running test. Writes are visible to later steps.
    pub variables: &'a mut Variables,
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, cx: &mut ActionContext<'_>) -> DriverResult<()>;
}

/// Maps action kinds to their handlers.
#[derive(Clone)]
pub struct ActionRegistry {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// A registry with no handlers.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// A registry with a handler for every built-in action.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(ActionKind::Navigate, Navigate);
        registry.register(ActionKind::Click, Interact(Interaction::Click));
        registry.register(ActionKind::DoubleClick, Interact(Interaction::DoubleClick));
        registry.register(ActionKind::RightClick, Interact(Interaction::RightClick));
        registry.register(ActionKind::Hover, Interact(Interaction::Hover));
        registry.register(ActionKind::Focus, Interact(Interaction::Focus));
        registry.register(ActionKind::ScrollIntoView, Interact(Interaction::ScrollIntoView));
        registry.register(ActionKind::Check, Interact(Interaction::Check));
        registry.register(ActionKind::Uncheck, Interact(Interaction::Uncheck));
        registry.register(ActionKind::Fill, Fill);
        registry.register(ActionKind::Type, TypeText);
        registry.register(ActionKind::Select, Select);
        registry.register(ActionKind::Press, Press);
        registry.register(ActionKind::PressEnter, PressEnter);
        registry.register(ActionKind::DragAndDrop, DragAndDrop);
        registry.register(ActionKind::Wait, Wait);
        registry.register(ActionKind::WaitForElement, WaitForElement);
        registry.register(ActionKind::WaitForNavigation, WaitForNavigation);
        registry.register(ActionKind::VerifyText, VerifyText);
        registry.register(ActionKind::Expect, VerifyText);
        registry.register(ActionKind::VerifyUrl, VerifyUrl);
        registry.register(ActionKind::Screenshot, Screenshot);
        registry.register(ActionKind::Evaluate, Evaluate);
        registry.register(ActionKind::SetVariable, SetVariable);
        registry.register(ActionKind::GetText, GetText);
        registry.register(ActionKind::GetAttribute, GetAttribute);
        registry
    }

    /// Registers `handler` for `kind`, replacing any previous handler.
    pub fn register<H: ActionHandler + 'static>(&mut self, kind: ActionKind, handler: H) {
        self.handlers.insert(kind, Arc::new(handler));
    }

    pub fn with_handler<H: ActionHandler + 'static>(mut self, kind: ActionKind, handler: H) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn supports(&self, kind: &ActionKind) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub async fn dispatch(&self, cx: &mut ActionContext<'_>) -> DriverResult<()> {
        let handler = self
            .handlers
            .get(&cx.step.action)
            .cloned()
            .ok_or_else(|| DriverError::Unsupported(cx.step.action.to_string()))?;
        handler.execute(cx).await
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

struct Navigate;

#[async_trait]
impl ActionHandler for Navigate {
    async fn execute(&self, cx: &mut ActionContext<'_>) -> DriverResult<()> {
        cx.session.navigate(cx.step.target()?, cx.step.timeout).await
    }
}

struct Interact(Interaction);

#[async_trait]
impl ActionHandler for Interact {
    async fn execute(&self, cx: &mut ActionContext<'_>) -> DriverResult<()> {
        let locator = cx.step.locator()?;
        cx.session
            .interact(&locator, self.0, cx.step.options.force)
            .await
    }
}

struct Fill;

#[async_trait]
impl ActionHandler for Fill {
    async fn execute(&self, cx: &mut ActionContext<'_>) -> DriverResult<()> {
        let locator = cx.step.locator()?;
        let text = cx.step.value.as_deref().unwrap_or_default();
        cx.session.fill(&locator, text).await
    }
}

struct TypeText;

#[async_trait]
impl ActionHandler for TypeText {
    async fn execute(&self, cx: &mut ActionContext<'_>) -> DriverResult<()> {
        let locator = cx.step.locator()?;
        let text = cx.step.value.as_deref().unwrap_or_default();
        cx.session.type_text(&locator, text).await
    }
}

struct Select;

#[async_trait]
impl ActionHandler for Select {
    async fn execute(&self, cx: &mut ActionContext<'_>) -> DriverResult<()> {
        let locator = cx.step.locator()?;
        cx.session.select(&locator, cx.step.value()?).await
    }
}

/// Optional locator: pressing a key targets the focused element when unset.
fn optional_locator(step: &ResolvedStep) -> Option<Locator> {
    step.target
        .as_deref()
        .map(|target| Locator::new(step.strategy, target))
}

struct Press;

#[async_trait]
impl ActionHandler for Press {
    async fn execute(&self, cx: &mut ActionContext<'_>) -> DriverResult<()> {
        let locator = optional_locator(cx.step);
        cx.session.press(cx.step.value()?, locator.as_ref()).await
    }
}

struct PressEnter;

#[async_trait]
impl ActionHandler for PressEnter {
    async fn execute(&self, cx: &mut ActionContext<'_>) -> DriverResult<()> {
        let locator = optional_locator(cx.step);
        cx.session.press("Enter", locator.as_ref()).await
    }
}

/// `target` is the dragged element, `value` the drop target selector.
struct DragAndDrop;

#[async_trait]
impl ActionHandler for DragAndDrop {
    async fn execute(&self, cx: &mut ActionContext<'_>) -> DriverResult<()> {
        let source = cx.step.locator()?;
        let destination = Locator::new(cx.step.strategy, cx.step.value()?);
        cx.session.drag_and_drop(&source, &destination).await
    }
}

struct Wait;

#[async_trait]
impl ActionHandler for Wait {
    async fn execute(&self, cx: &mut ActionContext<'_>) -> DriverResult<()> {
        tokio::time::sleep(cx.step.value_millis(DEFAULT_WAIT_MS)?).await;
        Ok(())
    }
}

struct WaitForElement;

#[async_trait]
impl ActionHandler for WaitForElement {
    async fn execute(&self, cx: &mut ActionContext<'_>) -> DriverResult<()> {
        let locator = cx.step.locator()?;
        let timeout = cx.step.value_millis(cx.step.timeout.as_millis() as u64)?;
        cx.session.wait_for_element(&locator, timeout).await
    }
}

struct WaitForNavigation;

#[async_trait]
impl ActionHandler for WaitForNavigation {
    async fn execute(&self, cx: &mut ActionContext<'_>) -> DriverResult<()> {
        cx.session.wait_for_navigation(cx.step.timeout).await
    }
}

/// Passes when the element's text contains `value`.
struct VerifyText;

#[async_trait]
impl ActionHandler for VerifyText {
    async fn execute(&self, cx: &mut ActionContext<'_>) -> DriverResult<()> {
        let locator = cx.step.locator()?;
        let expected = cx.step.value()?;
        let actual = cx.session.text(&locator).await?;
        if actual.contains(expected) {
            Ok(())
        } else {
            Err(DriverError::AssertionFailed(format!(
                "expected text '{expected}' in {locator}, found '{actual}'"
            )))
        }
    }
}

/// Passes when the current URL contains the target (or value).
struct VerifyUrl;

#[async_trait]
impl ActionHandler for VerifyUrl {
    async fn execute(&self, cx: &mut ActionContext<'_>) -> DriverResult<()> {
        let expected = match cx.step.target.as_deref() {
            Some(target) => target,
            None => cx.step.value()?,
        };
        let actual = cx.session.current_url().await?;
        if actual.contains(expected) {
            Ok(())
        } else {
            Err(DriverError::AssertionFailed(format!(
                "expected URL containing '{expected}', found '{actual}'"
            )))
        }
    }
}

/// The capture itself is taken by the step executor after the step.
struct Screenshot;

#[async_trait]
impl ActionHandler for Screenshot {
    async fn execute(&self, _cx: &mut ActionContext<'_>) -> DriverResult<()> {
        Ok(())
    }
}

struct Evaluate;

#[async_trait]
impl ActionHandler for Evaluate {
    async fn execute(&self, cx: &mut ActionContext<'_>) -> DriverResult<()> {
        let script = cx.step.value()?;
        let result = cx.session.evaluate(script).await?;
        if let Some(name) = cx.step.target.as_deref() {
            cx.variables.insert(name.to_string(), result);
        }
        Ok(())
    }
}

/// `target` names the variable, `value` is stored as a string.
struct SetVariable;

#[async_trait]
impl ActionHandler for SetVariable {
    async fn execute(&self, cx: &mut ActionContext<'_>) -> DriverResult<()> {
        let name = cx.step.target()?;
        let value = cx.step.value()?;
        cx.variables
            .insert(name.to_string(), Value::String(value.to_string()));
        Ok(())
    }
}

/// Reads the element's text into the variable named by `value`.
struct GetText;

#[async_trait]
impl ActionHandler for GetText {
    async fn execute(&self, cx: &mut ActionContext<'_>) -> DriverResult<()> {
        let locator = cx.step.locator()?;
        let name = cx.step.value()?.to_string();
        let text = cx.session.text(&locator).await?;
        cx.variables.insert(name, Value::String(text));
        Ok(())
    }
}

/// Reads `attribute` into the variable named by `value`; null when absent.
struct GetAttribute;

#[async_trait]
impl ActionHandler for GetAttribute {
    async fn execute(&self, cx: &mut ActionContext<'_>) -> DriverResult<()> {
        let locator = cx.step.locator()?;
        let name = cx.step.value()?.to_string();
        let attribute = cx.step.attribute.as_deref().ok_or_else(|| {
            DriverError::InvalidStep("get-attribute requires an attribute name".to_string())
        })?;
        let value = cx.session.attribute(&locator, attribute).await?;
        cx.variables
            .insert(name, value.map(Value::String).unwrap_or(Value::Null));
        Ok(())
    }
}
