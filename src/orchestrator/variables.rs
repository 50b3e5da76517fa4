//! `${name}` placeholder substitution.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::driver::ResolvedStep;
use crate::model::{Step, StepOptions, Variables};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("placeholder pattern is valid"));

/// Replaces `${name}` with the matching variable, then metadata entry.
/// Unknown names are left as written.
pub fn substitute<'a>(input: &'a str, variables: &Variables, metadata: &Variables) -> Cow<'a, str> {
    PLACEHOLDER.replace_all(input, |caps: &Captures<'_>| {
        let name = caps[1].trim();
        match variables.get(name).or_else(|| metadata.get(name)) {
            Some(value) => render(value),
            None => caps[0].to_string(),
        }
    })
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitutes placeholders in the step's target and value.
pub fn resolve_step(
    index: usize,
    step: &Step,
    options: StepOptions,
    variables: &Variables,
    metadata: &Variables,
) -> ResolvedStep {
    let resolve = |field: &Option<String>| {
        field
            .as_deref()
            .map(|raw| substitute(raw, variables, metadata).into_owned())
    };
    ResolvedStep {
        index,
        action: step.action.clone(),
        target: resolve(&step.target),
        strategy: step.strategy,
        value: resolve(&step.value),
        attribute: step.attribute.clone(),
        timeout: step.timeout(),
        options,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_variables_shadow_metadata() {
        let variables = vars(&[("user", json!("alice"))]);
        let metadata = vars(&[("user", json!("bob")), ("env", json!("staging"))]);

        assert_eq!(
            substitute("${user}@${env}", &variables, &metadata),
            "alice@staging"
        );
    }

    #[test]
    fn test_unresolved_placeholder_kept() {
        let empty = Variables::new();
        assert_eq!(substitute("hello ${who}", &empty, &empty), "hello ${who}");
        assert!(matches!(
            substitute("no placeholders", &empty, &empty),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn test_non_string_values_render_as_json() {
        let variables = vars(&[("count", json!(3)), ("ok", json!(true))]);
        assert_eq!(
            substitute("${count} items, ok=${ok}", &variables, &Variables::new()),
            "3 items, ok=true"
        );
    }

    #[test]
    fn test_resolve_step_fields() {
        let step = Step::fill("#${field}", "${value}").with_attribute("${raw}");
        let variables = vars(&[("field", json!("email")), ("value", json!("a@b.c"))]);

        let resolved = resolve_step(2, &step, StepOptions::default(), &variables, &Variables::new());
        assert_eq!(resolved.index, 2);
        assert_eq!(resolved.target.as_deref(), Some("#email"));
        assert_eq!(resolved.value.as_deref(), Some("a@b.c"));
        assert_eq!(resolved.attribute.as_deref(), Some("${raw}"));
    }
}
