// propsd: String templates
// Interpolates {{ dotted.path }} references against a property tree

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{TemplateError, TemplateResult};
use crate::properties;

// {{ WS ident ( "." ident )* WS }} where ident is [A-Za-z0-9_-]+
static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"\{\{\s*([A-Za-z0-9_-]+(?:\.[A-Za-z0-9_-]+)*)\s*\}\}")
        .expect("placeholder pattern is valid")
});

/// Substitute every `{{ path }}` occurrence in `input` with the string form
/// of the value at that dotted path in `tree`.
///
/// A path that does not resolve fails the whole render with
/// [`TemplateError::Unresolved`]; the caller treats that as a transient
/// condition and retries on the next upstream update.
pub fn render(input: &str, tree: &Value) -> TemplateResult<String> {
    let mut output = String::with_capacity(input.len());
    let mut last = 0;
    for captures in PLACEHOLDER.captures_iter(input) {
        let Some(matched) = captures.get(0) else {
            continue;
        };
        let path = &captures[1];
        let value = properties::get_path(tree, path)
            .ok_or_else(|| TemplateError::Unresolved(path.to_string()))?;
        output.push_str(&input[last..matched.start()]);
        output.push_str(&string_form(value));
        last = matched.end();
    }
    output.push_str(&input[last..]);
    Ok(output)
}

/// Coerce a parameter value: strings are rendered, everything else passes
/// through untouched. Sequences are not walked.
pub fn coerce(value: &Value, tree: &Value) -> TemplateResult<Value> {
    match value {
        Value::String(input) => Ok(Value::String(render(input, tree)?)),
        other => Ok(other.clone()),
    }
}

fn string_form(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
