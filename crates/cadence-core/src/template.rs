//! `${{ path }}` template rendering over JSON values.

use crate::{Error, Result};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("placeholder pattern"));

/// Whether a string contains at least one placeholder.
pub fn has_template(input: &str) -> bool {
    PLACEHOLDER.is_match(input)
}

/// Resolve a dotted path (`jobs.build.outputs.0`) inside a JSON value.
pub fn lookup<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(scope, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Render every placeholder found in `value` against `scope`.
///
/// A string consisting of exactly one placeholder is replaced by the
/// referenced value with its JSON type intact. Placeholders embedded in a
/// longer string are substituted with their string form. Unknown paths are
/// configuration errors.
pub fn render(value: &Value, scope: &Value) -> Result<Value> {
    match value {
        Value::String(s) => render_str(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| render(item, scope))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                rendered.insert(key.clone(), render(item, scope)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

fn render_str(input: &str, scope: &Value) -> Result<Value> {
    if let Some(caps) = PLACEHOLDER.captures(input)
        && caps.get(0).map(|m| m.as_str().len()) == Some(input.len())
    {
        let path = caps.get(1).map_or("", |m| m.as_str());
        return resolve(scope, path).cloned();
    }

    let mut output = String::with_capacity(input.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(input) {
        let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        output.push_str(&input[last..whole.start()]);
        match resolve(scope, path.as_str())? {
            Value::String(s) => output.push_str(s),
            other => output.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    output.push_str(&input[last..]);
    Ok(Value::String(output))
}

fn resolve<'a>(scope: &'a Value, path: &str) -> Result<&'a Value> {
    lookup(scope, path.trim())
        .ok_or_else(|| Error::Configuration(format!("template path {:?} does not exist", path)))
}

/// Truthiness used by stage conditions.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !matches!(s.trim().to_lowercase().as_str(), "" | "false" | "0" | "no"),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
