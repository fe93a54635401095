//! `{{ placeholder }}` rendering against the context map
//!
//! A placeholder names a top-level context key, optionally followed by a
//! dotted path into objects or arrays (`{{ step_ai1.text }}`,
//! `{{ items.0 }}`). Strings render raw, other values as compact JSON.
//! Placeholders that do not resolve are left untouched.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::domain::ContextMap;

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}")
            .expect("placeholder pattern is valid")
    })
}

/// Substitute every resolvable placeholder in `template`
pub fn render(template: &str, data: &ContextMap) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures<'_>| {
            match lookup(data, &caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn lookup<'a>(data: &'a ContextMap, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = data.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
