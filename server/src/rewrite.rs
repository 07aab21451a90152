//! Deep string substitution over JSON values.
//!
//! Metadata served by a device mentions the device-internal `host:port` in
//! debugger URLs, front-end links and query tokens. A proxied session keeps a
//! list of [`RewriteRule`]s that swap those for the public address, and
//! [`rewrite`] applies them to every string leaf and every object key of a
//! response.

use regex::{NoExpand, Regex};
use serde_json::{Map, Value};

/// What a rule looks for.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Every occurrence of the string is replaced.
    Literal(String),
    /// Only the first match is replaced.
    Pattern(Regex),
}

/// An ordered `(matcher, replacement)` pair. The replacement is inserted
/// verbatim; `$` has no special meaning.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pub matcher: Matcher,
    pub replacement: String,
}

impl RewriteRule {
    pub fn literal(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            matcher: Matcher::Literal(from.into()),
            replacement: to.into(),
        }
    }

    pub fn pattern(regex: Regex, to: impl Into<String>) -> Self {
        Self {
            matcher: Matcher::Pattern(regex),
            replacement: to.into(),
        }
    }

    fn apply(&self, input: &str) -> String {
        match &self.matcher {
            Matcher::Literal(from) if from.is_empty() => input.to_string(),
            Matcher::Literal(from) => input.replace(from.as_str(), &self.replacement),
            Matcher::Pattern(regex) => regex
                .replacen(input, 1, NoExpand(&self.replacement))
                .into_owned(),
        }
    }
}

/// Apply `rules` in order to a single string, each over the previous output.
pub fn rewrite_str(input: &str, rules: &[RewriteRule]) -> String {
    rules
        .iter()
        .fold(input.to_string(), |acc, rule| rule.apply(&acc))
}

/// Return a copy of `value` with `rules` applied to every string leaf and
/// object key. Numbers, booleans and null pass through unchanged. If two keys
/// collapse to the same rewritten key, the one visited last wins.
pub fn rewrite(value: &Value, rules: &[RewriteRule]) -> Value {
    if rules.is_empty() {
        return value.clone();
    }
    match value {
        Value::String(s) => Value::String(rewrite_str(s, rules)),
        Value::Array(items) => Value::Array(items.iter().map(|v| rewrite(v, rules)).collect()),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, v) in map {
                out.insert(rewrite_str(key, rules), rewrite(v, rules));
            }
            Value::Object(out)
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
    }
}
