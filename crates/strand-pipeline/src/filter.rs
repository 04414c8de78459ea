//! Declarative event-filter evaluation.
//!
//! A filter is a mapping `path -> matcher`, recursively nested. Against a
//! JSON document it matches iff every leaf matcher matches:
//!
//! - Object levels compose with logical AND.
//! - A matcher list is disjunctive (any-of).
//! - A list is either all primitives (strict equality) or all
//!   content-matcher objects (`{"$gt": 10}`, `{"$exists": false}`, ...).
//!
//! Parsing rejects malformed filter documents with
//! [`Error::InvalidFilter`]; evaluation itself never fails and returns
//! `false` on type mismatch. A missing path fails unless matched by
//! `{"$exists": false}` or `{"$isNull": true}`.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{Error, Result};

/// A parsed, validated event filter.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFilter {
    root: BTreeMap<String, FilterEntry>,
}

/// One level of the filter tree: either a nested object or a leaf matcher
/// list.
#[derive(Debug, Clone, PartialEq)]
enum FilterEntry {
    Nested(BTreeMap<String, FilterEntry>),
    AnyOf(Vec<Matcher>),
}

/// A leaf matcher.
#[derive(Debug, Clone, PartialEq)]
enum Matcher {
    /// Strict equality against a primitive.
    Literal(Value),
    /// A content-matcher object.
    Content(ContentMatcher),
}

/// Content matchers, `{"$operator": operand}`.
#[derive(Debug, Clone, PartialEq)]
enum ContentMatcher {
    EndsWith(String),
    StartsWith(String),
    IgnoreCaseEquals(String),
    Exists(bool),
    IsNull(bool),
    AnythingBut(Vec<Value>),
    GreaterThan(f64),
    GreaterThanOrEqual(f64),
    LessThan(f64),
    LessThanOrEqual(f64),
    Between(f64, f64),
    Includes(Value),
}

impl EventFilter {
    /// Parses and validates a filter document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFilter`] when the document is not a valid
    /// filter.
    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(Error::invalid_filter("filter root must be an object"));
        };
        Ok(Self {
            root: parse_object(map)?,
        })
    }

    /// Evaluates the filter against a document. Total: returns `false` on
    /// any type mismatch, never fails.
    #[must_use]
    pub fn matches(&self, document: &Value) -> bool {
        matches_level(&self.root, Some(document))
    }
}

fn parse_object(map: &serde_json::Map<String, Value>) -> Result<BTreeMap<String, FilterEntry>> {
    let mut entries = BTreeMap::new();
    for (key, value) in map {
        let entry = match value {
            Value::Object(nested) => FilterEntry::Nested(parse_object(nested)?),
            Value::Array(items) => FilterEntry::AnyOf(parse_matchers(key, items)?),
            other => {
                return Err(Error::invalid_filter(format!(
                    "matcher for '{key}' must be an object or an array, got {other}"
                )));
            }
        };
        entries.insert(key.clone(), entry);
    }
    Ok(entries)
}

fn parse_matchers(key: &str, items: &[Value]) -> Result<Vec<Matcher>> {
    if items.is_empty() {
        return Err(Error::invalid_filter(format!(
            "matcher list for '{key}' must not be empty"
        )));
    }

    let all_primitive = items.iter().all(is_primitive);
    let all_objects = items.iter().all(Value::is_object);

    if all_primitive {
        return Ok(items.iter().cloned().map(Matcher::Literal).collect());
    }
    if all_objects {
        return items
            .iter()
            .map(|item| parse_content_matcher(key, item).map(Matcher::Content))
            .collect();
    }
    Err(Error::invalid_filter(format!(
        "matcher list for '{key}' must be all primitives or all content matchers"
    )))
}

fn is_primitive(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn parse_content_matcher(key: &str, value: &Value) -> Result<ContentMatcher> {
    let Some(map) = value.as_object() else {
        return Err(Error::invalid_filter(format!(
            "content matcher for '{key}' must be an object"
        )));
    };
    if map.len() != 1 {
        return Err(Error::invalid_filter(format!(
            "content matcher for '{key}' must have exactly one operator"
        )));
    }
    let Some((operator, operand)) = map.iter().next() else {
        return Err(Error::invalid_filter(format!(
            "content matcher for '{key}' must have exactly one operator"
        )));
    };

    let string_operand = || {
        operand.as_str().map(str::to_string).ok_or_else(|| {
            Error::invalid_filter(format!("{operator} for '{key}' requires a string operand"))
        })
    };
    let bool_operand = || {
        operand.as_bool().ok_or_else(|| {
            Error::invalid_filter(format!("{operator} for '{key}' requires a boolean operand"))
        })
    };
    let number_operand = || {
        operand.as_f64().ok_or_else(|| {
            Error::invalid_filter(format!("{operator} for '{key}' requires a numeric operand"))
        })
    };

    match operator.as_str() {
        "$endsWith" => Ok(ContentMatcher::EndsWith(string_operand()?)),
        "$startsWith" => Ok(ContentMatcher::StartsWith(string_operand()?)),
        "$ignoreCaseEquals" => Ok(ContentMatcher::IgnoreCaseEquals(string_operand()?)),
        "$exists" => Ok(ContentMatcher::Exists(bool_operand()?)),
        "$isNull" => Ok(ContentMatcher::IsNull(bool_operand()?)),
        "$anythingBut" => {
            let excluded = match operand {
                Value::Array(items) => items.clone(),
                primitive if is_primitive(primitive) => vec![primitive.clone()],
                _ => {
                    return Err(Error::invalid_filter(format!(
                        "$anythingBut for '{key}' requires a primitive or an array"
                    )));
                }
            };
            Ok(ContentMatcher::AnythingBut(excluded))
        }
        "$gt" => Ok(ContentMatcher::GreaterThan(number_operand()?)),
        "$gte" => Ok(ContentMatcher::GreaterThanOrEqual(number_operand()?)),
        "$lt" => Ok(ContentMatcher::LessThan(number_operand()?)),
        "$lte" => Ok(ContentMatcher::LessThanOrEqual(number_operand()?)),
        "$between" => match operand.as_array().map(Vec::as_slice) {
            Some([lo, hi]) => match (lo.as_f64(), hi.as_f64()) {
                (Some(lo), Some(hi)) => Ok(ContentMatcher::Between(lo, hi)),
                _ => Err(Error::invalid_filter(format!(
                    "$between for '{key}' requires numeric bounds"
                ))),
            },
            _ => Err(Error::invalid_filter(format!(
                "$between for '{key}' requires a two-element array"
            ))),
        },
        "$includes" => Ok(ContentMatcher::Includes(operand.clone())),
        other => Err(Error::invalid_filter(format!(
            "unknown operator '{other}' for '{key}'"
        ))),
    }
}

fn matches_level(entries: &BTreeMap<String, FilterEntry>, document: Option<&Value>) -> bool {
    entries.iter().all(|(key, entry)| {
        let value = document
            .and_then(Value::as_object)
            .and_then(|map| map.get(key));
        match entry {
            FilterEntry::Nested(children) => matches_level(children, value),
            FilterEntry::AnyOf(matchers) => matchers.iter().any(|matcher| matcher.matches(value)),
        }
    })
}

impl Matcher {
    fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Self::Literal(expected) => value.is_some_and(|v| json_equal(v, expected)),
            Self::Content(content) => content.matches(value),
        }
    }
}

impl ContentMatcher {
    #[allow(clippy::float_cmp)] // Equality bounds are inclusive by contract.
    fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Self::Exists(expected) => value.is_some() == *expected,
            Self::IsNull(expected) => match value {
                Some(Value::Null) | None => *expected,
                Some(_) => !expected,
            },
            Self::AnythingBut(excluded) => {
                value.is_some_and(|v| !excluded.iter().any(|e| json_equal(v, e)))
            }
            Self::EndsWith(suffix) => {
                value.and_then(Value::as_str).is_some_and(|s| s.ends_with(suffix))
            }
            Self::StartsWith(prefix) => {
                value.and_then(Value::as_str).is_some_and(|s| s.starts_with(prefix))
            }
            Self::IgnoreCaseEquals(expected) => value
                .and_then(Value::as_str)
                .is_some_and(|s| s.to_lowercase() == expected.to_lowercase()),
            Self::GreaterThan(bound) => {
                value.and_then(Value::as_f64).is_some_and(|n| n > *bound)
            }
            Self::GreaterThanOrEqual(bound) => {
                value.and_then(Value::as_f64).is_some_and(|n| n >= *bound)
            }
            Self::LessThan(bound) => value.and_then(Value::as_f64).is_some_and(|n| n < *bound),
            Self::LessThanOrEqual(bound) => {
                value.and_then(Value::as_f64).is_some_and(|n| n <= *bound)
            }
            Self::Between(lo, hi) => value
                .and_then(Value::as_f64)
                .is_some_and(|n| n >= *lo && n <= *hi),
            Self::Includes(needle) => match value {
                Some(Value::Array(items)) => items.iter().any(|item| json_equal(item, needle)),
                Some(Value::String(haystack)) => needle
                    .as_str()
                    .is_some_and(|substring| haystack.contains(substring)),
                _ => false,
            },
        }
    }
}

/// JSON equality with numeric comparison across integer/float encodings.
#[allow(clippy::float_cmp)] // Strict equality is the contract.
fn json_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}
