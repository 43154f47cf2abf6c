//! References between resources.
//!
//! A property value of the exact shape `{ "ref": "<id>.<attribute>" }` points
//! at an output attribute of another resource. References may appear at any
//! depth inside arrays and objects.
//!
//! In placeholder form a reference becomes the string `${ref:<id>.<attribute>}`
//! and literal strings starting with `$` get one more `$` in front, so a
//! literal can never read as a reference.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Key marking a reference object.
pub const REF_KEY: &str = "ref";

/// Pointer to an output attribute of another resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// Id of the referenced resource.
    pub node: String,
    /// Output attribute name.
    pub attribute: String,
}

impl Reference {
    /// Creates a reference.
    #[must_use]
    pub fn new(node: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            attribute: attribute.into(),
        }
    }

    /// Parses `"<id>.<attribute>"`. The id ends at the first dot.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if either half is empty.
    pub fn parse(text: &str) -> Result<Self, String> {
        match text.split_once('.') {
            Some((node, attribute)) if !node.is_empty() && !attribute.is_empty() => {
                Ok(Self::new(node, attribute))
            }
            _ => Err(format!(
                "reference '{text}' must have the form <resource>.<attribute>"
            )),
        }
    }

    /// Returns the token that stands in for this reference before its value is known.
    #[must_use]
    pub fn placeholder(&self) -> String {
        format!("${{ref:{self}}}")
    }

    /// Builds the property value that encodes this reference.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(REF_KEY.to_string(), Value::String(self.to_string()));
        Value::Object(map)
    }

    /// Recognises a reference object. Returns `None` for any other value.
    fn recognise(value: &Value) -> Option<Result<Self, String>> {
        let Value::Object(map) = value else {
            return None;
        };
        if map.len() != 1 {
            return None;
        }
        match map.get(REF_KEY)? {
            Value::String(text) => Some(Self::parse(text)),
            other => Some(Err(format!("reference target must be a string, found {other}"))),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.attribute)
    }
}

/// Collects every reference found in `value`, in document order.
///
/// # Errors
///
/// Returns a description of the first malformed reference.
pub fn collect_references(value: &Value, out: &mut Vec<Reference>) -> Result<(), String> {
    if let Some(reference) = Reference::recognise(value) {
        out.push(reference?);
        return Ok(());
    }
    match value {
        Value::Array(items) => {
            for item in items {
                collect_references(item, out)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_references(item, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Returns a copy of `value` with every reference replaced by its placeholder token.
///
/// Literal strings starting with `$` are escaped with a second `$`.
#[must_use]
pub fn with_placeholders(value: &Value) -> Value {
    if let Some(Ok(reference)) = Reference::recognise(value) {
        return Value::String(reference.placeholder());
    }
    match value {
        Value::String(text) if text.starts_with('$') => Value::String(format!("${text}")),
        Value::Array(items) => Value::Array(items.iter().map(with_placeholders).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), with_placeholders(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Returns a copy of `value` with every reference replaced by the value `lookup` yields.
///
/// # Errors
///
/// Returns the first reference `lookup` could not resolve.
pub fn resolve<F>(value: &Value, lookup: &F) -> Result<Value, Reference>
where
    F: Fn(&Reference) -> Option<Value>,
{
    if let Some(Ok(reference)) = Reference::recognise(value) {
        return lookup(&reference).ok_or(reference);
    }
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| resolve(item, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| resolve(v, lookup).map(|resolved| (k.clone(), resolved)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}
