use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IndexError;

/// Exact-match constraint on one payload field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCondition {
    pub key: String,
    pub value: Value,
}

/// Conjunction of exact-match constraints. An empty filter matches every point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub must: Vec<FieldCondition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(session_id: impl Into<String>) -> Self {
        Self::new().with("session_id", Value::String(session_id.into()))
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.must.push(FieldCondition {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }

    /// Reject keys that could not be addressed as a plain payload field.
    pub fn validate(&self) -> Result<(), IndexError> {
        for condition in &self.must {
            validate_field_name(&condition.key)?;
            if condition.value.is_array() || condition.value.is_object() {
                return Err(IndexError::InvalidField(format!(
                    "{} (only scalar values can be matched)",
                    condition.key
                )));
            }
        }
        Ok(())
    }

    /// Evaluate against a payload object. A missing field only matches `null`.
    pub fn matches(&self, payload: &Value) -> bool {
        self.must.iter().all(|condition| {
            let actual = payload.get(&condition.key).unwrap_or(&Value::Null);
            scalar_eq(actual, &condition.value)
        })
    }
}

fn scalar_eq(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a.as_f64() == b.as_f64(),
        },
        _ => actual == expected,
    }
}

/// Payload field names are plain identifiers: ASCII letters, digits and underscores.
pub fn validate_field_name(field: &str) -> Result<(), IndexError> {
    let valid = !field.is_empty()
        && !field.starts_with(|c: char| c.is_ascii_digit())
        && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(IndexError::InvalidField(field.to_string()))
    }
}
