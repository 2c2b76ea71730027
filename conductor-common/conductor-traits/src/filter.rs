//! Equality / membership filters over top-level record fields.
//!
//! The kernel never issues anything richer than this, so a plain key-value
//! store can satisfy `list` by decoding records and calling [`Filter::matches`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// `record[field] == value` (a missing field compares as `null`).
    Eq { field: String, value: Value },
    /// `record[field]` equals one of `values`.
    In { field: String, values: Vec<Value> },
}

impl Condition {
    pub fn matches(&self, record: &Value) -> bool {
        match self {
            Condition::Eq { field, value } => field_of(record, field) == value,
            Condition::In { field, values } => values.contains(field_of(record, field)),
        }
    }
}

fn field_of<'a>(record: &'a Value, field: &str) -> &'a Value {
    record.get(field).unwrap_or(&Value::Null)
}

/// Conjunction of conditions. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn one_of<I, V>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.conditions.push(Condition::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn matches(&self, record: &Value) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }
}
