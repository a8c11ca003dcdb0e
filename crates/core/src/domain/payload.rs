use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Stage-scoped data and history metadata are bags of these values rather
/// than raw JSON, so consumers can match on a closed set of shapes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
    List(Vec<PayloadValue>),
    Map(BTreeMap<String, PayloadValue>),
}

pub type Payload = BTreeMap<String, PayloadValue>;

impl PayloadValue {
    /// Whether the value counts as supplied for a required field.
    pub fn is_present(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Text(text) => !text.trim().is_empty(),
            Self::List(items) => !items.is_empty(),
            Self::Map(entries) => !entries.is_empty(),
            Self::Bool(_) | Self::Integer(_) | Self::Number(_) => true,
        }
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for PayloadValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for PayloadValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for PayloadValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<Payload> for PayloadValue {
    fn from(value: Payload) -> Self {
        Self::Map(value)
    }
}

impl From<serde_json::Value> for PayloadValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(flag),
            Value::Number(number) => match number.as_i64() {
                Some(integer) => Self::Integer(integer),
                None => number.as_f64().map(Self::Number).unwrap_or(Self::Null),
            },
            Value::String(text) => Self::Text(text),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(entries) => {
                Self::Map(entries.into_iter().map(|(key, value)| (key, Self::from(value))).collect())
            }
        }
    }
}

/// Builds a payload from `(key, value)` pairs.
pub fn payload<K, V, I>(entries: I) -> Payload
where
    K: Into<String>,
    V: Into<PayloadValue>,
    I: IntoIterator<Item = (K, V)>,
{
    entries.into_iter().map(|(key, value)| (key.into(), value.into())).collect()
}
