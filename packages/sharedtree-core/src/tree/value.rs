use serde::{Deserialize, Serialize};

/// Primitive value carried by leaf nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    String(String),
    Boolean(bool),
    Null,
}

/// Declared primitive kind of a leaf node's value.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum ValueSchema {
    Number,
    String,
    Boolean,
    Null,
}

impl Value {
    pub fn kind(&self) -> ValueSchema {
        match self {
            Value::Number(_) => ValueSchema::Number,
            Value::String(_) => ValueSchema::String,
            Value::Boolean(_) => ValueSchema::Boolean,
            Value::Null => ValueSchema::Null,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

/// Whether `value` is acceptable for a leaf declared with `schema`.
pub fn allows_value(schema: ValueSchema, value: Option<&Value>) -> bool {
    match value {
        Some(v) => v.kind() == schema,
        None => false,
    }
}
