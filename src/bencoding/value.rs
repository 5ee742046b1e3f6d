use std::collections::BTreeMap;

use anyhow::{Error, Result, anyhow};

#[derive(Debug, PartialEq, Clone)]
pub enum Value {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<Value>),
    Dictionary(BTreeMap<String, Value>),
}

impl Value {
    pub fn string(string: impl AsRef<[u8]>) -> Self {
        Self::String(string.as_ref().to_vec())
    }

    pub fn list() -> Self {
        Self::List(Vec::new())
    }

    pub fn dictionary() -> Self {
        Self::Dictionary(BTreeMap::new())
    }

    /// Appends a value when `self` is a list, otherwise leaves it untouched.
    pub fn with_value(mut self, value: Value) -> Self {
        if let Self::List(values) = &mut self {
            values.push(value);
        }
        self
    }

    /// Inserts an entry when `self` is a dictionary, otherwise leaves it untouched.
    pub fn with_entry(mut self, key: &str, value: Value) -> Self {
        if let Self::Dictionary(entries) = &mut self {
            entries.insert(key.to_string(), value);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Dictionary(entries) => entries.get(key),
            _ => None,
        }
    }

    pub fn remove_entry(&mut self, key: &str) -> Result<Value> {
        self.try_remove_entry(key)
            .ok_or_else(|| anyhow!("missing entry '{}'", key))
    }

    pub fn try_remove_entry(&mut self, key: &str) -> Option<Value> {
        match self {
            Self::Dictionary(entries) => entries.remove(key),
            _ => None,
        }
    }
}

impl TryFrom<Value> for Vec<u8> {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::String(bytes) => Ok(bytes),
            value => Err(anyhow!("expected string, got {:?}", value)),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let bytes: Vec<u8> = value.try_into()?;
        Ok(String::from_utf8(bytes)?)
    }
}

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Integer(integer) => Ok(integer),
            value => Err(anyhow!("expected integer, got {:?}", value)),
        }
    }
}

impl TryFrom<Value> for u64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let integer: i64 = value.try_into()?;
        Ok(u64::try_from(integer)?)
    }
}

impl TryFrom<Value> for Vec<Value> {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::List(values) => Ok(values),
            value => Err(anyhow!("expected list, got {:?}", value)),
        }
    }
}
