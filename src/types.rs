//! Key column types and values.
//!
//! An index is declared over a fixed list of [`KeyType`] columns; every key
//! tuple handed to `put`/`get`/`remove` must match that list column by
//! column. `Null` is a value, not a type: any column may hold it, and it
//! sorts before every non-null value of the column's type.

use eyre::{bail, Result};

/// Declared type of one index key column. The `u8` values are the on-disk
/// tags stored in the root-page key-type list.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Int = 0x01,
    Float = 0x02,
    Text = 0x03,
    Bytes = 0x04,
}

impl KeyType {
    pub fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0x01 => KeyType::Int,
            0x02 => KeyType::Float,
            0x03 => KeyType::Text,
            0x04 => KeyType::Bytes,
            _ => bail!("unknown key type tag: {:#04x}", b),
        })
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One key column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Whether this value can be stored in a column of the given type.
    pub fn matches(&self, key_type: KeyType) -> bool {
        match (self, key_type) {
            (Value::Null, _) => true,
            (Value::Int(_), KeyType::Int) => true,
            (Value::Float(_), KeyType::Float) => true,
            (Value::Text(_), KeyType::Text) => true,
            (Value::Bytes(_), KeyType::Bytes) => true,
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}
