//! Cell values

use crate::error::{MonoError, MonoResult};
use crate::table::info::DataType;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A single cell value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Binary(Vec<u8>),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

/// One row, one value per column in definition order
pub type Row = Vec<Value>;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Boolean(_) => "BOOLEAN",
            Value::Integer(_) => "INTEGER",
            Value::Float(_) => "FLOAT",
            Value::Text(_) => "TEXT",
            Value::Binary(_) => "BINARY",
            Value::Date(_) => "DATE",
            Value::Timestamp(_) => "TIMESTAMP",
        }
    }

    /// Convert the value to the representation stored for `data_type`
    pub fn coerce(self, data_type: &DataType) -> MonoResult<Value> {
        let mismatch = |v: &Value| {
            MonoError::InvalidInput(format!(
                "Cannot store {} in a {:?} column",
                v.type_name(),
                data_type
            ))
        };

        match (data_type, self) {
            (_, Value::Null) => Ok(Value::Null),
            (DataType::Boolean, v @ Value::Boolean(_)) => Ok(v),
            (DataType::SmallInt, Value::Integer(i)) => {
                if i16::try_from(i).is_err() {
                    return Err(MonoError::InvalidInput(format!(
                        "{} is out of range for SMALLINT",
                        i
                    )));
                }
                Ok(Value::Integer(i))
            }
            (DataType::Integer, Value::Integer(i)) => {
                if i32::try_from(i).is_err() {
                    return Err(MonoError::InvalidInput(format!(
                        "{} is out of range for INTEGER",
                        i
                    )));
                }
                Ok(Value::Integer(i))
            }
            (DataType::BigInt, v @ Value::Integer(_)) => Ok(v),
            (DataType::Double, v @ Value::Float(_)) => Ok(v),
            (DataType::Double, Value::Integer(i)) => Ok(Value::Float(i as f64)),
            (DataType::Varchar(max), Value::Text(s)) => {
                if s.chars().count() > *max as usize {
                    return Err(MonoError::InvalidInput(format!(
                        "Text of {} characters exceeds VARCHAR({})",
                        s.chars().count(),
                        max
                    )));
                }
                Ok(Value::Text(s))
            }
            (DataType::Text, v @ Value::Text(_)) => Ok(v),
            (DataType::Varbinary(max), Value::Binary(b)) => {
                if b.len() > *max as usize {
                    return Err(MonoError::InvalidInput(format!(
                        "Binary of {} bytes exceeds VARBINARY({})",
                        b.len(),
                        max
                    )));
                }
                Ok(Value::Binary(b))
            }
            (DataType::Blob, v @ Value::Binary(_)) => Ok(v),
            (DataType::Date, v @ Value::Date(_)) => Ok(v),
            (DataType::Timestamp, v @ Value::Timestamp(_)) => Ok(v),
            (DataType::Timestamp, Value::Date(d)) => Ok(Value::Timestamp(d.and_time(
                chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap_or_default(),
            ))),
            (_, other) => Err(mismatch(&other)),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) | Value::Float(_) => 2,
            Value::Text(_) => 3,
            Value::Binary(_) => 4,
            Value::Date(_) => 5,
            Value::Timestamp(_) => 6,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Total order used by indexes: NULL sorts first, numbers compare across
/// integer and float, floats use IEEE total ordering.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Binary(a), Value::Binary(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Value::Date(d) => write!(f, "{}", d),
            Value::Timestamp(t) => write!(f, "{}", t),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
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

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
