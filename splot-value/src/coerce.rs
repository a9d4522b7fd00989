//! Coercion between value families.
//!
//! The rules here are the single source of truth for every property
//! read/write and for the RPN engine. Conversions that can lose real
//! precision say so on the method.
use crate::{Kind, Value, ValueMap};
use arcstr::ArcStr;
use indexmap::IndexMap;
use std::{sync::Arc, time::Duration};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CastError {
    #[error("cannot represent {from} as {to}")]
    Incompatible { from: Kind, to: &'static str },
    #[error("value out of range for {0}")]
    OutOfRange(&'static str),
}

impl CastError {
    fn new(from: Kind, to: &'static str) -> Self {
        CastError::Incompatible { from, to }
    }
}

impl Value {
    /// Boolean coercion: identity from bool, nonzero from the numeric
    /// families, and case insensitive "true"/"false" from text.
    pub fn cast_bool(&self) -> Result<bool, CastError> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::I64(i) => Ok(*i != 0),
            Value::F64(f) => Ok(*f != 0.),
            Value::String(s) => {
                if s.eq_ignore_ascii_case("true") {
                    Ok(true)
                } else if s.eq_ignore_ascii_case("false") {
                    Ok(false)
                } else {
                    Err(CastError::new(Kind::String, "bool"))
                }
            }
            v => Err(CastError::new(v.kind(), "bool")),
        }
    }

    /// Integer coercion: reals round toward zero and fail outside the
    /// i64 range, bools map to 0/1.
    pub fn cast_i64(&self) -> Result<i64, CastError> {
        match self {
            Value::I64(i) => Ok(*i),
            Value::F64(f) => {
                let t = f.trunc();
                if t.is_finite() && t >= i64::MIN as f64 && t <= i64::MAX as f64 {
                    Ok(t as i64)
                } else {
                    Err(CastError::OutOfRange("int"))
                }
            }
            Value::Bool(b) => Ok(*b as i64),
            v => Err(CastError::new(v.kind(), "int")),
        }
    }

    /// Real coercion: from numbers and numeric strings, bools map to
    /// 0.0/1.0. Integers above 2^53 lose their low bits.
    pub fn cast_f64(&self) -> Result<f64, CastError> {
        match self {
            Value::F64(f) => Ok(*f),
            Value::I64(i) => Ok(*i as f64),
            Value::Bool(b) => Ok(if *b { 1. } else { 0. }),
            Value::String(s) => {
                s.trim().parse::<f64>().map_err(|_| CastError::new(Kind::String, "real"))
            }
            v => Err(CastError::new(v.kind(), "real")),
        }
    }

    /// A real clamped into [0, 1].
    pub fn cast_percent(&self) -> Result<f64, CastError> {
        Ok(self.cast_f64()?.clamp(0., 1.))
    }

    pub fn cast_str(&self) -> Result<ArcStr, CastError> {
        match self {
            Value::String(s) | Value::Uri(s) => Ok(s.clone()),
            v => Err(CastError::new(v.kind(), "string")),
        }
    }

    /// URI references coerce from text that parses as a path
    /// reference: non empty, no whitespace.
    pub fn cast_uri(&self) -> Result<ArcStr, CastError> {
        match self {
            Value::Uri(u) => Ok(u.clone()),
            Value::String(s) => {
                if !s.is_empty() && !s.chars().any(|c| c.is_whitespace()) {
                    Ok(s.clone())
                } else {
                    Err(CastError::new(Kind::String, "uri"))
                }
            }
            v => Err(CastError::new(v.kind(), "uri")),
        }
    }

    pub fn cast_array(&self) -> Result<Arc<[Value]>, CastError> {
        match self {
            Value::Array(a) => Ok(a.clone()),
            v => Err(CastError::new(v.kind(), "array")),
        }
    }

    pub fn cast_map(&self) -> Result<ValueMap, CastError> {
        match self {
            Value::Map(m) => Ok(m.clone()),
            v => Err(CastError::new(v.kind(), "map")),
        }
    }

    /// Coerce into the given family. Null passes through unchanged,
    /// arrays coerce element wise, maps coerce shallowly preserving
    /// keys.
    pub fn coerce_kind(&self, kind: Kind) -> Result<Value, CastError> {
        if self.is_null() {
            return Ok(Value::Null);
        }
        match kind {
            Kind::Null => Ok(Value::Null),
            Kind::Bool => Ok(Value::Bool(self.cast_bool()?)),
            Kind::Int => Ok(Value::I64(self.cast_i64()?)),
            Kind::Real => Ok(Value::F64(self.cast_f64()?)),
            Kind::String => Ok(Value::String(self.cast_str()?)),
            Kind::Uri => Ok(Value::Uri(self.cast_uri()?)),
            Kind::Bytes => match self {
                Value::Bytes(b) => Ok(Value::Bytes(b.clone())),
                v => Err(CastError::new(v.kind(), "bytes")),
            },
            Kind::Array => {
                let a = self.cast_array()?;
                Ok(Value::Array(a))
            }
            Kind::Map => Ok(Value::Map(self.cast_map()?)),
        }
    }

    pub fn cast_to<T: FromValue>(&self) -> Result<T, CastError> {
        T::from_value(self)
    }
}

/// Structured extraction from a [`Value`].
pub trait FromValue: Sized {
    fn from_value(v: &Value) -> Result<Self, CastError>;
}

impl FromValue for Value {
    fn from_value(v: &Value) -> Result<Self, CastError> {
        Ok(v.clone())
    }
}

impl FromValue for bool {
    fn from_value(v: &Value) -> Result<Self, CastError> {
        v.cast_bool()
    }
}

impl FromValue for i64 {
    fn from_value(v: &Value) -> Result<Self, CastError> {
        v.cast_i64()
    }
}

impl FromValue for u32 {
    fn from_value(v: &Value) -> Result<Self, CastError> {
        let i = v.cast_i64()?;
        u32::try_from(i).map_err(|_| CastError::OutOfRange("u32"))
    }
}

impl FromValue for f64 {
    fn from_value(v: &Value) -> Result<Self, CastError> {
        v.cast_f64()
    }
}

impl FromValue for ArcStr {
    fn from_value(v: &Value) -> Result<Self, CastError> {
        v.cast_str()
    }
}

impl FromValue for String {
    fn from_value(v: &Value) -> Result<Self, CastError> {
        Ok(v.cast_str()?.to_string())
    }
}

impl FromValue for Duration {
    fn from_value(v: &Value) -> Result<Self, CastError> {
        let secs = v.cast_f64()?;
        Duration::try_from_secs_f64(secs).map_err(|_| CastError::OutOfRange("duration"))
    }
}

impl FromValue for Vec<Value> {
    fn from_value(v: &Value) -> Result<Self, CastError> {
        Ok(v.cast_array()?.to_vec())
    }
}

impl FromValue for Vec<f64> {
    fn from_value(v: &Value) -> Result<Self, CastError> {
        v.cast_array()?.iter().map(|e| e.cast_f64()).collect()
    }
}

impl FromValue for IndexMap<ArcStr, Value> {
    fn from_value(v: &Value) -> Result<Self, CastError> {
        Ok(v.cast_map()?.as_ref().clone())
    }
}

/// `coerce_or_null`: Null becomes None, anything else coerces.
impl<T: FromValue> FromValue for Option<T> {
    fn from_value(v: &Value) -> Result<Self, CastError> {
        match v {
            Value::Null => Ok(None),
            v => Ok(Some(T::from_value(v)?)),
        }
    }
}
