//! The splot value model
//!
//! Every property, method argument, and RPN operand in splot is a
//! [`Value`], a tagged union over the families the object model
//! understands. Coercion between families is centralized here so that
//! property dispatch, persistence, and the RPN engine all agree on
//! what, for example, "the boolean sense of 0.0" is.
use arcstr::ArcStr;
use bytes::Bytes;
use indexmap::IndexMap;
use serde_derive::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

mod coerce;
pub use coerce::{CastError, FromValue};

/// Tolerance used by [`Value::congruent`] for cross family numeric
/// comparison.
pub const CONGRUENT_EPS: f64 = 1e-10;

/// A shared, insertion ordered map value.
pub type ValueMap = Arc<IndexMap<ArcStr, Value>>;

/// The value families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Null,
    Bool,
    Int,
    Real,
    String,
    Bytes,
    Uri,
    Array,
    Map,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Null => "null",
            Kind::Bool => "bool",
            Kind::Int => "int",
            Kind::Real => "real",
            Kind::String => "string",
            Kind::Bytes => "bytes",
            Kind::Uri => "uri",
            Kind::Array => "array",
            Kind::Map => "map",
        };
        write!(f, "{s}")
    }
}

/// A dynamically typed splot value.
///
/// Values are cheap to clone; compound values share their contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(ArcStr),
    Bytes(Bytes),
    Uri(ArcStr),
    Array(Arc<[Value]>),
    Map(ValueMap),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Null => Kind::Null,
            Value::Bool(_) => Kind::Bool,
            Value::I64(_) => Kind::Int,
            Value::F64(_) => Kind::Real,
            Value::String(_) => Kind::String,
            Value::Bytes(_) => Kind::Bytes,
            Value::Uri(_) => Kind::Uri,
            Value::Array(_) => Kind::Array,
            Value::Map(_) => Kind::Map,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for the numeric families (int and real).
    pub fn is_number(&self) -> bool {
        matches!(self, Value::I64(_) | Value::F64(_))
    }

    /// The numeric view of this value, if it has one. Integers are
    /// widened to f64, which is exact up to 2^53 and loses low bits
    /// above that.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::I64(i) => Some(*i as f64),
            Value::F64(f) => Some(*f),
            _ => None,
        }
    }

    /// General equality: numeric values compare across families with
    /// [`CONGRUENT_EPS`] tolerance, all other families compare
    /// structurally within their own family.
    pub fn congruent(&self, other: &Value) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() <= CONGRUENT_EPS,
            (_, _) => match (self, other) {
                (Value::Null, Value::Null) => true,
                (Value::Bool(a), Value::Bool(b)) => a == b,
                (Value::String(a), Value::String(b)) => a == b,
                (Value::Uri(a), Value::Uri(b)) => a == b,
                (Value::Bytes(a), Value::Bytes(b)) => a == b,
                (Value::Array(a), Value::Array(b)) => {
                    a.len() == b.len()
                        && a.iter().zip(b.iter()).all(|(x, y)| x.congruent(y))
                }
                (Value::Map(a), Value::Map(b)) => {
                    a.len() == b.len()
                        && a.iter().all(|(k, v)| {
                            b.get(k).map(|w| v.congruent(w)).unwrap_or(false)
                        })
                }
                (_, _) => false,
            },
        }
    }

    /// Strict structural equality: the families must match exactly.
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.identical(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| {
                        b.get(k).map(|w| v.identical(w)).unwrap_or(false)
                    })
            }
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::I64(i) => write!(f, "{i}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{:?}", s.as_str()),
            Value::Bytes(b) => write!(f, "bytes[{}]", b.len()),
            Value::Uri(u) => write!(f, "<{u}>"),
            Value::Array(a) => {
                write!(f, "[")?;
                for (i, v) in a.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?
                    }
                    write!(f, "{v}")?
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?
                    }
                    write!(f, "{k}: {v}")?
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I64(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::I64(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<ArcStr> for Value {
    fn from(v: ArcStr) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(ArcStr::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(ArcStr::from(v))
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(Arc::from(v))
    }
}

impl From<IndexMap<ArcStr, Value>> for Value {
    fn from(v: IndexMap<ArcStr, Value>) -> Self {
        Value::Map(Arc::new(v))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            None => Value::Null,
            Some(v) => v.into(),
        }
    }
}

impl FromIterator<Value> for Value {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Value::Array(iter.into_iter().collect::<Vec<_>>().into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn congruent_cross_family() {
        assert!(Value::I64(3).congruent(&Value::F64(3.0)));
        // float noise inside the tolerance still compares equal
        assert!(Value::F64(0.1 + 0.2).congruent(&Value::F64(0.3)));
        assert!(Value::F64(0.3001).congruent(&Value::F64(0.3)) == false);
        assert!(Value::I64(1).congruent(&Value::Bool(true)) == false);
        assert!(Value::from("hello").congruent(&Value::from("world")) == false);
        assert!(Value::from("x").congruent(&Value::from("x")));
    }

    #[test]
    fn identical_is_strict() {
        assert!(!Value::I64(3).identical(&Value::F64(3.0)));
        assert!(Value::I64(3).identical(&Value::I64(3)));
        let a: Value = vec![Value::I64(1), Value::Null].into();
        let b: Value = vec![Value::I64(1), Value::Null].into();
        assert!(a.identical(&b));
    }

    #[test]
    fn serde_round_trip() {
        let mut m = IndexMap::new();
        m.insert(ArcStr::from("s/levl/v"), Value::F64(0.5));
        m.insert(ArcStr::from("s/onof/v"), Value::Bool(true));
        let v: Value = m.into();
        let s = serde_json::to_string(&v).unwrap();
        let w: Value = serde_json::from_str(&s).unwrap();
        assert!(v.identical(&w));
    }
}
