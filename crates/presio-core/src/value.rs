//! The dynamic value type flowing through the placeholder registry and
//! the expression language.
//!
//! A [`Value`] is a closed tagged variant; conversions to and from native
//! types are total, and every variant carries a stable type tag used by
//! registry queries.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::registry::ValueMap;

/// A zero-argument producer of a [`Value`].
///
/// Registry entries hold producers rather than values so reads always see
/// the current state of whatever the producer closes over.
pub type Producer = Arc<dyn Fn() -> Value + Send + Sync>;

/// A native function callable from expressions.
pub type NativeFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// A dynamically-typed value.
#[derive(Clone)]
pub enum Value {
    /// Absence of a value; the degraded result of every failure path.
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// A nested namespace of named producers.
    Map(Arc<ValueMap>),
    /// A callable extension function.
    Function(NativeFn),
    /// An opaque host object handle.
    Object(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// Wrap a producer around a fixed value.
    #[must_use]
    pub fn into_producer(self) -> Producer {
        Arc::new(move || self.clone())
    }

    /// The stable type tag used by `type:<tag>` registry queries.
    #[must_use]
    pub fn type_tag(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Map(_) => "map",
            Value::Function(_) => "function",
            Value::Object(_) => "object",
        }
    }

    /// Whether this value matches a query type tag.
    ///
    /// `any` and `all` match everything; `empty` is an alias for `null`.
    #[must_use]
    pub fn matches_tag(&self, tag: &str) -> bool {
        match tag {
            "any" | "all" => true,
            "empty" => matches!(self, Value::Null),
            other => self.type_tag() == other,
        }
    }

    /// Truthiness: `Null` and `false` are falsy, everything else truthy.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }

    /// Numeric view, when one exists.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(f64::from(*b)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// String view without allocation, when one exists.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{n}")
                }
            }
            Value::String(s) => write!(f, "{s}"),
            Value::Map(m) => write!(f, "<map[{}]>", m.len()),
            Value::Function(_) => write!(f, "<function>"),
            Value::Object(_) => write!(f, "<object>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Map(m) => write!(f, "Map[{}]", m.len()),
            Value::Function(_) => write!(f, "Function"),
            Value::Object(_) => write!(f, "Object"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tags() {
        assert_eq!(Value::Null.type_tag(), "null");
        assert_eq!(Value::Bool(true).type_tag(), "bool");
        assert_eq!(Value::Number(1.0).type_tag(), "number");
        assert_eq!(Value::from("x").type_tag(), "string");
    }

    #[test]
    fn test_matches_tag_aliases() {
        assert!(Value::Null.matches_tag("empty"));
        assert!(Value::Null.matches_tag("null"));
        assert!(Value::from("x").matches_tag("any"));
        assert!(Value::Bool(false).matches_tag("all"));
        assert!(!Value::from("x").matches_tag("number"));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Number(0.0).is_truthy());
        assert!(Value::from("").is_truthy());
    }

    #[test]
    fn test_display_numbers() {
        assert_eq!(Value::Number(5.0).to_string(), "5");
        assert_eq!(Value::Number(2.5).to_string(), "2.5");
        assert_eq!(Value::Null.to_string(), "");
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(Value::from(" 42 ").as_number(), Some(42.0));
        assert_eq!(Value::Bool(true).as_number(), Some(1.0));
        assert_eq!(Value::from("abc").as_number(), None);
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(3_i64)), Value::Number(3.0));
    }
}
