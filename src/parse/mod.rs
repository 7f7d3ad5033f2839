//! Format-specific readers for the two input formats: line-oriented
//! observing scripts and nested VCI configuration documents.

pub mod script;
pub mod vci;

use crate::parse_frequency_hz;

/// A typed script argument or VCI attribute value. Coercion is by pattern:
/// a token with a recognized frequency-unit suffix becomes a [`Value::Frequency`]
/// in Hz, a bare numeric token a [`Value::Number`], anything else is kept as
/// text.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Number(f64),
    Frequency(f64),
}

impl Value {
    pub fn coerce(raw: &str) -> Value {
        if let Ok(n) = raw.trim().parse::<f64>() {
            return Value::Number(n);
        }
        match parse_frequency_hz(raw) {
            Some(hz) => Value::Frequency(hz),
            None => Value::Str(raw.to_string()),
        }
    }

    /// The value in Hz, treating a unitless number as already being in Hz.
    pub fn as_hz(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Frequency(hz) => Some(*hz),
            Value::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}
