// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! In-memory FITS headers.

use std::fmt::Display;

use indexmap::IndexMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub(crate) enum HeaderError {
    #[error("Header key {key} is missing")]
    Missing { key: String },

    #[error("Header key {key} has value '{value}', which is not {expected}")]
    Type {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("Header key {key} has value {value}, which is out of range: {reason}")]
    Range {
        key: String,
        value: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HeaderValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Display for HeaderValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderValue::Int(i) => write!(f, "{i}"),
            HeaderValue::Float(v) => write!(f, "{v}"),
            HeaderValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Int(v)
    }
}

impl From<i32> for HeaderValue {
    fn from(v: i32) -> Self {
        HeaderValue::Int(v.into())
    }
}

impl From<usize> for HeaderValue {
    fn from(v: usize) -> Self {
        HeaderValue::Int(v as i64)
    }
}

impl From<u32> for HeaderValue {
    fn from(v: u32) -> Self {
        HeaderValue::Int(v.into())
    }
}

impl From<f64> for HeaderValue {
    fn from(v: f64) -> Self {
        HeaderValue::Float(v)
    }
}

impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        HeaderValue::Str(if v { "T" } else { "F" }.to_string())
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Str(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::Str(v)
    }
}

impl HeaderValue {
    /// Interpret the value field of a FITS card as cfitsio hands it back
    /// (quotes still present for strings).
    pub(crate) fn from_card_value(raw: &str) -> HeaderValue {
        let raw = raw.trim();
        if let Some(inner) = raw.strip_prefix('\'') {
            let inner = inner.strip_suffix('\'').unwrap_or(inner);
            return HeaderValue::Str(inner.replace("''", "'").trim_end().to_string());
        }
        if let Ok(i) = raw.parse::<i64>() {
            return HeaderValue::Int(i);
        }
        // FITS allows a 'D' exponent.
        if let Ok(f) = raw.replace(['D', 'd'], "E").parse::<f64>() {
            return HeaderValue::Float(f);
        }
        HeaderValue::Str(raw.to_string())
    }
}

/// An ordered set of header cards. Keys are stored upper case.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Header(IndexMap<String, HeaderValue>);

impl Header {
    pub(crate) fn new() -> Header {
        Header::default()
    }

    /// Set a key, replacing any previous value but keeping its position.
    pub(crate) fn set<V: Into<HeaderValue>>(&mut self, key: &str, value: V) {
        debug_assert!(key.len() <= 8, "FITS key '{key}' is longer than 8 characters");
        self.0.insert(key.to_uppercase(), value.into());
    }

    pub(crate) fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.0.get(&key.to_uppercase())
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_uppercase())
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        self.0.shift_remove(&key.to_uppercase())
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &HeaderValue)> {
        self.0.iter()
    }


    fn required(&self, key: &str) -> Result<&HeaderValue, HeaderError> {
        self.get(key).ok_or_else(|| HeaderError::Missing {
            key: key.to_string(),
        })
    }

    pub(crate) fn get_float(&self, key: &str) -> Result<f64, HeaderError> {
        match self.required(key)? {
            HeaderValue::Float(f) => Ok(*f),
            HeaderValue::Int(i) => Ok(*i as f64),
            HeaderValue::Str(s) => s.trim().parse().map_err(|_| HeaderError::Type {
                key: key.to_string(),
                value: s.clone(),
                expected: "a number",
            }),
        }
    }

    pub(crate) fn get_int(&self, key: &str) -> Result<i64, HeaderError> {
        let type_err = |v: &HeaderValue| HeaderError::Type {
            key: key.to_string(),
            value: v.to_string(),
            expected: "an integer",
        };
        match self.required(key)? {
            HeaderValue::Int(i) => Ok(*i),
            v @ HeaderValue::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() {
                    Ok(*f as i64)
                } else {
                    Err(type_err(v))
                }
            }
            v @ HeaderValue::Str(s) => s.trim().parse().map_err(|_| type_err(v)),
        }
    }

    pub(crate) fn get_str(&self, key: &str) -> Result<String, HeaderError> {
        self.required(key).map(|v| v.to_string())
    }

    /// Like [`Header::get_float`], but a missing key is `None`.
    pub(crate) fn get_float_opt(&self, key: &str) -> Result<Option<f64>, HeaderError> {
        if self.contains(key) {
            self.get_float(key).map(Some)
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_values() {
        assert_eq!(
            HeaderValue::from_card_value("'DARK    '"),
            HeaderValue::Str("DARK".to_string())
        );
        assert_eq!(
            HeaderValue::from_card_value("'it''s'"),
            HeaderValue::Str("it's".to_string())
        );
        assert_eq!(HeaderValue::from_card_value("  42"), HeaderValue::Int(42));
        assert_eq!(
            HeaderValue::from_card_value("1.5D2"),
            HeaderValue::Float(150.0)
        );
        assert_eq!(
            HeaderValue::from_card_value("T"),
            HeaderValue::Str("T".to_string())
        );
    }

    #[test]
    fn test_typed_getters() {
        let mut h = Header::new();
        h.set("exptime", 30.0);
        h.set("NEXP", 5);
        h.set("OBJECT", "Gl699");
        h.set("BAD", "NaN");
        h.set("STRNUM", "12");

        assert_eq!(h.get_float("EXPTIME").unwrap(), 30.0);
        assert_eq!(h.get_float("NEXP").unwrap(), 5.0);
        assert_eq!(h.get_int("NEXP").unwrap(), 5);
        assert_eq!(h.get_int("EXPTIME").unwrap(), 30);
        assert_eq!(h.get_int("STRNUM").unwrap(), 12);
        assert_eq!(h.get_str("OBJECT").unwrap(), "Gl699");
        assert!(h.get_float("BAD").unwrap().is_nan());
        assert!(matches!(
            h.get_float("OBJECT"),
            Err(HeaderError::Type { .. })
        ));
        assert!(matches!(
            h.get_int("MISSING"),
            Err(HeaderError::Missing { .. })
        ));
        assert_eq!(h.get_float_opt("MISSING").unwrap(), None);
    }

    #[test]
    fn test_set_keeps_order() {
        let mut h = Header::new();
        h.set("A", 1);
        h.set("B", 2);
        h.set("A", 3);
        let keys: Vec<&String> = h.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["A", "B"]);
        assert_eq!(h.get_int("A").unwrap(), 3);
        h.remove("A");
        assert_eq!(h.iter().count(), 1);
    }
}
