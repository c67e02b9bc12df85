//! Self-describing scalar, array and object values.
//!
//! `Any` is what ends up inside map slots and array elements when a value is
//! not itself a shared type. Its binary form starts with a one-byte tag:
//!
//! | tag | value                         |
//! |-----|-------------------------------|
//! | 127 | undefined                     |
//! | 126 | null                          |
//! | 125 | integer (signed var-int)      |
//! | 124 | float32 (big-endian)          |
//! | 123 | float64 (big-endian)          |
//! | 122 | bigint (i64, big-endian)      |
//! | 121 | false                         |
//! | 120 | true                          |
//! | 119 | string                        |
//! | 118 | object (count, key/value*)    |
//! | 117 | array (count, value*)         |
//! | 116 | byte buffer                   |

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::encoding::{Cursor, Write};
use crate::error::{Error, Result};

/// Largest integer written with the compact var-int encoding.
const MAX_VAR_INT: f64 = 2147483647.0;

/// A JSON-like value with a few extra cases (undefined, bigint, bytes).
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Any {
    #[default]
    Null,
    Undefined,
    Bool(bool),
    Number(f64),
    BigInt(i64),
    String(Arc<str>),
    Buffer(Arc<[u8]>),
    Array(Arc<[Any]>),
    Map(Arc<BTreeMap<String, Any>>),
}

impl Any {
    /// Write the tagged binary form.
    pub fn encode<W: Write>(&self, w: &mut W) {
        match self {
            Any::Undefined => w.write_u8(127),
            Any::Null => w.write_u8(126),
            Any::Number(n) => {
                let n = *n;
                if n.fract() == 0.0 && n.abs() <= MAX_VAR_INT {
                    w.write_u8(125);
                    w.write_var_signed(n.abs() as u64, n.is_sign_negative());
                } else if (n as f32) as f64 == n {
                    w.write_u8(124);
                    w.write_f32(n as f32);
                } else {
                    w.write_u8(123);
                    w.write_f64(n);
                }
            }
            Any::BigInt(n) => {
                w.write_u8(122);
                w.write_i64(*n);
            }
            Any::Bool(false) => w.write_u8(121),
            Any::Bool(true) => w.write_u8(120),
            Any::String(s) => {
                w.write_u8(119);
                w.write_string(s);
            }
            Any::Map(map) => {
                w.write_u8(118);
                w.write_var(map.len() as u64);
                for (key, value) in map.iter() {
                    w.write_string(key);
                    value.encode(w);
                }
            }
            Any::Array(items) => {
                w.write_u8(117);
                w.write_var(items.len() as u64);
                for item in items.iter() {
                    item.encode(w);
                }
            }
            Any::Buffer(buf) => {
                w.write_u8(116);
                w.write_buf(buf);
            }
        }
    }

    /// Read a tagged value.
    pub fn decode(cursor: &mut Cursor<'_>) -> Result<Any> {
        let tag = cursor.read_u8()?;
        let value = match tag {
            127 => Any::Undefined,
            126 => Any::Null,
            125 => {
                let signed = cursor.read_var_signed()?;
                let magnitude = signed.magnitude as f64;
                Any::Number(if signed.negative { -magnitude } else { magnitude })
            }
            124 => Any::Number(cursor.read_f32()? as f64),
            123 => Any::Number(cursor.read_f64()?),
            122 => Any::BigInt(cursor.read_i64()?),
            121 => Any::Bool(false),
            120 => Any::Bool(true),
            119 => Any::String(Arc::from(cursor.read_string()?)),
            118 => {
                let len = cursor.read_var()? as usize;
                let mut map = BTreeMap::new();
                for _ in 0..len {
                    let key = cursor.read_string()?.to_owned();
                    let value = Any::decode(cursor)?;
                    map.insert(key, value);
                }
                Any::Map(Arc::new(map))
            }
            117 => {
                let len = cursor.read_var()? as usize;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(Any::decode(cursor)?);
                }
                Any::Array(Arc::from(items))
            }
            116 => Any::Buffer(Arc::from(cursor.read_buf()?)),
            other => return Err(Error::UnknownAnyTag(other)),
        };
        return Ok(value);
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        return buf;
    }

    /// Convert to a JSON value. Undefined becomes null, byte buffers become
    /// arrays of numbers.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Any::Null | Any::Undefined => Json::Null,
            Any::Bool(b) => Json::Bool(*b),
            Any::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9007199254740992.0 {
                    return Json::from(*n as i64);
                }
                return serde_json::Number::from_f64(*n).map(Json::Number).unwrap_or(Json::Null);
            }
            Any::BigInt(n) => Json::from(*n),
            Any::String(s) => Json::String(s.to_string()),
            Any::Buffer(buf) => Json::Array(buf.iter().map(|b| Json::from(*b)).collect()),
            Any::Array(items) => Json::Array(items.iter().map(Any::to_json).collect()),
            Any::Map(map) => Json::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }

    /// Convert from a JSON value.
    pub fn from_json(value: &serde_json::Value) -> Any {
        use serde_json::Value as Json;
        match value {
            Json::Null => Any::Null,
            Json::Bool(b) => Any::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    if i.unsigned_abs() < (1 << 53) {
                        return Any::Number(i as f64);
                    }
                    return Any::BigInt(i);
                }
                return Any::Number(n.as_f64().unwrap_or(f64::NAN));
            }
            Json::String(s) => Any::String(Arc::from(s.as_str())),
            Json::Array(items) => Any::Array(items.iter().map(Any::from_json).collect()),
            Json::Object(map) => Any::Map(Arc::new(
                map.iter()
                    .map(|(key, value)| (key.clone(), Any::from_json(value)))
                    .collect(),
            )),
        }
    }

    /// Serialize as a JSON string.
    pub fn to_json_string(&self) -> String {
        return self.to_json().to_string();
    }

    /// Parse a JSON string. The literal `undefined` is accepted as well.
    pub fn from_json_str(src: &str) -> Result<Any> {
        if src == "undefined" {
            return Ok(Any::Undefined);
        }
        let value: serde_json::Value = serde_json::from_str(src)?;
        return Ok(Any::from_json(&value));
    }

    pub fn is_null(&self) -> bool {
        return matches!(self, Any::Null | Any::Undefined);
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Any::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Any::Number(n) => Some(*n),
            Any::BigInt(n) => Some(*n as f64),
            _ => None,
        }
    }
}

impl fmt::Display for Any {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Any::String(s) => write!(f, "{}", s),
            Any::Undefined => write!(f, "undefined"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<bool> for Any {
    fn from(value: bool) -> Any {
        return Any::Bool(value);
    }
}

impl From<f64> for Any {
    fn from(value: f64) -> Any {
        return Any::Number(value);
    }
}

impl From<f32> for Any {
    fn from(value: f32) -> Any {
        return Any::Number(value as f64);
    }
}

impl From<i32> for Any {
    fn from(value: i32) -> Any {
        return Any::Number(value as f64);
    }
}

impl From<u32> for Any {
    fn from(value: u32) -> Any {
        return Any::Number(value as f64);
    }
}

impl From<i64> for Any {
    fn from(value: i64) -> Any {
        if value.unsigned_abs() < (1 << 53) {
            return Any::Number(value as f64);
        }
        return Any::BigInt(value);
    }
}

impl From<&str> for Any {
    fn from(value: &str) -> Any {
        return Any::String(Arc::from(value));
    }
}

impl From<String> for Any {
    fn from(value: String) -> Any {
        return Any::String(Arc::from(value));
    }
}

impl From<Arc<str>> for Any {
    fn from(value: Arc<str>) -> Any {
        return Any::String(value);
    }
}

impl From<Vec<u8>> for Any {
    fn from(value: Vec<u8>) -> Any {
        return Any::Buffer(Arc::from(value));
    }
}

impl From<&[u8]> for Any {
    fn from(value: &[u8]) -> Any {
        return Any::Buffer(Arc::from(value));
    }
}

impl From<Vec<Any>> for Any {
    fn from(value: Vec<Any>) -> Any {
        return Any::Array(Arc::from(value));
    }
}

impl From<BTreeMap<String, Any>> for Any {
    fn from(value: BTreeMap<String, Any>) -> Any {
        return Any::Map(Arc::new(value));
    }
}

impl From<HashMap<String, Any>> for Any {
    fn from(value: HashMap<String, Any>) -> Any {
        return Any::Map(Arc::new(value.into_iter().collect()));
    }
}

impl<T: Into<Any>> From<Option<T>> for Any {
    fn from(value: Option<T>) -> Any {
        match value {
            Some(value) => value.into(),
            None => Any::Null,
        }
    }
}

impl From<serde_json::Value> for Any {
    fn from(value: serde_json::Value) -> Any {
        return Any::from_json(&value);
    }
}

impl From<&serde_json::Value> for Any {
    fn from(value: &serde_json::Value) -> Any {
        return Any::from_json(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: &Any) -> Any {
        let bytes = value.to_bytes();
        let mut cursor = Cursor::new(&bytes);
        let decoded = Any::decode(&mut cursor).unwrap();
        assert!(!cursor.has_content());
        return decoded;
    }

    #[test]
    fn small_integers_use_var_int() {
        assert_eq!(Any::from(5).to_bytes(), vec![125, 5]);
        assert_eq!(Any::from(-1).to_bytes(), vec![125, 0x41]);
    }

    #[test]
    fn floats_pick_narrowest_width() {
        assert_eq!(Any::Number(0.5).to_bytes()[0], 124);
        assert_eq!(Any::Number(0.1).to_bytes()[0], 123);
        assert_eq!(Any::Number(4294967296.0).to_bytes()[0], 124);
        assert_eq!(roundtrip(&Any::Number(0.1)), Any::Number(0.1));
    }

    #[test]
    fn nested_values_survive() {
        let json = serde_json::json!({
            "name": "stitch",
            "tags": ["a", "b", null],
            "nested": { "ok": true, "n": 1.25 }
        });
        let value = Any::from_json(&json);
        assert_eq!(roundtrip(&value), value);
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let bytes = [3u8];
        let mut cursor = Cursor::new(&bytes);
        assert!(matches!(Any::decode(&mut cursor), Err(Error::UnknownAnyTag(3))));
    }

    #[test]
    fn undefined_json_literal() {
        assert_eq!(Any::from_json_str("undefined").unwrap(), Any::Undefined);
        assert_eq!(Any::from_json_str("[1,2]").unwrap(), Any::from(vec![Any::from(1), Any::from(2)]));
    }
}
