//! Typed field values and the schemas that move them in and out of boxes.

use std::collections::BTreeMap;
use std::str;

use thiserror::Error;

use crate::wirebox::WireBox;

/// Semantic type of a box field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Integer,
    Text,
    Boolean,
    Bytes,
}

/// A decoded field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Text(String),
    Boolean(bool),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("not an integer: {0:?}")]
    InvalidInteger(String),
    #[error("text field is not valid UTF-8")]
    InvalidText,
    #[error("{value} does not fit in {target}")]
    OutOfRange { value: i64, target: &'static str },
    #[error("expected a {expected:?} value, found {found:?}")]
    KindMismatch {
        expected: FieldKind,
        found: FieldKind,
    },
    #[error("missing argument {0:?}")]
    Missing(String),
}

impl Value {
    #[must_use]
    pub fn kind(&self) -> FieldKind {
        match self {
            Value::Integer(_) => FieldKind::Integer,
            Value::Text(_) => FieldKind::Text,
            Value::Boolean(_) => FieldKind::Boolean,
            Value::Bytes(_) => FieldKind::Bytes,
        }
    }

    /// Wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Value::Integer(n) => n.to_string().into_bytes(),
            Value::Text(text) => text.as_bytes().to_vec(),
            Value::Boolean(true) => b"True".to_vec(),
            Value::Boolean(false) => b"False".to_vec(),
            Value::Bytes(bytes) => bytes.clone(),
        }
    }

    /// Read a wire value as `kind`.
    ///
    /// Integers are decimal, or hexadecimal behind `0x`, `0X` or `#`, with an
    /// optional sign. Booleans are `True`; anything else is false.
    pub fn decode(kind: FieldKind, raw: &[u8]) -> Result<Self, DecodeError> {
        match kind {
            FieldKind::Integer => parse_integer(raw).map(Value::Integer),
            FieldKind::Text => str::from_utf8(raw)
                .map(|text| Value::Text(text.to_owned()))
                .map_err(|_| DecodeError::InvalidText),
            FieldKind::Boolean => Ok(Value::Boolean(raw == b"True")),
            FieldKind::Bytes => Ok(Value::Bytes(raw.to_vec())),
        }
    }
}

fn parse_integer(raw: &[u8]) -> Result<i64, DecodeError> {
    let invalid = || DecodeError::InvalidInteger(String::from_utf8_lossy(raw).into_owned());

    let (negative, rest) = match raw {
        [b'-', rest @ ..] => (true, rest),
        [b'+', rest @ ..] => (false, rest),
        _ => (false, raw),
    };
    let (radix, digits) = match rest {
        [b'0', b'x' | b'X', digits @ ..] | [b'#', digits @ ..] => (16, digits),
        _ => (10, rest),
    };
    let well_formed = !digits.is_empty()
        && digits.iter().all(|byte| match radix {
            16 => byte.is_ascii_hexdigit(),
            _ => byte.is_ascii_digit(),
        });
    if !well_formed {
        return Err(invalid());
    }

    let digits = str::from_utf8(digits).map_err(|_| invalid())?;
    let magnitude = u64::from_str_radix(digits, radix).map_err(|_| invalid())?;
    if negative {
        0_i64.checked_sub_unsigned(magnitude).ok_or_else(invalid)
    } else {
        i64::try_from(magnitude).map_err(|_| invalid())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(n.into())
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Value::Boolean(flag)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_owned())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::Bytes(bytes.to_vec())
    }
}

/// Named, typed values: the structured side of a box.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    #[must_use]
    pub fn get_integer(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_text(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            Value::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            Value::Boolean(flag) => Some(*flag),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        match self.get(name)? {
            Value::Bytes(bytes) => Some(bytes.as_slice()),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Write every field into `wire` under its own name.
    pub fn write_to(&self, wire: &mut WireBox) {
        for (name, value) in &self.fields {
            wire.put_value(name, value);
        }
    }
}

/// Ordered field names and kinds describing one message shape.
///
/// ```
/// use weft_amp::{FieldKind, Record, Schema, WireBox};
///
/// let schema = Schema::new().field("total", FieldKind::Integer);
/// let mut wire = WireBox::new();
/// wire.put("total", "12");
/// assert_eq!(schema.read(&wire).unwrap(), Record::new().with("total", 12_i64));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<(String, FieldKind)>,
}

impl Schema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push((name.into(), kind));
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, FieldKind)> {
        self.fields.iter().map(|(name, kind)| (name.as_str(), *kind))
    }

    #[must_use]
    pub fn kind_of(&self, name: &str) -> Option<FieldKind> {
        self.fields()
            .find(|(field, _)| *field == name)
            .map(|(_, kind)| kind)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Decode this schema's fields from `wire` into `record`.
    ///
    /// Fields whose key is absent are left as they were.
    pub fn fill(&self, wire: &WireBox, record: &mut Record) -> Result<(), DecodeError> {
        for (name, kind) in self.fields() {
            if let Some(value) = wire.get_value(name, kind) {
                record.set(name, value?);
            }
        }
        Ok(())
    }

    /// [`fill`](Self::fill) into a fresh record.
    pub fn read(&self, wire: &WireBox) -> Result<Record, DecodeError> {
        let mut record = Record::new();
        self.fill(wire, &mut record)?;
        Ok(record)
    }

    /// Encode this schema's fields of `record` into `wire`.
    ///
    /// Fields the record does not carry are skipped.
    pub fn extract(&self, record: &Record, wire: &mut WireBox) {
        for (name, kind) in self.fields() {
            let Some(value) = record.get(name) else {
                continue;
            };
            if value.kind() != kind {
                tracing::debug!(field = name, expected = ?kind, found = ?value.kind(), "field kind differs from schema");
            }
            wire.put_value(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_int(raw: &str) -> Result<Value, DecodeError> {
        Value::decode(FieldKind::Integer, raw.as_bytes())
    }

    #[test]
    fn integers_accept_decimal_and_hex() {
        assert_eq!(decode_int("42"), Ok(Value::Integer(42)));
        assert_eq!(decode_int("-17"), Ok(Value::Integer(-17)));
        assert_eq!(decode_int("+8"), Ok(Value::Integer(8)));
        assert_eq!(decode_int("0x1f"), Ok(Value::Integer(31)));
        assert_eq!(decode_int("0XFF"), Ok(Value::Integer(255)));
        assert_eq!(decode_int("#10"), Ok(Value::Integer(16)));
        assert_eq!(decode_int("-0x10"), Ok(Value::Integer(-16)));
        assert_eq!(
            decode_int("-9223372036854775808"),
            Ok(Value::Integer(i64::MIN))
        );
    }

    #[test]
    fn malformed_integers_are_rejected() {
        for raw in ["", "-", "0x", "12a", " 1", "0x+5", "1.5", "9223372036854775808"] {
            assert!(
                matches!(decode_int(raw), Err(DecodeError::InvalidInteger(_))),
                "{raw:?} should not decode"
            );
        }
    }

    #[test]
    fn booleans_are_literal_true_or_false() {
        let decode = |raw: &[u8]| Value::decode(FieldKind::Boolean, raw);
        assert_eq!(decode(b"True"), Ok(Value::Boolean(true)));
        assert_eq!(decode(b"False"), Ok(Value::Boolean(false)));
        assert_eq!(decode(b"true"), Ok(Value::Boolean(false)));
        assert_eq!(decode(b""), Ok(Value::Boolean(false)));
    }

    #[test]
    fn text_must_be_utf8_and_bytes_are_verbatim() {
        assert_eq!(
            Value::decode(FieldKind::Text, "h\u{e9}".as_bytes()),
            Ok(Value::Text("h\u{e9}".into()))
        );
        assert_eq!(
            Value::decode(FieldKind::Text, b"\xff"),
            Err(DecodeError::InvalidText)
        );
        assert_eq!(
            Value::decode(FieldKind::Bytes, b"\xff\x00"),
            Ok(Value::Bytes(vec![0xff, 0]))
        );
    }

    #[test]
    fn encode_mirrors_decode() {
        for value in [
            Value::Integer(-3),
            Value::Text("w\u{f6}rld".into()),
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Bytes(vec![0, 1, 255]),
        ] {
            assert_eq!(Value::decode(value.kind(), &value.encode()), Ok(value));
        }
    }

    #[test]
    fn fill_leaves_absent_fields_untouched() {
        let schema = Schema::new()
            .field("count", FieldKind::Integer)
            .field("label", FieldKind::Text);
        let mut wire = WireBox::new();
        wire.put("count", "3").put("unrelated", "x");

        let mut record = Record::new().with("label", "kept");
        schema.fill(&wire, &mut record).unwrap();
        assert_eq!(record.get_integer("count"), Some(3));
        assert_eq!(record.get_text("label"), Some("kept"));
        assert_eq!(record.len(), 2);
    }

    #[test]
    fn fill_reports_bad_values() {
        let schema = Schema::new().field("count", FieldKind::Integer);
        let mut wire = WireBox::new();
        wire.put("count", "three");
        assert!(schema.read(&wire).is_err());
    }

    #[test]
    fn extract_writes_only_schema_fields() {
        let schema = Schema::new()
            .field("ok", FieldKind::Boolean)
            .field("missing", FieldKind::Text);
        let record = Record::new().with("ok", true).with("extra", 1_i64);
        let mut wire = WireBox::new();
        schema.extract(&record, &mut wire);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire.get("ok"), Some(&b"True"[..]));
    }

    #[test]
    fn record_accessors_check_kind() {
        let record = Record::new()
            .with("n", 5_i64)
            .with("t", "text")
            .with("b", false)
            .with("raw", vec![1_u8, 2]);
        assert_eq!(record.get_integer("n"), Some(5));
        assert_eq!(record.get_integer("t"), None);
        assert_eq!(record.get_text("t"), Some("text"));
        assert_eq!(record.get_bool("b"), Some(false));
        assert_eq!(record.get_bytes("raw"), Some(&[1, 2][..]));
    }
}
