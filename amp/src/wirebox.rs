//! The ordered key/value box and its wire encoding.

use std::fmt;

use thiserror::Error;

use crate::framer::write_frame;
use crate::latin1;
use crate::schema::{DecodeError, FieldKind, Value};

/// Longest key a box may carry. Values may use the whole frame.
pub const MAX_KEY_LEN: usize = 255;

/// Why a box could not be encoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoxError {
    /// An empty key would read back as the box terminator.
    #[error("box keys must not be empty")]
    EmptyKey,
    #[error("box key of {len} bytes exceeds the {MAX_KEY_LEN}-byte key limit")]
    KeyTooLong { len: usize },
    #[error("value of {len} bytes for key {key:?} exceeds the frame limit")]
    ValueTooLong { key: String, len: usize },
}

/// An ordered sequence of byte-string pairs.
///
/// Keys may repeat; lookups see the first match. Two boxes are equal when
/// every pair of each can be found, with the same value, in the other.
#[derive(Debug, Clone, Default)]
pub struct WireBox {
    pairs: Vec<(Vec<u8>, Vec<u8>)>,
}

impl WireBox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pair. Existing pairs with the same key are kept.
    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> &mut Self {
        self.pairs
            .push((key.as_ref().to_vec(), value.as_ref().to_vec()));
        self
    }

    /// Append a typed value in its wire form.
    pub fn put_value(&mut self, key: impl AsRef<[u8]>, value: &Value) -> &mut Self {
        self.put(key, value.encode())
    }

    /// Value of the first pair whose key matches.
    #[must_use]
    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<&[u8]> {
        let key = key.as_ref();
        self.pairs
            .iter()
            .find(|(k, _)| k.as_slice() == key)
            .map(|(_, value)| value.as_slice())
    }

    /// [`get`](Self::get), read as Latin-1 text.
    #[must_use]
    pub fn get_latin1(&self, key: impl AsRef<[u8]>) -> Option<String> {
        self.get(key).map(latin1::decode)
    }

    /// [`get`](Self::get), decoded as `kind`.
    pub fn get_value(
        &self,
        key: impl AsRef<[u8]>,
        kind: FieldKind,
    ) -> Option<Result<Value, DecodeError>> {
        self.get(key).map(|raw| Value::decode(kind, raw))
    }

    #[must_use]
    pub fn contains(&self, key: impl AsRef<[u8]>) -> bool {
        self.get(key).is_some()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.pairs
            .iter()
            .map(|(key, value)| (key.as_slice(), value.as_slice()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Wire form: a key frame and a value frame per pair, then an empty
    /// frame.
    pub fn encode(&self) -> Result<Vec<u8>, BoxError> {
        let size = self
            .pairs
            .iter()
            .map(|(key, value)| 4 + key.len() + value.len())
            .sum::<usize>()
            + 2;
        let mut out = Vec::with_capacity(size);
        for (key, value) in &self.pairs {
            if key.is_empty() {
                return Err(BoxError::EmptyKey);
            }
            if key.len() > MAX_KEY_LEN {
                return Err(BoxError::KeyTooLong { len: key.len() });
            }
            write_frame(&mut out, key).map_err(|_| BoxError::KeyTooLong { len: key.len() })?;
            write_frame(&mut out, value).map_err(|_| BoxError::ValueTooLong {
                key: latin1::decode(key),
                len: value.len(),
            })?;
        }
        out.extend_from_slice(&[0, 0]);
        Ok(out)
    }

    /// Every pair of `self` appears in `other`.
    fn covered_by(&self, other: &Self) -> bool {
        self.pairs().all(|(key, value)| {
            other
                .pairs()
                .any(|(other_key, other_value)| key == other_key && value == other_value)
        })
    }
}

impl PartialEq for WireBox {
    fn eq(&self, other: &Self) -> bool {
        self.covered_by(other) && other.covered_by(self)
    }
}

impl Eq for WireBox {}

impl<K, V> FromIterator<(K, V)> for WireBox
where
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut wire = Self::new();
        for (key, value) in iter {
            wire.put(key, value);
        }
        wire
    }
}

impl fmt::Display for WireBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (index, (key, value)) in self.pairs().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(
                f,
                "{}={}",
                latin1::decode(key).escape_debug(),
                latin1::decode(value).escape_debug()
            )?;
        }
        f.write_str("}")
    }
}
