use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

const TAG_INT: u8 = 0x01;
const TAG_TEXT: u8 = 0x02;

/// A record key.
///
/// Integer keys sort before text keys; within a kind the natural order
/// applies. Integer keys also feed a collection's auto-increment generator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    /// Integer key (auto-generated keys are always of this kind).
    Int(i64),
    /// Text key.
    Text(String),
}

impl Key {
    /// Order-preserving byte encoding: `[tag][payload]`.
    ///
    /// Integers are stored big-endian with the sign bit flipped so that the
    /// byte order matches numeric order.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Int(i) => {
                let mut out = Vec::with_capacity(9);
                out.push(TAG_INT);
                out.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes());
                out
            }
            Self::Text(s) => {
                let mut out = Vec::with_capacity(1 + s.len());
                out.push(TAG_TEXT);
                out.extend_from_slice(s.as_bytes());
                out
            }
        }
    }

    /// Decode a key produced by [`Key::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        match bytes.split_first() {
            Some((&TAG_INT, rest)) => {
                let raw: [u8; 8] = rest
                    .try_into()
                    .map_err(|_| StoreError::Codec("integer key must be 8 bytes".into()))?;
                Ok(Self::Int((u64::from_be_bytes(raw) ^ (1 << 63)) as i64))
            }
            Some((&TAG_TEXT, rest)) => std::str::from_utf8(rest)
                .map(|s| Self::Text(s.to_string()))
                .map_err(|e| StoreError::Codec(e.to_string())),
            Some((tag, _)) => Err(StoreError::Codec(format!("unknown key tag 0x{tag:02X}"))),
            None => Err(StoreError::Codec("empty key".into())),
        }
    }

    /// The integer value, if this is an integer key.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Key {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<u32> for Key {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_order_matches_key_order() {
        let mut keys = vec![
            Key::from("b"),
            Key::Int(3),
            Key::Int(-7),
            Key::from("a"),
            Key::Int(i64::MAX),
            Key::Int(i64::MIN),
            Key::Int(0),
        ];
        let mut by_bytes = keys.clone();
        keys.sort();
        by_bytes.sort_by_key(|k| k.to_bytes());
        assert_eq!(keys, by_bytes);
        assert_eq!(keys.first(), Some(&Key::Int(i64::MIN)));
        assert_eq!(keys.last(), Some(&Key::from("b")));
    }

    #[test]
    fn decode_restores_key() {
        for key in [Key::Int(-42), Key::Int(1), Key::from("reader:7")] {
            assert_eq!(Key::from_bytes(&key.to_bytes()).unwrap(), key);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Key::from_bytes(&[]).is_err());
        assert!(Key::from_bytes(&[0x09, 1]).is_err());
        assert!(Key::from_bytes(&[TAG_INT, 1, 2]).is_err());
    }

    #[test]
    fn json_form_is_untagged() {
        assert_eq!(serde_json::to_string(&Key::Int(5)).unwrap(), "5");
        assert_eq!(serde_json::to_string(&Key::from("x")).unwrap(), "\"x\"");
        let k: Key = serde_json::from_str("\"progress\"").unwrap();
        assert_eq!(k, Key::from("progress"));
    }
}
