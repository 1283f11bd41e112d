//! Stable hub identifiers
//!
//! A `StableId` is a 128-bit, time-ordered identifier rendered as 26 characters
//! of Crockford base32 (the ULID text form). Ids minted later sort after ids
//! minted earlier, both as integers and as strings.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const ENCODED_LEN: usize = 26;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseIdError {
    #[error("stable id must be {ENCODED_LEN} characters, got {0}")]
    InvalidLength(usize),

    #[error("invalid character '{0}' in stable id")]
    InvalidChar(char),

    #[error("stable id overflows 128 bits")]
    Overflow,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StableId(u128);

impl StableId {
    /// Mint a new id ordered by the current wall-clock millisecond
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7().as_u128())
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub const fn as_u128(&self) -> u128 {
        self.0
    }

    /// Milliseconds since the Unix epoch encoded in the high 48 bits
    pub fn timestamp_ms(&self) -> u64 {
        (self.0 >> 80) as u64
    }
}

impl Default for StableId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = [0u8; ENCODED_LEN];
        for (i, slot) in out.iter_mut().enumerate() {
            let shift = 125 - 5 * i as u32;
            let index = ((self.0 >> shift) & 0x1f) as usize;
            *slot = ALPHABET[index];
        }
        // ALPHABET is ASCII
        f.write_str(std::str::from_utf8(&out).map_err(|_| fmt::Error)?)
    }
}

impl fmt::Debug for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StableId({})", self)
    }
}

fn decode_char(c: char) -> Result<u128, ParseIdError> {
    let value = match c.to_ascii_uppercase() {
        c @ '0'..='9' => c as u32 - '0' as u32,
        'O' => 0,
        'I' | 'L' => 1,
        c => match ALPHABET.iter().position(|&a| a as char == c) {
            Some(pos) => pos as u32,
            None => return Err(ParseIdError::InvalidChar(c)),
        },
    };
    Ok(value as u128)
}

impl FromStr for StableId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let len = s.chars().count();
        if len != ENCODED_LEN {
            return Err(ParseIdError::InvalidLength(len));
        }

        let mut chars = s.chars();
        let first = chars.next().ok_or(ParseIdError::InvalidLength(0))?;
        let first = decode_char(first)?;
        if first > 7 {
            return Err(ParseIdError::Overflow);
        }

        let mut value = first;
        for c in chars {
            value = (value << 5) | decode_char(c)?;
        }

        Ok(Self(value))
    }
}

impl Serialize for StableId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StableId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_ulid() {
        let id: StableId = "01ECNJBS294ESNMG913SVX893F".parse().unwrap();
        assert_eq!(id.to_string(), "01ECNJBS294ESNMG913SVX893F");
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let upper: StableId = "01ECNJBS294ESNMG913SVX893F".parse().unwrap();
        let lower: StableId = "01ecnjbs294esnmg913svx893f".parse().unwrap();
        assert_eq!(upper, lower);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(
            "short".parse::<StableId>(),
            Err(ParseIdError::InvalidLength(5))
        );
        assert_eq!(
            "01ECNJBS294ESNMG913SVX893U".parse::<StableId>(),
            Err(ParseIdError::InvalidChar('U'))
        );
        assert_eq!(
            "81ECNJBS294ESNMG913SVX893F".parse::<StableId>(),
            Err(ParseIdError::Overflow)
        );
    }

    #[test]
    fn test_new_ids_sort_by_creation() {
        let a = StableId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = StableId::new();
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
        assert!(a.timestamp_ms() <= b.timestamp_ms());
    }

    #[test]
    fn test_serde_uses_text_form() {
        let id: StableId = "01ECNJBS294ESNMG913SVX893F".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"01ECNJBS294ESNMG913SVX893F\"");
        let back: StableId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
