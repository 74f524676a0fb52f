use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// 32-bit session token, written as 8 lowercase hex characters.
///
/// A fresh token is generated per session and prefixed to every punching
/// datagram so that stray traffic from older sessions is dropped.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Token([u8; 4]);

#[derive(Error, Debug, Eq, PartialEq)]
#[error("invalid token {0:?}")]
pub struct ParseTokenError(String);

impl Token {
    pub fn generate() -> Token {
        Token(rand::random())
    }
    pub const fn from_bytes(bytes: [u8; 4]) -> Token {
        Token(bytes)
    }
    /// The 4 bytes that go on the wire.
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({self})")
    }
}

impl FromStr for Token {
    type Err = ParseTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 8 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(ParseTokenError(s.to_string()));
        }
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = u8::from_str_radix(&s[2 * i..2 * i + 2], 16)
                .map_err(|_| ParseTokenError(s.to_string()))?;
        }
        Ok(Token(bytes))
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
