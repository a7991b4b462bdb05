//! 20-byte content identifier newtype.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::MetainfoError;

/// SHA-1 of the bencoded info dict; the content identifier on the wire.
///
/// Renders as 40 lowercase hex characters everywhere except the announce
/// query string, where the raw bytes travel percent-encoded.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Borrow the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parse from a raw byte slice; the slice must be exactly 20 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`MetainfoError::InvalidInfoHash`] when the length is wrong.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, MetainfoError> {
        let array: [u8; 20] = bytes
            .try_into()
            .map_err(|_err| MetainfoError::InvalidInfoHash {
                value: format!("{} raw bytes", bytes.len()),
            })?;
        Ok(Self(array))
    }

    /// Render as lowercase hex.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl FromStr for InfoHash {
    type Err = MetainfoError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(value).map_err(|_err| MetainfoError::InvalidInfoHash {
            value: value.to_string(),
        })?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let hash = InfoHash([0xab; 20]);
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 40);
        let parsed: InfoHash = hex.parse().expect("parse");
        assert_eq!(parsed, hash);
    }

    #[test]
    fn wrong_length_rejected() {
        assert!(InfoHash::from_slice(&[0u8; 19]).is_err());
        assert!("abcd".parse::<InfoHash>().is_err());
    }

    #[test]
    fn serde_uses_hex_string() {
        let hash = InfoHash([0x01; 20]);
        let json = serde_json::to_string(&hash).expect("serialize");
        assert_eq!(json, format!("\"{}\"", "01".repeat(20)));
        let back: InfoHash = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, hash);
    }
}
