use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use mongodb::bson::Bson;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const HASH_LEN: usize = 32;

/// A transaction hash, which doubles as the identity of a ticket.
/// Displayed and serialized as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxHash([u8; HASH_LEN]);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid hash {0:?}: expected 64 hex characters")]
pub struct HashParseError(String);

const HASH_LEN_HEX: usize = HASH_LEN * 2;

impl TxHash {
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Double SHA-256 of `data`.
    pub fn of(data: &[u8]) -> Self {
        let first = Sha256::digest(data);
        Self(Sha256::digest(first).into())
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl FromStr for TxHash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || HashParseError(s.to_string());
        if s.len() != HASH_LEN_HEX {
            return Err(err());
        }
        let bytes = HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .map_err(|_| err())?;
        let bytes: [u8; HASH_LEN] = bytes.as_slice().try_into().map_err(|_| err())?;
        Ok(Self(bytes))
    }
}

impl Display for TxHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&HEXLOWER.encode(&self.0))
    }
}

impl Debug for TxHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TxHash({self})")
    }
}

impl Serialize for TxHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

impl From<TxHash> for Bson {
    fn from(hash: TxHash) -> Self {
        Bson::String(hash.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let hex = "a".repeat(64);
        let hash: TxHash = hex.parse().unwrap();
        assert_eq!(hash.to_string(), hex);
        // Upper case input is accepted but always displayed lower case.
        let upper: TxHash = "A".repeat(64).parse().unwrap();
        assert_eq!(upper, hash);
    }

    #[test]
    fn rejects_bad_input() {
        assert!("a".repeat(63).parse::<TxHash>().is_err());
        assert!("a".repeat(66).parse::<TxHash>().is_err());
        assert!("g".repeat(64).parse::<TxHash>().is_err());
        assert!("".parse::<TxHash>().is_err());
    }

    #[test]
    fn serde_as_string() {
        let hash = TxHash::of(b"ticket");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{hash}\""));
        assert_eq!(serde_json::from_str::<TxHash>(&json).unwrap(), hash);
        assert!(serde_json::from_str::<TxHash>("\"1234\"").is_err());
    }
}
