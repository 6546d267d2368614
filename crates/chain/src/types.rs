//! Chain-wide scalar types.

use std::fmt;
use std::str::FromStr;

use hex::{decode as hex_decode, encode as hex_encode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Epoch number. Epochs are advanced by the beacon application and partition
/// time for reward and committee purposes.
pub type EpochTime = u64;

/// Sentinel for an unset epoch.
pub const EPOCH_INVALID: EpochTime = u64::MAX;

/// A 32-byte runtime identifier.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace(pub [u8; 32]);

impl Namespace {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() != 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(b);
        Some(Namespace(out))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex_encode(self.0)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Namespace").field(&self.to_hex()).finish()
    }
}

impl FromStr for Namespace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex_decode(s).map_err(|e| e.to_string())?;
        Namespace::from_bytes(&bytes).ok_or_else(|| format!("invalid namespace length: {}", bytes.len()))
    }
}

impl Serialize for Namespace {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Namespace {
    fn deserialize<D>(deserializer: D) -> Result<Namespace, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A 32-byte storage root hash.
pub type Hash = [u8; 32];
