//! Account addresses.
//!
//! An address is 21 bytes: a one-byte version followed by the first 20 bytes
//! of SHA3-512 over a domain-separation context and the identifying public
//! key. Reserved system addresses (common pool, fee accumulator, governance
//! deposits) are derived from fixed context strings instead of a key, so they
//! can never collide with a real account and hold no usable private key.

use std::fmt;
use std::str::FromStr;

use hex::{decode as hex_decode, encode as hex_encode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Sha3_512};
use thiserror::Error;

use crate::crypto::PublicKey;

/// Current address version byte.
pub const ADDRESS_VERSION: u8 = 0;

/// Total encoded size: version byte plus truncated digest.
pub const ADDRESS_SIZE: usize = 21;

const ADDRESS_CONTEXT: &[u8] = b"eks-core/address: staking";
const RESERVED_CONTEXT: &[u8] = b"eks-core/address: reserved";
const RUNTIME_CONTEXT: &[u8] = b"eks-core/address: runtime";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("address: invalid length: expected {ADDRESS_SIZE}, found {0}")]
    InvalidLength(usize),

    #[error("address: unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("address: malformed hex: {0}")]
    MalformedHex(String),
}

/// A 21-byte versioned account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; ADDRESS_SIZE]);

impl Address {
    /// Derives the staking address of an entity or node public key.
    pub fn from_public_key(pk: &PublicKey) -> Self {
        Self::derive(ADDRESS_CONTEXT, pk.as_bytes())
    }

    /// Derives a reserved system address from a well-known name.
    pub fn reserved(name: &[u8]) -> Self {
        Self::derive(RESERVED_CONTEXT, name)
    }

    /// Derives the staking account of a runtime from its identifier. No key
    /// exists for such an address; only runtime-emitted messages can move
    /// its funds.
    pub fn from_runtime_id(id: &[u8]) -> Self {
        Self::derive(RUNTIME_CONTEXT, id)
    }

    fn derive(context: &[u8], data: &[u8]) -> Self {
        let mut hasher = Sha3_512::new();
        hasher.update(context);
        hasher.update(data);
        let digest = hasher.finalize();

        let mut out = [0u8; ADDRESS_SIZE];
        out[0] = ADDRESS_VERSION;
        out[1..].copy_from_slice(&digest[..ADDRESS_SIZE - 1]);
        Address(out)
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self, AddressError> {
        if b.len() != ADDRESS_SIZE {
            return Err(AddressError::InvalidLength(b.len()));
        }
        if b[0] != ADDRESS_VERSION {
            return Err(AddressError::UnsupportedVersion(b[0]));
        }
        let mut out = [0u8; ADDRESS_SIZE];
        out.copy_from_slice(b);
        Ok(Address(out))
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex_encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, AddressError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex_decode(s).map_err(|e| AddressError::MalformedHex(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// True for addresses derived from the reserved context. Reserved
    /// addresses may never be a transaction source.
    pub fn is_reserved(&self) -> bool {
        *self == common_pool_address()
            || *self == fee_accumulator_address()
            || *self == governance_deposits_address()
            || *self == burn_address()
    }
}

/// Address of the common pool, the protocol-owned pot that receives slashed
/// funds and pays rewards. Appears as the counterparty in reward and slash
/// events.
pub fn common_pool_address() -> Address {
    Address::reserved(b"common-pool")
}

/// Address representing the per-block fee accumulator in fee events.
pub fn fee_accumulator_address() -> Address {
    Address::reserved(b"fee-accumulator")
}

/// Address representing the governance deposits pool in deposit events.
pub fn governance_deposits_address() -> Address {
    Address::reserved(b"governance-deposits")
}

/// Address representing destroyed tokens in burn events.
pub fn burn_address() -> Address {
    Address::reserved(b"burn")
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Address").field(&self.to_hex()).finish()
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::from_hex(s)
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Address, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Address::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
