//! Ed25519 public keys and signature verification.
//!
//! The consensus core only ever verifies; signing stays with the wallet and
//! node identity tooling. Key generation is provided for those callers and
//! for tests.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hex::encode as hex_encode;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("crypto: invalid key length: expected {expected}, found {found}")]
    InvalidKeyLength { expected: usize, found: usize },

    #[error("crypto: invalid signature length: expected 64, found {0}")]
    InvalidSignatureLength(usize),

    #[error("crypto: malformed public key")]
    MalformedPublicKey,

    #[error("crypto: signature verification failed")]
    VerificationFailed,
}

/// A 32-byte Ed25519 public key.
///
/// Stored and compared as raw bytes; point validity is only checked at
/// verification time so state decoding never fails on a key that merely
/// identifies an account.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn from_bytes(b: &[u8]) -> Result<Self, CryptoError> {
        if b.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                found: b.len(),
            });
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(b);
        Ok(PublicKey(out))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Verifies `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        if signature.len() != 64 {
            return Err(CryptoError::InvalidSignatureLength(signature.len()));
        }
        let vk =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::MalformedPublicKey)?;
        let mut sig_bytes = [0u8; 64];
        sig_bytes.copy_from_slice(signature);
        let sig = Signature::from_bytes(&sig_bytes);
        vk.verify(message, &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex_encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&hex_encode(self.0)).finish()
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex_encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<PublicKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        PublicKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Generates a fresh Ed25519 keypair, returning `(signing key bytes, public key)`.
pub fn generate_keypair() -> ([u8; 32], PublicKey) {
    let mut rng = OsRng;
    let sk = SigningKey::generate(&mut rng);
    (sk.to_bytes(), PublicKey(sk.verifying_key().to_bytes()))
}

/// Builds a signing key from a fixed 32-byte seed. Intended for deterministic
/// test fixtures.
pub fn signing_key_from_seed(seed: [u8; 32]) -> SigningKey {
    SigningKey::from_bytes(&seed)
}

/// Signs `message` with the given signing key, returning the 64-byte signature.
pub fn sign(sk: &SigningKey, message: &[u8]) -> Vec<u8> {
    sk.sign(message).to_bytes().to_vec()
}
