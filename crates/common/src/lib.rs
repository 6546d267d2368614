//! # EkS Common Crate
//!
//! Shared primitives consumed by every consensus-visible crate:
//!
//! - `quantity`: checked token arithmetic (`Quantity`, `move_amount`, `move_up_to`)
//! - `address`: versioned 21-byte account addresses
//! - `crypto`: Ed25519 public keys and signature verification
//! - `drbg`: deterministic randomness for elections (HMAC_DRBG with SHA-512)
//! - `codec`: canonical CBOR (de)serialization helpers
//!
//! Everything in this crate is deterministic: no system clock, no OS entropy
//! outside of explicit key generation helpers, no floating point.

pub mod address;
pub mod codec;
pub mod crypto;
pub mod drbg;
pub mod quantity;

pub use address::Address;
pub use crypto::PublicKey;
pub use quantity::{move_amount, move_up_to, Quantity, QuantityError};
