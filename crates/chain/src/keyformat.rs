//! Typed state key formats.
//!
//! Every table in the tree is identified by a one-byte tag followed by the
//! deterministic encodings of its structured key parts. Addresses are raw
//! 21 bytes, epochs and identifiers are big-endian `u64`, namespaces and
//! public keys are raw 32 bytes, so keys of the same table sort in part
//! order and range scans terminate exactly when the tag stops matching.
//!
//! The decode helpers return `None` as soon as the tag or the part widths no
//! longer match, which is the loop-exit condition for every range scan.

use eks_common::{Address, PublicKey};

use crate::types::Namespace;

/// A fixed-width key part.
pub trait KeyAtom: Sized {
    const SIZE: usize;

    fn append(&self, out: &mut Vec<u8>);

    fn parse(data: &[u8]) -> Option<Self>;
}

impl KeyAtom for Address {
    const SIZE: usize = eks_common::address::ADDRESS_SIZE;

    fn append(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }

    fn parse(data: &[u8]) -> Option<Self> {
        Address::from_bytes(data).ok()
    }
}

impl KeyAtom for u64 {
    const SIZE: usize = 8;

    fn append(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_be_bytes());
    }

    fn parse(data: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = data.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }
}

impl KeyAtom for Namespace {
    const SIZE: usize = 32;

    fn append(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }

    fn parse(data: &[u8]) -> Option<Self> {
        Namespace::from_bytes(data)
    }
}

impl KeyAtom for PublicKey {
    const SIZE: usize = 32;

    fn append(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }

    fn parse(data: &[u8]) -> Option<Self> {
        PublicKey::from_bytes(data).ok()
    }
}

/// A table key format: one tag byte plus zero or more fixed-width parts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyFormat(pub u8);

impl KeyFormat {
    pub const fn new(tag: u8) -> Self {
        KeyFormat(tag)
    }

    /// The bare tag, used both as the key for singleton tables and as the
    /// seek prefix for range scans.
    pub fn prefix(&self) -> Vec<u8> {
        vec![self.0]
    }

    pub fn key1<A: KeyAtom>(&self, a: &A) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + A::SIZE);
        out.push(self.0);
        a.append(&mut out);
        out
    }

    pub fn key2<A: KeyAtom, B: KeyAtom>(&self, a: &A, b: &B) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + A::SIZE + B::SIZE);
        out.push(self.0);
        a.append(&mut out);
        b.append(&mut out);
        out
    }

    pub fn key3<A: KeyAtom, B: KeyAtom, C: KeyAtom>(&self, a: &A, b: &B, c: &C) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + A::SIZE + B::SIZE + C::SIZE);
        out.push(self.0);
        a.append(&mut out);
        b.append(&mut out);
        c.append(&mut out);
        out
    }

    /// Seek prefix covering all keys whose first part is `a`.
    pub fn prefix1<A: KeyAtom>(&self, a: &A) -> Vec<u8> {
        self.key1(a)
    }

    fn check(&self, key: &[u8], total: usize) -> bool {
        key.len() == 1 + total && key[0] == self.0
    }

    pub fn decode1<A: KeyAtom>(&self, key: &[u8]) -> Option<A> {
        if !self.check(key, A::SIZE) {
            return None;
        }
        A::parse(&key[1..])
    }

    pub fn decode2<A: KeyAtom, B: KeyAtom>(&self, key: &[u8]) -> Option<(A, B)> {
        if !self.check(key, A::SIZE + B::SIZE) {
            return None;
        }
        let a = A::parse(&key[1..1 + A::SIZE])?;
        let b = B::parse(&key[1 + A::SIZE..])?;
        Some((a, b))
    }

    pub fn decode3<A: KeyAtom, B: KeyAtom, C: KeyAtom>(&self, key: &[u8]) -> Option<(A, B, C)> {
        if !self.check(key, A::SIZE + B::SIZE + C::SIZE) {
            return None;
        }
        let a = A::parse(&key[1..1 + A::SIZE])?;
        let b = B::parse(&key[1 + A::SIZE..1 + A::SIZE + B::SIZE])?;
        let c = C::parse(&key[1 + A::SIZE + B::SIZE..])?;
        Some((a, b, c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eks_common::crypto::signing_key_from_seed;

    fn addr(seed: u8) -> Address {
        let sk = signing_key_from_seed([seed; 32]);
        Address::from_public_key(&PublicKey(sk.verifying_key().to_bytes()))
    }

    #[test]
    fn roundtrip_two_addresses() {
        let fmt = KeyFormat::new(0x53);
        let (a, b) = (addr(1), addr(2));
        let key = fmt.key2(&a, &b);
        assert_eq!(fmt.decode2::<Address, Address>(&key), Some((a, b)));
    }

    #[test]
    fn roundtrip_epoch_triple() {
        let fmt = KeyFormat::new(0x55);
        let (a, b) = (addr(3), addr(4));
        let key = fmt.key3(&42u64, &a, &b);
        assert_eq!(fmt.decode3::<u64, Address, Address>(&key), Some((42, a, b)));
    }

    #[test]
    fn decode_rejects_other_tags_and_widths() {
        let fmt = KeyFormat::new(0x55);
        let other = KeyFormat::new(0x56).key1(&7u64);
        assert!(fmt.decode1::<u64>(&other).is_none());
        assert!(fmt.decode1::<u64>(&fmt.prefix()).is_none());
    }

    #[test]
    fn epoch_keys_sort_numerically() {
        let fmt = KeyFormat::new(0x55);
        let k1 = fmt.key1(&1u64);
        let k256 = fmt.key1(&256u64);
        let k65536 = fmt.key1(&65536u64);
        assert!(k1 < k256);
        assert!(k256 < k65536);
    }
}
