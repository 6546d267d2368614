//! Deterministic randomness for elections.
//!
//! [`Drbg`] is an HMAC_DRBG over SHA-512 (NIST SP 800-90A instantiate /
//! generate, no reseeding) seeded from `(entropy, nonce, personalization)`.
//! Committee and validator elections derive every random choice from it, so
//! all nodes observing the same beacon output compute identical committees.
//! Nothing here may ever touch OS entropy or the clock.
//!
//! [`Drbg::permutation`] and [`Drbg::shuffle`] implement a Fisher–Yates
//! shuffle with rejection-sampled uniform indices, which keeps the output
//! independent of platform `usize` width and of any external RNG crate's
//! stream layout.

use hmac::{Hmac, Mac};
use sha2::Sha512;

type HmacSha512 = Hmac<Sha512>;

const OUT_LEN: usize = 64;

/// HMAC_DRBG(SHA-512) instance.
pub struct Drbg {
    key: [u8; OUT_LEN],
    v: [u8; OUT_LEN],
}

impl Drbg {
    /// Instantiates the generator from entropy, a nonce and a personalization
    /// string, per SP 800-90A: the three are concatenated into the seed
    /// material.
    pub fn new(entropy: &[u8], nonce: &[u8], personalization: &[u8]) -> Self {
        let mut drbg = Drbg {
            key: [0u8; OUT_LEN],
            v: [1u8; OUT_LEN],
        };
        let mut seed = Vec::with_capacity(entropy.len() + nonce.len() + personalization.len());
        seed.extend_from_slice(entropy);
        seed.extend_from_slice(nonce);
        seed.extend_from_slice(personalization);
        drbg.update(&seed);
        drbg
    }

    fn hmac(key: &[u8], parts: &[&[u8]]) -> [u8; OUT_LEN] {
        let mut mac = HmacSha512::new_from_slice(key).expect("hmac accepts any key length");
        for part in parts {
            mac.update(part);
        }
        let mut out = [0u8; OUT_LEN];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }

    fn update(&mut self, provided: &[u8]) {
        self.key = Self::hmac(&self.key, &[&self.v, &[0x00], provided]);
        self.v = Self::hmac(&self.key, &[&self.v]);
        if !provided.is_empty() {
            self.key = Self::hmac(&self.key, &[&self.v, &[0x01], provided]);
            self.v = Self::hmac(&self.key, &[&self.v]);
        }
    }

    /// Fills `out` with the next generator output.
    pub fn fill_bytes(&mut self, out: &mut [u8]) {
        let mut filled = 0;
        while filled < out.len() {
            self.v = Self::hmac(&self.key, &[&self.v]);
            let n = (out.len() - filled).min(OUT_LEN);
            out[filled..filled + n].copy_from_slice(&self.v[..n]);
            filled += n;
        }
        self.update(&[]);
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.fill_bytes(&mut buf);
        u64::from_be_bytes(buf)
    }

    /// Draws a uniform value in `[0, bound)` by rejection sampling, so every
    /// index is exactly equally likely.
    fn uniform(&mut self, bound: u64) -> u64 {
        debug_assert!(bound > 0);
        if bound == 1 {
            return 0;
        }
        // Largest multiple of bound that fits in u64; values at or above it
        // are biased and must be rejected.
        let zone = u64::MAX - (u64::MAX % bound);
        loop {
            let raw = self.next_u64();
            if raw < zone {
                return raw % bound;
            }
        }
    }

    /// Returns a uniform permutation of `0..n`.
    pub fn permutation(&mut self, n: usize) -> Vec<usize> {
        let mut perm: Vec<usize> = (0..n).collect();
        self.shuffle(&mut perm);
        perm
    }

    /// Shuffles `items` in place with Fisher–Yates.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.uniform(i as u64 + 1) as usize;
            items.swap(i, j);
        }
    }
}
