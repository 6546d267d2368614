//! Ordered key-value tree abstraction.
//!
//! The authenticated Merkleised tree itself belongs to the consensus engine;
//! the applications only consume get/insert/remove and ordered iteration
//! through the [`Tree`] trait. [`MemoryTree`] is the in-process
//! implementation used by the dispatcher harness and the test suite; its
//! snapshot/commit pair gives transactions all-or-nothing semantics.
//!
//! Storage failures surface as [`StateError::Unavailable`], the only error
//! class that is allowed to abort block processing. A missing key is not an
//! error: reads return `Ok(None)`.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    /// Transient storage failure. Propagates upward as a hard block failure;
    /// the consensus engine retries or halts.
    #[error("state unavailable: {0}")]
    Unavailable(String),

    /// A consensus invariant did not hold (arithmetic that must not fail
    /// failed, a mode-restricted write ran in the wrong context, the
    /// auditor found a supply mismatch). Fatal to the block; indicates a
    /// bug rather than bad input.
    #[error("state invariant violation: {0}")]
    InvariantViolation(String),
}

/// Ordered key-value tree the applications run against.
pub trait Tree {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError>;

    fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError>;

    fn remove(&mut self, key: &[u8]) -> Result<(), StateError>;

    /// Returns all entries with key >= `start`, in lexicographic key order.
    /// Range scans seek to a format prefix and stop decoding once the prefix
    /// no longer matches.
    fn iter_from(&self, start: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateError>;
}

/// In-memory ordered tree with snapshot/commit semantics.
#[derive(Clone, Default)]
pub struct MemoryTree {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a snapshot to run a speculative operation against. Commit by
    /// calling [`MemoryTree::overwrite`] with the snapshot; discard by
    /// dropping it.
    pub fn snapshot(&self) -> MemoryTree {
        self.clone()
    }

    /// Replaces the contents with a previously taken (and since mutated)
    /// snapshot.
    pub fn overwrite(&mut self, snapshot: MemoryTree) {
        self.entries = snapshot.entries;
    }

    /// Dumps the full contents, used by determinism checks to compare
    /// post-states byte for byte.
    pub fn dump(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Tree for MemoryTree {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.entries.get(key).cloned())
    }

    fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError> {
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> Result<(), StateError> {
        self.entries.remove(key);
        Ok(())
    }

    fn iter_from(&self, start: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateError> {
        Ok(self
            .entries
            .range(start.to_vec()..)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
