//! Migration handlers.
//!
//! Every upgrade descriptor names a handler; the handler carries the actual
//! migration code the node runs at the upgrade point. The startup stage
//! runs outside consensus (typically right after a restart with the new
//! binary); the consensus stage runs at the stamped upgrade height with a
//! mutable handle to the consensus state tree.

use std::collections::BTreeMap;
use std::sync::Arc;

use eks_chain::mkvs::Tree;

use super::Error;

/// Handle the consensus-stage migration mutates chain state through.
pub struct MigrationContext<'a> {
    pub tree: &'a mut dyn Tree,
}

/// A migration implementation for one named handler.
pub trait Migration: Send + Sync {
    /// Whether this handler has a startup stage. Handlers without one allow
    /// in-place upgrades with no node restart.
    fn has_startup_upgrade(&self) -> bool {
        false
    }

    /// The startup-stage migration. Must be idempotent; the manager also
    /// skips it when the stage is already recorded.
    fn startup_upgrade(&self) -> Result<(), Error> {
        Ok(())
    }

    /// The consensus-stage migration, run at the upgrade height.
    fn consensus_upgrade(&self, ctx: &mut MigrationContext<'_>) -> Result<(), Error>;
}

/// Registry of migration handlers by name.
#[derive(Default, Clone)]
pub struct MigrationRegistry {
    handlers: BTreeMap<String, Arc<dyn Migration>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn Migration>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Migration>, Error> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::HandlerMissing(name.to_string()))
    }
}

/// A no-op migration usable for upgrades that only swap the binary.
pub struct EmptyMigration;

impl Migration for EmptyMigration {
    fn consensus_upgrade(&self, _ctx: &mut MigrationContext<'_>) -> Result<(), Error> {
        Ok(())
    }
}
