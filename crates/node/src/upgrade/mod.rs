//! Node upgrade manager.
//!
//! Takes a submitted upgrade descriptor through its stages, coordinated
//! with the consensus layer. After submitting a descriptor the old binary
//! may keep running, or be restarted, up to the point where consensus
//! reaches the upgrade epoch; the new binary may not start before then.
//!
//! Stage bookkeeping per pending upgrade:
//!
//! - submitted: no upgrade height, no stages
//! - at height: consensus reached the descriptor's epoch; the observing
//!   block height is stamped
//! - startup done: the handler's startup migration ran (before or after a
//!   restart)
//! - consensus done: the handler's consensus migration ran at the stamped
//!   height
//! - completed: both stages recorded; the entry is dropped from the
//!   persisted list

mod manager;
pub mod migrations;
#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use eks_chain::types::EpochTime;

pub use manager::Manager;
pub use migrations::{Migration, MigrationContext, MigrationRegistry};

/// Sentinel height: consensus has not reached the upgrade epoch yet.
pub const INVALID_UPGRADE_HEIGHT: u64 = 0;

/// Descriptor format version this build produces and accepts.
pub const LATEST_DESCRIPTOR_VERSION: u16 = 1;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("upgrade: bad descriptor")]
    BadDescriptor,

    #[error("upgrade: an equal descriptor is already pending")]
    AlreadyPending,

    #[error("upgrade: upgrade already in progress")]
    UpgradeInProgress,

    #[error("upgrade: no such pending upgrade")]
    UpgradeNotFound,

    /// The node must stop so the operator can swap binaries.
    #[error("upgrade: node must stop for upgrade")]
    StopForUpgrade,

    #[error("upgrade: running binary {running} is incompatible with upgrade target {target}")]
    IncompatibleBinary { running: String, target: String },

    #[error("upgrade: no migration handler named {0}")]
    HandlerMissing(String),

    #[error("upgrade: migration {handler} failed: {message}")]
    MigrationFailed { handler: String, message: String },

    #[error("upgrade: persistence failed: {0}")]
    Persistence(String),
}

/// An upgrade descriptor, as accepted by governance and delivered to the
/// node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Descriptor format version.
    pub version: u16,
    /// Name of the migration handler to run.
    pub handler: String,
    /// Software version the upgraded binary must report.
    pub target: String,
    /// Epoch the upgrade takes effect at.
    pub epoch: EpochTime,
}

impl Descriptor {
    pub fn validate_basic(&self) -> Result<(), Error> {
        if self.version != LATEST_DESCRIPTOR_VERSION
            || self.handler.is_empty()
            || self.target.is_empty()
        {
            return Err(Error::BadDescriptor);
        }
        Ok(())
    }

    /// Checks whether the given running software version satisfies the
    /// descriptor's target.
    pub fn ensure_compatible(&self, running_version: &str) -> Result<(), Error> {
        if running_version != self.target {
            return Err(Error::IncompatibleBinary {
                running: running_version.to_string(),
                target: self.target.clone(),
            });
        }
        Ok(())
    }
}

impl From<eks_chain::governance::UpgradeDescriptor> for Descriptor {
    fn from(d: eks_chain::governance::UpgradeDescriptor) -> Self {
        Descriptor {
            version: LATEST_DESCRIPTOR_VERSION,
            handler: d.handler,
            target: d.target,
            epoch: d.epoch,
        }
    }
}

/// Completed lifecycle stages of a pending upgrade.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeStage {
    Startup,
    Consensus,
}

/// A persisted pending upgrade.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpgrade {
    pub descriptor: Descriptor,
    /// Height at which consensus observed the upgrade epoch;
    /// [`INVALID_UPGRADE_HEIGHT`] until then.
    pub upgrade_height: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<UpgradeStage>,
}

impl PendingUpgrade {
    pub fn new(descriptor: Descriptor) -> Self {
        PendingUpgrade {
            descriptor,
            upgrade_height: INVALID_UPGRADE_HEIGHT,
            stages: Vec::new(),
        }
    }

    pub fn has_stage(&self, stage: UpgradeStage) -> bool {
        self.stages.contains(&stage)
    }

    /// Records a stage; recording the same stage twice is a no-op.
    pub fn push_stage(&mut self, stage: UpgradeStage) {
        if !self.has_stage(stage) {
            self.stages.push(stage);
        }
    }

    pub fn has_any_stages(&self) -> bool {
        !self.stages.is_empty()
    }

    pub fn is_completed(&self) -> bool {
        self.has_stage(UpgradeStage::Startup) && self.has_stage(UpgradeStage::Consensus)
    }
}
