//! Genesis document.
//!
//! The engine hands the full document to `InitChain`; every application
//! consumes its own section. State computed from genesis (pending upgrades,
//! next proposal identifier, total-supply audit) is derived here once and
//! identically on every node.

use serde::{Deserialize, Serialize};

use crate::types::EpochTime;
use crate::{beacon, governance, registry, roothash, scheduler, staking};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Genesis {
    /// Genesis time, unix seconds.
    pub time: u64,
    pub base_epoch: EpochTime,
    pub beacon: beacon::Genesis,
    pub registry: registry::Genesis,
    pub staking: staking::Genesis,
    pub scheduler: scheduler::Genesis,
    pub governance: governance::Genesis,
    pub roothash: roothash::Genesis,
}
