//! Scheduler: per-epoch election of the validator set and per-runtime
//! compute committees.
//!
//! Elections are fully deterministic: all randomness comes from the epoch
//! beacon through an HMAC_DRBG(SHA-512) with fixed personalization strings,
//! so every node derives the same committees. The elected validator set is
//! staged as "pending" and diffed against the current set in EndBlock to
//! produce the update list for the consensus engine.

pub mod app;
pub mod state;

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use eks_common::{PublicKey, Quantity, QuantityError};

use crate::mkvs::StateError;
use crate::types::{EpochTime, Namespace};

pub use app::App;

/// Application name.
pub const APP_NAME: &str = "scheduler";

/// DRBG personalization strings. These are part of the protocol: changing
/// any byte changes every election.
pub const RNG_CONTEXT_EXECUTOR: &[u8] = b"EkS-ABCI-Compute";
pub const RNG_CONTEXT_VALIDATORS: &[u8] = b"EkS-ABCI-Validators";
pub const RNG_CONTEXT_ENTITIES: &[u8] = b"EkS-ABCI-Entities";

#[derive(Debug, ThisError)]
pub enum Error {
    /// The validator election failed. This is fatal: without a validator
    /// set the network cannot reach consensus, and recovery requires
    /// manual intervention.
    #[error("scheduler: validator election failed: {0}")]
    ValidatorElectionFailed(String),

    #[error("scheduler: voting power out of range")]
    VotingPowerOverflow,

    #[error("scheduler: invalid argument")]
    InvalidArgument,

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Quantity(#[from] QuantityError),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::State(_) | Error::ValidatorElectionFailed(_))
    }
}

/// Committee kinds the scheduler elects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CommitteeKind {
    ComputeExecutor,
}

/// Role of a node within a committee. The serialized names are literal
/// protocol strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "Worker")]
    Worker,
    #[serde(rename = "Backup-Worker")]
    BackupWorker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Worker => "Worker",
            Role::BackupWorker => "Backup-Worker",
        }
    }
}

/// One committee member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeNode {
    pub role: Role,
    pub node_id: PublicKey,
}

/// An elected committee for one runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committee {
    pub kind: CommitteeKind,
    pub runtime_id: Namespace,
    pub members: Vec<CommitteeNode>,
    pub valid_for: EpochTime,
}

/// One member of the validator set, keyed externally by consensus key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub id: PublicKey,
    pub entity_id: PublicKey,
    pub voting_power: i64,
}

/// How entity stake maps to consensus voting power.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VotingPowerDistribution {
    #[default]
    Linear,
    Sqrt,
}

fn isqrt_u128(value: u128) -> u128 {
    if value < 2 {
        return value;
    }
    let mut x = value;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + value / x) / 2;
    }
    x
}

/// Maps an entity's active escrow balance to consensus voting power.
/// Zero-power validators cannot exist, and the result must fit the
/// engine's signed 64-bit power type.
pub fn voting_power_from_stake(
    stake: &Quantity,
    distribution: VotingPowerDistribution,
) -> Result<i64, Error> {
    let raw = match distribution {
        VotingPowerDistribution::Linear => stake.value(),
        VotingPowerDistribution::Sqrt => isqrt_u128(stake.value()),
    };
    if raw == 0 {
        return Err(Error::VotingPowerOverflow);
    }
    i64::try_from(raw).map_err(|_| Error::VotingPowerOverflow)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Parameters {
    pub min_validators: usize,
    pub max_validators: usize,
    pub max_validators_per_entity: usize,
    pub voting_power_distribution: VotingPowerDistribution,
    /// Reward factor for entities with any elected node.
    pub reward_factor_epoch_election_any: Quantity,
    /// Skips all stake checks and gives every validator power one.
    pub debug_bypass_stake: bool,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            min_validators: 1,
            max_validators: 100,
            max_validators_per_entity: 1,
            voting_power_distribution: VotingPowerDistribution::default(),
            reward_factor_epoch_election_any: Quantity::ZERO,
            debug_bypass_stake: false,
        }
    }
}

/// Parameter changes a governance proposal may apply to this module.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParameterChanges {
    pub min_validators: Option<usize>,
    pub max_validators: Option<usize>,
    pub max_validators_per_entity: Option<usize>,
    pub reward_factor_epoch_election_any: Option<Quantity>,
}

impl ParameterChanges {
    pub fn validate(&self) -> Result<(), Error> {
        if let (Some(min), Some(max)) = (self.min_validators, self.max_validators) {
            if min > max {
                return Err(Error::InvalidArgument);
            }
        }
        Ok(())
    }

    pub fn apply(&self, params: &mut Parameters) {
        if let Some(v) = self.min_validators {
            params.min_validators = v;
        }
        if let Some(v) = self.max_validators {
            params.max_validators = v;
        }
        if let Some(v) = self.max_validators_per_entity {
            params.max_validators_per_entity = v;
        }
        if let Some(v) = self.reward_factor_epoch_election_any {
            params.reward_factor_epoch_election_any = v;
        }
    }
}

/// Initial validator set entry from genesis.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub consensus_key: PublicKey,
    pub node_id: PublicKey,
    pub entity_id: PublicKey,
    pub voting_power: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Genesis {
    pub parameters: Option<Parameters>,
    pub validators: Vec<GenesisValidator>,
}

/// Typed scheduler events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Elected { kinds: Vec<CommitteeKind> },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Elected { .. } => "elected",
        }
    }
}

#[cfg(test)]
mod power_tests {
    use super::*;

    #[test]
    fn linear_power_is_identity_within_range() {
        assert_eq!(
            voting_power_from_stake(&Quantity::new(1234), VotingPowerDistribution::Linear).unwrap(),
            1234
        );
    }

    #[test]
    fn sqrt_power_takes_integer_root() {
        assert_eq!(
            voting_power_from_stake(&Quantity::new(1_000_000), VotingPowerDistribution::Sqrt)
                .unwrap(),
            1000
        );
        assert_eq!(
            voting_power_from_stake(&Quantity::new(999_999), VotingPowerDistribution::Sqrt)
                .unwrap(),
            999
        );
    }

    #[test]
    fn zero_and_oversized_stakes_are_rejected() {
        assert!(voting_power_from_stake(&Quantity::ZERO, VotingPowerDistribution::Linear).is_err());
        assert!(voting_power_from_stake(
            &Quantity::new(u128::from(u64::MAX)),
            VotingPowerDistribution::Linear
        )
        .is_err());
    }
}
