//! Epoch time and random beacon state.
//!
//! Epochs partition time for reward and committee purposes; the beacon is
//! the per-epoch entropy every election derives its randomness from. The
//! production entropy source is the VRF beacon; the insecure backend
//! derives entropy from the epoch number alone and exists for networks and
//! tests where unbiasable entropy is not required.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_512};
use thiserror::Error as ThisError;
use tracing::info;

use crate::context::{Context, Mode};
use crate::genesis::Genesis as GenesisDocument;
use crate::keyformat::KeyFormat;
use crate::mkvs::{StateError, Tree};
use crate::types::{EpochTime, EPOCH_INVALID};

/// Application name.
pub const APP_NAME: &str = "beacon";

const BEACON_CONTEXT: &[u8] = b"eks-core/beacon: insecure";

#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    State(#[from] StateError),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::State(_))
    }
}

/// Entropy backend kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    /// Epoch-derived entropy; biasable, fine for tests and closed networks.
    #[default]
    Insecure,
    /// VRF-based unbiasable entropy.
    Vrf,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Parameters {
    pub backend: Backend,
    /// Blocks per epoch when the backend advances epochs by interval;
    /// zero disables interval-based advancement (epochs are then scheduled
    /// explicitly).
    pub epoch_interval: u64,
    /// Skips the committee-eligibility filter that normally applies under
    /// the VRF backend.
    pub debug_allow_weak_alpha: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Genesis {
    pub parameters: Parameters,
}

pub mod state {
    //! Beacon state accessors.
    //!
    //! | Tag | Key | Value |
    //! |-----|-----|-------|
    //! | 0x40 | — | current epoch |
    //! | 0x41 | — | beacon entropy bytes |
    //! | 0x42 | — | parameters |
    //! | 0x43 | — | base (genesis) epoch |
    //! | 0x44 | — | scheduled pending epoch |

    use super::*;
    use eks_common::codec;

    const CURRENT_EPOCH: KeyFormat = KeyFormat::new(0x40);
    const BEACON: KeyFormat = KeyFormat::new(0x41);
    const PARAMETERS: KeyFormat = KeyFormat::new(0x42);
    const BASE_EPOCH: KeyFormat = KeyFormat::new(0x43);
    const PENDING_EPOCH: KeyFormat = KeyFormat::new(0x44);

    fn decode<T: serde::de::DeserializeOwned>(raw: Vec<u8>) -> Result<T, StateError> {
        codec::from_slice(&raw).map_err(|e| StateError::Unavailable(e.to_string()))
    }

    pub fn current_epoch(tree: &dyn Tree) -> Result<EpochTime, StateError> {
        match tree.get(&CURRENT_EPOCH.prefix())? {
            Some(raw) => decode(raw),
            None => Ok(EPOCH_INVALID),
        }
    }

    pub fn base_epoch(tree: &dyn Tree) -> Result<EpochTime, StateError> {
        match tree.get(&BASE_EPOCH.prefix())? {
            Some(raw) => decode(raw),
            None => Ok(EPOCH_INVALID),
        }
    }

    /// The current entropy. Empty before the first epoch transition.
    pub fn beacon(tree: &dyn Tree) -> Result<Vec<u8>, StateError> {
        Ok(tree.get(&BEACON.prefix())?.unwrap_or_default())
    }

    pub fn parameters(tree: &dyn Tree) -> Result<Parameters, StateError> {
        match tree.get(&PARAMETERS.prefix())? {
            Some(raw) => decode(raw),
            None => Ok(Parameters::default()),
        }
    }

    pub fn set_parameters(ctx: &mut Context, params: &Parameters) -> Result<(), StateError> {
        ctx.ensure_mode(&[Mode::InitChain, Mode::EndBlock])?;
        ctx.tree_mut()
            .insert(&PARAMETERS.prefix(), &codec::to_vec(params))
    }

    pub(crate) fn set_current_epoch(tree: &mut dyn Tree, epoch: EpochTime) -> Result<(), StateError> {
        tree.insert(&CURRENT_EPOCH.prefix(), &codec::to_vec(&epoch))
    }

    pub(crate) fn set_base_epoch(tree: &mut dyn Tree, epoch: EpochTime) -> Result<(), StateError> {
        tree.insert(&BASE_EPOCH.prefix(), &codec::to_vec(&epoch))
    }

    pub(crate) fn set_beacon(tree: &mut dyn Tree, entropy: &[u8]) -> Result<(), StateError> {
        tree.insert(&BEACON.prefix(), entropy)
    }

    /// Schedules an epoch transition to be applied at the next BeginBlock.
    /// Used by the harness and by tests to drive epoch changes explicitly.
    pub fn schedule_epoch(tree: &mut dyn Tree, epoch: EpochTime) -> Result<(), StateError> {
        tree.insert(&PENDING_EPOCH.prefix(), &codec::to_vec(&epoch))
    }

    pub(super) fn take_pending_epoch(tree: &mut dyn Tree) -> Result<Option<EpochTime>, StateError> {
        let Some(raw) = tree.get(&PENDING_EPOCH.prefix())? else {
            return Ok(None);
        };
        tree.remove(&PENDING_EPOCH.prefix())?;
        Ok(Some(decode(raw)?))
    }
}

fn derive_entropy(previous: &[u8], epoch: EpochTime) -> Vec<u8> {
    let mut hasher = Sha3_512::new();
    hasher.update(BEACON_CONTEXT);
    hasher.update(previous);
    hasher.update(epoch.to_be_bytes());
    hasher.finalize()[..32].to_vec()
}

/// The beacon application. Blessed: epoch transitions must be visible to
/// every application processing the same block.
pub struct App;

impl crate::app::Application for App {
    fn name(&self) -> &'static str {
        APP_NAME
    }

    fn blessed(&self) -> bool {
        true
    }

    fn execute_tx(
        &self,
        _ctx: &mut Context,
        _bus: &crate::app::MessageBus,
        _tx: &crate::app::Transaction,
    ) -> Result<(), crate::Error> {
        Err(Error::State(StateError::InvariantViolation(
            "beacon: unexpected transaction".into(),
        ))
        .into())
    }

    fn init_chain(&self, ctx: &mut Context, genesis: &GenesisDocument) -> Result<(), crate::Error> {
        let params = genesis.beacon.parameters.clone();
        state::set_parameters(ctx, &params).map_err(Error::State)?;
        state::set_base_epoch(ctx.tree_mut(), genesis.base_epoch).map_err(Error::State)?;
        state::set_current_epoch(ctx.tree_mut(), genesis.base_epoch).map_err(Error::State)?;
        Ok(())
    }

    fn begin_block(&self, ctx: &mut Context, _bus: &crate::app::MessageBus) -> Result<(), crate::Error> {
        let params = state::parameters(ctx.tree()).map_err(Error::State)?;
        let current = state::current_epoch(ctx.tree()).map_err(Error::State)?;

        let mut next = state::take_pending_epoch(ctx.tree_mut()).map_err(Error::State)?;
        if next.is_none() && params.epoch_interval > 0 && ctx.block_height() > 0 {
            let base = state::base_epoch(ctx.tree()).map_err(Error::State)?;
            let by_interval = base + ctx.block_height() / params.epoch_interval;
            if by_interval != current {
                next = Some(by_interval);
            }
        }

        let Some(epoch) = next else {
            return Ok(());
        };
        if epoch == current {
            return Ok(());
        }

        let previous = state::beacon(ctx.tree()).map_err(Error::State)?;
        let entropy = derive_entropy(&previous, epoch);
        state::set_current_epoch(ctx.tree_mut(), epoch).map_err(Error::State)?;
        state::set_beacon(ctx.tree_mut(), &entropy).map_err(Error::State)?;
        ctx.block_mut().epoch_changed = true;

        info!(epoch, "epoch transition");
        Ok(())
    }
}
