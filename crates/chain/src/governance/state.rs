//! Governance state accessors.
//!
//! | Tag | Key parts | Value |
//! |-----|-----------|-------|
//! | 0x70 | — | next proposal identifier |
//! | 0x71 | proposal id (u64) | Proposal |
//! | 0x72 | closing epoch (u64), proposal id (u64) | (empty active index) |
//! | 0x73 | proposal id (u64), voter (21) | Vote |
//! | 0x74 | upgrade epoch (u64), proposal id (u64) | UpgradeDescriptor |
//! | 0x75 | — | Parameters |

use eks_common::{codec, Address};

use crate::context::{Context, Mode};
use crate::keyformat::KeyFormat;
use crate::mkvs::{StateError, Tree};
use crate::types::EpochTime;

use super::{Parameters, Proposal, ProposalState, UpgradeDescriptor, Vote, VoteEntry};

const NEXT_PROPOSAL_ID: KeyFormat = KeyFormat::new(0x70);
const PROPOSAL: KeyFormat = KeyFormat::new(0x71);
const ACTIVE_PROPOSAL: KeyFormat = KeyFormat::new(0x72);
const VOTE: KeyFormat = KeyFormat::new(0x73);
const PENDING_UPGRADE: KeyFormat = KeyFormat::new(0x74);
const PARAMETERS: KeyFormat = KeyFormat::new(0x75);

fn decode<T: serde::de::DeserializeOwned>(raw: Vec<u8>) -> Result<T, StateError> {
    codec::from_slice(&raw).map_err(|e| StateError::Unavailable(e.to_string()))
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

pub fn next_proposal_identifier(tree: &dyn Tree) -> Result<u64, StateError> {
    match tree.get(&NEXT_PROPOSAL_ID.prefix())? {
        Some(raw) => decode(raw),
        None => Ok(0),
    }
}

pub fn set_next_proposal_identifier(tree: &mut dyn Tree, id: u64) -> Result<(), StateError> {
    tree.insert(&NEXT_PROPOSAL_ID.prefix(), &codec::to_vec(&id))
}

pub fn proposal(tree: &dyn Tree, id: u64) -> Result<Option<Proposal>, StateError> {
    match tree.get(&PROPOSAL.key1(&id))? {
        Some(raw) => Ok(Some(decode(raw)?)),
        None => Ok(None),
    }
}

/// Stores a proposal, maintaining the active index: active proposals are
/// additionally indexed by closing epoch so closures need no full scan.
pub fn set_proposal(tree: &mut dyn Tree, proposal: &Proposal) -> Result<(), StateError> {
    tree.insert(&PROPOSAL.key1(&proposal.id), &codec::to_vec(proposal))?;
    let index_key = ACTIVE_PROPOSAL.key2(&proposal.closes_at, &proposal.id);
    if proposal.state == ProposalState::Active {
        tree.insert(&index_key, &[])
    } else {
        tree.remove(&index_key)
    }
}

/// All proposals, in identifier order.
pub fn proposals(tree: &dyn Tree) -> Result<Vec<Proposal>, StateError> {
    let mut out = Vec::new();
    for (key, value) in tree.iter_from(&PROPOSAL.prefix())? {
        if PROPOSAL.decode1::<u64>(&key).is_none() {
            break;
        }
        out.push(decode(value)?);
    }
    Ok(out)
}

/// Identifiers of active proposals closing at or before `epoch`.
pub fn proposals_closing_at(tree: &dyn Tree, epoch: EpochTime) -> Result<Vec<u64>, StateError> {
    let mut out = Vec::new();
    for (key, _) in tree.iter_from(&ACTIVE_PROPOSAL.prefix())? {
        let Some((closes_at, id)) = ACTIVE_PROPOSAL.decode2::<u64, u64>(&key) else {
            break;
        };
        if closes_at > epoch {
            break;
        }
        out.push(id);
    }
    Ok(out)
}

pub fn set_vote(
    tree: &mut dyn Tree,
    proposal_id: u64,
    voter: &Address,
    vote: Vote,
) -> Result<(), StateError> {
    tree.insert(&VOTE.key2(&proposal_id, voter), &codec::to_vec(&vote))
}

/// All votes for a proposal, in voter-address order.
pub fn votes(tree: &dyn Tree, proposal_id: u64) -> Result<Vec<VoteEntry>, StateError> {
    let mut out = Vec::new();
    for (key, value) in tree.iter_from(&VOTE.prefix1(&proposal_id))? {
        let Some((id, voter)) = VOTE.decode2::<u64, Address>(&key) else {
            break;
        };
        if id != proposal_id {
            break;
        }
        out.push(VoteEntry {
            voter,
            vote: decode(value)?,
        });
    }
    Ok(out)
}

pub fn set_pending_upgrade(
    tree: &mut dyn Tree,
    proposal_id: u64,
    descriptor: &UpgradeDescriptor,
) -> Result<(), StateError> {
    tree.insert(
        &PENDING_UPGRADE.key2(&descriptor.epoch, &proposal_id),
        &codec::to_vec(descriptor),
    )
}

pub fn remove_pending_upgrade(
    tree: &mut dyn Tree,
    epoch: EpochTime,
    proposal_id: u64,
) -> Result<(), StateError> {
    tree.remove(&PENDING_UPGRADE.key2(&epoch, &proposal_id))
}

/// All pending upgrades as `(proposal id, descriptor)`, in epoch order.
pub fn pending_upgrades(tree: &dyn Tree) -> Result<Vec<(u64, UpgradeDescriptor)>, StateError> {
    let mut out = Vec::new();
    for (key, value) in tree.iter_from(&PENDING_UPGRADE.prefix())? {
        let Some((_epoch, id)) = PENDING_UPGRADE.decode2::<u64, u64>(&key) else {
            break;
        };
        out.push((id, decode(value)?));
    }
    Ok(out)
}

/// Drops pending upgrades whose epoch has elapsed.
pub fn prune_pending_upgrades(tree: &mut dyn Tree, epoch: EpochTime) -> Result<(), StateError> {
    let mut stale = Vec::new();
    for (key, _) in tree.iter_from(&PENDING_UPGRADE.prefix())? {
        let Some((up_epoch, id)) = PENDING_UPGRADE.decode2::<u64, u64>(&key) else {
            break;
        };
        if up_epoch >= epoch {
            break;
        }
        stale.push((up_epoch, id));
    }
    for (up_epoch, id) in stale {
        remove_pending_upgrade(tree, up_epoch, id)?;
    }
    Ok(())
}
