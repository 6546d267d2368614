//! Roothash state accessors.
//!
//! | Tag | Key parts | Value |
//! |-----|-----------|-------|
//! | 0x20 | runtime id (32) | RuntimeState |
//! | 0x21 | — | Parameters |
//! | 0x22 | runtime id (32), round (u64) | RoundRoots |
//! | 0x23 | runtime id (32) | IncomingMessageQueueMeta |
//! | 0x24 | runtime id (32), message id (u64) | IncomingMessage |
//! | 0x25 | runtime id (32) | RoundResults |

use std::collections::BTreeMap;

use eks_common::codec;

use crate::context::{Context, Mode};
use crate::keyformat::KeyFormat;
use crate::mkvs::{StateError, Tree};
use crate::types::Namespace;

use super::{
    IncomingMessage, IncomingMessageQueueMeta, Parameters, RoundResults, RoundRoots, RuntimeState,
};

const RUNTIME_STATE: KeyFormat = KeyFormat::new(0x20);
const PARAMETERS: KeyFormat = KeyFormat::new(0x21);
const ROUND_ROOTS: KeyFormat = KeyFormat::new(0x22);
const IN_MSG_QUEUE_META: KeyFormat = KeyFormat::new(0x23);
const IN_MSG: KeyFormat = KeyFormat::new(0x24);
const LAST_ROUND_RESULTS: KeyFormat = KeyFormat::new(0x25);

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

pub fn runtime_state(tree: &dyn Tree, id: &Namespace) -> Result<Option<RuntimeState>, StateError> {
    match tree.get(&RUNTIME_STATE.key1(id))? {
        Some(raw) => Ok(Some(decode(raw)?)),
        None => Ok(None),
    }
}

pub fn set_runtime_state(tree: &mut dyn Tree, state: &RuntimeState) -> Result<(), StateError> {
    tree.insert(&RUNTIME_STATE.key1(&state.runtime.id), &codec::to_vec(state))
}

/// All per-runtime states, in runtime-id order.
pub fn runtime_states(tree: &dyn Tree) -> Result<Vec<RuntimeState>, StateError> {
    let mut out = Vec::new();
    for (key, value) in tree.iter_from(&RUNTIME_STATE.prefix())? {
        if RUNTIME_STATE.decode1::<Namespace>(&key).is_none() {
            break;
        }
        out.push(decode(value)?);
    }
    Ok(out)
}

pub fn round_roots(
    tree: &dyn Tree,
    id: &Namespace,
    round: u64,
) -> Result<Option<RoundRoots>, StateError> {
    match tree.get(&ROUND_ROOTS.key2(id, &round))? {
        Some(raw) => Ok(Some(decode(raw)?)),
        None => Ok(None),
    }
}

pub fn set_round_roots(
    tree: &mut dyn Tree,
    id: &Namespace,
    round: u64,
    roots: &RoundRoots,
) -> Result<(), StateError> {
    tree.insert(&ROUND_ROOTS.key2(id, &round), &codec::to_vec(roots))
}

/// The bounded history of past round roots, in round order.
pub fn past_round_roots(
    tree: &dyn Tree,
    id: &Namespace,
) -> Result<BTreeMap<u64, RoundRoots>, StateError> {
    let mut out = BTreeMap::new();
    for (key, value) in tree.iter_from(&ROUND_ROOTS.prefix1(id))? {
        let Some((dec_id, round)) = ROUND_ROOTS.decode2::<Namespace, u64>(&key) else {
            break;
        };
        if dec_id != *id {
            break;
        }
        out.insert(round, decode(value)?);
    }
    Ok(out)
}

/// Evicts the oldest round roots so at most `keep` remain.
pub fn prune_round_roots(tree: &mut dyn Tree, id: &Namespace, keep: u64) -> Result<(), StateError> {
    let existing = past_round_roots(tree, id)?;
    let excess = (existing.len() as u64).saturating_sub(keep);
    for round in existing.keys().take(excess as usize) {
        tree.remove(&ROUND_ROOTS.key2(id, round))?;
    }
    Ok(())
}

pub fn last_round_results(tree: &dyn Tree, id: &Namespace) -> Result<RoundResults, StateError> {
    match tree.get(&LAST_ROUND_RESULTS.key1(id))? {
        Some(raw) => decode(raw),
        None => Ok(RoundResults::default()),
    }
}

pub fn set_last_round_results(
    tree: &mut dyn Tree,
    id: &Namespace,
    results: &RoundResults,
) -> Result<(), StateError> {
    tree.insert(&LAST_ROUND_RESULTS.key1(id), &codec::to_vec(results))
}

pub fn in_msg_queue_meta(
    tree: &dyn Tree,
    id: &Namespace,
) -> Result<IncomingMessageQueueMeta, StateError> {
    match tree.get(&IN_MSG_QUEUE_META.key1(id))? {
        Some(raw) => decode(raw),
        None => Ok(IncomingMessageQueueMeta::default()),
    }
}

pub fn set_in_msg_queue_meta(
    tree: &mut dyn Tree,
    id: &Namespace,
    meta: &IncomingMessageQueueMeta,
) -> Result<(), StateError> {
    tree.insert(&IN_MSG_QUEUE_META.key1(id), &codec::to_vec(meta))
}

pub fn set_in_msg(
    tree: &mut dyn Tree,
    id: &Namespace,
    msg: &IncomingMessage,
) -> Result<(), StateError> {
    tree.insert(&IN_MSG.key2(id, &msg.id), &codec::to_vec(msg))
}

pub fn remove_in_msg(tree: &mut dyn Tree, id: &Namespace, msg_id: u64) -> Result<(), StateError> {
    tree.remove(&IN_MSG.key2(id, &msg_id))
}

/// Queued messages with id >= `offset`, up to `limit` (zero: no limit), in
/// id order.
pub fn in_msg_queue(
    tree: &dyn Tree,
    id: &Namespace,
    offset: u64,
    limit: u32,
) -> Result<Vec<IncomingMessage>, StateError> {
    let mut out = Vec::new();
    for (key, value) in tree.iter_from(&IN_MSG.key2(id, &offset))? {
        let Some((dec_id, _msg_id)) = IN_MSG.decode2::<Namespace, u64>(&key) else {
            break;
        };
        if dec_id != *id {
            break;
        }
        out.push(decode(value)?);
        if limit > 0 && out.len() as u32 >= limit {
            break;
        }
    }
    Ok(out)
}
