//! Registry state accessors.
//!
//! | Tag | Key parts | Value |
//! |-----|-----------|-------|
//! | 0x10 | node id (32) | Node |
//! | 0x11 | node id (32) | NodeStatus |
//! | 0x12 | runtime id (32) | Runtime |
//! | 0x13 | runtime id (32) | Runtime (suspended) |
//! | 0x14 | — | Parameters |
//! | 0x15 | consensus key (32) | node id |

use eks_common::codec;
use eks_common::PublicKey;

use crate::context::{Context, Mode};
use crate::keyformat::KeyFormat;
use crate::mkvs::{StateError, Tree};
use crate::types::{EpochTime, Namespace};

use super::{Node, NodeStatus, Parameters, Runtime};

const NODE: KeyFormat = KeyFormat::new(0x10);
const NODE_STATUS: KeyFormat = KeyFormat::new(0x11);
const RUNTIME: KeyFormat = KeyFormat::new(0x12);
const SUSPENDED_RUNTIME: KeyFormat = KeyFormat::new(0x13);
const PARAMETERS: KeyFormat = KeyFormat::new(0x14);
const NODE_BY_CONSENSUS_KEY: KeyFormat = KeyFormat::new(0x15);

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

pub fn node(tree: &dyn Tree, id: &PublicKey) -> Result<Option<Node>, StateError> {
    match tree.get(&NODE.key1(id))? {
        Some(raw) => Ok(Some(decode(raw)?)),
        None => Ok(None),
    }
}

pub fn set_node(tree: &mut dyn Tree, node: &Node) -> Result<(), StateError> {
    tree.insert(&NODE.key1(&node.id), &codec::to_vec(node))?;
    tree.insert(
        &NODE_BY_CONSENSUS_KEY.key1(&node.consensus_id),
        &codec::to_vec(&node.id),
    )
}

/// Removes a node's registration along with its consensus-key index entry.
pub fn remove_node(tree: &mut dyn Tree, id: &PublicKey) -> Result<(), StateError> {
    if let Some(existing) = node(tree, id)? {
        tree.remove(&NODE_BY_CONSENSUS_KEY.key1(&existing.consensus_id))?;
    }
    tree.remove(&NODE.key1(id))
}

/// All registered nodes, in node-id order.
pub fn nodes(tree: &dyn Tree) -> Result<Vec<Node>, StateError> {
    let mut out = Vec::new();
    for (key, value) in tree.iter_from(&NODE.prefix())? {
        if NODE.decode1::<PublicKey>(&key).is_none() {
            break;
        }
        out.push(decode(value)?);
    }
    Ok(out)
}

/// A node's status; absent status decodes as the default (not frozen,
/// always eligible).
pub fn node_status(tree: &dyn Tree, id: &PublicKey) -> Result<NodeStatus, StateError> {
    match tree.get(&NODE_STATUS.key1(id))? {
        Some(raw) => decode(raw),
        None => Ok(NodeStatus::default()),
    }
}

pub fn set_node_status(
    tree: &mut dyn Tree,
    id: &PublicKey,
    status: &NodeStatus,
) -> Result<(), StateError> {
    tree.insert(&NODE_STATUS.key1(id), &codec::to_vec(status))
}

/// Looks up a node by the consensus key it votes with.
pub fn node_by_consensus_key(
    tree: &dyn Tree,
    consensus_key: &PublicKey,
) -> Result<Option<Node>, StateError> {
    let Some(raw) = tree.get(&NODE_BY_CONSENSUS_KEY.key1(consensus_key))? else {
        return Ok(None);
    };
    let id: PublicKey = decode(raw)?;
    node(tree, &id)
}

pub fn runtime(tree: &dyn Tree, id: &Namespace) -> Result<Option<Runtime>, StateError> {
    match tree.get(&RUNTIME.key1(id))? {
        Some(raw) => Ok(Some(decode(raw)?)),
        None => Ok(None),
    }
}

pub fn set_runtime(tree: &mut dyn Tree, runtime: &Runtime, suspended: bool) -> Result<(), StateError> {
    let fmt = if suspended { SUSPENDED_RUNTIME } else { RUNTIME };
    tree.insert(&fmt.key1(&runtime.id), &codec::to_vec(runtime))
}

fn runtime_list(tree: &dyn Tree, fmt: KeyFormat) -> Result<Vec<Runtime>, StateError> {
    let mut out = Vec::new();
    for (key, value) in tree.iter_from(&fmt.prefix())? {
        if fmt.decode1::<Namespace>(&key).is_none() {
            break;
        }
        out.push(decode(value)?);
    }
    Ok(out)
}

/// All active runtimes, in runtime-id order.
pub fn runtimes(tree: &dyn Tree) -> Result<Vec<Runtime>, StateError> {
    runtime_list(tree, RUNTIME)
}

/// All suspended runtimes, in runtime-id order.
pub fn suspended_runtimes(tree: &dyn Tree) -> Result<Vec<Runtime>, StateError> {
    runtime_list(tree, SUSPENDED_RUNTIME)
}

/// Freezes a node until the given epoch (or [`super::FREEZE_FOREVER`]).
pub fn freeze_node(
    tree: &mut dyn Tree,
    id: &PublicKey,
    freeze_end_time: EpochTime,
) -> Result<(), StateError> {
    let mut status = node_status(tree, id)?;
    status.freeze_end_time = freeze_end_time;
    set_node_status(tree, id, &status)
}
