//! Scheduler state accessors.
//!
//! | Tag | Key parts | Value |
//! |-----|-----------|-------|
//! | 0x60 | — | current validators (by consensus key) |
//! | 0x61 | — | pending validators (by consensus key) |
//! | 0x62 | — | Parameters |
//! | 0x63 | kind (u64), runtime id (32) | Committee |

use std::collections::BTreeMap;

use eks_common::{codec, PublicKey};

use crate::context::{Context, Mode};
use crate::keyformat::KeyFormat;
use crate::mkvs::{StateError, Tree};
use crate::types::Namespace;

use super::{Committee, CommitteeKind, Parameters, Validator};

const CURRENT_VALIDATORS: KeyFormat = KeyFormat::new(0x60);
const PENDING_VALIDATORS: KeyFormat = KeyFormat::new(0x61);
const PARAMETERS: KeyFormat = KeyFormat::new(0x62);
const COMMITTEE: KeyFormat = KeyFormat::new(0x63);

/// A validator set keyed by consensus public key.
pub type ValidatorSet = BTreeMap<PublicKey, Validator>;

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

pub fn current_validators(tree: &dyn Tree) -> Result<ValidatorSet, StateError> {
    match tree.get(&CURRENT_VALIDATORS.prefix())? {
        Some(raw) => decode(raw),
        None => Ok(ValidatorSet::new()),
    }
}

pub fn put_current_validators(tree: &mut dyn Tree, set: &ValidatorSet) -> Result<(), StateError> {
    tree.insert(&CURRENT_VALIDATORS.prefix(), &codec::to_vec(set))
}

/// The staged validator set awaiting the EndBlock diff; `None` when no
/// election ran this block.
pub fn pending_validators(tree: &dyn Tree) -> Result<Option<ValidatorSet>, StateError> {
    match tree.get(&PENDING_VALIDATORS.prefix())? {
        Some(raw) => Ok(Some(decode(raw)?)),
        None => Ok(None),
    }
}

pub fn put_pending_validators(
    tree: &mut dyn Tree,
    set: Option<&ValidatorSet>,
) -> Result<(), StateError> {
    match set {
        Some(set) => tree.insert(&PENDING_VALIDATORS.prefix(), &codec::to_vec(set)),
        None => tree.remove(&PENDING_VALIDATORS.prefix()),
    }
}

fn committee_key(kind: CommitteeKind, runtime_id: &Namespace) -> Vec<u8> {
    COMMITTEE.key2(&(kind as u64), runtime_id)
}

pub fn committee(
    tree: &dyn Tree,
    kind: CommitteeKind,
    runtime_id: &Namespace,
) -> Result<Option<Committee>, StateError> {
    match tree.get(&committee_key(kind, runtime_id))? {
        Some(raw) => Ok(Some(decode(raw)?)),
        None => Ok(None),
    }
}

pub fn set_committee(
    tree: &mut dyn Tree,
    committee: &Committee,
) -> Result<(), StateError> {
    tree.insert(
        &committee_key(committee.kind, &committee.runtime_id),
        &codec::to_vec(committee),
    )
}

pub fn remove_committee(
    tree: &mut dyn Tree,
    kind: CommitteeKind,
    runtime_id: &Namespace,
) -> Result<(), StateError> {
    tree.remove(&committee_key(kind, runtime_id))
}
