//! Node and runtime registry state.
//!
//! The registry tracks registered nodes (roles, runtime versions, TEE
//! capabilities), their statuses (freezing, election eligibility, runtime
//! suspensions) and registered runtimes with their deployments. The
//! scheduler consumes all of it as election input; the staking application
//! freezes nodes here when slashing evidence arrives.

pub mod state;

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use eks_common::{codec, Address, PublicKey};

use crate::app::{Application, MessageBus, Transaction};
use crate::context::Context;
use crate::genesis::Genesis as GenesisDocument;
use crate::mkvs::StateError;
use crate::types::{EpochTime, Namespace, EPOCH_INVALID};

/// Application name.
pub const APP_NAME: &str = "registry";

/// Transaction methods.
pub const METHOD_UNFREEZE_NODE: &str = "registry.UnfreezeNode";

/// Freeze sentinel: the node can never be unfrozen.
pub const FREEZE_FOREVER: EpochTime = EPOCH_INVALID;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("registry: invalid argument")]
    InvalidArgument,

    #[error("registry: node not found")]
    NodeNotFound,

    #[error("registry: node cannot be unfrozen yet")]
    NodeCannotBeUnfrozen,

    #[error("registry: caller is not the node's entity")]
    NotEntityOwner,

    #[error(transparent)]
    State(#[from] StateError),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::State(_))
    }
}

/// Node role bitmask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RolesMask(pub u32);

impl RolesMask {
    pub const VALIDATOR: RolesMask = RolesMask(1 << 0);
    pub const COMPUTE_WORKER: RolesMask = RolesMask(1 << 1);

    pub fn has_roles(&self, roles: RolesMask) -> bool {
        self.0 & roles.0 == roles.0
    }

    pub fn union(self, other: RolesMask) -> RolesMask {
        RolesMask(self.0 | other.0)
    }
}

/// Trusted execution environment hardware kinds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeeHardware {
    #[default]
    Invalid,
    IntelSgx,
}

/// TEE feature flags from the registry consensus parameters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TeeFeatures {
    /// Attestations additionally carry a height bound that must cover the
    /// current block height.
    pub freshness_by_height: bool,
}

/// A node's attested TEE capability for one runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityTee {
    pub hardware: TeeHardware,
    /// The node the attestation is bound to.
    pub attested_node_id: PublicKey,
    /// Attestation expiry, unix seconds.
    pub valid_until_time: u64,
    /// Attestation expiry in block height, when height freshness is on.
    pub valid_until_height: u64,
}

impl CapabilityTee {
    /// Verifies the capability against the registry TEE features, the
    /// current block time and height, the active deployment's TEE metadata
    /// and the claiming node's identity.
    pub fn verify(
        &self,
        features: &TeeFeatures,
        now: u64,
        height: u64,
        deployment_tee: &[u8],
        node_id: &PublicKey,
    ) -> Result<(), Error> {
        if self.attested_node_id != *node_id {
            return Err(Error::InvalidArgument);
        }
        if deployment_tee.is_empty() {
            // The deployment requires a TEE but carries no policy to verify
            // against.
            return Err(Error::InvalidArgument);
        }
        if self.valid_until_time < now {
            return Err(Error::InvalidArgument);
        }
        if features.freshness_by_height && self.valid_until_height < height {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

/// A runtime a node has registered for, with the deployed version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRuntime {
    pub id: Namespace,
    pub version: u64,
    pub capability_tee: Option<CapabilityTee>,
}

/// A registered node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: PublicKey,
    pub entity_id: PublicKey,
    /// Key the node signs consensus votes with; the identifier of record
    /// for the validator set.
    pub consensus_id: PublicKey,
    pub roles: RolesMask,
    /// Last epoch the registration is valid for.
    pub expiration: EpochTime,
    pub runtimes: Vec<NodeRuntime>,
}

impl Node {
    pub fn is_expired(&self, epoch: EpochTime) -> bool {
        epoch > self.expiration
    }

    pub fn has_roles(&self, roles: RolesMask) -> bool {
        self.roles.has_roles(roles)
    }

    pub fn entity_address(&self) -> Address {
        Address::from_public_key(&self.entity_id)
    }
}

/// Registry-maintained node status.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Epoch the freeze ends at; zero means not frozen, [`FREEZE_FOREVER`]
    /// means permanently frozen.
    pub freeze_end_time: EpochTime,
    /// First epoch after which the node may be elected to committees.
    pub election_eligible_after: EpochTime,
    /// Runtimes the node is suspended for, with the suspension end epoch.
    pub suspended_runtimes: Vec<(Namespace, EpochTime)>,
}

impl NodeStatus {
    pub fn is_frozen(&self) -> bool {
        self.freeze_end_time > 0
    }

    pub fn is_suspended(&self, runtime: &Namespace, epoch: EpochTime) -> bool {
        self.suspended_runtimes
            .iter()
            .any(|(id, until)| id == runtime && epoch < *until)
    }

    pub fn unfreeze_at(&self) -> EpochTime {
        self.freeze_end_time
    }
}

/// A versioned runtime deployment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedDeployment {
    pub version: u64,
    /// First epoch the deployment is active in.
    pub valid_from: EpochTime,
    /// Opaque TEE policy for this deployment; empty when the runtime does
    /// not use a TEE.
    pub tee: Vec<u8>,
}

/// Executor committee sizing from the runtime descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorParameters {
    pub group_size: u16,
    pub group_backup_size: u16,
}

/// A registered runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runtime {
    pub id: Namespace,
    pub tee_hardware: TeeHardware,
    pub deployments: Vec<VersionedDeployment>,
    pub executor: ExecutorParameters,
    /// State root the runtime starts from, consumed by the roothash genesis
    /// block.
    pub genesis_state_root: crate::types::Hash,
}

impl Runtime {
    /// The deployment active at the given epoch: the newest deployment whose
    /// `valid_from` has been reached.
    pub fn active_deployment(&self, epoch: EpochTime) -> Option<&VersionedDeployment> {
        self.deployments
            .iter()
            .filter(|d| d.valid_from <= epoch)
            .max_by_key(|d| d.valid_from)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Parameters {
    pub tee_features: TeeFeatures,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Genesis {
    pub parameters: Parameters,
    pub nodes: Vec<Node>,
    pub node_statuses: Vec<(PublicKey, NodeStatus)>,
    pub runtimes: Vec<Runtime>,
    pub suspended_runtimes: Vec<Runtime>,
}

/// Typed registry events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    NodeFrozen { node_id: PublicKey },
    NodeUnfrozen { node_id: PublicKey },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::NodeFrozen { .. } => "node_frozen",
            Event::NodeUnfrozen { .. } => "node_unfrozen",
        }
    }
}

/// Body of `registry.UnfreezeNode`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnfreezeNode {
    pub node_id: PublicKey,
}

/// The registry application. Registration itself happens out of band; the
/// in-scope transaction surface is node unfreezing after a slashing freeze
/// has elapsed.
pub struct App;

impl Application for App {
    fn name(&self) -> &'static str {
        APP_NAME
    }

    fn methods(&self) -> Vec<&'static str> {
        vec![METHOD_UNFREEZE_NODE]
    }

    fn init_chain(&self, ctx: &mut Context, genesis: &GenesisDocument) -> Result<(), crate::Error> {
        let st = &genesis.registry;
        state::set_parameters(ctx, &st.parameters).map_err(Error::State)?;
        for node in &st.nodes {
            state::set_node(ctx.tree_mut(), node).map_err(Error::State)?;
        }
        for (node_id, status) in &st.node_statuses {
            state::set_node_status(ctx.tree_mut(), node_id, status).map_err(Error::State)?;
        }
        for runtime in &st.runtimes {
            state::set_runtime(ctx.tree_mut(), runtime, false).map_err(Error::State)?;
        }
        for runtime in &st.suspended_runtimes {
            state::set_runtime(ctx.tree_mut(), runtime, true).map_err(Error::State)?;
        }
        Ok(())
    }

    fn execute_tx(
        &self,
        ctx: &mut Context,
        _bus: &MessageBus,
        tx: &Transaction,
    ) -> Result<(), crate::Error> {
        match tx.method {
            METHOD_UNFREEZE_NODE => {
                let body: UnfreezeNode =
                    codec::from_slice(&tx.body).map_err(|_| Error::InvalidArgument)?;
                Ok(unfreeze_node(ctx, tx.signer, &body)?)
            }
            _ => Err(Error::InvalidArgument.into()),
        }
    }
}

fn unfreeze_node(ctx: &mut Context, signer: Address, body: &UnfreezeNode) -> Result<(), Error> {
    let node = state::node(ctx.tree(), &body.node_id)?.ok_or(Error::NodeNotFound)?;
    if node.entity_address() != signer {
        return Err(Error::NotEntityOwner);
    }

    let mut status = state::node_status(ctx.tree(), &body.node_id)?;
    if !status.is_frozen() {
        return Ok(());
    }

    let epoch = crate::beacon::state::current_epoch(ctx.tree())?;
    if status.freeze_end_time == FREEZE_FOREVER || epoch < status.freeze_end_time {
        return Err(Error::NodeCannotBeUnfrozen);
    }

    status.freeze_end_time = 0;
    state::set_node_status(ctx.tree_mut(), &body.node_id, &status)?;
    ctx.emit_event(Event::NodeUnfrozen { node_id: body.node_id }.into());
    Ok(())
}
