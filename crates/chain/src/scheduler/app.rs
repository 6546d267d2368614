//! The scheduler application.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use eks_common::drbg::Drbg;
use eks_common::{codec, Address, Quantity};

use crate::app::{
    Application, Message, MessageBus, MessageKind, MessageResult, Transaction, ValidatorUpdate,
};
use crate::beacon;
use crate::context::Context;
use crate::genesis::Genesis as GenesisDocument;
use crate::registry::{self, Node, NodeStatus, RolesMask, Runtime, TeeHardware};
use crate::staking::{self, ThresholdKind};
use crate::types::EpochTime;

use super::state::{self, ValidatorSet};
use super::{
    voting_power_from_stake, Committee, CommitteeKind, CommitteeNode, Error, Event, ParameterChanges,
    Parameters, Role, Validator, APP_NAME, RNG_CONTEXT_ENTITIES, RNG_CONTEXT_EXECUTOR,
    RNG_CONTEXT_VALIDATORS,
};

/// The scheduler application. Blessed: committee elections must complete
/// before the dependent applications process the same block.
pub struct App;

impl Application for App {
    fn name(&self) -> &'static str {
        APP_NAME
    }

    fn blessed(&self) -> bool {
        true
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![beacon::APP_NAME, registry::APP_NAME, staking::APP_NAME]
    }

    fn subscriptions(&self) -> Vec<MessageKind> {
        vec![
            MessageKind::ValidateParameterChanges,
            MessageKind::ChangeParameters,
        ]
    }

    fn init_chain(&self, ctx: &mut Context, genesis: &GenesisDocument) -> Result<(), crate::Error> {
        let st = &genesis.scheduler;
        if let Some(params) = &st.parameters {
            state::set_parameters(ctx, params).map_err(Error::State)?;
        }

        let mut validators = ValidatorSet::new();
        for v in &st.validators {
            validators.insert(
                v.consensus_key,
                Validator {
                    id: v.node_id,
                    entity_id: v.entity_id,
                    voting_power: v.voting_power,
                },
            );
        }
        state::put_current_validators(ctx.tree_mut(), &validators).map_err(Error::State)?;
        Ok(())
    }

    fn begin_block(&self, ctx: &mut Context, bus: &MessageBus) -> Result<(), crate::Error> {
        // Elections run on epoch transitions and whenever stake was slashed
        // in this block, which can change validator power mid-epoch. Slashing
        // performed by transactions cannot trigger this: only BeginBlock
        // evidence handling precedes us.
        let slashed = ctx.has_event(staking::EVENT_KIND_TAKE_ESCROW);
        let epoch_changed = ctx.block().epoch_changed;
        if !epoch_changed && !slashed {
            return Ok(());
        }

        let epoch = beacon::state::current_epoch(ctx.tree()).map_err(Error::State)?;

        bus.publish(ctx, &Message::BeforeSchedule { epoch })?;

        // The base epoch has neither election entropy nor useful node
        // registrations.
        let base_epoch = beacon::state::base_epoch(ctx.tree()).map_err(Error::State)?;
        if epoch == base_epoch {
            info!(epoch, "system in bootstrap period, skipping election");
            return Ok(());
        }

        let params = state::parameters(ctx.tree()).map_err(Error::State)?;
        let beacon_params = beacon::state::parameters(ctx.tree()).map_err(Error::State)?;
        let entropy = beacon::state::beacon(ctx.tree()).map_err(Error::State)?;

        // Under the VRF beacon, committee membership additionally requires
        // that the node passed its eligibility epoch.
        let filter_committee_nodes = beacon_params.backend == beacon::Backend::Vrf
            && !beacon_params.debug_allow_weak_alpha;

        let registry_params = registry::state::parameters(ctx.tree()).map_err(Error::State)?;
        let runtimes = registry::state::runtimes(ctx.tree()).map_err(Error::State)?;
        let all_nodes = registry::state::nodes(ctx.tree()).map_err(Error::State)?;

        let mut nodes = Vec::new();
        let mut committee_nodes = Vec::new();
        for node in all_nodes {
            let status = registry::state::node_status(ctx.tree(), &node.id).map_err(Error::State)?;
            if status.is_frozen() || node.is_expired(epoch) {
                continue;
            }
            if !filter_committee_nodes || epoch > status.election_eligible_after {
                committee_nodes.push((node.clone(), status));
            }
            nodes.push(node);
        }

        let mut stake_acc = if params.debug_bypass_stake {
            None
        } else {
            Some(StakeAccumulatorCache::new(ctx.tree(), &nodes)?)
        };

        // Entities with any elected node collect the election reward, but
        // only for epoch-change elections.
        let mut reward_entities: Option<BTreeSet<Address>> =
            if epoch_changed { Some(BTreeSet::new()) } else { None };

        // Validator election first: failing it is catastrophic, while a
        // failed compute committee is not.
        elect_validators(
            ctx,
            &entropy,
            &mut stake_acc,
            &mut reward_entities,
            &nodes,
            &params,
        )?;

        let kinds = vec![CommitteeKind::ComputeExecutor];
        for kind in &kinds {
            for runtime in &runtimes {
                elect_committee(
                    ctx,
                    &entropy,
                    epoch,
                    &registry_params,
                    &mut stake_acc,
                    &mut reward_entities,
                    runtime,
                    &committee_nodes,
                    *kind,
                )?;
            }
        }
        ctx.emit_event(Event::Elected { kinds }.into());

        debug!(epoch, runtimes = runtimes.len(), "finished electing committees");

        if let Some(entities) = reward_entities {
            if !entities.is_empty() && !params.reward_factor_epoch_election_any.is_zero() {
                let addresses: Vec<Address> = entities.into_iter().collect();
                staking::state::add_rewards(
                    ctx,
                    epoch,
                    &params.reward_factor_epoch_election_any,
                    &addresses,
                )
                .map_err(crate::Error::Staking)?;
            }
        }

        Ok(())
    }

    fn execute_tx(
        &self,
        _ctx: &mut Context,
        _bus: &MessageBus,
        _tx: &Transaction,
    ) -> Result<(), crate::Error> {
        Err(Error::InvalidArgument.into())
    }

    fn execute_message(
        &self,
        ctx: &mut Context,
        _bus: &MessageBus,
        msg: &Message,
    ) -> Result<Option<MessageResult>, crate::Error> {
        match msg {
            Message::ValidateParameterChanges(m) => {
                if m.module != APP_NAME {
                    return Ok(None);
                }
                let changes: ParameterChanges =
                    codec::from_slice(&m.changes).map_err(|_| Error::InvalidArgument)?;
                changes.validate()?;
                Ok(Some(MessageResult::ParametersValidated {
                    module: APP_NAME.into(),
                }))
            }
            Message::ChangeParameters(m) => {
                if m.module != APP_NAME {
                    return Ok(None);
                }
                let changes: ParameterChanges =
                    codec::from_slice(&m.changes).map_err(|_| Error::InvalidArgument)?;
                changes.validate()?;
                let mut params = state::parameters(ctx.tree()).map_err(Error::State)?;
                changes.apply(&mut params);
                state::set_parameters(ctx, &params).map_err(Error::State)?;
                Ok(Some(MessageResult::ParametersChanged {
                    module: APP_NAME.into(),
                }))
            }
            _ => Err(Error::InvalidArgument.into()),
        }
    }

    fn end_block(
        &self,
        ctx: &mut Context,
        _bus: &MessageBus,
    ) -> Result<Vec<ValidatorUpdate>, crate::Error> {
        let Some(pending) = state::pending_validators(ctx.tree()).map_err(Error::State)? else {
            return Ok(Vec::new());
        };
        let current = state::current_validators(ctx.tree()).map_err(Error::State)?;

        state::put_pending_validators(ctx.tree_mut(), None).map_err(Error::State)?;

        let updates = diff_validators(&current, &pending);

        state::put_current_validators(ctx.tree_mut(), &pending).map_err(Error::State)?;
        Ok(updates)
    }
}

/// Diffs two validator sets into the update list the consensus engine
/// applies: power 0 removes, upserts add or change power, identical power
/// is silently kept.
///
/// A validator whose consensus key keeps the same power is reported as
/// unchanged even if the node id behind it changed; consensus keys are the
/// identifier of record here.
pub(super) fn diff_validators(current: &ValidatorSet, pending: &ValidatorSet) -> Vec<ValidatorUpdate> {
    let mut updates = Vec::new();
    for key in current.keys() {
        if !pending.contains_key(key) {
            debug!(id = %key, "removing existing validator from validator set");
            updates.push(ValidatorUpdate {
                consensus_key: *key,
                power: 0,
            });
        }
    }

    for (key, validator) in pending {
        if let Some(existing) = current.get(key) {
            if existing.voting_power == validator.voting_power {
                continue;
            }
        }
        debug!(id = %key, power = validator.voting_power, "upserting validator to validator set");
        updates.push(ValidatorUpdate {
            consensus_key: *key,
            power: validator.voting_power,
        });
    }
    updates
}

/// Per-election cache of entity escrow balances and stake-claim checks.
pub(super) struct StakeAccumulatorCache {
    balances: BTreeMap<Address, Quantity>,
    /// Number of registered validator-capable nodes per entity.
    node_counts: BTreeMap<Address, u64>,
    entity_threshold: Quantity,
    validator_threshold: Quantity,
}

impl StakeAccumulatorCache {
    pub(super) fn new(
        tree: &dyn crate::mkvs::Tree,
        nodes: &[Node],
    ) -> Result<Self, Error> {
        let params = staking::state::parameters(tree)?;
        let mut node_counts: BTreeMap<Address, u64> = BTreeMap::new();
        for node in nodes {
            if node.has_roles(RolesMask::VALIDATOR) {
                *node_counts.entry(node.entity_address()).or_insert(0) += 1;
            }
        }
        Ok(StakeAccumulatorCache {
            balances: BTreeMap::new(),
            node_counts,
            entity_threshold: params
                .thresholds
                .get(&ThresholdKind::Entity)
                .copied()
                .unwrap_or(Quantity::ZERO),
            validator_threshold: params
                .thresholds
                .get(&ThresholdKind::NodeValidator)
                .copied()
                .unwrap_or(Quantity::ZERO),
        })
    }

    pub(super) fn escrow_balance(
        &mut self,
        tree: &dyn crate::mkvs::Tree,
        addr: &Address,
    ) -> Result<Quantity, Error> {
        if let Some(balance) = self.balances.get(addr) {
            return Ok(*balance);
        }
        let balance = staking::state::account(tree, addr)?.escrow.active.balance;
        self.balances.insert(*addr, balance);
        Ok(balance)
    }

    /// Whether the entity's active escrow covers its registration claims:
    /// the entity threshold plus one validator threshold per registered
    /// validator node.
    pub(super) fn check_stake_claims(
        &mut self,
        tree: &dyn crate::mkvs::Tree,
        addr: &Address,
    ) -> Result<bool, Error> {
        let mut required = self.entity_threshold;
        let node_count = self.node_counts.get(addr).copied().unwrap_or(0);
        let mut per_node = self.validator_threshold;
        per_node.mul(&Quantity::from(node_count))?;
        required.add(&per_node)?;

        Ok(self.escrow_balance(tree, addr)? >= required)
    }
}

pub(super) fn elect_validators(
    ctx: &mut Context,
    entropy: &[u8],
    stake_acc: &mut Option<StakeAccumulatorCache>,
    reward_entities: &mut Option<BTreeSet<Address>>,
    nodes: &[Node],
    params: &Parameters,
) -> Result<(), Error> {
    // Filter by role and by the entity's stake claims.
    let mut node_list: Vec<&Node> = Vec::new();
    let mut entities: BTreeSet<Address> = BTreeSet::new();
    for node in nodes {
        if !node.has_roles(RolesMask::VALIDATOR) {
            continue;
        }
        let entity_addr = node.entity_address();
        if let Some(acc) = stake_acc.as_mut() {
            if !acc.check_stake_claims(ctx.tree(), &entity_addr)? {
                continue;
            }
        }
        node_list.push(node);
        entities.insert(entity_addr);
    }

    let sorted_entities = entities_by_descending_stake(ctx, entropy, entities, stake_acc)?;

    // Shuffle the node list; within an entity the node order is the shuffle
    // order.
    let perm = Drbg::new(entropy, &[0u8; 32], RNG_CONTEXT_VALIDATORS).permutation(node_list.len());
    let mut entity_nodes: BTreeMap<Address, Vec<&Node>> = BTreeMap::new();
    for idx in perm {
        let node = node_list[idx];
        entity_nodes
            .entry(node.entity_address())
            .or_default()
            .push(node);
    }

    // Walk entities by stake, picking nodes until the set is full.
    let mut new_validators = ValidatorSet::new();
    'elect: for entity_addr in &sorted_entities {
        let Some(nodes) = entity_nodes.get(entity_addr) else {
            continue;
        };
        for node in nodes.iter().take(params.max_validators_per_entity) {
            let power = match stake_acc.as_mut() {
                // Simplified no-stake deployments get flat voting power.
                None => 1,
                Some(acc) => {
                    let stake = acc.escrow_balance(ctx.tree(), entity_addr)?;
                    voting_power_from_stake(&stake, params.voting_power_distribution).map_err(
                        |e| {
                            Error::ValidatorElectionFailed(format!(
                                "computing voting power for {entity_addr}: {e}"
                            ))
                        },
                    )?
                }
            };

            if let Some(reward) = reward_entities.as_mut() {
                reward.insert(*entity_addr);
            }
            new_validators.insert(
                node.consensus_id,
                Validator {
                    id: node.id,
                    entity_id: node.entity_id,
                    voting_power: power,
                },
            );
            if new_validators.len() >= params.max_validators {
                break 'elect;
            }
        }
    }

    if new_validators.is_empty() {
        return Err(Error::ValidatorElectionFailed(
            "failed to elect any validators".into(),
        ));
    }
    if new_validators.len() < params.min_validators {
        return Err(Error::ValidatorElectionFailed(format!(
            "insufficient validators: {} < {}",
            new_validators.len(),
            params.min_validators
        )));
    }

    state::put_pending_validators(ctx.tree_mut(), Some(&new_validators))?;
    Ok(())
}

/// Orders entity addresses by descending escrow balance, breaking ties with
/// a beacon-seeded shuffle over the lexicographically sorted addresses.
pub(super) fn entities_by_descending_stake(
    ctx: &Context,
    entropy: &[u8],
    entities: BTreeSet<Address>,
    stake_acc: &mut Option<StakeAccumulatorCache>,
) -> Result<Vec<Address>, Error> {
    let mut list: Vec<Address> = entities.into_iter().collect();

    Drbg::new(entropy, &[], RNG_CONTEXT_ENTITIES).shuffle(&mut list);

    let Some(acc) = stake_acc.as_mut() else {
        return Ok(list);
    };

    let mut balances = BTreeMap::new();
    for addr in &list {
        balances.insert(*addr, acc.escrow_balance(ctx.tree(), addr)?);
    }
    // Stable sort keeps the shuffled order among equal balances.
    list.sort_by(|a, b| balances[b].cmp(&balances[a]));
    Ok(list)
}

fn is_suitable_executor_worker(
    ctx: &Context,
    node: &Node,
    status: &NodeStatus,
    runtime: &Runtime,
    epoch: EpochTime,
    registry_params: &registry::Parameters,
) -> bool {
    if !node.has_roles(RolesMask::COMPUTE_WORKER) {
        return false;
    }
    let Some(deployment) = runtime.active_deployment(epoch) else {
        return false;
    };

    for node_rt in &node.runtimes {
        if node_rt.id != runtime.id {
            continue;
        }
        if node_rt.version != deployment.version {
            continue;
        }
        if status.is_suspended(&runtime.id, epoch) {
            return false;
        }
        match runtime.tee_hardware {
            TeeHardware::Invalid => {
                return node_rt.capability_tee.is_none();
            }
            _ => {
                let Some(capability) = &node_rt.capability_tee else {
                    return false;
                };
                if capability.hardware != runtime.tee_hardware {
                    return false;
                }
                if let Err(err) = capability.verify(
                    &registry_params.tee_features,
                    ctx.now(),
                    ctx.block_height(),
                    &deployment.tee,
                    &node.id,
                ) {
                    warn!(
                        %err,
                        node_id = %node.id,
                        runtime = %runtime.id,
                        "failed to verify node TEE attestation"
                    );
                    return false;
                }
                return true;
            }
        }
    }
    false
}

#[allow(clippy::too_many_arguments)]
pub(super) fn elect_committee(
    ctx: &mut Context,
    entropy: &[u8],
    epoch: EpochTime,
    registry_params: &registry::Parameters,
    stake_acc: &mut Option<StakeAccumulatorCache>,
    reward_entities: &mut Option<BTreeSet<Address>>,
    runtime: &Runtime,
    nodes: &[(Node, NodeStatus)],
    kind: CommitteeKind,
) -> Result<(), Error> {
    let workers = runtime.executor.group_size as usize;
    let backups = runtime.executor.group_backup_size as usize;
    if workers == 0 {
        state::remove_committee(ctx.tree_mut(), kind, &runtime.id)?;
        return Ok(());
    }

    let mut eligible: Vec<&Node> = Vec::new();
    for (node, status) in nodes {
        if !is_suitable_executor_worker(ctx, node, status, runtime, epoch, registry_params) {
            continue;
        }
        if let Some(acc) = stake_acc.as_mut() {
            if !acc.check_stake_claims(ctx.tree(), &node.entity_address())? {
                continue;
            }
        }
        eligible.push(node);
    }

    if eligible.len() < workers + backups {
        // A missing compute committee only idles one runtime; it must never
        // take down consensus.
        warn!(
            runtime = %runtime.id,
            eligible = eligible.len(),
            required = workers + backups,
            "insufficient eligible nodes, skipping committee election"
        );
        state::remove_committee(ctx.tree_mut(), kind, &runtime.id)?;
        return Ok(());
    }

    let perm = Drbg::new(entropy, runtime.id.as_bytes(), RNG_CONTEXT_EXECUTOR)
        .permutation(eligible.len());

    // Workers take the first range of the permutation, backups the next;
    // the ranges are disjoint by construction.
    let mut members = Vec::with_capacity(workers + backups);
    for (pos, &idx) in perm.iter().take(workers + backups).enumerate() {
        let node = eligible[idx];
        let role = if pos < workers {
            Role::Worker
        } else {
            Role::BackupWorker
        };
        members.push(CommitteeNode {
            role,
            node_id: node.id,
        });
        if let Some(reward) = reward_entities.as_mut() {
            reward.insert(node.entity_address());
        }
    }

    state::set_committee(
        ctx.tree_mut(),
        &Committee {
            kind,
            runtime_id: runtime.id,
            members,
            valid_for: epoch,
        },
    )?;
    Ok(())
}
