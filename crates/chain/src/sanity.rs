//! Supplementary sanity auditor.
//!
//! A non-normative application that re-derives the chain's financial
//! invariants from raw state and fails the block when any of them breaks.
//! It never mutates consensus state; a failure here means a bug in one of
//! the normative applications, not bad user input.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error as ThisError;
use tracing::debug;

use eks_common::{Address, Quantity};

use crate::app::{Application, MessageBus, Transaction};
use crate::context::Context;
use crate::mkvs::{StateError, Tree};
use crate::{scheduler, staking};

/// Application name.
pub const APP_NAME: &str = "supplementary-sanity";

#[derive(Debug, ThisError)]
pub enum CheckError {
    #[error("sanity: total supply mismatch: declared {declared}, computed {computed}")]
    SupplyMismatch {
        declared: Quantity,
        computed: Quantity,
    },

    #[error("sanity: share pool for {address} has shares and balance out of step")]
    BrokenSharePool { address: Address },

    #[error("sanity: delegation shares for escrow {escrow} do not add up to the pool")]
    DelegationShareMismatch { escrow: Address },

    #[error("sanity: forward and reverse delegation indices disagree for {escrow}/{delegator}")]
    DelegationIndexMismatch { escrow: Address, delegator: Address },

    #[error("sanity: commission schedule index out of step for {address}")]
    CommissionIndexMismatch { address: Address },

    #[error("sanity: debonding delegations and queue entries do not match")]
    DebondingQueueMismatch,

    #[error(transparent)]
    State(#[from] StateError),
}

/// Runs every invariant check against the given state.
///
/// Validator-set bounds are deliberately not audited here: the election
/// enforces them whenever it runs, but a passed parameter change can leave
/// the standing set outside the new bounds until the next election.
pub fn check_invariants(tree: &dyn Tree) -> Result<(), CheckError> {
    check_supply(tree)?;
    check_share_pools_and_delegations(tree)?;
    check_commission_index(tree)?;
    check_debonding_closure(tree)?;
    Ok(())
}

/// Total supply must equal the sum of every pool and every account.
fn check_supply(tree: &dyn Tree) -> Result<(), CheckError> {
    let declared = staking::state::total_supply(tree)?;

    let mut computed = staking::state::common_pool(tree)?;
    let parts = [
        staking::state::governance_deposits(tree)?,
        staking::state::last_block_fees(tree)?,
    ];
    for part in parts {
        computed.add(&part).map_err(arithmetic)?;
    }
    for address in staking::state::addresses(tree)? {
        let acct = staking::state::account(tree, &address)?;
        computed.add(&acct.general.balance).map_err(arithmetic)?;
        computed.add(&acct.escrow.active.balance).map_err(arithmetic)?;
        computed
            .add(&acct.escrow.debonding.balance)
            .map_err(arithmetic)?;
    }

    if computed != declared {
        return Err(CheckError::SupplyMismatch { declared, computed });
    }
    Ok(())
}

fn arithmetic(err: eks_common::QuantityError) -> CheckError {
    CheckError::State(StateError::InvariantViolation(err.to_string()))
}

/// Share pools are empty on both sides together, outstanding delegation
/// shares add up to each pool's total, and the forward and reverse
/// delegation indices carry identical values.
fn check_share_pools_and_delegations(tree: &dyn Tree) -> Result<(), CheckError> {
    let delegations = staking::state::delegations(tree)?;
    let debonding = staking::state::all_debonding_delegations(tree)?;

    let mut debonding_by_escrow: BTreeMap<Address, Quantity> = BTreeMap::new();
    for (_, escrow, deb) in &debonding {
        debonding_by_escrow
            .entry(*escrow)
            .or_insert(Quantity::ZERO)
            .add(&deb.shares)
            .map_err(arithmetic)?;
    }

    for address in staking::state::addresses(tree)? {
        let acct = staking::state::account(tree, &address)?;
        for pool in [&acct.escrow.active, &acct.escrow.debonding] {
            // Balance without shares is unclaimable money. The converse is
            // legal: slashing can drain a pool to zero while the share
            // count stays, leaving a share price of zero.
            if pool.total_shares.is_zero() && !pool.balance.is_zero() {
                return Err(CheckError::BrokenSharePool { address });
            }
        }

        let mut delegated_shares = Quantity::ZERO;
        for (delegator, delegation) in delegations.get(&address).into_iter().flatten() {
            delegated_shares.add(&delegation.shares).map_err(arithmetic)?;

            let reverse = staking::state::delegations_for(tree, delegator)?;
            if reverse.get(&address) != Some(delegation) {
                return Err(CheckError::DelegationIndexMismatch {
                    escrow: address,
                    delegator: *delegator,
                });
            }
        }
        if delegated_shares != acct.escrow.active.total_shares {
            return Err(CheckError::DelegationShareMismatch { escrow: address });
        }

        let debonding_shares = debonding_by_escrow
            .get(&address)
            .copied()
            .unwrap_or(Quantity::ZERO);
        if debonding_shares != acct.escrow.debonding.total_shares {
            return Err(CheckError::DelegationShareMismatch { escrow: address });
        }
    }
    Ok(())
}

/// The commission-schedule index holds exactly the addresses with a
/// non-empty schedule.
fn check_commission_index(tree: &dyn Tree) -> Result<(), CheckError> {
    let indexed: BTreeSet<Address> = staking::state::commission_schedule_addresses(tree)?
        .into_iter()
        .collect();
    for address in staking::state::addresses(tree)? {
        let acct = staking::state::account(tree, &address)?;
        if acct.escrow.commission_schedule.is_empty() == indexed.contains(&address) {
            return Err(CheckError::CommissionIndexMismatch { address });
        }
    }
    Ok(())
}

/// Every debonding delegation has a queue entry and vice versa.
fn check_debonding_closure(tree: &dyn Tree) -> Result<(), CheckError> {
    let mut delegations = BTreeSet::new();
    for (delegator, escrow, deb) in staking::state::all_debonding_delegations(tree)? {
        delegations.insert((deb.debond_end_time, delegator, escrow));
    }
    let queue: BTreeSet<_> = staking::state::debonding_queue_entries(tree)?
        .into_iter()
        .collect();
    if delegations != queue {
        return Err(CheckError::DebondingQueueMismatch);
    }
    Ok(())
}

/// The auditor application. Runs after every other application's EndBlock
/// every `interval` blocks.
pub struct App {
    interval: u64,
}

impl App {
    pub fn new(interval: u64) -> Self {
        App {
            interval: interval.max(1),
        }
    }
}

impl Default for App {
    fn default() -> Self {
        App::new(1)
    }
}

impl Application for App {
    fn name(&self) -> &'static str {
        APP_NAME
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![
            staking::APP_NAME,
            scheduler::APP_NAME,
            crate::governance::APP_NAME,
            crate::roothash::APP_NAME,
        ]
    }

    fn execute_tx(
        &self,
        _ctx: &mut Context,
        _bus: &MessageBus,
        _tx: &Transaction,
    ) -> Result<(), crate::Error> {
        Err(crate::Error::Dispatcher(
            "supplementary-sanity: unexpected transaction".into(),
        ))
    }

    fn end_block(
        &self,
        ctx: &mut Context,
        _bus: &MessageBus,
    ) -> Result<Vec<crate::app::ValidatorUpdate>, crate::Error> {
        if ctx.block_height() % self.interval != 0 {
            return Ok(Vec::new());
        }
        debug!(height = ctx.block_height(), "running state invariant checks");
        check_invariants(ctx.tree()).map_err(|err| {
            crate::Error::State(StateError::InvariantViolation(err.to_string()))
        })?;
        Ok(Vec::new())
    }
}
