//! Staking state accessors.
//!
//! Key formats. The tags are part of the on-chain state format; changing
//! any of them breaks state compatibility:
//!
//! | Tag | Key parts | Value |
//! |-----|-----------|-------|
//! | 0x50 | address (21) | Account |
//! | 0x51 | — | total supply |
//! | 0x52 | — | common pool |
//! | 0x53 | escrow, delegator | Delegation |
//! | 0x54 | delegator, escrow, epoch (u64) | DebondingDelegation |
//! | 0x55 | epoch (u64), delegator, escrow | (empty queue index) |
//! | 0x56 | — | Parameters |
//! | 0x57 | — | last block fees |
//! | 0x58 | — | EpochSigning |
//! | 0x59 | — | governance deposits |
//! | 0x5A | delegator, escrow | Delegation (reverse index) |
//! | 0x5B | address | (empty commission-schedule index) |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use eks_common::address::{common_pool_address, fee_accumulator_address, governance_deposits_address};
use eks_common::{codec, move_amount, move_up_to, Address, Quantity};

use crate::context::{Context, Mode};
use crate::keyformat::KeyFormat;
use crate::mkvs::{StateError, Tree};
use crate::types::EpochTime;

use super::{
    Account, DebondingDelegation, Delegation, Error, Event, HookKind, Parameters, RewardStep,
    COMMISSION_RATE_DENOMINATOR, REWARD_AMOUNT_DENOMINATOR,
};

const ACCOUNT: KeyFormat = KeyFormat::new(0x50);
const TOTAL_SUPPLY: KeyFormat = KeyFormat::new(0x51);
const COMMON_POOL: KeyFormat = KeyFormat::new(0x52);
const DELEGATION: KeyFormat = KeyFormat::new(0x53);
const DEBONDING_DELEGATION: KeyFormat = KeyFormat::new(0x54);
const DEBONDING_QUEUE: KeyFormat = KeyFormat::new(0x55);
const PARAMETERS: KeyFormat = KeyFormat::new(0x56);
const LAST_BLOCK_FEES: KeyFormat = KeyFormat::new(0x57);
const EPOCH_SIGNING: KeyFormat = KeyFormat::new(0x58);
const GOVERNANCE_DEPOSITS: KeyFormat = KeyFormat::new(0x59);
const DELEGATION_REVERSE: KeyFormat = KeyFormat::new(0x5A);
const COMMISSION_SCHEDULE_ADDRESSES: KeyFormat = KeyFormat::new(0x5B);

fn decode<T: serde::de::DeserializeOwned>(raw: Vec<u8>) -> Result<T, StateError> {
    codec::from_slice(&raw).map_err(|e| StateError::Unavailable(e.to_string()))
}

fn stored_balance(tree: &dyn Tree, fmt: KeyFormat) -> Result<Quantity, StateError> {
    match tree.get(&fmt.prefix())? {
        Some(raw) => decode(raw),
        None => Ok(Quantity::ZERO),
    }
}

// ─── Singletons ────────────────────────────────────────────────────────────

pub fn total_supply(tree: &dyn Tree) -> Result<Quantity, StateError> {
    stored_balance(tree, TOTAL_SUPPLY)
}

pub fn set_total_supply(tree: &mut dyn Tree, q: &Quantity) -> Result<(), StateError> {
    tree.insert(&TOTAL_SUPPLY.prefix(), &codec::to_vec(q))
}

pub fn common_pool(tree: &dyn Tree) -> Result<Quantity, StateError> {
    stored_balance(tree, COMMON_POOL)
}

pub fn set_common_pool(tree: &mut dyn Tree, q: &Quantity) -> Result<(), StateError> {
    tree.insert(&COMMON_POOL.prefix(), &codec::to_vec(q))
}

pub fn last_block_fees(tree: &dyn Tree) -> Result<Quantity, StateError> {
    stored_balance(tree, LAST_BLOCK_FEES)
}

pub fn set_last_block_fees(tree: &mut dyn Tree, q: &Quantity) -> Result<(), StateError> {
    tree.insert(&LAST_BLOCK_FEES.prefix(), &codec::to_vec(q))
}

pub fn governance_deposits(tree: &dyn Tree) -> Result<Quantity, StateError> {
    stored_balance(tree, GOVERNANCE_DEPOSITS)
}

pub fn set_governance_deposits(tree: &mut dyn Tree, q: &Quantity) -> Result<(), StateError> {
    tree.insert(&GOVERNANCE_DEPOSITS.prefix(), &codec::to_vec(q))
}

pub fn parameters(tree: &dyn Tree) -> Result<Parameters, StateError> {
    match tree.get(&PARAMETERS.prefix())? {
        Some(raw) => decode(raw),
        None => Err(StateError::InvariantViolation(
            "staking: consensus parameters missing from state".into(),
        )),
    }
}

/// Sets staking consensus parameters. Restricted to InitChain/EndBlock
/// contexts because parameter changes mid-block would make transaction
/// semantics order-dependent.
pub fn set_parameters(ctx: &mut Context, params: &Parameters) -> Result<(), StateError> {
    ctx.ensure_mode(&[Mode::InitChain, Mode::EndBlock])?;
    ctx.tree_mut()
        .insert(&PARAMETERS.prefix(), &codec::to_vec(params))
}

// ─── Accounts ──────────────────────────────────────────────────────────────

/// Loads an account; absent accounts decode as the zero account.
pub fn account(tree: &dyn Tree, addr: &Address) -> Result<Account, StateError> {
    match tree.get(&ACCOUNT.key1(addr))? {
        Some(raw) => decode(raw),
        None => Ok(Account::default()),
    }
}

/// Stores an account and maintains the commission-schedule address index:
/// the index holds exactly the addresses with a non-empty schedule.
pub fn set_account(tree: &mut dyn Tree, addr: &Address, account: &Account) -> Result<(), StateError> {
    tree.insert(&ACCOUNT.key1(addr), &codec::to_vec(account))?;

    let index_key = COMMISSION_SCHEDULE_ADDRESSES.key1(addr);
    if account.escrow.commission_schedule.is_empty() {
        tree.remove(&index_key)
    } else {
        tree.insert(&index_key, &[])
    }
}

/// Registers a hook destination on an account.
pub fn set_account_hook(
    tree: &mut dyn Tree,
    addr: &Address,
    kind: HookKind,
    destination: &Address,
) -> Result<(), StateError> {
    let mut acct = account(tree, addr)?;
    acct.general.hooks.insert(kind, *destination);
    set_account(tree, addr, &acct)
}

/// All addresses present in the ledger, in address order.
pub fn addresses(tree: &dyn Tree) -> Result<Vec<Address>, StateError> {
    let mut out = Vec::new();
    for (key, _) in tree.iter_from(&ACCOUNT.prefix())? {
        let Some(addr) = ACCOUNT.decode1::<Address>(&key) else {
            break;
        };
        out.push(addr);
    }
    Ok(out)
}

/// Addresses with a non-empty commission schedule, from the index.
pub fn commission_schedule_addresses(tree: &dyn Tree) -> Result<Vec<Address>, StateError> {
    let mut out = Vec::new();
    for (key, _) in tree.iter_from(&COMMISSION_SCHEDULE_ADDRESSES.prefix())? {
        let Some(addr) = COMMISSION_SCHEDULE_ADDRESSES.decode1::<Address>(&key) else {
            break;
        };
        out.push(addr);
    }
    Ok(out)
}

// ─── Delegations ───────────────────────────────────────────────────────────

pub fn delegation(
    tree: &dyn Tree,
    delegator: &Address,
    escrow: &Address,
) -> Result<Delegation, StateError> {
    match tree.get(&DELEGATION.key2(escrow, delegator))? {
        Some(raw) => decode(raw),
        None => Ok(Delegation::default()),
    }
}

/// Stores a delegation under both the forward and the reverse index,
/// removing both entries once the shares fall to zero.
pub fn set_delegation(
    tree: &mut dyn Tree,
    delegator: &Address,
    escrow: &Address,
    d: &Delegation,
) -> Result<(), StateError> {
    let forward = DELEGATION.key2(escrow, delegator);
    let reverse = DELEGATION_REVERSE.key2(delegator, escrow);

    if d.shares.is_zero() {
        tree.remove(&forward)?;
        return tree.remove(&reverse);
    }

    let value = codec::to_vec(d);
    tree.insert(&forward, &value)?;
    tree.insert(&reverse, &value)
}

/// All delegations, keyed `(escrow, delegator)`.
pub fn delegations(
    tree: &dyn Tree,
) -> Result<BTreeMap<Address, BTreeMap<Address, Delegation>>, StateError> {
    let mut out: BTreeMap<Address, BTreeMap<Address, Delegation>> = BTreeMap::new();
    for (key, value) in tree.iter_from(&DELEGATION.prefix())? {
        let Some((escrow, delegator)) = DELEGATION.decode2::<Address, Address>(&key) else {
            break;
        };
        out.entry(escrow).or_default().insert(delegator, decode(value)?);
    }
    Ok(out)
}

/// Delegations held by one delegator, from the reverse index.
pub fn delegations_for(
    tree: &dyn Tree,
    delegator: &Address,
) -> Result<BTreeMap<Address, Delegation>, StateError> {
    let mut out = BTreeMap::new();
    for (key, value) in tree.iter_from(&DELEGATION_REVERSE.prefix1(delegator))? {
        let Some((dec_delegator, escrow)) = DELEGATION_REVERSE.decode2::<Address, Address>(&key)
        else {
            break;
        };
        if dec_delegator != *delegator {
            break;
        }
        out.insert(escrow, decode(value)?);
    }
    Ok(out)
}

/// Delegations into one escrow account, from the forward index.
pub fn delegations_to(
    tree: &dyn Tree,
    escrow: &Address,
) -> Result<BTreeMap<Address, Delegation>, StateError> {
    let mut out = BTreeMap::new();
    for (key, value) in tree.iter_from(&DELEGATION.prefix1(escrow))? {
        let Some((dec_escrow, delegator)) = DELEGATION.decode2::<Address, Address>(&key) else {
            break;
        };
        if dec_escrow != *escrow {
            break;
        }
        out.insert(delegator, decode(value)?);
    }
    Ok(out)
}

// ─── Debonding delegations and queue ───────────────────────────────────────

pub fn debonding_delegation(
    tree: &dyn Tree,
    delegator: &Address,
    escrow: &Address,
    epoch: EpochTime,
) -> Result<DebondingDelegation, StateError> {
    match tree.get(&DEBONDING_DELEGATION.key3(delegator, escrow, &epoch))? {
        Some(raw) => decode(raw),
        None => Ok(DebondingDelegation::default()),
    }
}

/// Stores a debonding delegation and its queue entry. An existing entry
/// with the same `(delegator, escrow, end epoch)` is merged. Passing `None`
/// removes the entry.
pub fn set_debonding_delegation(
    tree: &mut dyn Tree,
    delegator: &Address,
    escrow: &Address,
    epoch: EpochTime,
    d: Option<&DebondingDelegation>,
) -> Result<(), StateError> {
    let key = DEBONDING_DELEGATION.key3(delegator, escrow, &epoch);

    let Some(d) = d else {
        return tree.remove(&key);
    };

    let mut merged = d.clone();
    if let Some(raw) = tree.get(&key)? {
        let existing: DebondingDelegation = decode(raw)?;
        merged.merge(&existing).map_err(|e| {
            StateError::InvariantViolation(format!("staking: merging debonding delegations: {e}"))
        })?;
    }

    tree.insert(
        &DEBONDING_QUEUE.key3(&d.debond_end_time, delegator, escrow),
        &[],
    )?;
    tree.insert(&key, &codec::to_vec(&merged))
}

pub fn remove_from_debonding_queue(
    tree: &mut dyn Tree,
    epoch: EpochTime,
    delegator: &Address,
    escrow: &Address,
) -> Result<(), StateError> {
    tree.remove(&DEBONDING_QUEUE.key3(&epoch, delegator, escrow))
}

/// Debonding delegations of one delegator, keyed by escrow address.
pub fn debonding_delegations_for(
    tree: &dyn Tree,
    delegator: &Address,
) -> Result<BTreeMap<Address, Vec<DebondingDelegation>>, StateError> {
    let mut out: BTreeMap<Address, Vec<DebondingDelegation>> = BTreeMap::new();
    for (key, value) in tree.iter_from(&DEBONDING_DELEGATION.prefix1(delegator))? {
        let Some((dec_delegator, escrow, _epoch)) =
            DEBONDING_DELEGATION.decode3::<Address, Address, u64>(&key)
        else {
            break;
        };
        if dec_delegator != *delegator {
            break;
        }
        out.entry(escrow).or_default().push(decode(value)?);
    }
    Ok(out)
}

/// All debonding delegations, as `(delegator, escrow, delegation)` triples.
pub fn all_debonding_delegations(
    tree: &dyn Tree,
) -> Result<Vec<(Address, Address, DebondingDelegation)>, StateError> {
    let mut out = Vec::new();
    for (key, value) in tree.iter_from(&DEBONDING_DELEGATION.prefix())? {
        let Some((delegator, escrow, _epoch)) =
            DEBONDING_DELEGATION.decode3::<Address, Address, u64>(&key)
        else {
            break;
        };
        out.push((delegator, escrow, decode(value)?));
    }
    Ok(out)
}

/// One expired debonding queue entry.
pub struct DebondingQueueEntry {
    pub epoch: EpochTime,
    pub delegator: Address,
    pub escrow: Address,
    pub delegation: DebondingDelegation,
}

/// Queue entries with end epoch at or before `epoch`, in queue order.
pub fn expired_debonding_queue(
    tree: &dyn Tree,
    epoch: EpochTime,
) -> Result<Vec<DebondingQueueEntry>, StateError> {
    let mut out = Vec::new();
    for (key, _) in tree.iter_from(&DEBONDING_QUEUE.prefix())? {
        let Some((dec_epoch, delegator, escrow)) =
            DEBONDING_QUEUE.decode3::<u64, Address, Address>(&key)
        else {
            break;
        };
        if dec_epoch > epoch {
            break;
        }
        out.push(DebondingQueueEntry {
            epoch: dec_epoch,
            delegator,
            escrow,
            delegation: debonding_delegation(tree, &delegator, &escrow, dec_epoch)?,
        });
    }
    Ok(out)
}

/// All queue entries, for the invariant auditor.
pub fn debonding_queue_entries(
    tree: &dyn Tree,
) -> Result<Vec<(EpochTime, Address, Address)>, StateError> {
    let mut out = Vec::new();
    for (key, _) in tree.iter_from(&DEBONDING_QUEUE.prefix())? {
        let Some(entry) = DEBONDING_QUEUE.decode3::<u64, Address, Address>(&key) else {
            break;
        };
        out.push(entry);
    }
    Ok(out)
}

// ─── Epoch signing ─────────────────────────────────────────────────────────

/// Per-epoch block signing tallies, reset at every epoch transition.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EpochSigning {
    pub total: u64,
    pub by_entity: BTreeMap<Address, u64>,
}

impl EpochSigning {
    /// Records one block signed by the given entities.
    pub fn update(&mut self, signing_entities: &[Address]) -> Result<(), Error> {
        self.total = self
            .total
            .checked_add(1)
            .ok_or(eks_common::QuantityError::Overflow)?;
        for entity in signing_entities {
            let count = self.by_entity.entry(*entity).or_insert(0);
            *count = count
                .checked_add(1)
                .ok_or(eks_common::QuantityError::Overflow)?;
        }
        Ok(())
    }

    /// Entities whose signed-block fraction is at least
    /// `numerator/denominator`, in address order.
    pub fn eligible_entities(
        &self,
        numerator: u64,
        denominator: u64,
    ) -> Result<Vec<Address>, Error> {
        let threshold = self
            .total
            .checked_mul(numerator)
            .ok_or(eks_common::QuantityError::Overflow)?;
        let mut out = Vec::new();
        for (entity, count) in &self.by_entity {
            let scaled = count
                .checked_mul(denominator)
                .ok_or(eks_common::QuantityError::Overflow)?;
            if scaled >= threshold {
                out.push(*entity);
            }
        }
        Ok(out)
    }
}

pub fn epoch_signing(tree: &dyn Tree) -> Result<EpochSigning, StateError> {
    match tree.get(&EPOCH_SIGNING.prefix())? {
        Some(raw) => decode(raw),
        None => Ok(EpochSigning::default()),
    }
}

pub fn set_epoch_signing(tree: &mut dyn Tree, es: &EpochSigning) -> Result<(), StateError> {
    tree.insert(&EPOCH_SIGNING.prefix(), &codec::to_vec(es))
}

pub fn clear_epoch_signing(tree: &mut dyn Tree) -> Result<(), StateError> {
    tree.remove(&EPOCH_SIGNING.prefix())
}

// ─── Money movement ────────────────────────────────────────────────────────

/// Transfers between two general balances. A transfer to self or of zero is
/// a no-op. Both sides must retain at least the minimum transactable
/// balance.
pub fn transfer(
    ctx: &mut Context,
    from_addr: &Address,
    to_addr: &Address,
    amount: &Quantity,
) -> Result<(), Error> {
    if from_addr == to_addr || amount.is_zero() {
        return Ok(());
    }

    let mut from = account(ctx.tree(), from_addr)?;
    let mut to = account(ctx.tree(), to_addr)?;

    move_amount(&mut to.general.balance, &mut from.general.balance, amount)
        .map_err(|_| Error::InsufficientBalance)?;

    let params = parameters(ctx.tree())?;
    if from.general.balance < params.min_transact_balance {
        debug!(%from_addr, balance = %from.general.balance, "source balance under minimum after transfer");
        return Err(Error::BalanceTooLow("source account"));
    }
    if to.general.balance < params.min_transact_balance {
        debug!(%to_addr, balance = %to.general.balance, "destination balance under minimum after transfer");
        return Err(Error::BalanceTooLow("dest account"));
    }

    set_account(ctx.tree_mut(), from_addr, &from)?;
    set_account(ctx.tree_mut(), to_addr, &to)?;

    ctx.emit_event(
        Event::Transfer {
            from: *from_addr,
            to: *to_addr,
            amount: *amount,
        }
        .into(),
    );
    Ok(())
}

/// Charges a transaction fee: the amount leaves the payer immediately and
/// accumulates in the block context, becoming the next block's
/// disbursable fees at EndBlock.
pub fn take_tx_fee(ctx: &mut Context, from_addr: Address, fee: &Quantity) -> Result<(), Error> {
    let mut from = account(ctx.tree(), &from_addr)?;
    from.general
        .balance
        .sub(fee)
        .map_err(|_| Error::InsufficientBalance)?;
    set_account(ctx.tree_mut(), &from_addr, &from)?;
    ctx.block_mut().fee_accumulator.add(fee)?;

    ctx.emit_event(
        Event::Transfer {
            from: from_addr,
            to: fee_accumulator_address(),
            amount: *fee,
        }
        .into(),
    );
    Ok(())
}

fn slash_pool(
    dst: &mut Quantity,
    pool: &mut super::SharePool,
    amount: &Quantity,
    total: &Quantity,
) -> Result<(), Error> {
    if total.is_zero() {
        return Ok(());
    }
    // slash = amount * pool.balance / total, capped at the pool balance.
    let slash = pool.balance.mul_quo(amount, total)?;
    move_up_to(dst, &mut pool.balance, &slash)?;
    Ok(())
}

/// Slashes up to `amount` of the account's escrow, split between the active
/// and debonding pools in proportion to their balances, moving the slashed
/// stake to the common pool. Share counts never change; slashing lowers the
/// share price instead. Returns the amount actually slashed.
pub fn slash_escrow(
    ctx: &mut Context,
    from_addr: &Address,
    amount: &Quantity,
) -> Result<Quantity, Error> {
    let mut pool = common_pool(ctx.tree())?;
    let mut from = account(ctx.tree(), from_addr)?;

    let mut total = from.escrow.active.balance;
    total.add(&from.escrow.debonding.balance)?;

    let mut active_slashed = Quantity::ZERO;
    let mut debonding_slashed = Quantity::ZERO;
    slash_pool(&mut active_slashed, &mut from.escrow.active, amount, &total)?;
    slash_pool(&mut debonding_slashed, &mut from.escrow.debonding, amount, &total)?;

    let mut total_slashed = active_slashed;
    total_slashed.add(&debonding_slashed)?;
    if total_slashed.is_zero() {
        return Ok(total_slashed);
    }

    let mut moved = total_slashed;
    move_amount(&mut pool, &mut moved, &total_slashed)?;

    set_common_pool(ctx.tree_mut(), &pool)?;
    set_account(ctx.tree_mut(), from_addr, &from)?;

    ctx.emit_event(
        Event::TakeEscrow {
            owner: *from_addr,
            amount: total_slashed,
            debonding_amount: debonding_slashed,
        }
        .into(),
    );
    Ok(total_slashed)
}

/// Computes the commission split of `total` at the given rate, defaulting
/// to the chain's minimum commission rate. Returns `(commission, rest)`.
pub fn compute_commission(
    tree: &dyn Tree,
    rate: Option<Quantity>,
    total: &Quantity,
) -> Result<(Quantity, Quantity), Error> {
    let rate = match rate {
        Some(rate) => rate,
        None => parameters(tree)?.commission_schedule_rules.min_commission_rate,
    };
    let com = total.mul_quo(&rate, &Quantity::new(COMMISSION_RATE_DENOMINATOR))?;
    let mut rest = *total;
    rest.sub(&com)?;
    Ok((com, rest))
}

/// Moves up to `amount` from the common pool to the account. With `escrow`
/// set the stake is immediately escrowed: the entity's commission rate is
/// applied, the commission is deposited as the entity's self-delegation
/// (new shares) and the rest raises the share price for all delegators.
/// Returns whether anything was transferred.
pub fn transfer_from_common(
    ctx: &mut Context,
    to_addr: &Address,
    amount: &Quantity,
    escrow: bool,
) -> Result<bool, Error> {
    let mut pool = common_pool(ctx.tree())?;
    let mut to = account(ctx.tree(), to_addr)?;

    let transferred = move_up_to(&mut to.general.balance, &mut pool, amount)?;
    if transferred.is_zero() {
        return Ok(false);
    }

    if escrow {
        let mut remaining = transferred;
        let com;
        if !to.escrow.active.total_shares.is_zero() {
            let epoch = crate::beacon::state::current_epoch(ctx.tree())?;
            let rate = to.escrow.commission_schedule.current_rate(epoch);
            let (c, rest) = compute_commission(ctx.tree(), rate, &transferred)?;
            com = c;
            remaining = rest;

            // Escrow everything except the commission; no new shares, so the
            // existing share price rises.
            move_amount(&mut to.escrow.active.balance, &mut to.general.balance, &remaining)?;
            ctx.emit_event(
                Event::AddEscrow {
                    owner: common_pool_address(),
                    escrow: *to_addr,
                    amount: remaining,
                    new_shares: Quantity::ZERO,
                }
                .into(),
            );
        } else {
            // Nothing escrowed before: everything counts as commission.
            com = remaining;
        }

        if !com.is_zero() {
            let mut delegation = delegation(ctx.tree(), to_addr, to_addr)?;
            let obtained = to
                .escrow
                .active
                .deposit(&mut delegation.shares, &mut to.general.balance, &com)?;
            set_delegation(ctx.tree_mut(), to_addr, to_addr, &delegation)?;

            // The commission was transferred to the entity and immediately
            // escrowed, so both events are emitted.
            ctx.emit_event(
                Event::Transfer {
                    from: common_pool_address(),
                    to: *to_addr,
                    amount: com,
                }
                .into(),
            );
            ctx.emit_event(
                Event::AddEscrow {
                    owner: *to_addr,
                    escrow: *to_addr,
                    amount: com,
                    new_shares: obtained,
                }
                .into(),
            );
        }
    } else {
        ctx.emit_event(
            Event::Transfer {
                from: common_pool_address(),
                to: *to_addr,
                amount: transferred,
            }
            .into(),
        );
    }

    set_common_pool(ctx.tree_mut(), &pool)?;
    set_account(ctx.tree_mut(), to_addr, &to)?;
    Ok(true)
}

/// Moves a proposal deposit from the submitter into the governance
/// deposits pool.
pub fn transfer_to_governance_deposits(
    ctx: &mut Context,
    from_addr: &Address,
    amount: &Quantity,
) -> Result<(), Error> {
    let mut from = account(ctx.tree(), from_addr)?;
    let mut deposits = governance_deposits(ctx.tree())?;

    move_amount(&mut deposits, &mut from.general.balance, amount)
        .map_err(|_| Error::InsufficientBalance)?;

    set_account(ctx.tree_mut(), from_addr, &from)?;
    set_governance_deposits(ctx.tree_mut(), &deposits)?;

    ctx.emit_event(
        Event::Transfer {
            from: *from_addr,
            to: governance_deposits_address(),
            amount: *amount,
        }
        .into(),
    );
    Ok(())
}

/// Refunds a proposal deposit from the governance deposits pool.
pub fn transfer_from_governance_deposits(
    ctx: &mut Context,
    to_addr: &Address,
    amount: &Quantity,
) -> Result<(), Error> {
    let mut to = account(ctx.tree(), to_addr)?;
    let mut deposits = governance_deposits(ctx.tree())?;

    move_amount(&mut to.general.balance, &mut deposits, amount)
        .map_err(|_| Error::InsufficientBalance)?;

    set_account(ctx.tree_mut(), to_addr, &to)?;
    set_governance_deposits(ctx.tree_mut(), &deposits)?;

    ctx.emit_event(
        Event::Transfer {
            from: governance_deposits_address(),
            to: *to_addr,
            amount: *amount,
        }
        .into(),
    );
    Ok(())
}

/// Forfeits a proposal deposit to the common pool.
pub fn discard_governance_deposit(ctx: &mut Context, amount: &Quantity) -> Result<(), Error> {
    let mut pool = common_pool(ctx.tree())?;
    let mut deposits = governance_deposits(ctx.tree())?;

    move_amount(&mut pool, &mut deposits, amount).map_err(|_| Error::InsufficientBalance)?;

    set_governance_deposits(ctx.tree_mut(), &deposits)?;
    set_common_pool(ctx.tree_mut(), &pool)?;

    ctx.emit_event(
        Event::Transfer {
            from: governance_deposits_address(),
            to: common_pool_address(),
            amount: *amount,
        }
        .into(),
    );
    Ok(())
}

// ─── Rewards ───────────────────────────────────────────────────────────────

fn active_reward_step(steps: &[RewardStep], time: EpochTime) -> Option<&RewardStep> {
    steps.iter().find(|step| time < step.until)
}

fn reward_amount(
    escrow_balance: &Quantity,
    factor: &Quantity,
    scale: &Quantity,
) -> Result<Quantity, Error> {
    let mut q = *escrow_balance;
    q.mul(factor)?;
    q.mul(scale)?;
    q.quo(&Quantity::new(REWARD_AMOUNT_DENOMINATOR))?;
    Ok(q)
}

fn deposit_reward(
    ctx: &mut Context,
    time: EpochTime,
    addr: &Address,
    reward: Quantity,
    pool: &mut Quantity,
) -> Result<(), Error> {
    let mut acct = account(ctx.tree(), addr)?;

    let rate = acct.escrow.commission_schedule.current_rate(time);
    let (com, rest) = compute_commission(ctx.tree(), rate, &reward)?;

    if !rest.is_zero() {
        move_amount(&mut acct.escrow.active.balance, pool, &rest)?;
        ctx.emit_event(
            Event::AddEscrow {
                owner: common_pool_address(),
                escrow: *addr,
                amount: rest,
                // No new shares for the reward itself: the share price of
                // every existing delegator rises.
                new_shares: Quantity::ZERO,
            }
            .into(),
        );
    }

    if !com.is_zero() {
        let mut del = delegation(ctx.tree(), addr, addr)?;
        let obtained = acct.escrow.active.deposit(&mut del.shares, pool, &com)?;
        set_delegation(ctx.tree_mut(), addr, addr, &del)?;

        ctx.emit_event(
            Event::Transfer {
                from: common_pool_address(),
                to: *addr,
                amount: com,
            }
            .into(),
        );
        ctx.emit_event(
            Event::AddEscrow {
                owner: *addr,
                escrow: *addr,
                amount: com,
                new_shares: obtained,
            }
            .into(),
        );
    }

    set_account(ctx.tree_mut(), addr, &acct)?;
    Ok(())
}

/// Pays the per-epoch staking reward at `factor` into the active escrow of
/// each address. Rewards the common pool cannot cover are skipped without
/// error.
pub fn add_rewards(
    ctx: &mut Context,
    time: EpochTime,
    factor: &Quantity,
    addresses: &[Address],
) -> Result<(), Error> {
    let steps = parameters(ctx.tree())?.reward_schedule;
    let Some(step) = active_reward_step(&steps, time) else {
        return Ok(());
    };
    let scale = step.scale;

    let mut pool = common_pool(ctx.tree())?;
    for addr in addresses {
        let acct = account(ctx.tree(), addr)?;
        let reward = reward_amount(&acct.escrow.active.balance, factor, &scale)?;
        if reward.is_zero() || reward > pool {
            continue;
        }
        deposit_reward(ctx, time, addr, reward, &mut pool)?;
    }
    set_common_pool(ctx.tree_mut(), &pool)?;
    Ok(())
}

/// Pays a single reward scaled by `numerator/denominator`, used for the
/// block-proposing reward attenuated by voter turnout.
pub fn add_reward_single_attenuated(
    ctx: &mut Context,
    time: EpochTime,
    factor: &Quantity,
    attenuation_numerator: u64,
    attenuation_denominator: u64,
    addr: &Address,
) -> Result<(), Error> {
    let steps = parameters(ctx.tree())?.reward_schedule;
    let Some(step) = active_reward_step(&steps, time) else {
        return Ok(());
    };
    let scale = step.scale;

    let acct = account(ctx.tree(), addr)?;
    let full = reward_amount(&acct.escrow.active.balance, factor, &scale)?;
    let reward = full.mul_quo(
        &Quantity::from(attenuation_numerator),
        &Quantity::from(attenuation_denominator),
    )?;

    let mut pool = common_pool(ctx.tree())?;
    if reward.is_zero() || reward > pool {
        return Ok(());
    }
    deposit_reward(ctx, time, addr, reward, &mut pool)?;
    set_common_pool(ctx.tree_mut(), &pool)?;
    Ok(())
}
