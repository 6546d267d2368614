//! The staking application.

use tracing::debug;

use eks_common::{codec, move_amount, Address, PublicKey, Quantity};

use crate::app::{Application, Message, MessageBus, MessageKind, MessageResult, Transaction};
use crate::beacon;
use crate::context::{Context, MisbehaviorKind};
use crate::genesis::Genesis as GenesisDocument;
use crate::mkvs::StateError;
use crate::registry;
use crate::types::EpochTime;

use super::state;
use super::{
    AmendCommissionSchedule, Allow, Burn, Error, Escrow, Event, ParameterChanges, ReclaimEscrow,
    SlashReason, StakingMessage, Transfer, Withdraw, APP_NAME, METHOD_ADD_ESCROW, METHOD_ALLOW,
    METHOD_AMEND_COMMISSION_SCHEDULE, METHOD_BURN, METHOD_RECLAIM_ESCROW, METHOD_TRANSFER,
    METHOD_WITHDRAW,
};

/// The staking application.
pub struct App;

impl Application for App {
    fn name(&self) -> &'static str {
        APP_NAME
    }

    fn methods(&self) -> Vec<&'static str> {
        vec![
            METHOD_TRANSFER,
            METHOD_BURN,
            METHOD_ADD_ESCROW,
            METHOD_RECLAIM_ESCROW,
            METHOD_AMEND_COMMISSION_SCHEDULE,
            METHOD_ALLOW,
            METHOD_WITHDRAW,
        ]
    }

    fn subscriptions(&self) -> Vec<MessageKind> {
        vec![
            MessageKind::RuntimeStaking,
            MessageKind::ValidateParameterChanges,
            MessageKind::ChangeParameters,
        ]
    }

    fn init_chain(&self, ctx: &mut Context, genesis: &GenesisDocument) -> Result<(), crate::Error> {
        Ok(init_chain(ctx, genesis)?)
    }

    fn begin_block(&self, ctx: &mut Context, _bus: &MessageBus) -> Result<(), crate::Error> {
        Ok(begin_block(ctx)?)
    }

    fn execute_tx(
        &self,
        ctx: &mut Context,
        _bus: &MessageBus,
        tx: &Transaction,
    ) -> Result<(), crate::Error> {
        if tx.signer.is_reserved() {
            return Err(Error::ForbiddenReservedAddress.into());
        }
        match tx.method {
            METHOD_TRANSFER => {
                let body: Transfer = decode_body(&tx.body)?;
                Ok(transfer(ctx, tx.signer, &body)?)
            }
            METHOD_BURN => {
                let body: Burn = decode_body(&tx.body)?;
                Ok(burn(ctx, tx.signer, &body)?)
            }
            METHOD_ADD_ESCROW => {
                let body: Escrow = decode_body(&tx.body)?;
                Ok(add_escrow(ctx, tx.signer, &body)?)
            }
            METHOD_RECLAIM_ESCROW => {
                let body: ReclaimEscrow = decode_body(&tx.body)?;
                Ok(reclaim_escrow(ctx, tx.signer, &body)?)
            }
            METHOD_AMEND_COMMISSION_SCHEDULE => {
                let body: AmendCommissionSchedule = decode_body(&tx.body)?;
                Ok(amend_commission_schedule(ctx, tx.signer, &body)?)
            }
            METHOD_ALLOW => {
                let body: Allow = decode_body(&tx.body)?;
                Ok(allow(ctx, tx.signer, &body)?)
            }
            METHOD_WITHDRAW => {
                let body: Withdraw = decode_body(&tx.body)?;
                Ok(withdraw(ctx, tx.signer, &body)?)
            }
            _ => Err(Error::InvalidArgument.into()),
        }
    }

    fn execute_message(
        &self,
        ctx: &mut Context,
        _bus: &MessageBus,
        msg: &Message,
    ) -> Result<Option<MessageResult>, crate::Error> {
        match msg {
            Message::RuntimeStaking(m) => {
                execute_runtime_message(ctx, m)?;
                Ok(Some(MessageResult::Empty))
            }
            Message::ValidateParameterChanges(m) => {
                if m.module != APP_NAME {
                    return Ok(None);
                }
                let _changes: ParameterChanges =
                    codec::from_slice(&m.changes).map_err(|_| Error::InvalidArgument)?;
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
    ) -> Result<Vec<crate::app::ValidatorUpdate>, crate::Error> {
        disburse_fees_proposer(ctx)?;

        if ctx.block().epoch_changed {
            let epoch = beacon::state::current_epoch(ctx.tree()).map_err(Error::State)?;
            on_epoch_change(ctx, epoch)?;
        }
        Ok(Vec::new())
    }
}

fn decode_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, Error> {
    codec::from_slice(body).map_err(|_| Error::InvalidArgument)
}

// ─── Genesis ───────────────────────────────────────────────────────────────

fn init_chain(ctx: &mut Context, genesis: &GenesisDocument) -> Result<(), Error> {
    let st = &genesis.staking;

    state::set_parameters(ctx, &st.parameters)?;
    state::set_common_pool(ctx.tree_mut(), &st.common_pool)?;
    state::set_last_block_fees(ctx.tree_mut(), &st.last_block_fees)?;
    state::set_governance_deposits(ctx.tree_mut(), &st.governance_deposits)?;
    state::set_total_supply(ctx.tree_mut(), &st.total_supply)?;

    // The declared total supply must equal the sum of everything the ledger
    // holds; a genesis document failing the audit is unusable.
    let mut computed = st.common_pool;
    computed.add(&st.last_block_fees)?;
    computed.add(&st.governance_deposits)?;

    for (addr, account) in &st.ledger {
        computed.add(&account.general.balance)?;
        computed.add(&account.escrow.active.balance)?;
        computed.add(&account.escrow.debonding.balance)?;
        state::set_account(ctx.tree_mut(), addr, account)?;
    }

    if computed != st.total_supply {
        return Err(Error::State(StateError::InvariantViolation(format!(
            "staking: genesis total supply mismatch: declared {} computed {computed}",
            st.total_supply,
        ))));
    }

    for (escrow, delegator, delegation) in &st.delegations {
        state::set_delegation(ctx.tree_mut(), delegator, escrow, delegation)?;
    }
    for (escrow, delegator, deb) in &st.debonding_delegations {
        state::set_debonding_delegation(
            ctx.tree_mut(),
            delegator,
            escrow,
            deb.debond_end_time,
            Some(deb),
        )?;
    }

    Ok(())
}

// ─── Transaction handlers ──────────────────────────────────────────────────

pub(super) fn transfer(ctx: &mut Context, signer: Address, body: &Transfer) -> Result<(), Error> {
    let params = state::parameters(ctx.tree())?;
    if body.amount < params.min_transfer_amount {
        return Err(Error::UnderMinTransferAmount);
    }
    state::transfer(ctx, &signer, &body.to, &body.amount)
}

pub(super) fn burn(ctx: &mut Context, signer: Address, body: &Burn) -> Result<(), Error> {
    let mut from = state::account(ctx.tree(), &signer)?;
    from.general
        .balance
        .sub(&body.amount)
        .map_err(|_| Error::InsufficientBalance)?;

    let mut supply = state::total_supply(ctx.tree())?;
    supply.sub(&body.amount).map_err(|_| {
        Error::State(StateError::InvariantViolation(
            "staking: burn exceeds total supply".into(),
        ))
    })?;

    state::set_account(ctx.tree_mut(), &signer, &from)?;
    state::set_total_supply(ctx.tree_mut(), &supply)?;

    ctx.emit_event(
        Event::Burn {
            owner: signer,
            amount: body.amount,
        }
        .into(),
    );
    Ok(())
}

pub(super) fn add_escrow(ctx: &mut Context, signer: Address, body: &Escrow) -> Result<(), Error> {
    if body.account.is_reserved() {
        return Err(Error::ForbiddenReservedAddress);
    }
    let params = state::parameters(ctx.tree())?;
    if body.amount < params.min_delegation_amount {
        return Err(Error::UnderMinDelegationAmount);
    }

    let mut from = state::account(ctx.tree(), &signer)?;
    // Delegating to self reuses the same account instance so both mutations
    // land in one write.
    let mut escrow_acct = if signer == body.account {
        None
    } else {
        Some(state::account(ctx.tree(), &body.account)?)
    };
    let mut delegation = state::delegation(ctx.tree(), &signer, &body.account)?;

    let new_shares = match &mut escrow_acct {
        Some(target) => target.escrow.active.deposit(
            &mut delegation.shares,
            &mut from.general.balance,
            &body.amount,
        )?,
        None => {
            // Self-delegation: split the borrow by taking the source
            // balance out of the account for the duration of the deposit.
            let mut src = from.general.balance;
            let issued =
                from.escrow
                    .active
                    .deposit(&mut delegation.shares, &mut src, &body.amount)?;
            from.general.balance = src;
            issued
        }
    };

    state::set_account(ctx.tree_mut(), &signer, &from)?;
    if let Some(acct) = &escrow_acct {
        state::set_account(ctx.tree_mut(), &body.account, acct)?;
    }
    state::set_delegation(ctx.tree_mut(), &signer, &body.account, &delegation)?;

    ctx.emit_event(
        Event::AddEscrow {
            owner: signer,
            escrow: body.account,
            amount: body.amount,
            new_shares,
        }
        .into(),
    );
    Ok(())
}

pub(super) fn reclaim_escrow(ctx: &mut Context, signer: Address, body: &ReclaimEscrow) -> Result<(), Error> {
    if body.shares.is_zero() {
        return Err(Error::InvalidArgument);
    }

    let params = state::parameters(ctx.tree())?;
    let epoch = beacon::state::current_epoch(ctx.tree())?;
    let debond_end = epoch.saturating_add(params.debonding_interval);

    let mut escrow_acct = state::account(ctx.tree(), &body.account)?;
    let mut delegation = state::delegation(ctx.tree(), &signer, &body.account)?;

    // Release stake from the active pool at the active share price, then
    // park it in the debonding pool until the end epoch. No stake reaches
    // the delegator's general balance yet.
    let mut stake = Quantity::ZERO;
    escrow_acct
        .escrow
        .active
        .withdraw(&mut stake, &mut delegation.shares, &body.shares)?;

    let amount = stake;
    let mut debonding_shares = Quantity::ZERO;
    escrow_acct
        .escrow
        .debonding
        .deposit(&mut debonding_shares, &mut stake, &amount)?;

    let deb = super::DebondingDelegation {
        shares: debonding_shares,
        debond_end_time: debond_end,
    };
    state::set_debonding_delegation(ctx.tree_mut(), &signer, &body.account, debond_end, Some(&deb))?;
    state::set_delegation(ctx.tree_mut(), &signer, &body.account, &delegation)?;
    state::set_account(ctx.tree_mut(), &body.account, &escrow_acct)?;

    ctx.emit_event(
        Event::ReclaimEscrow {
            owner: signer,
            escrow: body.account,
            amount,
            shares: body.shares,
        }
        .into(),
    );
    Ok(())
}

pub(super) fn amend_commission_schedule(
    ctx: &mut Context,
    signer: Address,
    body: &AmendCommissionSchedule,
) -> Result<(), Error> {
    let params = state::parameters(ctx.tree())?;
    let epoch = beacon::state::current_epoch(ctx.tree())?;

    let mut acct = state::account(ctx.tree(), &signer)?;
    acct.escrow.commission_schedule.amend(
        &body.amendment,
        epoch,
        &params.commission_schedule_rules,
    )?;
    state::set_account(ctx.tree_mut(), &signer, &acct)?;
    Ok(())
}

pub(super) fn allow(ctx: &mut Context, signer: Address, body: &Allow) -> Result<(), Error> {
    if body.beneficiary == signer {
        return Err(Error::InvalidArgument);
    }
    if body.beneficiary.is_reserved() {
        return Err(Error::ForbiddenReservedAddress);
    }

    let params = state::parameters(ctx.tree())?;
    let mut acct = state::account(ctx.tree(), &signer)?;

    let mut allowance = acct
        .general
        .allowances
        .get(&body.beneficiary)
        .copied()
        .unwrap_or(Quantity::ZERO);

    if body.negative {
        // Reducing below zero revokes the whole allowance.
        if allowance < body.amount_change {
            allowance = Quantity::ZERO;
        } else {
            allowance.sub(&body.amount_change)?;
        }
    } else {
        if params.max_allowances > 0
            && !acct.general.allowances.contains_key(&body.beneficiary)
            && acct.general.allowances.len() as u32 >= params.max_allowances
        {
            return Err(Error::TooManyAllowances);
        }
        allowance.add(&body.amount_change)?;
    }

    if allowance.is_zero() {
        acct.general.allowances.remove(&body.beneficiary);
    } else {
        acct.general.allowances.insert(body.beneficiary, allowance);
    }
    state::set_account(ctx.tree_mut(), &signer, &acct)?;

    ctx.emit_event(
        Event::AllowanceChange {
            owner: signer,
            beneficiary: body.beneficiary,
            allowance,
            negative: body.negative,
            amount_change: body.amount_change,
        }
        .into(),
    );
    Ok(())
}

pub(super) fn withdraw(ctx: &mut Context, signer: Address, body: &Withdraw) -> Result<(), Error> {
    if body.from == signer || body.from.is_reserved() {
        return Err(Error::InvalidArgument);
    }

    let mut from = state::account(ctx.tree(), &body.from)?;
    let mut allowance = from
        .general
        .allowances
        .get(&signer)
        .copied()
        .unwrap_or(Quantity::ZERO);
    if allowance < body.amount {
        return Err(Error::AllowanceExceeded);
    }

    let mut to = state::account(ctx.tree(), &signer)?;
    move_amount(&mut to.general.balance, &mut from.general.balance, &body.amount)
        .map_err(|_| Error::InsufficientBalance)?;

    let params = state::parameters(ctx.tree())?;
    if from.general.balance < params.min_transact_balance {
        return Err(Error::BalanceTooLow("allowing account"));
    }
    if to.general.balance < params.min_transact_balance {
        return Err(Error::BalanceTooLow("beneficiary account"));
    }

    allowance.sub(&body.amount)?;
    if allowance.is_zero() {
        from.general.allowances.remove(&signer);
    } else {
        from.general.allowances.insert(signer, allowance);
    }

    state::set_account(ctx.tree_mut(), &body.from, &from)?;
    state::set_account(ctx.tree_mut(), &signer, &to)?;

    ctx.emit_event(
        Event::Transfer {
            from: body.from,
            to: signer,
            amount: body.amount,
        }
        .into(),
    );
    ctx.emit_event(
        Event::AllowanceChange {
            owner: body.from,
            beneficiary: signer,
            allowance,
            negative: true,
            amount_change: body.amount,
        }
        .into(),
    );
    Ok(())
}

// ─── Runtime messages ──────────────────────────────────────────────────────

fn execute_runtime_message(
    ctx: &mut Context,
    m: &crate::app::RuntimeStakingMessage,
) -> Result<(), Error> {
    let params = state::parameters(ctx.tree())?;
    match &m.msg {
        StakingMessage::Transfer(body) => state::transfer(ctx, &m.origin, &body.to, &body.amount),
        StakingMessage::Withdraw(body) => withdraw(ctx, m.origin, body),
        StakingMessage::AddEscrow(body) => {
            if !params.allow_escrow_messages {
                return Err(Error::EscrowMessagesDisabled);
            }
            add_escrow(ctx, m.origin, body)
        }
        StakingMessage::ReclaimEscrow(body) => {
            if !params.allow_escrow_messages {
                return Err(Error::EscrowMessagesDisabled);
            }
            reclaim_escrow(ctx, m.origin, body)
        }
    }
}

// ─── Per-block processing ──────────────────────────────────────────────────

fn resolve_entity(ctx: &Context, consensus_key: &PublicKey) -> Result<Option<Address>, Error> {
    let node = registry::state::node_by_consensus_key(ctx.tree(), consensus_key)?;
    Ok(node.map(|n| n.entity_address()))
}

fn begin_block(ctx: &mut Context) -> Result<(), Error> {
    // Resolve the proposer and the previous block's voters to entities.
    let proposer_entity = match ctx.block().proposer_consensus_key {
        Some(key) => resolve_entity(ctx, &key)?,
        None => None,
    };

    let votes = ctx.block().last_commit.clone();
    let num_eligible_validators = votes.len() as u64;
    let mut voting_entities = Vec::new();
    for vote in &votes {
        if !vote.voted {
            continue;
        }
        if let Some(addr) = resolve_entity(ctx, &vote.consensus_key)? {
            voting_entities.push(addr);
        }
    }

    disburse_fees_voters(ctx, &voting_entities)?;

    ctx.block_mut().proposer_entity = proposer_entity;

    // Proposing reward, attenuated by how many eligible validators voted.
    if let Some(proposer) = proposer_entity {
        if num_eligible_validators > 0 {
            let params = state::parameters(ctx.tree())?;
            let epoch = beacon::state::current_epoch(ctx.tree())?;
            state::add_reward_single_attenuated(
                ctx,
                epoch,
                &params.reward_factor_block_proposed,
                voting_entities.len() as u64,
                num_eligible_validators,
                &proposer,
            )?;
        }
    }

    // Track signing for the per-epoch signing reward.
    let mut es = state::epoch_signing(ctx.tree())?;
    es.update(&voting_entities)?;
    state::set_epoch_signing(ctx.tree_mut(), &es)?;

    // Slash for any misbehaviour evidence delivered with this block. The
    // evidence itself was already verified by the consensus engine.
    let misbehavior = ctx.block().misbehavior.clone();
    for evidence in &misbehavior {
        let reason = match evidence.kind {
            MisbehaviorKind::DuplicateVote => SlashReason::ConsensusEquivocation,
            MisbehaviorKind::LightClientAttack => SlashReason::ConsensusLightClientAttack,
        };
        on_evidence(ctx, reason, &evidence.consensus_key)?;
    }

    Ok(())
}

/// Splits the previous block's fees: the voter share is divided equally
/// among entities that voted, the proposer share stays in the last-block
/// fees until EndBlock, and rounding dust goes to the common pool.
pub(super) fn disburse_fees_voters(ctx: &mut Context, voting_entities: &[Address]) -> Result<(), Error> {
    let mut fees = state::last_block_fees(ctx.tree())?;
    if fees.is_zero() {
        return Ok(());
    }

    let params = state::parameters(ctx.tree())?;
    let mut weight_total = params.fee_split_weight_vote;
    weight_total.add(&params.fee_split_weight_propose)?;

    if weight_total.is_zero() {
        // No split configured: everything to the common pool.
        let mut pool = state::common_pool(ctx.tree())?;
        let amount = fees;
        move_amount(&mut pool, &mut fees, &amount)?;
        state::set_common_pool(ctx.tree_mut(), &pool)?;
        state::set_last_block_fees(ctx.tree_mut(), &fees)?;
        return Ok(());
    }

    let voters_total = fees.mul_quo(&params.fee_split_weight_vote, &weight_total)?;

    let mut disbursed = Quantity::ZERO;
    if !voting_entities.is_empty() {
        let mut per_voter = voters_total;
        per_voter.quo(&Quantity::from(voting_entities.len() as u64))?;
        if !per_voter.is_zero() {
            for addr in voting_entities {
                let mut acct = state::account(ctx.tree(), addr)?;
                move_amount(&mut acct.general.balance, &mut fees, &per_voter)?;
                disbursed.add(&per_voter)?;
                state::set_account(ctx.tree_mut(), addr, &acct)?;
                ctx.emit_event(
                    Event::Transfer {
                        from: eks_common::address::fee_accumulator_address(),
                        to: *addr,
                        amount: per_voter,
                    }
                    .into(),
                );
            }
        }
    }

    // Whatever the voters did not receive of their share is dust; move it
    // to the common pool so the proposer share left behind is exact.
    let mut dust = voters_total;
    dust.sub(&disbursed)?;
    if !dust.is_zero() {
        let mut pool = state::common_pool(ctx.tree())?;
        move_amount(&mut pool, &mut fees, &dust)?;
        state::set_common_pool(ctx.tree_mut(), &pool)?;
    }

    // `fees` now holds exactly the proposer share; it is paid in EndBlock
    // once this block's proposer entity is known.
    state::set_last_block_fees(ctx.tree_mut(), &fees)?;
    Ok(())
}

/// Pays the reserved proposer share and rolls this block's accumulated
/// transaction fees into the last-block fees.
pub(super) fn disburse_fees_proposer(ctx: &mut Context) -> Result<(), Error> {
    let mut fees = state::last_block_fees(ctx.tree())?;
    if !fees.is_zero() {
        let amount = fees;
        match ctx.block().proposer_entity {
            Some(proposer) => {
                let mut acct = state::account(ctx.tree(), &proposer)?;
                move_amount(&mut acct.general.balance, &mut fees, &amount)?;
                state::set_account(ctx.tree_mut(), &proposer, &acct)?;
                ctx.emit_event(
                    Event::Transfer {
                        from: eks_common::address::fee_accumulator_address(),
                        to: proposer,
                        amount,
                    }
                    .into(),
                );
            }
            None => {
                let mut pool = state::common_pool(ctx.tree())?;
                move_amount(&mut pool, &mut fees, &amount)?;
                state::set_common_pool(ctx.tree_mut(), &pool)?;
            }
        }
    }

    let accumulated = std::mem::take(&mut ctx.block_mut().fee_accumulator);
    state::set_last_block_fees(ctx.tree_mut(), &accumulated)?;
    Ok(())
}

pub(super) fn on_evidence(
    ctx: &mut Context,
    reason: SlashReason,
    consensus_key: &PublicKey,
) -> Result<(), Error> {
    let Some(node) = registry::state::node_by_consensus_key(ctx.tree(), consensus_key)? else {
        debug!(%consensus_key, "misbehaving validator not found in registry");
        return Ok(());
    };

    let status = registry::state::node_status(ctx.tree(), &node.id)?;
    if status.is_frozen() {
        // Already frozen: this evidence has been acted upon.
        return Ok(());
    }

    let params = state::parameters(ctx.tree())?;
    let Some(slash) = params.slashing.get(&reason).cloned() else {
        debug!(?reason, "no slashing parameters for reason");
        return Ok(());
    };

    let entity_addr = node.entity_address();
    if !slash.amount.is_zero() {
        state::slash_escrow(ctx, &entity_addr, &slash.amount)?;
    }

    if slash.freeze_interval > 0 {
        let epoch = beacon::state::current_epoch(ctx.tree())?;
        let freeze_end = if slash.freeze_interval == registry::FREEZE_FOREVER {
            registry::FREEZE_FOREVER
        } else {
            epoch.saturating_add(slash.freeze_interval)
        };
        registry::state::freeze_node(ctx.tree_mut(), &node.id, freeze_end)?;
        ctx.emit_event(registry::Event::NodeFrozen { node_id: node.id }.into());
    }

    Ok(())
}

// ─── Epoch processing ──────────────────────────────────────────────────────

pub(super) fn on_epoch_change(ctx: &mut Context, epoch: EpochTime) -> Result<(), Error> {
    // Release every debonding delegation whose end epoch has been reached.
    let expired = state::expired_debonding_queue(ctx.tree(), epoch)?;
    for entry in expired {
        let shares = entry.delegation.shares;

        let mut delegator = state::account(ctx.tree(), &entry.delegator)?;
        // Self-delegation shares a single account instance.
        let mut escrow_acct = if entry.delegator == entry.escrow {
            None
        } else {
            Some(state::account(ctx.tree(), &entry.escrow)?)
        };

        let mut released = Quantity::ZERO;
        {
            let target = escrow_acct.as_mut().unwrap_or(&mut delegator);
            let mut deb_shares = shares;
            target
                .escrow
                .debonding
                .withdraw(&mut released, &mut deb_shares, &shares)?;
        }
        delegator.general.balance.add(&released)?;

        state::remove_from_debonding_queue(ctx.tree_mut(), entry.epoch, &entry.delegator, &entry.escrow)?;
        state::set_debonding_delegation(
            ctx.tree_mut(),
            &entry.delegator,
            &entry.escrow,
            entry.delegation.debond_end_time,
            None,
        )?;
        state::set_account(ctx.tree_mut(), &entry.delegator, &delegator)?;
        if let Some(acct) = &escrow_acct {
            state::set_account(ctx.tree_mut(), &entry.escrow, acct)?;
        }

        debug!(
            delegator = %entry.delegator,
            escrow = %entry.escrow,
            amount = %released,
            "released debonded stake"
        );

        ctx.emit_event(
            Event::ReclaimEscrow {
                owner: entry.delegator,
                escrow: entry.escrow,
                amount: released,
                shares,
            }
            .into(),
        );
    }

    reward_epoch_signing(ctx, epoch)?;
    Ok(())
}

/// Pays the signing reward to entities that signed at least the threshold
/// fraction of the epoch's blocks, then resets the tallies.
fn reward_epoch_signing(ctx: &mut Context, epoch: EpochTime) -> Result<(), Error> {
    let params = state::parameters(ctx.tree())?;
    let es = state::epoch_signing(ctx.tree())?;

    if es.total > 0 && params.signing_reward_threshold_denominator > 0 {
        let eligible = es.eligible_entities(
            params.signing_reward_threshold_numerator,
            params.signing_reward_threshold_denominator,
        )?;
        if !eligible.is_empty() {
            state::add_rewards(ctx, epoch, &params.reward_factor_epoch_signed, &eligible)?;
        }
    }

    state::clear_epoch_signing(ctx.tree_mut())?;
    Ok(())
}
