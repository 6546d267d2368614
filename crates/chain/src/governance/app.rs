//! The governance application.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use eks_common::{codec, Address, Quantity};

use crate::app::{
    Application, ChangeParametersMessage, Message, MessageBus, MessageKind, MessageResult,
    Transaction,
};
use crate::beacon;
use crate::context::Context;
use crate::genesis::Genesis as GenesisDocument;
use crate::registry;
use crate::scheduler;
use crate::staking;
use crate::types::EpochTime;

use super::state;
use super::{
    pending_upgrades_from_proposals, Error, Event, ParameterChanges, Proposal, ProposalContent,
    ProposalContentBody, ProposalState, ProposalVote, UpgradeDescriptor, Vote, APP_NAME,
    METHOD_CAST_VOTE, METHOD_SUBMIT_PROPOSAL,
};

/// The governance application.
pub struct App;

impl Application for App {
    fn name(&self) -> &'static str {
        APP_NAME
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![registry::APP_NAME, staking::APP_NAME, scheduler::APP_NAME]
    }

    fn methods(&self) -> Vec<&'static str> {
        vec![METHOD_SUBMIT_PROPOSAL, METHOD_CAST_VOTE]
    }

    fn subscriptions(&self) -> Vec<MessageKind> {
        vec![
            MessageKind::ValidateParameterChanges,
            MessageKind::ChangeParameters,
        ]
    }

    fn init_chain(&self, ctx: &mut Context, genesis: &GenesisDocument) -> Result<(), crate::Error> {
        let st = &genesis.governance;
        let epoch = beacon::state::current_epoch(ctx.tree()).map_err(Error::State)?;

        if let Some(params) = &st.parameters {
            state::set_parameters(ctx, params).map_err(Error::State)?;
        }

        let mut largest_id = 0u64;
        for proposal in &st.proposals {
            largest_id = largest_id.max(proposal.id);
            state::set_proposal(ctx.tree_mut(), proposal).map_err(Error::State)?;
            for entry in st.vote_entries.get(&proposal.id).into_iter().flatten() {
                state::set_vote(ctx.tree_mut(), proposal.id, &entry.voter, entry.vote)
                    .map_err(Error::State)?;
            }
        }

        for (id, descriptor) in pending_upgrades_from_proposals(&st.proposals, epoch) {
            state::set_pending_upgrade(ctx.tree_mut(), id, &descriptor).map_err(Error::State)?;
        }

        state::set_next_proposal_identifier(ctx.tree_mut(), largest_id + 1)
            .map_err(Error::State)?;
        Ok(())
    }

    fn execute_tx(
        &self,
        ctx: &mut Context,
        bus: &MessageBus,
        tx: &Transaction,
    ) -> Result<(), crate::Error> {
        match tx.method {
            METHOD_SUBMIT_PROPOSAL => {
                let body: ProposalContentBody =
                    codec::from_slice(&tx.body).map_err(|_| Error::InvalidArgument)?;
                submit_proposal(ctx, bus, tx.signer, body.content)
            }
            METHOD_CAST_VOTE => {
                let body: ProposalVote =
                    codec::from_slice(&tx.body).map_err(|_| Error::InvalidArgument)?;
                Ok(cast_vote(ctx, tx.signer, &body)?)
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
        bus: &MessageBus,
    ) -> Result<Vec<crate::app::ValidatorUpdate>, crate::Error> {
        if !ctx.block().epoch_changed {
            return Ok(Vec::new());
        }
        let epoch = beacon::state::current_epoch(ctx.tree()).map_err(Error::State)?;

        for id in state::proposals_closing_at(ctx.tree(), epoch).map_err(Error::State)? {
            close_proposal(ctx, bus, id)?;
        }

        state::prune_pending_upgrades(ctx.tree_mut(), epoch).map_err(Error::State)?;
        Ok(Vec::new())
    }
}

pub(super) fn submit_proposal(
    ctx: &mut Context,
    bus: &MessageBus,
    signer: Address,
    content: ProposalContent,
) -> Result<(), crate::Error> {
    let params = state::parameters(ctx.tree()).map_err(Error::State)?;
    let epoch = beacon::state::current_epoch(ctx.tree()).map_err(Error::State)?;

    // Validate the content before taking the deposit.
    match &content {
        ProposalContent::Upgrade(descriptor) => {
            validate_upgrade(ctx, descriptor, epoch, &params)?;
        }
        ProposalContent::CancelUpgrade { proposal_id } => {
            // The target must still be cancellable when submitted; the
            // cutoff is enforced again when the cancellation passes.
            let (up_epoch, _) = find_pending_upgrade(ctx, *proposal_id)?;
            if up_epoch < epoch.saturating_add(params.upgrade_cancel_min_epoch_diff) {
                return Err(Error::UpgradeTooSoon.into());
            }
        }
        ProposalContent::ChangeParameters { module, changes } => {
            if !params.enable_change_parameters_proposal {
                return Err(Error::ChangeParametersDisabled.into());
            }
            if module.is_empty() {
                return Err(Error::InvalidArgument.into());
            }
            // Ask the owning module to validate; exactly zero responders
            // means nobody owns the module.
            let results = bus.publish(
                ctx,
                &Message::ValidateParameterChanges(ChangeParametersMessage {
                    module: module.clone(),
                    changes: changes.clone(),
                }),
            )?;
            if results.is_empty() {
                return Err(Error::UnknownModule.into());
            }
        }
    }

    staking::state::transfer_to_governance_deposits(ctx, &signer, &params.min_proposal_deposit)
        .map_err(Error::Staking)?;

    let id = state::next_proposal_identifier(ctx.tree()).map_err(Error::State)?;
    state::set_next_proposal_identifier(ctx.tree_mut(), id + 1).map_err(Error::State)?;

    let proposal = Proposal {
        id,
        submitter: signer,
        deposit: params.min_proposal_deposit,
        content,
        state: ProposalState::Active,
        created_at: epoch,
        closes_at: epoch.saturating_add(params.voting_period),
        results: Default::default(),
        invalid_votes: 0,
    };
    state::set_proposal(ctx.tree_mut(), &proposal).map_err(Error::State)?;

    ctx.emit_event(Event::ProposalSubmitted { id, submitter: signer }.into());
    Ok(())
}

fn validate_upgrade(
    ctx: &Context,
    descriptor: &UpgradeDescriptor,
    epoch: EpochTime,
    params: &super::Parameters,
) -> Result<(), Error> {
    if descriptor.handler.is_empty() {
        return Err(Error::InvalidArgument);
    }
    if descriptor.epoch < epoch.saturating_add(params.upgrade_min_epoch_diff) {
        return Err(Error::UpgradeTooSoon);
    }
    for (_, pending) in state::pending_upgrades(ctx.tree())? {
        if pending == *descriptor {
            return Err(Error::UpgradeAlreadyPending);
        }
    }
    Ok(())
}

fn find_pending_upgrade(
    ctx: &Context,
    proposal_id: u64,
) -> Result<(EpochTime, UpgradeDescriptor), Error> {
    for (id, descriptor) in state::pending_upgrades(ctx.tree())? {
        if id == proposal_id {
            return Ok((descriptor.epoch, descriptor));
        }
    }
    Err(Error::NoSuchUpgrade)
}

/// The electorate for proposal voting: entity addresses of the current
/// validator set. In the default strict mode an entity only remains part
/// of the electorate while it still has a registered node; with
/// `allow_vote_without_entity` set, validator-set membership alone is
/// enough.
fn voting_entities(
    ctx: &Context,
    params: &super::Parameters,
) -> Result<BTreeSet<Address>, Error> {
    let validators = scheduler::state::current_validators(ctx.tree())?;
    let mut entities: BTreeSet<Address> = validators
        .values()
        .map(|v| Address::from_public_key(&v.entity_id))
        .collect();

    if !params.allow_vote_without_entity {
        let registered: BTreeSet<Address> = registry::state::nodes(ctx.tree())?
            .iter()
            .map(|node| node.entity_address())
            .collect();
        entities.retain(|entity| registered.contains(entity));
    }
    Ok(entities)
}

pub(super) fn cast_vote(ctx: &mut Context, signer: Address, body: &ProposalVote) -> Result<(), Error> {
    let proposal = state::proposal(ctx.tree(), body.id)?.ok_or(Error::NoSuchProposal)?;
    if proposal.state != ProposalState::Active {
        return Err(Error::VotingIsClosed);
    }
    let epoch = beacon::state::current_epoch(ctx.tree())?;
    if epoch > proposal.closes_at {
        return Err(Error::VotingIsClosed);
    }

    let params = state::parameters(ctx.tree())?;
    if !voting_entities(ctx, &params)?.contains(&signer) {
        return Err(Error::NotEligible);
    }

    state::set_vote(ctx.tree_mut(), body.id, &signer, body.vote)?;
    ctx.emit_event(
        Event::Vote {
            id: body.id,
            submitter: signer,
            vote: body.vote,
        }
        .into(),
    );
    Ok(())
}

pub(super) fn close_proposal(
    ctx: &mut Context,
    bus: &MessageBus,
    id: u64,
) -> Result<(), crate::Error> {
    let Some(mut proposal) = state::proposal(ctx.tree(), id).map_err(Error::State)? else {
        return Err(Error::NoSuchProposal.into());
    };

    let params = state::parameters(ctx.tree()).map_err(Error::State)?;
    let entities = voting_entities(ctx, &params)?;

    // Tally by the voters' active escrow at closing time; the electorate's
    // total stake sets the quorum baseline.
    let mut total_voting_stake = Quantity::ZERO;
    for entity in &entities {
        let acct = staking::state::account(ctx.tree(), entity).map_err(Error::State)?;
        total_voting_stake
            .add(&acct.escrow.active.balance)
            .map_err(Error::Arithmetic)?;
    }

    let mut results = std::collections::BTreeMap::new();
    let mut cast_stake = Quantity::ZERO;
    let mut invalid_votes = 0u64;
    for entry in state::votes(ctx.tree(), id).map_err(Error::State)? {
        if !entities.contains(&entry.voter) {
            invalid_votes += 1;
            continue;
        }
        let acct = staking::state::account(ctx.tree(), &entry.voter).map_err(Error::State)?;
        let weight = acct.escrow.active.balance;
        if weight.is_zero() {
            invalid_votes += 1;
            continue;
        }
        results
            .entry(entry.vote)
            .or_insert(Quantity::ZERO)
            .add(&weight)
            .map_err(Error::Arithmetic)?;
        cast_stake.add(&weight).map_err(Error::Arithmetic)?;
    }

    proposal.results = results;
    proposal.invalid_votes = invalid_votes;

    let accepted = tally_passes(&proposal, &cast_stake, &total_voting_stake, &params)
        .map_err(Error::Arithmetic)?;

    proposal.state = if accepted {
        match execute_proposal(ctx, bus, &proposal) {
            Ok(()) => {
                ctx.emit_event(Event::ProposalExecuted { id }.into());
                ProposalState::Passed
            }
            Err(err) => {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(id, %err, "accepted proposal failed to execute");
                ProposalState::Failed
            }
        }
    } else {
        ProposalState::Rejected
    };

    // The deposit returns to the submitter when the proposal passes;
    // otherwise it is forfeited to the common pool.
    if proposal.state == ProposalState::Passed {
        staking::state::transfer_from_governance_deposits(ctx, &proposal.submitter, &proposal.deposit)
            .map_err(Error::Staking)?;
    } else {
        staking::state::discard_governance_deposit(ctx, &proposal.deposit)
            .map_err(Error::Staking)?;
    }

    state::set_proposal(ctx.tree_mut(), &proposal).map_err(Error::State)?;

    debug!(id, state = ?proposal.state, "proposal closed");
    ctx.emit_event(
        Event::ProposalFinalized {
            id,
            state: proposal.state,
        }
        .into(),
    );

    Ok(())
}

/// Quorum: cast stake must reach `quorum`% of the electorate's stake.
/// Threshold: yes stake must reach `threshold`% of the cast stake.
pub(super) fn tally_passes(
    proposal: &Proposal,
    cast_stake: &Quantity,
    total_voting_stake: &Quantity,
    params: &super::Parameters,
) -> Result<bool, eks_common::QuantityError> {
    if total_voting_stake.is_zero() || cast_stake.is_zero() {
        return Ok(false);
    }

    let mut cast_scaled = *cast_stake;
    cast_scaled.mul(&Quantity::new(100))?;
    let mut quorum_bar = *total_voting_stake;
    quorum_bar.mul(&Quantity::from(params.quorum as u64))?;
    if cast_scaled < quorum_bar {
        return Ok(false);
    }

    let yes = proposal
        .results
        .get(&Vote::Yes)
        .copied()
        .unwrap_or(Quantity::ZERO);
    let mut yes_scaled = yes;
    yes_scaled.mul(&Quantity::new(100))?;
    let mut threshold_bar = *cast_stake;
    threshold_bar.mul(&Quantity::from(params.threshold as u64))?;
    Ok(yes_scaled >= threshold_bar)
}

fn execute_proposal(
    ctx: &mut Context,
    bus: &MessageBus,
    proposal: &Proposal,
) -> Result<(), crate::Error> {
    match &proposal.content {
        ProposalContent::Upgrade(descriptor) => {
            // Re-check for conflicts; another upgrade may have passed since
            // submission.
            for (_, pending) in state::pending_upgrades(ctx.tree()).map_err(Error::State)? {
                if pending == *descriptor {
                    return Err(Error::UpgradeAlreadyPending.into());
                }
            }
            state::set_pending_upgrade(ctx.tree_mut(), proposal.id, descriptor)
                .map_err(Error::State)?;
            Ok(())
        }
        ProposalContent::CancelUpgrade { proposal_id } => {
            let (up_epoch, _) = find_pending_upgrade(ctx, *proposal_id)?;
            let epoch = beacon::state::current_epoch(ctx.tree()).map_err(Error::State)?;
            let params = state::parameters(ctx.tree()).map_err(Error::State)?;
            if up_epoch < epoch.saturating_add(params.upgrade_cancel_min_epoch_diff) {
                return Err(Error::UpgradeTooSoon.into());
            }
            state::remove_pending_upgrade(ctx.tree_mut(), up_epoch, *proposal_id)
                .map_err(Error::State)?;
            Ok(())
        }
        ProposalContent::ChangeParameters { module, changes } => {
            let results = bus.publish(
                ctx,
                &Message::ChangeParameters(ChangeParametersMessage {
                    module: module.clone(),
                    changes: changes.clone(),
                }),
            )?;
            if results.is_empty() {
                return Err(Error::UnknownModule.into());
            }
            Ok(())
        }
    }
}
