//! Staking application tests.
//!
//! Every test is deterministic: fixed addresses, explicit epochs, no clock.

use eks_common::{Address, PublicKey, Quantity};

use crate::beacon;
use crate::context::{BlockInfo, Context, Mode};
use crate::events::Event as ChainEvent;
use crate::mkvs::MemoryTree;

use super::app as handlers;
use super::state;
use super::{
    Burn, CommissionRateBoundStep, CommissionRateStep, CommissionSchedule, Error, Escrow, Event,
    Parameters, ReclaimEscrow, RewardStep, Transfer, Allow, Withdraw,
};

fn addr(seed: u8) -> Address {
    Address::from_public_key(&PublicKey([seed; 32]))
}

fn base_params() -> Parameters {
    Parameters {
        min_transact_balance: Quantity::new(1),
        debonding_interval: 2,
        fee_split_weight_vote: Quantity::new(1),
        fee_split_weight_propose: Quantity::new(1),
        signing_reward_threshold_numerator: 3,
        signing_reward_threshold_denominator: 4,
        ..Default::default()
    }
}

/// Builds a tree holding parameters, funded accounts and a matching total
/// supply, at epoch 0.
fn setup(params: &Parameters, balances: &[(Address, u128)]) -> MemoryTree {
    let mut tree = MemoryTree::new();
    let mut block = BlockInfo::default();
    {
        let mut ctx = Context::new(Mode::InitChain, &mut tree, &mut block, 0, 0);
        state::set_parameters(&mut ctx, params).unwrap();
    }

    let mut supply = Quantity::ZERO;
    for (address, amount) in balances {
        let mut acct = state::account(&tree, address).unwrap();
        acct.general.balance = Quantity::new(*amount);
        supply.add(&acct.general.balance).unwrap();
        state::set_account(&mut tree, address, &acct).unwrap();
    }
    state::set_total_supply(&mut tree, &supply).unwrap();
    beacon::state::set_base_epoch(&mut tree, 0).unwrap();
    beacon::state::set_current_epoch(&mut tree, 0).unwrap();
    tree
}

/// Runs `f` in an ExecuteTx context, returning its result together with the
/// events the invocation staged.
fn run_tx<T>(
    tree: &mut MemoryTree,
    f: impl FnOnce(&mut Context) -> Result<T, Error>,
) -> (Result<T, Error>, Vec<ChainEvent>) {
    let mut block = BlockInfo::default();
    run_in_block(tree, &mut block, Mode::ExecuteTx, f)
}

fn run_in_block<T>(
    tree: &mut MemoryTree,
    block: &mut BlockInfo,
    mode: Mode,
    f: impl FnOnce(&mut Context) -> Result<T, Error>,
) -> (Result<T, Error>, Vec<ChainEvent>) {
    let mut ctx = Context::new(mode, tree, block, 1, 0);
    let result = f(&mut ctx);
    let events = ctx.take_staged_events();
    (result, events)
}

fn staking_events(events: &[ChainEvent]) -> Vec<Event> {
    events
        .iter()
        .filter_map(|e| match e {
            ChainEvent::Staking(e) => Some(e.clone()),
            _ => None,
        })
        .collect()
}

fn supply_components(tree: &MemoryTree) -> Quantity {
    let mut sum = state::common_pool(tree).unwrap();
    sum.add(&state::governance_deposits(tree).unwrap()).unwrap();
    sum.add(&state::last_block_fees(tree).unwrap()).unwrap();
    for address in state::addresses(tree).unwrap() {
        let acct = state::account(tree, &address).unwrap();
        sum.add(&acct.general.balance).unwrap();
        sum.add(&acct.escrow.active.balance).unwrap();
        sum.add(&acct.escrow.debonding.balance).unwrap();
    }
    sum
}

#[test]
fn transfer_moves_funds_and_emits_event() {
    let (alice, bob) = (addr(1), addr(2));
    let mut tree = setup(&base_params(), &[(alice, 1000)]);

    let (result, events) = run_tx(&mut tree, |ctx| {
        handlers::transfer(ctx, alice, &Transfer { to: bob, amount: Quantity::new(500) })
    });
    result.unwrap();

    assert_eq!(state::account(&tree, &alice).unwrap().general.balance, Quantity::new(500));
    assert_eq!(state::account(&tree, &bob).unwrap().general.balance, Quantity::new(500));
    assert_eq!(state::total_supply(&tree).unwrap(), Quantity::new(1000));
    assert_eq!(supply_components(&tree), Quantity::new(1000));

    assert_eq!(
        staking_events(&events),
        vec![Event::Transfer { from: alice, to: bob, amount: Quantity::new(500) }]
    );
}

#[test]
fn transfer_fails_when_balance_would_drop_under_minimum() {
    let (alice, bob) = (addr(1), addr(2));
    let mut params = base_params();
    params.min_transact_balance = Quantity::new(600);
    let mut tree = setup(&params, &[(alice, 1000)]);

    let (result, events) = run_tx(&mut tree, |ctx| {
        handlers::transfer(ctx, alice, &Transfer { to: bob, amount: Quantity::new(500) })
    });
    assert!(matches!(result, Err(Error::BalanceTooLow(_))));
    assert!(events.is_empty());
    // Nothing moved.
    assert_eq!(state::account(&tree, &alice).unwrap().general.balance, Quantity::new(1000));
    assert!(state::account(&tree, &bob).unwrap().general.balance.is_zero());
}

#[test]
fn transfer_to_self_is_a_noop() {
    let alice = addr(1);
    let mut tree = setup(&base_params(), &[(alice, 1000)]);
    let (result, events) = run_tx(&mut tree, |ctx| {
        handlers::transfer(ctx, alice, &Transfer { to: alice, amount: Quantity::new(500) })
    });
    result.unwrap();
    assert!(events.is_empty());
    assert_eq!(state::account(&tree, &alice).unwrap().general.balance, Quantity::new(1000));
}

#[test]
fn burn_reduces_account_and_total_supply() {
    let alice = addr(1);
    let mut tree = setup(&base_params(), &[(alice, 1000)]);

    let (result, events) = run_tx(&mut tree, |ctx| {
        handlers::burn(ctx, alice, &Burn { amount: Quantity::new(400) })
    });
    result.unwrap();

    assert_eq!(state::account(&tree, &alice).unwrap().general.balance, Quantity::new(600));
    assert_eq!(state::total_supply(&tree).unwrap(), Quantity::new(600));
    assert_eq!(
        staking_events(&events),
        vec![Event::Burn { owner: alice, amount: Quantity::new(400) }]
    );
}

#[test]
fn escrow_reclaim_and_maturation_roundtrip() {
    let (alice, entity) = (addr(1), addr(5));
    let mut tree = setup(&base_params(), &[(alice, 1000)]);

    // Deposit the full balance into the entity's escrow at epoch 0.
    let (result, events) = run_tx(&mut tree, |ctx| {
        handlers::add_escrow(ctx, alice, &Escrow { account: entity, amount: Quantity::new(1000) })
    });
    result.unwrap();
    assert_eq!(
        staking_events(&events),
        vec![Event::AddEscrow {
            owner: alice,
            escrow: entity,
            amount: Quantity::new(1000),
            new_shares: Quantity::new(1000),
        }]
    );
    let escrow_acct = state::account(&tree, &entity).unwrap();
    assert_eq!(escrow_acct.escrow.active.balance, Quantity::new(1000));
    assert_eq!(escrow_acct.escrow.active.total_shares, Quantity::new(1000));
    assert!(state::account(&tree, &alice).unwrap().general.balance.is_zero());

    // Reclaim everything at epoch 1; stake parks in the debonding pool.
    beacon::state::set_current_epoch(&mut tree, 1).unwrap();
    let (result, events) = run_tx(&mut tree, |ctx| {
        handlers::reclaim_escrow(ctx, alice, &ReclaimEscrow {
            account: entity,
            shares: Quantity::new(1000),
        })
    });
    result.unwrap();
    assert_eq!(
        staking_events(&events),
        vec![Event::ReclaimEscrow {
            owner: alice,
            escrow: entity,
            amount: Quantity::new(1000),
            shares: Quantity::new(1000),
        }]
    );

    let escrow_acct = state::account(&tree, &entity).unwrap();
    assert!(escrow_acct.escrow.active.balance.is_zero());
    assert!(escrow_acct.escrow.active.total_shares.is_zero());
    assert_eq!(escrow_acct.escrow.debonding.balance, Quantity::new(1000));
    let deb = state::debonding_delegation(&tree, &alice, &entity, 3).unwrap();
    assert_eq!(deb.shares, Quantity::new(1000));
    assert_eq!(deb.debond_end_time, 3);
    assert_eq!(state::debonding_queue_entries(&tree).unwrap().len(), 1);
    assert!(state::account(&tree, &alice).unwrap().general.balance.is_zero());
    assert_eq!(supply_components(&tree), Quantity::new(1000));

    // Nothing matures before the end epoch.
    assert!(state::expired_debonding_queue(&tree, 2).unwrap().is_empty());

    // At the end epoch the stake returns to the delegator's general
    // balance and all debonding records disappear.
    beacon::state::set_current_epoch(&mut tree, 3).unwrap();
    let mut block = BlockInfo::default();
    let (result, events) = run_in_block(&mut tree, &mut block, Mode::EndBlock, |ctx| {
        handlers::on_epoch_change(ctx, 3)
    });
    result.unwrap();
    assert_eq!(
        staking_events(&events),
        vec![Event::ReclaimEscrow {
            owner: alice,
            escrow: entity,
            amount: Quantity::new(1000),
            shares: Quantity::new(1000),
        }]
    );

    assert_eq!(state::account(&tree, &alice).unwrap().general.balance, Quantity::new(1000));
    let escrow_acct = state::account(&tree, &entity).unwrap();
    assert!(escrow_acct.escrow.debonding.balance.is_zero());
    assert!(escrow_acct.escrow.debonding.total_shares.is_zero());
    assert!(state::debonding_queue_entries(&tree).unwrap().is_empty());
    assert!(state::all_debonding_delegations(&tree).unwrap().is_empty());
    assert_eq!(supply_components(&tree), Quantity::new(1000));
}

#[test]
fn reclaim_more_shares_than_delegated_fails() {
    let (alice, entity) = (addr(1), addr(5));
    let mut tree = setup(&base_params(), &[(alice, 1000)]);
    run_tx(&mut tree, |ctx| {
        handlers::add_escrow(ctx, alice, &Escrow { account: entity, amount: Quantity::new(300) })
    })
    .0
    .unwrap();

    let (result, _) = run_tx(&mut tree, |ctx| {
        handlers::reclaim_escrow(ctx, alice, &ReclaimEscrow {
            account: entity,
            shares: Quantity::new(301),
        })
    });
    assert!(matches!(result, Err(Error::InsufficientStake)));
}

#[test]
fn slash_escrow_splits_between_pools_and_pays_common_pool() {
    let entity = addr(5);
    let mut tree = setup(&base_params(), &[]);

    let mut acct = state::account(&tree, &entity).unwrap();
    acct.escrow.active.balance = Quantity::new(600);
    acct.escrow.active.total_shares = Quantity::new(600);
    acct.escrow.debonding.balance = Quantity::new(400);
    acct.escrow.debonding.total_shares = Quantity::new(400);
    state::set_account(&mut tree, &entity, &acct).unwrap();
    state::set_total_supply(&mut tree, &Quantity::new(1000)).unwrap();

    let (result, events) = run_tx(&mut tree, |ctx| {
        state::slash_escrow(ctx, &entity, &Quantity::new(500))
    });
    assert_eq!(result.unwrap(), Quantity::new(500));

    let acct = state::account(&tree, &entity).unwrap();
    // Split 600:400 across the pools.
    assert_eq!(acct.escrow.active.balance, Quantity::new(300));
    assert_eq!(acct.escrow.debonding.balance, Quantity::new(200));
    // Shares never change; only the price drops.
    assert_eq!(acct.escrow.active.total_shares, Quantity::new(600));
    assert_eq!(acct.escrow.debonding.total_shares, Quantity::new(400));
    assert_eq!(state::common_pool(&tree).unwrap(), Quantity::new(500));
    assert_eq!(supply_components(&tree), Quantity::new(1000));

    assert_eq!(
        staking_events(&events),
        vec![Event::TakeEscrow {
            owner: entity,
            amount: Quantity::new(500),
            debonding_amount: Quantity::new(200),
        }]
    );
}

#[test]
fn slash_escrow_caps_at_total_escrow() {
    let entity = addr(5);
    let mut tree = setup(&base_params(), &[]);

    let mut acct = state::account(&tree, &entity).unwrap();
    acct.escrow.active.balance = Quantity::new(1000);
    acct.escrow.active.total_shares = Quantity::new(1000);
    state::set_account(&mut tree, &entity, &acct).unwrap();
    state::set_total_supply(&mut tree, &Quantity::new(1000)).unwrap();

    let (result, _) = run_tx(&mut tree, |ctx| {
        state::slash_escrow(ctx, &entity, &Quantity::new(i64::MAX as u128))
    });
    assert_eq!(result.unwrap(), Quantity::new(1000));
    let acct = state::account(&tree, &entity).unwrap();
    assert!(acct.escrow.active.balance.is_zero());
    assert_eq!(acct.escrow.active.total_shares, Quantity::new(1000));
    assert_eq!(state::common_pool(&tree).unwrap(), Quantity::new(1000));
}

#[test]
fn fee_disbursement_pays_voters_then_proposer() {
    let (voter_a, voter_b, proposer) = (addr(1), addr(2), addr(3));
    let mut tree = setup(&base_params(), &[]);
    state::set_last_block_fees(&mut tree, &Quantity::new(100)).unwrap();
    state::set_total_supply(&mut tree, &Quantity::new(100)).unwrap();

    let mut block = BlockInfo::default();
    let (result, _) = run_in_block(&mut tree, &mut block, Mode::BeginBlock, |ctx| {
        handlers::disburse_fees_voters(ctx, &[voter_a, voter_b])
    });
    result.unwrap();

    // Vote and propose weights are equal: voters split 50, proposer keeps 50.
    assert_eq!(state::account(&tree, &voter_a).unwrap().general.balance, Quantity::new(25));
    assert_eq!(state::account(&tree, &voter_b).unwrap().general.balance, Quantity::new(25));
    assert_eq!(state::last_block_fees(&tree).unwrap(), Quantity::new(50));

    block.proposer_entity = Some(proposer);
    let (result, _) = run_in_block(&mut tree, &mut block, Mode::EndBlock, |ctx| {
        handlers::disburse_fees_proposer(ctx)
    });
    result.unwrap();

    assert_eq!(state::account(&tree, &proposer).unwrap().general.balance, Quantity::new(50));
    assert!(state::last_block_fees(&tree).unwrap().is_zero());
    assert_eq!(supply_components(&tree), Quantity::new(100));
}

#[test]
fn fee_disbursement_without_proposer_goes_to_common_pool() {
    let mut tree = setup(&base_params(), &[]);
    state::set_last_block_fees(&mut tree, &Quantity::new(90)).unwrap();
    state::set_total_supply(&mut tree, &Quantity::new(90)).unwrap();

    let mut block = BlockInfo::default();
    run_in_block(&mut tree, &mut block, Mode::BeginBlock, |ctx| {
        handlers::disburse_fees_voters(ctx, &[])
    })
    .0
    .unwrap();
    // No voters: the voter share is dust and lands in the common pool.
    assert_eq!(state::common_pool(&tree).unwrap(), Quantity::new(45));

    run_in_block(&mut tree, &mut block, Mode::EndBlock, |ctx| {
        handlers::disburse_fees_proposer(ctx)
    })
    .0
    .unwrap();
    assert_eq!(state::common_pool(&tree).unwrap(), Quantity::new(90));
    assert_eq!(supply_components(&tree), Quantity::new(90));
}

#[test]
fn tx_fees_accumulate_into_next_block_fees() {
    let alice = addr(1);
    let mut tree = setup(&base_params(), &[(alice, 100)]);

    let mut block = BlockInfo::default();
    run_in_block(&mut tree, &mut block, Mode::ExecuteTx, |ctx| {
        state::take_tx_fee(ctx, alice, &Quantity::new(10))
    })
    .0
    .unwrap();
    assert_eq!(block.fee_accumulator, Quantity::new(10));
    assert_eq!(state::account(&tree, &alice).unwrap().general.balance, Quantity::new(90));

    run_in_block(&mut tree, &mut block, Mode::EndBlock, |ctx| {
        handlers::disburse_fees_proposer(ctx)
    })
    .0
    .unwrap();
    assert_eq!(state::last_block_fees(&tree).unwrap(), Quantity::new(10));
    assert_eq!(supply_components(&tree), Quantity::new(100));
}

#[test]
fn allow_then_withdraw_respects_allowance() {
    let (owner, beneficiary) = (addr(1), addr(2));
    let mut params = base_params();
    params.min_transact_balance = Quantity::ZERO;
    let mut tree = setup(&params, &[(owner, 1000)]);

    run_tx(&mut tree, |ctx| {
        handlers::allow(ctx, owner, &Allow {
            beneficiary,
            negative: false,
            amount_change: Quantity::new(100),
        })
    })
    .0
    .unwrap();

    let (result, events) = run_tx(&mut tree, |ctx| {
        handlers::withdraw(ctx, beneficiary, &Withdraw { from: owner, amount: Quantity::new(60) })
    });
    result.unwrap();
    assert_eq!(state::account(&tree, &owner).unwrap().general.balance, Quantity::new(940));
    assert_eq!(
        state::account(&tree, &beneficiary).unwrap().general.balance,
        Quantity::new(60)
    );
    assert_eq!(
        state::account(&tree, &owner).unwrap().general.allowances[&beneficiary],
        Quantity::new(40)
    );
    assert_eq!(staking_events(&events).len(), 2);

    // The remaining allowance no longer covers this withdrawal.
    let (result, _) = run_tx(&mut tree, |ctx| {
        handlers::withdraw(ctx, beneficiary, &Withdraw { from: owner, amount: Quantity::new(50) })
    });
    assert!(matches!(result, Err(Error::AllowanceExceeded)));
}

#[test]
fn allow_to_self_is_rejected() {
    let owner = addr(1);
    let mut tree = setup(&base_params(), &[(owner, 10)]);
    let (result, _) = run_tx(&mut tree, |ctx| {
        handlers::allow(ctx, owner, &Allow {
            beneficiary: owner,
            negative: false,
            amount_change: Quantity::new(1),
        })
    });
    assert!(matches!(result, Err(Error::InvalidArgument)));
}

#[test]
fn commission_schedule_index_tracks_non_empty_schedules() {
    let entity = addr(5);
    let mut tree = setup(&base_params(), &[]);
    assert!(state::commission_schedule_addresses(&tree).unwrap().is_empty());

    let mut acct = state::account(&tree, &entity).unwrap();
    acct.escrow.commission_schedule = CommissionSchedule {
        rates: vec![CommissionRateStep { start: 10, rate: Quantity::new(5000) }],
        bounds: vec![CommissionRateBoundStep {
            start: 10,
            rate_min: Quantity::ZERO,
            rate_max: Quantity::new(100_000),
        }],
    };
    state::set_account(&mut tree, &entity, &acct).unwrap();
    assert_eq!(state::commission_schedule_addresses(&tree).unwrap(), vec![entity]);

    acct.escrow.commission_schedule = CommissionSchedule::default();
    state::set_account(&mut tree, &entity, &acct).unwrap();
    assert!(state::commission_schedule_addresses(&tree).unwrap().is_empty());
}

#[test]
fn reward_deposits_commission_as_self_delegation() {
    let entity = addr(5);
    let delegator = addr(1);
    let mut params = base_params();
    params.reward_schedule = vec![RewardStep {
        until: 100,
        scale: Quantity::new(super::REWARD_AMOUNT_DENOMINATOR / 10), // 10% per event
    }];
    let mut tree = setup(&params, &[]);

    // Delegator holds the entire active pool; the entity takes 50%
    // commission.
    let mut acct = state::account(&tree, &entity).unwrap();
    acct.escrow.active.balance = Quantity::new(1000);
    acct.escrow.active.total_shares = Quantity::new(1000);
    acct.escrow.commission_schedule = CommissionSchedule {
        rates: vec![CommissionRateStep { start: 0, rate: Quantity::new(50_000) }],
        bounds: vec![CommissionRateBoundStep {
            start: 0,
            rate_min: Quantity::ZERO,
            rate_max: Quantity::new(100_000),
        }],
    };
    state::set_account(&mut tree, &entity, &acct).unwrap();
    state::set_delegation(
        &mut tree,
        &delegator,
        &entity,
        &super::Delegation { shares: Quantity::new(1000) },
    )
    .unwrap();
    state::set_common_pool(&mut tree, &Quantity::new(10_000)).unwrap();
    state::set_total_supply(&mut tree, &Quantity::new(11_000)).unwrap();

    let (result, events) = run_tx(&mut tree, |ctx| {
        state::add_rewards(ctx, 0, &Quantity::new(1), &[entity])
    });
    result.unwrap();

    // Reward = 1000 * 10% = 100; commission 50, delegators 50.
    let acct = state::account(&tree, &entity).unwrap();
    assert_eq!(acct.escrow.active.balance, Quantity::new(1100));
    // The delegator share raises the price without shares; the commission
    // share buys shares for the entity at the raised price.
    let entity_delegation = state::delegation(&tree, &entity, &entity).unwrap();
    assert_eq!(entity_delegation.shares, Quantity::new(50 * 1000 / 1050));
    assert_eq!(state::common_pool(&tree).unwrap(), Quantity::new(9_900));
    assert_eq!(supply_components(&tree), Quantity::new(11_000));

    let kinds: Vec<_> = staking_events(&events).iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, vec!["add_escrow", "transfer", "add_escrow"]);
}

#[test]
fn rewards_past_schedule_end_pay_nothing() {
    let entity = addr(5);
    let mut params = base_params();
    params.reward_schedule = vec![RewardStep { until: 5, scale: Quantity::new(1) }];
    let mut tree = setup(&params, &[]);
    state::set_common_pool(&mut tree, &Quantity::new(1000)).unwrap();
    state::set_total_supply(&mut tree, &Quantity::new(1000)).unwrap();

    let (result, events) = run_tx(&mut tree, |ctx| {
        state::add_rewards(ctx, 7, &Quantity::new(1), &[entity])
    });
    result.unwrap();
    assert!(events.is_empty());
    assert_eq!(state::common_pool(&tree).unwrap(), Quantity::new(1000));
}

#[test]
fn epoch_signing_threshold_selects_entities() {
    let (a, b) = (addr(1), addr(2));
    let mut es = state::EpochSigning::default();
    // Four blocks: a signs all four, b signs two.
    for signers in [vec![a, b], vec![a], vec![a, b], vec![a]] {
        es.update(&signers).unwrap();
    }
    assert_eq!(es.total, 4);
    // Threshold 3/4: a (4/4) qualifies, b (2/4) does not.
    assert_eq!(es.eligible_entities(3, 4).unwrap(), vec![a]);
    // Threshold 1/2: both qualify.
    assert_eq!(es.eligible_entities(1, 2).unwrap(), vec![a, b]);
}

#[test]
fn account_hooks_are_stored_per_kind() {
    let (owner, destination) = (addr(1), addr(2));
    let mut tree = setup(&base_params(), &[(owner, 10)]);

    state::set_account_hook(&mut tree, &owner, super::HookKind::Withdraw, &destination).unwrap();
    let acct = state::account(&tree, &owner).unwrap();
    assert_eq!(acct.general.hooks[&super::HookKind::Withdraw], destination);

    // Re-registering replaces the destination.
    state::set_account_hook(&mut tree, &owner, super::HookKind::Withdraw, &addr(3)).unwrap();
    let acct = state::account(&tree, &owner).unwrap();
    assert_eq!(acct.general.hooks[&super::HookKind::Withdraw], addr(3));
}

#[test]
fn debonding_delegations_merge_on_same_end_epoch() {
    let (alice, entity) = (addr(1), addr(5));
    let mut tree = setup(&base_params(), &[(alice, 1000)]);

    run_tx(&mut tree, |ctx| {
        handlers::add_escrow(ctx, alice, &Escrow { account: entity, amount: Quantity::new(1000) })
    })
    .0
    .unwrap();

    // Two reclaims in the same epoch share an end epoch and merge.
    for _ in 0..2 {
        run_tx(&mut tree, |ctx| {
            handlers::reclaim_escrow(ctx, alice, &ReclaimEscrow {
                account: entity,
                shares: Quantity::new(100),
            })
        })
        .0
        .unwrap();
    }

    let deb = state::debonding_delegation(&tree, &alice, &entity, 2).unwrap();
    assert_eq!(deb.shares, Quantity::new(200));
    assert_eq!(state::debonding_queue_entries(&tree).unwrap().len(), 1);
}
