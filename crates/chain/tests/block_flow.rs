//! End-to-end block processing across the full application set.
//!
//! Every test drives the dispatcher the way the consensus engine would:
//! InitChain once, then BeginBlock → transactions → EndBlock per block,
//! with the supplementary sanity auditor checking the financial invariants
//! after every block.

use eks_common::{codec, Address, PublicKey, Quantity};

use eks_chain::app::Transaction;
use eks_chain::beacon;
use eks_chain::context::{Misbehavior, MisbehaviorKind, VoteInfo};
use eks_chain::dispatcher::{self, BlockRequest, Dispatcher};
use eks_chain::genesis::Genesis;
use eks_chain::governance::{self, ProposalContent, ProposalContentBody, ProposalVote, Vote};
use eks_chain::mkvs::MemoryTree;
use eks_chain::registry::{self, Node, RolesMask, UnfreezeNode};
use eks_chain::scheduler::{self, GenesisValidator};
use eks_chain::staking::{self, Account, Delegation, Slash, SlashReason, Transfer};
use eks_chain::{events, Error};

fn entity_pk(seed: u8) -> PublicKey {
    PublicKey([seed; 32])
}

fn entity_addr(seed: u8) -> Address {
    Address::from_public_key(&entity_pk(seed))
}

fn node_for_entity(seed: u8) -> Node {
    Node {
        id: PublicKey([seed + 10; 32]),
        entity_id: entity_pk(seed),
        consensus_id: PublicKey([seed + 20; 32]),
        roles: RolesMask::VALIDATOR,
        expiration: 1000,
        runtimes: Vec::new(),
    }
}

/// Builds a genesis document with one validator node per entity; each
/// entity self-delegates `stake` and keeps `spendable` in its general
/// balance.
fn build_genesis(entities: &[u8], stake: u128, spendable: u128) -> Genesis {
    let mut genesis = Genesis {
        base_epoch: 0,
        ..Default::default()
    };

    let mut total = Quantity::ZERO;
    for seed in entities {
        let addr = entity_addr(*seed);
        let mut account = Account::default();
        account.general.balance = Quantity::new(spendable);
        account.escrow.active.balance = Quantity::new(stake);
        account.escrow.active.total_shares = Quantity::new(stake);
        total.add(&Quantity::new(spendable + stake)).unwrap();
        genesis.staking.ledger.push((addr, account));
        if stake > 0 {
            genesis.staking.delegations.push((
                addr,
                addr,
                Delegation {
                    shares: Quantity::new(stake),
                },
            ));
        }

        let node = node_for_entity(*seed);
        genesis.scheduler.validators.push(GenesisValidator {
            consensus_key: node.consensus_id,
            node_id: node.id,
            entity_id: node.entity_id,
            voting_power: 1,
        });
        genesis.registry.nodes.push(node);
    }
    genesis.staking.total_supply = total;

    genesis.staking.parameters = staking::Parameters {
        min_transact_balance: Quantity::ZERO,
        debonding_interval: 2,
        fee_split_weight_vote: Quantity::new(1),
        fee_split_weight_propose: Quantity::new(1),
        signing_reward_threshold_numerator: 1,
        signing_reward_threshold_denominator: 2,
        ..Default::default()
    };
    genesis.scheduler.parameters = Some(scheduler::Parameters {
        min_validators: 1,
        max_validators: 10,
        max_validators_per_entity: 1,
        ..Default::default()
    });
    genesis.governance.parameters = Some(governance::Parameters {
        min_proposal_deposit: Quantity::new(10),
        voting_period: 1,
        quorum: 75,
        threshold: 90,
        ..Default::default()
    });
    genesis
}

struct Chain {
    dispatcher: Dispatcher,
    tree: MemoryTree,
    height: u64,
}

impl Chain {
    fn start(genesis: &Genesis) -> Chain {
        let dispatcher = dispatcher::standard().unwrap();
        let mut tree = MemoryTree::new();
        let validators = dispatcher.init_chain(&mut tree, genesis).unwrap();
        assert!(!validators.is_empty());
        Chain {
            dispatcher,
            tree,
            height: 0,
        }
    }

    fn next_request(&mut self) -> BlockRequest {
        self.height += 1;
        BlockRequest {
            height: self.height,
            time: 1_700_000_000 + self.height,
            ..Default::default()
        }
    }

    fn run_block(&mut self, request: BlockRequest) -> dispatcher::BlockResults {
        let results = dispatcher::execute_block_checked(&self.dispatcher, &mut self.tree, request)
            .expect("block execution");
        for result in &results.tx_results {
            if let Err(err) = result {
                assert!(!err.is_fatal(), "fatal tx error: {err}");
            }
        }
        results
    }

    fn advance_epoch(&mut self, epoch: u64) -> dispatcher::BlockResults {
        beacon::state::schedule_epoch(&mut self.tree, epoch).unwrap();
        let request = self.next_request();
        self.run_block(request)
    }
}

fn tx(signer: Address, method: &'static str, body: impl serde::Serialize) -> Transaction {
    Transaction {
        signer,
        fee: Quantity::ZERO,
        method,
        body: codec::to_vec(&body),
    }
}

#[test]
fn application_order_is_topological_with_blessed_first() {
    let dispatcher = dispatcher::standard().unwrap();
    let order = dispatcher.application_order();

    let pos = |name: &str| order.iter().position(|n| *n == name).unwrap();
    assert_eq!(pos("beacon"), 0);
    assert!(pos("staking") < pos("scheduler"));
    assert!(pos("registry") < pos("scheduler"));
    assert!(pos("scheduler") < pos("governance"));
    assert_eq!(pos("supplementary-sanity"), order.len() - 1);
}

#[test]
fn transfer_block_preserves_supply_and_records_events() {
    let genesis = build_genesis(&[1, 2], 1000, 500);
    let mut chain = Chain::start(&genesis);

    let mut request = chain.next_request();
    request.transactions.push(tx(
        entity_addr(1),
        staking::METHOD_TRANSFER,
        Transfer {
            to: entity_addr(2),
            amount: Quantity::new(200),
        },
    ));
    let results = chain.run_block(request);
    assert!(results.tx_results[0].is_ok());

    assert_eq!(
        staking::state::account(&chain.tree, &entity_addr(1)).unwrap().general.balance,
        Quantity::new(300)
    );
    assert_eq!(
        staking::state::account(&chain.tree, &entity_addr(2)).unwrap().general.balance,
        Quantity::new(700)
    );
    assert!(results
        .events
        .iter()
        .any(|e| matches!(e, events::Event::Staking(staking::Event::Transfer { .. }))));
}

#[test]
fn failed_transaction_leaves_no_trace() {
    let genesis = build_genesis(&[1, 2], 1000, 500);
    let mut chain = Chain::start(&genesis);

    let mut request = chain.next_request();
    request.transactions.push(tx(
        entity_addr(1),
        staking::METHOD_TRANSFER,
        Transfer {
            to: entity_addr(2),
            amount: Quantity::new(10_000),
        },
    ));
    let results = chain.run_block(request);
    assert!(matches!(
        results.tx_results[0],
        Err(Error::Staking(staking::Error::InsufficientBalance))
    ));
    // Balances untouched, no staking events emitted.
    assert_eq!(
        staking::state::account(&chain.tree, &entity_addr(1)).unwrap().general.balance,
        Quantity::new(500)
    );
    assert!(!results
        .events
        .iter()
        .any(|e| matches!(e, events::Event::Staking(staking::Event::Transfer { .. }))));
}

#[test]
fn epoch_election_produces_validator_updates() {
    let genesis = build_genesis(&[1, 2, 3], 1000, 0);
    let mut chain = Chain::start(&genesis);

    // First epoch transition past the base epoch runs an election; all
    // three entities have equal stake and fit within the bounds.
    let results = chain.advance_epoch(1);
    assert!(!results.validator_updates.is_empty());

    let current = scheduler::state::current_validators(&chain.tree).unwrap();
    assert_eq!(current.len(), 3);
    // Linear voting power equals the entity stake now.
    assert!(current.values().all(|v| v.voting_power == 1000));

    // A quiet block with no epoch change produces no further updates.
    let request = chain.next_request();
    let results = chain.run_block(request);
    assert!(results.validator_updates.is_empty());
}

#[test]
fn equivocation_slashes_freezes_and_unfreezes_after_interval() {
    let mut genesis = build_genesis(&[1, 2], 0, 0);
    // All supply escrowed with the first entity; harsh equivocation
    // slashing with a one-epoch freeze. Stake checks are bypassed so the
    // post-slash election still succeeds.
    let addr1 = entity_addr(1);
    genesis.staking.ledger[0].1.escrow.active.balance = Quantity::new(1000);
    genesis.staking.ledger[0].1.escrow.active.total_shares = Quantity::new(1000);
    genesis.staking.total_supply = Quantity::new(1000);
    genesis.staking.delegations.push((
        addr1,
        addr1,
        Delegation {
            shares: Quantity::new(1000),
        },
    ));
    genesis.staking.parameters.slashing.insert(
        SlashReason::ConsensusEquivocation,
        Slash {
            amount: Quantity::new(i64::MAX as u128),
            freeze_interval: 1,
        },
    );
    if let Some(params) = genesis.scheduler.parameters.as_mut() {
        params.debug_bypass_stake = true;
    }
    let mut chain = Chain::start(&genesis);

    let node = node_for_entity(1);
    let mut request = chain.next_request();
    request.misbehavior.push(Misbehavior {
        kind: MisbehaviorKind::DuplicateVote,
        consensus_key: node.consensus_id,
        height: 1,
    });
    let results = chain.run_block(request);

    // The full escrow was taken.
    let take = results.events.iter().find_map(|e| match e {
        events::Event::Staking(staking::Event::TakeEscrow { owner, amount, .. }) => {
            Some((*owner, *amount))
        }
        _ => None,
    });
    assert_eq!(take, Some((addr1, Quantity::new(1000))));
    let acct = staking::state::account(&chain.tree, &addr1).unwrap();
    assert!(acct.escrow.active.balance.is_zero());
    assert_eq!(staking::state::common_pool(&chain.tree).unwrap(), Quantity::new(1000));

    // The node is frozen until epoch 1.
    let status = registry::state::node_status(&chain.tree, &node.id).unwrap();
    assert!(status.is_frozen());
    assert_eq!(status.unfreeze_at(), 1);

    // Unfreezing before the interval elapses is refused.
    let mut request = chain.next_request();
    request.transactions.push(tx(
        addr1,
        registry::METHOD_UNFREEZE_NODE,
        UnfreezeNode { node_id: node.id },
    ));
    let results = chain.run_block(request);
    assert!(matches!(
        results.tx_results[0],
        Err(Error::Registry(registry::Error::NodeCannotBeUnfrozen))
    ));

    // After one epoch the node can be unfrozen.
    chain.advance_epoch(1);
    let mut request = chain.next_request();
    request.transactions.push(tx(
        addr1,
        registry::METHOD_UNFREEZE_NODE,
        UnfreezeNode { node_id: node.id },
    ));
    let results = chain.run_block(request);
    assert!(results.tx_results[0].is_ok());
    assert!(!registry::state::node_status(&chain.tree, &node.id).unwrap().is_frozen());
}

#[test]
fn change_parameters_proposal_shrinks_next_election() {
    let genesis = build_genesis(&[1, 2, 3, 4], 1000, 100);
    let mut chain = Chain::start(&genesis);

    // Move past the base epoch so elections run; 4 validators elected.
    chain.advance_epoch(1);
    assert_eq!(
        scheduler::state::current_validators(&chain.tree).unwrap().len(),
        4
    );

    // Propose shrinking the validator set to 3 and have every entity vote
    // for it.
    let mut request = chain.next_request();
    request.transactions.push(tx(
        entity_addr(1),
        governance::METHOD_SUBMIT_PROPOSAL,
        ProposalContentBody {
            content: ProposalContent::ChangeParameters {
                module: scheduler::APP_NAME.into(),
                changes: codec::to_vec(&scheduler::ParameterChanges {
                    max_validators: Some(3),
                    ..Default::default()
                }),
            },
        },
    ));
    let results = chain.run_block(request);
    assert!(results.tx_results[0].is_ok());
    let proposal_id = governance::state::next_proposal_identifier(&chain.tree).unwrap() - 1;

    let mut request = chain.next_request();
    for seed in [1, 2, 3, 4] {
        request.transactions.push(tx(
            entity_addr(seed),
            governance::METHOD_CAST_VOTE,
            ProposalVote { id: proposal_id, vote: Vote::Yes },
        ));
    }
    let results = chain.run_block(request);
    assert!(results.tx_results.iter().all(|r| r.is_ok()));

    // The proposal closes at the next epoch and applies the change; the
    // election in that same block still used the old parameters.
    chain.advance_epoch(2);
    let params = scheduler::state::parameters(&chain.tree).unwrap();
    assert_eq!(params.max_validators, 3);
    assert_eq!(
        scheduler::state::current_validators(&chain.tree).unwrap().len(),
        4
    );

    // The next election honours the new bound.
    chain.advance_epoch(3);
    assert_eq!(
        scheduler::state::current_validators(&chain.tree).unwrap().len(),
        3
    );
}

#[test]
fn identical_inputs_produce_identical_post_state() {
    let run = || {
        let genesis = build_genesis(&[1, 2, 3], 1000, 500);
        let mut chain = Chain::start(&genesis);

        let mut request = chain.next_request();
        request.transactions.push(tx(
            entity_addr(1),
            staking::METHOD_TRANSFER,
            Transfer {
                to: entity_addr(2),
                amount: Quantity::new(123),
            },
        ));
        let b1 = chain.run_block(request);

        let b2 = chain.advance_epoch(1);

        let request = chain.next_request();
        let b3 = chain.run_block(request);

        let updates: Vec<(PublicKey, i64)> = b1
            .validator_updates
            .iter()
            .chain(b2.validator_updates.iter())
            .chain(b3.validator_updates.iter())
            .map(|u| (u.consensus_key, u.power))
            .collect();
        (chain.tree.dump(), updates)
    };

    let (state_a, updates_a) = run();
    let (state_b, updates_b) = run();
    assert_eq!(state_a, state_b);
    assert_eq!(updates_a, updates_b);
}

#[test]
fn signing_tracking_feeds_epoch_rewards() {
    let mut genesis = build_genesis(&[1, 2], 1000, 0);
    genesis.staking.parameters.reward_schedule = vec![staking::RewardStep {
        until: 100,
        scale: Quantity::new(staking::REWARD_AMOUNT_DENOMINATOR / 100),
    }];
    genesis.staking.parameters.reward_factor_epoch_signed = Quantity::new(1);
    // Seed the common pool so rewards have something to draw on.
    genesis.staking.common_pool = Quantity::new(10_000);
    genesis
        .staking
        .total_supply
        .add(&Quantity::new(10_000))
        .unwrap();
    let mut chain = Chain::start(&genesis);

    // Entity 1 signs the only block of the epoch; entity 2 does not.
    let node1 = node_for_entity(1);
    let node2 = node_for_entity(2);
    let mut request = chain.next_request();
    request.last_commit = vec![
        VoteInfo {
            consensus_key: node1.consensus_id,
            voted: true,
        },
        VoteInfo {
            consensus_key: node2.consensus_id,
            voted: false,
        },
    ];
    chain.run_block(request);

    let es = staking::state::epoch_signing(&chain.tree).unwrap();
    assert_eq!(es.total, 1);
    assert_eq!(es.by_entity.get(&entity_addr(1)), Some(&1));

    // On the epoch transition entity 1 collects the signing reward (1% of
    // its escrow) and the tallies reset.
    chain.advance_epoch(1);
    let acct1 = staking::state::account(&chain.tree, &entity_addr(1)).unwrap();
    assert_eq!(acct1.escrow.active.balance, Quantity::new(1010));
    let acct2 = staking::state::account(&chain.tree, &entity_addr(2)).unwrap();
    assert_eq!(acct2.escrow.active.balance, Quantity::new(1000));
    assert_eq!(staking::state::epoch_signing(&chain.tree).unwrap().total, 0);
}
