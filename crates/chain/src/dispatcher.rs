//! Application dispatcher.
//!
//! Owns the ordered application list and drives the consensus lifecycle:
//! `InitChain`, then per block `BeginBlock` → `ExecuteTx`* → `EndBlock`.
//! Applications are ordered topologically by their declared dependencies;
//! blessed applications run before their peers whenever the dependency
//! relation leaves a choice. The resulting order is deterministic for a
//! fixed registration sequence.

use tracing::{debug, warn};

use crate::app::{Application, MessageBus, MessageKind, Transaction, ValidatorUpdate};
use crate::context::{BlockInfo, Context, Misbehavior, Mode, VoteInfo};
use crate::events::Event;
use crate::genesis::Genesis;
use crate::mkvs::{MemoryTree, StateError};
use crate::{staking, Error};

/// Inputs for one block, as delivered by the consensus engine.
#[derive(Default)]
pub struct BlockRequest {
    pub height: u64,
    /// Block time, unix seconds.
    pub time: u64,
    pub proposer_consensus_key: Option<eks_common::PublicKey>,
    pub last_commit: Vec<VoteInfo>,
    pub misbehavior: Vec<Misbehavior>,
    pub transactions: Vec<Transaction>,
}

/// Results of one executed block.
pub struct BlockResults {
    /// Validator-set diff for the consensus engine.
    pub validator_updates: Vec<ValidatorUpdate>,
    /// Per-transaction outcome, in delivery order.
    pub tx_results: Vec<Result<(), Error>>,
    /// All events committed during the block.
    pub events: Vec<Event>,
}

pub struct Dispatcher {
    apps: Vec<Box<dyn Application>>,
    /// `(kind, app index)` pairs in application order.
    subscriptions: Vec<(MessageKind, usize)>,
}

impl Dispatcher {
    /// Builds a dispatcher over the given applications, ordering them
    /// topologically. Fails on duplicate names, unknown dependencies or
    /// dependency cycles.
    pub fn new(apps: Vec<Box<dyn Application>>) -> Result<Self, Error> {
        let ordered = Self::order(apps)?;

        let mut subscriptions = Vec::new();
        for (idx, app) in ordered.iter().enumerate() {
            for kind in app.subscriptions() {
                subscriptions.push((kind, idx));
            }
        }

        Ok(Dispatcher {
            apps: ordered,
            subscriptions,
        })
    }

    fn order(apps: Vec<Box<dyn Application>>) -> Result<Vec<Box<dyn Application>>, Error> {
        let names: Vec<&'static str> = apps.iter().map(|a| a.name()).collect();
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(Error::Dispatcher(format!("duplicate application: {name}")));
            }
        }

        // Kahn's algorithm; among ready applications pick blessed ones
        // first, then registration order.
        let mut remaining: Vec<Option<Box<dyn Application>>> = apps.into_iter().map(Some).collect();
        let mut ordered = Vec::with_capacity(remaining.len());
        let mut placed: Vec<&'static str> = Vec::new();

        while ordered.len() < remaining.len() {
            let mut picked = None;
            for (idx, slot) in remaining.iter().enumerate() {
                let Some(app) = slot else { continue };
                let deps = app.dependencies();
                for dep in &deps {
                    if !names.contains(dep) {
                        return Err(Error::Dispatcher(format!(
                            "application {} depends on unknown application {dep}",
                            app.name()
                        )));
                    }
                }
                if !deps.iter().all(|d| placed.contains(d)) {
                    continue;
                }
                match picked {
                    None => picked = Some((idx, app.blessed())),
                    Some((_, false)) if app.blessed() => picked = Some((idx, true)),
                    Some(_) => {}
                }
            }
            let Some((idx, _)) = picked else {
                return Err(Error::Dispatcher("dependency cycle among applications".into()));
            };
            let app = remaining[idx].take().expect("picked slot is occupied");
            placed.push(app.name());
            ordered.push(app);
        }

        Ok(ordered)
    }

    fn bus(&self) -> MessageBus<'_> {
        MessageBus::new(&self.apps, &self.subscriptions)
    }

    /// Populates state from the genesis document and returns the initial
    /// validator set.
    pub fn init_chain(
        &self,
        tree: &mut MemoryTree,
        genesis: &Genesis,
    ) -> Result<Vec<ValidatorUpdate>, Error> {
        let mut block = BlockInfo::default();
        for i in 0..self.apps.len() {
            let mut ctx = Context::new(Mode::InitChain, tree, &mut block, 0, genesis.time);
            self.apps[i].init_chain(&mut ctx, genesis)?;
        }

        let validators = crate::scheduler::state::current_validators(tree)?;
        Ok(validators
            .into_iter()
            .map(|(consensus_key, v)| ValidatorUpdate {
                consensus_key,
                power: v.voting_power,
            })
            .collect())
    }

    /// Executes one block: BeginBlock in application order, each transaction
    /// atomically, then EndBlock. Only [`StateError`]-class failures abort
    /// the block; transaction failures are recorded per transaction.
    pub fn execute_block(
        &self,
        tree: &mut MemoryTree,
        request: BlockRequest,
    ) -> Result<BlockResults, Error> {
        let mut block = BlockInfo {
            last_commit: request.last_commit,
            misbehavior: request.misbehavior,
            proposer_consensus_key: request.proposer_consensus_key,
            ..Default::default()
        };

        for i in 0..self.apps.len() {
            let mut ctx = Context::new(Mode::BeginBlock, tree, &mut block, request.height, request.time);
            self.apps[i].begin_block(&mut ctx, &self.bus())?;
            let staged = ctx.take_staged_events();
            block.events.extend(staged);
        }

        let mut tx_results = Vec::with_capacity(request.transactions.len());
        for tx in &request.transactions {
            match self.execute_tx_atomic(tree, &mut block, request.height, request.time, tx) {
                Ok(()) => tx_results.push(Ok(())),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    debug!(method = tx.method, %err, "transaction failed");
                    tx_results.push(Err(err));
                }
            }
        }

        let mut validator_updates = Vec::new();
        for i in 0..self.apps.len() {
            let mut ctx = Context::new(Mode::EndBlock, tree, &mut block, request.height, request.time);
            let mut updates = self.apps[i].end_block(&mut ctx, &self.bus())?;
            let staged = ctx.take_staged_events();
            block.events.extend(staged);
            validator_updates.append(&mut updates);
        }

        Ok(BlockResults {
            validator_updates,
            tx_results,
            events: block.events,
        })
    }

    /// Runs a transaction against a snapshot and commits only on success.
    /// The fee is charged first and is kept even when execution fails.
    fn execute_tx_atomic(
        &self,
        tree: &mut MemoryTree,
        block: &mut BlockInfo,
        height: u64,
        time: u64,
        tx: &Transaction,
    ) -> Result<(), Error> {
        // Charge the fee in its own snapshot: an unpayable fee rejects the
        // transaction outright, while a later execution failure keeps it.
        if !tx.fee.is_zero() {
            let mut snapshot = tree.snapshot();
            {
                let mut ctx = Context::new(Mode::ExecuteTx, &mut snapshot, block, height, time);
                staking::state::take_tx_fee(&mut ctx, tx.signer, &tx.fee)?;
            }
            tree.overwrite(snapshot);
        }

        let mut snapshot = tree.snapshot();
        let mut ctx = Context::new(Mode::ExecuteTx, &mut snapshot, block, height, time);

        let app = self
            .apps
            .iter()
            .find(|app| app.methods().contains(&tx.method))
            .ok_or_else(|| Error::Dispatcher(format!("unknown method: {}", tx.method)))?;

        app.execute_tx(&mut ctx, &self.bus(), tx)?;
        let staged = ctx.take_staged_events();
        block.events.extend(staged);
        tree.overwrite(snapshot);
        Ok(())
    }

    /// Simulates a transaction against a throwaway snapshot (check-only
    /// mode: no state change, no events).
    pub fn check_tx(&self, tree: &MemoryTree, tx: &Transaction) -> Result<(), Error> {
        let mut snapshot = tree.snapshot();
        let mut block = BlockInfo::default();
        let mut ctx = Context::new(Mode::CheckOnly, &mut snapshot, &mut block, 0, 0);

        if !tx.fee.is_zero() {
            staking::state::take_tx_fee(&mut ctx, tx.signer, &tx.fee)?;
        }

        let app = self
            .apps
            .iter()
            .find(|app| app.methods().contains(&tx.method))
            .ok_or_else(|| Error::Dispatcher(format!("unknown method: {}", tx.method)))?;
        app.execute_tx(&mut ctx, &self.bus(), tx)
    }

    /// Application names in execution order, for diagnostics.
    pub fn application_order(&self) -> Vec<&'static str> {
        self.apps.iter().map(|a| a.name()).collect()
    }
}

/// Builds a dispatcher with the standard application set.
pub fn standard() -> Result<Dispatcher, Error> {
    Dispatcher::new(vec![
        Box::new(crate::beacon::App),
        Box::new(crate::registry::App),
        Box::new(crate::staking::App),
        Box::new(crate::scheduler::App),
        Box::new(crate::governance::App),
        Box::new(crate::roothash::App),
        Box::new(crate::sanity::App::default()),
    ])
}

/// Convenience wrapper: executes a block and then lets the supplementary
/// sanity auditor inspect the post-state, warning loudly on failure in
/// non-test builds.
pub fn execute_block_checked(
    dispatcher: &Dispatcher,
    tree: &mut MemoryTree,
    request: BlockRequest,
) -> Result<BlockResults, Error> {
    let results = dispatcher.execute_block(tree, request)?;
    if let Err(err) = crate::sanity::check_invariants(tree) {
        warn!(%err, "post-block invariant check failed");
        return Err(Error::State(StateError::InvariantViolation(err.to_string())));
    }
    Ok(results)
}
