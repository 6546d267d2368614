//! The roothash application and its query surface.

use std::collections::BTreeMap;

use tracing::info;

use eks_common::codec;

use crate::app::{
    Application, Message, MessageBus, MessageKind, MessageResult, RuntimeStakingMessage,
    Transaction,
};
use crate::context::Context;
use crate::genesis::Genesis as GenesisDocument;
use crate::mkvs::Tree;
use crate::registry;
use crate::staking::{self, StakingMessage};
use crate::types::Namespace;

use super::state;
use super::{
    runtime_staking_address, Block, Error, Event, Genesis, GenesisRuntimeState, IncomingMessage,
    RoundResults, RoundRoots, RuntimeState, SubmitMsg, APP_NAME, METHOD_SUBMIT_MSG,
};

/// The roothash application.
pub struct App;

impl Application for App {
    fn name(&self) -> &'static str {
        APP_NAME
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![registry::APP_NAME, staking::APP_NAME, crate::scheduler::APP_NAME]
    }

    fn methods(&self) -> Vec<&'static str> {
        vec![METHOD_SUBMIT_MSG]
    }

    fn subscriptions(&self) -> Vec<MessageKind> {
        vec![MessageKind::BeforeSchedule]
    }

    fn init_chain(&self, ctx: &mut Context, genesis: &GenesisDocument) -> Result<(), crate::Error> {
        let st = &genesis.roothash;
        if let Some(params) = &st.parameters {
            state::set_parameters(ctx, params).map_err(Error::State)?;
        }

        // Per-runtime state is normally allocated when a runtime registers;
        // at genesis the registry has already carved out its entries, so
        // walk both active and suspended runtimes here.
        for runtime in registry::state::runtimes(ctx.tree()).map_err(Error::State)? {
            on_new_runtime(ctx, &runtime, st.runtime_states.get(&runtime.id), false)?;
        }
        for runtime in registry::state::suspended_runtimes(ctx.tree()).map_err(Error::State)? {
            on_new_runtime(ctx, &runtime, st.runtime_states.get(&runtime.id), true)?;
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
            METHOD_SUBMIT_MSG => {
                let body: SubmitMsg =
                    codec::from_slice(&tx.body).map_err(|_| Error::InvalidArgument)?;
                Ok(submit_msg(ctx, tx.signer, &body)?)
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
            Message::BeforeSchedule { .. } => {
                // Make sure every registered runtime has its state slot
                // before committees for it are elected.
                for runtime in registry::state::runtimes(ctx.tree()).map_err(Error::State)? {
                    on_new_runtime(ctx, &runtime, None, false)?;
                }
                Ok(Some(MessageResult::Empty))
            }
            _ => Err(Error::InvalidArgument.into()),
        }
    }
}

/// Allocates consensus state for a runtime. Idempotent: an existing slot is
/// left untouched.
pub fn on_new_runtime(
    ctx: &mut Context,
    runtime: &registry::Runtime,
    genesis_state: Option<&GenesisRuntimeState>,
    suspended: bool,
) -> Result<(), Error> {
    if state::runtime_state(ctx.tree(), &runtime.id)?.is_some() {
        return Ok(());
    }

    let (round, state_root, message_results) = match genesis_state {
        Some(gs) => (gs.round, gs.state_root, gs.message_results.clone()),
        None => (0, runtime.genesis_state_root, Vec::new()),
    };

    info!(runtime = %runtime.id, round, "allocating per-runtime state");

    let genesis_block = Block::genesis(runtime.id, round, state_root);
    state::set_runtime_state(
        ctx.tree_mut(),
        &RuntimeState {
            runtime: runtime.clone(),
            suspended,
            genesis_block: genesis_block.clone(),
            last_block: genesis_block,
        },
    )?;
    state::set_last_round_results(
        ctx.tree_mut(),
        &runtime.id,
        &RoundResults {
            messages: message_results,
            ..Default::default()
        },
    )?;
    Ok(())
}

/// Queues a message for delivery into a runtime, transferring the attached
/// tokens into the runtime's staking account.
pub(super) fn submit_msg(ctx: &mut Context, signer: eks_common::Address, body: &SubmitMsg) -> Result<(), Error> {
    let Some(_) = state::runtime_state(ctx.tree(), &body.id)? else {
        return Err(Error::NoSuchRuntime);
    };

    let params = state::parameters(ctx.tree())?;
    let mut meta = state::in_msg_queue_meta(ctx.tree(), &body.id)?;
    if meta.size >= params.max_in_messages {
        return Err(Error::QueueFull);
    }

    if !body.tokens.is_zero() {
        let runtime_addr = runtime_staking_address(&body.id);
        staking::state::transfer(ctx, &signer, &runtime_addr, &body.tokens)?;
    }

    let msg = IncomingMessage {
        id: meta.next_sequence_number,
        caller: signer,
        tag: body.tag,
        fee: body.fee,
        tokens: body.tokens,
        data: body.data.clone(),
    };
    if meta.size == 0 {
        meta.next_offset = msg.id;
    }
    meta.size += 1;
    meta.next_sequence_number += 1;

    state::set_in_msg(ctx.tree_mut(), &body.id, &msg)?;
    state::set_in_msg_queue_meta(ctx.tree_mut(), &body.id, &meta)?;

    ctx.emit_event(
        Event::InMsgQueued {
            runtime_id: body.id,
            id: msg.id,
        }
        .into(),
    );
    Ok(())
}

/// Removes up to `count` messages from the front of a runtime's incoming
/// queue, after the runtime processed them in a round.
pub fn pop_in_msgs(ctx: &mut Context, id: &Namespace, count: u32) -> Result<(), Error> {
    let mut meta = state::in_msg_queue_meta(ctx.tree(), id)?;
    let front = state::in_msg_queue(ctx.tree(), id, 0, count)?;
    for msg in &front {
        state::remove_in_msg(ctx.tree_mut(), id, msg.id)?;
        meta.size -= 1;
    }
    meta.next_offset = match state::in_msg_queue(ctx.tree(), id, 0, 1)?.first() {
        Some(next) => next.id,
        None => meta.next_sequence_number,
    };
    state::set_in_msg_queue_meta(ctx.tree_mut(), id, &meta)?;
    Ok(())
}

/// Finalises a runtime round: records the new block and round results,
/// prunes root history and relays runtime-emitted staking messages onto the
/// bus. Message execution shares the caller's transaction scope; a failing
/// message aborts the whole finalisation.
pub fn finalize_round(
    ctx: &mut Context,
    bus: &MessageBus,
    runtime_id: &Namespace,
    new_block: Block,
    results: RoundResults,
    staking_messages: Vec<StakingMessage>,
) -> Result<(), crate::Error> {
    let Some(mut rt_state) = state::runtime_state(ctx.tree(), runtime_id).map_err(Error::State)?
    else {
        return Err(Error::NoSuchRuntime.into());
    };

    if new_block.header.round <= rt_state.last_block.header.round {
        return Err(Error::NonMonotonicRound.into());
    }

    let round = new_block.header.round;
    state::set_round_roots(
        ctx.tree_mut(),
        runtime_id,
        round,
        &RoundRoots {
            state_root: new_block.header.state_root,
            io_root: new_block.header.io_root,
        },
    )
    .map_err(Error::State)?;

    let params = state::parameters(ctx.tree()).map_err(Error::State)?;
    state::prune_round_roots(ctx.tree_mut(), runtime_id, params.max_past_roots_stored)
        .map_err(Error::State)?;

    rt_state.last_block = new_block;
    state::set_runtime_state(ctx.tree_mut(), &rt_state).map_err(Error::State)?;
    state::set_last_round_results(ctx.tree_mut(), runtime_id, &results).map_err(Error::State)?;

    let origin = runtime_staking_address(runtime_id);
    for msg in staking_messages {
        bus.publish(
            ctx,
            &Message::RuntimeStaking(RuntimeStakingMessage {
                runtime: *runtime_id,
                origin,
                msg,
            }),
        )?;
    }

    ctx.emit_event(
        Event::Finalized {
            runtime_id: *runtime_id,
            round,
        }
        .into(),
    );
    Ok(())
}

/// Read-only roothash queries over a state snapshot.
pub struct Query<'a> {
    tree: &'a dyn Tree,
}

impl<'a> Query<'a> {
    pub fn new(tree: &'a dyn Tree) -> Self {
        Query { tree }
    }

    pub fn genesis_block(&self, id: &Namespace) -> Result<Block, Error> {
        Ok(self.runtime_state(id)?.genesis_block)
    }

    pub fn latest_block(&self, id: &Namespace) -> Result<Block, Error> {
        Ok(self.runtime_state(id)?.last_block)
    }

    pub fn runtime_state(&self, id: &Namespace) -> Result<RuntimeState, Error> {
        state::runtime_state(self.tree, id)?.ok_or(Error::NoSuchRuntime)
    }

    pub fn round_roots(&self, id: &Namespace, round: u64) -> Result<Option<RoundRoots>, Error> {
        Ok(state::round_roots(self.tree, id, round)?)
    }

    pub fn past_round_roots(&self, id: &Namespace) -> Result<BTreeMap<u64, RoundRoots>, Error> {
        Ok(state::past_round_roots(self.tree, id)?)
    }

    pub fn last_round_results(&self, id: &Namespace) -> Result<RoundResults, Error> {
        Ok(state::last_round_results(self.tree, id)?)
    }

    pub fn incoming_message_queue_meta(
        &self,
        id: &Namespace,
    ) -> Result<super::IncomingMessageQueueMeta, Error> {
        Ok(state::in_msg_queue_meta(self.tree, id)?)
    }

    pub fn incoming_message_queue(
        &self,
        id: &Namespace,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<IncomingMessage>, Error> {
        Ok(state::in_msg_queue(self.tree, id, offset, limit)?)
    }

    pub fn consensus_parameters(&self) -> Result<super::Parameters, Error> {
        Ok(state::parameters(self.tree)?)
    }

    /// Reconstitutes the roothash genesis section covering every runtime by
    /// snapshotting `(state root, round)` and the last outgoing message
    /// results.
    pub fn genesis(&self) -> Result<Genesis, Error> {
        let mut runtime_states = BTreeMap::new();
        for rt in state::runtime_states(self.tree)? {
            let results = state::last_round_results(self.tree, &rt.runtime.id)?;
            runtime_states.insert(
                rt.runtime.id,
                GenesisRuntimeState {
                    state_root: rt.last_block.header.state_root,
                    round: rt.last_block.header.round,
                    message_results: results.messages,
                },
            );
        }
        Ok(Genesis {
            parameters: Some(state::parameters(self.tree)?),
            runtime_states,
        })
    }
}
