//! Block execution context.
//!
//! A [`Context`] is handed to every application invocation. It carries the
//! mutable tree handle, the invocation mode, the block-scoped scratch state
//! shared between applications ([`BlockInfo`]) and the staged event sink.
//! Events staged by an invocation only become part of the block when the
//! dispatcher commits the invocation; a failed transaction leaves no events
//! behind.

use eks_common::{Address, PublicKey, Quantity};

use crate::events::Event;
use crate::mkvs::{StateError, Tree};

/// Invocation mode. Mode-sensitive writes check it before mutating state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    InitChain,
    BeginBlock,
    ExecuteTx,
    CheckOnly,
    EndBlock,
}

/// One validator's vote on the previous block, from the consensus engine's
/// last-commit info.
#[derive(Clone, Debug)]
pub struct VoteInfo {
    pub consensus_key: PublicKey,
    pub voted: bool,
}

/// Evidence of validator misbehaviour, already verified by the consensus
/// engine.
#[derive(Clone, Debug)]
pub struct Misbehavior {
    pub kind: MisbehaviorKind,
    pub consensus_key: PublicKey,
    pub height: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MisbehaviorKind {
    /// Double-signing at the same height (equivocation).
    DuplicateVote,
    /// Attack on light clients.
    LightClientAttack,
}

/// Per-block scratch shared between applications, reset at every block.
#[derive(Default)]
pub struct BlockInfo {
    /// Who voted on the previous block.
    pub last_commit: Vec<VoteInfo>,
    /// Misbehaviour evidence delivered with this block.
    pub misbehavior: Vec<Misbehavior>,
    /// Consensus key of this block's proposer.
    pub proposer_consensus_key: Option<PublicKey>,
    /// Entity behind the proposer, resolved by the staking app in
    /// BeginBlock and consumed again in its EndBlock.
    pub proposer_entity: Option<Address>,
    /// Fee share reserved for the proposer, paid in EndBlock.
    pub proposer_fee: Quantity,
    /// Transaction fees charged during this block; persisted as the
    /// last-block fees at EndBlock and disbursed in the next block.
    pub fee_accumulator: Quantity,
    /// Set by the beacon application when this block starts a new epoch.
    pub epoch_changed: bool,
    /// Events committed so far in this block.
    pub events: Vec<Event>,
}

/// Application invocation context.
pub struct Context<'a> {
    mode: Mode,
    tree: &'a mut dyn Tree,
    block: &'a mut BlockInfo,
    height: u64,
    /// Block time, unix seconds. Only ever used for TEE attestation
    /// freshness checks; consensus logic must not branch on it.
    now: u64,
    staged_events: Vec<Event>,
}

impl<'a> Context<'a> {
    pub fn new(
        mode: Mode,
        tree: &'a mut dyn Tree,
        block: &'a mut BlockInfo,
        height: u64,
        now: u64,
    ) -> Self {
        Context {
            mode,
            tree,
            block,
            height,
            now,
            staged_events: Vec::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_check_only(&self) -> bool {
        self.mode == Mode::CheckOnly
    }

    /// Fails unless the current mode is one of `allowed`. Guards writes that
    /// are only sound in specific phases, e.g. consensus parameter updates.
    pub fn ensure_mode(&self, allowed: &[Mode]) -> Result<(), StateError> {
        if allowed.contains(&self.mode) {
            return Ok(());
        }
        Err(StateError::InvariantViolation(format!(
            "operation not allowed in {:?} context",
            self.mode
        )))
    }

    pub fn tree(&self) -> &dyn Tree {
        &*self.tree
    }

    pub fn tree_mut(&mut self) -> &mut dyn Tree {
        &mut *self.tree
    }

    pub fn block(&self) -> &BlockInfo {
        &*self.block
    }

    pub fn block_mut(&mut self) -> &mut BlockInfo {
        &mut *self.block
    }

    pub fn block_height(&self) -> u64 {
        self.height
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    /// Stages a typed event. Suppressed in check-only contexts.
    pub fn emit_event(&mut self, event: Event) {
        if self.is_check_only() {
            return;
        }
        self.staged_events.push(event);
    }

    /// True when an event of the given attribute kind was committed earlier
    /// in this block or staged by the current invocation.
    pub fn has_event(&self, kind: &str) -> bool {
        self.block
            .events
            .iter()
            .chain(self.staged_events.iter())
            .any(|e| e.kind() == kind)
    }

    /// Takes the staged events. The dispatcher commits them into the block
    /// on invocation success and drops them on failure.
    pub fn take_staged_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.staged_events)
    }
}
