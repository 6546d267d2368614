//! Roothash: per-runtime block state.
//!
//! Every registered runtime has a slot of consensus state here: its genesis
//! and latest blocks, the results of its last round (including outgoing
//! messages), a bounded history of past round roots and the incoming
//! message queue runtimes pull from. The off-chain compute pipeline itself
//! is out of scope; round finalisation enters through
//! [`app::finalize_round`], which also relays runtime-emitted staking
//! operations onto the message bus.

pub mod app;
pub mod state;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use eks_common::{Address, Quantity};

use crate::mkvs::StateError;
use crate::types::{Hash, Namespace};

pub use app::App;

/// Application name.
pub const APP_NAME: &str = "roothash";

/// Transaction methods.
pub const METHOD_SUBMIT_MSG: &str = "roothash.SubmitMsg";

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("roothash: invalid argument")]
    InvalidArgument,

    #[error("roothash: no such runtime")]
    NoSuchRuntime,

    #[error("roothash: incoming message queue is full")]
    QueueFull,

    #[error("roothash: non-monotonic round")]
    NonMonotonicRound,

    #[error(transparent)]
    Staking(#[from] crate::staking::Error),

    #[error(transparent)]
    State(#[from] StateError),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::State(_) => true,
            Error::Staking(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// A runtime block header as tracked by consensus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub namespace: Namespace,
    pub round: u64,
    pub timestamp: u64,
    pub state_root: Hash,
    pub io_root: Hash,
}

/// A runtime block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
}

impl Block {
    /// The genesis block of a runtime, carrying its initial state root.
    pub fn genesis(namespace: Namespace, round: u64, state_root: Hash) -> Block {
        Block {
            header: BlockHeader {
                namespace,
                round,
                timestamp: 0,
                state_root,
                io_root: [0; 32],
            },
        }
    }
}

/// Result of one outgoing runtime message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub module: String,
    pub code: u32,
    pub index: u32,
}

/// Results of a runtime's last finalised round.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundResults {
    /// Outcomes of the round's outgoing messages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<MessageEvent>,
    /// Entities whose nodes contributed to the round.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub good_compute_entities: Vec<Address>,
    /// Entities whose nodes misbehaved during the round.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bad_compute_entities: Vec<Address>,
}

/// State roots recorded for one past round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRoots {
    pub state_root: Hash,
    pub io_root: Hash,
}

/// A message queued for delivery into a runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub id: u64,
    pub caller: Address,
    pub tag: u64,
    pub fee: Quantity,
    pub tokens: Quantity,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
}

/// Queue bookkeeping: `next_offset` is the id at the queue front,
/// `next_sequence_number` the id the next pushed message receives.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessageQueueMeta {
    pub size: u32,
    pub next_offset: u64,
    pub next_sequence_number: u64,
}

/// Consensus state of one runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub runtime: crate::registry::Runtime,
    pub suspended: bool,
    pub genesis_block: Block,
    pub last_block: Block,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Parameters {
    /// Incoming message queue capacity per runtime.
    pub max_in_messages: u32,
    /// Bound on the per-runtime past round roots history.
    pub max_past_roots_stored: u64,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            max_in_messages: 32,
            max_past_roots_stored: 100,
        }
    }
}

/// Per-runtime genesis state: the snapshot the chain restarts a runtime
/// from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisRuntimeState {
    pub state_root: Hash,
    pub round: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message_results: Vec<MessageEvent>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Genesis {
    pub parameters: Option<Parameters>,
    pub runtime_states: BTreeMap<Namespace, GenesisRuntimeState>,
}

/// Body of `roothash.SubmitMsg`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitMsg {
    pub id: Namespace,
    pub tag: u64,
    pub fee: Quantity,
    pub tokens: Quantity,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
}

/// The staking account a runtime's emitted messages debit.
pub fn runtime_staking_address(id: &Namespace) -> Address {
    Address::from_runtime_id(id.as_bytes())
}

/// Typed roothash events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Finalized { runtime_id: Namespace, round: u64 },
    InMsgQueued { runtime_id: Namespace, id: u64 },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Finalized { .. } => "finalized",
            Event::InMsgQueued { .. } => "in_msg_queued",
        }
    }
}
