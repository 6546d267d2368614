//! # EkS Consensus Applications
//!
//! The deterministic state machine that runs on top of the external BFT
//! consensus engine. The engine orders blocks and transactions; the
//! applications here compute the state transitions every validator must
//! reproduce bit for bit:
//!
//! - [`staking`]: account ledger, escrow share pools, debonding, slashing,
//!   fees and rewards
//! - [`scheduler`]: per-epoch validator and compute-committee elections
//! - [`governance`]: proposal lifecycle and pending chain upgrades
//! - [`roothash`]: per-runtime block state and message queues
//! - [`registry`] / [`beacon`]: node, runtime and epoch state the other
//!   applications consume
//! - [`dispatcher`]: ordered invocation and the inter-application message bus
//! - [`sanity`]: the non-normative invariant auditor
//!
//! State lives exclusively in the injected ordered key-value tree
//! ([`mkvs`]); applications are stateless between invocations.

pub mod app;
pub mod beacon;
pub mod context;
pub mod dispatcher;
pub mod events;
pub mod genesis;
pub mod governance;
pub mod keyformat;
pub mod mkvs;
pub mod registry;
pub mod roothash;
pub mod sanity;
pub mod scheduler;
pub mod staking;
pub mod types;

use thiserror::Error as ThisError;

use mkvs::StateError;

/// Top-level error type crossing the dispatcher boundary.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Staking(#[from] staking::Error),

    #[error(transparent)]
    Scheduler(#[from] scheduler::Error),

    #[error(transparent)]
    Governance(#[from] governance::Error),

    #[error(transparent)]
    Registry(#[from] registry::Error),

    #[error(transparent)]
    Roothash(#[from] roothash::Error),

    #[error(transparent)]
    Beacon(#[from] beacon::Error),

    #[error("dispatcher: {0}")]
    Dispatcher(String),
}

impl Error {
    /// True for failures that must abort block processing (state
    /// unavailability, invariant violations) rather than just fail the
    /// transaction at hand.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::State(_) => true,
            Error::Staking(e) => e.is_fatal(),
            Error::Scheduler(e) => e.is_fatal(),
            Error::Governance(e) => e.is_fatal(),
            Error::Registry(e) => e.is_fatal(),
            Error::Roothash(e) => e.is_fatal(),
            Error::Beacon(e) => e.is_fatal(),
            Error::Dispatcher(_) => false,
        }
    }
}
