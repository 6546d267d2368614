//! Application interface and the inter-application message bus.
//!
//! Applications are stateless: all consensus state lives in the tree, so the
//! trait methods take `&self` and every mutation flows through the
//! [`Context`]. The dispatcher invokes the lifecycle methods in dependency
//! order and hands each invocation a [`MessageBus`] view over its sibling
//! applications for synchronous publish/subscribe.

use eks_common::{Address, Quantity};

use crate::context::Context;
use crate::genesis::Genesis;
use crate::types::{EpochTime, Namespace};
use crate::{staking, Error};

/// A transaction as delivered by the consensus engine. Envelope signature
/// verification happens in the engine; by the time a transaction reaches an
/// application the signer address is authenticated.
#[derive(Clone, Debug)]
pub struct Transaction {
    pub signer: Address,
    pub fee: Quantity,
    pub method: &'static str,
    /// CBOR-encoded method body.
    pub body: Vec<u8>,
}

/// Message kinds carried by the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A change-parameters proposal is about to be accepted; subscribers
    /// owning the module validate the changes and veto with an error.
    ValidateParameterChanges,
    /// A change-parameters proposal has been accepted; subscribers owning
    /// the module apply the changes.
    ChangeParameters,
    /// The scheduler is about to elect committees for the given epoch.
    BeforeSchedule,
    /// A runtime emitted a staking operation via the roothash application.
    RuntimeStaking,
}

/// Parameter changes targeted at a single module. The changes blob is the
/// module's own CBOR-encoded parameter-change type; only the owning module
/// can decode it.
#[derive(Clone, Debug)]
pub struct ChangeParametersMessage {
    pub module: String,
    pub changes: Vec<u8>,
}

/// A staking operation emitted by a runtime, authorised against the
/// runtime's own account.
#[derive(Clone, Debug)]
pub struct RuntimeStakingMessage {
    pub runtime: Namespace,
    /// The runtime's staking account; the only account the message may
    /// debit.
    pub origin: Address,
    pub msg: staking::StakingMessage,
}

/// A typed bus message.
#[derive(Clone, Debug)]
pub enum Message {
    ValidateParameterChanges(ChangeParametersMessage),
    ChangeParameters(ChangeParametersMessage),
    BeforeSchedule { epoch: EpochTime },
    RuntimeStaking(RuntimeStakingMessage),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ValidateParameterChanges(_) => MessageKind::ValidateParameterChanges,
            Message::ChangeParameters(_) => MessageKind::ChangeParameters,
            Message::BeforeSchedule { .. } => MessageKind::BeforeSchedule,
            Message::RuntimeStaking(_) => MessageKind::RuntimeStaking,
        }
    }
}

/// Response from a message subscriber that handled the message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageResult {
    /// Handled with no payload to report.
    Empty,
    /// Parameter changes validated by the owning module.
    ParametersValidated { module: String },
    /// Parameter changes applied by the owning module.
    ParametersChanged { module: String },
}

/// A single entry of the validator-set diff returned from EndBlock. Power 0
/// removes the validator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatorUpdate {
    pub consensus_key: eks_common::PublicKey,
    pub power: i64,
}

/// The interface every consensus application implements.
pub trait Application {
    /// Unique application name, also used in dependency declarations.
    fn name(&self) -> &'static str;

    /// Blessed applications run before their peers within a dependency tier.
    fn blessed(&self) -> bool {
        false
    }

    /// Names of applications whose per-block processing must precede this
    /// one's.
    fn dependencies(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Transaction methods routed to this application.
    fn methods(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Message kinds this application subscribes to.
    fn subscriptions(&self) -> Vec<MessageKind> {
        Vec::new()
    }

    fn init_chain(&self, _ctx: &mut Context, _genesis: &Genesis) -> Result<(), Error> {
        Ok(())
    }

    fn begin_block(&self, _ctx: &mut Context, _bus: &MessageBus) -> Result<(), Error> {
        Ok(())
    }

    fn execute_tx(&self, ctx: &mut Context, bus: &MessageBus, tx: &Transaction)
        -> Result<(), Error>;

    /// Handles a bus message. Returns `Ok(None)` when the message is not for
    /// this application (e.g. parameter changes for a different module).
    fn execute_message(
        &self,
        _ctx: &mut Context,
        _bus: &MessageBus,
        _msg: &Message,
    ) -> Result<Option<MessageResult>, Error> {
        Ok(None)
    }

    fn end_block(&self, _ctx: &mut Context, _bus: &MessageBus) -> Result<Vec<ValidatorUpdate>, Error> {
        Ok(Vec::new())
    }
}

/// Synchronous publish/subscribe view over the registered applications.
///
/// Subscribers run in deterministic (dispatcher) order, inside the
/// publisher's transaction scope: the first subscriber error aborts the
/// whole operation.
pub struct MessageBus<'d> {
    apps: &'d [Box<dyn Application>],
    subscriptions: &'d [(MessageKind, usize)],
}

impl<'d> MessageBus<'d> {
    pub(crate) fn new(
        apps: &'d [Box<dyn Application>],
        subscriptions: &'d [(MessageKind, usize)],
    ) -> Self {
        MessageBus {
            apps,
            subscriptions,
        }
    }

    /// Delivers `msg` to every subscriber of its kind, collecting the
    /// responses of those that handled it.
    pub fn publish(&self, ctx: &mut Context, msg: &Message) -> Result<Vec<MessageResult>, Error> {
        let kind = msg.kind();
        let mut results = Vec::new();
        for &(sub_kind, idx) in self.subscriptions {
            if sub_kind != kind {
                continue;
            }
            if let Some(result) = self.apps[idx].execute_message(ctx, self, msg)? {
                results.push(result);
            }
        }
        Ok(results)
    }
}
