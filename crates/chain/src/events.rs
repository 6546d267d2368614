//! Typed event records.
//!
//! Every application emits typed events; each record carries an attribute
//! kind string so external indexers can decode the engine's event stream
//! without knowing the payload type up front.

use crate::{governance, registry, roothash, scheduler, staking};

/// A typed event emitted by one of the applications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Staking(staking::Event),
    Scheduler(scheduler::Event),
    Governance(governance::Event),
    Roothash(roothash::Event),
    Registry(registry::Event),
}

impl Event {
    /// The attribute kind indexers key on.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Staking(e) => e.kind(),
            Event::Scheduler(e) => e.kind(),
            Event::Governance(e) => e.kind(),
            Event::Roothash(e) => e.kind(),
            Event::Registry(e) => e.kind(),
        }
    }
}

impl From<staking::Event> for Event {
    fn from(e: staking::Event) -> Self {
        Event::Staking(e)
    }
}

impl From<scheduler::Event> for Event {
    fn from(e: scheduler::Event) -> Self {
        Event::Scheduler(e)
    }
}

impl From<governance::Event> for Event {
    fn from(e: governance::Event) -> Self {
        Event::Governance(e)
    }
}

impl From<roothash::Event> for Event {
    fn from(e: roothash::Event) -> Self {
        Event::Roothash(e)
    }
}

impl From<registry::Event> for Event {
    fn from(e: registry::Event) -> Self {
        Event::Registry(e)
    }
}
