//! Governance: proposal lifecycle and pending chain upgrades.
//!
//! Proposals are submitted with a deposit, voted on by validator entities
//! and tallied at their closing epoch by stake weight. Accepted upgrade
//! proposals materialise in the pending-upgrade index that node upgrade
//! managers watch; accepted change-parameters proposals are applied by the
//! owning module over the message bus.

pub mod app;
pub mod state;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use eks_common::{Address, Quantity};

use crate::mkvs::StateError;
use crate::types::EpochTime;

pub use app::App;

/// Application name.
pub const APP_NAME: &str = "governance";

/// Transaction methods.
pub const METHOD_SUBMIT_PROPOSAL: &str = "governance.SubmitProposal";
pub const METHOD_CAST_VOTE: &str = "governance.CastVote";

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("governance: invalid argument")]
    InvalidArgument,

    #[error("governance: no such proposal")]
    NoSuchProposal,

    #[error("governance: not eligible to vote")]
    NotEligible,

    #[error("governance: voting is closed")]
    VotingIsClosed,

    #[error("governance: upgrade epoch too soon")]
    UpgradeTooSoon,

    #[error("governance: upgrade already pending")]
    UpgradeAlreadyPending,

    #[error("governance: no such pending upgrade")]
    NoSuchUpgrade,

    #[error("governance: change-parameters proposals are disabled")]
    ChangeParametersDisabled,

    #[error("governance: no module owns the targeted parameters")]
    UnknownModule,

    #[error(transparent)]
    Staking(#[from] crate::staking::Error),

    #[error(transparent)]
    Arithmetic(#[from] eks_common::QuantityError),

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

/// Proposal lifecycle state. A proposal is immutable after closure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalState {
    Active,
    Passed,
    Rejected,
    /// Passed the vote but failed to execute.
    Failed,
}

/// A vote choice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Vote {
    Yes,
    No,
    Abstain,
}

/// An upgrade descriptor as carried by upgrade proposals and the pending
/// upgrade index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeDescriptor {
    /// Name of the upgrade handler the node runs at the upgrade epoch.
    pub handler: String,
    /// Software version the upgraded binary must report.
    pub target: String,
    /// Epoch the upgrade takes effect at.
    pub epoch: EpochTime,
}

/// Proposal content variants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalContent {
    Upgrade(UpgradeDescriptor),
    CancelUpgrade {
        /// Identifier of the passed upgrade proposal to cancel.
        proposal_id: u64,
    },
    ChangeParameters {
        /// Module whose parameters change; exactly one application must
        /// recognise it.
        module: String,
        /// Module-specific CBOR-encoded parameter changes.
        changes: Vec<u8>,
    },
}

/// A governance proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: u64,
    pub submitter: Address,
    pub deposit: Quantity,
    pub content: ProposalContent,
    pub state: ProposalState,
    pub created_at: EpochTime,
    pub closes_at: EpochTime,
    /// Stake-weighted tally per vote choice, filled at closure.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub results: BTreeMap<Vote, Quantity>,
    /// Votes that could not be counted at closure (voter no longer staked).
    #[serde(default)]
    pub invalid_votes: u64,
}

/// A recorded vote, list form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteEntry {
    pub voter: Address,
    pub vote: Vote,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Parameters {
    pub min_proposal_deposit: Quantity,
    /// Epochs a proposal stays open for voting.
    pub voting_period: EpochTime,
    /// Minimum turnout: percentage of total validator stake that must vote.
    pub quorum: u8,
    /// Minimum share of yes votes among cast stake, in percent.
    pub threshold: u8,
    /// An upgrade must be scheduled at least this many epochs out.
    pub upgrade_min_epoch_diff: EpochTime,
    /// A pending upgrade can no longer be cancelled within this many epochs
    /// of its upgrade epoch.
    pub upgrade_cancel_min_epoch_diff: EpochTime,
    pub enable_change_parameters_proposal: bool,
    /// Permits validator entities to vote without a node registration
    /// backing them. In the default strict mode a validator entity is only
    /// part of the electorate while it still has a registered node.
    #[serde(default)]
    pub allow_vote_without_entity: bool,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            min_proposal_deposit: Quantity::ZERO,
            voting_period: 1,
            quorum: 75,
            threshold: 90,
            upgrade_min_epoch_diff: 2,
            upgrade_cancel_min_epoch_diff: 1,
            enable_change_parameters_proposal: true,
            allow_vote_without_entity: false,
        }
    }
}

/// Parameter changes a proposal may apply to this module itself.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParameterChanges {
    pub voting_period: Option<EpochTime>,
    pub quorum: Option<u8>,
    pub threshold: Option<u8>,
    pub min_proposal_deposit: Option<Quantity>,
    pub allow_vote_without_entity: Option<bool>,
}

impl ParameterChanges {
    pub fn validate(&self) -> Result<(), Error> {
        for pct in [self.quorum, self.threshold].into_iter().flatten() {
            if pct == 0 || pct > 100 {
                return Err(Error::InvalidArgument);
            }
        }
        Ok(())
    }

    pub fn apply(&self, params: &mut Parameters) {
        if let Some(v) = self.voting_period {
            params.voting_period = v;
        }
        if let Some(v) = self.quorum {
            params.quorum = v;
        }
        if let Some(v) = self.threshold {
            params.threshold = v;
        }
        if let Some(v) = self.min_proposal_deposit {
            params.min_proposal_deposit = v;
        }
        if let Some(v) = self.allow_vote_without_entity {
            params.allow_vote_without_entity = v;
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Genesis {
    pub parameters: Option<Parameters>,
    pub proposals: Vec<Proposal>,
    pub vote_entries: BTreeMap<u64, Vec<VoteEntry>>,
}

/// Body of `governance.SubmitProposal`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposalContentBody {
    pub content: ProposalContent,
}

/// Body of `governance.CastVote`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposalVote {
    pub id: u64,
    pub vote: Vote,
}

/// Typed governance events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    ProposalSubmitted { id: u64, submitter: Address },
    Vote { id: u64, submitter: Address, vote: Vote },
    ProposalFinalized { id: u64, state: ProposalState },
    ProposalExecuted { id: u64 },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ProposalSubmitted { .. } => "proposal_submitted",
            Event::Vote { .. } => "vote",
            Event::ProposalFinalized { .. } => "proposal_finalized",
            Event::ProposalExecuted { .. } => "proposal_executed",
        }
    }
}

/// Recomputes the pending-upgrade index from a proposal list: every passed
/// upgrade proposal whose epoch has not yet been reached contributes one
/// entry.
pub fn pending_upgrades_from_proposals(
    proposals: &[Proposal],
    epoch: EpochTime,
) -> Vec<(u64, UpgradeDescriptor)> {
    let mut out = Vec::new();
    for proposal in proposals {
        if proposal.state != ProposalState::Passed {
            continue;
        }
        if let ProposalContent::Upgrade(descriptor) = &proposal.content {
            if descriptor.epoch >= epoch {
                out.push((proposal.id, descriptor.clone()));
            }
        }
    }
    out
}
