//! Staking: the account ledger, escrow share pools, debonding, slashing,
//! fee disbursement and rewards.
//!
//! Escrowed stake lives in per-account share pools: delegators hold shares,
//! the pool holds the backing balance, and `price = balance / total_shares`.
//! Rewards raise the price without minting shares; slashing lowers it
//! without burning shares. Reclaimed stake moves through a debonding pool
//! and only returns to the delegator's general balance after the debonding
//! interval elapses.

pub mod app;
pub mod commission;
pub mod state;
#[cfg(test)]
mod tests;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use eks_common::{move_amount, Address, Quantity, QuantityError};

use crate::mkvs::StateError;
use crate::types::EpochTime;

pub use app::App;
pub use commission::{
    CommissionRateBoundStep, CommissionRateStep, CommissionSchedule, CommissionScheduleRules,
    COMMISSION_RATE_DENOMINATOR,
};

/// Application name.
pub const APP_NAME: &str = "staking";

/// Transaction methods.
pub const METHOD_TRANSFER: &str = "staking.Transfer";
pub const METHOD_BURN: &str = "staking.Burn";
pub const METHOD_ADD_ESCROW: &str = "staking.AddEscrow";
pub const METHOD_RECLAIM_ESCROW: &str = "staking.ReclaimEscrow";
pub const METHOD_AMEND_COMMISSION_SCHEDULE: &str = "staking.AmendCommissionSchedule";
pub const METHOD_ALLOW: &str = "staking.Allow";
pub const METHOD_WITHDRAW: &str = "staking.Withdraw";

/// Denominator for reward factors: a factor of this value pays 100% of the
/// escrow balance per reward event.
pub const REWARD_AMOUNT_DENOMINATOR: u128 = 1_000_000_000_000_000_000;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("staking: invalid argument")]
    InvalidArgument,

    #[error("staking: insufficient balance")]
    InsufficientBalance,

    #[error("staking: balance too low ({0})")]
    BalanceTooLow(&'static str),

    #[error("staking: insufficient stake")]
    InsufficientStake,

    #[error("staking: transfer amount under minimum")]
    UnderMinTransferAmount,

    #[error("staking: delegation amount under minimum")]
    UnderMinDelegationAmount,

    #[error("staking: forbidden: reserved address")]
    ForbiddenReservedAddress,

    #[error("staking: too many allowances")]
    TooManyAllowances,

    #[error("staking: allowance exceeded")]
    AllowanceExceeded,

    #[error("staking: escrow messages are disabled")]
    EscrowMessagesDisabled,

    #[error(transparent)]
    Commission(#[from] commission::CommissionError),

    #[error(transparent)]
    Arithmetic(#[from] QuantityError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::State(_))
    }
}

/// Threshold kinds for stake claims.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ThresholdKind {
    Entity,
    NodeValidator,
    NodeCompute,
}

/// Slashing reasons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SlashReason {
    ConsensusEquivocation,
    ConsensusLightClientAttack,
}

/// Slashing parameters for one reason.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Slash {
    pub amount: Quantity,
    /// Epochs the offending node stays frozen for;
    /// [`crate::registry::FREEZE_FOREVER`] freezes permanently, zero skips
    /// freezing.
    pub freeze_interval: EpochTime,
}

/// A share pool: a balance backing a number of outstanding shares.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharePool {
    pub balance: Quantity,
    pub total_shares: Quantity,
}

impl SharePool {
    /// Shares issued for depositing `amount` at the current price. At the
    /// zero state the pool starts at price one.
    pub fn shares_for_deposit(&self, amount: &Quantity) -> Result<Quantity, Error> {
        if self.balance.is_zero() || self.total_shares.is_zero() {
            return Ok(*amount);
        }
        Ok(amount.mul_quo(&self.total_shares, &self.balance)?)
    }

    /// Base units returned for withdrawing `shares` at the current price.
    pub fn amount_for_shares(&self, shares: &Quantity) -> Result<Quantity, Error> {
        if self.total_shares.is_zero() {
            return Ok(Quantity::ZERO);
        }
        Ok(shares.mul_quo(&self.balance, &self.total_shares)?)
    }

    /// Moves `amount` from `src` into the pool, crediting the issued shares
    /// to `shares_dst`. Shares round down; the remainder stays in the pool
    /// as extra backing for all holders. Returns the issued shares.
    pub fn deposit(
        &mut self,
        shares_dst: &mut Quantity,
        src: &mut Quantity,
        amount: &Quantity,
    ) -> Result<Quantity, Error> {
        let new_shares = self.shares_for_deposit(amount)?;
        move_amount(&mut self.balance, src, amount).map_err(|e| match e {
            QuantityError::InsufficientBalance => Error::InsufficientBalance,
            other => Error::Arithmetic(other),
        })?;
        shares_dst.add(&new_shares)?;
        self.total_shares.add(&new_shares)?;
        Ok(new_shares)
    }

    /// Redeems `shares` out of `shares_src`, moving the corresponding base
    /// units from the pool into `dst`. Returns the amount withdrawn.
    pub fn withdraw(
        &mut self,
        dst: &mut Quantity,
        shares_src: &mut Quantity,
        shares: &Quantity,
    ) -> Result<Quantity, Error> {
        if *shares_src < *shares || shares.is_zero() {
            return Err(Error::InsufficientStake);
        }
        let amount = self.amount_for_shares(shares)?;
        shares_src.sub(shares)?;
        self.total_shares.sub(shares)?;
        move_amount(dst, &mut self.balance, &amount)?;
        Ok(amount)
    }
}

/// Hook kinds an account can register destinations for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HookKind {
    Withdraw,
}

/// The spendable part of an account.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralAccount {
    pub balance: Quantity,
    /// Third-party withdraw authorisations, per beneficiary.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allowances: BTreeMap<Address, Quantity>,
    /// Named callback registrations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hooks: BTreeMap<HookKind, Address>,
}

/// The escrowed part of an account.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowAccount {
    pub active: SharePool,
    pub debonding: SharePool,
    #[serde(default, skip_serializing_if = "CommissionSchedule::is_empty")]
    pub commission_schedule: CommissionSchedule,
}

/// A staking account. Created implicitly on first write and never removed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub general: GeneralAccount,
    pub escrow: EscrowAccount,
}

/// Shares a delegator holds in an escrow account's active pool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub shares: Quantity,
}

/// Shares unwinding out of an escrow account's debonding pool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebondingDelegation {
    pub shares: Quantity,
    /// Epoch at which the stake becomes withdrawable.
    pub debond_end_time: EpochTime,
}

impl DebondingDelegation {
    /// Merges another debonding delegation with the same end epoch.
    pub fn merge(&mut self, other: &DebondingDelegation) -> Result<(), Error> {
        if self.debond_end_time != other.debond_end_time {
            return Err(Error::InvalidArgument);
        }
        self.shares.add(&other.shares)?;
        Ok(())
    }
}

/// One step of the epoch reward schedule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RewardStep {
    pub until: EpochTime,
    pub scale: Quantity,
}

/// Staking consensus parameters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Parameters {
    pub thresholds: BTreeMap<ThresholdKind, Quantity>,
    pub debonding_interval: EpochTime,
    pub reward_schedule: Vec<RewardStep>,
    /// Fraction of an epoch's blocks an entity must have signed to collect
    /// the signing reward.
    pub signing_reward_threshold_numerator: u64,
    pub signing_reward_threshold_denominator: u64,
    pub commission_schedule_rules: CommissionScheduleRules,
    pub slashing: BTreeMap<SlashReason, Slash>,
    pub min_delegation_amount: Quantity,
    pub min_transfer_amount: Quantity,
    /// Minimum general balance both sides of a transfer must retain.
    pub min_transact_balance: Quantity,
    pub fee_split_weight_vote: Quantity,
    pub fee_split_weight_propose: Quantity,
    pub reward_factor_epoch_signed: Quantity,
    pub reward_factor_block_proposed: Quantity,
    /// Permits runtimes to emit escrow operations.
    pub allow_escrow_messages: bool,
    pub max_allowances: u32,
}

/// Staking genesis section.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Genesis {
    pub parameters: Parameters,
    pub total_supply: Quantity,
    pub common_pool: Quantity,
    pub last_block_fees: Quantity,
    pub governance_deposits: Quantity,
    pub ledger: Vec<(Address, Account)>,
    /// `(escrow, delegator, delegation)` triples.
    pub delegations: Vec<(Address, Address, Delegation)>,
    /// `(escrow, delegator, debonding delegation)` triples.
    pub debonding_delegations: Vec<(Address, Address, DebondingDelegation)>,
}

// ─── Transaction bodies ────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transfer {
    pub to: Address,
    pub amount: Quantity,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Burn {
    pub amount: Quantity,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Escrow {
    pub account: Address,
    pub amount: Quantity,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReclaimEscrow {
    pub account: Address,
    pub shares: Quantity,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AmendCommissionSchedule {
    pub amendment: CommissionSchedule,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Allow {
    pub beneficiary: Address,
    pub negative: bool,
    pub amount_change: Quantity,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Withdraw {
    pub from: Address,
    pub amount: Quantity,
}

/// Staking operations a runtime may emit through the roothash application.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StakingMessage {
    Transfer(Transfer),
    Withdraw(Withdraw),
    AddEscrow(Escrow),
    ReclaimEscrow(ReclaimEscrow),
}

/// Parameter changes a governance proposal may apply to this module.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParameterChanges {
    pub debonding_interval: Option<EpochTime>,
    pub min_transact_balance: Option<Quantity>,
    pub min_delegation_amount: Option<Quantity>,
    pub reward_factor_epoch_signed: Option<Quantity>,
}

impl ParameterChanges {
    pub fn apply(&self, params: &mut Parameters) {
        if let Some(v) = self.debonding_interval {
            params.debonding_interval = v;
        }
        if let Some(v) = self.min_transact_balance {
            params.min_transact_balance = v;
        }
        if let Some(v) = self.min_delegation_amount {
            params.min_delegation_amount = v;
        }
        if let Some(v) = self.reward_factor_epoch_signed {
            params.reward_factor_epoch_signed = v;
        }
    }
}

// ─── Events ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Transfer {
        from: Address,
        to: Address,
        amount: Quantity,
    },
    Burn {
        owner: Address,
        amount: Quantity,
    },
    AddEscrow {
        owner: Address,
        escrow: Address,
        amount: Quantity,
        new_shares: Quantity,
    },
    ReclaimEscrow {
        owner: Address,
        escrow: Address,
        amount: Quantity,
        shares: Quantity,
    },
    TakeEscrow {
        owner: Address,
        amount: Quantity,
        debonding_amount: Quantity,
    },
    AllowanceChange {
        owner: Address,
        beneficiary: Address,
        allowance: Quantity,
        negative: bool,
        amount_change: Quantity,
    },
}

/// Attribute kind of [`Event::TakeEscrow`], the trigger the scheduler
/// watches for mid-epoch re-election.
pub const EVENT_KIND_TAKE_ESCROW: &str = "take_escrow";

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Transfer { .. } => "transfer",
            Event::Burn { .. } => "burn",
            Event::AddEscrow { .. } => "add_escrow",
            Event::ReclaimEscrow { .. } => "reclaim_escrow",
            Event::TakeEscrow { .. } => EVENT_KIND_TAKE_ESCROW,
            Event::AllowanceChange { .. } => "allowance_change",
        }
    }
}
