//! Commission schedules.
//!
//! An escrow account's commission schedule is a piecewise-constant-per-epoch
//! rate plus per-epoch rate-bound windows. Amendments overlay new steps onto
//! the existing schedule and are validated against the chain's
//! [`CommissionScheduleRules`]; every rate step must fall inside the bound
//! window active at its start.
//!
//! Rates are expressed in units of [`COMMISSION_RATE_DENOMINATOR`]ths.

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use eks_common::Quantity;

use crate::types::EpochTime;

/// Rate denominator: a rate of this value is a 100% commission.
pub const COMMISSION_RATE_DENOMINATOR: u128 = 100_000;

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum CommissionError {
    #[error("commission: steps not sorted by ascending start epoch")]
    NotSorted,

    #[error("commission: rate exceeds denominator")]
    RateTooHigh,

    #[error("commission: bound interval is inverted")]
    InvertedBound,

    #[error("commission: too many steps")]
    TooManySteps,

    #[error("commission: step starts in the past")]
    StartInPast,

    #[error("commission: step start not aligned to the rate change interval")]
    UnalignedStart,

    #[error("commission: bound step violates the bound lead time")]
    BoundLeadViolation,

    #[error("commission: rate under the chain minimum")]
    RateUnderMin,

    #[error("commission: no bound window covers a rate step")]
    NoBoundForStep,

    #[error("commission: rate outside the active bound window")]
    RateOutOfBound,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionRateStep {
    pub start: EpochTime,
    pub rate: Quantity,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionRateBoundStep {
    pub start: EpochTime,
    pub rate_min: Quantity,
    pub rate_max: Quantity,
}

/// Chain-wide rules amendments are validated against.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommissionScheduleRules {
    /// Rate steps may only start at multiples of this interval; zero
    /// disables the alignment requirement.
    pub rate_change_interval: EpochTime,
    /// Bound steps must start at least this many epochs in the future.
    pub rate_bound_lead: EpochTime,
    pub max_rate_steps: u16,
    pub max_bound_steps: u16,
    pub min_commission_rate: Quantity,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionSchedule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rates: Vec<CommissionRateStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bounds: Vec<CommissionRateBoundStep>,
}

impl CommissionSchedule {
    pub fn is_empty(&self) -> bool {
        self.rates.is_empty() && self.bounds.is_empty()
    }

    /// The rate in effect at the given epoch, if any step has started.
    pub fn current_rate(&self, now: EpochTime) -> Option<Quantity> {
        self.rates
            .iter()
            .rev()
            .find(|step| step.start <= now)
            .map(|step| step.rate)
    }

    fn current_bound(&self, now: EpochTime) -> Option<&CommissionRateBoundStep> {
        self.bounds.iter().rev().find(|step| step.start <= now)
    }

    /// Structural validation shared by stored schedules and amendments.
    fn validate_basic(&self, rules: &CommissionScheduleRules) -> Result<(), CommissionError> {
        if rules.max_rate_steps > 0 && self.rates.len() > rules.max_rate_steps as usize {
            return Err(CommissionError::TooManySteps);
        }
        if rules.max_bound_steps > 0 && self.bounds.len() > rules.max_bound_steps as usize {
            return Err(CommissionError::TooManySteps);
        }

        let denominator = Quantity::new(COMMISSION_RATE_DENOMINATOR);
        for window in self.rates.windows(2) {
            if window[0].start >= window[1].start {
                return Err(CommissionError::NotSorted);
            }
        }
        for step in &self.rates {
            if step.rate > denominator {
                return Err(CommissionError::RateTooHigh);
            }
            if step.rate < rules.min_commission_rate {
                return Err(CommissionError::RateUnderMin);
            }
        }

        for window in self.bounds.windows(2) {
            if window[0].start >= window[1].start {
                return Err(CommissionError::NotSorted);
            }
        }
        for step in &self.bounds {
            if step.rate_max > denominator {
                return Err(CommissionError::RateTooHigh);
            }
            if step.rate_min > step.rate_max {
                return Err(CommissionError::InvertedBound);
            }
        }

        Ok(())
    }

    /// Checks every rate step from `from` onward against the bound window
    /// active at its start.
    fn validate_rates_within_bounds(&self, from: EpochTime) -> Result<(), CommissionError> {
        for step in self.rates.iter().filter(|s| s.start >= from) {
            let bound = self
                .current_bound(step.start)
                .ok_or(CommissionError::NoBoundForStep)?;
            if step.rate < bound.rate_min || step.rate > bound.rate_max {
                return Err(CommissionError::RateOutOfBound);
            }
        }
        Ok(())
    }

    /// Drops steps that are wholly superseded before `now`, keeping the one
    /// step still in effect.
    pub fn prune(&mut self, now: EpochTime) {
        while self.rates.len() > 1 && self.rates[1].start <= now {
            self.rates.remove(0);
        }
        while self.bounds.len() > 1 && self.bounds[1].start <= now {
            self.bounds.remove(0);
        }
    }

    /// Overlays `amendment` onto the schedule at epoch `now`, enforcing the
    /// chain rules. On error the schedule is left unchanged.
    pub fn amend(
        &mut self,
        amendment: &CommissionSchedule,
        now: EpochTime,
        rules: &CommissionScheduleRules,
    ) -> Result<(), CommissionError> {
        amendment.validate_basic(rules)?;

        for step in &amendment.rates {
            if step.start <= now {
                return Err(CommissionError::StartInPast);
            }
            if rules.rate_change_interval > 0 && step.start % rules.rate_change_interval != 0 {
                return Err(CommissionError::UnalignedStart);
            }
        }
        for step in &amendment.bounds {
            if step.start < now.saturating_add(rules.rate_bound_lead) {
                return Err(CommissionError::BoundLeadViolation);
            }
        }

        let mut next = self.clone();
        if let Some(first) = amendment.rates.first() {
            next.rates.retain(|s| s.start < first.start);
            next.rates.extend(amendment.rates.iter().cloned());
        }
        if let Some(first) = amendment.bounds.first() {
            next.bounds.retain(|s| s.start < first.start);
            next.bounds.extend(amendment.bounds.iter().cloned());
        }

        next.prune(now);
        next.validate_basic(rules)?;
        next.validate_rates_within_bounds(
            amendment.rates.first().map(|s| s.start).unwrap_or(now),
        )?;

        *self = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> CommissionScheduleRules {
        CommissionScheduleRules {
            rate_change_interval: 1,
            rate_bound_lead: 2,
            max_rate_steps: 4,
            max_bound_steps: 4,
            min_commission_rate: Quantity::ZERO,
        }
    }

    fn bound(start: EpochTime, min: u128, max: u128) -> CommissionRateBoundStep {
        CommissionRateBoundStep {
            start,
            rate_min: Quantity::new(min),
            rate_max: Quantity::new(max),
        }
    }

    fn rate(start: EpochTime, value: u128) -> CommissionRateStep {
        CommissionRateStep {
            start,
            rate: Quantity::new(value),
        }
    }

    #[test]
    fn amend_fresh_schedule() {
        let mut schedule = CommissionSchedule::default();
        let amendment = CommissionSchedule {
            rates: vec![rate(10, 10_000)],
            bounds: vec![bound(10, 0, 20_000)],
        };
        schedule.amend(&amendment, 0, &rules()).unwrap();
        assert_eq!(schedule.current_rate(9), None);
        assert_eq!(schedule.current_rate(10), Some(Quantity::new(10_000)));
        assert_eq!(schedule.current_rate(999), Some(Quantity::new(10_000)));
    }

    #[test]
    fn amend_rejects_past_start() {
        let mut schedule = CommissionSchedule::default();
        let amendment = CommissionSchedule {
            rates: vec![rate(5, 1000)],
            bounds: vec![bound(7, 0, 20_000)],
        };
        assert_eq!(
            schedule.amend(&amendment, 5, &rules()),
            Err(CommissionError::StartInPast)
        );
        assert!(schedule.is_empty());
    }

    #[test]
    fn amend_rejects_bound_lead_violation() {
        let mut schedule = CommissionSchedule::default();
        let amendment = CommissionSchedule {
            bounds: vec![bound(1, 0, 20_000)],
            ..Default::default()
        };
        assert_eq!(
            schedule.amend(&amendment, 0, &rules()),
            Err(CommissionError::BoundLeadViolation)
        );
    }

    #[test]
    fn amend_rejects_rate_outside_bounds() {
        let mut schedule = CommissionSchedule::default();
        let amendment = CommissionSchedule {
            rates: vec![rate(10, 50_000)],
            bounds: vec![bound(10, 0, 20_000)],
        };
        assert_eq!(
            schedule.amend(&amendment, 0, &rules()),
            Err(CommissionError::RateOutOfBound)
        );
    }

    #[test]
    fn overlay_replaces_future_steps() {
        let mut schedule = CommissionSchedule {
            rates: vec![rate(10, 1000), rate(20, 2000)],
            bounds: vec![bound(10, 0, 100_000)],
        };
        let amendment = CommissionSchedule {
            rates: vec![rate(15, 3000)],
            ..Default::default()
        };
        schedule.amend(&amendment, 5, &rules()).unwrap();
        assert_eq!(schedule.current_rate(10), Some(Quantity::new(1000)));
        assert_eq!(schedule.current_rate(15), Some(Quantity::new(3000)));
        // The step at 20 was dropped by the overlay.
        assert_eq!(schedule.current_rate(25), Some(Quantity::new(3000)));
    }

    #[test]
    fn prune_keeps_step_in_effect() {
        let mut schedule = CommissionSchedule {
            rates: vec![rate(10, 1000), rate(20, 2000), rate(30, 3000)],
            bounds: vec![bound(10, 0, 100_000)],
        };
        schedule.prune(25);
        assert_eq!(schedule.rates.len(), 2);
        assert_eq!(schedule.current_rate(25), Some(Quantity::new(2000)));
    }

    #[test]
    fn too_many_steps_rejected() {
        let mut schedule = CommissionSchedule::default();
        let amendment = CommissionSchedule {
            rates: (1..=5).map(|i| rate(10 * i, 1000)).collect(),
            bounds: vec![bound(10, 0, 100_000)],
        };
        assert_eq!(
            schedule.amend(&amendment, 0, &rules()),
            Err(CommissionError::TooManySteps)
        );
    }
}
