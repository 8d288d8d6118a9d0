//! Daily theta budget.
//!
//! Positions reserve `|theta| * size` on open and release it on close. The
//! budget never goes above its daily allowance: a reservation that would
//! overshoot is refused outright and the caller decides how to scale down.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Tolerance for `used == sum(reservations)`.
pub const BUDGET_EPSILON: f64 = 1e-3;

/// Balances smaller than this are floating-point residue.
const RESIDUE_EPSILON: f64 = 1e-9;

/// Slack on the `used + amount <= daily` comparison so that exactly filling
/// the budget is not refused by rounding.
const FILL_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq)]
pub struct ThetaBudget {
    daily_budget: f64,
    used_budget: f64,
    reservations: BTreeMap<String, f64>,
}

/// Point-in-time view of the budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThetaBudgetStatus {
    pub daily_budget: f64,
    pub used_budget: f64,
    pub available: f64,
    /// `used / daily * 100`
    pub utilization_pct: f64,
    pub reservations: usize,
}

/// Result of a budget reset, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetReset {
    pub reason: String,
    pub previous_used: f64,
}

impl ThetaBudget {
    #[must_use]
    pub fn new(daily_budget: f64) -> Self {
        Self {
            daily_budget,
            used_budget: 0.0,
            reservations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn daily_budget(&self) -> f64 {
        self.daily_budget
    }

    #[must_use]
    pub fn used_budget(&self) -> f64 {
        self.used_budget
    }

    #[must_use]
    pub fn available(&self) -> f64 {
        (self.daily_budget - self.used_budget).max(0.0)
    }

    #[must_use]
    pub fn reservation(&self, symbol: &str) -> f64 {
        self.reservations.get(symbol).copied().unwrap_or(0.0)
    }

    #[must_use]
    pub fn reservations(&self) -> &BTreeMap<String, f64> {
        &self.reservations
    }

    /// Reserves `amount` for `symbol` if it fits in the remaining budget.
    ///
    /// All or nothing: a refused reservation leaves the budget untouched.
    /// Negative or non-finite amounts are refused.
    pub fn reserve(&mut self, symbol: &str, amount: f64) -> bool {
        if !amount.is_finite() || amount < 0.0 {
            return false;
        }
        if self.used_budget + amount > self.daily_budget + FILL_TOLERANCE {
            debug!(
                symbol,
                amount,
                used = self.used_budget,
                daily = self.daily_budget,
                "Theta reservation refused"
            );
            return false;
        }
        if amount == 0.0 {
            return true;
        }
        self.used_budget += amount;
        *self.reservations.entry(symbol.to_string()).or_insert(0.0) += amount;
        true
    }

    /// Returns `amount` to the budget.
    ///
    /// `used` is floored at zero; a symbol whose reservation would go
    /// negative is dropped from the map.
    pub fn release(&mut self, symbol: &str, amount: f64) {
        if !amount.is_finite() || amount <= 0.0 {
            return;
        }
        self.used_budget = (self.used_budget - amount).max(0.0);
        if let Some(held) = self.reservations.get_mut(symbol) {
            let remaining = *held - amount;
            if remaining < 0.0 {
                self.reservations.remove(symbol);
            } else {
                *held = remaining;
            }
        }
    }

    /// Zeroes the budget and returns the amount that was in use.
    pub fn reset(&mut self, reason: &str) -> BudgetReset {
        let previous_used = self.used_budget;
        self.used_budget = 0.0;
        self.reservations.clear();
        info!(reason, previous_used, "Theta budget reset");
        BudgetReset {
            reason: reason.to_string(),
            previous_used,
        }
    }

    /// Zeroes balances that are only floating-point drift away from zero.
    pub fn cleanup_residues(&mut self) {
        if self.used_budget.abs() < RESIDUE_EPSILON {
            self.used_budget = 0.0;
        }
        self.reservations
            .retain(|_, amount| amount.abs() >= RESIDUE_EPSILON);
    }

    /// Changes the daily allowance. Existing reservations are kept even if
    /// they now exceed it; new reservations are refused until enough is released.
    pub fn set_daily_budget(&mut self, daily_budget: f64) {
        self.daily_budget = daily_budget;
    }

    /// Whether `used` matches the sum of reservations within [`BUDGET_EPSILON`].
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let reserved: f64 = self.reservations.values().sum();
        (self.used_budget - reserved).abs() <= BUDGET_EPSILON
    }

    #[must_use]
    pub fn status(&self) -> ThetaBudgetStatus {
        let utilization_pct = if self.daily_budget > 0.0 {
            self.used_budget / self.daily_budget * 100.0
        } else {
            0.0
        };
        ThetaBudgetStatus {
            daily_budget: self.daily_budget,
            used_budget: self.used_budget,
            available: self.available(),
            utilization_pct,
            reservations: self.reservations.len(),
        }
    }
}
