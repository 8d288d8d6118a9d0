//! Position records and theta budget accounting.
//!
//! The ledger knows nothing about ladders; ladder placement is recorded on a
//! position through [`PositionLedger::attach_to_ladder`] by whoever owns both.

pub mod ledger;
pub mod request;
pub mod theta_budget;

pub use ledger::PositionLedger;
pub use request::{CloseOutcome, OpenRequest, TemporalContext};
pub use theta_budget::{BudgetReset, ThetaBudget, ThetaBudgetStatus, BUDGET_EPSILON};
