//! Roll and rebalance scheduling over a shared ladder book.
//!
//! Every mutation of the ledger, the registry and the roll queue goes
//! through one [`SharedBook`] lock. Oracle calls happen before that lock is
//! taken.

pub mod book;
pub mod engine;
pub mod queue;
pub mod rebalance;
pub mod roll;
pub mod triggers;

pub use book::{LadderBook, OpenOutcome, SchedulerMetrics, SharedBook, SystemSnapshot};
pub use engine::LadderEngine;
pub use queue::{EnqueueOutcome, QueuedRoll, RollQueue, RollReason, RollRequest};
pub use rebalance::{rebalance, RebalanceReport, RebalanceScheduler};
pub use roll::{execute_roll, RollOutcome, RollScheduler};
pub use triggers::{evaluate_position, is_inefficient, TriggerHit};
