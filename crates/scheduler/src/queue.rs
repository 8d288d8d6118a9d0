//! Priority queue of pending rolls.
//!
//! Ordering is priority descending, then insertion order. At most one request
//! per position is outstanding; a second request for the same position only
//! replaces the first if it has a strictly higher priority.

use chrono::{DateTime, Utc};
use prime_ladder_core::Band;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollReason {
    #[serde(rename = "stop_loss_triggered")]
    StopLoss,
    Manual,
    ApproachingExpiry,
    EdgeTemporalDecay,
    ProfitTargetHit,
    RebalanceThetaConcentration,
    LowThetaEfficiency,
}

impl RollReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StopLoss => "stop_loss_triggered",
            Self::Manual => "manual",
            Self::ApproachingExpiry => "approaching_expiry",
            Self::EdgeTemporalDecay => "edge_temporal_decay",
            Self::ProfitTargetHit => "profit_target_hit",
            Self::RebalanceThetaConcentration => "rebalance_theta_concentration",
            Self::LowThetaEfficiency => "low_theta_efficiency",
        }
    }

    /// Default priority; profit-target priority scales with the overshoot.
    #[must_use]
    pub const fn base_priority(self) -> u8 {
        match self {
            Self::StopLoss => 20,
            Self::Manual => 15,
            Self::ApproachingExpiry => 10,
            Self::EdgeTemporalDecay => 8,
            Self::ProfitTargetHit => 6,
            Self::RebalanceThetaConcentration => 5,
            Self::LowThetaEfficiency => 4,
        }
    }

    /// Rebalance-driven rolls target the least-concentrated band rather than
    /// the next band up.
    #[must_use]
    pub const fn is_rebalance(self) -> bool {
        matches!(
            self,
            Self::RebalanceThetaConcentration | Self::LowThetaEfficiency
        )
    }
}

impl std::fmt::Display for RollReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollRequest {
    pub position_id: String,
    pub ladder_id: Option<String>,
    pub reason: RollReason,
    pub priority: u8,
    pub target_band: Band,
    pub queued_at: DateTime<Utc>,
    /// Failed close attempts so far.
    pub attempts: u32,
    /// Operator note for forced rolls.
    pub note: Option<String>,
}

impl RollRequest {
    #[must_use]
    pub fn new(
        position_id: impl Into<String>,
        ladder_id: Option<String>,
        reason: RollReason,
        target_band: Band,
        queued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            position_id: position_id.into(),
            ladder_id,
            reason,
            priority: reason.base_priority(),
            target_band,
            queued_at,
            attempts: 0,
            note: None,
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Replaced a lower-priority request for the same position.
    Replaced,
    /// An equal or higher-priority request was already queued.
    Kept,
}

/// Queue entry with a read-only view for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRoll {
    pub position_id: String,
    pub reason: RollReason,
    pub priority: u8,
    pub target_band: Band,
    pub attempts: u32,
    pub wait_secs: i64,
}

#[derive(Debug, Clone)]
struct Entry {
    request: RollRequest,
    seq: i64,
}

#[derive(Debug, Default)]
pub struct RollQueue {
    entries: Vec<Entry>,
    next_seq: i64,
    /// Decreasing counter so forced entries sort ahead of everything queued
    /// at the same priority.
    next_front: i64,
}

impl RollQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, request: RollRequest) -> EnqueueOutcome {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.insert(request, seq)
    }

    /// Queues ahead of every other request of the same priority.
    pub fn push_front(&mut self, request: RollRequest) -> EnqueueOutcome {
        self.next_front -= 1;
        let seq = self.next_front;
        self.insert(request, seq)
    }

    fn insert(&mut self, request: RollRequest, seq: i64) -> EnqueueOutcome {
        match self
            .entries
            .iter_mut()
            .find(|e| e.request.position_id == request.position_id)
        {
            Some(existing) if request.priority > existing.request.priority => {
                *existing = Entry { request, seq };
                EnqueueOutcome::Replaced
            }
            Some(_) => EnqueueOutcome::Kept,
            None => {
                self.entries.push(Entry { request, seq });
                EnqueueOutcome::Queued
            }
        }
    }

    /// Removes and returns up to `max` requests in processing order.
    pub fn pop_batch(&mut self, max: usize) -> Vec<RollRequest> {
        self.sort();
        let take = max.min(self.entries.len());
        self.entries.drain(..take).map(|e| e.request).collect()
    }

    /// Drops any request for `position_id`.
    pub fn remove(&mut self, position_id: &str) -> Option<RollRequest> {
        let index = self
            .entries
            .iter()
            .position(|e| e.request.position_id == position_id)?;
        Some(self.entries.remove(index).request)
    }

    #[must_use]
    pub fn get(&self, position_id: &str) -> Option<&RollRequest> {
        self.entries
            .iter()
            .map(|e| &e.request)
            .find(|r| r.position_id == position_id)
    }

    #[must_use]
    pub fn contains(&self, position_id: &str) -> bool {
        self.get(position_id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Outstanding requests in processing order with their wait so far.
    #[must_use]
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<QueuedRoll> {
        let mut entries: Vec<&Entry> = self.entries.iter().collect();
        entries.sort_by(|a, b| Self::order(a, b));
        entries
            .into_iter()
            .map(|e| QueuedRoll {
                position_id: e.request.position_id.clone(),
                reason: e.request.reason,
                priority: e.request.priority,
                target_band: e.request.target_band,
                attempts: e.request.attempts,
                wait_secs: (now - e.request.queued_at).num_seconds(),
            })
            .collect()
    }

    fn sort(&mut self) {
        self.entries.sort_by(Self::order);
    }

    fn order(a: &Entry, b: &Entry) -> std::cmp::Ordering {
        b.request
            .priority
            .cmp(&a.request.priority)
            .then(a.seq.cmp(&b.seq))
    }
}
