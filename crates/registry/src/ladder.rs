use chrono::{DateTime, Utc};
use prime_ladder_core::{Band, Position};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LadderMember {
    pub position_id: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LadderMetrics {
    /// Sum of `|theta| * size` over live members.
    pub total_theta: f64,
    /// Sum of member notionals.
    pub total_value: f64,
    pub unrealized_pnl: f64,
    /// `unrealized_pnl / total_theta`, 0 when there is no theta.
    pub theta_efficiency: f64,
    pub rolls_completed: u32,
}

/// One completed roll out of a ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollRecord {
    pub timestamp: DateTime<Utc>,
    pub from_band: Band,
    pub to_band: Band,
    pub reason: String,
    pub old_position_id: String,
    pub new_position_id: String,
}

/// Positions of one symbol sharing one band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ladder {
    pub id: String,
    pub symbol: String,
    pub band: Band,
    pub tier: String,
    pub members: Vec<LadderMember>,
    pub metrics: LadderMetrics,
    pub roll_history: Vec<RollRecord>,
    pub created_at: DateTime<Utc>,
    /// Last time the ladder gained or lost a member or held any.
    pub last_active: DateTime<Utc>,
}

impl Ladder {
    pub(crate) fn new(
        id: String,
        symbol: &str,
        band: Band,
        tier: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            symbol: symbol.to_string(),
            band,
            tier: tier.to_string(),
            members: Vec::new(),
            metrics: LadderMetrics::default(),
            roll_history: Vec::new(),
            created_at: now,
            last_active: now,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[must_use]
    pub fn contains(&self, position_id: &str) -> bool {
        self.members.iter().any(|m| m.position_id == position_id)
    }

    /// Oldest member; rebalancing leaves it in place.
    #[must_use]
    pub fn anchor(&self) -> Option<&LadderMember> {
        self.members.first()
    }

    pub(crate) fn push(&mut self, position: &Position, now: DateTime<Utc>) {
        self.members.push(LadderMember {
            position_id: position.id.clone(),
            added_at: now,
        });
        self.metrics.total_theta += position.theta_exposure();
        self.metrics.total_value += position.notional();
        self.last_active = now;
    }

    pub(crate) fn remove(&mut self, position_id: &str, now: DateTime<Utc>) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.position_id != position_id);
        let removed = self.members.len() != before;
        if removed {
            self.last_active = now;
        }
        removed
    }

    /// Recomputes metrics from the live members resolved by `lookup`.
    ///
    /// Members that no longer resolve to an active position in this ladder
    /// are dropped and returned.
    pub(crate) fn refresh<'a, F>(&mut self, lookup: F, now: DateTime<Utc>) -> Vec<String>
    where
        F: Fn(&str) -> Option<&'a Position>,
    {
        let mut stale = Vec::new();
        let mut total_theta = 0.0;
        let mut total_value = 0.0;
        let mut unrealized = 0.0;

        let ladder_id = self.id.clone();
        self.members.retain(|member| match lookup(&member.position_id) {
            Some(p) if p.is_active() && p.ladder_id.as_deref().map_or(true, |id| id == ladder_id) => {
                total_theta += p.theta_exposure();
                total_value += p.notional();
                unrealized += p.unrealized_pnl;
                true
            }
            _ => {
                stale.push(member.position_id.clone());
                false
            }
        });

        self.metrics.total_theta = total_theta;
        self.metrics.total_value = total_value;
        self.metrics.unrealized_pnl = unrealized;
        self.metrics.theta_efficiency = if total_theta > 0.0 {
            unrealized / total_theta
        } else {
            0.0
        };
        if !self.members.is_empty() || !stale.is_empty() {
            self.last_active = now;
        }
        stale
    }

    pub(crate) fn record_roll(&mut self, record: RollRecord) {
        self.roll_history.push(record);
        self.metrics.rolls_completed += 1;
    }
}
