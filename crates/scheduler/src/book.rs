use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use prime_ladder_core::{
    Band, Clock, EventBus, IdSource, LadderConfig, LadderError, LadderResult, Position,
    TemporalScore,
};
use prime_ladder_ledger::{CloseOutcome, OpenRequest, PositionLedger, ThetaBudgetStatus};
use prime_ladder_registry::{Assignment, LadderRegistry, RegistrySnapshot};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::queue::RollQueue;

/// The book shared by the engine's timers; one lock serializes every mutation.
pub type SharedBook = Arc<Mutex<LadderBook>>;

/// Counters kept across roll cycles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub rolls_completed: u64,
    pub failed_closes: u64,
    pub reopen_failures: u64,
    pub dropped: u64,
    pub total_roll_pnl: f64,
    pub successful_rolls_by_band: BTreeMap<Band, u64>,
}

impl SchedulerMetrics {
    #[must_use]
    pub fn average_roll_pnl(&self) -> f64 {
        if self.rolls_completed == 0 {
            0.0
        } else {
            self.total_roll_pnl / self.rolls_completed as f64
        }
    }
}

/// Result of opening a position and attempting ladder placement.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOutcome {
    pub position: Position,
    /// `None` when the score did not pass the ladder quality gate or the
    /// placement was rejected.
    pub assignment: Option<Assignment>,
    /// Capacity rejection from the registry; the position stays open.
    pub assignment_error: Option<LadderError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub active_positions: usize,
    pub budget: ThetaBudgetStatus,
    pub ladders: RegistrySnapshot,
    pub queued_rolls: usize,
    pub metrics: SchedulerMetrics,
}

/// Ledger, registry and roll queue owned together.
///
/// The ledger and the registry never see each other; every operation that
/// touches both lives here.
pub struct LadderBook {
    pub ledger: PositionLedger,
    pub registry: LadderRegistry,
    pub queue: RollQueue,
    pub metrics: SchedulerMetrics,
    clock: Arc<dyn Clock>,
}

impl LadderBook {
    #[must_use]
    pub fn new(
        config: LadderConfig,
        ids: Arc<dyn IdSource>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            ledger: PositionLedger::new(config.clone(), Arc::clone(&ids), Arc::clone(&clock), events),
            registry: LadderRegistry::new(config, ids),
            queue: RollQueue::new(),
            metrics: SchedulerMetrics::default(),
            clock,
        }
    }

    #[must_use]
    pub fn shared(self) -> SharedBook {
        Arc::new(Mutex::new(self))
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    #[must_use]
    pub fn config(&self) -> &LadderConfig {
        self.ledger.config()
    }

    pub fn apply_config(&mut self, config: LadderConfig) {
        self.registry.update_config(config.clone());
        self.ledger.update_config(config);
        info!("Ladder book picked up new configuration");
    }

    /// Opens a position, then places it in a ladder if `score` passes the gate.
    ///
    /// # Errors
    ///
    /// Propagates ledger errors. Ladder rejections are reported in the outcome.
    pub fn open_and_assign(
        &mut self,
        request: OpenRequest,
        score: &TemporalScore,
    ) -> LadderResult<OpenOutcome> {
        let position = self.ledger.open_position(request)?;
        let now = self.now();
        self.refresh_symbol(&position.symbol, now);

        let (assignment, assignment_error) =
            match self.registry.assign_to_ladder(&position, score, now) {
                Ok(Some(assignment)) => {
                    self.ledger
                        .attach_to_ladder(&position.id, &assignment.ladder_id, assignment.band)?;
                    (Some(assignment), None)
                }
                Ok(None) => (None, None),
                Err(e) => {
                    warn!(
                        position_id = %position.id,
                        error_code = %e.code(),
                        error = %e,
                        "Position opened without a ladder"
                    );
                    (None, Some(e))
                }
            };

        let position = self
            .ledger
            .get(&position.id)
            .cloned()
            .unwrap_or(position);
        Ok(OpenOutcome {
            position,
            assignment,
            assignment_error,
        })
    }

    /// Closes a position outside of a roll and forgets any queued roll for it.
    ///
    /// # Errors
    ///
    /// Returns [`LadderError::NotFound`] for unknown or closed positions.
    pub fn close(
        &mut self,
        position_id: &str,
        reason: &str,
        realized_pnl: Option<f64>,
    ) -> LadderResult<CloseOutcome> {
        let outcome = self.ledger.close_position(position_id, reason, realized_pnl)?;
        let now = self.now();
        self.registry.remove_position(position_id, now);
        self.queue.remove(position_id);
        self.refresh_symbol(&outcome.position.symbol, now);
        Ok(outcome)
    }

    /// Recomputes metrics for every ladder of `symbol`.
    pub fn refresh_symbol(&mut self, symbol: &str, now: DateTime<Utc>) {
        let ids: Vec<String> = self
            .registry
            .ladders_for(symbol)
            .map(|l| l.id.clone())
            .collect();
        let ledger = &self.ledger;
        for id in ids {
            self.registry.update_ladder_metrics(&id, |pid| ledger.get(pid), now);
        }
    }

    pub fn refresh_all(&mut self, now: DateTime<Utc>) -> usize {
        let ledger = &self.ledger;
        self.registry.refresh_all(|pid| ledger.get(pid), now)
    }

    #[must_use]
    pub fn snapshot(&self) -> SystemSnapshot {
        SystemSnapshot {
            timestamp: self.now(),
            active_positions: self.ledger.active_count(),
            budget: self.ledger.budget_status(),
            ladders: self.registry.snapshot(),
            queued_rolls: self.queue.len(),
            metrics: self.metrics.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prime_ladder_core::{ErrorCode, ManualClock, SequentialIdSource, Side, StaticOracle};
    use rust_decimal_macros::dec;

    fn book() -> LadderBook {
        LadderBook::new(
            LadderConfig::default(),
            Arc::new(SequentialIdSource::new()),
            Arc::new(ManualClock::new(Utc::now())),
            EventBus::default(),
        )
    }

    fn request(symbol: &str) -> OpenRequest {
        OpenRequest::new(symbol, Side::Buy, dec!(100), dec!(95), dec!(110), 0.7)
            .with_days_to_expiry(11)
    }

    #[test]
    fn open_attaches_ladder_to_position() {
        let mut book = book();
        let outcome = book
            .open_and_assign(request("BTCUSDT"), &StaticOracle::score(0.05, 0.5, 0.3))
            .unwrap();
        let assignment = outcome.assignment.unwrap();
        assert_eq!(outcome.position.ladder_id.as_deref(), Some(assignment.ladder_id.as_str()));
        assert_eq!(outcome.position.assigned_band, assignment.band);
    }

    #[test]
    fn capacity_rejection_keeps_position_open() {
        let mut book = book();
        let score = StaticOracle::score(0.05, 0.5, 0.3);
        // TIER6: two ladders of one position
        book.open_and_assign(request("PEPEUSDT"), &score).unwrap();
        book.open_and_assign(request("PEPEUSDT"), &score).unwrap();
        let third = book.open_and_assign(request("PEPEUSDT"), &score).unwrap();
        assert!(third.assignment.is_none());
        assert_eq!(
            third.assignment_error.map(|e| e.code()),
            Some(ErrorCode::LadderFull)
        );
        assert!(third.position.is_active());
        assert_eq!(book.ledger.active_count(), 3);
    }

    #[test]
    fn close_frees_ladder_slot_and_queue() {
        let mut book = book();
        let score = StaticOracle::score(0.05, 0.5, 0.3);
        let opened = book.open_and_assign(request("PEPEUSDT"), &score).unwrap();
        book.close(&opened.position.id, "manual", None).unwrap();
        assert!(book.registry.find_ladder_by_position(&opened.position.id).is_none());
        assert!(book.registry.has_capacity("PEPEUSDT", 7));
    }
}
