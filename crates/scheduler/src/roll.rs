//! Roll trigger evaluation and roll execution.
//!
//! A roll is closing a position and opening its replacement in another band.
//! Each roll runs as one transaction under the book lock; oracle calls are
//! made before the lock is taken.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use prime_ladder_core::{
    score_with_fallback, Band, Clock, ErrorCode, LadderConfig, LadderError, LadderResult,
    MarketContext, Position, ScoringOracle, TemporalScore,
};
use prime_ladder_ledger::{OpenRequest, TemporalContext};
use prime_ladder_registry::RollRecord;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::book::{LadderBook, SharedBook};
use crate::queue::{EnqueueOutcome, RollReason, RollRequest};
use crate::triggers::evaluate_position;

/// What happened to one dequeued roll request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RollOutcome {
    Completed {
        old_position_id: String,
        new_position_id: String,
        from_band: Band,
        to_band: Band,
        reason: RollReason,
        realized_pnl: f64,
        /// Relative change in notional between old and new position.
        notional_drift: f64,
    },
    /// Position was already closed or gone.
    Skipped { position_id: String },
    /// No band could take the replacement, or its terms were invalid;
    /// nothing was closed.
    Dropped {
        position_id: String,
        error: LadderError,
    },
    CloseFailed {
        position_id: String,
        error: LadderError,
        requeued: bool,
    },
    /// The old position is closed and has no replacement.
    ReopenFailed {
        position_id: String,
        error: LadderError,
    },
}

impl RollOutcome {
    #[must_use]
    pub fn position_id(&self) -> &str {
        match self {
            Self::Completed {
                old_position_id, ..
            } => old_position_id,
            Self::Skipped { position_id }
            | Self::Dropped { position_id, .. }
            | Self::CloseFailed { position_id, .. }
            | Self::ReopenFailed { position_id, .. } => position_id,
        }
    }

    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

#[derive(Clone)]
pub struct RollScheduler {
    book: SharedBook,
    oracle: Arc<dyn ScoringOracle>,
    clock: Arc<dyn Clock>,
    config: watch::Receiver<LadderConfig>,
}

impl RollScheduler {
    #[must_use]
    pub fn new(
        book: SharedBook,
        oracle: Arc<dyn ScoringOracle>,
        clock: Arc<dyn Clock>,
        config: watch::Receiver<LadderConfig>,
    ) -> Self {
        Self {
            book,
            oracle,
            clock,
            config,
        }
    }

    fn config(&self) -> LadderConfig {
        self.config.borrow().clone()
    }

    /// Scores every symbol with active positions and queues rolls for the
    /// positions whose triggers fire. Returns the number of requests queued
    /// or upgraded.
    pub async fn evaluate_triggers(&self) -> usize {
        let config = self.config();
        let now = self.clock.now();

        let positions: Vec<Position> = {
            let book = self.book.lock().await;
            book.ledger.active_positions().into_iter().cloned().collect()
        };
        if positions.is_empty() {
            return 0;
        }

        let timeout = StdDuration::from_millis(config.scheduler.oracle_timeout_ms);
        let mut scores: HashMap<String, TemporalScore> = HashMap::new();
        for position in &positions {
            if scores.contains_key(&position.symbol) {
                continue;
            }
            let context = MarketContext {
                price: Some(position.current_price),
                days_to_expiry: u32::try_from(position.days_to_expiry(now)).ok(),
                theta_estimate: Some(position.theta_estimate),
                timestamp: now,
            };
            let score =
                score_with_fallback(self.oracle.as_ref(), &position.symbol, &context, timeout).await;
            scores.insert(position.symbol.clone(), score);
        }

        let hits: Vec<_> = positions
            .iter()
            .filter_map(|p| {
                evaluate_position(p, scores.get(&p.symbol), &config.roll_triggers, now)
                    .map(|hit| (p, hit))
            })
            .collect();
        if hits.is_empty() {
            return 0;
        }

        let mut book = self.book.lock().await;
        let mut queued = 0;
        for (position, hit) in hits {
            // may have closed while the oracle was consulted
            if !book.ledger.get(&position.id).is_some_and(Position::is_active) {
                continue;
            }
            let target_band = book.registry.next_band(&position.symbol, position.assigned_band);
            let request = RollRequest::new(
                position.id.clone(),
                position.ladder_id.clone(),
                hit.reason,
                target_band,
                now,
            )
            .with_priority(hit.priority);
            match book.queue.enqueue(request) {
                EnqueueOutcome::Queued | EnqueueOutcome::Replaced => {
                    info!(
                        position_id = %position.id,
                        reason = %hit.reason,
                        priority = hit.priority,
                        from_band = position.assigned_band,
                        target_band,
                        "Roll queued"
                    );
                    queued += 1;
                }
                EnqueueOutcome::Kept => {}
            }
        }
        queued
    }

    /// Executes up to `max_rolls_per_cycle` queued rolls, one after another.
    pub async fn process_queue(&self) -> Vec<RollOutcome> {
        let config = self.config();
        let mut book = self.book.lock().await;
        let batch = book.queue.pop_batch(config.scheduler.max_rolls_per_cycle);
        if batch.is_empty() {
            return Vec::new();
        }
        debug!(count = batch.len(), remaining = book.queue.len(), "Processing roll queue");

        let mut outcomes = Vec::with_capacity(batch.len());
        for request in batch {
            let now = self.clock.now();
            outcomes.push(execute_roll(&mut book, request, &config, now));
        }
        outcomes
    }

    /// Queues an operator roll at the head of the queue with manual priority.
    ///
    /// # Errors
    ///
    /// Returns [`LadderError::InvalidRequest`] for a band outside the set and
    /// [`LadderError::NotFound`] if the position is not active in a ladder.
    pub async fn force_roll(
        &self,
        position_id: &str,
        target_band: Band,
        note: &str,
    ) -> LadderResult<EnqueueOutcome> {
        let now = self.clock.now();
        let mut book = self.book.lock().await;
        if !book.config().is_band(target_band) {
            return Err(LadderError::invalid(format!(
                "band {target_band} is not a configured prime band"
            )));
        }
        if !book.ledger.get(position_id).is_some_and(Position::is_active) {
            return Err(LadderError::not_found(position_id));
        }
        let ladder_id = book
            .registry
            .find_ladder_by_position(position_id)
            .map(|l| l.id.clone())
            .ok_or_else(|| LadderError::not_found(position_id))?;

        let mut request = RollRequest::new(
            position_id,
            Some(ladder_id),
            RollReason::Manual,
            target_band,
            now,
        );
        request.note = Some(note.to_string());
        let outcome = book.queue.push_front(request);
        info!(position_id, target_band, note, ?outcome, "Forced roll queued");
        Ok(outcome)
    }
}

/// Runs one roll against the book.
pub fn execute_roll(
    book: &mut LadderBook,
    request: RollRequest,
    config: &LadderConfig,
    now: DateTime<Utc>,
) -> RollOutcome {
    let position_id = request.position_id.clone();
    let Some(old) = book.ledger.get(&position_id).filter(|p| p.is_active()).cloned() else {
        debug!(position_id = %position_id, "Roll skipped, position no longer active");
        return RollOutcome::Skipped { position_id };
    };

    // Pick a band that can take the replacement before closing anything.
    let leaving_own_ladder = request.target_band == old.assigned_band && old.ladder_id.is_some();
    let target_band = if leaving_own_ladder
        || book.registry.has_capacity(&old.symbol, request.target_band)
    {
        request.target_band
    } else if let Some(band) =
        book.registry
            .least_concentrated_band(&old.symbol, Some(old.assigned_band), true)
    {
        info!(
            position_id = %position_id,
            requested = request.target_band,
            band,
            "Roll target full, using least-concentrated band"
        );
        band
    } else {
        let error = LadderError::ladder_full(
            &old.symbol,
            request.target_band,
            "no band can take the replacement",
        );
        warn!(position_id = %position_id, error_code = %error.code(), error = %error, "Roll dropped");
        book.metrics.dropped += 1;
        return RollOutcome::Dropped { position_id, error };
    };

    let replacement = replacement_request(&old, target_band, now);
    if let Err(e) = replacement.validate() {
        warn!(
            position_id = %position_id,
            target_band,
            error_code = %e.code(),
            error = %e,
            "Roll dropped, replacement terms invalid"
        );
        book.metrics.dropped += 1;
        return RollOutcome::Dropped {
            position_id,
            error: e,
        };
    }

    let close_reason = format!("roll_{}", request.reason);
    let closed = match book.ledger.close_position(&position_id, &close_reason, None) {
        Ok(closed) => closed,
        Err(e) => {
            let error = LadderError::RollCloseFailed {
                position_id: position_id.clone(),
                reason: e.to_string(),
            };
            book.metrics.failed_closes += 1;
            let attempts = request.attempts + 1;
            let requeued = attempts < config.scheduler.max_close_attempts;
            if requeued {
                let mut retry = request;
                retry.attempts = attempts;
                book.queue.enqueue(retry);
            }
            warn!(
                position_id = %position_id,
                error_code = %error.code(),
                error = %e,
                attempts,
                requeued,
                "Roll close failed"
            );
            return RollOutcome::CloseFailed {
                position_id,
                error,
                requeued,
            };
        }
    };
    let source_ladder = book.registry.remove_position(&position_id, now);
    book.queue.remove(&position_id);

    let new_position = match book.ledger.open_position(replacement) {
        Ok(position) => position,
        Err(e) => {
            let error = LadderError::RollReopenFailed {
                position_id: position_id.clone(),
                reason: e.to_string(),
            };
            book.metrics.reopen_failures += 1;
            error!(
                position_id = %position_id,
                error_code = %ErrorCode::RollReopenFailed,
                error = %e,
                "Position closed for roll but replacement could not be opened"
            );
            book.refresh_symbol(&old.symbol, now);
            return RollOutcome::ReopenFailed { position_id, error };
        }
    };

    match book.registry.place(&new_position, target_band, now) {
        Ok(assignment) => {
            if let Err(e) = book.ledger.attach_to_ladder(
                &new_position.id,
                &assignment.ladder_id,
                assignment.band,
            ) {
                warn!(position_id = %new_position.id, error = %e, "Could not record ladder on replacement");
            }
        }
        Err(e) => {
            warn!(
                position_id = %new_position.id,
                error_code = %e.code(),
                error = %e,
                "Replacement opened without a ladder"
            );
        }
    }

    if let Some(ladder_id) = &source_ladder {
        let record = RollRecord {
            timestamp: now,
            from_band: old.assigned_band,
            to_band: target_band,
            reason: request.reason.to_string(),
            old_position_id: old.id.clone(),
            new_position_id: new_position.id.clone(),
        };
        if let Err(e) = book.registry.record_roll(ladder_id, record) {
            debug!(ladder_id = %ladder_id, error = %e, "Roll history not recorded");
        }
    }
    book.refresh_symbol(&old.symbol, now);

    let old_notional = old.notional();
    let notional_drift = if old_notional > 0.0 {
        (new_position.notional() - old_notional).abs() / old_notional
    } else {
        0.0
    };
    if notional_drift > config.scheduler.notional_tolerance {
        warn!(
            position_id = %new_position.id,
            notional_drift,
            tolerance = config.scheduler.notional_tolerance,
            "Roll replacement notional outside tolerance"
        );
    }

    book.metrics.rolls_completed += 1;
    book.metrics.total_roll_pnl += closed.realized_pnl;
    *book
        .metrics
        .successful_rolls_by_band
        .entry(target_band)
        .or_insert(0) += 1;

    info!(
        old_position_id = %old.id,
        new_position_id = %new_position.id,
        reason = %request.reason,
        from_band = old.assigned_band,
        to_band = target_band,
        realized_pnl = closed.realized_pnl,
        "Roll completed"
    );

    RollOutcome::Completed {
        old_position_id: old.id,
        new_position_id: new_position.id,
        from_band: old.assigned_band,
        to_band: target_band,
        reason: request.reason,
        realized_pnl: closed.realized_pnl,
        notional_drift,
    }
}

/// Replacement terms: same notional at the current mark, with stop and
/// target distances scaled by `sqrt(target / current)` at the original
/// reward:risk ratio.
fn replacement_request(old: &Position, target_band: Band, now: DateTime<Utc>) -> OpenRequest {
    let scale = (f64::from(target_band) / f64::from(old.assigned_band.max(1))).sqrt();
    let scale = Decimal::from_f64(scale).unwrap_or(Decimal::ONE);

    let mark = old.current_price;
    let risk = old.risk_distance() * scale;
    let reward = old.reward_distance() * scale;
    let (stop_loss, take_profit) = if old.side.is_long() {
        (mark - risk, mark + reward)
    } else {
        (mark + risk, mark - reward)
    };

    let entry = mark.to_f64().unwrap_or(0.0);
    let old_entry = old.entry_price.to_f64().unwrap_or(0.0);
    let size = if entry > 0.0 {
        old.size * old_entry / entry
    } else {
        old.size
    };

    OpenRequest {
        symbol: old.symbol.clone(),
        side: old.side,
        entry_price: mark,
        stop_loss,
        take_profit,
        confidence: old.confidence,
        leverage: old.leverage,
        temporal: Some(TemporalContext {
            expiry: Some(now + Duration::days(i64::from(target_band))),
            days_to_expiry: Some(target_band),
            theta_estimate: None,
        }),
        score: None,
        size_override: Some(size),
        band_override: Some(target_band),
        rolled_from: Some(old.id.clone()),
    }
}
