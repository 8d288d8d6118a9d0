use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use prime_ladder_core::{
    compute_size, nearest_band, Band, Clock, ErrorCode, EventBus, IdSource, LadderConfig,
    LadderError, LadderResult, Position, PositionEvent, PositionStatus,
};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::request::{CloseOutcome, OpenRequest};
use crate::theta_budget::{BudgetReset, ThetaBudget, ThetaBudgetStatus};

/// Owner of every position record and of the daily theta budget.
///
/// All methods are synchronous; callers serialize access (the scheduler
/// holds the ledger behind a single mutex).
pub struct PositionLedger {
    config: LadderConfig,
    positions: HashMap<String, Position>,
    budget: ThetaBudget,
    ids: Arc<dyn IdSource>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl PositionLedger {
    #[must_use]
    pub fn new(
        config: LadderConfig,
        ids: Arc<dyn IdSource>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        let budget = ThetaBudget::new(config.daily_theta_budget);
        Self {
            config,
            positions: HashMap::new(),
            budget,
            ids,
            clock,
            events,
        }
    }

    #[must_use]
    pub fn config(&self) -> &LadderConfig {
        &self.config
    }

    /// Applies a reloaded configuration. Open positions keep their terms.
    pub fn update_config(&mut self, config: LadderConfig) {
        self.budget.set_daily_budget(config.daily_theta_budget);
        self.config = config;
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Opens a sized position and reserves its theta.
    ///
    /// Budget exhaustion never fails the open: the size is halved once and,
    /// if the halved reservation still does not fit, only what remains of the
    /// budget is reserved.
    ///
    /// # Errors
    ///
    /// Returns [`LadderError::InvalidRequest`] for malformed requests or
    /// [`LadderError::MaxPositionsExceeded`] at capacity. Nothing is recorded
    /// on error.
    pub fn open_position(&mut self, request: OpenRequest) -> LadderResult<Position> {
        request.validate()?;

        let active = self.active_count();
        if active >= self.config.max_positions {
            return Err(LadderError::MaxPositionsExceeded {
                active,
                max: self.config.max_positions,
            });
        }

        let now = self.clock.now();
        let temporal = request.temporal.clone().unwrap_or_default();
        let days_to_expiry = temporal
            .days_to_expiry
            .or_else(|| {
                temporal
                    .expiry
                    .and_then(|expiry| u32::try_from((expiry - now).num_days()).ok())
            })
            .unwrap_or(self.config.sizing.default_days_to_expiry);

        let band = match request.band_override {
            Some(band) if self.config.is_band(band) => band,
            Some(band) => {
                return Err(LadderError::invalid(format!(
                    "band {band} is not a configured prime band"
                )))
            }
            None => nearest_band(&self.config.prime_bands, days_to_expiry)
                .ok_or_else(|| LadderError::invalid("no prime bands configured"))?,
        };

        let expiry = temporal
            .expiry
            .unwrap_or_else(|| now + Duration::days(i64::from(days_to_expiry)));
        let theta_estimate = temporal
            .theta_estimate
            .unwrap_or_else(|| 1.0 / f64::from(days_to_expiry.max(1)));

        let edge = request.score.as_ref().map(|s| s.edge_temporal);
        let mut size = match request.size_override {
            Some(size) => size,
            None => {
                let breakdown = compute_size(
                    &self.config.sizing,
                    self.config.max_risk_per_position,
                    request.confidence,
                    edge,
                    band,
                );
                debug!(
                    symbol = %request.symbol,
                    kelly = breakdown.kelly,
                    edge_multiplier = breakdown.edge_multiplier,
                    band_multiplier = breakdown.band_multiplier,
                    size = breakdown.size,
                    "Position sized"
                );
                breakdown.size
            }
        };

        let theta_reserved = self.reserve_theta(&request.symbol, theta_estimate, &mut size);

        let position = Position {
            id: self.ids.next_id("pos"),
            symbol: request.symbol,
            side: request.side,
            entry_price: request.entry_price,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            current_price: request.entry_price,
            size,
            leverage: request.leverage,
            confidence: request.confidence,
            status: PositionStatus::Active,
            open_time: now,
            close_time: None,
            close_reason: None,
            realized_pnl: None,
            unrealized_pnl: 0.0,
            ladder_id: None,
            assigned_band: band,
            expiry,
            theta_estimate,
            theta_reserved,
            edge_at_open: edge,
            rolled_from: request.rolled_from,
        };

        info!(
            position_id = %position.id,
            symbol = %position.symbol,
            side = %position.side,
            size = position.size,
            band = position.assigned_band,
            theta_reserved = position.theta_reserved,
            "Position opened"
        );

        self.positions.insert(position.id.clone(), position.clone());
        self.events.publish(PositionEvent::PositionOpened(position.clone()));
        Ok(position)
    }

    fn reserve_theta(&mut self, symbol: &str, theta_estimate: f64, size: &mut f64) -> f64 {
        let needed = theta_estimate.abs() * *size;
        if self.budget.reserve(symbol, needed) {
            return needed;
        }

        warn!(
            symbol,
            error_code = %ErrorCode::BudgetExhausted,
            needed,
            available = self.budget.available(),
            "Theta budget exhausted, halving size"
        );
        *size /= 2.0;
        let halved = theta_estimate.abs() * *size;
        if self.budget.reserve(symbol, halved) {
            return halved;
        }

        let partial = halved.min(self.budget.available());
        if self.budget.reserve(symbol, partial) {
            partial
        } else {
            0.0
        }
    }

    /// Closes an active position and releases its theta reservation.
    ///
    /// Without a caller-supplied PnL the realized PnL is taken from the last mark.
    ///
    /// # Errors
    ///
    /// Returns [`LadderError::NotFound`] for unknown or already closed ids and
    /// [`LadderError::InvalidRequest`] for a non-finite PnL.
    pub fn close_position(
        &mut self,
        position_id: &str,
        reason: &str,
        realized_pnl: Option<f64>,
    ) -> LadderResult<CloseOutcome> {
        if let Some(pnl) = realized_pnl {
            if !pnl.is_finite() {
                return Err(LadderError::invalid("realized pnl is not finite"));
            }
        }

        let now = self.clock.now();
        let position = self
            .positions
            .get_mut(position_id)
            .filter(|p| p.is_active())
            .ok_or_else(|| LadderError::not_found(position_id))?;

        let pnl = realized_pnl.unwrap_or(position.unrealized_pnl);
        position.status = PositionStatus::Closed;
        position.close_time = Some(now);
        position.close_reason = Some(reason.to_string());
        position.realized_pnl = Some(pnl);
        position.unrealized_pnl = 0.0;

        self.budget.release(&position.symbol, position.theta_reserved);
        self.budget.cleanup_residues();

        info!(
            position_id,
            symbol = %position.symbol,
            reason,
            realized_pnl = pnl,
            released = position.theta_reserved,
            "Position closed"
        );

        let closed = position.clone();
        self.events.publish(PositionEvent::PositionClosed(closed.clone()));
        Ok(CloseOutcome {
            position: closed,
            realized_pnl: pnl,
        })
    }

    /// Marks every active position of `symbol` at `price`.
    ///
    /// Returns the number of positions updated.
    ///
    /// # Errors
    ///
    /// Returns [`LadderError::InvalidRequest`] for a non-positive price.
    pub fn mark_price(&mut self, symbol: &str, price: Decimal) -> LadderResult<usize> {
        if price <= Decimal::ZERO {
            return Err(LadderError::invalid(format!("price {price} must be positive")));
        }
        let mut updated = 0;
        for position in self
            .positions
            .values_mut()
            .filter(|p| p.is_active() && p.symbol == symbol)
        {
            position.apply_mark(price);
            self.events.publish(PositionEvent::PositionUpdated(position.clone()));
            updated += 1;
        }
        Ok(updated)
    }

    /// Records the ladder a position was placed in.
    ///
    /// # Errors
    ///
    /// Returns [`LadderError::NotFound`] if the position is unknown or closed.
    pub fn attach_to_ladder(
        &mut self,
        position_id: &str,
        ladder_id: &str,
        band: Band,
    ) -> LadderResult<()> {
        let position = self
            .positions
            .get_mut(position_id)
            .filter(|p| p.is_active())
            .ok_or_else(|| LadderError::not_found(position_id))?;
        position.ladder_id = Some(ladder_id.to_string());
        position.assigned_band = band;
        self.events.publish(PositionEvent::PositionUpdated(position.clone()));
        Ok(())
    }

    #[must_use]
    pub fn get(&self, position_id: &str) -> Option<&Position> {
        self.positions.get(position_id)
    }

    /// Active positions, oldest first.
    #[must_use]
    pub fn active_positions(&self) -> Vec<&Position> {
        let mut active: Vec<&Position> = self.positions.values().filter(|p| p.is_active()).collect();
        active.sort_by(|a, b| a.open_time.cmp(&b.open_time).then_with(|| a.id.cmp(&b.id)));
        active
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.positions.values().filter(|p| p.is_active()).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Drops closed records whose close time is before `older_than`.
    pub fn prune_closed(&mut self, older_than: DateTime<Utc>) -> usize {
        let before = self.positions.len();
        self.positions.retain(|_, p| {
            p.is_active() || p.close_time.map_or(true, |closed| closed >= older_than)
        });
        let pruned = before - self.positions.len();
        if pruned > 0 {
            debug!(pruned, "Pruned closed positions");
        }
        pruned
    }

    #[must_use]
    pub fn budget(&self) -> &ThetaBudget {
        &self.budget
    }

    #[must_use]
    pub fn budget_status(&self) -> ThetaBudgetStatus {
        self.budget.status()
    }

    /// Starts a fresh budget period.
    ///
    /// Reservations held by open positions are forgiven, so closing them
    /// later does not eat into the new period.
    pub fn reset_theta_budget(&mut self, reason: &str) -> BudgetReset {
        for position in self.positions.values_mut().filter(|p| p.is_active()) {
            position.theta_reserved = 0.0;
        }
        self.budget.reset(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::TemporalContext;
    use prime_ladder_core::{ManualClock, SequentialIdSource, Side, StaticOracle};
    use rust_decimal_macros::dec;

    fn ledger_with(config: LadderConfig) -> PositionLedger {
        PositionLedger::new(
            config,
            Arc::new(SequentialIdSource::new()),
            Arc::new(ManualClock::new(Utc::now())),
            EventBus::default(),
        )
    }

    fn ledger() -> PositionLedger {
        ledger_with(LadderConfig::default())
    }

    fn btc_request() -> OpenRequest {
        OpenRequest::new("BTCUSDT", Side::Buy, dec!(45000), dec!(44000), dec!(47000), 0.75)
            .with_days_to_expiry(11)
    }

    #[test]
    fn open_reserves_theta_for_mapped_band() {
        let mut ledger = ledger();
        let before = ledger.budget().used_budget();
        let position = ledger.open_position(btc_request()).unwrap();

        assert!(ledger.config().is_band(position.assigned_band));
        assert_eq!(position.assigned_band, 11);
        assert!(position.theta_reserved > 0.0);
        assert!(
            (ledger.budget().used_budget() - before - position.theta_reserved).abs() < 1e-12
        );
        // kelly 0.02 * band 11 multiplier 1.1
        assert!((position.size - 0.022).abs() < 1e-12);
        assert_eq!(position.status, PositionStatus::Active);
    }

    #[test]
    fn open_then_close_restores_budget() {
        let mut ledger = ledger();
        let before = ledger.budget().used_budget();
        let position = ledger.open_position(btc_request()).unwrap();
        ledger.close_position(&position.id, "manual", Some(0.01)).unwrap();
        assert!((ledger.budget().used_budget() - before).abs() < 1e-9);
    }

    #[test]
    fn edge_scales_size() {
        let mut ledger = ledger();
        let request = btc_request().with_score(StaticOracle::score(0.25, 0.8, 0.5));
        let position = ledger.open_position(request).unwrap();
        // 0.02 * (1 + 0.5) * 1.1
        assert!((position.size - 0.033).abs() < 1e-12);
        assert_eq!(position.edge_at_open, Some(0.25));
    }

    #[test]
    fn missing_days_default_to_thirty() {
        let mut ledger = ledger();
        let request =
            OpenRequest::new("ETHUSDT", Side::Buy, dec!(3000), dec!(2900), dec!(3200), 0.7);
        let position = ledger.open_position(request).unwrap();
        assert_eq!(position.assigned_band, 29);
        assert!((position.theta_estimate - 1.0 / 30.0).abs() < 1e-12);
    }

    #[test]
    fn invalid_request_has_no_side_effects() {
        let mut ledger = ledger();
        let mut request = btc_request();
        request.confidence = 1.5;
        let err = ledger.open_position(request).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        assert!(ledger.is_empty());
        assert_eq!(ledger.budget().used_budget(), 0.0);
    }

    #[test]
    fn unknown_band_override_is_rejected() {
        let mut ledger = ledger();
        let mut request = btc_request();
        request.band_override = Some(12);
        assert!(ledger.open_position(request).is_err());
    }

    #[test]
    fn max_positions_is_enforced() {
        let config = LadderConfig {
            max_positions: 2,
            ..LadderConfig::default()
        };
        let mut ledger = ledger_with(config);
        ledger.open_position(btc_request()).unwrap();
        ledger.open_position(btc_request()).unwrap();
        let err = ledger.open_position(btc_request()).unwrap_err();
        assert_eq!(err, LadderError::MaxPositionsExceeded { active: 2, max: 2 });
        assert_eq!(ledger.active_count(), 2);
    }

    #[test]
    fn exhausted_budget_halves_size_then_reserves_remainder() {
        let config = LadderConfig {
            daily_theta_budget: 0.003,
            ..LadderConfig::default()
        };
        let mut ledger = ledger_with(config);
        let theta = TemporalContext {
            theta_estimate: Some(0.1),
            ..TemporalContext::days(11)
        };

        // needs 0.0022, fits
        let first = ledger
            .open_position(btc_request().with_temporal(theta.clone()))
            .unwrap();
        assert!((first.size - 0.022).abs() < 1e-12);

        // needs 0.0022, halved needs 0.0011 > 0.0008 left, reserves the remainder
        let second = ledger
            .open_position(btc_request().with_temporal(theta.clone()))
            .unwrap();
        assert!((second.size - 0.011).abs() < 1e-12);
        assert!((second.theta_reserved - 0.0008).abs() < 1e-9);
        assert!(ledger.budget().used_budget() <= 0.003 + 1e-12);

        let third = ledger.open_position(btc_request().with_temporal(theta)).unwrap();
        assert!(third.theta_reserved.abs() < 1e-9);
        assert!(ledger.budget().is_consistent());
    }

    #[test]
    fn double_close_is_an_error() {
        let mut ledger = ledger();
        let position = ledger.open_position(btc_request()).unwrap();
        ledger.close_position(&position.id, "manual", None).unwrap();
        let used = ledger.budget().used_budget();
        let err = ledger.close_position(&position.id, "manual", None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert!((ledger.budget().used_budget() - used).abs() < 1e-12);
    }

    #[test]
    fn close_uses_last_mark_for_pnl() {
        let mut ledger = ledger();
        let position = ledger.open_position(btc_request()).unwrap();
        assert_eq!(ledger.mark_price("BTCUSDT", dec!(46350)).unwrap(), 1);
        let outcome = ledger.close_position(&position.id, "take_profit", None).unwrap();
        // +3% on a 0.022 size
        assert!((outcome.realized_pnl - 0.03 * 0.022).abs() < 1e-9);
        assert_eq!(outcome.position.close_reason.as_deref(), Some("take_profit"));
    }

    #[test]
    fn reset_reports_previous_used_and_forgives_reservations() {
        let mut ledger = ledger();
        let a = ledger.open_position(btc_request()).unwrap();
        ledger.open_position(btc_request()).unwrap();
        let used = ledger.budget().used_budget();

        let reset = ledger.reset_theta_budget("daily_reset");
        assert!((reset.previous_used - used).abs() < 1e-12);
        assert_eq!(ledger.budget().used_budget(), 0.0);

        let fresh = ledger.open_position(btc_request()).unwrap();
        ledger.close_position(&a.id, "manual", None).unwrap();
        assert!((ledger.budget().used_budget() - fresh.theta_reserved).abs() < 1e-12);
    }

    #[test]
    fn prune_keeps_active_and_recent() {
        let mut ledger = ledger();
        let a = ledger.open_position(btc_request()).unwrap();
        ledger.open_position(btc_request()).unwrap();
        ledger.close_position(&a.id, "manual", None).unwrap();

        let now = ledger.clock.now();
        assert_eq!(ledger.prune_closed(now - Duration::hours(1)), 0);
        assert_eq!(ledger.prune_closed(now + Duration::seconds(1)), 1);
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn lifecycle_events_are_published() {
        let mut ledger = ledger();
        let mut rx = ledger.events().subscribe();
        let position = ledger.open_position(btc_request()).unwrap();
        ledger.attach_to_ladder(&position.id, "ladder_1", 11).unwrap();
        ledger.close_position(&position.id, "manual", None).unwrap();

        let names: Vec<&str> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .iter()
        .map(PositionEvent::name)
        .collect();
        assert_eq!(names, ["position_opened", "position_updated", "position_closed"]);
    }
}
