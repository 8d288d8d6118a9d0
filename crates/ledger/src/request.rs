use chrono::{DateTime, Utc};
use prime_ladder_core::{Band, LadderError, LadderResult, Position, Side, TemporalScore};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Optional time inputs of an open request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemporalContext {
    pub expiry: Option<DateTime<Utc>>,
    pub days_to_expiry: Option<u32>,
    /// Daily decay per unit of size; defaults to `1 / days_to_expiry`.
    pub theta_estimate: Option<f64>,
}

impl TemporalContext {
    #[must_use]
    pub fn days(days_to_expiry: u32) -> Self {
        Self {
            days_to_expiry: Some(days_to_expiry),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    /// Win probability in (0, 1].
    pub confidence: f64,
    pub leverage: u32,
    pub temporal: Option<TemporalContext>,
    /// Oracle score; its edge scales the size.
    pub score: Option<TemporalScore>,
    /// Skips Kelly sizing (used when rolling to preserve notional).
    pub size_override: Option<f64>,
    /// Pins the band instead of mapping days-to-expiry.
    pub band_override: Option<Band>,
    pub rolled_from: Option<String>,
}

impl OpenRequest {
    #[must_use]
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        entry_price: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
        confidence: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            entry_price,
            stop_loss,
            take_profit,
            confidence,
            leverage: 1,
            temporal: None,
            score: None,
            size_override: None,
            band_override: None,
            rolled_from: None,
        }
    }

    #[must_use]
    pub fn with_temporal(mut self, temporal: TemporalContext) -> Self {
        self.temporal = Some(temporal);
        self
    }

    #[must_use]
    pub fn with_days_to_expiry(self, days: u32) -> Self {
        self.with_temporal(TemporalContext::days(days))
    }

    #[must_use]
    pub fn with_score(mut self, score: TemporalScore) -> Self {
        self.score = Some(score);
        self
    }

    #[must_use]
    pub const fn with_leverage(mut self, leverage: u32) -> Self {
        self.leverage = leverage;
        self
    }

    /// Checks the request before any state is touched.
    ///
    /// # Errors
    ///
    /// Returns [`LadderError::InvalidRequest`] describing the first malformed field.
    pub fn validate(&self) -> LadderResult<()> {
        if self.symbol.trim().is_empty() {
            return Err(LadderError::invalid("symbol is empty"));
        }
        if !(self.confidence.is_finite() && self.confidence > 0.0 && self.confidence <= 1.0) {
            return Err(LadderError::invalid(format!(
                "confidence {} outside (0, 1]",
                self.confidence
            )));
        }
        if self.entry_price <= Decimal::ZERO
            || self.stop_loss <= Decimal::ZERO
            || self.take_profit <= Decimal::ZERO
        {
            return Err(LadderError::invalid("prices must be positive"));
        }
        let (stop_ok, target_ok) = match self.side {
            Side::Buy => (
                self.stop_loss < self.entry_price,
                self.take_profit > self.entry_price,
            ),
            Side::Sell => (
                self.stop_loss > self.entry_price,
                self.take_profit < self.entry_price,
            ),
        };
        if !stop_ok || !target_ok {
            return Err(LadderError::invalid(format!(
                "stop {} / target {} on the wrong side of entry {} for {}",
                self.stop_loss, self.take_profit, self.entry_price, self.side
            )));
        }
        if self.leverage == 0 {
            return Err(LadderError::invalid("leverage must be at least 1"));
        }
        if let Some(size) = self.size_override {
            if !(size.is_finite() && size > 0.0) {
                return Err(LadderError::invalid(format!("size {size} must be positive")));
            }
        }
        if let Some(temporal) = &self.temporal {
            if let Some(theta) = temporal.theta_estimate {
                if !theta.is_finite() {
                    return Err(LadderError::invalid("theta estimate is not finite"));
                }
            }
        }
        if let Some(score) = &self.score {
            if !score.edge_temporal.is_finite() {
                return Err(LadderError::invalid("score edge is not finite"));
            }
        }
        Ok(())
    }
}

/// A closed position and the PnL booked for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseOutcome {
    pub position: Position,
    pub realized_pnl: f64,
}
