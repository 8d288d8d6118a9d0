use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Expiration band, in days.
pub type Band = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for long exposure, -1 for short.
    #[must_use]
    pub const fn sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    #[must_use]
    pub const fn is_long(self) -> bool {
        matches!(self, Self::Buy)
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Active,
    Closed,
}

/// A time-bounded position owned by the ledger.
///
/// After creation only the mark, ladder attachment and close fields change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    /// Latest mark; equals `entry_price` until the first mark arrives.
    pub current_price: Decimal,
    /// Fraction of capital.
    pub size: f64,
    pub leverage: u32,
    pub confidence: f64,
    pub status: PositionStatus,
    pub open_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
    pub realized_pnl: Option<f64>,
    pub unrealized_pnl: f64,
    pub ladder_id: Option<String>,
    pub assigned_band: Band,
    pub expiry: DateTime<Utc>,
    /// Estimated daily time decay per unit of size.
    pub theta_estimate: f64,
    /// Amount of the daily theta budget held by this position.
    pub theta_reserved: f64,
    pub edge_at_open: Option<f64>,
    pub rolled_from: Option<String>,
}

impl Position {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == PositionStatus::Active
    }

    /// `size * entry_price`.
    #[must_use]
    pub fn notional(&self) -> f64 {
        self.size * self.entry_price.to_f64().unwrap_or(0.0)
    }

    /// Leveraged return of the position at its current mark.
    #[must_use]
    pub fn pnl_fraction(&self) -> f64 {
        self.pnl_fraction_at(self.current_price)
    }

    #[must_use]
    pub fn pnl_fraction_at(&self, price: Decimal) -> f64 {
        if self.entry_price.is_zero() {
            return 0.0;
        }
        let change = ((price - self.entry_price) / self.entry_price)
            .to_f64()
            .unwrap_or(0.0);
        self.side.sign() * change * f64::from(self.leverage.max(1))
    }

    /// Whole days until expiry; negative once expired.
    #[must_use]
    pub fn days_to_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.expiry - now).num_days()
    }

    /// Daily theta attributed to this position.
    #[must_use]
    pub fn theta_exposure(&self) -> f64 {
        self.theta_estimate.abs() * self.size
    }

    /// Distance between entry and stop.
    #[must_use]
    pub fn risk_distance(&self) -> Decimal {
        (self.entry_price - self.stop_loss).abs()
    }

    #[must_use]
    pub fn reward_distance(&self) -> Decimal {
        (self.take_profit - self.entry_price).abs()
    }

    /// Updates the mark and the unrealized PnL (in capital units).
    pub fn apply_mark(&mut self, price: Decimal) {
        self.current_price = price;
        self.unrealized_pnl = self.pnl_fraction_at(price) * self.size;
    }
}
