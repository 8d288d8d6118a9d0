//! Error taxonomy for the ladder engine.
//!
//! Every failure carries a stable [`ErrorCode`] so callers and log
//! pipelines can branch on the code instead of the message text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::position::Band;

pub type LadderResult<T> = Result<T, LadderError>;

/// Stable error codes surfaced to callers and operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    MaxPositionsExceeded,
    LadderFull,
    BudgetExhausted,
    NotFound,
    RollCloseFailed,
    RollReopenFailed,
    OracleUnavailable,
    ConfigInvalid,
}

impl ErrorCode {
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::MaxPositionsExceeded => "MAX_POSITIONS_EXCEEDED",
            Self::LadderFull => "LADDER_FULL",
            Self::BudgetExhausted => "BUDGET_EXHAUSTED",
            Self::NotFound => "NOT_FOUND",
            Self::RollCloseFailed => "ROLL_CLOSE_FAILED",
            Self::RollReopenFailed => "ROLL_REOPEN_FAILED",
            Self::OracleUnavailable => "ORACLE_UNAVAILABLE",
            Self::ConfigInvalid => "CONFIG_INVALID",
        }
    }

    /// Capacity and close failures may succeed on a later cycle.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::MaxPositionsExceeded | Self::LadderFull | Self::RollCloseFailed
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum LadderError {
    /// Malformed sizing inputs; nothing was changed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("max positions exceeded: {active} active, limit {max}")]
    MaxPositionsExceeded { active: usize, max: usize },

    #[error("ladder full: {symbol} band {band}d ({reason})")]
    LadderFull {
        symbol: String,
        band: Band,
        reason: String,
    },

    #[error("theta budget exhausted: requested {requested:.5}, available {available:.5}")]
    BudgetExhausted { requested: f64, available: f64 },

    #[error("position not found: {position_id}")]
    NotFound { position_id: String },

    #[error("roll close failed for {position_id}: {reason}")]
    RollCloseFailed { position_id: String, reason: String },

    /// The old position is CLOSED and no replacement exists.
    #[error("roll reopen failed for {position_id} (position closed without replacement): {reason}")]
    RollReopenFailed { position_id: String, reason: String },

    #[error("scoring oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl LadderError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::MaxPositionsExceeded { .. } => ErrorCode::MaxPositionsExceeded,
            Self::LadderFull { .. } => ErrorCode::LadderFull,
            Self::BudgetExhausted { .. } => ErrorCode::BudgetExhausted,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::RollCloseFailed { .. } => ErrorCode::RollCloseFailed,
            Self::RollReopenFailed { .. } => ErrorCode::RollReopenFailed,
            Self::OracleUnavailable(_) => ErrorCode::OracleUnavailable,
            Self::Config(_) => ErrorCode::ConfigInvalid,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn not_found(position_id: impl Into<String>) -> Self {
        Self::NotFound {
            position_id: position_id.into(),
        }
    }

    pub fn ladder_full(symbol: impl Into<String>, band: Band, reason: impl Into<String>) -> Self {
        Self::LadderFull {
            symbol: symbol.into(),
            band,
            reason: reason.into(),
        }
    }
}
