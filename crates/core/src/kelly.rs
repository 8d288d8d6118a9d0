//! Kelly fraction for position sizing.
//!
//! Uses the payoff form of the Kelly criterion where the win probability is
//! the signal confidence and the payoffs are the average win and loss returns:
//!
//! ```text
//! kelly = (p * avg_win - (1 - p) * avg_loss) / avg_win
//! ```
//!
//! The raw fraction is clamped to `[min_size, max_size]`, so a negative edge
//! still produces the minimum size rather than no position at all.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KellySizer {
    /// Average winning return (0.02 = 2%)
    pub avg_win: f64,
    /// Average losing return, as a positive number
    pub avg_loss: f64,
    /// Lower clamp on the sized fraction
    pub min_size: f64,
    /// Upper clamp on the sized fraction (max risk per position)
    pub max_size: f64,
}

impl Default for KellySizer {
    fn default() -> Self {
        Self {
            avg_win: 0.02,
            avg_loss: 0.01,
            min_size: 0.001,
            max_size: 0.02,
        }
    }
}

impl KellySizer {
    #[must_use]
    pub const fn new(avg_win: f64, avg_loss: f64, min_size: f64, max_size: f64) -> Self {
        Self {
            avg_win,
            avg_loss,
            min_size,
            max_size,
        }
    }

    /// Unclamped Kelly fraction for a win probability.
    ///
    /// Returns 0 when `avg_win` is not positive.
    #[must_use]
    pub fn raw_fraction(&self, win_prob: f64) -> f64 {
        if self.avg_win <= 0.0 {
            return 0.0;
        }
        let loss_prob = 1.0 - win_prob;
        (win_prob * self.avg_win - loss_prob * self.avg_loss) / self.avg_win
    }

    /// Kelly fraction clamped to `[min_size, max_size]`.
    ///
    /// # Examples
    /// ```
    /// use prime_ladder_core::kelly::KellySizer;
    ///
    /// let sizer = KellySizer::default();
    /// // 75% confidence with 2:1 payoff is far above the 2% risk cap
    /// assert!((sizer.fraction(0.75) - 0.02).abs() < 1e-12);
    /// ```
    #[must_use]
    pub fn fraction(&self, win_prob: f64) -> f64 {
        self.raw_fraction(win_prob).clamp(self.min_size, self.max_size)
    }

    /// Expected return per unit staked.
    #[must_use]
    pub fn expected_value(&self, win_prob: f64) -> f64 {
        win_prob * self.avg_win - (1.0 - win_prob) * self.avg_loss
    }
}
