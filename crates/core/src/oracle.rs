//! Scoring oracle contract.
//!
//! The scoring subsystem is external; the engine only consumes its
//! `evaluate` output. Calls are bounded by a timeout and any missing,
//! failed or malformed response is replaced by [`TemporalScore::fallback`].

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ErrorCode;

/// Market inputs passed to the oracle alongside the instrument.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketContext {
    pub price: Option<Decimal>,
    pub days_to_expiry: Option<u32>,
    pub theta_estimate: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl MarketContext {
    #[must_use]
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            price: None,
            days_to_expiry: None,
            theta_estimate: None,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub action: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemporalScore {
    pub edge_temporal: f64,
    /// In [0, 1].
    pub prime_coherence: f64,
    pub lambda_resonance: f64,
    /// In [0, 1].
    pub composite_score: f64,
    pub recommendation: Recommendation,
    /// Set when the values were substituted rather than returned by the oracle.
    #[serde(default)]
    pub is_fallback: bool,
}

impl TemporalScore {
    pub const FALLBACK_EDGE: f64 = 0.01;
    pub const FALLBACK_COHERENCE: f64 = 0.5;
    pub const FALLBACK_RESONANCE: f64 = 0.2;

    /// Documented substitute used when the oracle is unavailable.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            edge_temporal: Self::FALLBACK_EDGE,
            prime_coherence: Self::FALLBACK_COHERENCE,
            lambda_resonance: Self::FALLBACK_RESONANCE,
            composite_score: 0.5,
            recommendation: Recommendation {
                action: "HOLD".into(),
                confidence: 0.5,
            },
            is_fallback: true,
        }
    }

    #[must_use]
    pub fn resonance_grade(&self) -> ResonanceGrade {
        ResonanceGrade::grade(self.lambda_resonance)
    }

    fn is_well_formed(&self) -> bool {
        self.edge_temporal.is_finite()
            && self.prime_coherence.is_finite()
            && self.lambda_resonance.is_finite()
            && self.composite_score.is_finite()
    }

    fn normalized(mut self) -> Self {
        self.prime_coherence = self.prime_coherence.clamp(0.0, 1.0);
        self.composite_score = self.composite_score.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResonanceGrade {
    Strong,
    Moderate,
    Weak,
    Minimal,
}

impl ResonanceGrade {
    #[must_use]
    pub fn grade(resonance: f64) -> Self {
        let magnitude = resonance.abs();
        if magnitude >= 0.7 {
            Self::Strong
        } else if magnitude >= 0.4 {
            Self::Moderate
        } else if magnitude >= 0.2 {
            Self::Weak
        } else {
            Self::Minimal
        }
    }
}

#[async_trait]
pub trait ScoringOracle: Send + Sync {
    /// Scores an instrument; `Ok(None)` means no opinion.
    async fn evaluate(
        &self,
        instrument: &str,
        context: &MarketContext,
    ) -> Result<Option<TemporalScore>>;
}

/// Calls the oracle under a timeout, substituting the fallback score on
/// error, timeout, `None` or non-finite values.
pub async fn score_with_fallback(
    oracle: &dyn ScoringOracle,
    instrument: &str,
    context: &MarketContext,
    timeout: Duration,
) -> TemporalScore {
    let reason = match tokio::time::timeout(timeout, oracle.evaluate(instrument, context)).await {
        Ok(Ok(Some(score))) if score.is_well_formed() => return score.normalized(),
        Ok(Ok(Some(_))) => "non-finite score".to_string(),
        Ok(Ok(None)) => "no score returned".to_string(),
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("timed out after {}ms", timeout.as_millis()),
    };

    warn!(
        instrument,
        error_code = %ErrorCode::OracleUnavailable,
        reason = %reason,
        "Scoring oracle unavailable, using fallback score"
    );
    TemporalScore::fallback()
}

/// Test double returning configured scores.
#[derive(Debug, Default)]
pub struct StaticOracle {
    default: RwLock<Option<TemporalScore>>,
    overrides: RwLock<HashMap<String, TemporalScore>>,
    delay: Option<Duration>,
    fail: bool,
}

impl StaticOracle {
    #[must_use]
    pub fn new(score: TemporalScore) -> Self {
        Self {
            default: RwLock::new(Some(score)),
            ..Self::default()
        }
    }

    /// An oracle that always errors.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Sleeps before answering; used to exercise the timeout path.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// A healthy score with the given edge and coherence.
    #[must_use]
    pub fn score(edge: f64, coherence: f64, resonance: f64) -> TemporalScore {
        TemporalScore {
            edge_temporal: edge,
            prime_coherence: coherence,
            lambda_resonance: resonance,
            composite_score: coherence,
            recommendation: Recommendation {
                action: "BUY".into(),
                confidence: coherence,
            },
            is_fallback: false,
        }
    }

    pub fn set(&self, score: TemporalScore) {
        *self.default.write() = Some(score);
    }

    pub fn set_for(&self, instrument: &str, score: TemporalScore) {
        self.overrides.write().insert(instrument.to_string(), score);
    }
}

#[async_trait]
impl ScoringOracle for StaticOracle {
    async fn evaluate(
        &self,
        instrument: &str,
        _context: &MarketContext,
    ) -> Result<Option<TemporalScore>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            anyhow::bail!("static oracle configured to fail");
        }
        if let Some(score) = self.overrides.read().get(instrument) {
            return Ok(Some(score.clone()));
        }
        Ok(self.default.read().clone())
    }
}

/// Seeded random oracle for paper runs; replays identically for a seed.
#[derive(Debug)]
pub struct SimulatedOracle {
    rng: Mutex<StdRng>,
}

impl SimulatedOracle {
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

#[async_trait]
impl ScoringOracle for SimulatedOracle {
    async fn evaluate(
        &self,
        _instrument: &str,
        _context: &MarketContext,
    ) -> Result<Option<TemporalScore>> {
        let mut rng = self.rng.lock();
        let edge: f64 = rng.gen_range(-0.02..0.12);
        let coherence: f64 = rng.gen_range(0.3..0.95);
        let resonance: f64 = rng.gen_range(-1.0..1.0);
        let composite = (coherence * 0.6 + (edge + 0.02) * 2.0).clamp(0.0, 1.0);
        let action = if edge > 0.0 { "BUY" } else { "HOLD" };

        Ok(Some(TemporalScore {
            edge_temporal: edge,
            prime_coherence: coherence,
            lambda_resonance: resonance,
            composite_score: composite,
            recommendation: Recommendation {
                action: action.into(),
                confidence: composite,
            },
            is_fallback: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> MarketContext {
        MarketContext::at(Utc::now())
    }

    #[test]
    fn grades_resonance_magnitude() {
        assert_eq!(ResonanceGrade::grade(0.75), ResonanceGrade::Strong);
        assert_eq!(ResonanceGrade::grade(-0.5), ResonanceGrade::Moderate);
        assert_eq!(ResonanceGrade::grade(0.2), ResonanceGrade::Weak);
        assert_eq!(ResonanceGrade::grade(0.05), ResonanceGrade::Minimal);
    }

    #[test]
    fn fallback_is_flagged_and_documented() {
        let fallback = TemporalScore::fallback();
        assert!(fallback.is_fallback);
        assert!(fallback.edge_temporal > 0.0);
        assert!((fallback.prime_coherence - 0.5).abs() < f64::EPSILON);
        assert_ne!(fallback.resonance_grade(), ResonanceGrade::Minimal);
    }

    #[tokio::test]
    async fn healthy_oracle_passes_through() {
        let oracle = StaticOracle::new(StaticOracle::score(0.08, 0.7, 0.3));
        let score = score_with_fallback(&oracle, "BTCUSDT", &ctx(), Duration::from_millis(100)).await;
        assert!(!score.is_fallback);
        assert!((score.edge_temporal - 0.08).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn failing_oracle_falls_back() {
        let oracle = StaticOracle::failing();
        let score = score_with_fallback(&oracle, "BTCUSDT", &ctx(), Duration::from_millis(100)).await;
        assert!(score.is_fallback);
    }

    #[tokio::test]
    async fn silent_oracle_falls_back() {
        let oracle = StaticOracle::default();
        let score = score_with_fallback(&oracle, "BTCUSDT", &ctx(), Duration::from_millis(100)).await;
        assert!(score.is_fallback);
    }

    #[tokio::test]
    async fn slow_oracle_times_out() {
        let oracle = StaticOracle::new(StaticOracle::score(0.08, 0.7, 0.3))
            .with_delay(Duration::from_secs(10));
        let score = score_with_fallback(&oracle, "BTCUSDT", &ctx(), Duration::from_millis(50)).await;
        assert!(score.is_fallback);
    }

    #[tokio::test]
    async fn non_finite_scores_fall_back() {
        let oracle = StaticOracle::new(StaticOracle::score(f64::NAN, 0.7, 0.3));
        let score = score_with_fallback(&oracle, "BTCUSDT", &ctx(), Duration::from_millis(100)).await;
        assert!(score.is_fallback);
    }

    #[tokio::test]
    async fn coherence_is_clamped() {
        let oracle = StaticOracle::new(StaticOracle::score(0.05, 1.4, 0.3));
        let score = score_with_fallback(&oracle, "BTCUSDT", &ctx(), Duration::from_millis(100)).await;
        assert!((score.prime_coherence - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn per_instrument_override_wins() {
        let oracle = StaticOracle::new(StaticOracle::score(0.05, 0.7, 0.3));
        oracle.set_for("ETHUSDT", StaticOracle::score(-0.01, 0.7, 0.3));
        let eth = oracle.evaluate("ETHUSDT", &ctx()).await.unwrap().unwrap();
        let btc = oracle.evaluate("BTCUSDT", &ctx()).await.unwrap().unwrap();
        assert!(eth.edge_temporal < 0.0);
        assert!(btc.edge_temporal > 0.0);
    }

    #[tokio::test]
    async fn simulated_oracle_is_deterministic_per_seed() {
        let a = SimulatedOracle::seeded(7);
        let b = SimulatedOracle::seeded(7);
        for _ in 0..5 {
            let sa = a.evaluate("BTCUSDT", &ctx()).await.unwrap().unwrap();
            let sb = b.evaluate("BTCUSDT", &ctx()).await.unwrap().unwrap();
            assert_eq!(sa, sb);
            assert!((0.0..=1.0).contains(&sa.prime_coherence));
        }
    }
}
