use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::LadderError;
use crate::position::Band;

/// Full configuration surface of the ladder engine.
///
/// Every field carries a default so partial TOML files and env overrides
/// merge cleanly on top of the built-in values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LadderConfig {
    /// Ordered set of expiration bands, in days.
    pub prime_bands: Vec<Band>,
    /// Tier name -> symbols classified into that tier.
    pub tiers: BTreeMap<String, Vec<String>>,
    /// Tier used for symbols not listed in `tiers`.
    pub default_tier: String,
    pub tier_distribution: BTreeMap<String, TierBands>,
    pub ladder_limits: BTreeMap<String, LadderLimits>,
    pub roll_triggers: RollTriggerConfig,
    pub theta_smoothing: ThetaSmoothingConfig,
    /// Daily theta allowance as a fraction of capital (0.10 = 10%).
    pub daily_theta_budget: f64,
    pub max_positions: usize,
    /// Upper clamp for the Kelly fraction of a single position.
    pub max_risk_per_position: f64,
    pub sizing: SizingConfig,
    pub assignment: AssignmentConfig,
    pub scheduler: SchedulerConfig,
    /// Empty ladders idle longer than this are garbage-collected.
    pub ladder_idle_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct TierBands {
    pub primary: Vec<Band>,
    pub secondary: Vec<Band>,
}

impl TierBands {
    fn new(primary: &[Band], secondary: &[Band]) -> Self {
        Self {
            primary: primary.to_vec(),
            secondary: secondary.to_vec(),
        }
    }

    /// Primary and secondary bands merged, ascending, deduplicated.
    #[must_use]
    pub fn all(&self) -> Vec<Band> {
        let mut bands: Vec<Band> = self.primary.iter().chain(&self.secondary).copied().collect();
        bands.sort_unstable();
        bands.dedup();
        bands
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LadderLimits {
    pub max_ladders: usize,
    pub max_positions_per_ladder: usize,
}

impl Default for LadderLimits {
    fn default() -> Self {
        Self {
            max_ladders: 2,
            max_positions_per_ladder: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RollTriggerConfig {
    /// Roll when the oracle edge falls below this floor.
    pub edge_decay: f64,
    /// Roll when this many days (or fewer) remain to expiry.
    pub days_before_expiry: i64,
    /// Roll when the profit fraction reaches this level.
    pub profit_target: f64,
    /// Roll when the PnL fraction drops to this (negative) level.
    pub loss_threshold: f64,
    /// Ladder-level floor on unrealized PnL per unit of theta.
    pub theta_efficiency_min: f64,
}

impl Default for RollTriggerConfig {
    fn default() -> Self {
        Self {
            edge_decay: 0.02,
            days_before_expiry: 3,
            profit_target: 0.5,
            loss_threshold: -0.25,
            theta_efficiency_min: -1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThetaSmoothingConfig {
    /// Maximum share of a symbol's theta allowed in one band.
    pub max_theta_concentration: f64,
    pub rebalance_interval_secs: u64,
}

impl Default for ThetaSmoothingConfig {
    fn default() -> Self {
        Self {
            max_theta_concentration: 0.3,
            rebalance_interval_secs: 4 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BandMultiplier {
    pub band: Band,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SizingConfig {
    /// Lower clamp for the Kelly fraction.
    pub min_size: f64,
    /// Average winning return assumed by the Kelly formula.
    pub avg_win: f64,
    /// Average losing return assumed by the Kelly formula.
    pub avg_loss: f64,
    pub edge_multiplier_min: f64,
    pub edge_multiplier_max: f64,
    /// DTE assumed when a request carries none.
    pub default_days_to_expiry: u32,
    /// Per-band size multipliers; shorter bands size up, longer bands size down.
    pub band_multipliers: Vec<BandMultiplier>,
}

impl Default for SizingConfig {
    fn default() -> Self {
        let table = [
            (7, 1.20),
            (11, 1.10),
            (13, 1.00),
            (17, 0.95),
            (19, 0.90),
            (23, 0.85),
            (29, 0.80),
            (31, 0.75),
        ];
        Self {
            min_size: 0.001,
            avg_win: 0.02,
            avg_loss: 0.01,
            edge_multiplier_min: 0.5,
            edge_multiplier_max: 2.0,
            default_days_to_expiry: 30,
            band_multipliers: table
                .iter()
                .map(|&(band, multiplier)| BandMultiplier { band, multiplier })
                .collect(),
        }
    }
}

/// Quality gate and band-selection knobs for ladder assignment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AssignmentConfig {
    /// Positions below this prime coherence are never laddered.
    pub min_coherence: f64,
    /// At or above this coherence only primary bands are candidates.
    pub primary_coherence: f64,
    /// Resonance magnitude above which short bands are preferred.
    pub short_band_resonance: f64,
    /// Longest band considered "short" for the resonance bias.
    pub short_band_max: Band,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            min_coherence: 0.4,
            primary_coherence: 0.6,
            short_band_resonance: 0.5,
            short_band_max: 13,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub evaluation_interval_secs: u64,
    pub queue_interval_secs: u64,
    pub max_rolls_per_cycle: usize,
    pub oracle_timeout_ms: u64,
    /// A roll whose close keeps failing is dropped after this many attempts.
    pub max_close_attempts: u32,
    /// Allowed relative drift of notional across a roll before it is logged.
    pub notional_tolerance: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: 30,
            queue_interval_secs: 30,
            max_rolls_per_cycle: 3,
            oracle_timeout_ms: 2_000,
            max_close_attempts: 3,
            notional_tolerance: 0.05,
        }
    }
}

fn symbols(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

impl Default for LadderConfig {
    fn default() -> Self {
        let tiers = BTreeMap::from([
            ("TIER1".to_string(), symbols(&["BTCUSDT", "ETHUSDT"])),
            ("TIER2".to_string(), symbols(&["BNBUSDT", "SOLUSDT", "XRPUSDT"])),
            (
                "TIER3".to_string(),
                symbols(&["ADAUSDT", "DOGEUSDT", "AVAXUSDT", "DOTUSDT"]),
            ),
            ("TIER4".to_string(), symbols(&["LINKUSDT", "LTCUSDT", "MATICUSDT"])),
            ("TIER5".to_string(), symbols(&["ATOMUSDT", "NEARUSDT"])),
        ]);

        let tier_distribution = BTreeMap::from([
            ("TIER1".to_string(), TierBands::new(&[11, 13, 17], &[7, 19, 23])),
            ("TIER2".to_string(), TierBands::new(&[7, 11, 13], &[17, 19])),
            ("TIER3".to_string(), TierBands::new(&[7, 11], &[13, 17])),
            ("TIER4".to_string(), TierBands::new(&[7, 11], &[13])),
            ("TIER5".to_string(), TierBands::new(&[7], &[11, 13])),
            ("TIER6".to_string(), TierBands::new(&[7], &[11])),
        ]);

        let limit = |max_ladders, max_positions_per_ladder| LadderLimits {
            max_ladders,
            max_positions_per_ladder,
        };
        let ladder_limits = BTreeMap::from([
            ("TIER1".to_string(), limit(6, 3)),
            ("TIER2".to_string(), limit(5, 2)),
            ("TIER3".to_string(), limit(4, 2)),
            ("TIER4".to_string(), limit(3, 2)),
            ("TIER5".to_string(), limit(2, 1)),
            ("TIER6".to_string(), limit(2, 1)),
        ]);

        Self {
            prime_bands: vec![7, 11, 13, 17, 19, 23, 29, 31],
            tiers,
            default_tier: "TIER6".to_string(),
            tier_distribution,
            ladder_limits,
            roll_triggers: RollTriggerConfig::default(),
            theta_smoothing: ThetaSmoothingConfig::default(),
            daily_theta_budget: 0.10,
            max_positions: 50,
            max_risk_per_position: 0.02,
            sizing: SizingConfig::default(),
            assignment: AssignmentConfig::default(),
            scheduler: SchedulerConfig::default(),
            ladder_idle_grace_secs: 15 * 60,
        }
    }
}

impl LadderConfig {
    /// Tier a symbol is classified into, falling back to `default_tier`.
    #[must_use]
    pub fn tier_for(&self, symbol: &str) -> &str {
        self.tiers
            .iter()
            .find(|(_, members)| members.iter().any(|s| s == symbol))
            .map_or(self.default_tier.as_str(), |(tier, _)| tier.as_str())
    }

    /// Bands of a tier; the full band set when the tier has no distribution.
    #[must_use]
    pub fn tier_bands(&self, tier: &str) -> TierBands {
        self.tier_distribution.get(tier).cloned().unwrap_or_else(|| TierBands {
            primary: self.prime_bands.clone(),
            secondary: Vec::new(),
        })
    }

    #[must_use]
    pub fn limits_for(&self, tier: &str) -> LadderLimits {
        self.ladder_limits.get(tier).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn is_band(&self, band: Band) -> bool {
        self.prime_bands.contains(&band)
    }

    /// Rejects configurations the engine cannot operate on.
    ///
    /// # Errors
    /// Returns `LadderError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<(), LadderError> {
        if self.prime_bands.is_empty() {
            return Err(LadderError::Config("prime_bands must not be empty".into()));
        }
        if self.prime_bands.iter().any(|&b| b == 0) {
            return Err(LadderError::Config("prime_bands must be positive".into()));
        }
        for (tier, bands) in &self.tier_distribution {
            if bands.primary.is_empty() {
                return Err(LadderError::Config(format!(
                    "tier {tier} has no primary bands"
                )));
            }
            if let Some(band) = bands.all().into_iter().find(|b| !self.is_band(*b)) {
                return Err(LadderError::Config(format!(
                    "tier {tier} references band {band} outside prime_bands"
                )));
            }
        }
        for (tier, limits) in &self.ladder_limits {
            if limits.max_ladders == 0 || limits.max_positions_per_ladder == 0 {
                return Err(LadderError::Config(format!(
                    "tier {tier} ladder limits must be non-zero"
                )));
            }
        }
        if !(self.daily_theta_budget > 0.0 && self.daily_theta_budget <= 1.0) {
            return Err(LadderError::Config(format!(
                "daily_theta_budget {} must be in (0, 1]",
                self.daily_theta_budget
            )));
        }
        if self.max_positions == 0 {
            return Err(LadderError::Config("max_positions must be non-zero".into()));
        }
        if !(self.max_risk_per_position > 0.0 && self.max_risk_per_position <= 1.0) {
            return Err(LadderError::Config(
                "max_risk_per_position must be in (0, 1]".into(),
            ));
        }
        if !(self.sizing.min_size > 0.0 && self.sizing.min_size <= self.max_risk_per_position) {
            return Err(LadderError::Config(
                "sizing.min_size must be positive and not exceed max_risk_per_position".into(),
            ));
        }
        if !(self.sizing.avg_win > 0.0 && self.sizing.avg_win.is_finite())
            || !(self.sizing.avg_loss >= 0.0 && self.sizing.avg_loss.is_finite())
        {
            return Err(LadderError::Config(
                "sizing.avg_win must be positive and avg_loss non-negative".into(),
            ));
        }
        let (edge_min, edge_max) = (self.sizing.edge_multiplier_min, self.sizing.edge_multiplier_max);
        if !(edge_min.is_finite() && edge_max.is_finite() && edge_min > 0.0 && edge_min <= edge_max)
        {
            return Err(LadderError::Config(format!(
                "sizing.edge_multiplier_min {edge_min} and edge_multiplier_max {edge_max} must be positive with min <= max"
            )));
        }
        if let Some(entry) = self
            .sizing
            .band_multipliers
            .iter()
            .find(|entry| !(entry.multiplier.is_finite() && entry.multiplier > 0.0))
        {
            return Err(LadderError::Config(format!(
                "sizing.band_multipliers for band {} must be finite and positive",
                entry.band
            )));
        }
        if self.roll_triggers.loss_threshold >= 0.0 {
            return Err(LadderError::Config(
                "roll_triggers.loss_threshold must be negative".into(),
            ));
        }
        if !(self.theta_smoothing.max_theta_concentration > 0.0
            && self.theta_smoothing.max_theta_concentration <= 1.0)
        {
            return Err(LadderError::Config(
                "theta_smoothing.max_theta_concentration must be in (0, 1]".into(),
            ));
        }
        if self.scheduler.max_rolls_per_cycle == 0 {
            return Err(LadderError::Config(
                "scheduler.max_rolls_per_cycle must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(LadderConfig::default().validate().is_ok());
    }

    #[test]
    fn classifies_symbols_by_tier_lists() {
        let config = LadderConfig::default();
        assert_eq!(config.tier_for("BTCUSDT"), "TIER1");
        assert_eq!(config.tier_for("SOLUSDT"), "TIER2");
        assert_eq!(config.tier_for("UNKNOWNUSDT"), "TIER6");
    }

    #[test]
    fn tier_bands_merge_sorted() {
        let config = LadderConfig::default();
        assert_eq!(config.tier_bands("TIER1").all(), vec![7, 11, 13, 17, 19, 23]);
        assert_eq!(config.limits_for("TIER1").max_positions_per_ladder, 3);
    }

    #[test]
    fn rejects_tier_band_outside_band_set() {
        let mut config = LadderConfig::default();
        config
            .tier_distribution
            .insert("TIER1".into(), TierBands::new(&[12], &[]));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("band 12"));
    }

    #[test]
    fn rejects_inverted_edge_multiplier_bounds() {
        let mut config = LadderConfig::default();
        config.sizing.edge_multiplier_min = 2.0;
        config.sizing.edge_multiplier_max = 0.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("edge_multiplier_min"));
    }

    #[test]
    fn rejects_non_positive_band_multiplier() {
        let mut config = LadderConfig::default();
        for entry in &mut config.sizing.band_multipliers {
            entry.multiplier = -1.0;
        }
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("band_multipliers"));

        let mut config = LadderConfig::default();
        config.sizing.band_multipliers[0].multiplier = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_nan_min_size() {
        let mut config = LadderConfig::default();
        config.sizing.min_size = f64::NAN;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_size"));
    }

    #[test]
    fn rejects_positive_loss_threshold() {
        let mut config = LadderConfig::default();
        config.roll_triggers.loss_threshold = 0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: LadderConfig =
            serde_json::from_str(r#"{"daily_theta_budget": 0.05, "max_positions": 10}"#).unwrap();
        assert!((config.daily_theta_budget - 0.05).abs() < f64::EPSILON);
        assert_eq!(config.max_positions, 10);
        assert_eq!(config.prime_bands, LadderConfig::default().prime_bands);
    }
}
