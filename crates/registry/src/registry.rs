use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use prime_ladder_core::{
    Band, IdSource, LadderConfig, LadderError, LadderResult, Position, ResonanceGrade,
    TemporalScore,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ladder::{Ladder, RollRecord};

/// Where a position was placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub ladder_id: String,
    pub band: Band,
    /// The ladder was created for this position.
    pub created: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolSummary {
    pub tier: String,
    pub ladders: usize,
    pub positions: usize,
    pub total_theta: f64,
    pub total_value: f64,
    pub avg_theta_efficiency: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub total_ladders: usize,
    pub total_positions: usize,
    pub symbols: BTreeMap<String, SymbolSummary>,
}

/// Groups positions into per-symbol, per-band ladders.
///
/// Positions are referenced by id only; metrics are recomputed from
/// positions supplied by the caller through a lookup closure.
pub struct LadderRegistry {
    config: LadderConfig,
    ladders: BTreeMap<String, Ladder>,
    by_band: HashMap<(String, Band), String>,
    membership: HashMap<String, String>,
    ids: Arc<dyn IdSource>,
}

impl LadderRegistry {
    #[must_use]
    pub fn new(config: LadderConfig, ids: Arc<dyn IdSource>) -> Self {
        Self {
            config,
            ladders: BTreeMap::new(),
            by_band: HashMap::new(),
            membership: HashMap::new(),
            ids,
        }
    }

    pub fn update_config(&mut self, config: LadderConfig) {
        self.config = config;
    }

    /// Quality gate for automatic assignment.
    #[must_use]
    pub fn passes_gate(&self, score: &TemporalScore) -> bool {
        score.prime_coherence > self.config.assignment.min_coherence
            && score.edge_temporal > 0.0
            && score.resonance_grade() != ResonanceGrade::Minimal
    }

    /// Bands a new position of `symbol` may be placed in, ascending.
    ///
    /// High coherence restricts the choice to the tier's primary bands and
    /// strong resonance to the short end of the remaining set.
    #[must_use]
    pub fn candidate_bands(&self, symbol: &str, score: &TemporalScore) -> Vec<Band> {
        let assignment = &self.config.assignment;
        let tier_bands = self.config.tier_bands(self.config.tier_for(symbol));
        let mut candidates = if score.prime_coherence >= assignment.primary_coherence {
            let mut primary = tier_bands.primary.clone();
            primary.sort_unstable();
            primary.dedup();
            primary
        } else {
            tier_bands.all()
        };

        if score.lambda_resonance.abs() >= assignment.short_band_resonance {
            let short: Vec<Band> = candidates
                .iter()
                .copied()
                .filter(|&b| b <= assignment.short_band_max)
                .collect();
            if !short.is_empty() {
                candidates = short;
            }
        }
        candidates
    }

    /// Places an active position in the least-concentrated allowed band.
    ///
    /// Returns `Ok(None)` when the score does not pass the quality gate.
    ///
    /// # Errors
    ///
    /// Returns [`LadderError::LadderFull`] if the chosen ladder is full or the
    /// symbol is at its tier's ladder cap, and [`LadderError::InvalidRequest`]
    /// if the position is closed or already in a ladder.
    pub fn assign_to_ladder(
        &mut self,
        position: &Position,
        score: &TemporalScore,
        now: DateTime<Utc>,
    ) -> LadderResult<Option<Assignment>> {
        if !self.passes_gate(score) {
            debug!(
                position_id = %position.id,
                coherence = score.prime_coherence,
                edge = score.edge_temporal,
                "Position below ladder quality gate"
            );
            return Ok(None);
        }

        let band = self
            .candidate_bands(&position.symbol, score)
            .into_iter()
            .min_by(|&a, &b| {
                self.concentration(&position.symbol, a)
                    .total_cmp(&self.concentration(&position.symbol, b))
                    .then(a.cmp(&b))
            })
            .ok_or_else(|| {
                LadderError::invalid(format!("no bands configured for {}", position.symbol))
            })?;

        self.place(position, band, now).map(Some)
    }

    /// Places an active position in a specific band, creating the ladder on
    /// first use.
    ///
    /// # Errors
    ///
    /// Same as [`Self::assign_to_ladder`], plus [`LadderError::InvalidRequest`]
    /// for a band outside the configured set.
    pub fn place(
        &mut self,
        position: &Position,
        band: Band,
        now: DateTime<Utc>,
    ) -> LadderResult<Assignment> {
        if !position.is_active() {
            return Err(LadderError::invalid(format!(
                "position {} is closed",
                position.id
            )));
        }
        if let Some(ladder_id) = self.membership.get(&position.id) {
            return Err(LadderError::invalid(format!(
                "position {} already in ladder {ladder_id}",
                position.id
            )));
        }
        if !self.config.is_band(band) {
            return Err(LadderError::invalid(format!(
                "band {band} is not a configured prime band"
            )));
        }

        let symbol = position.symbol.as_str();
        let tier = self.config.tier_for(symbol).to_string();
        let limits = self.config.limits_for(&tier);

        let (ladder_id, created) = match self.by_band.get(&(symbol.to_string(), band)) {
            Some(id) => {
                let full = self
                    .ladders
                    .get(id)
                    .is_some_and(|l| l.len() >= limits.max_positions_per_ladder);
                if full {
                    warn!(symbol, band, ladder_id = %id, "Ladder full, assignment rejected");
                    return Err(LadderError::ladder_full(
                        symbol,
                        band,
                        format!("ladder holds {} positions", limits.max_positions_per_ladder),
                    ));
                }
                (id.clone(), false)
            }
            None => {
                if self.ladder_count(symbol) >= limits.max_ladders {
                    warn!(symbol, band, tier = %tier, "Tier ladder cap reached, assignment rejected");
                    return Err(LadderError::ladder_full(
                        symbol,
                        band,
                        format!("{tier} allows {} ladders", limits.max_ladders),
                    ));
                }
                let id = self.ids.next_id("ladder");
                self.ladders
                    .insert(id.clone(), Ladder::new(id.clone(), symbol, band, &tier, now));
                self.by_band.insert((symbol.to_string(), band), id.clone());
                info!(ladder_id = %id, symbol, band, tier = %tier, "Ladder created");
                (id, true)
            }
        };

        if let Some(ladder) = self.ladders.get_mut(&ladder_id) {
            ladder.push(position, now);
        }
        self.membership.insert(position.id.clone(), ladder_id.clone());

        info!(
            position_id = %position.id,
            ladder_id = %ladder_id,
            symbol,
            band,
            "Position assigned to ladder"
        );
        Ok(Assignment {
            ladder_id,
            band,
            created,
        })
    }

    /// Whether a position of `symbol` could be placed in `band` right now.
    #[must_use]
    pub fn has_capacity(&self, symbol: &str, band: Band) -> bool {
        let limits = self.config.limits_for(self.config.tier_for(symbol));
        match self.ladder_at(symbol, band) {
            Some(ladder) => ladder.len() < limits.max_positions_per_ladder,
            None => self.ladder_count(symbol) < limits.max_ladders,
        }
    }

    /// Removes a position from its ladder; returns the ladder id.
    pub fn remove_position(&mut self, position_id: &str, now: DateTime<Utc>) -> Option<String> {
        let ladder_id = self.membership.remove(position_id)?;
        if let Some(ladder) = self.ladders.get_mut(&ladder_id) {
            if ladder.remove(position_id, now) {
                debug!(position_id, ladder_id = %ladder_id, "Position removed from ladder");
            }
        }
        Some(ladder_id)
    }

    /// Recomputes one ladder's metrics and prunes members that are no longer
    /// live. Returns the pruned position ids.
    pub fn update_ladder_metrics<'a, F>(
        &mut self,
        ladder_id: &str,
        lookup: F,
        now: DateTime<Utc>,
    ) -> Vec<String>
    where
        F: Fn(&str) -> Option<&'a Position>,
    {
        let Some(ladder) = self.ladders.get_mut(ladder_id) else {
            return Vec::new();
        };
        let stale = ladder.refresh(lookup, now);
        for position_id in &stale {
            self.membership.remove(position_id);
            debug!(position_id = %position_id, ladder_id, "Pruned stale ladder member");
        }
        stale
    }

    /// Refreshes every ladder.
    pub fn refresh_all<'a, F>(&mut self, lookup: F, now: DateTime<Utc>) -> usize
    where
        F: Fn(&str) -> Option<&'a Position>,
    {
        let ids: Vec<String> = self.ladders.keys().cloned().collect();
        ids.iter()
            .map(|id| self.update_ladder_metrics(id, &lookup, now).len())
            .sum()
    }

    /// Share of the symbol's theta held by the ladder at `band`.
    #[must_use]
    pub fn concentration(&self, symbol: &str, band: Band) -> f64 {
        let total = self.symbol_theta(symbol);
        if total <= 0.0 {
            return 0.0;
        }
        self.ladder_at(symbol, band)
            .map_or(0.0, |l| l.metrics.total_theta / total)
    }

    /// Band -> share of theta for every ladder of `symbol`.
    #[must_use]
    pub fn theta_distribution(&self, symbol: &str) -> BTreeMap<Band, f64> {
        let total = self.symbol_theta(symbol);
        self.ladders_for(symbol)
            .map(|l| {
                let share = if total > 0.0 {
                    l.metrics.total_theta / total
                } else {
                    0.0
                };
                (l.band, share)
            })
            .collect()
    }

    /// Next band up in the symbol's tier ordering, wrapping to the smallest.
    #[must_use]
    pub fn next_band(&self, symbol: &str, current: Band) -> Band {
        let bands = self.config.tier_bands(self.config.tier_for(symbol)).all();
        bands
            .iter()
            .copied()
            .find(|&b| b > current)
            .or_else(|| bands.first().copied())
            .unwrap_or(current)
    }

    /// Lowest-concentration tier band other than `exclude`; ties go to the
    /// smaller band. With `require_capacity`, bands that cannot take another
    /// position are skipped.
    #[must_use]
    pub fn least_concentrated_band(
        &self,
        symbol: &str,
        exclude: Option<Band>,
        require_capacity: bool,
    ) -> Option<Band> {
        self.config
            .tier_bands(self.config.tier_for(symbol))
            .all()
            .into_iter()
            .filter(|&b| Some(b) != exclude)
            .filter(|&b| !require_capacity || self.has_capacity(symbol, b))
            .min_by(|&a, &b| {
                self.concentration(symbol, a)
                    .total_cmp(&self.concentration(symbol, b))
                    .then(a.cmp(&b))
            })
    }

    /// Appends a roll to the source ladder's history.
    ///
    /// # Errors
    ///
    /// Returns [`LadderError::InvalidRequest`] if the ladder does not exist.
    pub fn record_roll(&mut self, ladder_id: &str, record: RollRecord) -> LadderResult<()> {
        let ladder = self
            .ladders
            .get_mut(ladder_id)
            .ok_or_else(|| LadderError::invalid(format!("unknown ladder {ladder_id}")))?;
        ladder.record_roll(record);
        Ok(())
    }

    /// Drops empty ladders idle for longer than the grace period.
    pub fn collect_idle(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let grace = Duration::seconds(
            i64::try_from(self.config.ladder_idle_grace_secs).unwrap_or(i64::MAX),
        );
        let idle: Vec<String> = self
            .ladders
            .values()
            .filter(|l| l.is_empty() && now - l.last_active >= grace)
            .map(|l| l.id.clone())
            .collect();

        for id in &idle {
            if let Some(ladder) = self.ladders.remove(id) {
                self.by_band.remove(&(ladder.symbol.clone(), ladder.band));
                info!(ladder_id = %id, symbol = %ladder.symbol, band = ladder.band, "Idle ladder collected");
            }
        }
        idle
    }

    #[must_use]
    pub fn find_ladder_by_position(&self, position_id: &str) -> Option<&Ladder> {
        self.membership
            .get(position_id)
            .and_then(|id| self.ladders.get(id))
    }

    #[must_use]
    pub fn ladder(&self, ladder_id: &str) -> Option<&Ladder> {
        self.ladders.get(ladder_id)
    }

    #[must_use]
    pub fn ladder_at(&self, symbol: &str, band: Band) -> Option<&Ladder> {
        self.by_band
            .get(&(symbol.to_string(), band))
            .and_then(|id| self.ladders.get(id))
    }

    pub fn ladders(&self) -> impl Iterator<Item = &Ladder> {
        self.ladders.values()
    }

    pub fn ladders_for<'a>(&'a self, symbol: &'a str) -> impl Iterator<Item = &'a Ladder> {
        self.ladders.values().filter(move |l| l.symbol == symbol)
    }

    #[must_use]
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.ladders.values().map(|l| l.symbol.clone()).collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    #[must_use]
    pub fn ladder_count(&self, symbol: &str) -> usize {
        self.ladders_for(symbol).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ladders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ladders.is_empty()
    }

    fn symbol_theta(&self, symbol: &str) -> f64 {
        self.ladders_for(symbol).map(|l| l.metrics.total_theta).sum()
    }

    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut symbols: BTreeMap<String, SymbolSummary> = BTreeMap::new();
        for ladder in self.ladders.values() {
            let summary = symbols.entry(ladder.symbol.clone()).or_insert_with(|| SymbolSummary {
                tier: ladder.tier.clone(),
                ..SymbolSummary::default()
            });
            summary.ladders += 1;
            summary.positions += ladder.len();
            summary.total_theta += ladder.metrics.total_theta;
            summary.total_value += ladder.metrics.total_value;
            summary.avg_theta_efficiency += ladder.metrics.theta_efficiency;
        }
        for summary in symbols.values_mut() {
            if summary.ladders > 0 {
                summary.avg_theta_efficiency /= summary.ladders as f64;
            }
        }
        RegistrySnapshot {
            total_ladders: self.ladders.len(),
            total_positions: self.membership.len(),
            symbols,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prime_ladder_core::{ErrorCode, PositionStatus, SequentialIdSource, Side, StaticOracle};
    use rust_decimal_macros::dec;

    fn registry() -> LadderRegistry {
        LadderRegistry::new(LadderConfig::default(), Arc::new(SequentialIdSource::new()))
    }

    fn position(id: &str, symbol: &str, theta: f64) -> Position {
        let now = Utc::now();
        Position {
            id: id.into(),
            symbol: symbol.into(),
            side: Side::Buy,
            entry_price: dec!(100),
            stop_loss: dec!(95),
            take_profit: dec!(110),
            current_price: dec!(100),
            size: 0.02,
            leverage: 1,
            confidence: 0.7,
            status: PositionStatus::Active,
            open_time: now,
            close_time: None,
            close_reason: None,
            realized_pnl: None,
            unrealized_pnl: 0.0,
            ladder_id: None,
            assigned_band: 11,
            expiry: now + Duration::days(11),
            theta_estimate: theta,
            theta_reserved: 0.0,
            edge_at_open: None,
            rolled_from: None,
        }
    }

    fn moderate() -> TemporalScore {
        // coherence below the primary-only cutoff, resonance below the short bias
        StaticOracle::score(0.05, 0.5, 0.3)
    }

    #[test]
    fn gate_rejects_weak_scores() {
        let mut reg = registry();
        let pos = position("p1", "BTCUSDT", 0.1);
        let now = Utc::now();
        assert_eq!(reg.assign_to_ladder(&pos, &StaticOracle::score(0.05, 0.3, 0.5), now), Ok(None));
        assert_eq!(reg.assign_to_ladder(&pos, &StaticOracle::score(-0.01, 0.8, 0.5), now), Ok(None));
        assert_eq!(reg.assign_to_ladder(&pos, &StaticOracle::score(0.05, 0.8, 0.1), now), Ok(None));
        assert!(reg.is_empty());
    }

    #[test]
    fn fallback_score_passes_gate() {
        assert!(registry().passes_gate(&TemporalScore::fallback()));
    }

    #[test]
    fn spreads_across_least_concentrated_bands() {
        let mut reg = registry();
        let now = Utc::now();
        let a = reg
            .assign_to_ladder(&position("p1", "BTCUSDT", 0.1), &moderate(), now)
            .unwrap()
            .unwrap();
        // empty symbol: all bands at zero, smallest wins
        assert_eq!(a.band, 7);
        assert!(a.created);

        let b = reg
            .assign_to_ladder(&position("p2", "BTCUSDT", 0.1), &moderate(), now)
            .unwrap()
            .unwrap();
        assert_eq!(b.band, 11);
        assert!((reg.concentration("BTCUSDT", 7) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn high_coherence_uses_primary_bands() {
        let reg = registry();
        let bands = reg.candidate_bands("BTCUSDT", &StaticOracle::score(0.05, 0.9, 0.3));
        assert_eq!(bands, vec![11, 13, 17]);
    }

    #[test]
    fn strong_resonance_biases_short_bands() {
        let reg = registry();
        let bands = reg.candidate_bands("BTCUSDT", &StaticOracle::score(0.05, 0.5, 0.8));
        assert_eq!(bands, vec![7, 11, 13]);
    }

    #[test]
    fn full_ladder_rejects_instead_of_overflowing() {
        let mut reg = registry();
        let now = Utc::now();
        // TIER6 default: one position per ladder
        reg.place(&position("p1", "PEPEUSDT", 0.1), 7, now).unwrap();
        let err = reg.place(&position("p2", "PEPEUSDT", 0.1), 7, now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::LadderFull);
        assert_eq!(reg.ladder_at("PEPEUSDT", 7).map(Ladder::len), Some(1));
    }

    #[test]
    fn tier_ladder_cap_is_enforced() {
        let mut reg = registry();
        let now = Utc::now();
        reg.place(&position("p1", "PEPEUSDT", 0.1), 7, now).unwrap();
        reg.place(&position("p2", "PEPEUSDT", 0.1), 11, now).unwrap();
        let err = reg.place(&position("p3", "PEPEUSDT", 0.1), 13, now).unwrap_err();
        assert_eq!(err.code(), ErrorCode::LadderFull);
        assert!(!reg.has_capacity("PEPEUSDT", 13));
    }

    #[test]
    fn position_is_never_in_two_ladders() {
        let mut reg = registry();
        let now = Utc::now();
        let pos = position("p1", "BTCUSDT", 0.1);
        reg.place(&pos, 11, now).unwrap();
        assert!(reg.place(&pos, 13, now).is_err());
        let holding = reg.ladders().filter(|l| l.contains("p1")).count();
        assert_eq!(holding, 1);
    }

    #[test]
    fn metrics_prune_closed_members() {
        let mut reg = registry();
        let now = Utc::now();
        let mut live = position("p1", "BTCUSDT", 0.1);
        let mut closed = position("p2", "BTCUSDT", 0.1);
        let ladder_id = reg.place(&live, 11, now).unwrap().ladder_id;
        reg.place(&closed, 11, now).unwrap();
        live.ladder_id = Some(ladder_id.clone());
        live.unrealized_pnl = 0.001;
        closed.status = PositionStatus::Closed;

        let positions = [live, closed];
        let stale = reg.update_ladder_metrics(
            &ladder_id,
            |id| positions.iter().find(|p| p.id == id),
            now,
        );
        assert_eq!(stale, vec!["p2".to_string()]);
        let ladder = reg.ladder(&ladder_id).unwrap();
        assert_eq!(ladder.len(), 1);
        assert!((ladder.metrics.total_theta - 0.002).abs() < 1e-12);
        assert!((ladder.metrics.theta_efficiency - 0.5).abs() < 1e-9);
        assert!(reg.find_ladder_by_position("p2").is_none());
    }

    #[test]
    fn next_band_cycles_within_tier() {
        let reg = registry();
        // TIER1 bands: 7, 11, 13, 17, 19, 23
        assert_eq!(reg.next_band("BTCUSDT", 11), 13);
        assert_eq!(reg.next_band("BTCUSDT", 23), 7);
        // TIER6: 7, 11
        assert_eq!(reg.next_band("PEPEUSDT", 11), 7);
    }

    #[test]
    fn least_concentrated_excludes_current_band() {
        let mut reg = registry();
        let now = Utc::now();
        reg.place(&position("p1", "BTCUSDT", 0.1), 7, now).unwrap();
        reg.place(&position("p2", "BTCUSDT", 0.1), 11, now).unwrap();
        assert_eq!(reg.least_concentrated_band("BTCUSDT", Some(13), false), Some(17));
        assert_eq!(reg.least_concentrated_band("BTCUSDT", None, false), Some(13));
    }

    #[test]
    fn idle_empty_ladders_are_collected_after_grace() {
        let mut reg = registry();
        let now = Utc::now();
        reg.place(&position("p1", "BTCUSDT", 0.1), 11, now).unwrap();
        reg.remove_position("p1", now);

        assert!(reg.collect_idle(now + Duration::seconds(60)).is_empty());
        let collected = reg.collect_idle(now + Duration::seconds(901));
        assert_eq!(collected.len(), 1);
        assert!(reg.ladder_at("BTCUSDT", 11).is_none());
    }

    #[test]
    fn roll_history_counts_rolls() {
        let mut reg = registry();
        let now = Utc::now();
        let id = reg.place(&position("p1", "BTCUSDT", 0.1), 11, now).unwrap().ladder_id;
        reg.record_roll(
            &id,
            RollRecord {
                timestamp: now,
                from_band: 11,
                to_band: 13,
                reason: "approaching_expiry".into(),
                old_position_id: "p1".into(),
                new_position_id: "p9".into(),
            },
        )
        .unwrap();
        let ladder = reg.ladder(&id).unwrap();
        assert_eq!(ladder.metrics.rolls_completed, 1);
        assert_eq!(ladder.roll_history[0].to_band, 13);
    }

    #[test]
    fn snapshot_summarizes_by_symbol() {
        let mut reg = registry();
        let now = Utc::now();
        reg.place(&position("p1", "BTCUSDT", 0.1), 11, now).unwrap();
        reg.place(&position("p2", "BTCUSDT", 0.1), 13, now).unwrap();
        reg.place(&position("p3", "ETHUSDT", 0.1), 11, now).unwrap();
        let snapshot = reg.snapshot();
        assert_eq!(snapshot.total_ladders, 3);
        assert_eq!(snapshot.total_positions, 3);
        assert_eq!(snapshot.symbols["BTCUSDT"].ladders, 2);
        assert_eq!(snapshot.symbols["BTCUSDT"].tier, "TIER1");
    }
}
