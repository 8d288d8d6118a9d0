//! Roll trigger rules.
//!
//! Stop-loss is checked first and short-circuits everything else. The
//! remaining rules are all evaluated and the highest priority wins; on a tie
//! the earlier rule (expiry, edge decay, profit target) is kept.

use chrono::{DateTime, Utc};
use prime_ladder_core::{Position, RollTriggerConfig, TemporalScore};
use tracing::debug;

use crate::queue::RollReason;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerHit {
    pub reason: RollReason,
    pub priority: u8,
}

impl TriggerHit {
    const fn of(reason: RollReason) -> Self {
        Self {
            reason,
            priority: reason.base_priority(),
        }
    }
}

/// Evaluates the per-position roll rules.
///
/// `score` is ignored for edge decay when it is the fallback substitute.
#[must_use]
pub fn evaluate_position(
    position: &Position,
    score: Option<&TemporalScore>,
    triggers: &RollTriggerConfig,
    now: DateTime<Utc>,
) -> Option<TriggerHit> {
    if !position.is_active() {
        return None;
    }

    let pnl = position.pnl_fraction();
    if pnl <= triggers.loss_threshold {
        debug!(position_id = %position.id, pnl, "Stop-loss roll trigger");
        return Some(TriggerHit::of(RollReason::StopLoss));
    }

    let mut hits = Vec::with_capacity(3);
    let days_left = position.days_to_expiry(now);
    if days_left <= triggers.days_before_expiry {
        hits.push(TriggerHit::of(RollReason::ApproachingExpiry));
    }
    if let Some(score) = score.filter(|s| !s.is_fallback) {
        if score.edge_temporal < triggers.edge_decay {
            hits.push(TriggerHit::of(RollReason::EdgeTemporalDecay));
        }
    }
    if triggers.profit_target > 0.0 && pnl >= triggers.profit_target {
        hits.push(TriggerHit {
            reason: RollReason::ProfitTargetHit,
            priority: profit_priority(pnl, triggers.profit_target),
        });
    }

    // first rule wins ties
    hits.into_iter()
        .fold(None, |best: Option<TriggerHit>, hit| match best {
            Some(b) if b.priority >= hit.priority => Some(b),
            _ => Some(hit),
        })
}

/// 6 at the target, rising linearly to 10 at twice the target.
fn profit_priority(pnl: f64, target: f64) -> u8 {
    let base = f64::from(RollReason::ProfitTargetHit.base_priority());
    let overshoot = ((pnl - target) / target).clamp(0.0, 1.0);
    // bounded to [6, 10]
    (base + 4.0 * overshoot).round() as u8
}

/// Whether a ladder's theta efficiency calls for rolling it out.
#[must_use]
pub fn is_inefficient(theta_efficiency: f64, total_theta: f64, triggers: &RollTriggerConfig) -> bool {
    total_theta > 0.0 && theta_efficiency < triggers.theta_efficiency_min
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use prime_ladder_core::{PositionStatus, Side, StaticOracle};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn position(mark: Decimal, days: i64, now: DateTime<Utc>) -> Position {
        let mut p = Position {
            id: "p1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            entry_price: dec!(100),
            stop_loss: dec!(90),
            take_profit: dec!(120),
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
            ladder_id: Some("ladder_1".into()),
            assigned_band: 11,
            // half a day of slack so whole-day truncation is stable
            expiry: now + Duration::days(days) + Duration::hours(12),
            theta_estimate: 0.09,
            theta_reserved: 0.0,
            edge_at_open: None,
            rolled_from: None,
        };
        p.apply_mark(mark);
        p
    }

    #[test]
    fn stop_loss_short_circuits() {
        let now = Utc::now();
        let triggers = RollTriggerConfig::default();
        // -30% and also one day from expiry
        let hit = evaluate_position(&position(dec!(70), 1, now), None, &triggers, now).unwrap();
        assert_eq!(hit.reason, RollReason::StopLoss);
        assert_eq!(hit.priority, 20);
    }

    #[test]
    fn expiry_triggers_within_threshold() {
        let now = Utc::now();
        let triggers = RollTriggerConfig::default();
        assert_eq!(
            evaluate_position(&position(dec!(100), 3, now), None, &triggers, now).map(|h| h.reason),
            Some(RollReason::ApproachingExpiry)
        );
        assert!(evaluate_position(&position(dec!(100), 4, now), None, &triggers, now).is_none());
    }

    #[test]
    fn edge_decay_ignores_fallback() {
        let now = Utc::now();
        let triggers = RollTriggerConfig::default();
        let pos = position(dec!(100), 10, now);
        let weak = StaticOracle::score(0.01, 0.6, 0.3);
        assert_eq!(
            evaluate_position(&pos, Some(&weak), &triggers, now).map(|h| h.priority),
            Some(8)
        );
        let fallback = TemporalScore::fallback();
        assert!(evaluate_position(&pos, Some(&fallback), &triggers, now).is_none());
    }

    #[test]
    fn profit_priority_scales_with_overshoot() {
        let now = Utc::now();
        let triggers = RollTriggerConfig::default();
        let at_target = evaluate_position(&position(dec!(150), 10, now), None, &triggers, now);
        assert_eq!(at_target.map(|h| h.priority), Some(6));
        let doubled = evaluate_position(&position(dec!(200), 10, now), None, &triggers, now);
        assert_eq!(doubled.map(|h| h.priority), Some(10));
    }

    #[test]
    fn highest_priority_wins_among_non_stop_triggers() {
        let now = Utc::now();
        let triggers = RollTriggerConfig::default();
        // near expiry (10) and at profit target (6)
        let hit = evaluate_position(&position(dec!(150), 2, now), None, &triggers, now).unwrap();
        assert_eq!(hit.reason, RollReason::ApproachingExpiry);
        // near expiry (10) and far past target (10): expiry listed first
        let hit = evaluate_position(&position(dec!(250), 2, now), None, &triggers, now).unwrap();
        assert_eq!(hit.reason, RollReason::ApproachingExpiry);
    }

    #[test]
    fn efficiency_floor_needs_theta() {
        let triggers = RollTriggerConfig {
            theta_efficiency_min: 0.0,
            ..RollTriggerConfig::default()
        };
        assert!(is_inefficient(-0.5, 0.01, &triggers));
        assert!(!is_inefficient(-0.5, 0.0, &triggers));
        assert!(!is_inefficient(0.5, 0.01, &triggers));
    }
}
