use prime_ladder_core::LadderConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::book::{LadderBook, SharedBook};
use crate::queue::{EnqueueOutcome, RollReason, RollRequest};
use crate::triggers::is_inefficient;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceReport {
    pub symbols_checked: usize,
    pub concentration_rolls: usize,
    pub efficiency_rolls: usize,
    pub ladders_collected: usize,
}

/// Spreads theta across bands and rolls out of inefficient ladders.
#[derive(Clone)]
pub struct RebalanceScheduler {
    book: SharedBook,
    config: watch::Receiver<LadderConfig>,
}

impl RebalanceScheduler {
    #[must_use]
    pub fn new(book: SharedBook, config: watch::Receiver<LadderConfig>) -> Self {
        Self { book, config }
    }

    pub async fn run_once(&self) -> RebalanceReport {
        let config = self.config.borrow().clone();
        let mut book = self.book.lock().await;
        let report = rebalance(&mut book, &config);
        if report.concentration_rolls + report.efficiency_rolls + report.ladders_collected > 0 {
            info!(
                symbols = report.symbols_checked,
                concentration_rolls = report.concentration_rolls,
                efficiency_rolls = report.efficiency_rolls,
                ladders_collected = report.ladders_collected,
                "Rebalance pass complete"
            );
        }
        report
    }
}

/// One rebalance pass over the book.
///
/// For every band holding more than `max_theta_concentration` of its symbol's
/// theta, every member except the oldest is queued to roll into the
/// least-concentrated other band. Ladders below the efficiency floor are
/// rolled out entirely. Idle empty ladders are then collected.
pub fn rebalance(book: &mut LadderBook, config: &LadderConfig) -> RebalanceReport {
    let now = book.now();
    book.refresh_all(now);

    let mut report = RebalanceReport::default();
    let mut requests = Vec::new();
    let max_share = config.theta_smoothing.max_theta_concentration;

    for symbol in book.registry.symbols() {
        report.symbols_checked += 1;
        let distribution = book.registry.theta_distribution(&symbol);

        for ladder in book.registry.ladders_for(&symbol) {
            let share = distribution.get(&ladder.band).copied().unwrap_or(0.0);
            if share > max_share && ladder.len() > 1 {
                let Some(target) =
                    book.registry
                        .least_concentrated_band(&symbol, Some(ladder.band), false)
                else {
                    continue;
                };
                debug!(
                    symbol = %symbol,
                    band = ladder.band,
                    share,
                    target,
                    "Theta concentration above cap"
                );
                for member in ladder.members.iter().skip(1) {
                    requests.push(RollRequest::new(
                        member.position_id.clone(),
                        Some(ladder.id.clone()),
                        RollReason::RebalanceThetaConcentration,
                        target,
                        now,
                    ));
                }
            }

            if !ladder.is_empty()
                && is_inefficient(
                    ladder.metrics.theta_efficiency,
                    ladder.metrics.total_theta,
                    &config.roll_triggers,
                )
            {
                let Some(target) =
                    book.registry
                        .least_concentrated_band(&symbol, Some(ladder.band), false)
                else {
                    continue;
                };
                debug!(
                    symbol = %symbol,
                    band = ladder.band,
                    efficiency = ladder.metrics.theta_efficiency,
                    target,
                    "Ladder theta efficiency below floor"
                );
                for member in &ladder.members {
                    requests.push(RollRequest::new(
                        member.position_id.clone(),
                        Some(ladder.id.clone()),
                        RollReason::LowThetaEfficiency,
                        target,
                        now,
                    ));
                }
            }
        }
    }

    for request in requests {
        let reason = request.reason;
        if book.queue.enqueue(request) != EnqueueOutcome::Kept {
            match reason {
                RollReason::LowThetaEfficiency => report.efficiency_rolls += 1,
                _ => report.concentration_rolls += 1,
            }
        }
    }

    report.ladders_collected = book.registry.collect_idle(now).len();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use prime_ladder_core::{EventBus, ManualClock, SequentialIdSource, Side, StaticOracle};
    use prime_ladder_ledger::OpenRequest;
    use rust_decimal_macros::dec;

    fn book_with(config: LadderConfig, clock: Arc<ManualClock>) -> LadderBook {
        LadderBook::new(config, Arc::new(SequentialIdSource::new()), clock, EventBus::default())
    }

    fn open_in(book: &mut LadderBook, symbol: &str, band: u32) -> String {
        let position = book
            .ledger
            .open_position(
                OpenRequest::new(symbol, Side::Buy, dec!(100), dec!(95), dec!(110), 0.7)
                    .with_days_to_expiry(band),
            )
            .unwrap();
        let now = book.now();
        let assignment = book.registry.place(&position, band, now).unwrap();
        book.ledger
            .attach_to_ladder(&position.id, &assignment.ladder_id, band)
            .unwrap();
        position.id
    }

    #[test]
    fn overloaded_band_rolls_non_anchor_members() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut book = book_with(LadderConfig::default(), clock);
        let anchor = open_in(&mut book, "BTCUSDT", 11);
        let second = open_in(&mut book, "BTCUSDT", 11);
        let third = open_in(&mut book, "BTCUSDT", 11);
        open_in(&mut book, "BTCUSDT", 13);

        let report = rebalance(&mut book, &LadderConfig::default());
        assert_eq!(report.concentration_rolls, 2);
        assert!(!book.queue.contains(&anchor));
        for id in [&second, &third] {
            let request = book.queue.get(id).unwrap();
            assert_eq!(request.reason, RollReason::RebalanceThetaConcentration);
            assert_eq!(request.priority, 5);
            assert_ne!(request.target_band, 11);
            assert_ne!(request.target_band, 13);
        }
    }

    #[test]
    fn balanced_symbol_queues_nothing() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut book = book_with(LadderConfig::default(), clock);
        for band in [7, 11, 13, 17] {
            open_in(&mut book, "BTCUSDT", band);
        }
        let report = rebalance(&mut book, &LadderConfig::default());
        assert_eq!(report.concentration_rolls, 0);
        assert!(book.queue.is_empty());
    }

    #[test]
    fn inefficient_ladder_rolls_every_member() {
        let mut config = LadderConfig::default();
        config.roll_triggers.theta_efficiency_min = 0.0;
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut book = book_with(config.clone(), clock);
        for band in [7, 11, 13, 17] {
            open_in(&mut book, "BTCUSDT", band);
        }
        book.ledger.mark_price("BTCUSDT", dec!(97)).unwrap();

        let report = rebalance(&mut book, &config);
        assert_eq!(report.efficiency_rolls, 4);
        assert_eq!(book.queue.len(), 4);
    }

    #[test]
    fn collects_idle_empty_ladders() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut book = book_with(LadderConfig::default(), Arc::clone(&clock));
        let id = open_in(&mut book, "BTCUSDT", 11);
        book.close(&id, "manual", None).unwrap();

        assert_eq!(rebalance(&mut book, &LadderConfig::default()).ladders_collected, 0);
        clock.advance(Duration::seconds(901));
        assert_eq!(rebalance(&mut book, &LadderConfig::default()).ladders_collected, 1);
        assert!(book.registry.is_empty());
    }

    #[tokio::test]
    async fn scheduler_runs_against_shared_book() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let book = book_with(LadderConfig::default(), Arc::clone(&clock)).shared();
        {
            let mut guard = book.lock().await;
            let score = StaticOracle::score(0.05, 0.5, 0.3);
            let request = OpenRequest::new("ETHUSDT", Side::Buy, dec!(100), dec!(95), dec!(110), 0.7);
            guard.open_and_assign(request, &score).unwrap();
        }
        let (_tx, rx) = watch::channel(LadderConfig::default());
        let scheduler = RebalanceScheduler::new(book, rx);
        let report = scheduler.run_once().await;
        assert_eq!(report.symbols_checked, 1);
        assert_eq!(report.concentration_rolls, 0);
    }
}
