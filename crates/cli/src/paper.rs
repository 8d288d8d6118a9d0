//! Seeded paper feed: random-walk marks and synthetic open requests.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use prime_ladder_core::{LadderConfig, ManualClock, Side};
use prime_ladder_ledger::OpenRequest;
use prime_ladder_scheduler::{LadderEngine, SystemSnapshot};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

const STARTING_PRICES: &[(&str, i64)] = &[
    ("BTCUSDT", 45_000),
    ("ETHUSDT", 3_000),
    ("SOLUSDT", 150),
    ("BNBUSDT", 600),
    ("XRPUSDT", 1),
];

/// Every configured symbol, in tier order.
#[must_use]
pub fn configured_symbols(config: &LadderConfig) -> Vec<String> {
    config.tiers.values().flatten().cloned().collect()
}

pub struct PaperFeed {
    rng: StdRng,
    prices: BTreeMap<String, Decimal>,
    volatility: f64,
}

impl PaperFeed {
    #[must_use]
    pub fn new(seed: u64, symbols: &[String], volatility: f64) -> Self {
        let prices = symbols
            .iter()
            .map(|symbol| {
                let start = STARTING_PRICES
                    .iter()
                    .find(|(s, _)| s == symbol)
                    .map_or(100, |(_, p)| *p);
                (symbol.clone(), Decimal::from(start))
            })
            .collect();
        Self {
            rng: StdRng::seed_from_u64(seed),
            prices,
            volatility,
        }
    }

    #[must_use]
    pub fn price(&self, symbol: &str) -> Option<Decimal> {
        self.prices.get(symbol).copied()
    }

    /// Moves every price one step and returns the new marks.
    pub fn step(&mut self) -> Vec<(String, Decimal)> {
        let mut marks = Vec::with_capacity(self.prices.len());
        for (symbol, price) in &mut self.prices {
            let shock = self.rng.gen_range(-self.volatility..=self.volatility);
            let factor = Decimal::from_f64_retain(1.0 + shock).unwrap_or(Decimal::ONE);
            let next = (*price * factor).round_dp(6);
            if next > Decimal::ZERO {
                *price = next;
            }
            marks.push((symbol.clone(), *price));
        }
        marks
    }

    /// A synthetic entry at the current price with 2% risk and 4% reward.
    pub fn next_request(&mut self) -> Option<OpenRequest> {
        if self.prices.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..self.prices.len());
        let (symbol, price) = self.prices.iter().nth(index)?;
        let side = if self.rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
        let risk = *price * Decimal::new(2, 2);
        let reward = *price * Decimal::new(4, 2);
        let (stop, target) = match side {
            Side::Buy => (*price - risk, *price + reward),
            Side::Sell => (*price + risk, *price - reward),
        };
        let confidence = self.rng.gen_range(0.55..0.9);
        let days = self.rng.gen_range(5..=40);

        Some(
            OpenRequest::new(symbol.clone(), side, *price, stop, target, confidence)
                .with_days_to_expiry(days),
        )
    }

    pub fn should_open(&mut self, probability: f64) -> bool {
        self.rng.gen_bool(probability.clamp(0.0, 1.0))
    }
}

/// Parameters of an offline run on a manual clock.
#[derive(Debug, Clone)]
pub struct SimulationPlan {
    pub steps: u32,
    pub step: Duration,
    pub open_probability: f64,
    pub rebalance_every: u32,
}

/// Drives the engine step by step without timers: mark, open, evaluate,
/// process, and rebalance on schedule. The budget resets at each simulated
/// day boundary.
pub async fn simulate(
    engine: &LadderEngine,
    clock: &Arc<ManualClock>,
    feed: &mut PaperFeed,
    plan: &SimulationPlan,
) -> SystemSnapshot {
    let steps_per_day = (Duration::days(1).num_seconds() / plan.step.num_seconds().max(1)).max(1);

    for step in 1..=plan.steps {
        clock.advance(plan.step);

        for (symbol, price) in feed.step() {
            if let Err(e) = engine.mark_price(&symbol, price).await {
                warn!(symbol = %symbol, error = %e, "Mark rejected");
            }
        }

        if feed.should_open(plan.open_probability) {
            if let Some(request) = feed.next_request() {
                match engine.open_position(request).await {
                    Ok(outcome) => debug!(
                        position_id = %outcome.position.id,
                        band = outcome.position.assigned_band,
                        laddered = outcome.assignment.is_some(),
                        "Paper position opened"
                    ),
                    Err(e) => debug!(error_code = %e.code(), error = %e, "Paper open rejected"),
                }
            }
        }

        engine.evaluate_now().await;
        engine.process_queue_now().await;

        if plan.rebalance_every > 0 && step % plan.rebalance_every == 0 {
            engine.rebalance_now().await;
        }
        if i64::from(step) % steps_per_day == 0 {
            let reset = engine.reset_theta_budget("daily_reset").await;
            info!(step, previous_used = reset.previous_used, "Daily theta budget reset");
        }
    }

    engine.snapshot().await
}
