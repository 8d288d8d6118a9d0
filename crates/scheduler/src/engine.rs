//! Engine: the shared book plus the three scheduler timers.
//!
//! Timers:
//! 1. Trigger evaluation (`scheduler.evaluation_interval_secs`)
//! 2. Queue processing (`scheduler.queue_interval_secs`)
//! 3. Rebalancing (`theta_smoothing.rebalance_interval_secs`)
//!
//! Each loop waits on its interval or the shutdown signal; the tick's work
//! runs outside the `select!`, so shutdown never interrupts a roll.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use prime_ladder_core::{
    score_with_fallback, Band, Clock, EventBus, IdSource, LadderConfig, LadderResult,
    MarketContext, PositionEvent, ScoringOracle, SystemClock, UuidIdSource,
};
use prime_ladder_ledger::{BudgetReset, CloseOutcome, OpenRequest, ThetaBudgetStatus};
use rust_decimal::Decimal;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::book::{LadderBook, OpenOutcome, SchedulerMetrics, SharedBook, SystemSnapshot};
use crate::queue::{EnqueueOutcome, QueuedRoll};
use crate::rebalance::{RebalanceReport, RebalanceScheduler};
use crate::roll::{RollOutcome, RollScheduler};

pub struct LadderEngine {
    book: SharedBook,
    rolls: RollScheduler,
    rebalancer: RebalanceScheduler,
    oracle: Arc<dyn ScoringOracle>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: watch::Receiver<LadderConfig>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LadderEngine {
    /// Engine with random ids and the system clock.
    ///
    /// # Errors
    ///
    /// Returns `LadderError::Config` if the configuration is invalid.
    pub fn new(config: LadderConfig, oracle: Arc<dyn ScoringOracle>) -> LadderResult<Self> {
        let (_tx, rx) = watch::channel(config);
        Self::with_sources(rx, oracle, Arc::new(UuidIdSource), Arc::new(SystemClock))
    }

    /// Engine following a config channel (e.g. a `ConfigWatcher`), with
    /// injected id and clock sources.
    ///
    /// # Errors
    ///
    /// Returns `LadderError::Config` if the current configuration is invalid.
    pub fn with_sources(
        config: watch::Receiver<LadderConfig>,
        oracle: Arc<dyn ScoringOracle>,
        ids: Arc<dyn IdSource>,
        clock: Arc<dyn Clock>,
    ) -> LadderResult<Self> {
        let current = config.borrow().clone();
        current.validate()?;

        let events = EventBus::default();
        let book = LadderBook::new(current, ids, Arc::clone(&clock), events.clone()).shared();
        let rolls = RollScheduler::new(
            Arc::clone(&book),
            Arc::clone(&oracle),
            Arc::clone(&clock),
            config.clone(),
        );
        let rebalancer = RebalanceScheduler::new(Arc::clone(&book), config.clone());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            book,
            rolls,
            rebalancer,
            oracle,
            clock,
            events,
            config,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn book(&self) -> SharedBook {
        Arc::clone(&self.book)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PositionEvent> {
        self.events.subscribe()
    }

    /// Scores the symbol (without holding the book), then opens and assigns.
    ///
    /// # Errors
    ///
    /// Returns the ledger's validation or capacity error.
    pub async fn open_position(&self, mut request: OpenRequest) -> LadderResult<OpenOutcome> {
        let score = match request.score.clone() {
            Some(score) => score,
            None => {
                let timeout = {
                    let config = self.config.borrow();
                    Duration::from_millis(config.scheduler.oracle_timeout_ms)
                };
                let temporal = request.temporal.clone().unwrap_or_default();
                let context = MarketContext {
                    price: Some(request.entry_price),
                    days_to_expiry: temporal.days_to_expiry,
                    theta_estimate: temporal.theta_estimate,
                    timestamp: self.clock.now(),
                };
                let score =
                    score_with_fallback(self.oracle.as_ref(), &request.symbol, &context, timeout)
                        .await;
                request.score = Some(score.clone());
                score
            }
        };

        let mut book = self.book.lock().await;
        book.open_and_assign(request, &score)
    }

    /// # Errors
    ///
    /// Returns `LadderError::NotFound` for unknown or closed positions.
    pub async fn close_position(
        &self,
        position_id: &str,
        reason: &str,
        realized_pnl: Option<f64>,
    ) -> LadderResult<CloseOutcome> {
        self.book.lock().await.close(position_id, reason, realized_pnl)
    }

    /// # Errors
    ///
    /// Returns `LadderError::InvalidRequest` for a non-positive price.
    pub async fn mark_price(&self, symbol: &str, price: Decimal) -> LadderResult<usize> {
        self.book.lock().await.ledger.mark_price(symbol, price)
    }

    /// # Errors
    ///
    /// See [`RollScheduler::force_roll`].
    pub async fn force_roll(
        &self,
        position_id: &str,
        target_band: Band,
        note: &str,
    ) -> LadderResult<EnqueueOutcome> {
        self.rolls.force_roll(position_id, target_band, note).await
    }

    pub async fn reset_theta_budget(&self, reason: &str) -> BudgetReset {
        self.book.lock().await.ledger.reset_theta_budget(reason)
    }

    pub async fn budget_status(&self) -> ThetaBudgetStatus {
        self.book.lock().await.ledger.budget_status()
    }

    pub async fn metrics(&self) -> SchedulerMetrics {
        self.book.lock().await.metrics.clone()
    }

    pub async fn queue_snapshot(&self) -> Vec<QueuedRoll> {
        let now = self.clock.now();
        self.book.lock().await.queue.snapshot(now)
    }

    pub async fn snapshot(&self) -> SystemSnapshot {
        let mut book = self.book.lock().await;
        let now = book.now();
        book.refresh_all(now);
        book.snapshot()
    }

    pub async fn evaluate_now(&self) -> usize {
        self.rolls.evaluate_triggers().await
    }

    pub async fn process_queue_now(&self) -> Vec<RollOutcome> {
        self.rolls.process_queue().await
    }

    pub async fn rebalance_now(&self) -> RebalanceReport {
        self.rebalancer.run_once().await
    }

    /// Spawns the three timers and the config follower.
    pub async fn start(&self) {
        let config = self.config.borrow().clone();
        let evaluation = Duration::from_secs(config.scheduler.evaluation_interval_secs.max(1));
        let processing = Duration::from_secs(config.scheduler.queue_interval_secs.max(1));
        let rebalancing = Duration::from_secs(config.theta_smoothing.rebalance_interval_secs.max(1));

        info!(
            evaluation_secs = evaluation.as_secs(),
            queue_secs = processing.as_secs(),
            rebalance_secs = rebalancing.as_secs(),
            max_rolls_per_cycle = config.scheduler.max_rolls_per_cycle,
            "Ladder engine started"
        );

        let mut tasks = self.tasks.lock().await;

        let rolls = self.rolls.clone();
        tasks.push(self.spawn_timer("evaluation", evaluation, move || {
            let rolls = rolls.clone();
            async move {
                let queued = rolls.evaluate_triggers().await;
                if queued > 0 {
                    info!(count = queued, "Roll triggers fired");
                }
            }
        }));

        let rolls = self.rolls.clone();
        tasks.push(self.spawn_timer("queue", processing, move || {
            let rolls = rolls.clone();
            async move {
                for outcome in rolls.process_queue().await {
                    debug!(position_id = outcome.position_id(), completed = outcome.is_completed(), "Roll processed");
                }
            }
        }));

        let rebalancer = self.rebalancer.clone();
        tasks.push(self.spawn_timer("rebalance", rebalancing, move || {
            let rebalancer = rebalancer.clone();
            async move {
                rebalancer.run_once().await;
            }
        }));

        tasks.push(self.spawn_config_follower());
    }

    fn spawn_timer<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                tick().await;
            }
            debug!(timer = name, "Timer stopped");
        })
    }

    fn spawn_config_follower(&self) -> JoinHandle<()> {
        let mut config = self.config.clone();
        let mut shutdown = self.shutdown.subscribe();
        let book = Arc::clone(&self.book);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = config.changed() => {
                        if changed.is_err() {
                            // publisher gone; keep the last config
                            let _ = shutdown.changed().await;
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
                let next = config.borrow_and_update().clone();
                if let Err(e) = next.validate() {
                    error!(error = %e, "Ignoring invalid ladder config update");
                    continue;
                }
                book.lock().await.apply_config(next);
            }
        })
    }

    /// Stops the timers, letting any in-flight tick finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler task ended abnormally");
            }
        }
        info!("Ladder engine stopped");
    }
}
