// =============================================================================
// Contest Controller — lifecycle state machine and the base-tick loop
// =============================================================================
//
// Exactly one contest exists at a time. The controller owns the lifecycle
// record and the replay clock; nobody else transitions status or drives the
// aggregator.
//
//   IDLE ──start()──► RUNNING ──pause()──► PAUSED
//                        ▲                    │
//                        └─────resume()───────┘
//   RUNNING / PAUSED ──stop() or auto-stop──► STOPPED
//
// The ticker computes the base index from wall-clock elapsed time on every
// fire and processes every index it has not yet seen, so a pause (or a burst
// of scheduler jitter) never leaves a hole in the candle sequences: skipped
// indices are replayed in order, emitting carry-forward candles where the
// window had no ticks. Auto-stop fires at the absolute wall-clock deadline
// regardless of pauses.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::contest::cleanup::{self, CleanupSummary};
use crate::contest::clock::ReplayClock;
use crate::contest::leaderboard::{self, LeaderboardEntry, BROADCAST_TOP_N, SNAPSHOT_TOP_N};
use crate::contest::ContestGate;
use crate::fanout::FanoutHub;
use crate::market_data::candle_cache::CandleCache;
use crate::market_data::price_index::PriceIndex;
use crate::market_data::tick_loader::TickWindowLoader;
use crate::runtime_config::RuntimeConfig;
use crate::storage::Store;
use crate::trading::portfolio::PortfolioStore;
use crate::trading::shorts::ShortPositionStore;
use crate::types::{ContestStatus, EngineError};

/// The live contest record. Owned exclusively by the controller.
#[derive(Debug, Clone)]
pub struct ActiveContest {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub started: Instant,
    pub clock: ReplayClock,
    pub symbols: Vec<String>,
    pub data_start_ms: i64,
    pub data_end_ms: i64,
}

pub struct ContestController {
    config: RuntimeConfig,
    store: Arc<Store>,
    loader: Arc<TickWindowLoader>,
    cache: Arc<CandleCache>,
    prices: Arc<PriceIndex>,
    hub: Arc<FanoutHub>,
    portfolios: Arc<PortfolioStore>,
    shorts: Arc<ShortPositionStore>,
    gate: Arc<ContestGate>,

    contest: RwLock<Option<ActiveContest>>,
    current_leaderboard: RwLock<Vec<LeaderboardEntry>>,
    /// Next base index the ticker will process.
    next_tick: AtomicU64,

    ticker: Mutex<Option<JoinHandle<()>>>,
    auto_stop: Mutex<Option<JoinHandle<()>>>,
    /// Serialises stop/cleanup against concurrent stop calls.
    stop_lock: tokio::sync::Mutex<()>,
}

impl ContestController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuntimeConfig,
        store: Arc<Store>,
        loader: Arc<TickWindowLoader>,
        cache: Arc<CandleCache>,
        prices: Arc<PriceIndex>,
        hub: Arc<FanoutHub>,
        portfolios: Arc<PortfolioStore>,
        shorts: Arc<ShortPositionStore>,
        gate: Arc<ContestGate>,
    ) -> Self {
        Self {
            config,
            store,
            loader,
            cache,
            prices,
            hub,
            portfolios,
            shorts,
            gate,
            contest: RwLock::new(None),
            current_leaderboard: RwLock::new(Vec::new()),
            next_tick: AtomicU64::new(0),
            ticker: Mutex::new(None),
            auto_stop: Mutex::new(None),
            stop_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn status(&self) -> ContestStatus {
        self.gate.status()
    }

    pub fn active_contest(&self) -> Option<ActiveContest> {
        self.contest.read().clone()
    }

    /// The most recently built ranking (top snapshot slice).
    pub fn leaderboard_snapshot(&self) -> Vec<LeaderboardEntry> {
        self.current_leaderboard.read().clone()
    }

    /// Serialisable view for the contest-state endpoint.
    pub fn state_snapshot(&self) -> serde_json::Value {
        let status = self.status();
        match self.contest.read().as_ref() {
            Some(c) => serde_json::json!({
                "id": c.id,
                "status": status,
                "start_time": c.start_time.to_rfc3339(),
                "duration_secs": c.clock.duration_secs,
                "symbols": c.symbols,
                "data_start_ms": c.data_start_ms,
                "data_end_ms": c.data_end_ms,
                "compression_ratio": c.clock.compression_ratio,
                "elapsed_secs": c.started.elapsed().as_secs(),
                "leaderboard": self.leaderboard_snapshot(),
            }),
            None => serde_json::json!({ "id": null, "status": status }),
        }
    }

    // -------------------------------------------------------------------
    // Lifecycle transitions
    // -------------------------------------------------------------------

    /// IDLE/STOPPED -> RUNNING. Verifies the corpus, resets every portfolio
    /// to the seed, loads the first tick window, and starts the ticker and
    /// the auto-stop timer.
    pub fn start(self: &Arc<Self>) -> Result<String, EngineError> {
        match self.status() {
            ContestStatus::Idle | ContestStatus::Stopped => {}
            s => {
                return Err(EngineError::ContestConflict(format!(
                    "cannot start: contest is {s}"
                )))
            }
        }

        let bounds = self
            .loader
            .initialize()
            .map_err(|e| EngineError::ContestConflict(format!("insufficient tick data: {e}")))?;

        let symbols = if self.config.symbols.is_empty() {
            bounds.symbols.clone()
        } else {
            self.config.symbols.clone()
        };

        let clock = ReplayClock::new(
            bounds.data_start_ms,
            bounds.data_end_ms,
            self.config.contest_duration_secs,
            self.config.base_interval_secs,
        );

        // Fresh baseline: seeded portfolios, no lots, no candles, no prices.
        self.portfolios
            .reset_all_to_seed()
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        self.shorts.clear();
        self.cache.clear();
        self.prices.clear();
        self.current_leaderboard.write().clear();
        self.next_tick.store(0, Ordering::SeqCst);

        self.loader
            .load_window(bounds.data_start_ms)
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        let contest = ActiveContest {
            id: uuid::Uuid::new_v4().to_string(),
            start_time: Utc::now(),
            started: Instant::now(),
            clock,
            symbols: symbols.clone(),
            data_start_ms: bounds.data_start_ms,
            data_end_ms: bounds.data_end_ms,
        };
        let contest_id = contest.id.clone();

        self.store
            .insert_contest(
                &contest.id,
                ContestStatus::Running.as_str(),
                &contest.start_time.to_rfc3339(),
                self.config.contest_duration_secs as i64,
                &symbols,
                bounds.data_start_ms,
                bounds.data_end_ms,
                clock.compression_ratio,
            )
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        *self.contest.write() = Some(contest);
        self.gate.set(ContestStatus::Running);

        info!(
            contest_id = %contest_id,
            symbols = symbols.len(),
            duration_secs = self.config.contest_duration_secs,
            compression_ratio = clock.compression_ratio,
            "contest started"
        );

        self.hub.publish(
            "contest_started",
            serde_json::json!({
                "contest_id": contest_id,
                "duration_secs": self.config.contest_duration_secs,
                "symbols": symbols,
                "compression_ratio": clock.compression_ratio,
            }),
        );

        self.spawn_ticker();
        self.spawn_auto_stop();

        Ok(contest_id)
    }

    /// RUNNING -> PAUSED. The ticker keeps firing but processes nothing; the
    /// auto-stop deadline is unaffected.
    pub fn pause(&self) -> Result<(), EngineError> {
        if self.status() != ContestStatus::Running {
            return Err(EngineError::ContestConflict(format!(
                "cannot pause: contest is {}",
                self.status()
            )));
        }
        self.gate.set(ContestStatus::Paused);
        self.persist_status(ContestStatus::Paused);
        info!("contest paused");
        self.hub
            .publish("contest_paused", self.lifecycle_payload());
        Ok(())
    }

    /// PAUSED -> RUNNING. The next ticker fire catches up every base index
    /// skipped while paused.
    pub fn resume(&self) -> Result<(), EngineError> {
        if self.status() != ContestStatus::Paused {
            return Err(EngineError::ContestConflict(format!(
                "cannot resume: contest is {}",
                self.status()
            )));
        }
        self.gate.set(ContestStatus::Running);
        self.persist_status(ContestStatus::Running);
        info!("contest resumed");
        self.hub
            .publish("contest_resumed", self.lifecycle_payload());
        Ok(())
    }

    /// RUNNING/PAUSED -> STOPPED, running the full end-of-contest cleanup.
    /// Errors inside cleanup are reported in the summary, never allowed to
    /// leave the contest stuck.
    pub async fn stop(self: &Arc<Self>) -> Result<CleanupSummary, EngineError> {
        let _stopping = self.stop_lock.lock().await;

        match self.status() {
            ContestStatus::Running | ContestStatus::Paused => {}
            s => {
                return Err(EngineError::ContestConflict(format!(
                    "cannot stop: contest is {s}"
                )))
            }
        }

        // 1. Gate closes (trades now rejected) and the ticker dies. The
        //    ticker only awaits at its interval, so aborting cannot tear a
        //    half-processed base tick.
        self.gate.set(ContestStatus::Stopped);
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.auto_stop.lock().take() {
            handle.abort();
        }

        let contest_id = self
            .contest
            .read()
            .as_ref()
            .map(|c| c.id.clone())
            .unwrap_or_default();

        info!(contest_id = %contest_id, "contest stopping — running cleanup");

        // 2. Square-off, final ranking, wipe, contest_ended event.
        let (summary, _final_top) = cleanup::run(
            &contest_id,
            &self.store,
            &self.portfolios,
            &self.shorts,
            &self.prices,
            &self.cache,
            &self.hub,
        );

        self.current_leaderboard.write().clear();
        self.loader.clear();
        self.persist_status(ContestStatus::Stopped);

        info!(contest_id = %contest_id, "contest stopped");
        Ok(summary)
    }

    fn persist_status(&self, status: ContestStatus) {
        if let Some(c) = self.contest.read().as_ref() {
            if let Err(e) = self.store.update_contest_status(&c.id, status.as_str()) {
                warn!(error = %e, "failed to persist contest status");
            }
        }
    }

    fn lifecycle_payload(&self) -> serde_json::Value {
        let id = self.contest.read().as_ref().map(|c| c.id.clone());
        serde_json::json!({ "contest_id": id })
    }

    // -------------------------------------------------------------------
    // Ticker
    // -------------------------------------------------------------------

    fn spawn_ticker(self: &Arc<Self>) {
        let controller = self.clone();
        let base_secs = self.config.base_interval_secs;

        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(base_secs));
            loop {
                interval.tick().await;

                match controller.gate.status() {
                    ContestStatus::Running => {}
                    ContestStatus::Paused => continue,
                    _ => break,
                }

                if let Err(reason) = controller.advance() {
                    error!(reason = %reason, "base tick failed — stopping contest");
                    let c = controller.clone();
                    // Stop from a fresh task: stop() aborts this one.
                    tokio::spawn(async move {
                        if let Err(e) = c.stop().await {
                            error!(error = %e, "failed to stop contest after tick error");
                        }
                    });
                    break;
                }
            }
        });

        *self.ticker.lock() = Some(handle);
    }

    fn spawn_auto_stop(self: &Arc<Self>) {
        let controller = self.clone();
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_secs(self.config.contest_duration_secs);

        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            info!("contest duration elapsed — auto-stop");
            if let Err(e) = controller.stop().await {
                warn!(error = %e, "auto-stop found no contest to stop");
            }
        });

        *self.auto_stop.lock() = Some(handle);
    }

    /// Process every base index due as of now. Catch-up covers indices
    /// skipped during a pause so candle sequences stay gap-free.
    fn advance(self: &Arc<Self>) -> Result<(), String> {
        let contest = match self.contest.read().clone() {
            Some(c) => c,
            None => return Err("no active contest".into()),
        };

        let k_now = contest.clock.base_index(contest.started.elapsed());
        let last = contest
            .clock
            .total_base_ticks()
            .saturating_sub(1)
            .min(k_now);

        while self.next_tick.load(Ordering::SeqCst) <= last {
            let k = self.next_tick.load(Ordering::SeqCst);
            self.process_base_tick(&contest, k)?;
            self.next_tick.store(k + 1, Ordering::SeqCst);

            if (k + 1) % self.config.leaderboard_every_ticks.max(1) == 0 {
                self.refresh_leaderboard();
            }
        }
        Ok(())
    }

    /// One base tick: replay the window's ticks into candles per symbol,
    /// publish candle / symbol_tick / market_tick events, then keep the
    /// loader ahead of the replay position.
    pub(crate) fn process_base_tick(
        self: &Arc<Self>,
        contest: &ActiveContest,
        k: u64,
    ) -> Result<(), String> {
        if let Some(err) = self.loader.take_load_error() {
            return Err(format!("tick window load failed: {err}"));
        }

        let (w_lo, w_hi) = contest.clock.window(k);
        let bucket = (k * contest.clock.base_interval_secs) as f64;
        let progress = contest.clock.progress(k);
        let now_ms = Utc::now().timestamp_millis();

        let mut prices_payload = serde_json::Map::new();
        let mut tick_updates = 0usize;

        for symbol in &contest.symbols {
            let ticks = self.loader.ticks_in_range(symbol, w_lo, w_hi);
            tick_updates += ticks.len();

            let emitted = self.cache.ingest_base(&self.prices, symbol, bucket, &ticks);
            for candle in &emitted {
                self.hub.publish(
                    &format!("candles:{}:{}", candle.symbol, candle.timeframe),
                    serde_json::json!({
                        "symbol": candle.symbol,
                        "timeframe": candle.timeframe,
                        "candle": candle,
                        "is_new": true,
                    }),
                );
            }

            let base = &emitted[0];
            prices_payload.insert(symbol.clone(), serde_json::json!(base.close));
            self.hub.publish(
                "symbol_tick",
                serde_json::json!({
                    "symbol": symbol,
                    "last_traded_price": base.close,
                    "volume": base.volume,
                    "timestamp": now_ms,
                    "progress": progress,
                    "universal_time": w_hi,
                    "tick_index": k,
                }),
            );
        }

        self.hub.publish(
            "market_tick",
            serde_json::json!({
                "universal_time": w_hi,
                "total_time": contest.clock.duration_secs * 1000,
                "timestamp": now_ms,
                "prices": prices_payload,
                "progress": progress,
                "elapsed_ms": contest.clock.elapsed_ms(k),
                "tick_updates": tick_updates,
            }),
        );

        self.loader.maybe_load_next(w_hi);
        Ok(())
    }

    // -------------------------------------------------------------------
    // Leaderboard
    // -------------------------------------------------------------------

    /// Recompute and publish the ranking. A failure is logged and skipped;
    /// the next refresh retries.
    pub fn refresh_leaderboard(&self) {
        self.shorts.mark_to_market(&self.prices);
        self.portfolios.revalue_all(&self.prices, &self.shorts);

        let board = leaderboard::build(&self.portfolios, &self.shorts, &self.prices);
        let snapshot: Vec<LeaderboardEntry> =
            board.iter().take(SNAPSHOT_TOP_N).cloned().collect();
        let broadcast: Vec<LeaderboardEntry> =
            board.iter().take(BROADCAST_TOP_N).cloned().collect();

        if let Some(c) = self.contest.read().as_ref() {
            match serde_json::to_string(&snapshot) {
                Ok(json) => {
                    if let Err(e) = self.store.save_leaderboard_snapshot(&c.id, &json) {
                        warn!(error = %e, "leaderboard snapshot persist failed — skipping");
                    }
                }
                Err(e) => warn!(error = %e, "leaderboard snapshot serialise failed"),
            }
        }

        *self.current_leaderboard.write() = snapshot;
        self.hub
            .publish("leaderboard", serde_json::json!(broadcast));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tick;

    fn tick(symbol: &str, ts: i64, px: f64) -> Tick {
        Tick {
            symbol: symbol.into(),
            timestamp_ms: ts,
            open: px,
            high: px,
            low: px,
            close: px,
            ltp: px,
            volume: 1.0,
        }
    }

    fn controller_with_corpus(duration_secs: u64) -> Arc<ContestController> {
        let store = Arc::new(Store::in_memory().unwrap());

        // 5 hours of corpus, one tick per symbol per 30 market-seconds.
        let mut ticks = Vec::new();
        let mut ts = 0i64;
        while ts < 5 * 3_600_000 {
            ticks.push(tick("RELIANCE", ts, 2500.0 + (ts % 7) as f64));
            ticks.push(tick("TCS", ts, 3900.0 + (ts % 5) as f64));
            ts += 30_000;
        }
        store.insert_ticks(&ticks).unwrap();

        let mut config = RuntimeConfig::default();
        config.contest_duration_secs = duration_secs;
        config.symbols = vec!["RELIANCE".into(), "TCS".into()];

        let loader = Arc::new(TickWindowLoader::new(
            store.clone(),
            config.window_ms(),
            config.preload_buffer_ms(),
            config.tick_page_size as i64,
            config.symbol_scan_rows as i64,
            config.symbol_scan_min_symbols,
            config.min_data_span_hours,
        ));
        let cache = Arc::new(CandleCache::new(config.max_candles_per_key));
        let prices = Arc::new(PriceIndex::new());
        let hub = Arc::new(FanoutHub::new());
        let portfolios = Arc::new(PortfolioStore::new(store.clone(), config.seed_cash));
        let shorts = Arc::new(ShortPositionStore::new());
        let gate = Arc::new(ContestGate::new());

        Arc::new(ContestController::new(
            config, store, loader, cache, prices, hub, portfolios, shorts, gate,
        ))
    }

    #[tokio::test]
    async fn start_transitions_and_publishes_prices() {
        let c = controller_with_corpus(3600);
        assert_eq!(c.status(), ContestStatus::Idle);

        let contest_id = c.start().unwrap();
        assert!(!contest_id.is_empty());
        assert_eq!(c.status(), ContestStatus::Running);

        // The spawned ticker's first fire is immediate; give it a moment.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        // Every contest symbol has a price from the first base tick onward.
        assert!(c.prices.get("RELIANCE").is_some());
        assert!(c.prices.get("TCS").is_some());
        assert!(c.cache.count(&crate::market_data::CandleKey::new("RELIANCE", "5s")) >= 1);

        c.stop().await.unwrap();
        assert_eq!(c.status(), ContestStatus::Stopped);
    }

    #[tokio::test]
    async fn start_twice_conflicts() {
        let c = controller_with_corpus(3600);
        c.start().unwrap();
        let err = c.start().unwrap_err();
        assert_eq!(err.code(), "CONTEST_CONFLICT");
        c.stop().await.unwrap();
    }

    #[tokio::test]
    async fn pause_resume_stop_transitions() {
        let c = controller_with_corpus(3600);

        assert_eq!(c.pause().unwrap_err().code(), "CONTEST_CONFLICT");

        c.start().unwrap();
        c.pause().unwrap();
        assert_eq!(c.status(), ContestStatus::Paused);
        assert_eq!(c.pause().unwrap_err().code(), "CONTEST_CONFLICT");

        c.resume().unwrap();
        assert_eq!(c.status(), ContestStatus::Running);
        assert_eq!(c.resume().unwrap_err().code(), "CONTEST_CONFLICT");

        c.stop().await.unwrap();
        assert_eq!(c.status(), ContestStatus::Stopped);
        assert_eq!(c.stop().await.unwrap_err().code(), "CONTEST_CONFLICT");
    }

    #[tokio::test]
    async fn stop_without_contest_conflicts() {
        let c = controller_with_corpus(3600);
        assert_eq!(c.stop().await.unwrap_err().code(), "CONTEST_CONFLICT");
    }

    #[tokio::test]
    async fn restart_after_stop_is_allowed() {
        let c = controller_with_corpus(3600);
        c.start().unwrap();
        c.stop().await.unwrap();

        let second = c.start().unwrap();
        assert!(!second.is_empty());
        assert_eq!(c.status(), ContestStatus::Running);
        c.stop().await.unwrap();
    }

    #[tokio::test]
    async fn catch_up_emits_gap_free_base_sequence() {
        let c = controller_with_corpus(3600);
        c.start().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // Drive several base indices by hand, as if ticks had been missed.
        let contest = c.active_contest().unwrap();
        let from = c.next_tick.load(Ordering::SeqCst);
        for k in from..from + 5 {
            c.process_base_tick(&contest, k).unwrap();
            c.next_tick.store(k + 1, Ordering::SeqCst);
        }

        let series = c
            .cache
            .series(&crate::market_data::CandleKey::new("RELIANCE", "5s"), 100);
        assert!(series.len() >= 5);
        for pair in series.windows(2) {
            assert!(
                (pair[1].bucket_start_seconds - pair[0].bucket_start_seconds - 5.0).abs() < 0.001
            );
        }

        c.stop().await.unwrap();
    }

    #[tokio::test]
    async fn state_snapshot_reports_contest_fields() {
        let c = controller_with_corpus(3600);
        let snap = c.state_snapshot();
        assert_eq!(snap["status"], "IDLE");

        c.start().unwrap();
        let snap = c.state_snapshot();
        assert_eq!(snap["status"], "RUNNING");
        assert_eq!(snap["duration_secs"], 3600);
        assert!(snap["compression_ratio"].as_f64().unwrap() > 0.0);

        c.stop().await.unwrap();
        let snap = c.state_snapshot();
        assert_eq!(snap["status"], "STOPPED");
    }
}
