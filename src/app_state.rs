// =============================================================================
// Central Application State — Tick Arena contest engine
// =============================================================================
//
// The single source of truth wiring every subsystem together. All subsystems
// hold Arc references; AppState owns the construction order and hands the API
// layer one handle to everything.
//
// Thread safety:
//   - parking_lot::RwLock guards every mutable shared collection.
//   - Per-user trade serialization lives in the portfolio store's keyed
//     mutex registry.
//   - Subsystem engines manage their own interior mutability behind Arc.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;

use crate::contest::controller::ContestController;
use crate::contest::ContestGate;
use crate::fanout::FanoutHub;
use crate::market_data::candle_cache::CandleCache;
use crate::market_data::price_index::PriceIndex;
use crate::market_data::tick_loader::TickWindowLoader;
use crate::runtime_config::RuntimeConfig;
use crate::storage::Store;
use crate::trading::executor::TradeExecutor;
use crate::trading::portfolio::PortfolioStore;
use crate::trading::shorts::ShortPositionStore;

/// Shared state for the whole engine, passed to every handler as
/// `Arc<AppState>`.
pub struct AppState {
    pub config: RuntimeConfig,
    pub store: Arc<Store>,
    pub loader: Arc<TickWindowLoader>,
    pub candle_cache: Arc<CandleCache>,
    pub price_index: Arc<PriceIndex>,
    pub hub: Arc<FanoutHub>,
    pub portfolios: Arc<PortfolioStore>,
    pub shorts: Arc<ShortPositionStore>,
    pub gate: Arc<ContestGate>,
    pub controller: Arc<ContestController>,
    pub executor: Arc<TradeExecutor>,

    /// Instant when the engine was started, for uptime reporting.
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct the full subsystem graph from the given configuration.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let store = Arc::new(Store::open(&config.db_path)?);
        Self::with_store(config, store)
    }

    /// Construction against an existing store (tests use in-memory SQLite).
    pub fn with_store(config: RuntimeConfig, store: Arc<Store>) -> Result<Self> {
        let loader = Arc::new(TickWindowLoader::new(
            store.clone(),
            config.window_ms(),
            config.preload_buffer_ms(),
            config.tick_page_size as i64,
            config.symbol_scan_rows as i64,
            config.symbol_scan_min_symbols,
            config.min_data_span_hours,
        ));
        let candle_cache = Arc::new(CandleCache::new(config.max_candles_per_key));
        let price_index = Arc::new(PriceIndex::new());
        let hub = Arc::new(FanoutHub::new());
        let portfolios = Arc::new(PortfolioStore::new(store.clone(), config.seed_cash));
        let shorts = Arc::new(ShortPositionStore::new());
        let gate = Arc::new(ContestGate::new());

        let controller = Arc::new(ContestController::new(
            config.clone(),
            store.clone(),
            loader.clone(),
            candle_cache.clone(),
            price_index.clone(),
            hub.clone(),
            portfolios.clone(),
            shorts.clone(),
            gate.clone(),
        ));

        let executor = Arc::new(TradeExecutor::new(
            store.clone(),
            portfolios.clone(),
            shorts.clone(),
            price_index.clone(),
            hub.clone(),
            gate.clone(),
        ));

        Ok(Self {
            config,
            store,
            loader,
            candle_cache,
            price_index,
            hub,
            portfolios,
            shorts,
            gate,
            controller,
            executor,
            start_time: std::time::Instant::now(),
        })
    }
}
