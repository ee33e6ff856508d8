// =============================================================================
// Runtime Configuration — contest engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Tick Arena engine.  Every tunable lives
// here so an operator can adjust contest parameters between runs without a
// rebuild.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_db_path() -> String {
    "arena.db".to_string()
}

fn default_contest_duration_secs() -> u64 {
    3600
}

fn default_base_interval_secs() -> u64 {
    5
}

fn default_window_minutes() -> u64 {
    10
}

fn default_preload_buffer_minutes() -> u64 {
    2
}

fn default_seed_cash() -> f64 {
    1_000_000.0
}

fn default_leaderboard_every_ticks() -> u64 {
    6
}

fn default_min_data_span_hours() -> u64 {
    4
}

fn default_max_candles_per_key() -> usize {
    1000
}

fn default_symbol_scan_rows() -> u64 {
    20_000
}

fn default_symbol_scan_min_symbols() -> usize {
    15
}

fn default_tick_page_size() -> u64 {
    10_000
}

fn default_subscriber_queue_capacity() -> usize {
    256
}

fn default_timeframe() -> String {
    "5s".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Tick Arena engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Server --------------------------------------------------------------

    /// Address the REST/WebSocket server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Path of the SQLite database holding ticks, users, and contest state.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    // --- Contest shape -------------------------------------------------------

    /// Real-time length of a contest in seconds.
    #[serde(default = "default_contest_duration_secs")]
    pub contest_duration_secs: u64,

    /// Base candle interval in real seconds. Everything cascades from this.
    #[serde(default = "default_base_interval_secs")]
    pub base_interval_secs: u64,

    /// Cash every portfolio is seeded with (and reset to after cleanup).
    #[serde(default = "default_seed_cash")]
    pub seed_cash: f64,

    /// Leaderboard refresh cadence, measured in base ticks.
    #[serde(default = "default_leaderboard_every_ticks")]
    pub leaderboard_every_ticks: u64,

    // --- Replay / loader -----------------------------------------------------

    /// Market-time span of the in-memory tick window, minutes.
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u64,

    /// When the replay position is within this many market-time minutes of the
    /// window end, the next window is preloaded in the background.
    #[serde(default = "default_preload_buffer_minutes")]
    pub preload_buffer_minutes: u64,

    /// Minimum market-time span the corpus must cover for a contest to start.
    #[serde(default = "default_min_data_span_hours")]
    pub min_data_span_hours: u64,

    /// Rows fetched per storage page while loading a window.
    #[serde(default = "default_tick_page_size")]
    pub tick_page_size: u64,

    /// Rows sampled during symbol-universe discovery.
    #[serde(default = "default_symbol_scan_rows")]
    pub symbol_scan_rows: u64,

    /// Discovery stops early once this many distinct symbols are seen.
    #[serde(default = "default_symbol_scan_min_symbols")]
    pub symbol_scan_min_symbols: usize,

    // --- Candle cache / fan-out ----------------------------------------------

    /// Candles retained per (symbol, timeframe) key before head-trimming.
    #[serde(default = "default_max_candles_per_key")]
    pub max_candles_per_key: usize,

    /// Outbound queue bound per WebSocket subscriber; slower clients are
    /// disconnected rather than allowed to stall the publisher.
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,

    /// Timeframe served when a candlestick request names none.
    #[serde(default = "default_timeframe")]
    pub default_timeframe: String,

    /// Optional symbol-universe override. Empty means discover from storage.
    #[serde(default)]
    pub symbols: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            contest_duration_secs: default_contest_duration_secs(),
            base_interval_secs: default_base_interval_secs(),
            seed_cash: default_seed_cash(),
            leaderboard_every_ticks: default_leaderboard_every_ticks(),
            window_minutes: default_window_minutes(),
            preload_buffer_minutes: default_preload_buffer_minutes(),
            min_data_span_hours: default_min_data_span_hours(),
            tick_page_size: default_tick_page_size(),
            symbol_scan_rows: default_symbol_scan_rows(),
            symbol_scan_min_symbols: default_symbol_scan_min_symbols(),
            max_candles_per_key: default_max_candles_per_key(),
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            default_timeframe: default_timeframe(),
            symbols: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            duration_secs = config.contest_duration_secs,
            base_interval_secs = config.base_interval_secs,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Market-time window span in milliseconds.
    pub fn window_ms(&self) -> i64 {
        (self.window_minutes * 60 * 1000) as i64
    }

    /// Preload buffer in milliseconds of market time.
    pub fn preload_buffer_ms(&self) -> i64 {
        (self.preload_buffer_minutes * 60 * 1000) as i64
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.contest_duration_secs, 3600);
        assert_eq!(cfg.base_interval_secs, 5);
        assert!((cfg.seed_cash - 1_000_000.0).abs() < f64::EPSILON);
        assert_eq!(cfg.leaderboard_every_ticks, 6);
        assert_eq!(cfg.window_minutes, 10);
        assert_eq!(cfg.preload_buffer_minutes, 2);
        assert_eq!(cfg.min_data_span_hours, 4);
        assert_eq!(cfg.max_candles_per_key, 1000);
        assert!(cfg.symbols.is_empty());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.contest_duration_secs, 3600);
        assert_eq!(cfg.default_timeframe, "5s");
        assert_eq!(cfg.tick_page_size, 10_000);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "contest_duration_secs": 1800, "symbols": ["RELIANCE"] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.contest_duration_secs, 1800);
        assert_eq!(cfg.symbols, vec!["RELIANCE"]);
        assert_eq!(cfg.base_interval_secs, 5);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.contest_duration_secs, cfg2.contest_duration_secs);
        assert_eq!(cfg.db_path, cfg2.db_path);
        assert_eq!(cfg.max_candles_per_key, cfg2.max_candles_per_key);
    }

    #[test]
    fn save_then_load_roundtrip_on_disk() {
        let path =
            std::env::temp_dir().join(format!("arena-config-{}.json", std::process::id()));

        let mut cfg = RuntimeConfig::default();
        cfg.contest_duration_secs = 1800;
        cfg.symbols = vec!["RELIANCE".into()];
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.contest_duration_secs, 1800);
        assert_eq!(loaded.symbols, vec!["RELIANCE"]);

        // The tmp sibling from the atomic write must not linger.
        assert!(!path.with_extension("json.tmp").exists());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn window_conversions() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.window_ms(), 600_000);
        assert_eq!(cfg.preload_buffer_ms(), 120_000);
    }
}
