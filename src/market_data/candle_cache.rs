// =============================================================================
// Candle Cache — base-candle construction and cascading aggregation
// =============================================================================
//
// Builds one base-interval candle per symbol per base tick from the tick
// slice of the corresponding market-time window, then cascades fixed-ratio
// aggregations to the higher timeframes of the static table.
//
// Invariants maintained here:
//   - Every (symbol, timeframe) sequence is gap-free: an empty window emits a
//     carry-forward candle whose OHLC all equal the previous close.
//   - Each source candle contributes to exactly one aggregated candle; the
//     per-(symbol, source, target) cursor tracks consumption by absolute
//     emission index so head-trimming never corrupts it.
//   - An aggregation runs only over temporally contiguous source candles
//     (0.5 s tolerance); a detected gap is skipped, never back-filled.
//
// Thread-safety: all mutable state behind `parking_lot::RwLock`. The writer
// is exclusively the contest controller's base-tick loop; readers are the
// candlestick endpoint and new subscribers fetching history.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::market_data::price_index::PriceIndex;
use crate::market_data::timeframes;
use crate::types::Tick;

/// Temporal tolerance for contiguity and alignment checks, seconds.
const BUCKET_TOLERANCE_SECS: f64 = 0.5;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle of any timeframe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timeframe: String,
    pub symbol: String,
    /// Seconds since contest start; always a multiple of the timeframe's
    /// real-seconds interval.
    pub bucket_start_seconds: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub tick_count: u64,
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub timeframe: String,
}

impl CandleKey {
    pub fn new(symbol: &str, timeframe: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// Ring of candles plus the count of candles ever emitted for the key, so
/// aggregation cursors can address candles by absolute index even after the
/// head has been trimmed.
struct Series {
    candles: VecDeque<Candle>,
    total_emitted: u64,
}

impl Series {
    fn new() -> Self {
        Self {
            candles: VecDeque::new(),
            total_emitted: 0,
        }
    }

    /// Absolute index of the first candle still held.
    fn start_abs(&self) -> u64 {
        self.total_emitted - self.candles.len() as u64
    }
}

/// Cursor key for one (symbol, source timeframe, target timeframe) pair.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct AggCursorKey {
    symbol: String,
    source: String,
    target: String,
}

// ---------------------------------------------------------------------------
// CandleCache
// ---------------------------------------------------------------------------

/// Thread-safe candle store and aggregator for every (symbol, timeframe).
pub struct CandleCache {
    buffers: RwLock<HashMap<CandleKey, Series>>,
    /// Absolute count of source candles already consumed per aggregation pair.
    cursors: RwLock<HashMap<AggCursorKey, u64>>,
    max_candles: usize,
}

impl CandleCache {
    /// Create a cache that retains at most `max_candles` per key, trimming
    /// from the head when exceeded.
    pub fn new(max_candles: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            cursors: RwLock::new(HashMap::new()),
            max_candles,
        }
    }

    // -------------------------------------------------------------------
    // Base ingestion
    // -------------------------------------------------------------------

    /// Build and store the base candle for one symbol and one base bucket,
    /// update the price index, and run the aggregation cascade.
    ///
    /// Returns every candle emitted by this call — the base candle first,
    /// then any aggregated candles in cascade order — for fan-out publishing.
    pub fn ingest_base(
        &self,
        price_index: &PriceIndex,
        symbol: &str,
        bucket_start_seconds: f64,
        ticks: &[Tick],
    ) -> Vec<Candle> {
        let base = if ticks.is_empty() {
            // Carry-forward: previous close, else the current index price for
            // the symbol, else zero for a symbol that has never traded.
            let prev_close = self
                .last_candle(&CandleKey::new(symbol, timeframes::BASE))
                .map(|c| c.close)
                .or_else(|| price_index.get(symbol))
                .unwrap_or(0.0);

            Candle {
                timeframe: timeframes::BASE.to_string(),
                symbol: symbol.to_string(),
                bucket_start_seconds,
                open: prev_close,
                high: prev_close,
                low: prev_close,
                close: prev_close,
                volume: 0.0,
                tick_count: 0,
            }
        } else {
            // Source ticks collapse OHLC to the last traded price, so the bar
            // shape comes from the sequence of closes inside the window.
            let closes: Vec<f64> = ticks.iter().map(|t| t.close).collect();
            let open = closes[0];
            let close = *closes.last().unwrap();
            let high = closes.iter().cloned().fold(f64::MIN, f64::max);
            let low = closes.iter().cloned().fold(f64::MAX, f64::min);
            let volume = ticks.iter().map(|t| t.volume).sum();

            Candle {
                timeframe: timeframes::BASE.to_string(),
                symbol: symbol.to_string(),
                bucket_start_seconds,
                open,
                high,
                low,
                close,
                volume,
                tick_count: ticks.len() as u64,
            }
        };

        price_index.set(symbol, base.close);
        self.store(base.clone());

        let mut emitted = vec![base];
        self.cascade(symbol, timeframes::BASE, &mut emitted);
        emitted
    }

    // -------------------------------------------------------------------
    // Aggregation cascade
    // -------------------------------------------------------------------

    /// Attempt every aggregation whose source is `source_key`, recursing into
    /// timeframes sourced from the newly produced ones.
    fn cascade(&self, symbol: &str, source_key: &str, emitted: &mut Vec<Candle>) {
        for target in timeframes::targets_of(source_key) {
            let produced = self.aggregate_ready(symbol, source_key, target.key);
            if !produced.is_empty() {
                emitted.extend(produced.iter().cloned());
                self.cascade(symbol, target.key, emitted);
            }
        }
    }

    /// Emit every aggregated candle that is ready for one (symbol, source,
    /// target) pair. Normally at most one candle is ready per base tick, but
    /// recovery after a skipped gap can momentarily make more available.
    fn aggregate_ready(&self, symbol: &str, source_key: &str, target_key: &str) -> Vec<Candle> {
        let target = match timeframes::get(target_key) {
            Some(tf) => tf,
            None => return Vec::new(),
        };
        let (_, count) = match target.source {
            Some(src) => src,
            None => return Vec::new(),
        };
        let source_secs = match timeframes::interval_seconds(source_key) {
            Some(s) => s as f64,
            None => return Vec::new(),
        };
        let target_secs = target.real_seconds as f64;

        let cursor_key = AggCursorKey {
            symbol: symbol.to_string(),
            source: source_key.to_string(),
            target: target_key.to_string(),
        };
        let source_series_key = CandleKey::new(symbol, source_key);

        let mut out = Vec::new();
        let mut cursor = self.cursors.read().get(&cursor_key).copied().unwrap_or(0);

        loop {
            let step = {
                let buffers = self.buffers.read();
                let series = match buffers.get(&source_series_key) {
                    Some(s) => s,
                    None => break,
                };

                let start_abs = series.start_abs();
                if cursor < start_abs {
                    cursor = start_abs;
                }

                // Skip source candles left unaligned by a previous gap skip:
                // an aggregated bucket must start on a multiple of the target
                // interval.
                while cursor < series.total_emitted {
                    let c = &series.candles[(cursor - start_abs) as usize];
                    if aligned(c.bucket_start_seconds, target_secs) {
                        break;
                    }
                    cursor += 1;
                }

                if series.total_emitted - cursor < count as u64 {
                    None
                } else {
                    let lo = (cursor - start_abs) as usize;
                    let window: Vec<Candle> = series
                        .candles
                        .iter()
                        .skip(lo)
                        .take(count)
                        .cloned()
                        .collect();

                    match first_break(&window, source_secs) {
                        None => Some(Ok(window)),
                        Some(i) => Some(Err(i)),
                    }
                }
            };

            match step {
                None => break,
                Some(Ok(window)) => {
                    let agg = fold_candles(target_key, symbol, &window);
                    self.store(agg.clone());
                    out.push(agg);
                    cursor += count as u64;
                }
                Some(Err(break_at)) => {
                    // Gap: drop everything up to and including the candle
                    // before the break. The bucket spanning the gap is never
                    // produced; alignment skipping resumes at the next
                    // target-interval boundary.
                    cursor += break_at as u64 + 1;
                }
            }
        }

        self.cursors.write().insert(cursor_key, cursor);
        out
    }

    // -------------------------------------------------------------------
    // Storage and queries
    // -------------------------------------------------------------------

    /// Append a candle to its series, trimming the head past the cap.
    fn store(&self, candle: Candle) {
        let key = CandleKey::new(&candle.symbol, &candle.timeframe);
        let mut buffers = self.buffers.write();
        let series = buffers.entry(key).or_insert_with(Series::new);
        series.candles.push_back(candle);
        series.total_emitted += 1;
        while series.candles.len() > self.max_candles {
            series.candles.pop_front();
        }
    }

    /// The most recent candle for a key, if any.
    pub fn last_candle(&self, key: &CandleKey) -> Option<Candle> {
        self.buffers.read().get(key)?.candles.back().cloned()
    }

    /// The most recent `limit` candles for a key, oldest-first.
    pub fn series(&self, key: &CandleKey, limit: usize) -> Vec<Candle> {
        let buffers = self.buffers.read();
        match buffers.get(key) {
            Some(series) => {
                let skip = series.candles.len().saturating_sub(limit);
                series.candles.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Number of candles currently held for a key.
    pub fn count(&self, key: &CandleKey) -> usize {
        self.buffers.read().get(key).map_or(0, |s| s.candles.len())
    }

    /// Drop every series and cursor. Called when contest state is wiped.
    pub fn clear(&self) {
        self.buffers.write().clear();
        self.cursors.write().clear();
    }
}

/// `bucket` sits on a multiple of `interval` (within tolerance).
fn aligned(bucket: f64, interval: f64) -> bool {
    let rem = bucket.rem_euclid(interval);
    rem < BUCKET_TOLERANCE_SECS || (interval - rem) < BUCKET_TOLERANCE_SECS
}

/// Index of the first candle whose successor is not exactly one source
/// interval later, or `None` if the window is contiguous.
fn first_break(window: &[Candle], source_secs: f64) -> Option<usize> {
    for i in 0..window.len().saturating_sub(1) {
        let expected = window[i].bucket_start_seconds + source_secs;
        if (window[i + 1].bucket_start_seconds - expected).abs() > BUCKET_TOLERANCE_SECS {
            return Some(i);
        }
    }
    None
}

/// Fold `window` (contiguous, non-empty) into one candle of `target_key`.
fn fold_candles(target_key: &str, symbol: &str, window: &[Candle]) -> Candle {
    Candle {
        timeframe: target_key.to_string(),
        symbol: symbol.to_string(),
        bucket_start_seconds: window[0].bucket_start_seconds,
        open: window[0].open,
        high: window.iter().map(|c| c.high).fold(f64::MIN, f64::max),
        low: window.iter().map(|c| c.low).fold(f64::MAX, f64::min),
        close: window.last().unwrap().close,
        volume: window.iter().map(|c| c.volume).sum(),
        tick_count: window.iter().map(|c| c.tick_count).sum(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, ts_ms: i64, px: f64, vol: f64) -> Tick {
        Tick {
            symbol: symbol.into(),
            timestamp_ms: ts_ms,
            open: px,
            high: px,
            low: px,
            close: px,
            ltp: px,
            volume: vol,
        }
    }

    fn base_candle(symbol: &str, bucket: f64, px: f64) -> Candle {
        Candle {
            timeframe: "5s".into(),
            symbol: symbol.into(),
            bucket_start_seconds: bucket,
            open: px,
            high: px + 1.0,
            low: px - 1.0,
            close: px,
            volume: 10.0,
            tick_count: 5,
        }
    }

    #[test]
    fn base_candle_shape_from_tick_closes() {
        let cache = CandleCache::new(100);
        let idx = PriceIndex::new();
        let ticks = vec![
            tick("RELIANCE", 0, 2500.0, 10.0),
            tick("RELIANCE", 1000, 2510.0, 5.0),
            tick("RELIANCE", 2000, 2495.0, 7.0),
            tick("RELIANCE", 3000, 2505.0, 3.0),
        ];

        let emitted = cache.ingest_base(&idx, "RELIANCE", 0.0, &ticks);
        assert_eq!(emitted.len(), 1);
        let c = &emitted[0];
        assert_eq!(c.open, 2500.0);
        assert_eq!(c.close, 2505.0);
        assert_eq!(c.high, 2510.0);
        assert_eq!(c.low, 2495.0);
        assert_eq!(c.volume, 25.0);
        assert_eq!(c.tick_count, 4);
        assert!(c.low <= c.open.min(c.close));
        assert!(c.high >= c.open.max(c.close));

        assert_eq!(idx.get("RELIANCE"), Some(2505.0));
    }

    #[test]
    fn carry_forward_uses_previous_close() {
        let cache = CandleCache::new(100);
        let idx = PriceIndex::new();

        cache.ingest_base(&idx, "TCS", 0.0, &[tick("TCS", 0, 3900.0, 1.0)]);
        let emitted = cache.ingest_base(&idx, "TCS", 5.0, &[]);

        let c = &emitted[0];
        assert_eq!(c.open, 3900.0);
        assert_eq!(c.high, 3900.0);
        assert_eq!(c.low, 3900.0);
        assert_eq!(c.close, 3900.0);
        assert_eq!(c.volume, 0.0);
        assert_eq!(c.tick_count, 0);
    }

    #[test]
    fn carry_forward_first_bucket_falls_back_to_price_index() {
        let cache = CandleCache::new(100);
        let idx = PriceIndex::new();
        idx.set("INFY", 1500.0);

        let emitted = cache.ingest_base(&idx, "INFY", 0.0, &[]);
        assert_eq!(emitted[0].close, 1500.0);

        // A symbol with no price at all falls back to zero.
        let emitted = cache.ingest_base(&idx, "WIPRO", 0.0, &[]);
        assert_eq!(emitted[0].close, 0.0);
    }

    #[test]
    fn base_sequence_is_gap_free() {
        let cache = CandleCache::new(100);
        let idx = PriceIndex::new();

        for k in 0..10u64 {
            let bucket = k as f64 * 5.0;
            let ticks = if k % 3 == 0 {
                vec![tick("SBIN", (bucket * 1000.0) as i64, 600.0 + k as f64, 1.0)]
            } else {
                Vec::new()
            };
            cache.ingest_base(&idx, "SBIN", bucket, &ticks);
        }

        let series = cache.series(&CandleKey::new("SBIN", "5s"), 100);
        assert_eq!(series.len(), 10);
        for pair in series.windows(2) {
            assert!(
                (pair[1].bucket_start_seconds - pair[0].bucket_start_seconds - 5.0).abs() < 0.001
            );
        }
    }

    #[test]
    fn cascade_aggregates_six_base_into_one_30s() {
        let cache = CandleCache::new(100);
        let idx = PriceIndex::new();

        let mut all_emitted = Vec::new();
        for k in 0..6u64 {
            let bucket = k as f64 * 5.0;
            let px = 100.0 + k as f64;
            let ticks = vec![tick("HDFC", (bucket * 1000.0) as i64, px, 2.0)];
            all_emitted.extend(cache.ingest_base(&idx, "HDFC", bucket, &ticks));
        }

        let thirty: Vec<&Candle> = all_emitted
            .iter()
            .filter(|c| c.timeframe == "30s")
            .collect();
        assert_eq!(thirty.len(), 1);
        let agg = thirty[0];
        assert_eq!(agg.bucket_start_seconds, 0.0);
        assert_eq!(agg.open, 100.0);
        assert_eq!(agg.close, 105.0);
        assert_eq!(agg.high, 105.0);
        assert_eq!(agg.low, 100.0);
        assert_eq!(agg.volume, 12.0);
        assert_eq!(agg.tick_count, 6);
    }

    #[test]
    fn full_cascade_reaches_five_minutes() {
        let cache = CandleCache::new(2000);
        let idx = PriceIndex::new();

        // 300 seconds of base candles = 60 base ticks = one full 5m bucket.
        for k in 0..60u64 {
            let bucket = k as f64 * 5.0;
            let ticks = vec![tick("ITC", (bucket * 1000.0) as i64, 400.0 + k as f64, 1.0)];
            cache.ingest_base(&idx, "ITC", bucket, &ticks);
        }

        assert_eq!(cache.count(&CandleKey::new("ITC", "30s")), 10);
        assert_eq!(cache.count(&CandleKey::new("ITC", "1m")), 5);
        assert_eq!(cache.count(&CandleKey::new("ITC", "3m")), 1);
        assert_eq!(cache.count(&CandleKey::new("ITC", "5m")), 1);

        let five = cache
            .last_candle(&CandleKey::new("ITC", "5m"))
            .expect("5m candle");
        assert_eq!(five.open, 400.0);
        assert_eq!(five.close, 459.0);
        assert_eq!(five.tick_count, 60);
    }

    #[test]
    fn each_source_candle_contributes_exactly_once() {
        let cache = CandleCache::new(1000);
        let idx = PriceIndex::new();

        for k in 0..24u64 {
            let bucket = k as f64 * 5.0;
            let ticks = vec![tick("LT", (bucket * 1000.0) as i64, 3000.0, 1.0)];
            cache.ingest_base(&idx, "LT", bucket, &ticks);
        }

        // 24 base candles -> four 30s candles; total volume must be conserved.
        let thirty = cache.series(&CandleKey::new("LT", "30s"), 100);
        assert_eq!(thirty.len(), 4);
        let total: f64 = thirty.iter().map(|c| c.volume).sum();
        assert_eq!(total, 24.0);
        let buckets: Vec<f64> = thirty.iter().map(|c| c.bucket_start_seconds).collect();
        assert_eq!(buckets, vec![0.0, 30.0, 60.0, 90.0]);
    }

    #[test]
    fn gap_skips_spanning_bucket_and_recovers_at_next_boundary() {
        let cache = CandleCache::new(100);

        // Source candles with the t=15 bucket missing, then a clean run from
        // t=30. The [0,30) bucket must never be produced; [30,60) must be.
        for bucket in [0.0, 5.0, 10.0, 20.0, 25.0] {
            cache.store(base_candle("ADANIENT", bucket, 2500.0));
        }
        for k in 6..12u64 {
            cache.store(base_candle("ADANIENT", k as f64 * 5.0, 2400.0));
        }

        let produced = cache.aggregate_ready("ADANIENT", "5s", "30s");
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].bucket_start_seconds, 30.0);
        assert_eq!(produced[0].tick_count, 30);
    }

    #[test]
    fn ring_trims_head_at_cap() {
        let cache = CandleCache::new(3);
        let idx = PriceIndex::new();

        for k in 0..5u64 {
            cache.ingest_base(
                &idx,
                "TATASTEEL",
                k as f64 * 5.0,
                &[tick("TATASTEEL", 0, 100.0 + k as f64, 1.0)],
            );
        }

        let key = CandleKey::new("TATASTEEL", "5s");
        assert_eq!(cache.count(&key), 3);
        let series = cache.series(&key, 10);
        assert_eq!(series[0].close, 102.0);
        assert_eq!(series[2].close, 104.0);
    }
}
