// =============================================================================
// Tick Window Loader — sliding market-time window over the tick corpus
// =============================================================================
//
// Keeps one window (nominally 10 minutes of market time) of ticks in memory,
// grouped per symbol and sorted by timestamp, with a per-symbol cursor at the
// first unconsumed tick. Callers consume ranges with non-decreasing lower
// bounds, so the cursor only ever moves forward within a window.
//
// When the replay position nears the window end, the next window is loaded in
// the background; at most one load is in flight. A storage error during a
// load is not retried — it is parked for the controller, which stops the
// contest cleanly.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::storage::Store;
use crate::types::Tick;

/// What a successful corpus scan reports.
#[derive(Debug, Clone)]
pub struct DataBounds {
    pub symbols: Vec<String>,
    pub data_start_ms: i64,
    pub data_end_ms: i64,
}

/// Number of evenly spaced offsets sampled during symbol discovery, so the
/// universe is not biased by storage ordering.
const SCAN_SAMPLE_POINTS: i64 = 5;

struct Window {
    start_ms: i64,
    end_ms: i64,
    ticks: HashMap<String, Vec<Tick>>,
    cursors: HashMap<String, usize>,
}

pub struct TickWindowLoader {
    store: Arc<Store>,
    window_ms: i64,
    preload_buffer_ms: i64,
    page_size: i64,
    scan_rows: i64,
    scan_min_symbols: usize,
    min_span_ms: i64,

    current: RwLock<Option<Window>>,
    next: RwLock<Option<Window>>,
    loading: AtomicBool,
    load_error: Mutex<Option<String>>,
}

impl TickWindowLoader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        window_ms: i64,
        preload_buffer_ms: i64,
        page_size: i64,
        scan_rows: i64,
        scan_min_symbols: usize,
        min_span_hours: u64,
    ) -> Self {
        Self {
            store,
            window_ms,
            preload_buffer_ms,
            page_size,
            scan_rows,
            scan_min_symbols,
            min_span_ms: (min_span_hours * 3600 * 1000) as i64,
            current: RwLock::new(None),
            next: RwLock::new(None),
            loading: AtomicBool::new(false),
            load_error: Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------
    // Corpus scan
    // -------------------------------------------------------------------

    /// Discover the symbol universe and the corpus time bounds.
    ///
    /// Samples several evenly spaced offsets rather than reading from the
    /// head, collecting distinct symbols until enough are seen or the budget
    /// of scanned rows runs out. Fails on an empty corpus or one whose span
    /// is shorter than the configured minimum.
    pub fn initialize(&self) -> Result<DataBounds> {
        let (data_start_ms, data_end_ms) = self
            .store
            .tick_time_bounds()
            .context("scanning tick time bounds")?
            .context("tick corpus is empty")?;

        let span = data_end_ms - data_start_ms;
        if span < self.min_span_ms {
            bail!(
                "tick corpus spans {span} ms, below the required minimum of {} ms",
                self.min_span_ms
            );
        }

        let total_rows = self.store.count_ticks()?;
        let chunk = (self.scan_rows / SCAN_SAMPLE_POINTS).max(1);
        let stride = (total_rows / SCAN_SAMPLE_POINTS).max(chunk);

        let mut seen: HashSet<String> = HashSet::new();
        for i in 0..SCAN_SAMPLE_POINTS {
            let offset = (i * stride).min(total_rows.saturating_sub(1));
            for symbol in self.store.sample_symbols(chunk, offset)? {
                seen.insert(symbol);
            }
            if seen.len() >= self.scan_min_symbols {
                break;
            }
        }

        if seen.is_empty() {
            bail!("no symbols found in tick corpus");
        }

        let mut symbols: Vec<String> = seen.into_iter().collect();
        symbols.sort();

        info!(
            symbols = symbols.len(),
            data_start_ms,
            data_end_ms,
            span_hours = span / 3_600_000,
            "tick corpus scanned"
        );

        Ok(DataBounds {
            symbols,
            data_start_ms,
            data_end_ms,
        })
    }

    // -------------------------------------------------------------------
    // Window loading
    // -------------------------------------------------------------------

    /// Load the window `[start_ms, start_ms + window)` as the current one,
    /// resetting every cursor and discarding any preloaded successor.
    pub fn load_window(&self, start_ms: i64) -> Result<()> {
        let window = self.fetch_window(start_ms)?;
        *self.current.write() = Some(window);
        *self.next.write() = None;
        *self.load_error.lock() = None;
        Ok(())
    }

    fn fetch_window(&self, start_ms: i64) -> Result<Window> {
        let end_ms = start_ms + self.window_ms;
        let mut ticks: HashMap<String, Vec<Tick>> = HashMap::new();
        let mut offset = 0i64;
        let mut rows = 0usize;

        loop {
            let page = self
                .store
                .ticks_in_span(start_ms, end_ms, self.page_size, offset)
                .with_context(|| format!("loading tick window starting at {start_ms}"))?;
            let page_len = page.len();
            rows += page_len;
            for tick in page {
                ticks.entry(tick.symbol.clone()).or_default().push(tick);
            }
            if (page_len as i64) < self.page_size {
                break;
            }
            offset += self.page_size;
        }

        // The cursor contract requires ascending per-symbol order.
        for list in ticks.values_mut() {
            list.sort_by_key(|t| t.timestamp_ms);
        }

        debug!(start_ms, end_ms, rows, symbols = ticks.len(), "tick window loaded");

        Ok(Window {
            start_ms,
            end_ms,
            ticks,
            cursors: HashMap::new(),
        })
    }

    /// If the replay position is within the preload buffer of the current
    /// window's end, load the next window in the background. At most one
    /// load is in flight; further calls while loading are no-ops.
    pub fn maybe_load_next(self: &Arc<Self>, current_market_ms: i64) {
        let next_start = {
            let current = self.current.read();
            let window = match current.as_ref() {
                Some(w) => w,
                None => return,
            };
            if window.end_ms - current_market_ms > self.preload_buffer_ms {
                return;
            }
            window.end_ms
        };

        if self.next.read().is_some() {
            return;
        }
        if self.loading.swap(true, Ordering::SeqCst) {
            return;
        }

        let loader = self.clone();
        tokio::task::spawn_blocking(move || {
            match loader.fetch_window(next_start) {
                Ok(window) => {
                    *loader.next.write() = Some(window);
                }
                Err(e) => {
                    error!(error = %e, "background tick window load failed");
                    *loader.load_error.lock() = Some(e.to_string());
                }
            }
            loader.loading.store(false, Ordering::SeqCst);
        });
    }

    /// A load error parked by a background load, if any. Taking it clears it.
    pub fn take_load_error(&self) -> Option<String> {
        self.load_error.lock().take()
    }

    // -------------------------------------------------------------------
    // Range consumption
    // -------------------------------------------------------------------

    /// Ticks for `symbol` with timestamps in `[t_lo, t_hi)`.
    ///
    /// Advances the symbol's cursor past everything before `t_lo`, collects
    /// contiguous ticks before `t_hi`, and leaves the cursor one past the
    /// last returned tick. Callers must present non-decreasing `t_lo` per
    /// symbol. When the range crosses into a preloaded next window, that
    /// window is promoted and collection continues there.
    pub fn ticks_in_range(&self, symbol: &str, t_lo: i64, t_hi: i64) -> Vec<Tick> {
        let mut out = Vec::new();

        loop {
            let crossed_end = {
                let mut current = self.current.write();
                let window = match current.as_mut() {
                    Some(w) => w,
                    None => return out,
                };

                let ticks = window.ticks.get(symbol).map(Vec::as_slice).unwrap_or(&[]);
                let cursor = window.cursors.entry(symbol.to_string()).or_insert(0);

                while *cursor < ticks.len() && ticks[*cursor].timestamp_ms < t_lo {
                    *cursor += 1;
                }
                while *cursor < ticks.len() && ticks[*cursor].timestamp_ms < t_hi {
                    out.push(ticks[*cursor].clone());
                    *cursor += 1;
                }

                t_hi > window.end_ms
            };

            if !crossed_end {
                return out;
            }

            // The requested range extends past this window; promote the
            // preloaded successor if it is ready, otherwise serve what we
            // have.
            let promoted = {
                let mut next = self.next.write();
                match next.take() {
                    Some(w) => {
                        *self.current.write() = Some(w);
                        true
                    }
                    None => false,
                }
            };
            if !promoted {
                return out;
            }
        }
    }

    /// End of the currently loaded window, if any.
    pub fn current_window_end(&self) -> Option<i64> {
        self.current.read().as_ref().map(|w| w.end_ms)
    }

    /// Drop all loaded windows and cursors.
    pub fn clear(&self) {
        *self.current.write() = None;
        *self.next.write() = None;
        *self.load_error.lock() = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

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

    fn loader_with(store: Arc<Store>, window_ms: i64) -> Arc<TickWindowLoader> {
        Arc::new(TickWindowLoader::new(
            store, window_ms, 120_000, 1000, 20_000, 15, 4,
        ))
    }

    fn seed_span(store: &Store, symbols: &[&str], start_ms: i64, end_ms: i64, step_ms: i64) {
        let mut ticks = Vec::new();
        let mut ts = start_ms;
        while ts < end_ms {
            for (i, sym) in symbols.iter().enumerate() {
                ticks.push(tick(sym, ts, 100.0 + i as f64));
            }
            ts += step_ms;
        }
        store.insert_ticks(&ticks).unwrap();
    }

    #[test]
    fn initialize_reports_bounds_and_symbols() {
        let store = Arc::new(Store::in_memory().unwrap());
        // 5 hours of data, 1 tick per symbol per minute.
        seed_span(&store, &["A", "B", "C"], 0, 5 * 3_600_000, 60_000);

        let loader = loader_with(store, 600_000);
        let bounds = loader.initialize().unwrap();
        assert_eq!(bounds.symbols, vec!["A", "B", "C"]);
        assert_eq!(bounds.data_start_ms, 0);
        assert!(bounds.data_end_ms >= 5 * 3_600_000 - 60_000);
    }

    #[test]
    fn initialize_rejects_short_span() {
        let store = Arc::new(Store::in_memory().unwrap());
        seed_span(&store, &["A"], 0, 3_600_000, 60_000); // 1 hour only

        let loader = loader_with(store, 600_000);
        assert!(loader.initialize().is_err());
    }

    #[test]
    fn initialize_rejects_empty_corpus() {
        let store = Arc::new(Store::in_memory().unwrap());
        let loader = loader_with(store, 600_000);
        assert!(loader.initialize().is_err());
    }

    #[test]
    fn ticks_in_range_advances_cursor() {
        let store = Arc::new(Store::in_memory().unwrap());
        store
            .insert_ticks(&[
                tick("A", 100, 1.0),
                tick("A", 200, 2.0),
                tick("A", 300, 3.0),
                tick("A", 400, 4.0),
            ])
            .unwrap();

        let loader = loader_with(store, 600_000);
        loader.load_window(0).unwrap();

        let first = loader.ticks_in_range("A", 0, 250);
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].timestamp_ms, 200);

        // Cursor sits past 200; the next range picks up from 300.
        let second = loader.ticks_in_range("A", 250, 500);
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].timestamp_ms, 300);

        // Exhausted.
        assert!(loader.ticks_in_range("A", 500, 600).is_empty());
    }

    #[test]
    fn symbol_with_no_ticks_yields_empty() {
        let store = Arc::new(Store::in_memory().unwrap());
        store.insert_ticks(&[tick("A", 100, 1.0)]).unwrap();

        let loader = loader_with(store, 600_000);
        loader.load_window(0).unwrap();
        assert!(loader.ticks_in_range("ZZ", 0, 1000).is_empty());
    }

    #[test]
    fn skipped_ranges_drop_earlier_ticks() {
        let store = Arc::new(Store::in_memory().unwrap());
        store
            .insert_ticks(&[tick("A", 100, 1.0), tick("A", 200, 2.0), tick("A", 900, 3.0)])
            .unwrap();

        let loader = loader_with(store, 600_000);
        loader.load_window(0).unwrap();

        // Jumping straight to [800, 1000) discards the earlier ticks.
        let got = loader.ticks_in_range("A", 800, 1000);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].timestamp_ms, 900);
    }

    #[tokio::test]
    async fn preload_promotes_next_window_across_boundary() {
        let store = Arc::new(Store::in_memory().unwrap());
        // Two windows' worth of data with a 1000 ms window.
        store
            .insert_ticks(&[
                tick("A", 100, 1.0),
                tick("A", 900, 2.0),
                tick("A", 1100, 3.0),
                tick("A", 1900, 4.0),
            ])
            .unwrap();

        let loader = Arc::new(TickWindowLoader::new(
            store, 1000, 500, 1000, 20_000, 15, 0,
        ));
        loader.load_window(0).unwrap();

        // Within the buffer of the window end: schedules the next load.
        loader.maybe_load_next(600);
        // Wait for the background load to land.
        for _ in 0..50 {
            if loader.next.read().is_some() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }
        assert!(loader.next.read().is_some());

        // A range crossing the boundary consumes the promoted window too.
        let got = loader.ticks_in_range("A", 800, 1200);
        let stamps: Vec<i64> = got.iter().map(|t| t.timestamp_ms).collect();
        assert_eq!(stamps, vec![900, 1100]);
        assert_eq!(loader.current_window_end(), Some(2000));
    }
}
