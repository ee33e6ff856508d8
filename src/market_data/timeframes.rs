// =============================================================================
// Timeframe table — base interval and the aggregation cascade
// =============================================================================
//
// The base timeframe is generated directly from ticks; every other timeframe
// names a source timeframe and how many source candles fold into one of its
// own. Aggregation recurses: 30s is built from 5s, 1m from 30s, and 3m/5m
// both from 1m.
// =============================================================================

/// Definition of a single candle timeframe.
#[derive(Debug, Clone, Copy)]
pub struct TimeframeDef {
    /// Wire key, e.g. `"30s"`.
    pub key: &'static str,
    /// Real seconds covered by one candle of this timeframe.
    pub real_seconds: u64,
    /// Human label for the timeframes endpoint.
    pub label: &'static str,
    /// `(source timeframe, candle count)` — `None` for the base timeframe.
    pub source: Option<(&'static str, usize)>,
}

/// The base timeframe key. Candles of this timeframe are built from ticks.
pub const BASE: &str = "5s";

/// Every timeframe the engine produces, base first, cascade order after.
pub const ALL: &[TimeframeDef] = &[
    TimeframeDef {
        key: "5s",
        real_seconds: 5,
        label: "5 seconds",
        source: None,
    },
    TimeframeDef {
        key: "30s",
        real_seconds: 30,
        label: "30 seconds",
        source: Some(("5s", 6)),
    },
    TimeframeDef {
        key: "1m",
        real_seconds: 60,
        label: "1 minute",
        source: Some(("30s", 2)),
    },
    TimeframeDef {
        key: "3m",
        real_seconds: 180,
        label: "3 minutes",
        source: Some(("1m", 3)),
    },
    TimeframeDef {
        key: "5m",
        real_seconds: 300,
        label: "5 minutes",
        source: Some(("1m", 5)),
    },
];

/// Look up a timeframe by key.
pub fn get(key: &str) -> Option<&'static TimeframeDef> {
    ALL.iter().find(|tf| tf.key == key)
}

/// All timeframes whose source is `source_key`, in table order.
pub fn targets_of(source_key: &str) -> impl Iterator<Item = &'static TimeframeDef> + use<'_> {
    ALL.iter()
        .filter(move |tf| matches!(tf.source, Some((src, _)) if src == source_key))
}

/// Real seconds of a timeframe, or `None` for an unknown key.
pub fn interval_seconds(key: &str) -> Option<u64> {
    get(key).map(|tf| tf.real_seconds)
}
