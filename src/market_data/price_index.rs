// =============================================================================
// Price Index — last known close per symbol
// =============================================================================
//
// Written by the candle aggregator on every base emission and by the
// end-of-contest square-off; read concurrently by trade execution, portfolio
// valuation, and the leaderboard builder.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

/// Thread-safe map of `symbol -> last close`.
pub struct PriceIndex {
    prices: RwLock<HashMap<String, f64>>,
}

impl PriceIndex {
    pub fn new() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// Latest price for a symbol, if one has been published.
    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.prices.read().get(symbol).copied()
    }

    /// Publish a new price for a symbol.
    pub fn set(&self, symbol: &str, price: f64) {
        self.prices.write().insert(symbol.to_string(), price);
    }

    /// Consistent snapshot of every known price.
    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.prices.read().clone()
    }

    /// Number of symbols with a published price.
    pub fn len(&self) -> usize {
        self.prices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.read().is_empty()
    }

    /// Drop every price. Called when transient contest state is wiped.
    pub fn clear(&self) {
        self.prices.write().clear();
    }
}

impl Default for PriceIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_snapshot() {
        let idx = PriceIndex::new();
        assert!(idx.get("RELIANCE").is_none());

        idx.set("RELIANCE", 2450.5);
        idx.set("TCS", 3890.0);

        assert_eq!(idx.get("RELIANCE"), Some(2450.5));
        assert_eq!(idx.len(), 2);

        let snap = idx.snapshot();
        assert_eq!(snap.get("TCS"), Some(&3890.0));

        idx.clear();
        assert!(idx.is_empty());
    }

    #[test]
    fn set_overwrites() {
        let idx = PriceIndex::new();
        idx.set("INFY", 1500.0);
        idx.set("INFY", 1501.25);
        assert_eq!(idx.get("INFY"), Some(1501.25));
    }
}
