// =============================================================================
// Portfolio Store — per-user cash, holdings, and derived wealth
// =============================================================================
//
// Portfolios are created lazily on first contact, seeded with the configured
// starting cash. Only the trade executor, periodic revaluation, and cleanup
// mutate them. Every mutation of a single user's portfolio is serialized by
// that user's keyed mutex; different users proceed in parallel.
//
// Wealth derivation (the one place it is defined):
//   total_wealth = cash + long market value + short unrealized P&L.
// Cash already holds the proceeds of every short sale, so the open obligation
// enters exactly once — as its mark-to-market — and is never also subtracted
// as a liability.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::market_data::price_index::PriceIndex;
use crate::storage::Store;
use crate::trading::shorts::ShortLot;
use crate::types::round2;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// One long holding. `qty` stays strictly positive; a holding sold to zero is
/// removed from the map entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub qty: i64,
    pub avg_px: f64,
    #[serde(default)]
    pub company_name: String,
}

/// Values derived from the price index; recomputed, never accumulated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Derived {
    pub market_value: f64,
    pub short_liability: f64,
    pub unrealized_pnl: f64,
    pub total_wealth: f64,
    pub total_pnl: f64,
}

/// A participant's portfolio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub user_email: String,
    pub user_name: String,
    pub cash: f64,
    pub holdings: HashMap<String, Holding>,
    pub realized_pnl: f64,
    #[serde(default)]
    pub derived: Derived,
    pub last_updated: String,
}

impl Portfolio {
    pub fn seeded(user_email: &str, user_name: &str, seed_cash: f64) -> Self {
        Self {
            user_email: user_email.to_string(),
            user_name: user_name.to_string(),
            cash: seed_cash,
            holdings: HashMap::new(),
            realized_pnl: 0.0,
            derived: Derived {
                total_wealth: seed_cash,
                ..Derived::default()
            },
            last_updated: Utc::now().to_rfc3339(),
        }
    }

    /// Recompute every derived value against the current prices and this
    /// user's active short lots.
    pub fn revalue(&mut self, prices: &PriceIndex, active_lots: &[ShortLot]) {
        let mut long_market_value = 0.0;
        let mut long_unrealized = 0.0;
        for (symbol, holding) in &self.holdings {
            let px = prices.get(symbol).unwrap_or(holding.avg_px);
            long_market_value += holding.qty as f64 * px;
            long_unrealized += (px - holding.avg_px) * holding.qty as f64;
        }

        let mut short_liability = 0.0;
        let mut short_unrealized = 0.0;
        for lot in active_lots.iter().filter(|l| l.is_active) {
            let px = prices.get(&lot.symbol).unwrap_or(lot.avg_short_px);
            short_liability += lot.qty as f64 * px;
            short_unrealized += (lot.avg_short_px - px) * lot.qty as f64;
        }

        // Every derived figure crosses the client boundary; 2-decimal money.
        self.derived = Derived {
            market_value: round2(long_market_value),
            short_liability: round2(short_liability),
            unrealized_pnl: round2(long_unrealized + short_unrealized),
            total_wealth: round2(self.cash + long_market_value + short_unrealized),
            total_pnl: round2(long_unrealized + short_unrealized + self.realized_pnl),
        };
        self.last_updated = Utc::now().to_rfc3339();
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Thread-safe owner of every portfolio, write-through to storage.
pub struct PortfolioStore {
    store: Arc<Store>,
    seed_cash: f64,
    cache: RwLock<HashMap<String, Portfolio>>,
    /// One mutex per user, created lazily and retained for the contest
    /// lifetime. Serialises concurrent trades by the same user.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PortfolioStore {
    pub fn new(store: Arc<Store>, seed_cash: f64) -> Self {
        Self {
            store,
            seed_cash,
            cache: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn seed_cash(&self) -> f64 {
        self.seed_cash
    }

    /// The per-user serialization mutex.
    pub fn user_lock(&self, user_email: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(user_email.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Fetch a user's portfolio, creating a seeded one on first contact.
    pub fn get_or_create(&self, user_email: &str, user_name: &str) -> Result<Portfolio> {
        if let Some(p) = self.cache.read().get(user_email) {
            return Ok(p.clone());
        }

        // Not cached: rehydrate a persisted row, else seed a fresh one.
        let portfolio = match self.store.load_portfolio(user_email)? {
            Some(p) => p,
            None => {
                let p = Portfolio::seeded(user_email, user_name, self.seed_cash);
                self.store.upsert_portfolio(&p)?;
                p
            }
        };

        self.cache
            .write()
            .insert(user_email.to_string(), portfolio.clone());
        Ok(portfolio)
    }

    /// Replace the cached copy after storage has committed the mutation.
    pub fn commit(&self, portfolio: Portfolio) {
        self.cache
            .write()
            .insert(portfolio.user_email.clone(), portfolio);
    }

    /// Snapshot of every cached portfolio.
    pub fn all(&self) -> Vec<Portfolio> {
        self.cache.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }

    /// Recompute derived values for every cached portfolio. Advisory between
    /// trades; authoritative persistence happens on mutation paths.
    pub fn revalue_all(
        &self,
        prices: &PriceIndex,
        shorts: &crate::trading::shorts::ShortPositionStore,
    ) {
        let mut cache = self.cache.write();
        for portfolio in cache.values_mut() {
            let lots = shorts.active_for_user(&portfolio.user_email);
            portfolio.revalue(prices, &lots);
        }
    }

    /// Reset every persisted portfolio to the seed and drop the cache.
    pub fn reset_all_to_seed(&self) -> Result<usize> {
        let reset = self.store.reset_all_portfolios(self.seed_cash)?;
        self.cache.write().clear();
        Ok(reset)
    }

    /// Drop the cache without touching storage.
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::shorts::ShortLot;

    #[test]
    fn seeded_portfolio_shape() {
        let p = Portfolio::seeded("a@x.com", "Asha", 1_000_000.0);
        assert_eq!(p.cash, 1_000_000.0);
        assert!(p.holdings.is_empty());
        assert_eq!(p.realized_pnl, 0.0);
        assert_eq!(p.derived.total_wealth, 1_000_000.0);
    }

    #[test]
    fn revalue_long_only() {
        let prices = PriceIndex::new();
        prices.set("RELIANCE", 2600.0);

        let mut p = Portfolio::seeded("a@x.com", "Asha", 1_000_000.0);
        p.cash = 750_000.0;
        p.holdings.insert(
            "RELIANCE".into(),
            Holding {
                qty: 100,
                avg_px: 2500.0,
                company_name: "Reliance Industries".into(),
            },
        );

        p.revalue(&prices, &[]);
        assert_eq!(p.derived.market_value, 260_000.0);
        assert_eq!(p.derived.unrealized_pnl, 10_000.0);
        assert_eq!(p.derived.total_wealth, 1_010_000.0);
        assert_eq!(p.derived.total_pnl, 10_000.0);
    }

    #[test]
    fn revalue_same_symbol_long_and_short_never_double_counts() {
        // SHORT_SELL 100 @ 2500 (cash 1,250,000), price falls to 2400,
        // BUY 100 @ 2400 (cash 1,010,000). Wealth must count the long at
        // market and the short exactly once, as its mark-to-market.
        let prices = PriceIndex::new();
        prices.set("ADANIENT", 2400.0);

        let mut p = Portfolio::seeded("a@x.com", "Asha", 1_000_000.0);
        p.cash = 1_010_000.0;
        p.holdings.insert(
            "ADANIENT".into(),
            Holding {
                qty: 100,
                avg_px: 2400.0,
                company_name: "Adani Enterprises".into(),
            },
        );
        let lot = ShortLot::open("a@x.com", "ADANIENT", 100, 2500.0);

        p.revalue(&prices, &[lot]);
        assert_eq!(p.derived.market_value, 240_000.0);
        assert_eq!(p.derived.short_liability, 240_000.0);
        assert_eq!(p.derived.unrealized_pnl, 10_000.0);
        assert_eq!(p.derived.total_wealth, 1_260_000.0);
        assert_eq!(p.derived.total_pnl, 10_000.0);
    }

    #[test]
    fn revalue_rounds_money_to_two_decimals() {
        let prices = PriceIndex::new();
        prices.set("INFY", 1500.335);

        let mut p = Portfolio::seeded("a@x.com", "Asha", 1_000_000.0);
        p.cash = 850_000.0;
        p.holdings.insert(
            "INFY".into(),
            Holding {
                qty: 100,
                avg_px: 1500.0,
                company_name: "Infosys".into(),
            },
        );

        p.revalue(&prices, &[]);
        assert_eq!(p.derived.market_value, 150_033.5);
        assert_eq!(p.derived.unrealized_pnl, 33.5);
        assert_eq!(p.derived.total_wealth, 1_000_033.5);
        assert_eq!(p.derived.total_pnl, 33.5);
    }

    #[test]
    fn revalue_missing_price_falls_back_to_entry() {
        let prices = PriceIndex::new();

        let mut p = Portfolio::seeded("a@x.com", "Asha", 1_000_000.0);
        p.cash = 900_000.0;
        p.holdings.insert(
            "TCS".into(),
            Holding {
                qty: 25,
                avg_px: 4000.0,
                company_name: "TCS".into(),
            },
        );

        p.revalue(&prices, &[]);
        assert_eq!(p.derived.market_value, 100_000.0);
        assert_eq!(p.derived.unrealized_pnl, 0.0);
        assert_eq!(p.derived.total_wealth, 1_000_000.0);
    }
}
