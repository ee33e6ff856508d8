// =============================================================================
// Leaderboard Builder — global ranking over every portfolio
// =============================================================================
//
// Recomputes each portfolio's derived values against the current price index
// and ranks by total wealth descending. Ties break by user email ascending,
// so two identical portfolios always rank in the same order.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::market_data::price_index::PriceIndex;
use crate::trading::portfolio::PortfolioStore;
use crate::trading::shorts::ShortPositionStore;
use crate::types::round2;

/// Entries persisted on the contest row.
pub const SNAPSHOT_TOP_N: usize = 100;
/// Entries pushed on the `leaderboard` topic.
pub const BROADCAST_TOP_N: usize = 20;
/// Entries carried by the `contest_ended` event.
pub const FINAL_TOP_N: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_name: String,
    pub user_email: String,
    pub total_wealth: f64,
    pub total_pnl: f64,
    pub return_percent: f64,
    pub cash: f64,
    pub long_market_value: f64,
    pub short_liability: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
}

/// Rank every portfolio. The returned list is complete; callers slice the
/// top-N they need.
pub fn build(
    portfolios: &PortfolioStore,
    shorts: &ShortPositionStore,
    prices: &PriceIndex,
) -> Vec<LeaderboardEntry> {
    let seed = portfolios.seed_cash();

    let mut entries: Vec<LeaderboardEntry> = portfolios
        .all()
        .into_iter()
        .map(|mut p| {
            let lots = shorts.active_for_user(&p.user_email);
            p.revalue(prices, &lots);
            // revalue() rounds the derived figures; cash, realized P&L, and
            // the return percentage cross the boundary here, so they round
            // here.
            LeaderboardEntry {
                rank: 0,
                user_name: p.user_name.clone(),
                user_email: p.user_email.clone(),
                total_wealth: p.derived.total_wealth,
                total_pnl: p.derived.total_pnl,
                return_percent: round2((p.derived.total_wealth - seed) / (seed / 100.0)),
                cash: round2(p.cash),
                long_market_value: p.derived.market_value,
                short_liability: p.derived.short_liability,
                realized_pnl: round2(p.realized_pnl),
                unrealized_pnl: p.derived.unrealized_pnl,
            }
        })
        .collect();

    entries.sort_by(|a, b| {
        b.total_wealth
            .partial_cmp(&a.total_wealth)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.user_email.cmp(&b.user_email))
    });

    for (i, entry) in entries.iter_mut().enumerate() {
        entry.rank = i + 1;
    }
    entries
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
