// =============================================================================
// Cleanup — end-of-contest square-off, final ranking, and state wipe
// =============================================================================
//
// Runs when a contest stops, manual or scheduled. Every open short is closed
// at the last known price (settling the obligation against the cash that the
// short sale credited earlier), the final ranking is persisted to the
// append-only results table, and all transient state — trades, short lots,
// portfolio balances, candle caches, prices — returns to the seed baseline.
//
// Individual failures are collected into the summary instead of aborting:
// the state machine must reach STOPPED no matter what, because a contest
// stuck in RUNNING blocks every future contest.
// =============================================================================

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::contest::leaderboard::{
    self, LeaderboardEntry, BROADCAST_TOP_N, FINAL_TOP_N, SNAPSHOT_TOP_N,
};
use crate::fanout::FanoutHub;
use crate::market_data::candle_cache::CandleCache;
use crate::market_data::price_index::PriceIndex;
use crate::storage::Store;
use crate::trading::executor::TradeRecord;
use crate::trading::portfolio::PortfolioStore;
use crate::trading::shorts::{ShortOp, ShortPositionStore};
use crate::types::{round2, OrderType};

/// What cleanup did, including anything that went wrong along the way.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CleanupSummary {
    pub contest_id: String,
    pub shorts_squared_off: usize,
    pub trades_deleted: usize,
    pub shorts_deleted: usize,
    pub portfolios_reset: usize,
    pub total_participants: usize,
    pub errors: Vec<String>,
}

/// Close every open short lot at the last known price for its symbol, or at
/// the lot's entry price if the symbol never traded. Each lot settles as one
/// transaction: cash debit, realized P&L, tombstone, and a BUY_TO_COVER
/// record land together.
pub fn square_off(
    store: &Store,
    portfolios: &PortfolioStore,
    shorts: &ShortPositionStore,
    prices: &PriceIndex,
    errors: &mut Vec<String>,
) -> usize {
    let mut closed = 0usize;

    for lot in shorts.all_active() {
        let px = round2(prices.get(&lot.symbol).unwrap_or(lot.avg_short_px));
        let cover_cost = round2(px * lot.qty as f64);
        let pnl = (lot.avg_short_px - px) * lot.qty as f64;

        let mut portfolio = match portfolios.get_or_create(&lot.user_email, &lot.user_email) {
            Ok(p) => p,
            Err(e) => {
                errors.push(format!("square-off portfolio fetch for {}: {e}", lot.user_email));
                continue;
            }
        };
        portfolio.cash -= cover_cost;
        portfolio.realized_pnl += pnl;

        let ops = vec![ShortOp::Close { id: lot.id.clone() }];
        let remaining: Vec<_> = shorts
            .active_for_user(&lot.user_email)
            .into_iter()
            .filter(|l| l.id != lot.id)
            .collect();
        portfolio.revalue(prices, &remaining);

        let trade = TradeRecord {
            id: Uuid::new_v4().to_string(),
            user_email: lot.user_email.clone(),
            symbol: lot.symbol.clone(),
            order_type: OrderType::BuyToCover,
            quantity: lot.qty,
            price: px,
            total: cover_cost,
            timestamp: Utc::now().to_rfc3339(),
        };

        match store.apply_trade(&trade, &portfolio, &ops) {
            Ok(()) => {
                portfolios.commit(portfolio);
                shorts.apply(&ops);
                closed += 1;
                info!(
                    user = %lot.user_email,
                    symbol = %lot.symbol,
                    qty = lot.qty,
                    px,
                    pnl,
                    "short squared off"
                );
            }
            Err(e) => {
                errors.push(format!("square-off persist for lot {}: {e}", lot.id));
            }
        }
    }

    closed
}

/// Full end-of-contest sequence. Always returns a summary; never panics a
/// failing step into the caller.
#[allow(clippy::too_many_arguments)]
pub fn run(
    contest_id: &str,
    store: &Store,
    portfolios: &PortfolioStore,
    shorts: &ShortPositionStore,
    prices: &PriceIndex,
    cache: &CandleCache,
    hub: &FanoutHub,
) -> (CleanupSummary, Vec<LeaderboardEntry>) {
    let mut errors = Vec::new();

    // 1. Square off every open short at last known prices.
    let shorts_squared_off = square_off(store, portfolios, shorts, prices, &mut errors);

    // 2. Final revaluation and ranking.
    portfolios.revalue_all(prices, shorts);
    let board = leaderboard::build(portfolios, shorts, prices);
    let final_board: Vec<LeaderboardEntry> =
        board.iter().take(SNAPSHOT_TOP_N).cloned().collect();
    let final_top: Vec<LeaderboardEntry> = board.iter().take(FINAL_TOP_N).cloned().collect();
    let total_participants = board.len();
    let winner = board.first().map(|e| e.user_email.clone());

    // The one unconditional ranking push after square-off.
    let broadcast: Vec<LeaderboardEntry> = board.iter().take(BROADCAST_TOP_N).cloned().collect();
    hub.publish("leaderboard", serde_json::json!(broadcast));

    let end_time = Utc::now().to_rfc3339();
    match serde_json::to_string(&final_board) {
        Ok(json) => {
            if let Err(e) = store.append_contest_result(
                contest_id,
                &end_time,
                &json,
                total_participants as i64,
                winner.as_deref(),
            ) {
                errors.push(format!("persisting final ranking: {e}"));
            }
        }
        Err(e) => errors.push(format!("serialising final ranking: {e}")),
    }

    // 3. Wipe transient rows and in-memory working sets.
    let counts = match store.wipe_transient(portfolios.seed_cash()) {
        Ok(c) => c,
        Err(e) => {
            errors.push(format!("wiping transient state: {e}"));
            Default::default()
        }
    };
    shorts.clear();
    portfolios.clear_cache();
    cache.clear();
    prices.clear();

    let summary = CleanupSummary {
        contest_id: contest_id.to_string(),
        shorts_squared_off,
        trades_deleted: counts.trades_deleted,
        shorts_deleted: counts.shorts_deleted,
        portfolios_reset: counts.portfolios_reset,
        total_participants,
        errors: errors.clone(),
    };

    // 4. Announce the end with the final top-10 and the summary.
    hub.publish(
        "contest_ended",
        serde_json::json!({
            "contest_id": contest_id,
            "end_time": end_time,
            "final_leaderboard": &final_top,
            "cleanup": &summary,
        }),
    );

    if errors.is_empty() {
        info!(
            contest_id,
            shorts_squared_off,
            trades_deleted = counts.trades_deleted,
            portfolios_reset = counts.portfolios_reset,
            "contest cleanup complete"
        );
    } else {
        for e in &errors {
            error!(contest_id, error = %e, "cleanup step failed");
        }
        warn!(contest_id, errors = errors.len(), "contest cleanup finished with errors");
    }

    (summary, final_top)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::trading::shorts::ShortLot;

    struct Rig {
        store: Arc<Store>,
        portfolios: Arc<PortfolioStore>,
        shorts: Arc<ShortPositionStore>,
        prices: Arc<PriceIndex>,
        cache: Arc<CandleCache>,
        hub: Arc<FanoutHub>,
    }

    fn rig() -> Rig {
        let store = Arc::new(Store::in_memory().unwrap());
        Rig {
            portfolios: Arc::new(PortfolioStore::new(store.clone(), 1_000_000.0)),
            shorts: Arc::new(ShortPositionStore::new()),
            prices: Arc::new(PriceIndex::new()),
            cache: Arc::new(CandleCache::new(100)),
            hub: Arc::new(FanoutHub::new()),
            store,
        }
    }

    fn open_short(r: &Rig, user: &str, symbol: &str, qty: i64, px: f64) {
        // Mirror what a SHORT_SELL leaves behind: credited cash and a lot.
        let mut p = r.portfolios.get_or_create(user, user).unwrap();
        p.cash += px * qty as f64;
        r.portfolios.commit(p);
        let lot = ShortLot::open(user, symbol, qty, px);
        r.shorts.apply(&[ShortOp::Insert(lot)]);
    }

    #[test]
    fn profitable_short_square_off() {
        let r = rig();
        open_short(&r, "a@x.com", "ADANIENT", 100, 2500.0);
        assert_eq!(
            r.portfolios.get_or_create("a@x.com", "a@x.com").unwrap().cash,
            1_250_000.0
        );

        r.prices.set("ADANIENT", 2400.0);
        let mut errors = Vec::new();
        let closed = square_off(&r.store, &r.portfolios, &r.shorts, &r.prices, &mut errors);

        assert_eq!(closed, 1);
        assert!(errors.is_empty());
        let p = r.portfolios.get_or_create("a@x.com", "a@x.com").unwrap();
        assert_eq!(p.cash, 1_010_000.0);
        assert_eq!(p.realized_pnl, 10_000.0);
        assert_eq!(r.shorts.active_count(), 0);

        // The settling BUY_TO_COVER record exists at the square-off price.
        let trades = r.store.trades_for_user("a@x.com", 10, 0).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].order_type, OrderType::BuyToCover);
        assert_eq!(trades[0].price, 2400.0);
        assert_eq!(trades[0].quantity, 100);
    }

    #[test]
    fn losing_short_square_off() {
        let r = rig();
        open_short(&r, "b@x.com", "ADANIENT", 100, 2500.0);
        r.prices.set("ADANIENT", 2600.0);

        let mut errors = Vec::new();
        square_off(&r.store, &r.portfolios, &r.shorts, &r.prices, &mut errors);

        let p = r.portfolios.get_or_create("b@x.com", "b@x.com").unwrap();
        assert_eq!(p.cash, 990_000.0);
        assert_eq!(p.realized_pnl, -10_000.0);
    }

    #[test]
    fn square_off_without_price_uses_entry() {
        let r = rig();
        open_short(&r, "c@x.com", "NOPRICE", 10, 500.0);

        let mut errors = Vec::new();
        square_off(&r.store, &r.portfolios, &r.shorts, &r.prices, &mut errors);

        let p = r.portfolios.get_or_create("c@x.com", "c@x.com").unwrap();
        // Covered at entry: the credit and the debit cancel, P&L is flat.
        assert_eq!(p.cash, 1_000_000.0);
        assert_eq!(p.realized_pnl, 0.0);
    }

    #[test]
    fn full_run_resets_everything() {
        let r = rig();
        open_short(&r, "a@x.com", "ADANIENT", 100, 2500.0);
        open_short(&r, "b@x.com", "TCS", 10, 3900.0);
        r.prices.set("ADANIENT", 2400.0);
        r.prices.set("TCS", 4000.0);

        let (summary, final_top) = run(
            "contest-1",
            &r.store,
            &r.portfolios,
            &r.shorts,
            &r.prices,
            &r.cache,
            &r.hub,
        );

        assert_eq!(summary.shorts_squared_off, 2);
        assert!(summary.errors.is_empty());
        assert_eq!(summary.total_participants, 2);
        assert!(!final_top.is_empty());

        // Post-wipe invariants.
        assert_eq!(r.store.count_trades().unwrap(), 0);
        assert_eq!(r.store.count_active_shorts().unwrap(), 0);
        assert_eq!(r.shorts.active_count(), 0);
        assert!(r.portfolios.is_empty());
        assert!(r.prices.is_empty());

        let p = r.store.load_portfolio("a@x.com").unwrap().unwrap();
        assert_eq!(p.cash, 1_000_000.0);
        assert!(p.holdings.is_empty());
        assert_eq!(p.realized_pnl, 0.0);
    }

    #[test]
    fn final_ranking_orders_winner_first() {
        let r = rig();
        // a@x.com profits on the short; b@x.com loses.
        open_short(&r, "a@x.com", "ADANIENT", 100, 2500.0);
        open_short(&r, "b@x.com", "ADANIENT", 100, 2300.0);
        r.prices.set("ADANIENT", 2400.0);

        let (_, final_top) = run(
            "contest-2",
            &r.store,
            &r.portfolios,
            &r.shorts,
            &r.prices,
            &r.cache,
            &r.hub,
        );

        assert_eq!(final_top[0].user_email, "a@x.com");
        assert_eq!(final_top[1].user_email, "b@x.com");
        assert!(final_top[0].total_wealth > final_top[1].total_wealth);
    }
}
