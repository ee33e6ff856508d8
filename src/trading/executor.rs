// =============================================================================
// Trade Executor — validates an order and applies it to one portfolio
// =============================================================================
//
// The only mutation path for portfolios and short lots during a contest.
// Execution is atomic per order: every precondition is checked first, the new
// portfolio state and short-lot changes are computed on clones, and a single
// storage transaction lands the trade record, the portfolio row, and the lot
// changes together. Only after the transaction commits are the in-memory
// working sets updated and the portfolio update published. A failure at any
// earlier point leaves no observable state behind.
//
// Concurrency: the caller-facing `execute` serialises on the per-user mutex,
// so two orders by the same user never interleave; orders by different users
// run in parallel. There are no await points between the storage commit and
// the in-memory commit, so a cancelled request can abort an order before the
// mutation but never tear one mid-way.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::contest::ContestGate;
use crate::fanout::FanoutHub;
use crate::market_data::price_index::PriceIndex;
use crate::storage::Store;
use crate::trading::portfolio::{Holding, Portfolio, PortfolioStore};
use crate::trading::shorts::{ShortLot, ShortOp, ShortPositionStore};
use crate::types::{round2, EngineError, OrderType};

/// One immutable, append-only trade record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub user_email: String,
    pub symbol: String,
    pub order_type: OrderType,
    pub quantity: i64,
    pub price: f64,
    pub total: f64,
    pub timestamp: String,
}

/// What a successful execution returns to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct TradeOutcome {
    pub trade: TradeRecord,
    pub portfolio: Portfolio,
}

pub struct TradeExecutor {
    store: Arc<Store>,
    portfolios: Arc<PortfolioStore>,
    shorts: Arc<ShortPositionStore>,
    price_index: Arc<PriceIndex>,
    hub: Arc<FanoutHub>,
    gate: Arc<ContestGate>,
}

impl TradeExecutor {
    pub fn new(
        store: Arc<Store>,
        portfolios: Arc<PortfolioStore>,
        shorts: Arc<ShortPositionStore>,
        price_index: Arc<PriceIndex>,
        hub: Arc<FanoutHub>,
        gate: Arc<ContestGate>,
    ) -> Self {
        Self {
            store,
            portfolios,
            shorts,
            price_index,
            hub,
            gate,
        }
    }

    /// Execute one order for one user.
    ///
    /// Precondition failures return the named error and mutate nothing; a
    /// storage failure during the mutation likewise leaves portfolio, lots,
    /// and trade history untouched.
    pub async fn execute(
        &self,
        user_email: &str,
        user_name: &str,
        symbol: &str,
        order_type: OrderType,
        quantity: i64,
        company_name: &str,
    ) -> Result<TradeOutcome, EngineError> {
        let lock = self.portfolios.user_lock(user_email);
        let _guard = lock.lock().await;

        // Gate and sanity checks, cheapest first.
        if !self.gate.is_running() {
            return Err(EngineError::NotRunning);
        }
        if quantity <= 0 {
            return Err(EngineError::InvalidQty);
        }
        let px = match self.price_index.get(symbol) {
            Some(p) if p > 0.0 => round2(p),
            _ => return Err(EngineError::NoPrice(symbol.to_string())),
        };
        let total = round2(quantity as f64 * px);

        let mut portfolio = self
            .portfolios
            .get_or_create(user_email, user_name)
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        // Order-specific application on the clone.
        let short_ops = match order_type {
            OrderType::Buy => {
                if portfolio.cash < total {
                    return Err(EngineError::InsufficientCash {
                        required: total,
                        available: portfolio.cash,
                    });
                }
                portfolio.cash -= total;
                let entry = portfolio.holdings.entry(symbol.to_string()).or_insert(Holding {
                    qty: 0,
                    avg_px: 0.0,
                    company_name: company_name.to_string(),
                });
                let new_qty = entry.qty + quantity;
                entry.avg_px = (entry.avg_px * entry.qty as f64 + total) / new_qty as f64;
                entry.qty = new_qty;
                if entry.company_name.is_empty() {
                    entry.company_name = company_name.to_string();
                }
                Vec::new()
            }

            OrderType::Sell => {
                let held = portfolio.holdings.get(symbol).map_or(0, |h| h.qty);
                if held < quantity {
                    return Err(EngineError::InsufficientHoldings {
                        symbol: symbol.to_string(),
                        requested: quantity,
                        held,
                    });
                }
                let holding = portfolio.holdings.get_mut(symbol).unwrap();
                portfolio.cash += total;
                portfolio.realized_pnl += (px - holding.avg_px) * quantity as f64;
                holding.qty -= quantity;
                if holding.qty == 0 {
                    portfolio.holdings.remove(symbol);
                }
                Vec::new()
            }

            OrderType::ShortSell => {
                portfolio.cash += total;
                vec![ShortOp::Insert(ShortLot::open(user_email, symbol, quantity, px))]
            }

            OrderType::BuyToCover => {
                let open = self.shorts.active_qty(user_email, symbol);
                if open < quantity {
                    return Err(EngineError::NoShorts {
                        symbol: symbol.to_string(),
                        requested: quantity,
                        open,
                    });
                }
                let (fills, ops) = self.shorts.plan_cover(user_email, symbol, quantity);
                portfolio.cash -= total;
                for fill in &fills {
                    portfolio.realized_pnl += (fill.avg_short_px - px) * fill.covered as f64;
                }
                ops
            }
        };

        let trade = TradeRecord {
            id: Uuid::new_v4().to_string(),
            user_email: user_email.to_string(),
            symbol: symbol.to_string(),
            order_type,
            quantity,
            price: px,
            total,
            timestamp: Utc::now().to_rfc3339(),
        };

        // Revalue against lots as they will stand after this order.
        let lots_after = simulate_ops(self.shorts.active_for_user(user_email), &short_ops);
        portfolio.revalue(&self.price_index, &lots_after);

        // One transaction: trade record, portfolio row, lot changes.
        if let Err(e) = self.store.apply_trade(&trade, &portfolio, &short_ops) {
            warn!(user = %user_email, symbol, error = %e, "trade persistence failed — order rejected");
            return Err(EngineError::Storage(e.to_string()));
        }

        // Storage committed; now the in-memory working sets.
        self.portfolios.commit(portfolio.clone());
        self.shorts.apply(&short_ops);

        info!(
            user = %user_email,
            symbol,
            order_type = %order_type,
            qty = quantity,
            px,
            total,
            "trade executed"
        );

        self.hub.publish(
            &format!("user:{user_email}"),
            serde_json::json!({
                "type": "portfolio_update",
                "trade": &trade,
                "portfolio": &portfolio,
            }),
        );

        Ok(TradeOutcome { trade, portfolio })
    }
}

/// Project a set of active lots forward through pending ops, so valuation can
/// see post-trade state before the working set is mutated.
fn simulate_ops(mut lots: Vec<ShortLot>, ops: &[ShortOp]) -> Vec<ShortLot> {
    for op in ops {
        match op {
            ShortOp::Insert(lot) => lots.push(lot.clone()),
            ShortOp::Close { id } => {
                if let Some(lot) = lots.iter_mut().find(|l| l.id == *id) {
                    lot.is_active = false;
                    lot.qty = 0;
                }
            }
            ShortOp::SetQty { id, qty } => {
                if let Some(lot) = lots.iter_mut().find(|l| l.id == *id) {
                    lot.qty = *qty;
                }
            }
        }
    }
    lots
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
