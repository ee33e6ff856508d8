// =============================================================================
// Short-Position Store — open short lots with FIFO close semantics
// =============================================================================
//
// One lot per SHORT_SELL. A buy-to-cover consumes lots oldest-opened first;
// a lot covered in full is marked inactive (a tombstone kept until cleanup),
// a lot covered in part keeps its identity with a reduced quantity.
//
// The in-memory list is the working set during a contest; every mutation is
// mirrored to storage by the trade executor inside the same transaction as
// the trade record. `current_px` / `unrealized_pnl` are advisory marks for
// display only and never feed realized P&L.
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::market_data::price_index::PriceIndex;

/// A single open (or tombstoned) short lot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortLot {
    pub id: String,
    pub user_email: String,
    pub symbol: String,
    pub qty: i64,
    pub avg_short_px: f64,
    pub opened_at: String,
    pub is_active: bool,
    #[serde(default)]
    pub current_px: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
}

impl ShortLot {
    pub fn open(user_email: &str, symbol: &str, qty: i64, avg_short_px: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_email: user_email.to_string(),
            symbol: symbol.to_string(),
            qty,
            avg_short_px,
            opened_at: Utc::now().to_rfc3339(),
            is_active: true,
            current_px: avg_short_px,
            unrealized_pnl: 0.0,
        }
    }
}

/// A mutation to the short store, applied to memory and storage together.
#[derive(Debug, Clone)]
pub enum ShortOp {
    Insert(ShortLot),
    /// Mark the lot inactive (covered in full).
    Close { id: String },
    /// Reduce an active lot to `qty` (covered in part).
    SetQty { id: String, qty: i64 },
}

/// One step of a FIFO cover plan: `covered` shares taken from lot `id` which
/// was opened at `avg_short_px`.
#[derive(Debug, Clone)]
pub struct CoverFill {
    pub lot_id: String,
    pub covered: i64,
    pub avg_short_px: f64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Thread-safe owner of every short lot for the current contest.
pub struct ShortPositionStore {
    lots: RwLock<Vec<ShortLot>>,
}

impl ShortPositionStore {
    pub fn new() -> Self {
        Self {
            lots: RwLock::new(Vec::new()),
        }
    }

    /// Active lots for (user, symbol) in `opened_at` ascending order.
    pub fn active_for(&self, user_email: &str, symbol: &str) -> Vec<ShortLot> {
        let mut lots: Vec<ShortLot> = self
            .lots
            .read()
            .iter()
            .filter(|l| l.is_active && l.user_email == user_email && l.symbol == symbol)
            .cloned()
            .collect();
        lots.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        lots
    }

    /// Total active short quantity for (user, symbol).
    pub fn active_qty(&self, user_email: &str, symbol: &str) -> i64 {
        self.lots
            .read()
            .iter()
            .filter(|l| l.is_active && l.user_email == user_email && l.symbol == symbol)
            .map(|l| l.qty)
            .sum()
    }

    /// Every active lot for a user, all symbols.
    pub fn active_for_user(&self, user_email: &str) -> Vec<ShortLot> {
        self.lots
            .read()
            .iter()
            .filter(|l| l.is_active && l.user_email == user_email)
            .cloned()
            .collect()
    }

    /// Lots for a user; `active_only` filters out tombstones.
    pub fn for_user(&self, user_email: &str, active_only: bool) -> Vec<ShortLot> {
        self.lots
            .read()
            .iter()
            .filter(|l| l.user_email == user_email && (!active_only || l.is_active))
            .cloned()
            .collect()
    }

    /// Every active lot across all users (for square-off).
    pub fn all_active(&self) -> Vec<ShortLot> {
        self.lots
            .read()
            .iter()
            .filter(|l| l.is_active)
            .cloned()
            .collect()
    }

    /// Build the FIFO plan for covering `qty` of (user, symbol), oldest lots
    /// first. Returns the fills plus the ops that realise them. Callers must
    /// have verified that enough active quantity exists.
    pub fn plan_cover(&self, user_email: &str, symbol: &str, qty: i64) -> (Vec<CoverFill>, Vec<ShortOp>) {
        let mut remaining = qty;
        let mut fills = Vec::new();
        let mut ops = Vec::new();

        for lot in self.active_for(user_email, symbol) {
            if remaining == 0 {
                break;
            }
            let covered = remaining.min(lot.qty);
            fills.push(CoverFill {
                lot_id: lot.id.clone(),
                covered,
                avg_short_px: lot.avg_short_px,
            });
            if covered == lot.qty {
                ops.push(ShortOp::Close { id: lot.id.clone() });
            } else {
                ops.push(ShortOp::SetQty {
                    id: lot.id.clone(),
                    qty: lot.qty - covered,
                });
            }
            remaining -= covered;
        }

        (fills, ops)
    }

    /// Apply a batch of ops to the in-memory working set. Storage has already
    /// committed them when this is called.
    pub fn apply(&self, ops: &[ShortOp]) {
        let mut lots = self.lots.write();
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
    }

    /// Refresh the advisory mark on every active lot from the price index.
    pub fn mark_to_market(&self, prices: &PriceIndex) {
        let mut lots = self.lots.write();
        for lot in lots.iter_mut().filter(|l| l.is_active) {
            if let Some(px) = prices.get(&lot.symbol) {
                lot.current_px = px;
                lot.unrealized_pnl = (lot.avg_short_px - px) * lot.qty as f64;
            }
        }
    }

    /// Drop every lot, active or tombstone.
    pub fn clear(&self) {
        self.lots.write().clear();
    }

    pub fn active_count(&self) -> usize {
        self.lots.read().iter().filter(|l| l.is_active).count()
    }
}

impl Default for ShortPositionStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lot(user: &str, symbol: &str, qty: i64, px: f64, opened_at: &str) -> ShortLot {
        ShortLot {
            id: Uuid::new_v4().to_string(),
            user_email: user.into(),
            symbol: symbol.into(),
            qty,
            avg_short_px: px,
            opened_at: opened_at.into(),
            is_active: true,
            current_px: px,
            unrealized_pnl: 0.0,
        }
    }

    #[test]
    fn active_for_sorts_by_opened_at() {
        let store = ShortPositionStore::new();
        store.apply(&[
            ShortOp::Insert(lot("a@x.com", "ADANIENT", 50, 2520.0, "2026-08-01T10:05:00Z")),
            ShortOp::Insert(lot("a@x.com", "ADANIENT", 100, 2500.0, "2026-08-01T10:00:00Z")),
        ]);

        let lots = store.active_for("a@x.com", "ADANIENT");
        assert_eq!(lots.len(), 2);
        assert_eq!(lots[0].qty, 100);
        assert_eq!(lots[1].qty, 50);
        assert_eq!(store.active_qty("a@x.com", "ADANIENT"), 150);
    }

    #[test]
    fn plan_cover_fifo_closes_oldest_first() {
        let store = ShortPositionStore::new();
        let old = lot("a@x.com", "ADANIENT", 100, 2500.0, "2026-08-01T10:00:00Z");
        let newer = lot("a@x.com", "ADANIENT", 100, 2550.0, "2026-08-01T10:05:00Z");
        let old_id = old.id.clone();
        let newer_id = newer.id.clone();
        store.apply(&[ShortOp::Insert(old), ShortOp::Insert(newer)]);

        // Cover 150: the whole old lot plus half the newer one.
        let (fills, ops) = store.plan_cover("a@x.com", "ADANIENT", 150);
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0].lot_id, old_id);
        assert_eq!(fills[0].covered, 100);
        assert_eq!(fills[1].lot_id, newer_id);
        assert_eq!(fills[1].covered, 50);

        store.apply(&ops);
        assert_eq!(store.active_qty("a@x.com", "ADANIENT"), 50);
        let remaining = store.active_for("a@x.com", "ADANIENT");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, newer_id);
        assert_eq!(remaining[0].qty, 50);
    }

    #[test]
    fn closed_lots_are_tombstones_until_cleared() {
        let store = ShortPositionStore::new();
        let l = lot("b@x.com", "TCS", 10, 3900.0, "2026-08-01T10:00:00Z");
        let id = l.id.clone();
        store.apply(&[ShortOp::Insert(l)]);
        store.apply(&[ShortOp::Close { id }]);

        assert_eq!(store.active_count(), 0);
        assert_eq!(store.for_user("b@x.com", false).len(), 1);
        assert_eq!(store.for_user("b@x.com", true).len(), 0);

        store.clear();
        assert_eq!(store.for_user("b@x.com", false).len(), 0);
    }

    #[test]
    fn mark_to_market_updates_advisory_fields() {
        let store = ShortPositionStore::new();
        store.apply(&[ShortOp::Insert(lot(
            "c@x.com",
            "ADANIENT",
            100,
            2500.0,
            "2026-08-01T10:00:00Z",
        ))]);

        let prices = PriceIndex::new();
        prices.set("ADANIENT", 2400.0);
        store.mark_to_market(&prices);

        let lots = store.active_for("c@x.com", "ADANIENT");
        assert_eq!(lots[0].current_px, 2400.0);
        assert_eq!(lots[0].unrealized_pnl, 10_000.0);
    }
}
