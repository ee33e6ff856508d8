// =============================================================================
// Storage — SQLite adapter for ticks, users, and contest state
// =============================================================================
//
// The single place the engine touches durable rows. Holds one connection
// behind a mutex; multi-row mutations that must land together (a trade with
// its portfolio row and short-lot changes, the end-of-contest wipe) run in
// explicit transactions.
//
// The ticks table is read-only input: the replay loader pages through it and
// samples it for symbol discovery, but the engine never writes ticks outside
// of tests and data seeding.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::trading::executor::TradeRecord;
use crate::trading::portfolio::{Derived, Portfolio};
use crate::trading::shorts::{ShortLot, ShortOp};
use crate::types::{OrderType, Tick};

/// A row of the users table. `auth_id` is the opaque bearer token issued by
/// the external identity provider.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub auth_id: String,
    pub email: String,
    pub name: String,
    pub role: String,
}

impl UserRow {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// Row counts removed by the transient-state wipe.
#[derive(Debug, Clone, Default)]
pub struct WipeCounts {
    pub trades_deleted: usize,
    pub shorts_deleted: usize,
    pub portfolios_reset: usize,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS ticks (
                symbol TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                ltp REAL NOT NULL,
                volume REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ticks_ts ON ticks(timestamp);
            CREATE INDEX IF NOT EXISTS idx_ticks_symbol_ts ON ticks(symbol, timestamp);

            CREATE TABLE IF NOT EXISTS users (
                auth_id TEXT PRIMARY KEY,
                email TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'user'
            );

            CREATE TABLE IF NOT EXISTS portfolios (
                user_email TEXT PRIMARY KEY,
                user_name TEXT NOT NULL,
                cash REAL NOT NULL,
                holdings TEXT NOT NULL,
                realized_pnl REAL NOT NULL,
                market_value REAL NOT NULL DEFAULT 0,
                short_liability REAL NOT NULL DEFAULT 0,
                unrealized_pnl REAL NOT NULL DEFAULT 0,
                total_wealth REAL NOT NULL DEFAULT 0,
                total_pnl REAL NOT NULL DEFAULT 0,
                last_updated TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                user_email TEXT NOT NULL,
                symbol TEXT NOT NULL,
                order_type TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price REAL NOT NULL,
                total REAL NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_user ON trades(user_email, timestamp);

            CREATE TABLE IF NOT EXISTS short_positions (
                id TEXT PRIMARY KEY,
                user_email TEXT NOT NULL,
                symbol TEXT NOT NULL,
                qty INTEGER NOT NULL,
                avg_short_px REAL NOT NULL,
                opened_at TEXT NOT NULL,
                is_active INTEGER NOT NULL,
                current_px REAL NOT NULL DEFAULT 0,
                unrealized_pnl REAL NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS contest_state (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                start_time TEXT NOT NULL,
                duration_secs INTEGER NOT NULL,
                symbols TEXT NOT NULL,
                data_start_ms INTEGER NOT NULL,
                data_end_ms INTEGER NOT NULL,
                compression_ratio REAL NOT NULL,
                leaderboard TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS contest_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contest_id TEXT NOT NULL,
                end_time TEXT NOT NULL,
                final_leaderboard TEXT NOT NULL,
                total_participants INTEGER NOT NULL,
                winner TEXT
            );
            COMMIT;",
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Ticks
    // -------------------------------------------------------------------

    pub fn count_ticks(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM ticks", [], |row| row.get(0))?;
        Ok(n)
    }

    /// Earliest and latest tick timestamps, if any ticks exist.
    pub fn tick_time_bounds(&self) -> Result<Option<(i64, i64)>> {
        let conn = self.conn.lock();
        let bounds: (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(timestamp), MAX(timestamp) FROM ticks",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(match bounds {
            (Some(lo), Some(hi)) => Some((lo, hi)),
            _ => None,
        })
    }

    /// Symbols of one page of the ticks table, in storage order. Used for
    /// symbol-universe discovery by sampling several offsets.
    pub fn sample_symbols(&self, limit: i64, offset: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT symbol FROM ticks LIMIT ?1 OFFSET ?2")?;
        let rows = stmt.query_map(params![limit, offset], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// One page of ticks in `[start_ms, end_ms)`, ordered by timestamp.
    pub fn ticks_in_span(
        &self,
        start_ms: i64,
        end_ms: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Tick>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, timestamp, open, high, low, close, ltp, volume
             FROM ticks WHERE timestamp >= ?1 AND timestamp < ?2
             ORDER BY timestamp ASC LIMIT ?3 OFFSET ?4",
        )?;
        let rows = stmt.query_map(params![start_ms, end_ms, limit, offset], |row| {
            Ok(Tick {
                symbol: row.get(0)?,
                timestamp_ms: row.get(1)?,
                open: row.get(2)?,
                high: row.get(3)?,
                low: row.get(4)?,
                close: row.get(5)?,
                ltp: row.get(6)?,
                volume: row.get(7)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Bulk-insert ticks. Data seeding and tests only.
    pub fn insert_ticks(&self, ticks: &[Tick]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO ticks (symbol, timestamp, open, high, low, close, ltp, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for t in ticks {
                stmt.execute(params![
                    t.symbol,
                    t.timestamp_ms,
                    t.open,
                    t.high,
                    t.low,
                    t.close,
                    t.ltp,
                    t.volume
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------

    pub fn user_by_token(&self, token: &str) -> Result<Option<UserRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT auth_id, email, name, role FROM users WHERE auth_id = ?1",
                params![token],
                |row| {
                    Ok(UserRow {
                        auth_id: row.get(0)?,
                        email: row.get(1)?,
                        name: row.get(2)?,
                        role: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn upsert_user(&self, user: &UserRow) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO users (auth_id, email, name, role)
             VALUES (?1, ?2, ?3, ?4)",
            params![user.auth_id, user.email, user.name, user.role],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Portfolios
    // -------------------------------------------------------------------

    pub fn upsert_portfolio(&self, p: &Portfolio) -> Result<()> {
        let conn = self.conn.lock();
        upsert_portfolio_inner(&conn, p)
    }

    pub fn load_portfolio(&self, user_email: &str) -> Result<Option<Portfolio>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT user_email, user_name, cash, holdings, realized_pnl,
                        market_value, short_liability, unrealized_pnl, total_wealth,
                        total_pnl, last_updated
                 FROM portfolios WHERE user_email = ?1",
                params![user_email],
                portfolio_from_row,
            )
            .optional()?;

        match row {
            Some((p, holdings_json)) => {
                let holdings: HashMap<String, crate::trading::portfolio::Holding> =
                    serde_json::from_str(&holdings_json)
                        .context("corrupt holdings JSON in portfolio row")?;
                Ok(Some(Portfolio { holdings, ..p }))
            }
            None => Ok(None),
        }
    }

    pub fn portfolio_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM portfolios", [], |row| row.get(0))?;
        Ok(n)
    }

    /// Reset every portfolio row to the seed. Returns rows touched.
    pub fn reset_all_portfolios(&self, seed_cash: f64) -> Result<usize> {
        let conn = self.conn.lock();
        let n = reset_portfolios_inner(&conn, seed_cash)?;
        Ok(n)
    }

    // -------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------

    pub fn trades_for_user(&self, user_email: &str, limit: i64, offset: i64) -> Result<Vec<TradeRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_email, symbol, order_type, quantity, price, total, timestamp
             FROM trades WHERE user_email = ?1
             ORDER BY timestamp DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![user_email, limit, offset], trade_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn count_trades(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))?;
        Ok(n)
    }

    /// Append a single trade outside the atomic trade path (square-off).
    pub fn append_trade(&self, trade: &TradeRecord) -> Result<()> {
        let conn = self.conn.lock();
        insert_trade_inner(&conn, trade)
    }

    // -------------------------------------------------------------------
    // Short positions
    // -------------------------------------------------------------------

    pub fn count_active_shorts(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM short_positions WHERE is_active = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Advisory mark update during revaluation.
    pub fn update_short_mark(&self, id: &str, current_px: f64, unrealized_pnl: f64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE short_positions SET current_px = ?2, unrealized_pnl = ?3 WHERE id = ?1",
            params![id, current_px, unrealized_pnl],
        )?;
        Ok(())
    }

    /// Mark a lot inactive (used by square-off, atomically per lot).
    pub fn close_short(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        apply_short_op_inner(&conn, &ShortOp::Close { id: id.to_string() })
    }

    // -------------------------------------------------------------------
    // Atomic trade application
    // -------------------------------------------------------------------

    /// Persist a trade record, the updated portfolio row, and any short-lot
    /// changes in one transaction: either all of them land, or none do.
    pub fn apply_trade(
        &self,
        trade: &TradeRecord,
        portfolio: &Portfolio,
        short_ops: &[ShortOp],
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        insert_trade_inner(&tx, trade)?;
        upsert_portfolio_inner(&tx, portfolio)?;
        for op in short_ops {
            apply_short_op_inner(&tx, op)?;
        }
        tx.commit()?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Contest lifecycle
    // -------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn insert_contest(
        &self,
        id: &str,
        status: &str,
        start_time: &str,
        duration_secs: i64,
        symbols: &[String],
        data_start_ms: i64,
        data_end_ms: i64,
        compression_ratio: f64,
    ) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO contest_state (id, status, start_time, duration_secs, symbols,
                                        data_start_ms, data_end_ms, compression_ratio)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                status,
                start_time,
                duration_secs,
                serde_json::to_string(symbols)?,
                data_start_ms,
                data_end_ms,
                compression_ratio
            ],
        )?;
        Ok(())
    }

    pub fn update_contest_status(&self, id: &str, status: &str) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE contest_state SET status = ?2 WHERE id = ?1",
            params![id, status],
        )?;
        Ok(())
    }

    /// Persist the live leaderboard snapshot on the contest row so a client
    /// joining mid-contest can fetch the latest ranking.
    pub fn save_leaderboard_snapshot(&self, id: &str, leaderboard_json: &str) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE contest_state SET leaderboard = ?2 WHERE id = ?1",
            params![id, leaderboard_json],
        )?;
        Ok(())
    }

    /// Any contest left RUNNING or PAUSED by a previous process is dead; a
    /// contest never survives a restart. Returns rows repaired.
    pub fn mark_stale_contests_stopped(&self) -> Result<usize> {
        let n = self.conn.lock().execute(
            "UPDATE contest_state SET status = 'STOPPED'
             WHERE status IN ('RUNNING', 'PAUSED')",
            [],
        )?;
        Ok(n)
    }

    pub fn append_contest_result(
        &self,
        contest_id: &str,
        end_time: &str,
        final_leaderboard_json: &str,
        total_participants: i64,
        winner: Option<&str>,
    ) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO contest_results (contest_id, end_time, final_leaderboard,
                                          total_participants, winner)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![contest_id, end_time, final_leaderboard_json, total_participants, winner],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Transient-state wipe
    // -------------------------------------------------------------------

    /// Delete every trade and short lot and reset every portfolio to the
    /// seed, in one transaction.
    pub fn wipe_transient(&self, seed_cash: f64) -> Result<WipeCounts> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let trades_deleted = tx.execute("DELETE FROM trades", [])?;
        let shorts_deleted = tx.execute("DELETE FROM short_positions", [])?;
        let portfolios_reset = reset_portfolios_inner(&tx, seed_cash)?;
        tx.commit()?;
        Ok(WipeCounts {
            trades_deleted,
            shorts_deleted,
            portfolios_reset,
        })
    }
}

// ---------------------------------------------------------------------------
// Row helpers shared by transactional and direct paths
// ---------------------------------------------------------------------------

fn insert_trade_inner(conn: &Connection, trade: &TradeRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO trades (id, user_email, symbol, order_type, quantity, price, total, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            trade.id,
            trade.user_email,
            trade.symbol,
            trade.order_type.as_str(),
            trade.quantity,
            trade.price,
            trade.total,
            trade.timestamp
        ],
    )?;
    Ok(())
}

fn upsert_portfolio_inner(conn: &Connection, p: &Portfolio) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO portfolios
            (user_email, user_name, cash, holdings, realized_pnl, market_value,
             short_liability, unrealized_pnl, total_wealth, total_pnl, last_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            p.user_email,
            p.user_name,
            p.cash,
            serde_json::to_string(&p.holdings)?,
            p.realized_pnl,
            p.derived.market_value,
            p.derived.short_liability,
            p.derived.unrealized_pnl,
            p.derived.total_wealth,
            p.derived.total_pnl,
            p.last_updated
        ],
    )?;
    Ok(())
}

fn reset_portfolios_inner(conn: &Connection, seed_cash: f64) -> Result<usize> {
    let now = chrono::Utc::now().to_rfc3339();
    let n = conn.execute(
        "UPDATE portfolios SET cash = ?1, holdings = '{}', realized_pnl = 0,
             market_value = 0, short_liability = 0, unrealized_pnl = 0,
             total_wealth = ?1, total_pnl = 0, last_updated = ?2",
        params![seed_cash, now],
    )?;
    Ok(n)
}

fn apply_short_op_inner(conn: &Connection, op: &ShortOp) -> Result<()> {
    match op {
        ShortOp::Insert(lot) => {
            conn.execute(
                "INSERT INTO short_positions
                    (id, user_email, symbol, qty, avg_short_px, opened_at, is_active,
                     current_px, unrealized_pnl)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8)",
                params![
                    lot.id,
                    lot.user_email,
                    lot.symbol,
                    lot.qty,
                    lot.avg_short_px,
                    lot.opened_at,
                    lot.current_px,
                    lot.unrealized_pnl
                ],
            )?;
        }
        ShortOp::Close { id } => {
            conn.execute(
                "UPDATE short_positions SET is_active = 0, qty = 0 WHERE id = ?1",
                params![id],
            )?;
        }
        ShortOp::SetQty { id, qty } => {
            conn.execute(
                "UPDATE short_positions SET qty = ?2 WHERE id = ?1",
                params![id, qty],
            )?;
        }
    }
    Ok(())
}

type PortfolioRow = (Portfolio, String);

fn portfolio_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PortfolioRow> {
    let holdings_json: String = row.get(3)?;
    Ok((
        Portfolio {
            user_email: row.get(0)?,
            user_name: row.get(1)?,
            cash: row.get(2)?,
            holdings: HashMap::new(),
            realized_pnl: row.get(4)?,
            derived: Derived {
                market_value: row.get(5)?,
                short_liability: row.get(6)?,
                unrealized_pnl: row.get(7)?,
                total_wealth: row.get(8)?,
                total_pnl: row.get(9)?,
            },
            last_updated: row.get(10)?,
        },
        holdings_json,
    ))
}

fn trade_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRecord> {
    let order_type_str: String = row.get(3)?;
    Ok(TradeRecord {
        id: row.get(0)?,
        user_email: row.get(1)?,
        symbol: row.get(2)?,
        order_type: OrderType::parse(&order_type_str).unwrap_or(OrderType::Buy),
        quantity: row.get(4)?,
        price: row.get(5)?,
        total: row.get(6)?,
        timestamp: row.get(7)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::portfolio::Holding;
    use crate::trading::shorts::ShortLot;

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

    fn sample_trade(user: &str) -> TradeRecord {
        TradeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_email: user.into(),
            symbol: "RELIANCE".into(),
            order_type: OrderType::Buy,
            quantity: 10,
            price: 2500.0,
            total: 25_000.0,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn tick_bounds_and_paging() {
        let store = Store::in_memory().unwrap();
        store
            .insert_ticks(&[
                tick("A", 1000, 10.0),
                tick("B", 2000, 20.0),
                tick("A", 3000, 11.0),
            ])
            .unwrap();

        assert_eq!(store.count_ticks().unwrap(), 3);
        assert_eq!(store.tick_time_bounds().unwrap(), Some((1000, 3000)));

        let page = store.ticks_in_span(1000, 3000, 10, 0).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].symbol, "A");
        assert_eq!(page[1].symbol, "B");

        let symbols = store.sample_symbols(10, 0).unwrap();
        assert_eq!(symbols.len(), 3);
    }

    #[test]
    fn empty_ticks_has_no_bounds() {
        let store = Store::in_memory().unwrap();
        assert_eq!(store.tick_time_bounds().unwrap(), None);
    }

    #[test]
    fn user_lookup_by_token() {
        let store = Store::in_memory().unwrap();
        store
            .upsert_user(&UserRow {
                auth_id: "tok-123".into(),
                email: "asha@example.com".into(),
                name: "Asha".into(),
                role: "admin".into(),
            })
            .unwrap();

        let user = store.user_by_token("tok-123").unwrap().unwrap();
        assert_eq!(user.email, "asha@example.com");
        assert!(user.is_admin());
        assert!(store.user_by_token("nope").unwrap().is_none());
    }

    #[test]
    fn portfolio_roundtrip_preserves_holdings() {
        let store = Store::in_memory().unwrap();
        let mut p = Portfolio::seeded("asha@example.com", "Asha", 1_000_000.0);
        p.cash = 750_000.0;
        p.holdings.insert(
            "RELIANCE".into(),
            Holding {
                qty: 100,
                avg_px: 2500.0,
                company_name: "Reliance Industries".into(),
            },
        );
        store.upsert_portfolio(&p).unwrap();

        let loaded = store.load_portfolio("asha@example.com").unwrap().unwrap();
        assert_eq!(loaded.cash, 750_000.0);
        assert_eq!(loaded.holdings["RELIANCE"].qty, 100);
        assert!(store.load_portfolio("ghost@example.com").unwrap().is_none());
    }

    #[test]
    fn apply_trade_is_transactional() {
        let store = Store::in_memory().unwrap();
        let p = Portfolio::seeded("asha@example.com", "Asha", 1_000_000.0);
        let trade = sample_trade("asha@example.com");
        let lot = ShortLot::open("asha@example.com", "RELIANCE", 10, 2500.0);

        store
            .apply_trade(&trade, &p, &[ShortOp::Insert(lot.clone())])
            .unwrap();
        assert_eq!(store.count_trades().unwrap(), 1);
        assert_eq!(store.count_active_shorts().unwrap(), 1);

        // Re-inserting the same trade id violates the primary key; nothing
        // from the failed transaction may land.
        let err = store.apply_trade(
            &trade,
            &p,
            &[ShortOp::Insert(ShortLot::open(
                "asha@example.com",
                "TCS",
                5,
                3900.0,
            ))],
        );
        assert!(err.is_err());
        assert_eq!(store.count_trades().unwrap(), 1);
        assert_eq!(store.count_active_shorts().unwrap(), 1);
    }

    #[test]
    fn wipe_transient_clears_everything() {
        let store = Store::in_memory().unwrap();
        let mut p = Portfolio::seeded("asha@example.com", "Asha", 1_000_000.0);
        p.cash = 500_000.0;
        p.realized_pnl = 42.0;
        store.upsert_portfolio(&p).unwrap();
        store.append_trade(&sample_trade("asha@example.com")).unwrap();
        store
            .apply_trade(
                &sample_trade("asha@example.com"),
                &p,
                &[ShortOp::Insert(ShortLot::open(
                    "asha@example.com",
                    "RELIANCE",
                    10,
                    2500.0,
                ))],
            )
            .unwrap();

        let counts = store.wipe_transient(1_000_000.0).unwrap();
        assert_eq!(counts.trades_deleted, 2);
        assert_eq!(counts.shorts_deleted, 1);
        assert_eq!(counts.portfolios_reset, 1);

        assert_eq!(store.count_trades().unwrap(), 0);
        assert_eq!(store.count_active_shorts().unwrap(), 0);
        let p = store.load_portfolio("asha@example.com").unwrap().unwrap();
        assert_eq!(p.cash, 1_000_000.0);
        assert!(p.holdings.is_empty());
        assert_eq!(p.realized_pnl, 0.0);
    }

    #[test]
    fn stale_contests_are_stopped() {
        let store = Store::in_memory().unwrap();
        store
            .insert_contest(
                "c1",
                "RUNNING",
                "2026-08-01T10:00:00Z",
                3600,
                &["RELIANCE".to_string()],
                0,
                3_600_000,
                6.0,
            )
            .unwrap();
        assert_eq!(store.mark_stale_contests_stopped().unwrap(), 1);
        assert_eq!(store.mark_stale_contests_stopped().unwrap(), 0);
    }
}
