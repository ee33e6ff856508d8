// =============================================================================
// Shared types used across the Tick Arena contest engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single historical tick loaded from storage.
///
/// In the source corpus every OHLC field collapses to the last traded price
/// of the sample; the canonical representation preserves all columns so that
/// candle building stays explicit about which field it reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub ltp: f64,
    pub volume: f64,
}

/// Round a monetary value to 2 decimals, the boundary precision for every
/// price, total, and valuation figure the engine reports or persists.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Lifecycle state of the (single) contest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContestStatus {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl Default for ContestStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl ContestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Stopped => "STOPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "IDLE" => Some(Self::Idle),
            "RUNNING" => Some(Self::Running),
            "PAUSED" => Some(Self::Paused),
            "STOPPED" => Some(Self::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four order types a participant may submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Buy,
    Sell,
    ShortSell,
    BuyToCover,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::ShortSell => "SHORT_SELL",
            Self::BuyToCover => "BUY_TO_COVER",
        }
    }

    /// Parse the wire form. Accepts either case (`buy` / `BUY`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            "SHORT_SELL" => Some(Self::ShortSell),
            "BUY_TO_COVER" => Some(Self::BuyToCover),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-visible error kinds. Every rejection the engine reports to a client
/// maps to exactly one of these; the REST layer turns them into
/// `{"error": message}` bodies with the status from [`EngineError::http_status`].
#[derive(Debug, Clone)]
pub enum EngineError {
    NotRunning,
    InvalidQty,
    NoPrice(String),
    InsufficientCash { required: f64, available: f64 },
    InsufficientHoldings { symbol: String, requested: i64, held: i64 },
    NoShorts { symbol: String, requested: i64, open: i64 },
    Unauthorized,
    Forbidden,
    NotFound(String),
    Storage(String),
    ContestConflict(String),
}

impl EngineError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotRunning => "NOT_RUNNING",
            Self::InvalidQty => "INVALID_QTY",
            Self::NoPrice(_) => "NO_PRICE",
            Self::InsufficientCash { .. } => "INSUFFICIENT_CASH",
            Self::InsufficientHoldings { .. } => "INSUFFICIENT_HOLDINGS",
            Self::NoShorts { .. } => "NO_SHORTS",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::ContestConflict(_) => "CONTEST_CONFLICT",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotRunning
            | Self::InvalidQty
            | Self::NoPrice(_)
            | Self::InsufficientCash { .. }
            | Self::InsufficientHoldings { .. }
            | Self::NoShorts { .. } => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound(_) => 404,
            Self::ContestConflict(_) => 409,
            Self::Storage(_) => 500,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRunning => write!(f, "contest is not running"),
            Self::InvalidQty => write!(f, "quantity must be a positive integer"),
            Self::NoPrice(sym) => write!(f, "no price available for {sym}"),
            Self::InsufficientCash { required, available } => write!(
                f,
                "insufficient cash: need {required:.2}, have {available:.2}"
            ),
            Self::InsufficientHoldings {
                symbol,
                requested,
                held,
            } => write!(
                f,
                "insufficient holdings in {symbol}: selling {requested}, holding {held}"
            ),
            Self::NoShorts {
                symbol,
                requested,
                open,
            } => write!(
                f,
                "not enough open shorts in {symbol}: covering {requested}, open {open}"
            ),
            Self::Unauthorized => write!(f, "missing or invalid authorization token"),
            Self::Forbidden => write!(f, "admin privileges required"),
            Self::NotFound(what) => write!(f, "{what} not found"),
            Self::Storage(msg) => write!(f, "storage error: {msg}"),
            Self::ContestConflict(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
