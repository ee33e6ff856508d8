pub mod candle_cache;
pub mod price_index;
pub mod tick_loader;
pub mod timeframes;

// Re-export the core types for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle_cache::{Candle, CandleCache, CandleKey};
pub use price_index::PriceIndex;
pub use tick_loader::{DataBounds, TickWindowLoader};
