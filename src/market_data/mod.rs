pub mod candle_buffer;
pub mod ticker;

// Re-export the core types for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle_buffer::{Candle, CandleBuffer, CandleKey};
pub use ticker::{TickerBoard, TickerPrice};
