//! In-memory Deriv API doubles for exercising wick end-to-end flows.

pub mod state;
pub mod websocket;

pub use state::{buy_row, candle, contract_snapshot, ohlc, sell_row, MockDerivState};
pub use websocket::MockDerivServer;
