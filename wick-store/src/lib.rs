//! Order buffering and durable storage.
//!
//! Orders are buffered in a per-bot [`OrderLog`] while trading and flushed
//! to SQLite on an interval, so a crash costs at most one flush window.

mod order_log;
mod sqlite;

use thiserror::Error;

pub use order_log::{OrderLog, OrderRecord};
pub use sqlite::{BotStore, OrderStore, SqliteStore};

/// Convenience alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors produced by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A stored row that no longer parses into domain types.
    #[error("corrupt record: {0}")]
    Corrupt(String),
    /// The connection mutex was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    Poisoned,
}
