//! SQLite-backed durable storage for orders and bot run history.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use wick_core::{BinaryOrder, BotKey, RunLogEntry, RunLogKind};

use crate::{OrderRecord, StoreError, StoreResult};

/// Durable order storage.
pub trait OrderStore: Send + Sync {
    /// Insert the record or replace the one sharing its order id.
    fn upsert_order(&self, record: &OrderRecord) -> StoreResult<()>;

    /// Fetch one order by its broker contract id.
    fn order(&self, order_id: &str) -> StoreResult<Option<OrderRecord>>;

    /// Every stored order still awaiting settlement.
    fn pending_orders(&self) -> StoreResult<Vec<OrderRecord>>;

    /// Every stored order belonging to one bot, oldest first.
    fn orders_for_bot(&self, bot_id: &str) -> StoreResult<Vec<OrderRecord>>;
}

/// Durable bot registry and run history.
pub trait BotStore: Send + Sync {
    fn upsert_bot(&self, bot_id: &str, name: &str) -> StoreResult<()>;

    /// Append one entry to the bot's run history. The history is
    /// append-only; nothing ever rewrites it.
    fn append_run_log(&self, bot_id: &str, entry: &RunLogEntry) -> StoreResult<()>;

    fn run_log(&self, bot_id: &str) -> StoreResult<Vec<RunLogEntry>>;
}

/// SQLite implementation of both store traits.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Fresh private database, handy for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL,
                broker TEXT NOT NULL,
                strategy TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
            CREATE INDEX IF NOT EXISTS idx_orders_bot ON orders(bot_id);

            CREATE TABLE IF NOT EXISTS bots (
                bot_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS bot_run_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bot_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                error TEXT,
                at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_run_logs_bot ON bot_run_logs(bot_id);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl OrderStore for SqliteStore {
    fn upsert_order(&self, record: &OrderRecord) -> StoreResult<()> {
        let payload = serde_json::to_string(&record.order)?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO orders (order_id, bot_id, broker, strategy, symbol, timeframe, status, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(order_id) DO UPDATE SET
                status = excluded.status,
                payload = excluded.payload,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                record.order.order_id,
                record.bot_id,
                record.key.broker.as_str(),
                record.key.strategy.as_str(),
                record.key.symbol,
                record.key.timeframe.label(),
                record.order.status.to_string(),
                payload,
            ],
        )?;
        Ok(())
    }

    fn order(&self, order_id: &str) -> StoreResult<Option<OrderRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT bot_id, broker, strategy, symbol, timeframe, payload
             FROM orders WHERE order_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![order_id], row_to_parts)?;
        match rows.next() {
            Some(row) => Ok(Some(parts_to_record(row?)?)),
            None => Ok(None),
        }
    }

    fn pending_orders(&self) -> StoreResult<Vec<OrderRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT bot_id, broker, strategy, symbol, timeframe, payload
             FROM orders WHERE status = 'PENDING' ORDER BY rowid",
        )?;
        let rows = stmt.query_map([], row_to_parts)?;
        collect_records(rows)
    }

    fn orders_for_bot(&self, bot_id: &str) -> StoreResult<Vec<OrderRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT bot_id, broker, strategy, symbol, timeframe, payload
             FROM orders WHERE bot_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![bot_id], row_to_parts)?;
        collect_records(rows)
    }
}

impl BotStore for SqliteStore {
    fn upsert_bot(&self, bot_id: &str, name: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO bots (bot_id, name)
            VALUES (?1, ?2)
            ON CONFLICT(bot_id) DO UPDATE SET name = excluded.name
            "#,
            params![bot_id, name],
        )?;
        Ok(())
    }

    fn append_run_log(&self, bot_id: &str, entry: &RunLogEntry) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO bot_run_logs (bot_id, kind, message, error, at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                bot_id,
                entry.kind.to_string(),
                entry.message,
                entry.error,
                entry.at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn run_log(&self, bot_id: &str) -> StoreResult<Vec<RunLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT kind, message, error, at FROM bot_run_logs
             WHERE bot_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![bot_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (kind, message, error, at) = row?;
            let kind = match kind.as_str() {
                "START" => RunLogKind::Start,
                "STOP" => RunLogKind::Stop,
                other => {
                    return Err(StoreError::Corrupt(format!(
                        "unknown run log kind '{other}'"
                    )))
                }
            };
            let at = DateTime::parse_from_rfc3339(&at)
                .map_err(|err| StoreError::Corrupt(format!("bad run log timestamp: {err}")))?
                .with_timezone(&Utc);
            entries.push(RunLogEntry {
                kind,
                at,
                message,
                error,
            });
        }
        Ok(entries)
    }
}

type RowParts = (String, String, String, String, String, String);

fn row_to_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<RowParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn parts_to_record(parts: RowParts) -> StoreResult<OrderRecord> {
    let (bot_id, broker, strategy, symbol, timeframe, payload) = parts;
    let key = BotKey {
        broker: broker.parse().map_err(StoreError::Corrupt)?,
        strategy: strategy.parse().map_err(StoreError::Corrupt)?,
        symbol,
        timeframe: timeframe.parse().map_err(StoreError::Corrupt)?,
    };
    let order: BinaryOrder = serde_json::from_str(&payload)?;
    Ok(OrderRecord {
        bot_id,
        key,
        order,
    })
}

fn collect_records(
    rows: impl Iterator<Item = rusqlite::Result<RowParts>>,
) -> StoreResult<Vec<OrderRecord>> {
    let mut records = Vec::new();
    for row in rows {
        records.push(parts_to_record(row?)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;
    use wick_core::{
        BotSpec, BrokerKind, ContractRequest, ContractType, OrderResult, OrderStatus, StrategyKind,
        Timeframe,
    };

    fn spec() -> BotSpec {
        BotSpec::new(
            BrokerKind::Deriv,
            StrategyKind::TripleEma,
            "R_10",
            Timeframe::M1,
        )
    }

    fn record(spec: &BotSpec, order_id: &str) -> OrderRecord {
        let request = ContractRequest::new("R_10", ContractType::CallE, Decimal::ONE);
        OrderRecord {
            bot_id: spec.bot_id.clone(),
            key: spec.key(),
            order: BinaryOrder::pending(
                &request,
                order_id,
                Some(Decimal::new(195, 2)),
                Some(1_700_000_000),
                json!({"signal": "rise"}),
            ),
        }
    }

    #[test]
    fn orders_round_trip_through_sqlite() {
        let store = SqliteStore::open_in_memory().unwrap();
        let spec = spec();
        let rec = record(&spec, "12345");
        store.upsert_order(&rec).unwrap();

        let loaded = store.order("12345").unwrap().unwrap();
        assert_eq!(loaded, rec);
    }

    #[test]
    fn upsert_replaces_the_existing_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        let spec = spec();
        let mut rec = record(&spec, "12345");
        store.upsert_order(&rec).unwrap();

        rec.order.settle(OrderResult::Win, Some(Decimal::new(195, 2)));
        store.upsert_order(&rec).unwrap();

        let pending = store.pending_orders().unwrap();
        assert!(pending.is_empty());
        let loaded = store.order("12345").unwrap().unwrap();
        assert_eq!(loaded.order.status, OrderStatus::Completed);
        assert_eq!(loaded.order.result, Some(OrderResult::Win));
    }

    #[test]
    fn pending_orders_filters_by_status() {
        let store = SqliteStore::open_in_memory().unwrap();
        let spec = spec();
        let open = record(&spec, "111");
        let mut settled = record(&spec, "222");
        settled.order.settle(OrderResult::Loss, Some(Decimal::ZERO));

        store.upsert_order(&open).unwrap();
        store.upsert_order(&settled).unwrap();

        let pending = store.pending_orders().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].order_id(), "111");
    }

    #[test]
    fn orders_for_bot_ignores_other_bots() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = spec();
        let mut second = spec();
        second.bot_id = "other-bot".to_string();

        store.upsert_order(&record(&first, "111")).unwrap();
        store.upsert_order(&record(&second, "222")).unwrap();

        let mine = store.orders_for_bot(&first.bot_id).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].order_id(), "111");
    }

    #[test]
    fn run_log_is_append_only_and_ordered() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_bot("bot-1", "demo").unwrap();
        store
            .append_run_log("bot-1", &RunLogEntry::start("bot start accepted"))
            .unwrap();
        store
            .append_run_log(
                "bot-1",
                &RunLogEntry::stop_with_error("worker exited", "socket closed"),
            )
            .unwrap();

        let entries = store.run_log("bot-1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, RunLogKind::Start);
        assert_eq!(entries[1].kind, RunLogKind::Stop);
        assert_eq!(entries[1].error.as_deref(), Some("socket closed"));
    }

    #[test]
    fn data_survives_reopening_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wick.db");
        let spec = spec();

        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert_order(&record(&spec, "777")).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.order("777").unwrap().unwrap();
        assert_eq!(loaded.order_id(), "777");
    }
}
