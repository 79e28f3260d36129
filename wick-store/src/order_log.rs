//! In-memory buffer of one bot's orders between persistence flushes.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::error;
use wick_core::{BinaryOrder, BotKey};

/// One order together with the identity of the bot that produced it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrderRecord {
    pub bot_id: String,
    pub key: BotKey,
    pub order: BinaryOrder,
}

impl OrderRecord {
    /// Broker contract id; empty for orders that failed before a buy.
    #[must_use]
    pub fn order_id(&self) -> &str {
        &self.order.order_id
    }
}

/// Shared, mutation-heavy buffer of recent orders for one bot.
///
/// Writers upsert by order id as contract updates stream in; the flush
/// loop drains the buffer and, should persistence fail, restores what it
/// took so the next flush retries it. Entries updated in the meantime are
/// kept over their restored older versions.
#[derive(Clone)]
pub struct OrderLog {
    bot_id: String,
    key: BotKey,
    entries: Arc<Mutex<Vec<OrderRecord>>>,
}

impl OrderLog {
    #[must_use]
    pub fn new(bot_id: impl Into<String>, key: BotKey) -> Self {
        Self {
            bot_id: bot_id.into(),
            key,
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    #[must_use]
    pub fn key(&self) -> &BotKey {
        &self.key
    }

    /// Insert or replace the buffered entry with this order's id.
    pub fn upsert(&self, order: BinaryOrder) {
        let record = OrderRecord {
            bot_id: self.bot_id.clone(),
            key: self.key.clone(),
            order,
        };
        let Ok(mut entries) = self.entries.lock() else {
            error!(bot = %self.key, "order log lock poisoned; dropping order update");
            return;
        };
        match entries
            .iter_mut()
            .find(|entry| entry.order.order_id == record.order.order_id)
        {
            Some(existing) => *existing = record,
            None => entries.push(record),
        }
    }

    /// Snapshot the buffered orders without clearing them.
    #[must_use]
    pub fn orders(&self) -> Vec<OrderRecord> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Take every buffered order, leaving the buffer empty.
    #[must_use]
    pub fn drain(&self) -> Vec<OrderRecord> {
        self.entries
            .lock()
            .map(|mut entries| std::mem::take(&mut *entries))
            .unwrap_or_default()
    }

    /// Put drained records back after a failed flush. Records whose order
    /// id reappeared in the buffer since the drain are dropped in favour
    /// of the newer entry.
    pub fn restore(&self, records: Vec<OrderRecord>) {
        let Ok(mut entries) = self.entries.lock() else {
            error!(bot = %self.key, "order log lock poisoned; dropping restored orders");
            return;
        };
        for record in records {
            let present = entries
                .iter()
                .any(|entry| entry.order.order_id == record.order.order_id);
            if !present {
                entries.push(record);
            }
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
