//! Settles pending orders against the broker's account statement.
//!
//! The live contract stream is the normal settlement path, but it does
//! not survive process restarts or dropped subscriptions. This pass is
//! the safety net: any order still pending in the store gets matched
//! against statement sell rows and settled from the amount credited.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use wick_broker::{classify_settlement, AccountHistory};
use wick_store::{OrderStore, SqliteStore};

use crate::shutdown::ShutdownSignal;
use crate::EngineError;

/// Consecutive failed passes after which the loop gives up.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

pub struct Reconciler {
    history: Arc<dyn AccountHistory>,
    store: Arc<SqliteStore>,
    page_size: u32,
}

impl Reconciler {
    #[must_use]
    pub fn new(history: Arc<dyn AccountHistory>, store: Arc<SqliteStore>, page_size: u32) -> Self {
        Self {
            history,
            store,
            page_size,
        }
    }

    /// One pass: fetch the statement once and settle every pending order
    /// with a matching sell row. Orders without one stay pending for a
    /// later pass. Returns how many orders were settled.
    pub async fn pass(&self) -> Result<usize, EngineError> {
        let store = Arc::clone(&self.store);
        let pending = tokio::task::spawn_blocking(move || store.pending_orders())
            .await
            .map_err(|err| EngineError::Background(err.to_string()))??;
        if pending.is_empty() {
            return Ok(0);
        }

        let rows = self.history.statement(self.page_size).await?;
        let mut settled = 0usize;
        for mut record in pending {
            let Some(row) = rows.iter().find(|row| row.settles(record.order_id())) else {
                continue;
            };
            // The sell row's credited amount is the settlement of record;
            // the payout on the row (or the one promised at purchase)
            // decides what that amount means.
            let result =
                classify_settlement(row.amount, row.payout, record.order.expected_payout);
            record.order.settle(result, Some(row.amount));
            info!(
                order_id = %record.order.order_id,
                bot = %record.key,
                result = %result,
                payout = %row.amount,
                "order settled from statement"
            );

            let store = Arc::clone(&self.store);
            let update = record.clone();
            tokio::task::spawn_blocking(move || store.upsert_order(&update))
                .await
                .map_err(|err| EngineError::Background(err.to_string()))??;
            settled += 1;
        }
        Ok(settled)
    }

    /// Periodic reconciliation until shutdown. The task ends early after
    /// [`MAX_CONSECUTIVE_FAILURES`] passes fail back to back; one good
    /// pass resets the count.
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut failures = 0u32;
            while shutdown.sleep(interval).await {
                match self.pass().await {
                    Ok(0) => failures = 0,
                    Ok(settled) => {
                        failures = 0;
                        info!(settled, "reconciliation settled orders");
                    }
                    Err(err) => {
                        failures += 1;
                        if failures >= MAX_CONSECUTIVE_FAILURES {
                            error!(error = %err, failures, "reconciliation abandoned");
                            return;
                        }
                        warn!(error = %err, failures, "reconciliation pass failed");
                    }
                }
            }
        })
    }
}
