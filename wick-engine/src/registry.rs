//! Maps a bot's broker choice to a concrete client.

use std::sync::Arc;

use wick_broker::{AccountHistory, BrokerClient, ContractTrader};
use wick_core::{BotSpec, BrokerKind};
use wick_deriv::DerivClient;
use wick_store::OrderLog;

use crate::EngineSettings;

/// The capability views of one broker connection.
///
/// Every field points at the same underlying client; they are split out
/// because the worker, the strategy and the reconciler each need a
/// different slice of it.
pub struct BrokerHandle {
    pub client: Arc<dyn BrokerClient>,
    pub trader: Arc<dyn ContractTrader>,
    pub history: Arc<dyn AccountHistory>,
}

/// Build the broker client a bot's worker will drive. Each bot gets its
/// own connection; nothing is shared between workers.
#[must_use]
pub fn build_broker(spec: &BotSpec, settings: &EngineSettings, log: OrderLog) -> BrokerHandle {
    match spec.broker {
        BrokerKind::Deriv => {
            let client = Arc::new(DerivClient::new(settings.deriv.clone(), log));
            BrokerHandle {
                trader: client.clone(),
                history: client.clone(),
                client,
            }
        }
    }
}
