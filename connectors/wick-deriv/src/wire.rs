//! Frame decoding for the Deriv JSON protocol.
//!
//! Deriv is loose about numeric types: the same field arrives as a JSON
//! number on one account and a quoted string on another, so every scalar
//! goes through the tolerant helpers below instead of serde derives.

use rust_decimal::Decimal;
use serde_json::Value;

use wick_broker::{BrokerError, BrokerResult, BuyReceipt, Proposal, StatementTransaction};
use wick_core::Bar;

/// Extracts the in-band `error` object, if any.
pub(crate) fn error_from(value: &Value) -> Option<BrokerError> {
    let error = value.get("error")?;
    let code = error
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or("UnknownError")
        .to_string();
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unspecified error")
        .to_string();
    Some(BrokerError::Exchange { code, message })
}

fn field_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn field_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn field_decimal(value: Option<&Value>) -> Option<Decimal> {
    match value? {
        Value::Number(n) => n.as_f64().and_then(|f| Decimal::try_from(f).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn field_flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => s == "1" || s == "true",
        _ => false,
    }
}

fn malformed(what: &str) -> BrokerError {
    BrokerError::malformed(what)
}

/// Decodes the `candles` array of a `ticks_history` response.
pub(crate) fn parse_candle_history(value: &Value) -> BrokerResult<Vec<Bar>> {
    let candles = value
        .get("candles")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("missing candles array"))?;
    candles.iter().map(parse_candle).collect()
}

fn parse_candle(candle: &Value) -> BrokerResult<Bar> {
    let epoch = field_i64(candle.get("epoch")).ok_or_else(|| malformed("candle epoch"))?;
    let close = field_f64(candle.get("close")).ok_or_else(|| malformed("candle close"))?;
    Ok(Bar {
        timestamp: epoch * 1000,
        open: field_f64(candle.get("open")),
        high: field_f64(candle.get("high")),
        low: field_f64(candle.get("low")),
        close,
        volume: field_f64(candle.get("volume")),
    })
}

/// Decodes a streaming `ohlc` push. Returns `Ok(None)` for frames on the
/// same subscription that carry no candle, such as the subscription ack.
pub(crate) fn parse_ohlc_push(value: &Value) -> BrokerResult<Option<Bar>> {
    let Some(ohlc) = value.get("ohlc") else {
        return Ok(None);
    };
    let epoch = field_i64(ohlc.get("open_time"))
        .or_else(|| field_i64(ohlc.get("epoch")))
        .ok_or_else(|| malformed("ohlc open_time"))?;
    let close = field_f64(ohlc.get("close")).ok_or_else(|| malformed("ohlc close"))?;
    Ok(Some(Bar {
        timestamp: epoch * 1000,
        open: field_f64(ohlc.get("open")),
        high: field_f64(ohlc.get("high")),
        low: field_f64(ohlc.get("low")),
        close,
        volume: None,
    }))
}

/// Decodes a `proposal` response. A present frame with an empty id is a
/// valid rejection, not a protocol error.
pub(crate) fn parse_proposal(value: &Value) -> BrokerResult<Proposal> {
    let proposal = value
        .get("proposal")
        .ok_or_else(|| malformed("missing proposal"))?;
    let id = proposal
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(Proposal {
        id,
        ask_price: field_decimal(proposal.get("ask_price")).unwrap_or_default(),
        payout: field_decimal(proposal.get("payout")),
        message: proposal
            .get("validation_error")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Decodes a `buy` response into a receipt.
pub(crate) fn parse_buy(value: &Value) -> BrokerResult<BuyReceipt> {
    let buy = value.get("buy").ok_or_else(|| malformed("missing buy"))?;
    let contract_id =
        field_i64(buy.get("contract_id")).ok_or_else(|| malformed("buy contract_id"))?;
    Ok(BuyReceipt {
        contract_id,
        buy_price: field_decimal(buy.get("buy_price")).unwrap_or_default(),
        payout: field_decimal(buy.get("payout")),
        start_time: field_i64(buy.get("start_time"))
            .or_else(|| field_i64(buy.get("purchase_time"))),
    })
}

/// One `proposal_open_contract` status snapshot.
#[derive(Debug, Clone)]
pub(crate) struct ContractUpdate {
    pub status: String,
    pub is_sold: bool,
    pub sell_price: Option<Decimal>,
    pub subscription_id: Option<String>,
}

/// Decodes a contract status push. Frames without the contract object
/// (subscription bookkeeping) come back as `Ok(None)`.
pub(crate) fn parse_contract_update(value: &Value) -> BrokerResult<Option<ContractUpdate>> {
    let Some(contract) = value.get("proposal_open_contract") else {
        return Ok(None);
    };
    let status = contract
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("open")
        .to_string();
    Ok(Some(ContractUpdate {
        status,
        is_sold: field_flag(contract.get("is_sold")),
        sell_price: field_decimal(contract.get("sell_price")),
        subscription_id: value
            .get("subscription")
            .and_then(|s| s.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string),
    }))
}

/// Decodes the transaction rows of a `statement` response.
pub(crate) fn parse_statement(value: &Value) -> BrokerResult<Vec<StatementTransaction>> {
    let transactions = value
        .get("statement")
        .and_then(|s| s.get("transactions"))
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("missing statement transactions"))?;
    transactions.iter().map(parse_transaction).collect()
}

fn parse_transaction(row: &Value) -> BrokerResult<StatementTransaction> {
    let action_type = row
        .get("action_type")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("transaction action_type"))?
        .to_string();
    let amount = field_decimal(row.get("amount")).ok_or_else(|| malformed("transaction amount"))?;
    Ok(StatementTransaction {
        action_type,
        contract_id: field_i64(row.get("contract_id")),
        transaction_id: field_i64(row.get("transaction_id")),
        amount,
        payout: field_decimal(row.get("payout")),
        sell_price: field_decimal(row.get("sell_price")),
        transaction_time: field_i64(row.get("transaction_time")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    #[test]
    fn candle_history_accepts_numbers_and_strings() {
        let frame = json!({
            "msg_type": "candles",
            "candles": [
                { "epoch": 60, "open": 1.0, "high": 1.2, "low": 0.9, "close": 1.1 },
                { "epoch": "120", "open": "1.1", "high": "1.3", "low": "1.0", "close": "1.2" },
            ],
        });
        let bars = parse_candle_history(&frame).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].timestamp, 60_000);
        assert_eq!(bars[1].timestamp, 120_000);
        assert_eq!(bars[1].close, 1.2);
        assert_eq!(bars[1].open, Some(1.1));
    }

    #[test]
    fn candle_without_close_is_malformed() {
        let frame = json!({ "candles": [{ "epoch": 60 }] });
        assert!(parse_candle_history(&frame).is_err());
    }

    #[test]
    fn ohlc_push_prefers_open_time() {
        let frame = json!({
            "msg_type": "ohlc",
            "ohlc": { "open_time": 180, "epoch": 191, "open": 2.0, "high": 2.1, "low": 1.9, "close": 2.05 },
        });
        let bar = parse_ohlc_push(&frame).unwrap().unwrap();
        assert_eq!(bar.timestamp, 180_000);
        assert_eq!(bar.close, 2.05);
    }

    #[test]
    fn ohlc_push_falls_back_to_epoch() {
        let frame = json!({ "ohlc": { "epoch": 240, "close": "3.5" } });
        let bar = parse_ohlc_push(&frame).unwrap().unwrap();
        assert_eq!(bar.timestamp, 240_000);
        assert_eq!(bar.close, 3.5);
        assert_eq!(bar.open, None);
    }

    #[test]
    fn frame_without_ohlc_is_skipped() {
        let frame = json!({ "msg_type": "candles", "subscription": { "id": "abc" } });
        assert!(parse_ohlc_push(&frame).unwrap().is_none());
    }

    #[test]
    fn error_object_maps_to_exchange_error() {
        let frame = json!({
            "error": { "code": "InvalidToken", "message": "the token is invalid" },
            "msg_type": "authorize",
        });
        match error_from(&frame) {
            Some(BrokerError::Exchange { code, message }) => {
                assert_eq!(code, "InvalidToken");
                assert_eq!(message, "the token is invalid");
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn clean_frame_has_no_error() {
        assert!(error_from(&json!({ "msg_type": "ping", "ping": "pong" })).is_none());
    }

    #[test]
    fn proposal_with_empty_id_is_rejected() {
        let frame = json!({ "proposal": { "id": "", "ask_price": "5.0" } });
        let proposal = parse_proposal(&frame).unwrap();
        assert!(proposal.is_rejected());
        assert_eq!(proposal.ask_price, dec("5.0"));
    }

    #[test]
    fn proposal_parses_prices() {
        let frame = json!({
            "proposal": { "id": "p-1", "ask_price": 5.5, "payout": "10.69" },
        });
        let proposal = parse_proposal(&frame).unwrap();
        assert!(!proposal.is_rejected());
        assert_eq!(proposal.payout, Some(dec("10.69")));
    }

    #[test]
    fn buy_receipt_parses() {
        let frame = json!({
            "buy": {
                "contract_id": 123456789,
                "buy_price": "5.5",
                "payout": 10.69,
                "purchase_time": 1700000000,
            },
        });
        let receipt = parse_buy(&frame).unwrap();
        assert_eq!(receipt.contract_id, 123_456_789);
        assert_eq!(receipt.buy_price, dec("5.5"));
        assert_eq!(receipt.start_time, Some(1_700_000_000));
    }

    #[test]
    fn contract_update_reads_numeric_is_sold() {
        let frame = json!({
            "proposal_open_contract": {
                "contract_id": 1,
                "status": "won",
                "is_sold": 1,
                "sell_price": "10.69",
            },
            "subscription": { "id": "sub-7" },
        });
        let update = parse_contract_update(&frame).unwrap().unwrap();
        assert!(update.is_sold);
        assert_eq!(update.status, "won");
        assert_eq!(update.sell_price, Some(dec("10.69")));
        assert_eq!(update.subscription_id.as_deref(), Some("sub-7"));
    }

    #[test]
    fn open_contract_is_not_sold() {
        let frame = json!({
            "proposal_open_contract": { "contract_id": 1, "status": "open", "is_sold": 0 },
        });
        let update = parse_contract_update(&frame).unwrap().unwrap();
        assert!(!update.is_sold);
    }

    #[test]
    fn statement_rows_parse() {
        let frame = json!({
            "statement": {
                "count": 2,
                "transactions": [
                    {
                        "action_type": "sell",
                        "contract_id": 11,
                        "transaction_id": 501,
                        "amount": "10.69",
                        "payout": 10.69,
                        "transaction_time": 1700000100,
                    },
                    {
                        "action_type": "buy",
                        "contract_id": 11,
                        "transaction_id": 500,
                        "amount": -5.5,
                        "transaction_time": 1700000000,
                    },
                ],
            },
        });
        let rows = parse_statement(&frame).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].action_type, "sell");
        assert_eq!(rows[0].amount, dec("10.69"));
        assert!(rows[0].settles("11"));
        assert!(!rows[1].settles("11"));
    }
}
