//! Contract purchase requests and the orders they produce.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{OrderId, Symbol};

/// Free-form JSON captured from a strategy at the moment it fired, stored
/// alongside the resulting order for later inspection.
pub type SignalSnapshot = serde_json::Value;

/// Binary option contract families.
///
/// The plain variants settle in the buyer's favour only on a strict move;
/// the `E` variants ("equals") also win when the exit spot matches the entry.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ContractType {
    #[serde(rename = "CALL")]
    Call,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "CALLE")]
    CallE,
    #[serde(rename = "PUTE")]
    PutE,
}

impl ContractType {
    /// Wire identifier the broker expects in proposal requests.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Call => "CALL",
            Self::Put => "PUT",
            Self::CallE => "CALLE",
            Self::PutE => "PUTE",
        }
    }

    /// Whether the contract profits from a rising market.
    #[must_use]
    pub fn is_rise(self) -> bool {
        matches!(self, Self::Call | Self::CallE)
    }
}

impl fmt::Display for ContractType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for ContractType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_uppercase().as_str() {
            "CALL" => Ok(Self::Call),
            "PUT" => Ok(Self::Put),
            "CALLE" => Ok(Self::CallE),
            "PUTE" => Ok(Self::PutE),
            other => Err(format!("unsupported contract type '{other}'")),
        }
    }
}

/// Whether the requested amount is the stake paid or the payout sought.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Basis {
    #[default]
    Stake,
    Payout,
}

impl Basis {
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Stake => "stake",
            Self::Payout => "payout",
        }
    }
}

impl fmt::Display for Basis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Basis {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "stake" => Ok(Self::Stake),
            "payout" => Ok(Self::Payout),
            other => Err(format!("unsupported basis '{other}'")),
        }
    }
}

/// Unit of a contract's duration.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum DurationUnit {
    #[serde(rename = "t")]
    Tick,
    #[default]
    #[serde(rename = "s")]
    Second,
    #[serde(rename = "m")]
    Minute,
    #[serde(rename = "h")]
    Hour,
    #[serde(rename = "d")]
    Day,
}

impl DurationUnit {
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Tick => "t",
            Self::Second => "s",
            Self::Minute => "m",
            Self::Hour => "h",
            Self::Day => "d",
        }
    }
}

impl fmt::Display for DurationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for DurationUnit {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "t" | "tick" | "ticks" => Ok(Self::Tick),
            "s" | "second" | "seconds" => Ok(Self::Second),
            "m" | "minute" | "minutes" => Ok(Self::Minute),
            "h" | "hour" | "hours" => Ok(Self::Hour),
            "d" | "day" | "days" => Ok(Self::Day),
            other => Err(format!("unsupported duration unit '{other}'")),
        }
    }
}

/// Lifecycle state of a purchased (or attempted) contract.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Bought and awaiting settlement.
    Pending,
    /// Settled with a known result.
    Completed,
    /// Never purchased, typically because the proposal was rejected.
    Failed,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// Financial outcome of a settled contract.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderResult {
    Win,
    Loss,
    /// Stake returned without profit (settled between zero and full payout).
    Tie,
}

impl fmt::Display for OrderResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Win => "WIN",
            Self::Loss => "LOSS",
            Self::Tie => "TIE",
        };
        f.write_str(label)
    }
}

/// Everything a broker needs to price and buy one binary contract.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ContractRequest {
    pub symbol: Symbol,
    pub amount: Decimal,
    pub basis: Basis,
    pub contract_type: ContractType,
    pub currency: String,
    pub duration: u32,
    pub duration_unit: DurationUnit,
}

impl ContractRequest {
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, contract_type: ContractType, amount: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            amount,
            basis: Basis::Stake,
            contract_type,
            currency: "USD".to_string(),
            duration: 120,
            duration_unit: DurationUnit::Second,
        }
    }

    #[must_use]
    pub fn with_duration(mut self, duration: u32, unit: DurationUnit) -> Self {
        self.duration = duration;
        self.duration_unit = unit;
        self
    }

    #[must_use]
    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    #[must_use]
    pub fn with_basis(mut self, basis: Basis) -> Self {
        self.basis = basis;
        self
    }
}

/// A binary option order as tracked from purchase attempt to settlement.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BinaryOrder {
    /// Broker contract id; empty when the purchase never happened.
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub amount: Decimal,
    pub basis: Basis,
    pub contract_type: ContractType,
    pub status: OrderStatus,
    pub result: Option<OrderResult>,
    /// Payout promised at purchase time.
    pub expected_payout: Option<Decimal>,
    /// Amount actually credited at settlement.
    pub actual_payout: Option<Decimal>,
    /// Purchase time reported by the broker, epoch seconds.
    pub start_time: Option<i64>,
    pub duration: u32,
    pub duration_unit: DurationUnit,
    pub signal_snapshot: SignalSnapshot,
    pub message: Option<String>,
}

impl BinaryOrder {
    /// Order representing a purchase that was rejected before a buy; no
    /// contract id exists and the status is terminal from the start.
    #[must_use]
    pub fn failed(
        request: &ContractRequest,
        snapshot: SignalSnapshot,
        message: impl Into<String>,
    ) -> Self {
        Self {
            order_id: OrderId::new(),
            symbol: request.symbol.clone(),
            amount: request.amount,
            basis: request.basis,
            contract_type: request.contract_type,
            status: OrderStatus::Failed,
            result: None,
            expected_payout: None,
            actual_payout: None,
            start_time: None,
            duration: request.duration,
            duration_unit: request.duration_unit,
            signal_snapshot: snapshot,
            message: Some(message.into()),
        }
    }

    /// Freshly purchased order awaiting settlement.
    #[must_use]
    pub fn pending(
        request: &ContractRequest,
        order_id: impl Into<OrderId>,
        expected_payout: Option<Decimal>,
        start_time: Option<i64>,
        snapshot: SignalSnapshot,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            symbol: request.symbol.clone(),
            amount: request.amount,
            basis: request.basis,
            contract_type: request.contract_type,
            status: OrderStatus::Pending,
            result: None,
            expected_payout,
            actual_payout: None,
            start_time,
            duration: request.duration,
            duration_unit: request.duration_unit,
            signal_snapshot: snapshot,
            message: None,
        }
    }

    /// Mark the order settled with its financial outcome.
    pub fn settle(&mut self, result: OrderResult, actual_payout: Option<Decimal>) {
        self.status = OrderStatus::Completed;
        self.result = Some(result);
        self.actual_payout = actual_payout;
    }

    /// True once the order can no longer change state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, OrderStatus::Completed | OrderStatus::Failed)
    }
}
