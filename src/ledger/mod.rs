//! Ledger collaborator seams
//!
//! The engine never talks to a transport directly. It consumes:
//! - [`LedgerRpc`] for point-in-time reads and command submission
//! - [`EventSource`] for the ordered per-contract event subscriptions
//!
//! Values cross the seam as `serde_json::Value`; the helpers here parse the
//! shapes the ledger actually returns (decimal strings, JSON numbers, 0x hex).

pub mod fixture;

pub use fixture::FixtureLedger;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{normalize_address, Address};

/// One item of a contract's event subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub event: String,
    /// Emitting contract
    #[serde(default)]
    pub address: Address,
    #[serde(default, alias = "returnValues")]
    pub return_values: Map<String, Value>,
    #[serde(default, alias = "blockNumber")]
    pub block_number: u64,
    #[serde(default, alias = "transactionHash")]
    pub transaction_hash: String,
    /// Unix seconds, when the transport knows the block time
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl RawEvent {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            address: Address::new(),
            return_values: Map::new(),
            block_number: 0,
            transaction_hash: String::new(),
            timestamp: None,
        }
    }

    pub fn from_contract(mut self, address: &str) -> Self {
        self.address = normalize_address(address);
        self
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.return_values.insert(field.to_string(), value.into());
        self
    }

    pub fn at_block(mut self, block_number: u64) -> Self {
        self.block_number = block_number;
        self
    }

    pub fn with_tx(mut self, transaction_hash: &str) -> Self {
        self.transaction_hash = transaction_hash.to_string();
        self
    }

    pub fn at_time(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// First present, non-null field among `names`.
    pub fn field(&self, names: &[&str]) -> Option<&Value> {
        names
            .iter()
            .filter_map(|name| self.return_values.get(*name))
            .find(|v| !v.is_null())
    }
}

pub type EventStream = BoxStream<'static, anyhow::Result<RawEvent>>;

/// Request/response reads and fire-and-forget transactions.
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    async fn call(&self, to: &str, method: &str, args: &[Value]) -> anyhow::Result<Value>;

    /// Submits a transaction and returns its hash once the ledger accepts it.
    async fn send(&self, to: &str, method: &str, args: &[Value]) -> anyhow::Result<String>;
}

/// Ordered event feed for one contract, optionally resuming from a block.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self, contract: &str, from_block: Option<u64>)
        -> anyhow::Result<EventStream>;
}

/// Parses a uint256 from a decimal string, a JSON number or 0x hex.
pub fn parse_amount(value: &Value) -> Option<BigUint> {
    match value {
        Value::Number(n) => n.as_u64().map(BigUint::from),
        Value::String(s) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                if hex.is_empty() {
                    return Some(BigUint::default());
                }
                BigUint::parse_bytes(hex.as_bytes(), 16)
            } else {
                BigUint::parse_bytes(s.as_bytes(), 10)
            }
        }
        _ => None,
    }
}

pub fn parse_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        }
        _ => None,
    }
}

pub fn parse_u32(value: &Value) -> Option<u32> {
    parse_u64(value).and_then(|v| u32::try_from(v).ok())
}

pub fn parse_address(value: &Value) -> Option<Address> {
    value
        .as_str()
        .map(normalize_address)
        .filter(|a| !a.is_empty())
}
