//! Domain events
//!
//! The closed set of facts the projector understands. Raw ledger events are
//! mapped onto these by [`crate::normalize`]; a few internal variants are
//! produced by the engine itself (Init seeding, balance and metadata lookups).

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::models::{Address, BondedToken, ContractAddresses, OrderType, TokenMetadata};

/// Curve parameters carried by collateral add/update events.
///
/// `collateral` is `None` when the event came from the pool side, which
/// names the asset `token` instead of `collateralToken`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralParams {
    pub collateral: Option<Address>,
    pub virtual_supply: BigUint,
    pub virtual_balance: BigUint,
    pub reserve_ratio: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapParams {
    pub token: Address,
    pub rate: BigUint,
    pub floor: Option<BigUint>,
    /// Unix seconds
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderOpened {
    pub tx_hash: String,
    pub order_type: OrderType,
    pub address: Address,
    pub collateral: Address,
    pub batch_id: u64,
    pub amount: BigUint,
    /// Unix seconds
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReturned {
    pub order_type: OrderType,
    pub address: Address,
    pub collateral: Address,
    pub batch_id: u64,
}

/// Seed data looked up once at bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitData {
    pub addresses: ContractAddresses,
    pub bonded_token: BondedToken,
    pub ppm: u32,
    pub beneficiary: Option<Address>,
    pub maximum_tap_increase_pct: BigUint,
    /// Fresh reserve balances for collateral tokens known before Init
    pub balances: Vec<(Address, BigUint)>,
    /// Fresh metadata for collateral tokens known before Init
    pub metadata: Vec<(Address, TokenMetadata)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainEvent {
    Init(Box<InitData>),
    AccountChanged { account: Option<Address> },
    SyncStarted,
    SyncFinished,
    CollateralTokenAdded(CollateralParams),
    CollateralTokenUpdated(CollateralParams),
    CollateralTokenRemoved { collateral: Option<Address> },
    TapAdded(TapParams),
    TapUpdated(TapParams),
    TapRemoved { token: Address },
    MaximumTapIncreaseUpdated { pct: BigUint },
    BeneficiaryUpdated { beneficiary: Address },
    OrderOpened(OrderOpened),
    BatchCleared { batch_id: u64, collateral: Address },
    OrderReturned(OrderReturned),
    /// Vault activity for `token`; the engine turns it into a balance lookup.
    ReserveActivity { token: Address },
    ReserveBalanceChanged { token: Address, balance: BigUint },
    TokenMetadataResolved { token: Address, metadata: TokenMetadata },
}

impl DomainEvent {
    /// Stable name for logs and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::Init(_) => "init",
            DomainEvent::AccountChanged { .. } => "account_changed",
            DomainEvent::SyncStarted => "sync_started",
            DomainEvent::SyncFinished => "sync_finished",
            DomainEvent::CollateralTokenAdded(_) => "collateral_token_added",
            DomainEvent::CollateralTokenUpdated(_) => "collateral_token_updated",
            DomainEvent::CollateralTokenRemoved { .. } => "collateral_token_removed",
            DomainEvent::TapAdded(_) => "tap_added",
            DomainEvent::TapUpdated(_) => "tap_updated",
            DomainEvent::TapRemoved { .. } => "tap_removed",
            DomainEvent::MaximumTapIncreaseUpdated { .. } => "maximum_tap_increase_updated",
            DomainEvent::BeneficiaryUpdated { .. } => "beneficiary_updated",
            DomainEvent::OrderOpened(o) => match o.order_type {
                OrderType::Buy => "buy_order_opened",
                OrderType::Sell => "sell_order_opened",
            },
            DomainEvent::BatchCleared { .. } => "batch_cleared",
            DomainEvent::OrderReturned(r) => match r.order_type {
                OrderType::Buy => "buy_order_returned",
                OrderType::Sell => "sell_order_returned",
            },
            DomainEvent::ReserveActivity { .. } => "reserve_activity",
            DomainEvent::ReserveBalanceChanged { .. } => "reserve_balance_changed",
            DomainEvent::TokenMetadataResolved { .. } => "token_metadata_resolved",
        }
    }
}
