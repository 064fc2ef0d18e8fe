//! Data model for the projected fundraising state
//!
//! `AppState` is the aggregate root. Order lifecycle is never stored on the
//! order itself: it is derived at read time from the cleared-batch and
//! return lists, see [`AppState::order_state`].

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// Ledger address, always lowercased.
pub type Address = String;

/// Denominator for reserve ratios.
pub const PPM_BASE: u32 = 1_000_000;

/// Denominator for tap increase percentages (10^18).
pub const PCT_BASE: u64 = 1_000_000_000_000_000_000;

/// Placeholder address the ledger uses for the native asset.
pub const ETHER_TOKEN_FAKE_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Addresses compare case-insensitively on the ledger, so we keep one canonical form.
pub fn normalize_address(address: &str) -> Address {
    address.trim().to_ascii_lowercase()
}

/// Lossy conversion for display maths (price, ratios).
pub fn biguint_to_f64(value: &BigUint) -> f64 {
    value
        .to_u64_digits()
        .iter()
        .rev()
        .fold(0.0, |acc, digit| acc * 18_446_744_073_709_551_616.0 + *digit as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Buy,
    Sell,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Buy => "BUY",
            OrderType::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived order lifecycle. `Returned` is terminal and wins over `Cleared`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Pending,
    Cleared,
    Returned,
}

/// Static per-token facts. Every field is optional: non-conforming tokens
/// may not expose them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub decimals: Option<u8>,
}

impl TokenMetadata {
    pub fn is_empty(&self) -> bool {
        self.symbol.is_none() && self.name.is_none() && self.decimals.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralToken {
    pub address: Address,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub decimals: Option<u8>,
    /// Reserve amount held by the pool
    pub balance: BigUint,
    pub virtual_supply: BigUint,
    pub virtual_balance: BigUint,
    /// Parts per million of `AppState::ppm`
    pub reserve_ratio: u32,
}

impl CollateralToken {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            symbol: None,
            name: None,
            decimals: None,
            balance: BigUint::default(),
            virtual_supply: BigUint::default(),
            virtual_balance: BigUint::default(),
            reserve_ratio: 0,
        }
    }

    pub fn metadata(&self) -> TokenMetadata {
        TokenMetadata {
            symbol: self.symbol.clone(),
            name: self.name.clone(),
            decimals: self.decimals,
        }
    }

    /// Only overwrites the fields the lookup actually resolved.
    pub fn apply_metadata(&mut self, metadata: &TokenMetadata) {
        if metadata.symbol.is_some() {
            self.symbol = metadata.symbol.clone();
        }
        if metadata.name.is_some() {
            self.name = metadata.name.clone();
        }
        if metadata.decimals.is_some() {
            self.decimals = metadata.decimals;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tap {
    /// Collateral token this allowance applies to
    pub token: Address,
    /// Amount releasable per period
    pub rate: BigUint,
    pub floor: Option<BigUint>,
    /// Unix seconds of the last rate increase
    pub last_increase_at: Option<i64>,
    /// Maximum increase per period, scaled by `PCT_BASE`
    pub max_increase_pct: BigUint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Transaction hash; unique per order
    pub tx_hash: String,
    pub address: Address,
    pub order_type: OrderType,
    pub collateral: Address,
    pub amount: BigUint,
    pub batch_id: u64,
    /// Unix seconds
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClearedBatch {
    pub batch_id: u64,
    pub collateral: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReturnRecord {
    pub address: Address,
    pub batch_id: u64,
    pub collateral: Address,
    pub order_type: OrderType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondedToken {
    pub address: Address,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: Option<u8>,
    pub total_supply: BigUint,
}

/// Contracts the fundraising controller wires together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAddresses {
    pub controller: Address,
    pub token_manager: Address,
    pub vault: Address,
    pub pool: Address,
    pub tap: Address,
    pub market_maker: Address,
}

impl ContractAddresses {
    /// Contracts whose event streams feed the projector.
    pub fn watched(&self) -> Vec<Address> {
        let mut watched: Vec<Address> = Vec::with_capacity(5);
        for address in [
            &self.controller,
            &self.market_maker,
            &self.tap,
            &self.pool,
            &self.vault,
        ] {
            if !address.is_empty() && !watched.contains(address) {
                watched.push(address.clone());
            }
        }
        watched
    }
}

/// The aggregate root. Only the projector mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppState {
    pub is_syncing: bool,
    pub connected_account: Option<Address>,
    pub bonded_token: Option<BondedToken>,
    pub beneficiary: Option<Address>,
    pub ppm: u32,
    pub maximum_tap_increase_pct: BigUint,
    pub addresses: Option<ContractAddresses>,
    pub collateral_tokens: Vec<CollateralToken>,
    pub taps: Vec<Tap>,
    pub orders: Vec<Order>,
    pub cleared_batches: Vec<ClearedBatch>,
    pub returns: Vec<ReturnRecord>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            is_syncing: false,
            connected_account: None,
            bonded_token: None,
            beneficiary: None,
            ppm: PPM_BASE,
            maximum_tap_increase_pct: BigUint::default(),
            addresses: None,
            collateral_tokens: Vec::new(),
            taps: Vec::new(),
            orders: Vec::new(),
            cleared_batches: Vec::new(),
            returns: Vec::new(),
        }
    }
}

impl AppState {
    pub fn collateral_token(&self, address: &str) -> Option<&CollateralToken> {
        self.collateral_tokens.iter().find(|t| t.address == address)
    }

    pub fn collateral_token_mut(&mut self, address: &str) -> Option<&mut CollateralToken> {
        self.collateral_tokens.iter_mut().find(|t| t.address == address)
    }

    pub fn tap(&self, token: &str) -> Option<&Tap> {
        self.taps.iter().find(|t| t.token == token)
    }

    pub fn tap_mut(&mut self, token: &str) -> Option<&mut Tap> {
        self.taps.iter_mut().find(|t| t.token == token)
    }

    pub fn order(&self, tx_hash: &str) -> Option<&Order> {
        self.orders.iter().find(|o| o.tx_hash == tx_hash)
    }

    pub fn is_cleared(&self, order: &Order) -> bool {
        self.cleared_batches
            .iter()
            .any(|b| b.batch_id == order.batch_id && b.collateral == order.collateral)
    }

    pub fn is_returned(&self, order: &Order) -> bool {
        self.returns.iter().any(|r| {
            r.address == order.address
                && r.batch_id == order.batch_id
                && r.collateral == order.collateral
                && r.order_type == order.order_type
        })
    }

    /// A returned order is by construction already cleared, so it is checked first.
    pub fn order_state(&self, order: &Order) -> OrderState {
        if self.is_returned(order) {
            OrderState::Returned
        } else if self.is_cleared(order) {
            OrderState::Cleared
        } else {
            OrderState::Pending
        }
    }

    /// Views are served only after a complete initial sync.
    pub fn is_ready(&self) -> bool {
        !self.is_syncing && !self.collateral_tokens.is_empty() && !self.taps.is_empty()
    }
}
