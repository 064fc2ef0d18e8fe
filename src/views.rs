//! Read Model Builder
//!
//! Pure functions from [`AppState`] to presentation views. Every builder
//! returns [`ViewError::NotReady`] until the aggregate has finished syncing
//! and holds at least one collateral token and one tap.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::error::ViewError;
use crate::models::{
    biguint_to_f64, Address, AppState, CollateralToken, OrderState, OrderType, Tap, PCT_BASE,
};

/// Collateral the overview and reserve tabs report on.
const PRIMARY_SYMBOL: &str = "DAI";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overview {
    pub collateral: Address,
    pub collateral_symbol: Option<String>,
    /// Collateral per bonded token
    pub price: f64,
    pub reserve_balance: BigUint,
    pub tap_rate: Option<BigUint>,
    pub total_supply: BigUint,
    pub market_cap: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnotatedOrder {
    pub tx_hash: String,
    pub address: Address,
    pub order_type: OrderType,
    pub amount: BigUint,
    pub batch_id: u64,
    pub timestamp: i64,
    pub collateral: Address,
    /// `None` when the collateral token is unknown or unresolved
    pub collateral_symbol: Option<String>,
    pub state: OrderState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollateralRatio {
    pub address: Address,
    pub symbol: Option<String>,
    /// reserve_ratio / ppm
    pub ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReserveView {
    pub tap: Option<Tap>,
    /// Fraction, i.e. pct / 10^18
    pub maximum_tap_increase_pct: f64,
    pub collateral_tokens: Vec<CollateralRatio>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountSort {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderFilter {
    pub order_type: Option<OrderType>,
    pub symbol: Option<String>,
    pub holder: Option<Address>,
    /// Inclusive bounds, unix seconds
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub sort: Option<AmountSort>,
}

impl OrderFilter {
    pub fn matches(&self, order: &AnnotatedOrder) -> bool {
        if self.order_type.is_some_and(|t| t != order.order_type) {
            return false;
        }
        if let Some(symbol) = &self.symbol {
            if order.collateral_symbol.as_deref() != Some(symbol.as_str()) {
                return false;
            }
        }
        if let Some(holder) = &self.holder {
            if !holder.eq_ignore_ascii_case(&order.address) {
                return false;
            }
        }
        if self.from.is_some_and(|from| order.timestamp < from) {
            return false;
        }
        if self.to.is_some_and(|to| order.timestamp > to) {
            return false;
        }
        true
    }
}

fn ensure_ready(state: &AppState) -> Result<(), ViewError> {
    if state.is_ready() {
        Ok(())
    } else {
        Err(ViewError::NotReady)
    }
}

/// The DAI collateral when present, otherwise the first one added.
fn primary_collateral(state: &AppState) -> Option<&CollateralToken> {
    state
        .collateral_tokens
        .iter()
        .find(|t| t.symbol.as_deref() == Some(PRIMARY_SYMBOL))
        .or_else(|| state.collateral_tokens.first())
}

/// Bancor spot price: (balance + vBalance) * ppm / ((supply + vSupply) * ratio).
pub fn spot_price(token: &CollateralToken, total_supply: &BigUint, ppm: u32) -> f64 {
    let reserve = biguint_to_f64(&(&token.balance + &token.virtual_balance));
    let supply = biguint_to_f64(&(total_supply + &token.virtual_supply));
    let denominator = supply * token.reserve_ratio as f64;
    if denominator == 0.0 {
        return 0.0;
    }
    reserve * ppm as f64 / denominator
}

pub fn build_overview(state: &AppState) -> Result<Overview, ViewError> {
    ensure_ready(state)?;
    let token = primary_collateral(state).ok_or(ViewError::NotReady)?;
    let total_supply = state
        .bonded_token
        .as_ref()
        .map(|b| b.total_supply.clone())
        .unwrap_or_default();

    let price = spot_price(token, &total_supply, state.ppm);
    Ok(Overview {
        collateral: token.address.clone(),
        collateral_symbol: token.symbol.clone(),
        price,
        reserve_balance: token.balance.clone(),
        tap_rate: state.tap(&token.address).map(|t| t.rate.clone()),
        market_cap: price * biguint_to_f64(&total_supply),
        total_supply,
    })
}

/// Orders in insertion order, annotated with lifecycle state and collateral symbol.
pub fn build_orders_view(state: &AppState) -> Result<Vec<AnnotatedOrder>, ViewError> {
    ensure_ready(state)?;
    Ok(state
        .orders
        .iter()
        .map(|order| AnnotatedOrder {
            tx_hash: order.tx_hash.clone(),
            address: order.address.clone(),
            order_type: order.order_type,
            amount: order.amount.clone(),
            batch_id: order.batch_id,
            timestamp: order.timestamp,
            collateral: order.collateral.clone(),
            collateral_symbol: state
                .collateral_token(&order.collateral)
                .and_then(|t| t.symbol.clone()),
            state: state.order_state(order),
        })
        .collect())
}

pub fn filter_orders(orders: Vec<AnnotatedOrder>, filter: &OrderFilter) -> Vec<AnnotatedOrder> {
    let mut matching: Vec<AnnotatedOrder> =
        orders.into_iter().filter(|o| filter.matches(o)).collect();
    match filter.sort {
        Some(AmountSort::Ascending) => matching.sort_by(|a, b| a.amount.cmp(&b.amount)),
        Some(AmountSort::Descending) => matching.sort_by(|a, b| b.amount.cmp(&a.amount)),
        None => {}
    }
    matching
}

pub fn build_reserve_view(state: &AppState) -> Result<ReserveView, ViewError> {
    ensure_ready(state)?;
    let ppm = state.ppm.max(1) as f64;
    Ok(ReserveView {
        tap: primary_collateral(state).and_then(|t| state.tap(&t.address).cloned()),
        maximum_tap_increase_pct: biguint_to_f64(&state.maximum_tap_increase_pct)
            / PCT_BASE as f64,
        collateral_tokens: state
            .collateral_tokens
            .iter()
            .map(|t| CollateralRatio {
                address: t.address.clone(),
                symbol: t.symbol.clone(),
                ratio: t.reserve_ratio as f64 / ppm,
            })
            .collect(),
    })
}
