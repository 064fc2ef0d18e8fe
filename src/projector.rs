//! State Projector
//!
//! Folds [`DomainEvent`]s into [`AppState`]. Every handler validates before it
//! mutates, so a rejected event leaves the state exactly as it was.
//!
//! Re-delivered events are absorbed: orders are keyed by transaction hash and
//! cleared-batch / return tuples are only appended when not already present.

use tracing::{debug, error};

use crate::error::ProjectionError;
use crate::events::{CollateralParams, DomainEvent, TapParams};
use crate::models::{AppState, ClearedBatch, CollateralToken, Order, ReturnRecord, Tap};
use crate::snapshot::merge_init;

/// Outcome of a successful projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    /// Duplicate, pool-side or otherwise inert event
    Unchanged,
}

/// Pure projection: returns the next state. Rejected events are logged and
/// yield the current state unchanged.
pub fn project(current: &AppState, event: &DomainEvent) -> AppState {
    let mut next = current.clone();
    match apply(&mut next, event) {
        Ok(_) => next,
        Err(e) => {
            error!("Dropping {} event: {}", event.kind(), e);
            current.clone()
        }
    }
}

/// In-place projection used by the engine's single writer.
pub fn apply(state: &mut AppState, event: &DomainEvent) -> Result<Applied, ProjectionError> {
    match event {
        DomainEvent::Init(init) => {
            *state = merge_init(std::mem::take(state), init);
            Ok(Applied::Changed)
        }
        DomainEvent::AccountChanged { account } => {
            Ok(set(&mut state.connected_account, account.clone()))
        }
        DomainEvent::SyncStarted => Ok(set(&mut state.is_syncing, true)),
        DomainEvent::SyncFinished => Ok(set(&mut state.is_syncing, false)),

        DomainEvent::CollateralTokenAdded(params) => add_collateral(state, params),
        DomainEvent::CollateralTokenUpdated(params) => update_collateral(state, params),
        DomainEvent::CollateralTokenRemoved { collateral } => {
            let Some(address) = collateral else {
                debug!("Ignoring pool-side collateral removal");
                return Ok(Applied::Unchanged);
            };
            let before = state.collateral_tokens.len();
            state.collateral_tokens.retain(|t| &t.address != address);
            if state.collateral_tokens.len() == before {
                return Err(ProjectionError::UnknownCollateral(address.clone()));
            }
            Ok(Applied::Changed)
        }

        DomainEvent::TapAdded(params) => Ok(add_tap(state, params)),
        DomainEvent::TapUpdated(params) => {
            let tap = state
                .tap_mut(&params.token)
                .ok_or_else(|| ProjectionError::UnknownTap(params.token.clone()))?;
            if params.rate > tap.rate {
                tap.last_increase_at = Some(params.timestamp);
            }
            tap.rate = params.rate.clone();
            if params.floor.is_some() {
                tap.floor = params.floor.clone();
            }
            Ok(Applied::Changed)
        }
        DomainEvent::TapRemoved { token } => {
            let before = state.taps.len();
            state.taps.retain(|t| &t.token != token);
            if state.taps.len() == before {
                return Err(ProjectionError::UnknownTap(token.clone()));
            }
            Ok(Applied::Changed)
        }
        DomainEvent::MaximumTapIncreaseUpdated { pct } => {
            state.maximum_tap_increase_pct = pct.clone();
            for tap in &mut state.taps {
                tap.max_increase_pct = pct.clone();
            }
            Ok(Applied::Changed)
        }
        DomainEvent::BeneficiaryUpdated { beneficiary } => {
            Ok(set(&mut state.beneficiary, Some(beneficiary.clone())))
        }

        DomainEvent::OrderOpened(opened) => {
            if state.order(&opened.tx_hash).is_some() {
                debug!("Order {} already projected", opened.tx_hash);
                return Ok(Applied::Unchanged);
            }
            state.orders.push(Order {
                tx_hash: opened.tx_hash.clone(),
                address: opened.address.clone(),
                order_type: opened.order_type,
                collateral: opened.collateral.clone(),
                amount: opened.amount.clone(),
                batch_id: opened.batch_id,
                timestamp: opened.timestamp,
            });
            Ok(Applied::Changed)
        }
        DomainEvent::BatchCleared {
            batch_id,
            collateral,
        } => {
            let batch = ClearedBatch {
                batch_id: *batch_id,
                collateral: collateral.clone(),
            };
            Ok(append_unique(&mut state.cleared_batches, batch))
        }
        DomainEvent::OrderReturned(returned) => {
            let record = ReturnRecord {
                address: returned.address.clone(),
                batch_id: returned.batch_id,
                collateral: returned.collateral.clone(),
                order_type: returned.order_type,
            };
            Ok(append_unique(&mut state.returns, record))
        }

        // resolved into ReserveBalanceChanged before it reaches the projector
        DomainEvent::ReserveActivity { .. } => Ok(Applied::Unchanged),
        DomainEvent::ReserveBalanceChanged { token, balance } => {
            let collateral = state
                .collateral_token_mut(token)
                .ok_or_else(|| ProjectionError::UnknownCollateral(token.clone()))?;
            collateral.balance = balance.clone();
            Ok(Applied::Changed)
        }
        DomainEvent::TokenMetadataResolved { token, metadata } => {
            let collateral = state
                .collateral_token_mut(token)
                .ok_or_else(|| ProjectionError::UnknownCollateral(token.clone()))?;
            collateral.apply_metadata(metadata);
            Ok(Applied::Changed)
        }
    }
}

fn set<T: PartialEq>(slot: &mut T, value: T) -> Applied {
    if *slot == value {
        Applied::Unchanged
    } else {
        *slot = value;
        Applied::Changed
    }
}

fn append_unique<T: PartialEq>(list: &mut Vec<T>, item: T) -> Applied {
    if list.contains(&item) {
        Applied::Unchanged
    } else {
        list.push(item);
        Applied::Changed
    }
}

fn check_ratio(state: &AppState, ratio: u32) -> Result<(), ProjectionError> {
    if ratio > state.ppm {
        return Err(ProjectionError::ReserveRatioOutOfRange {
            ratio,
            ppm: state.ppm,
        });
    }
    Ok(())
}

fn set_curve(token: &mut CollateralToken, params: &CollateralParams) {
    token.virtual_supply = params.virtual_supply.clone();
    token.virtual_balance = params.virtual_balance.clone();
    token.reserve_ratio = params.reserve_ratio;
}

fn add_collateral(
    state: &mut AppState,
    params: &CollateralParams,
) -> Result<Applied, ProjectionError> {
    let Some(address) = &params.collateral else {
        debug!("Ignoring pool-side collateral add");
        return Ok(Applied::Unchanged);
    };
    check_ratio(state, params.reserve_ratio)?;

    match state.collateral_token_mut(address) {
        // re-delivered add: refresh the curve, keep balance and metadata
        Some(existing) => set_curve(existing, params),
        None => {
            let mut token = CollateralToken::new(address.clone());
            set_curve(&mut token, params);
            state.collateral_tokens.push(token);
        }
    }
    Ok(Applied::Changed)
}

fn update_collateral(
    state: &mut AppState,
    params: &CollateralParams,
) -> Result<Applied, ProjectionError> {
    let Some(address) = &params.collateral else {
        debug!("Ignoring pool-side collateral update");
        return Ok(Applied::Unchanged);
    };
    check_ratio(state, params.reserve_ratio)?;
    let token = state
        .collateral_token_mut(address)
        .ok_or_else(|| ProjectionError::UnknownCollateral(address.clone()))?;
    set_curve(token, params);
    Ok(Applied::Changed)
}

fn add_tap(state: &mut AppState, params: &TapParams) -> Applied {
    let max_increase_pct = state.maximum_tap_increase_pct.clone();
    match state.tap_mut(&params.token) {
        Some(tap) => {
            tap.rate = params.rate.clone();
            tap.floor = params.floor.clone();
        }
        None => state.taps.push(Tap {
            token: params.token.clone(),
            rate: params.rate.clone(),
            floor: params.floor.clone(),
            last_increase_at: None,
            max_increase_pct,
        }),
    }
    Applied::Changed
}
