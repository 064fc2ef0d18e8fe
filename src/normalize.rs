//! Event Normalizer
//!
//! Maps raw ledger events onto the closed [`DomainEvent`] set.
//!
//! - Unknown event names normalize to `Ok(None)` (forward compatible)
//! - Buy/sell is decided by which party field is present; exactly one must be
//! - Order amounts read `value` before `amount`
//! - Collateral add/update/remove from the pool side (`token` instead of
//!   `collateralToken`) keep `collateral: None` so the projector can skip them

use num_bigint::BigUint;
use serde_json::Value;

use crate::error::NormalizeError;
use crate::events::{CollateralParams, DomainEvent, OrderOpened, OrderReturned, TapParams};
use crate::ledger::{parse_address, parse_amount, parse_u32, parse_u64, RawEvent};
use crate::models::{Address, ContractAddresses, OrderType};

const COLLATERAL_FIELDS: &[&str] = &["collateralToken", "collateral"];
const AMOUNT_FIELDS: &[&str] = &["value", "amount"];
const TAP_RATE_FIELDS: &[&str] = &["tap", "rate"];
const MAX_PCT_FIELDS: &[&str] = &["maximumTapIncreasePct", "maxMonthlyTapIncreasePct"];

#[derive(Debug, Clone, Default)]
pub struct EventNormalizer {
    vault: Option<Address>,
}

impl EventNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets plain `Deposit`/`Transfer` events from the vault count as reserve activity.
    pub fn with_addresses(addresses: &ContractAddresses) -> Self {
        Self {
            vault: Some(addresses.vault.clone()).filter(|v| !v.is_empty()),
        }
    }

    pub fn normalize(&self, raw: &RawEvent) -> Result<Option<DomainEvent>, NormalizeError> {
        let event = match raw.event.as_str() {
            "SYNC_STATUS_SYNCING" => DomainEvent::SyncStarted,
            "SYNC_STATUS_SYNCED" => DomainEvent::SyncFinished,
            "ACCOUNTS_TRIGGER" => DomainEvent::AccountChanged {
                account: raw.field(&["account"]).and_then(parse_address),
            },

            "AddCollateralToken" => DomainEvent::CollateralTokenAdded(collateral_params(raw)?),
            "UpdateCollateralToken" => {
                DomainEvent::CollateralTokenUpdated(collateral_params(raw)?)
            }
            "RemoveCollateralToken" => DomainEvent::CollateralTokenRemoved {
                collateral: market_maker_collateral(raw)?,
            },

            "AddTokenTap" | "AddTappedToken" => DomainEvent::TapAdded(tap_params(raw)?),
            "UpdateTokenTap" | "UpdateTappedToken" => DomainEvent::TapUpdated(tap_params(raw)?),
            "RemoveTokenTap" | "RemoveTappedToken" => DomainEvent::TapRemoved {
                token: address(raw, &["token"], "token")?,
            },
            "UpdateMaximumTapIncreasePct"
            | "UpdateMaxMonthlyTapIncreasePct"
            | "UpdateMonthlyTapRateIncrease" => DomainEvent::MaximumTapIncreaseUpdated {
                pct: amount(raw, MAX_PCT_FIELDS, "maximumTapIncreasePct")?,
            },
            "UpdateBeneficiary" => DomainEvent::BeneficiaryUpdated {
                beneficiary: address(raw, &["beneficiary"], "beneficiary")?,
            },

            "NewBuyOrder" | "NewSellOrder" | "OpenBuyOrder" | "OpenSellOrder" => {
                let (order_type, party) = party(raw)?;
                let tx_hash = raw.transaction_hash.trim().to_ascii_lowercase();
                if tx_hash.is_empty() {
                    return Err(missing(raw, "transactionHash"));
                }
                DomainEvent::OrderOpened(OrderOpened {
                    tx_hash,
                    order_type,
                    address: party,
                    collateral: address(raw, COLLATERAL_FIELDS, "collateralToken")?,
                    batch_id: number(raw, &["batchId"], "batchId")?,
                    amount: amount(raw, AMOUNT_FIELDS, "value")?,
                    timestamp: timestamp(raw),
                })
            }
            "ClearBatch" => DomainEvent::BatchCleared {
                batch_id: number(raw, &["batchId"], "batchId")?,
                collateral: address(raw, COLLATERAL_FIELDS, "collateralToken")?,
            },
            "ReturnBuy" | "ReturnSell" | "ReturnBuyOrder" | "ReturnSellOrder"
            | "ClaimBuyOrder" | "ClaimSellOrder" => {
                let (order_type, party) = party(raw)?;
                DomainEvent::OrderReturned(OrderReturned {
                    order_type,
                    address: party,
                    collateral: address(raw, COLLATERAL_FIELDS, "collateralToken")?,
                    batch_id: number(raw, &["batchId"], "batchId")?,
                })
            }

            "VaultDeposit" | "VaultTransfer" => DomainEvent::ReserveActivity {
                token: address(raw, &["token"], "token")?,
            },
            "Deposit" | "Transfer" if self.is_vault(&raw.address) => {
                DomainEvent::ReserveActivity {
                    token: address(raw, &["token"], "token")?,
                }
            }

            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    fn is_vault(&self, emitter: &str) -> bool {
        self.vault.as_deref() == Some(emitter)
    }
}

fn missing(raw: &RawEvent, field: &'static str) -> NormalizeError {
    NormalizeError::MissingField {
        event: raw.event.clone(),
        field,
    }
}

fn invalid(raw: &RawEvent, field: &'static str, value: &Value) -> NormalizeError {
    NormalizeError::InvalidField {
        event: raw.event.clone(),
        field,
        value: value.to_string(),
    }
}

fn parsed<T>(
    raw: &RawEvent,
    names: &[&str],
    field: &'static str,
    parse: impl Fn(&Value) -> Option<T>,
) -> Result<T, NormalizeError> {
    let value = raw.field(names).ok_or_else(|| missing(raw, field))?;
    parse(value).ok_or_else(|| invalid(raw, field, value))
}

fn address(raw: &RawEvent, names: &[&str], field: &'static str) -> Result<Address, NormalizeError> {
    parsed(raw, names, field, parse_address)
}

fn amount(raw: &RawEvent, names: &[&str], field: &'static str) -> Result<BigUint, NormalizeError> {
    parsed(raw, names, field, parse_amount)
}

fn number(raw: &RawEvent, names: &[&str], field: &'static str) -> Result<u64, NormalizeError> {
    parsed(raw, names, field, parse_u64)
}

fn timestamp(raw: &RawEvent) -> i64 {
    raw.timestamp
        .unwrap_or_else(|| chrono::Utc::now().timestamp())
}

/// `None` when the event names its asset `token`, i.e. it came from the pool.
fn market_maker_collateral(raw: &RawEvent) -> Result<Option<Address>, NormalizeError> {
    match raw.field(COLLATERAL_FIELDS) {
        Some(value) => parse_address(value)
            .map(Some)
            .ok_or_else(|| invalid(raw, "collateralToken", value)),
        None if raw.field(&["token"]).is_some() => Ok(None),
        None => Err(missing(raw, "collateralToken")),
    }
}

fn collateral_params(raw: &RawEvent) -> Result<CollateralParams, NormalizeError> {
    let collateral = market_maker_collateral(raw)?;
    if collateral.is_none() {
        return Ok(CollateralParams {
            collateral,
            virtual_supply: BigUint::default(),
            virtual_balance: BigUint::default(),
            reserve_ratio: 0,
        });
    }

    Ok(CollateralParams {
        collateral,
        virtual_supply: amount(raw, &["virtualSupply"], "virtualSupply")?,
        virtual_balance: amount(raw, &["virtualBalance"], "virtualBalance")?,
        reserve_ratio: parsed(raw, &["reserveRatio"], "reserveRatio", parse_u32)?,
    })
}

fn tap_params(raw: &RawEvent) -> Result<TapParams, NormalizeError> {
    let floor = match raw.field(&["floor"]) {
        Some(value) => Some(parse_amount(value).ok_or_else(|| invalid(raw, "floor", value))?),
        None => None,
    };
    Ok(TapParams {
        token: address(raw, &["token"], "token")?,
        rate: amount(raw, TAP_RATE_FIELDS, "tap")?,
        floor,
        timestamp: timestamp(raw),
    })
}

fn party(raw: &RawEvent) -> Result<(OrderType, Address), NormalizeError> {
    let buyer = raw.field(&["buyer"]);
    let seller = raw.field(&["seller"]);
    match (buyer, seller) {
        (Some(value), None) => parse_address(value)
            .map(|a| (OrderType::Buy, a))
            .ok_or_else(|| invalid(raw, "buyer", value)),
        (None, Some(value)) => parse_address(value)
            .map(|a| (OrderType::Sell, a))
            .ok_or_else(|| invalid(raw, "seller", value)),
        (buyer, seller) => Err(NormalizeError::AmbiguousParty {
            event: raw.event.clone(),
            has_buyer: buyer.is_some(),
            has_seller: seller.is_some(),
        }),
    }
}
