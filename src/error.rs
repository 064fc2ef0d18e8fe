//! Error taxonomy
//!
//! Every failure class the engine can hit has its own type. Only
//! `CommandError` and `ViewError` ever reach a caller; the rest are logged
//! and contained inside the event loop.

use crate::models::Address;

/// Address resolution / Init failures. Retried until success or cancellation.
#[derive(thiserror::Error, Debug)]
pub enum BootstrapError {
    #[error("bootstrap attempt failed: {0:#}")]
    Attempt(anyhow::Error),
    #[error("bootstrap cancelled")]
    Cancelled,
    #[error("a bootstrap attempt is already in flight")]
    AlreadyInFlight,
}

/// A token's decimals/name/symbol read failed. Never fatal.
#[derive(thiserror::Error, Debug)]
pub enum MetadataError {
    #[error("ledger read {method}() on {token} failed: {cause:#}")]
    Read {
        token: Address,
        method: &'static str,
        cause: anyhow::Error,
    },
    #[error("{method}() on {token} returned an unusable value: {value}")]
    Malformed {
        token: Address,
        method: &'static str,
        value: String,
    },
}

/// A raw event could not be mapped onto a domain event.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("{event}: exactly one of buyer/seller must be set (buyer: {has_buyer}, seller: {has_seller})")]
    AmbiguousParty {
        event: String,
        has_buyer: bool,
        has_seller: bool,
    },
    #[error("{event}: missing field `{field}`")]
    MissingField { event: String, field: &'static str },
    #[error("{event}: field `{field}` is not valid: {value}")]
    InvalidField {
        event: String,
        field: &'static str,
        value: String,
    },
}

/// An event referenced state the aggregate does not hold.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("collateral token {0} is not registered")]
    UnknownCollateral(Address),
    #[error("no tap registered for token {0}")]
    UnknownTap(Address),
    #[error("reserve ratio {ratio} exceeds ppm base {ppm}")]
    ReserveRatioOutOfRange { ratio: u32, ppm: u32 },
}

/// A command submitted to the ledger was refused.
#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("ledger rejected {method}: {cause:#}")]
    Rejected {
        method: &'static str,
        cause: anyhow::Error,
    },
    #[error("collateral token {0} is not registered")]
    UnknownCollateral(Address),
    #[error("amount must be greater than zero")]
    ZeroAmount,
}

/// Views are only served once the aggregate has completed its initial sync.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewError {
    #[error("state not ready: waiting for sync, collateral tokens and taps")]
    NotReady,
}
