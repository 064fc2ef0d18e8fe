//! Fundraising state projection engine
//!
//! Rebuilds the application view of a batch-auction fundraising market
//! (collateral reserves, taps, buy/sell orders) from the ledger's
//! append-only event streams, merged over a persisted snapshot.

pub mod bootstrap;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod ledger;
pub mod metadata;
pub mod models;
pub mod normalize;
pub mod projector;
pub mod snapshot;
pub mod views;

pub use config::EngineConfig;
pub use engine::{Engine, Outcome, StateChange};
pub use events::DomainEvent;
pub use models::AppState;
