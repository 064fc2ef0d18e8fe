//! Connection Bootstrapper
//!
//! Resolves the contracts wired to the fundraising controller, then gathers
//! the one-off `Init` seed data. Both steps run under a [`RetryPolicy`]:
//! - Exponential backoff (1s, 5s, 25s, ... by default), never gives up
//! - Single-flight: a second attempt while one is running is refused
//! - Cancellable through a `watch` channel, so tests drive it with paused time

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::BootstrapError;
use crate::events::InitData;
use crate::ledger::{parse_address, parse_amount, parse_u32, LedgerRpc};
use crate::metadata::TokenMetadataCache;
use crate::models::{AppState, BondedToken, ContractAddresses, PPM_BASE};

// =============================================================================
// RETRY POLICY
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub factor: u32,
    /// Upper bound for a single wait; unbounded when `None`
    pub max_delay_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            factor: 5,
            max_delay_ms: None,
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = (self.factor.max(1) as u64)
            .checked_pow(attempt)
            .and_then(|m| m.checked_mul(self.initial_delay_ms))
            .unwrap_or(u64::MAX);
        let capped = match self.max_delay_ms {
            Some(max) => scaled.min(max),
            None => scaled,
        };
        Duration::from_millis(capped)
    }
}

/// Resolves once `cancel` carries `true`. Never resolves if the sender is gone.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// BOOTSTRAPPER
// =============================================================================

pub struct Bootstrapper {
    ledger: Arc<dyn LedgerRpc>,
    policy: RetryPolicy,
    cancel: watch::Receiver<bool>,
    in_flight: AtomicBool,
    failed_attempts: AtomicU64,
}

impl Bootstrapper {
    pub fn new(
        ledger: Arc<dyn LedgerRpc>,
        policy: RetryPolicy,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ledger,
            policy,
            cancel,
            in_flight: AtomicBool::new(false),
            failed_attempts: AtomicU64::new(0),
        }
    }

    pub fn failed_attempts(&self) -> u64 {
        self.failed_attempts.load(Ordering::Relaxed)
    }

    /// Runs `attempt` until it succeeds, waiting per the policy between failures.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut attempt: F) -> Result<T, BootstrapError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let _guard = InFlight::acquire(&self.in_flight).ok_or(BootstrapError::AlreadyInFlight)?;
        let mut cancel = self.cancel.clone();
        let mut retries = 0u32;

        loop {
            if *cancel.borrow() {
                return Err(BootstrapError::Cancelled);
            }

            match attempt().await {
                Ok(value) => return Ok(value),
                Err(cause) => {
                    self.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    let err = BootstrapError::Attempt(cause);
                    let delay = self.policy.delay_for(retries);
                    retries = retries.saturating_add(1);

                    error!("Could not {}: {}", what, err);
                    warn!("Retrying in {}s...", delay.as_secs_f64());

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancelled(&mut cancel) => return Err(BootstrapError::Cancelled),
                    }
                }
            }
        }
    }

    /// Resolves every collaborating contract from the controller.
    pub async fn resolve(&self, controller: &str) -> Result<ContractAddresses, BootstrapError> {
        let ledger = self.ledger.as_ref();
        let addresses = self
            .retry("resolve contract addresses", move || {
                resolve_addresses(ledger, controller)
            })
            .await?;

        info!(
            "Resolved fundraising contracts: market_maker={} tap={} pool={} vault={} token_manager={}",
            addresses.market_maker,
            addresses.tap,
            addresses.pool,
            addresses.vault,
            addresses.token_manager
        );
        Ok(addresses)
    }

    /// Gathers the `Init` seed. `restored` supplies the collateral tokens whose
    /// balances and metadata are refreshed.
    pub async fn initialize(
        &self,
        addresses: &ContractAddresses,
        restored: Option<&AppState>,
        cache: &TokenMetadataCache,
    ) -> Result<InitData, BootstrapError> {
        let ledger = self.ledger.as_ref();
        self.retry("load initial fundraising state", move || {
            load_init(ledger, addresses, restored, cache)
        })
        .await
    }
}

async fn call_address(ledger: &dyn LedgerRpc, to: &str, method: &str) -> anyhow::Result<String> {
    let value = ledger.call(to, method, &[]).await?;
    parse_address(&value).ok_or_else(|| anyhow!("{}() returned no address: {}", method, value))
}

async fn resolve_addresses(
    ledger: &dyn LedgerRpc,
    controller: &str,
) -> anyhow::Result<ContractAddresses> {
    let (token_manager, vault, pool, tap, market_maker) = tokio::try_join!(
        call_address(ledger, controller, "tokenManager"),
        call_address(ledger, controller, "vault"),
        call_address(ledger, controller, "pool"),
        call_address(ledger, controller, "tap"),
        call_address(ledger, controller, "marketMaker"),
    )
    .context("Could not load external contract addresses")?;

    Ok(ContractAddresses {
        controller: crate::models::normalize_address(controller),
        token_manager,
        vault,
        pool,
        tap,
        market_maker,
    })
}

/// Reserve balance of `token` held by the vault.
pub async fn read_balance(
    ledger: &dyn LedgerRpc,
    vault: &str,
    token: &str,
) -> anyhow::Result<BigUint> {
    let value = ledger
        .call(vault, "balance", &[Value::String(token.to_string())])
        .await?;
    parse_amount(&value).ok_or_else(|| anyhow!("balance({}) returned {}", token, value))
}

async fn call_amount(ledger: &dyn LedgerRpc, to: &str, method: &str) -> anyhow::Result<BigUint> {
    let value = ledger.call(to, method, &[]).await?;
    parse_amount(&value).ok_or_else(|| anyhow!("{}() returned {}", method, value))
}

async fn load_init(
    ledger: &dyn LedgerRpc,
    addresses: &ContractAddresses,
    restored: Option<&AppState>,
    cache: &TokenMetadataCache,
) -> anyhow::Result<InitData> {
    let bonded = call_address(ledger, &addresses.market_maker, "token").await?;
    let total_supply = call_amount(ledger, &bonded, "totalSupply").await?;
    let bonded_metadata = cache.metadata(&bonded).await;

    let ppm = match ledger.call(&addresses.market_maker, "PPM", &[]).await {
        Ok(value) => parse_u32(&value).unwrap_or(PPM_BASE),
        Err(_) => PPM_BASE,
    };

    let maximum_tap_increase_pct =
        match call_amount(ledger, &addresses.tap, "maximumTapIncreasePct").await {
            Ok(pct) => pct,
            Err(_) => call_amount(ledger, &addresses.tap, "maxMonthlyTapIncreasePct").await?,
        };

    let beneficiary = call_address(ledger, &addresses.tap, "beneficiary").await.ok();

    let mut balances = Vec::new();
    let mut metadata = Vec::new();
    for token in restored.map(|s| s.collateral_tokens.as_slice()).unwrap_or_default() {
        let balance = read_balance(ledger, &addresses.vault, &token.address).await?;
        balances.push((token.address.clone(), balance));

        let fresh = cache.metadata(&token.address).await;
        if !fresh.is_empty() {
            metadata.push((token.address.clone(), fresh));
        }
    }

    Ok(InitData {
        addresses: addresses.clone(),
        bonded_token: BondedToken {
            address: bonded,
            name: bonded_metadata.name,
            symbol: bonded_metadata.symbol,
            decimals: bonded_metadata.decimals,
            total_supply,
        },
        ppm,
        beneficiary,
        maximum_tap_increase_pct,
        balances,
        metadata,
    })
}
