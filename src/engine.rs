//! Projection engine
//!
//! Owns the single-writer [`AppState`] and drives it from the ledger:
//! 1. Restore the last snapshot (if any)
//! 2. Resolve contract addresses and gather the `Init` seed, with retry
//! 3. Merge every watched contract's event stream and project one event at a time
//! 4. Persist and broadcast a [`StateChange`] after every effective update
//!
//! Metadata lookups run concurrently on spawned tasks; their results come back
//! through a channel and are projected like any other event. Each result is
//! tagged with the cache handle it was started under and is discarded if the
//! token was removed (and possibly re-added) in the meantime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use num_bigint::BigUint;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bootstrap::{cancelled, read_balance, Bootstrapper};
use crate::config::EngineConfig;
use crate::error::{BootstrapError, CommandError, ViewError};
use crate::events::DomainEvent;
use crate::ledger::{EventSource, LedgerRpc, RawEvent};
use crate::metadata::{MetadataCacheStats, TokenHandle, TokenMetadataCache};
use crate::models::{normalize_address, Address, AppState, ContractAddresses};
use crate::normalize::EventNormalizer;
use crate::projector::{apply, Applied};
use crate::snapshot::{merge_init, SnapshotStore};
use crate::views::{
    build_orders_view, build_overview, build_reserve_view, filter_orders, AnnotatedOrder,
    OrderFilter, Overview, ReserveView,
};

type TaggedStream = BoxStream<'static, (Address, anyhow::Result<RawEvent>)>;

/// A finished metadata lookup and the cache handle it was issued for.
#[derive(Debug)]
struct ResolvedMetadata {
    handle: TokenHandle,
    event: DomainEvent,
}

struct Lookup {
    token: Address,
    task: JoinHandle<()>,
}

/// Broadcast after every update that changed the projected state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub kind: &'static str,
    pub block_number: Option<u64>,
}

/// What `Engine::handle` did with one raw event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Projected,
    /// Recognized but already reflected in the state
    Unchanged,
    /// Not an event the projector knows about
    Ignored,
    /// Normalization, enrichment or precondition failure; state untouched
    Dropped,
}

// =============================================================================
// METRICS
// =============================================================================

#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub events_received: AtomicU64,
    pub events_projected: AtomicU64,
    pub events_unchanged: AtomicU64,
    pub events_ignored: AtomicU64,
    pub events_dropped: AtomicU64,
    pub normalize_errors: AtomicU64,
    pub precondition_failures: AtomicU64,
    pub metadata_lookups: AtomicU64,
    pub stale_lookups: AtomicU64,
    pub resubscriptions: AtomicU64,
    pub persist_failures: AtomicU64,
}

impl EngineMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Projected => &self.events_projected,
            Outcome::Unchanged => &self.events_unchanged,
            Outcome::Ignored => &self.events_ignored,
            Outcome::Dropped => &self.events_dropped,
        };
        Self::bump(counter);
    }

    pub fn summary(&self) -> EngineMetricsSummary {
        EngineMetricsSummary {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_projected: self.events_projected.load(Ordering::Relaxed),
            events_unchanged: self.events_unchanged.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            normalize_errors: self.normalize_errors.load(Ordering::Relaxed),
            precondition_failures: self.precondition_failures.load(Ordering::Relaxed),
            metadata_lookups: self.metadata_lookups.load(Ordering::Relaxed),
            stale_lookups: self.stale_lookups.load(Ordering::Relaxed),
            resubscriptions: self.resubscriptions.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            bootstrap_failures: 0,
            tracked_lookups: 0,
            metadata_cache: MetadataCacheStats::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineMetricsSummary {
    pub events_received: u64,
    pub events_projected: u64,
    pub events_unchanged: u64,
    pub events_ignored: u64,
    pub events_dropped: u64,
    pub normalize_errors: u64,
    pub precondition_failures: u64,
    pub metadata_lookups: u64,
    pub stale_lookups: u64,
    pub resubscriptions: u64,
    pub persist_failures: u64,
    pub bootstrap_failures: u64,
    /// Lookup tasks not yet joined or pruned
    pub tracked_lookups: usize,
    pub metadata_cache: MetadataCacheStats,
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct Engine {
    ledger: Arc<dyn LedgerRpc>,
    store: Arc<dyn SnapshotStore>,
    cache: Arc<TokenMetadataCache>,
    bootstrapper: Bootstrapper,
    normalizer: EventNormalizer,
    addresses: ContractAddresses,
    state: RwLock<AppState>,
    /// Serializes projection; held across enrichment lookups
    writer: tokio::sync::Mutex<()>,
    changes: broadcast::Sender<StateChange>,
    resolved_tx: mpsc::UnboundedSender<ResolvedMetadata>,
    /// Held by `run` for its whole lifetime
    resolved_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ResolvedMetadata>>,
    lookups: Mutex<Vec<Lookup>>,
    last_blocks: Mutex<HashMap<Address, u64>>,
    cancel: watch::Receiver<bool>,
    metrics: EngineMetrics,
}

impl Engine {
    /// Restores, bootstraps and seeds the engine. Only returns an error when
    /// cancelled; connectivity failures are retried.
    pub async fn start(
        config: EngineConfig,
        ledger: Arc<dyn LedgerRpc>,
        store: Arc<dyn SnapshotStore>,
        cancel: watch::Receiver<bool>,
    ) -> Result<Self, BootstrapError> {
        let restored = match store.restore() {
            Ok(Some(state)) => {
                info!(
                    "Restored snapshot: {} collateral tokens, {} orders",
                    state.collateral_tokens.len(),
                    state.orders.len()
                );
                Some(state)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Could not restore snapshot, starting fresh: {:#}", e);
                None
            }
        };

        let cache = Arc::new(TokenMetadataCache::new(ledger.clone(), config.network.clone()));
        let bootstrapper = Bootstrapper::new(ledger.clone(), config.retry.clone(), cancel.clone());

        let addresses = bootstrapper.resolve(&config.controller).await?;
        let init = bootstrapper
            .initialize(&addresses, restored.as_ref(), &cache)
            .await?;

        let state = merge_init(restored.unwrap_or_default(), &init);

        let (changes, _) = broadcast::channel(config.channel_capacity.max(1));
        let (resolved_tx, resolved_rx) = mpsc::unbounded_channel();

        let engine = Self {
            ledger,
            store,
            cache,
            bootstrapper,
            normalizer: EventNormalizer::with_addresses(&addresses),
            addresses,
            state: RwLock::new(state),
            writer: tokio::sync::Mutex::new(()),
            changes,
            resolved_tx,
            resolved_rx: tokio::sync::Mutex::new(resolved_rx),
            lookups: Mutex::new(Vec::new()),
            last_blocks: Mutex::new(HashMap::new()),
            cancel,
            metrics: EngineMetrics::default(),
        };
        engine.persist();
        info!("Fundraising engine initialized for {}", engine.addresses.controller);
        Ok(engine)
    }

    // -------------------------------------------------------------------------
    // Event loop
    // -------------------------------------------------------------------------

    /// Consumes every watched contract's events until the streams end or the
    /// engine is cancelled. A dropped stream is resubscribed from the last
    /// block seen on each contract.
    ///
    /// Only one `run` may be active per engine; a second call waits for the
    /// first to return.
    pub async fn run(&self, source: &dyn EventSource) -> Result<(), BootstrapError> {
        let contracts = self.addresses.watched();
        let mut cancel = self.cancel.clone();
        let mut resolved = self.resolved_rx.lock().await;
        let mut first = true;

        loop {
            if !first {
                EngineMetrics::bump(&self.metrics.resubscriptions);
            }
            first = false;

            let contracts = &contracts;
            let mut merged = self
                .bootstrapper
                .retry("subscribe to contract events", move || {
                    self.subscribe_all(source, contracts)
                })
                .await?;
            info!("Subscribed to {} contracts", contracts.len());

            loop {
                tokio::select! {
                    _ = cancelled(&mut cancel) => {
                        info!("Event loop cancelled");
                        return Ok(());
                    }
                    Some(lookup) = resolved.recv() => {
                        self.fold(lookup).await;
                    }
                    item = merged.next() => match item {
                        Some((_, Ok(raw))) => {
                            self.handle(raw).await;
                        }
                        Some((contract, Err(e))) => {
                            warn!("Subscription to {} dropped: {:#}", contract, e);
                            break;
                        }
                        None => {
                            self.join_lookups().await;
                            self.drain(&mut resolved).await;
                            info!("All event streams ended");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn subscribe_all(
        &self,
        source: &dyn EventSource,
        contracts: &[Address],
    ) -> anyhow::Result<TaggedStream> {
        let mut streams = Vec::with_capacity(contracts.len());
        for contract in contracts {
            let from_block = self.last_blocks.lock().get(contract).copied();
            let tag = contract.clone();
            let events = source
                .subscribe(contract, from_block)
                .await?
                .map(move |item| (tag.clone(), item));
            streams.push(events.boxed());
        }
        Ok(stream::select_all(streams).boxed())
    }

    /// Normalizes, enriches and projects one raw event.
    pub async fn handle(&self, mut raw: RawEvent) -> Outcome {
        EngineMetrics::bump(&self.metrics.events_received);
        raw.address = normalize_address(&raw.address);
        if !raw.address.is_empty() {
            let mut blocks = self.last_blocks.lock();
            let seen = blocks.entry(raw.address.clone()).or_insert(0);
            *seen = (*seen).max(raw.block_number);
        }

        let outcome = match self.normalizer.normalize(&raw) {
            Ok(Some(event)) => self.project(event, Some(raw.block_number)).await,
            Ok(None) => {
                debug!("Ignoring {} event", raw.event);
                Outcome::Ignored
            }
            Err(e) => {
                EngineMetrics::bump(&self.metrics.normalize_errors);
                error!("Dropping malformed event at block {}: {}", raw.block_number, e);
                Outcome::Dropped
            }
        };
        self.metrics.record(outcome);
        outcome
    }

    async fn project(&self, event: DomainEvent, block_number: Option<u64>) -> Outcome {
        let _writer = self.writer.lock().await;

        let events = match self.enrich(&event).await {
            Ok(events) => events,
            Err(e) => {
                error!("Dropping {} event: {:#}", event.kind(), e);
                return Outcome::Dropped;
            }
        };
        if events.is_empty() {
            return Outcome::Unchanged;
        }

        let mut changed = false;
        {
            let mut state = self.state.write();
            for event in &events {
                match apply(&mut state, event) {
                    Ok(Applied::Changed) => changed = true,
                    Ok(Applied::Unchanged) => {}
                    Err(e) => {
                        EngineMetrics::bump(&self.metrics.precondition_failures);
                        error!("Dropping {} event: {}", event.kind(), e);
                        return Outcome::Dropped;
                    }
                }
            }
            if let DomainEvent::CollateralTokenRemoved {
                collateral: Some(token),
            } = &event
            {
                self.cache.evict(token);
                self.abort_lookups(token);
            }
        }

        if let DomainEvent::CollateralTokenAdded(params) = &event {
            if let Some(token) = &params.collateral {
                self.spawn_metadata_lookup(token.clone());
            }
        }

        if !changed {
            return Outcome::Unchanged;
        }
        self.persist();
        let _ = self.changes.send(StateChange {
            kind: event.kind(),
            block_number,
        });
        Outcome::Projected
    }

    /// Ledger lookups an event needs before it can be projected.
    async fn enrich(&self, event: &DomainEvent) -> anyhow::Result<Vec<DomainEvent>> {
        match event {
            DomainEvent::CollateralTokenAdded(params) => {
                let Some(token) = &params.collateral else {
                    return Ok(vec![event.clone()]);
                };
                let balance = self.balance_of(token).await?;
                Ok(vec![
                    event.clone(),
                    DomainEvent::ReserveBalanceChanged {
                        token: token.clone(),
                        balance,
                    },
                ])
            }
            DomainEvent::ReserveActivity { token } => {
                let known = self.state.read().collateral_token(token).is_some();
                if !known {
                    debug!("Vault activity for untracked token {}", token);
                    return Ok(Vec::new());
                }
                let balance = self.balance_of(token).await?;
                Ok(vec![DomainEvent::ReserveBalanceChanged {
                    token: token.clone(),
                    balance,
                }])
            }
            _ => Ok(vec![event.clone()]),
        }
    }

    async fn balance_of(&self, token: &str) -> anyhow::Result<BigUint> {
        read_balance(self.ledger.as_ref(), &self.addresses.vault, token).await
    }

    fn spawn_metadata_lookup(&self, token: Address) {
        EngineMetrics::bump(&self.metrics.metadata_lookups);
        let handle = self.cache.handle(&token);
        let cache = self.cache.clone();
        let resolved = self.resolved_tx.clone();
        let address = token.clone();
        let task = tokio::spawn(async move {
            let metadata = cache.metadata(&address).await;
            if metadata.is_empty() {
                return;
            }
            // receiver lives as long as the engine
            let _ = resolved.send(ResolvedMetadata {
                handle,
                event: DomainEvent::TokenMetadataResolved {
                    token: address,
                    metadata,
                },
            });
        });

        let mut lookups = self.lookups.lock();
        lookups.retain(|lookup| !lookup.task.is_finished());
        lookups.push(Lookup { token, task });
    }

    fn abort_lookups(&self, token: &str) {
        self.lookups.lock().retain(|lookup| {
            if lookup.token != token {
                return true;
            }
            lookup.task.abort();
            false
        });
    }

    /// Projects a completed lookup unless its token was evicted since it started.
    async fn fold(&self, lookup: ResolvedMetadata) {
        let ResolvedMetadata { handle, event } = lookup;
        let _writer = self.writer.lock().await;
        if let DomainEvent::TokenMetadataResolved { token, .. } = &event {
            if self.cache.current_handle(token) != Some(handle) {
                EngineMetrics::bump(&self.metrics.stale_lookups);
                debug!("Discarding metadata for {} resolved before its removal", token);
                return;
            }
        }
        let result = apply(&mut self.state.write(), &event);
        match result {
            Ok(Applied::Changed) => {
                self.persist();
                let _ = self.changes.send(StateChange {
                    kind: event.kind(),
                    block_number: None,
                });
            }
            Ok(Applied::Unchanged) => {}
            Err(e) => {
                EngineMetrics::bump(&self.metrics.precondition_failures);
                warn!("Discarding {}: {}", event.kind(), e);
            }
        }
    }

    /// Waits for outstanding metadata lookups and projects their results.
    ///
    /// While `run` is active the results are left to its loop, so this only
    /// waits for the lookups to finish.
    pub async fn settle(&self) {
        self.join_lookups().await;
        match self.resolved_rx.try_lock() {
            Ok(mut resolved) => self.drain(&mut resolved).await,
            Err(_) => debug!("Event loop active; lookup results fold through it"),
        }
    }

    async fn join_lookups(&self) {
        let lookups: Vec<Lookup> = std::mem::take(&mut *self.lookups.lock());
        for lookup in lookups {
            match lookup.task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("Metadata lookup for {} failed: {}", lookup.token, e),
            }
        }
    }

    async fn drain(&self, resolved: &mut mpsc::UnboundedReceiver<ResolvedMetadata>) {
        while let Ok(lookup) = resolved.try_recv() {
            self.fold(lookup).await;
        }
    }

    fn persist(&self) {
        let state = self.state.read().clone();
        if let Err(e) = self.store.persist(&state) {
            EngineMetrics::bump(&self.metrics.persist_failures);
            warn!("Failed to persist snapshot: {:#}", e);
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn current_state(&self) -> AppState {
        self.state.read().clone()
    }

    pub fn addresses(&self) -> &ContractAddresses {
        &self.addresses
    }

    pub fn metadata_cache(&self) -> &TokenMetadataCache {
        &self.cache
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    pub fn overview(&self) -> Result<Overview, ViewError> {
        build_overview(&self.state.read())
    }

    pub fn orders(&self) -> Result<Vec<AnnotatedOrder>, ViewError> {
        build_orders_view(&self.state.read())
    }

    pub fn orders_filtered(&self, filter: &OrderFilter) -> Result<Vec<AnnotatedOrder>, ViewError> {
        Ok(filter_orders(self.orders()?, filter))
    }

    pub fn reserve(&self) -> Result<ReserveView, ViewError> {
        build_reserve_view(&self.state.read())
    }

    pub fn metrics(&self) -> EngineMetricsSummary {
        let mut summary = self.metrics.summary();
        summary.bootstrap_failures = self.bootstrapper.failed_attempts();
        summary.tracked_lookups = self.lookups.lock().len();
        summary.metadata_cache = self.cache.stats();
        summary
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Submits an order to the controller. The order shows up later as an event.
    pub async fn submit_open_order(
        &self,
        collateral: &str,
        amount: BigUint,
        is_buy: bool,
    ) -> Result<String, CommandError> {
        if amount == BigUint::default() {
            return Err(CommandError::ZeroAmount);
        }
        let collateral = self.known_collateral(collateral)?;
        let method = if is_buy { "openBuyOrder" } else { "openSellOrder" };
        self.submit(
            method,
            &[Value::String(collateral), Value::String(amount.to_string())],
        )
        .await
    }

    pub async fn submit_update_tap(
        &self,
        collateral: &str,
        rate: BigUint,
    ) -> Result<String, CommandError> {
        let collateral = self.known_collateral(collateral)?;
        self.submit(
            "updateTokenTap",
            &[Value::String(collateral), Value::String(rate.to_string())],
        )
        .await
    }

    fn known_collateral(&self, collateral: &str) -> Result<Address, CommandError> {
        let collateral = normalize_address(collateral);
        let known = self.state.read().collateral_token(&collateral).is_some();
        if known {
            Ok(collateral)
        } else {
            Err(CommandError::UnknownCollateral(collateral))
        }
    }

    async fn submit(&self, method: &'static str, args: &[Value]) -> Result<String, CommandError> {
        match self.ledger.send(&self.addresses.controller, method, args).await {
            Ok(tx_hash) => {
                info!("Submitted {} as {}", method, tx_hash);
                Ok(tx_hash)
            }
            Err(cause) => {
                warn!("{} rejected: {:#}", method, cause);
                Err(CommandError::Rejected { method, cause })
            }
        }
    }
}
