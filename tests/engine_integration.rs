//! Integration tests for the projection engine
//!
//! Every test runs the engine against the in-memory fixture ledger, so the
//! retry, resubscription and command paths are exercised deterministically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use num_bigint::BigUint;
use serde_json::{json, Value};
use tokio::sync::{watch, Notify};

use fundraising_projector::error::{BootstrapError, CommandError, ViewError};
use fundraising_projector::ledger::{EventSource, EventStream, FixtureLedger, LedgerRpc, RawEvent};
use fundraising_projector::models::OrderState;
use fundraising_projector::snapshot::{MemorySnapshotStore, SnapshotStore, SqliteSnapshotStore};
use fundraising_projector::{Engine, EngineConfig, Outcome};

const CONTROLLER: &str = "0xc";
const MARKET_MAKER: &str = "0xmm";
const TAP: &str = "0xt";
const VAULT: &str = "0xv";
const DAI: &str = "0xdai";

fn config() -> EngineConfig {
    EngineConfig {
        controller: CONTROLLER.to_string(),
        network: "rinkeby".to_string(),
        ..EngineConfig::default()
    }
}

fn ledger() -> Arc<FixtureLedger> {
    let ledger = FixtureLedger::new();
    ledger.respond_any(CONTROLLER, "tokenManager", "0xtm");
    ledger.respond_any(CONTROLLER, "vault", VAULT);
    ledger.respond_any(CONTROLLER, "pool", "0xp");
    ledger.respond_any(CONTROLLER, "tap", TAP);
    ledger.respond_any(CONTROLLER, "marketMaker", MARKET_MAKER);
    ledger.respond_any(MARKET_MAKER, "token", "0xbond");
    ledger.respond_any(MARKET_MAKER, "PPM", "1000000");
    ledger.respond_any("0xbond", "totalSupply", "2000");
    ledger.respond_any("0xbond", "symbol", "BOND");
    ledger.respond_any(TAP, "maximumTapIncreasePct", "50000000000000000");
    ledger.respond_any(TAP, "beneficiary", "0xbeef");
    ledger.respond(VAULT, "balance", &[json!(DAI)], "1000");
    ledger.respond_any(DAI, "symbol", "DAI");
    ledger.respond_any(DAI, "name", "Dai Stablecoin");
    ledger.respond_any(DAI, "decimals", "18");
    Arc::new(ledger)
}

fn add_dai() -> RawEvent {
    RawEvent::new("AddCollateralToken")
        .from_contract(MARKET_MAKER)
        .with("collateralToken", DAI)
        .with("virtualSupply", "0")
        .with("virtualBalance", "0")
        .with("reserveRatio", "500000")
        .at_block(1)
}

fn add_tap() -> RawEvent {
    RawEvent::new("AddTokenTap")
        .from_contract(TAP)
        .with("token", DAI)
        .with("tap", "100")
        .at_block(2)
        .at_time(1_600_000_000)
}

fn buy_order() -> RawEvent {
    RawEvent::new("NewBuyOrder")
        .from_contract(MARKET_MAKER)
        .with("buyer", "0x1")
        .with("collateralToken", DAI)
        .with("batchId", "7")
        .with("value", "50")
        .with_tx("0xA")
        .at_block(3)
        .at_time(1_600_000_100)
}

fn clear_batch() -> RawEvent {
    RawEvent::new("ClearBatch")
        .from_contract(MARKET_MAKER)
        .with("batchId", "7")
        .with("collateralToken", DAI)
        .at_block(4)
}

fn return_buy() -> RawEvent {
    RawEvent::new("ReturnBuy")
        .from_contract(MARKET_MAKER)
        .with("buyer", "0x1")
        .with("batchId", "7")
        .with("collateralToken", DAI)
        .with("value", "50")
        .at_block(5)
}

async fn start(ledger: Arc<FixtureLedger>, store: Arc<dyn SnapshotStore>) -> Engine {
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    Engine::start(config(), ledger, store, cancel_rx)
        .await
        .expect("engine bootstrap")
}

#[tokio::test]
async fn order_lifecycle_through_the_engine() {
    let ledger = ledger();
    let engine = start(ledger.clone(), Arc::new(MemorySnapshotStore::new())).await;
    let mut changes = engine.subscribe();

    assert_eq!(engine.handle(add_dai()).await, Outcome::Projected);
    assert_eq!(changes.recv().await.unwrap().kind, "collateral_token_added");
    assert_eq!(engine.overview().unwrap_err(), ViewError::NotReady);

    engine.handle(add_tap()).await;
    engine.handle(buy_order()).await;
    engine.settle().await;

    let orders = engine.orders().unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].tx_hash, "0xa");
    assert_eq!(orders[0].amount, BigUint::from(50u32));
    assert_eq!(orders[0].collateral_symbol.as_deref(), Some("DAI"));
    assert_eq!(orders[0].state, OrderState::Pending);

    engine.handle(clear_batch()).await;
    assert_eq!(engine.orders().unwrap()[0].state, OrderState::Cleared);

    engine.handle(return_buy()).await;
    assert_eq!(engine.orders().unwrap()[0].state, OrderState::Returned);

    let overview = engine.overview().unwrap();
    assert_eq!(overview.reserve_balance, BigUint::from(1000u32));
    assert_eq!(overview.tap_rate, Some(BigUint::from(100u32)));
    assert_eq!(overview.total_supply, BigUint::from(2000u32));
    // 1000 * 1e6 / (2000 * 500_000)
    assert!((overview.price - 1.0).abs() < 1e-12);

    let reserve = engine.reserve().unwrap();
    assert_eq!(reserve.collateral_tokens[0].ratio, 0.5);
    assert!((reserve.maximum_tap_increase_pct - 0.05).abs() < 1e-12);
}

#[tokio::test]
async fn run_replays_and_resubscribes_after_a_dropped_stream() {
    let ledger = ledger();
    for raw in [add_dai(), buy_order(), clear_batch(), return_buy(), add_tap()] {
        ledger.push_event(raw);
    }
    ledger.drop_connection_after(MARKET_MAKER, 2);

    let engine = start(ledger.clone(), Arc::new(MemorySnapshotStore::new())).await;
    engine.run(ledger.as_ref()).await.unwrap();

    let state = engine.current_state();
    assert_eq!(state.orders.len(), 1);
    assert_eq!(state.cleared_batches.len(), 1);
    assert_eq!(state.returns.len(), 1);
    assert_eq!(state.collateral_tokens[0].symbol.as_deref(), Some("DAI"));

    let metrics = engine.metrics();
    assert_eq!(metrics.resubscriptions, 1);
    assert!(ledger
        .subscriptions()
        .contains(&(MARKET_MAKER.to_string(), Some(3))));
    assert_eq!(engine.orders().unwrap()[0].state, OrderState::Returned);
}

#[tokio::test(start_paused = true)]
async fn bootstrap_retries_until_contracts_resolve() {
    let ledger = ledger();
    ledger.fail_next(CONTROLLER, "marketMaker", 2);

    let started = tokio::time::Instant::now();
    let engine = start(ledger, Arc::new(MemorySnapshotStore::new())).await;

    assert!(started.elapsed() >= Duration::from_secs(6));
    assert_eq!(engine.metrics().bootstrap_failures, 2);
    assert_eq!(engine.addresses().market_maker, MARKET_MAKER);
}

#[tokio::test(start_paused = true)]
async fn bootstrap_stops_when_cancelled() {
    let ledger = Arc::new(FixtureLedger::new());
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let stop = async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel_tx.send(true).unwrap();
    };
    let (result, _) = tokio::join!(
        Engine::start(config(), ledger, Arc::new(MemorySnapshotStore::new()), cancel_rx),
        stop
    );
    assert!(matches!(result, Err(BootstrapError::Cancelled)));
}

#[tokio::test]
async fn removal_evicts_metadata_and_re_add_resolves_afresh() {
    let ledger = ledger();
    let engine = start(ledger.clone(), Arc::new(MemorySnapshotStore::new())).await;

    engine.handle(add_dai()).await;
    engine.settle().await;
    assert!(engine.metadata_cache().contains(DAI));

    assert_eq!(engine.handle(remove_dai(6)).await, Outcome::Projected);
    assert!(engine.current_state().collateral_tokens.is_empty());
    assert!(!engine.metadata_cache().contains(DAI));

    ledger.respond_any(DAI, "symbol", "NDAI");
    engine.handle(add_dai().at_block(7)).await;
    engine.settle().await;

    let state = engine.current_state();
    assert_eq!(state.collateral_tokens[0].symbol.as_deref(), Some("NDAI"));
    assert_eq!(ledger.call_count(DAI, "symbol"), 2);
}

fn remove_dai(block: u64) -> RawEvent {
    RawEvent::new("RemoveCollateralToken")
        .from_contract(MARKET_MAKER)
        .with("collateralToken", DAI)
        .at_block(block)
}

#[tokio::test]
async fn metadata_resolved_before_removal_is_not_folded_after_re_add() {
    let ledger = ledger();
    ledger.respond_any(DAI, "symbol", "OLD");
    let engine = start(ledger.clone(), Arc::new(MemorySnapshotStore::new())).await;

    // lookup completes and queues its result, but nothing folds it yet
    engine.handle(add_dai()).await;
    while !engine.metadata_cache().contains(DAI) {
        tokio::task::yield_now().await;
    }

    engine.handle(remove_dai(6)).await;
    ledger.respond_any(DAI, "symbol", "NEW");
    engine.handle(add_dai().at_block(7)).await;
    engine.settle().await;

    let state = engine.current_state();
    assert_eq!(state.collateral_tokens[0].symbol.as_deref(), Some("NEW"));
    assert_eq!(engine.metadata_cache().symbol(DAI).await.as_deref(), Some("NEW"));
    assert_eq!(engine.metrics().stale_lookups, 1);
}

/// Holds the first `symbol()` read of DAI until released, then answers "OLD".
struct HeldSymbolLedger {
    inner: Arc<FixtureLedger>,
    held: AtomicBool,
    release: Notify,
}

#[async_trait]
impl LedgerRpc for HeldSymbolLedger {
    async fn call(&self, to: &str, method: &str, args: &[Value]) -> anyhow::Result<Value> {
        if to == DAI && method == "symbol" && !self.held.swap(true, Ordering::SeqCst) {
            self.release.notified().await;
            return Ok(json!("OLD"));
        }
        self.inner.call(to, method, args).await
    }

    async fn send(&self, to: &str, method: &str, args: &[Value]) -> anyhow::Result<String> {
        self.inner.send(to, method, args).await
    }
}

#[tokio::test]
async fn in_flight_lookup_cannot_overwrite_a_re_added_token() {
    let inner = ledger();
    inner.respond_any(DAI, "symbol", "NEW");
    let held = Arc::new(HeldSymbolLedger {
        inner: inner.clone(),
        held: AtomicBool::new(false),
        release: Notify::new(),
    });
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let engine = Engine::start(
        config(),
        held.clone(),
        Arc::new(MemorySnapshotStore::new()),
        cancel_rx,
    )
    .await
    .unwrap();

    engine.handle(add_dai()).await;
    while !held.held.load(Ordering::SeqCst) {
        tokio::task::yield_now().await;
    }

    engine.handle(remove_dai(6)).await;
    engine.handle(add_dai().at_block(7)).await;
    held.release.notify_one();
    engine.settle().await;

    let state = engine.current_state();
    assert_eq!(state.collateral_tokens[0].symbol.as_deref(), Some("NEW"));
    assert_eq!(engine.metadata_cache().symbol(DAI).await.as_deref(), Some("NEW"));
}

#[tokio::test]
async fn finished_lookups_are_pruned_as_new_ones_start() {
    let ledger = ledger();
    ledger.respond(VAULT, "balance", &[json!("0xant")], "10");
    let engine = start(ledger, Arc::new(MemorySnapshotStore::new())).await;

    engine.handle(add_dai()).await;
    while !engine.metadata_cache().contains(DAI) {
        tokio::task::yield_now().await;
    }
    let add_ant = RawEvent::new("AddCollateralToken")
        .from_contract(MARKET_MAKER)
        .with("collateralToken", "0xant")
        .with("virtualSupply", "0")
        .with("virtualBalance", "0")
        .with("reserveRatio", "100000")
        .at_block(2);
    engine.handle(add_ant).await;
    assert_eq!(engine.metrics().tracked_lookups, 1);

    engine.settle().await;
    assert_eq!(engine.metrics().tracked_lookups, 0);
}

/// Subscriptions that stay open without ever delivering.
struct IdleSource;

#[async_trait]
impl EventSource for IdleSource {
    async fn subscribe(&self, _contract: &str, _from: Option<u64>) -> anyhow::Result<EventStream> {
        Ok(futures_util::stream::pending::<anyhow::Result<RawEvent>>().boxed())
    }
}

#[tokio::test(start_paused = true)]
async fn settle_does_not_block_on_an_active_event_loop() {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let engine = Engine::start(
        config(),
        ledger(),
        Arc::new(MemorySnapshotStore::new()),
        cancel_rx,
    )
    .await
    .unwrap();

    let alongside = async {
        tokio::task::yield_now().await;
        engine.handle(add_dai()).await;
        let settled = tokio::time::timeout(Duration::from_secs(5), engine.settle()).await;
        cancel_tx.send(true).unwrap();
        settled
    };
    let (run, settled) = tokio::join!(engine.run(&IdleSource), alongside);

    run.unwrap();
    assert!(settled.is_ok(), "settle waited on the running event loop");
    assert_eq!(engine.metrics().tracked_lookups, 0);
}

#[tokio::test]
async fn collateral_add_is_dropped_when_balance_lookup_fails() {
    let ledger = ledger();
    let engine = start(ledger, Arc::new(MemorySnapshotStore::new())).await;

    let add_ant = RawEvent::new("AddCollateralToken")
        .with("collateralToken", "0xant")
        .with("virtualSupply", "0")
        .with("virtualBalance", "0")
        .with("reserveRatio", "100000");
    assert_eq!(engine.handle(add_ant).await, Outcome::Dropped);
    assert!(engine.current_state().collateral_tokens.is_empty());

    // the pipeline keeps going
    assert_eq!(engine.handle(add_dai()).await, Outcome::Projected);
    assert_eq!(engine.metrics().events_dropped, 1);
}

#[tokio::test]
async fn vault_activity_refreshes_reserve_balance() {
    let ledger = ledger();
    let engine = start(ledger.clone(), Arc::new(MemorySnapshotStore::new())).await;
    engine.handle(add_dai()).await;

    ledger.respond(VAULT, "balance", &[json!(DAI)], "4500");
    let deposit = RawEvent::new("VaultDeposit")
        .from_contract(VAULT)
        .with("token", DAI)
        .at_block(8);
    assert_eq!(engine.handle(deposit).await, Outcome::Projected);
    assert_eq!(
        engine.current_state().collateral_tokens[0].balance,
        BigUint::from(4500u32)
    );

    let untracked = RawEvent::new("VaultTransfer").with("token", "0xother");
    assert_eq!(engine.handle(untracked).await, Outcome::Unchanged);
}

#[tokio::test]
async fn malformed_and_unknown_events_are_contained() {
    let ledger = ledger();
    let engine = start(ledger, Arc::new(MemorySnapshotStore::new())).await;
    engine.handle(add_dai()).await;
    let before = engine.current_state();

    let ambiguous = buy_order().with("seller", "0x2");
    assert_eq!(engine.handle(ambiguous).await, Outcome::Dropped);
    assert_eq!(engine.handle(RawEvent::new("NewPeriod")).await, Outcome::Ignored);

    let update_unknown = RawEvent::new("UpdateCollateralToken")
        .with("collateralToken", "0xant")
        .with("virtualSupply", "1")
        .with("virtualBalance", "1")
        .with("reserveRatio", "1");
    assert_eq!(engine.handle(update_unknown).await, Outcome::Dropped);

    assert_eq!(engine.current_state(), before);
    let metrics = engine.metrics();
    assert_eq!(metrics.normalize_errors, 1);
    assert_eq!(metrics.precondition_failures, 1);
    assert_eq!(metrics.events_ignored, 1);
}

#[tokio::test]
async fn commands_surface_rejections_without_touching_state() {
    let ledger = ledger();
    let engine = start(ledger.clone(), Arc::new(MemorySnapshotStore::new())).await;
    engine.handle(add_dai()).await;
    let before = engine.current_state();

    assert!(matches!(
        engine.submit_open_order("0xant", BigUint::from(1u32), true).await,
        Err(CommandError::UnknownCollateral(_))
    ));
    assert!(matches!(
        engine.submit_open_order(DAI, BigUint::default(), true).await,
        Err(CommandError::ZeroAmount)
    ));

    ledger.reject_commands("APP_AUTH_FAILED");
    let rejected = engine.submit_update_tap(DAI, BigUint::from(120u32)).await;
    assert!(matches!(
        rejected,
        Err(CommandError::Rejected {
            method: "updateTokenTap",
            ..
        })
    ));
    assert_eq!(engine.current_state(), before);

    ledger.accept_commands();
    let tx = engine
        .submit_open_order("0xDAI", BigUint::from(25u32), false)
        .await
        .unwrap();
    let sent = ledger.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].tx_hash, tx);
    assert_eq!(sent[0].to, CONTROLLER);
    assert_eq!(sent[0].method, "openSellOrder");
    assert_eq!(sent[0].args, vec![json!(DAI), json!("25")]);
    assert_eq!(engine.current_state(), before);
}

#[tokio::test]
async fn restart_restores_snapshot_and_refreshes_balances() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshots.db");

    {
        let store = Arc::new(SqliteSnapshotStore::open(&path, "fundraising").unwrap());
        let engine = start(ledger(), store).await;
        for raw in [add_dai(), add_tap(), buy_order(), clear_batch()] {
            engine.handle(raw).await;
        }
        engine.settle().await;
        engine.handle(RawEvent::new("SYNC_STATUS_SYNCING")).await;
    }

    let ledger = ledger();
    ledger.respond(VAULT, "balance", &[json!(DAI)], "3000");
    let store = Arc::new(SqliteSnapshotStore::open(&path, "fundraising").unwrap());
    let engine = start(ledger, store).await;

    let state = engine.current_state();
    assert!(!state.is_syncing);
    assert_eq!(state.orders.len(), 1);
    assert_eq!(state.cleared_batches.len(), 1);
    assert_eq!(state.taps.len(), 1);
    assert_eq!(state.collateral_tokens[0].balance, BigUint::from(3000u32));
    assert_eq!(state.collateral_tokens[0].reserve_ratio, 500_000);
    assert_eq!(engine.orders().unwrap()[0].state, OrderState::Cleared);
}
