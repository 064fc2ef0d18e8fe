//! Projector and read-model properties
//!
//! Pure tests: domain events are folded with `projector::project` and the
//! views are built from the result. No ledger involved.

use num_bigint::BigUint;
use proptest::prelude::*;

use fundraising_projector::error::ViewError;
use fundraising_projector::events::{
    CollateralParams, DomainEvent, OrderOpened, OrderReturned, TapParams,
};
use fundraising_projector::models::{AppState, OrderState, OrderType, TokenMetadata, PPM_BASE};
use fundraising_projector::projector::project;
use fundraising_projector::views::{build_orders_view, build_overview, build_reserve_view};

const TOKENS: [&str; 3] = ["0xdai", "0xant", "0xusdc"];

fn collateral(address: &str, virtual_supply: u64, ratio: u32) -> CollateralParams {
    CollateralParams {
        collateral: Some(address.to_string()),
        virtual_supply: BigUint::from(virtual_supply),
        virtual_balance: BigUint::from(1u32),
        reserve_ratio: ratio,
    }
}

fn tap(token: &str, rate: u64) -> TapParams {
    TapParams {
        token: token.to_string(),
        rate: BigUint::from(rate),
        floor: None,
        timestamp: 0,
    }
}

fn opened(tx: &str, order_type: OrderType, token: &str, batch_id: u64) -> DomainEvent {
    DomainEvent::OrderOpened(OrderOpened {
        tx_hash: tx.to_string(),
        order_type,
        address: "0x1".to_string(),
        collateral: token.to_string(),
        batch_id,
        amount: BigUint::from(50u32),
        timestamp: 0,
    })
}

fn returned(order_type: OrderType, token: &str, batch_id: u64) -> DomainEvent {
    DomainEvent::OrderReturned(OrderReturned {
        order_type,
        address: "0x1".to_string(),
        collateral: token.to_string(),
        batch_id,
    })
}

fn cleared(token: &str, batch_id: u64) -> DomainEvent {
    DomainEvent::BatchCleared {
        batch_id,
        collateral: token.to_string(),
    }
}

fn fold(events: &[DomainEvent]) -> AppState {
    events
        .iter()
        .fold(AppState::default(), |state, event| project(&state, event))
}

fn dai_symbol() -> DomainEvent {
    DomainEvent::TokenMetadataResolved {
        token: "0xdai".to_string(),
        metadata: TokenMetadata {
            symbol: Some("DAI".to_string()),
            ..Default::default()
        },
    }
}

#[test]
fn buy_order_scenario() {
    let mut events = vec![
        DomainEvent::CollateralTokenAdded(collateral("0xdai", 0, 500_000)),
        dai_symbol(),
        DomainEvent::TapAdded(tap("0xdai", 100)),
        opened("0xa", OrderType::Buy, "0xdai", 7),
    ];

    let orders = build_orders_view(&fold(&events)).unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].tx_hash, "0xa");
    assert_eq!(orders[0].amount, BigUint::from(50u32));
    assert_eq!(orders[0].collateral_symbol.as_deref(), Some("DAI"));
    assert_eq!(orders[0].state, OrderState::Pending);

    events.push(cleared("0xdai", 7));
    assert_eq!(
        build_orders_view(&fold(&events)).unwrap()[0].state,
        OrderState::Cleared
    );

    events.push(returned(OrderType::Buy, "0xdai", 7));
    assert_eq!(
        build_orders_view(&fold(&events)).unwrap()[0].state,
        OrderState::Returned
    );
}

#[test]
fn overview_not_ready_until_a_tap_exists() {
    let state = fold(&[DomainEvent::CollateralTokenAdded(collateral(
        "0xdai", 0, 500_000,
    ))]);
    assert_eq!(build_overview(&state), Err(ViewError::NotReady));

    let state = project(&state, &DomainEvent::TapAdded(tap("0xdai", 1)));
    assert!(build_overview(&state).is_ok());

    let state = project(&state, &DomainEvent::SyncStarted);
    assert_eq!(build_overview(&state), Err(ViewError::NotReady));
}

#[test]
fn virtual_supply_update_keeps_ratio() {
    let state = fold(&[
        DomainEvent::CollateralTokenAdded(collateral("0xdai", 10, 250_000)),
        DomainEvent::TapAdded(tap("0xdai", 1)),
    ]);
    let before = build_reserve_view(&state).unwrap();

    let state = project(
        &state,
        &DomainEvent::CollateralTokenUpdated(collateral("0xdai", 99, 250_000)),
    );
    let after = build_reserve_view(&state).unwrap();

    assert_eq!(before.collateral_tokens[0].ratio, 0.25);
    assert_eq!(after.collateral_tokens[0].ratio, 0.25);
    assert_eq!(
        state.collateral_tokens[0].virtual_supply,
        BigUint::from(99u32)
    );
}

// =============================================================================
// PROPERTIES
// =============================================================================

fn token() -> impl Strategy<Value = &'static str> {
    prop::sample::select(TOKENS.to_vec())
}

fn order_type() -> impl Strategy<Value = OrderType> {
    prop_oneof![Just(OrderType::Buy), Just(OrderType::Sell)]
}

fn any_event() -> impl Strategy<Value = DomainEvent> {
    prop_oneof![
        (token(), 0u64..1000, 0u32..=2 * PPM_BASE)
            .prop_map(|(t, vs, r)| DomainEvent::CollateralTokenAdded(collateral(t, vs, r))),
        (token(), 0u64..1000, 0u32..=PPM_BASE)
            .prop_map(|(t, vs, r)| DomainEvent::CollateralTokenUpdated(collateral(t, vs, r))),
        token().prop_map(|t| DomainEvent::CollateralTokenRemoved {
            collateral: Some(t.to_string())
        }),
        (token(), 0u64..1000).prop_map(|(t, r)| DomainEvent::TapAdded(tap(t, r))),
        (token(), 0u64..1000).prop_map(|(t, r)| DomainEvent::TapUpdated(tap(t, r))),
        token().prop_map(|t| DomainEvent::TapRemoved {
            token: t.to_string()
        }),
        (0u8..8, order_type(), token(), 0u64..4)
            .prop_map(|(tx, ty, t, b)| opened(&format!("0x{:x}", tx), ty, t, b)),
        (token(), 0u64..4).prop_map(|(t, b)| cleared(t, b)),
        (order_type(), token(), 0u64..4).prop_map(|(ty, t, b)| returned(ty, t, b)),
        token().prop_map(|t| DomainEvent::ReserveBalanceChanged {
            token: t.to_string(),
            balance: BigUint::from(7u32),
        }),
        Just(DomainEvent::SyncStarted),
        Just(DomainEvent::SyncFinished),
    ]
}

proptest! {
    #[test]
    fn arbitrary_orderings_never_panic(events in prop::collection::vec(any_event(), 0..60)) {
        let state = fold(&events);
        for token in &state.collateral_tokens {
            prop_assert!(token.reserve_ratio <= state.ppm);
        }
        let mut hashes: Vec<&str> = state.orders.iter().map(|o| o.tx_hash.as_str()).collect();
        hashes.sort_unstable();
        hashes.dedup();
        prop_assert_eq!(hashes.len(), state.orders.len());
    }

    #[test]
    fn redelivery_is_idempotent(
        events in prop::collection::vec(any_event(), 0..40),
        replay in prop::collection::vec(prop_oneof![
            (token(), 0u64..4).prop_map(|(t, b)| cleared(t, b)),
            (order_type(), token(), 0u64..4).prop_map(|(ty, t, b)| returned(ty, t, b)),
        ], 1..10),
    ) {
        let mut once = events.clone();
        once.extend(replay.iter().cloned());
        let mut twice = once.clone();
        twice.extend(replay.iter().cloned());

        let once = fold(&once);
        let twice = fold(&twice);
        prop_assert_eq!(build_orders_view(&once), build_orders_view(&twice));
        prop_assert_eq!(once.cleared_batches, twice.cleared_batches);
        prop_assert_eq!(once.returns, twice.returns);
    }

    #[test]
    fn returned_always_wins_over_cleared(
        order_type in order_type(),
        token in token(),
        batch in 0u64..4,
        clear_first in any::<bool>(),
    ) {
        let settle = if clear_first {
            vec![cleared(token, batch), returned(order_type, token, batch)]
        } else {
            vec![returned(order_type, token, batch), cleared(token, batch)]
        };
        let mut events = vec![opened("0xa", order_type, token, batch)];
        events.extend(settle);

        let state = fold(&events);
        prop_assert_eq!(state.order_state(&state.orders[0]), OrderState::Returned);
    }
}
