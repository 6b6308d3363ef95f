//! End-to-end scenarios spanning more than one module: a missed push event
//! recovered by the batch reconciler, a live order adopted instead of
//! duplicated, and the full opening-fill-to-profit-target-fill lifecycle.
//! Needs the `test-support` feature for `StubBroker`.

#![cfg(feature = "test-support")]

use std::collections::HashMap;

use chrono::Utc;
use rust_decimal_macros::dec;

use spread_reconciler::broker::tests_support::StubBroker;
use spread_reconciler::broker::{Fill, InstrumentType, Leg, LegAction, OrderStatus, PlacedOrder};
use spread_reconciler::config::Config;
use spread_reconciler::events::processor::{process_order_event, reconcile_trades};
use spread_reconciler::execution::{ExecutionError, OrderExecutor, PlacedExitOrder, ProfitTargetSpec};
use spread_reconciler::models::{
    LifecycleState, Position, PositionLeg, PositionMetadata, Trade, TradeStatus, TradeType,
};
use spread_reconciler::money::{self, PriceEffect, QuantityDirection};
use spread_reconciler::profit_targets::reconciler::fix_profit_targets;
use spread_reconciler::store::{PositionFilter, Store};

use async_trait::async_trait;
use std::sync::Mutex as StdMutex;

struct RecordingExecutor {
    placed: StdMutex<Vec<String>>,
}

impl RecordingExecutor {
    fn new() -> Self {
        RecordingExecutor { placed: StdMutex::new(Vec::new()) }
    }

    fn placed_spread_types(&self) -> Vec<String> {
        self.placed.lock().unwrap().clone()
    }
}

#[async_trait]
impl OrderExecutor for RecordingExecutor {
    async fn place_exit_order(
        &self,
        _account: &str,
        spec: &ProfitTargetSpec,
    ) -> Result<PlacedExitOrder, ExecutionError> {
        self.placed.lock().unwrap().push(spec.spread_type.clone());
        Ok(PlacedExitOrder {
            spread_type: spec.spread_type.clone(),
            order_id: format!("NEW-{}", spec.spread_type),
        })
    }

    async fn cancel_order(&self, _account: &str, _order_id: &str) -> Result<(), ExecutionError> {
        Ok(())
    }
}

fn vertical_spread_position(opening_order_id: &str) -> Position {
    Position {
        id: 0,
        user: 7,
        trading_account: "ACC7".into(),
        symbol: "SENX".into(),
        instrument_type: InstrumentType::EquityOption,
        strategy_type: Some("short_call_vertical".into()),
        lifecycle_state: LifecycleState::PendingEntry,
        quantity: 1,
        avg_price: dec!(0),
        unrealized_pnl: dec!(0),
        total_realized_pnl: dec!(0),
        opening_price_effect: PriceEffect::Credit,
        initial_risk: None,
        spread_width: None,
        number_of_spreads: Some(1),
        is_app_managed: true,
        opening_order_id: Some(opening_order_id.to_string()),
        opening_complex_order_id: None,
        closure_reason: None,
        assigned_at: None,
        profit_targets_created: false,
        profit_target_details: HashMap::new(),
        metadata: PositionMetadata {
            legs: vec![
                PositionLeg {
                    symbol: "SENX  250117C00455000".into(),
                    quantity: -1,
                    quantity_direction: QuantityDirection::Short,
                    average_open_price: dec!(2.10),
                    close_price: None,
                    mark_price: None,
                    multiplier: money::DEFAULT_MULTIPLIER,
                    instrument_type: InstrumentType::EquityOption,
                    action: None,
                },
                PositionLeg {
                    symbol: "SENX  250117C00460000".into(),
                    quantity: 1,
                    quantity_direction: QuantityDirection::Long,
                    average_open_price: dec!(0.40),
                    close_price: None,
                    mark_price: None,
                    multiplier: money::DEFAULT_MULTIPLIER,
                    instrument_type: InstrumentType::EquityOption,
                    action: None,
                },
            ],
            spread_legs: {
                let mut m = HashMap::new();
                m.insert(
                    "spread".to_string(),
                    vec!["SENX  250117C00455000".to_string(), "SENX  250117C00460000".to_string()],
                );
                m
            },
            ..Default::default()
        },
        opened_at: Utc::now(),
        closed_at: None,
    }
}

fn opening_trade(position_id: i64, broker_order_id: &str) -> Trade {
    Trade {
        id: 0,
        user: 7,
        position: position_id,
        trading_account: "ACC7".into(),
        broker_order_id: broker_order_id.to_string(),
        trade_type: TradeType::Open,
        order_legs: serde_json::Value::Null,
        executed_price: None,
        fill_price: None,
        quantity: 1,
        status: TradeStatus::Live,
        submitted_at: Some(Utc::now()),
        filled_at: None,
        commission: dec!(0),
        parent_order_id: None,
        child_order_ids: vec![],
        lifecycle_event: None,
        lifecycle_snapshot: None,
        order_type: Some("Limit".into()),
        time_in_force: Some("Day".into()),
        metadata: serde_json::Value::Null,
        realized_pnl: None,
    }
}

/// Scenario: a fill push from the broker never arrives, leaving the Position
/// stuck in `pending_entry`. The batch reconciler (C12 step 6) notices the
/// broker already reports the opening order filled and replays the same
/// transition the push handler would have applied, including standing up the
/// profit-target order.
#[tokio::test]
async fn reconcile_trades_recovers_missed_fill() {
    let store = Store::open_in_memory().unwrap();
    let position = store.insert_position(vertical_spread_position("ORD-MISSED")).await.unwrap();
    store.upsert_trade(opening_trade(position.id, "ORD-MISSED")).await.unwrap();

    let broker = StubBroker::new();
    broker.set_order(PlacedOrder {
        id: "ORD-MISSED".into(),
        status: OrderStatus::Filled,
        order_type: "Limit".into(),
        size: 1,
        underlying_symbol: "SENX".into(),
        underlying_instrument_type: InstrumentType::EquityOption,
        time_in_force: "Day".into(),
        price: Some(dec!(1.70)),
        price_effect: Some(PriceEffect::Credit),
        received_at: Utc::now(),
        live_at: None,
        filled_at: Some(Utc::now()),
        cancelled_at: None,
        terminal_at: Some(Utc::now()),
        complex_order_id: None,
        parent_order_id: None,
        replaces_order_id: None,
        replacing_order_id: None,
        contingent_status: None,
        reject_reason: None,
        legs: vec![],
    });

    let executor = RecordingExecutor::new();
    let filter = PositionFilter { user_id: Some(7), ..Default::default() };
    let report = reconcile_trades(&broker, &executor, &store, &filter).await;

    assert!(report.success);
    assert_eq!(report.items_processed, 1);
    assert_eq!(report.items_updated, 1);

    let saved = store.get_position(position.id).await.unwrap();
    assert_eq!(saved.lifecycle_state, LifecycleState::OpenFull);
    assert!(saved.profit_targets_created);
    assert_eq!(executor.placed_spread_types(), vec!["spread".to_string()]);

    let trade = store.get_trade_by_broker_order_id("ORD-MISSED").await.unwrap().unwrap();
    assert_eq!(trade.status, TradeStatus::Filled);
}

/// Scenario: a prior reconciliation run crashed after placing an exit order
/// at the broker but before recording its id on the Position. The next run
/// must find and adopt that still-live order instead of placing a duplicate.
#[tokio::test]
async fn fix_profit_targets_adopts_orphaned_live_order_instead_of_duplicating() {
    let store = Store::open_in_memory().unwrap();

    let mut position = vertical_spread_position("ORD-OPEN");
    position.lifecycle_state = LifecycleState::OpenFull;
    position.avg_price = dec!(1.70);
    let position = store.insert_position(position).await.unwrap();

    let orphan_legs = vec![
        Leg {
            symbol: "SENX  250117C00455000".into(),
            instrument_type: InstrumentType::EquityOption,
            action: LegAction::BuyToClose,
            quantity: 1,
            remaining_quantity: Some(0),
            fills: vec![],
        },
        Leg {
            symbol: "SENX  250117C00460000".into(),
            instrument_type: InstrumentType::EquityOption,
            action: LegAction::SellToClose,
            quantity: 1,
            remaining_quantity: Some(0),
            fills: vec![],
        },
    ];
    let orphan_order = PlacedOrder {
        id: "ORPHAN1".into(),
        status: OrderStatus::Live,
        order_type: "Limit".into(),
        size: 1,
        underlying_symbol: "SENX".into(),
        underlying_instrument_type: InstrumentType::EquityOption,
        time_in_force: "Gtc".into(),
        price: Some(dec!(0.85)),
        price_effect: Some(PriceEffect::Debit),
        received_at: position.opened_at,
        live_at: Some(position.opened_at),
        filled_at: None,
        cancelled_at: None,
        terminal_at: None,
        complex_order_id: None,
        parent_order_id: None,
        replaces_order_id: None,
        replacing_order_id: None,
        contingent_status: None,
        reject_reason: None,
        legs: orphan_legs,
    };

    store
        .upsert_order_history(&spread_reconciler::models::OrderHistory {
            broker_order_id: "ORPHAN1".into(),
            user: 7,
            trading_account: "ACC7".into(),
            complex_order_id: None,
            parent_order_id: None,
            replaces_order_id: None,
            replacing_order_id: None,
            underlying_symbol: "SENX".into(),
            order_type: "Limit".into(),
            status: OrderStatus::Live,
            price: orphan_order.price,
            price_effect: orphan_order.price_effect,
            received_at: orphan_order.received_at,
            live_at: orphan_order.live_at,
            filled_at: None,
            cancelled_at: None,
            terminal_at: None,
            order_data: serde_json::to_value(&orphan_order).unwrap(),
        })
        .await
        .unwrap();

    let broker = StubBroker::new();
    broker.set_order(orphan_order);

    let executor = RecordingExecutor::new();
    let config = Config { replace_cancelled_targets: true, ..Default::default() };
    let filter = PositionFilter { user_id: Some(7), ..Default::default() };

    let report = fix_profit_targets(&broker, &executor, &store, &config, &filter).await;

    assert!(report.success);
    assert_eq!(report.items_updated, 1);
    assert_eq!(report.items_created, 0);
    assert!(executor.placed_spread_types().is_empty(), "must adopt the orphan, not place a new order");

    let saved = store.get_position(position.id).await.unwrap();
    assert_eq!(
        saved.profit_target_details.get("spread").and_then(|d| d.order_id.clone()),
        Some("ORPHAN1".to_string())
    );
}

/// Scenario: happy-path lifecycle. The opening order fills, the single-event
/// handler (C11) transitions the Position and stands up its profit-target
/// order, and the broker later reports that exit order filled. The batch
/// reconciler's inline fill-application path realizes the pnl and closes
/// the Position, all without ever placing a duplicate order.
#[tokio::test]
async fn happy_path_opening_fill_then_profit_target_fill_closes_position() {
    let store = Store::open_in_memory().unwrap();
    let position = store.insert_position(vertical_spread_position("ORD-OPEN")).await.unwrap();
    store.upsert_trade(opening_trade(position.id, "ORD-OPEN")).await.unwrap();

    let broker = StubBroker::new();
    let executor = RecordingExecutor::new();

    let opening_fill = PlacedOrder {
        id: "ORD-OPEN".into(),
        status: OrderStatus::Filled,
        order_type: "Limit".into(),
        size: 1,
        underlying_symbol: "SENX".into(),
        underlying_instrument_type: InstrumentType::EquityOption,
        time_in_force: "Day".into(),
        price: None,
        price_effect: Some(PriceEffect::Credit),
        received_at: Utc::now(),
        live_at: None,
        filled_at: Some(Utc::now()),
        cancelled_at: None,
        terminal_at: Some(Utc::now()),
        complex_order_id: None,
        parent_order_id: None,
        replaces_order_id: None,
        replacing_order_id: None,
        contingent_status: None,
        reject_reason: None,
        legs: vec![
            Leg {
                symbol: "SENX  250117C00455000".into(),
                instrument_type: InstrumentType::EquityOption,
                action: LegAction::SellToOpen,
                quantity: 1,
                remaining_quantity: Some(0),
                fills: vec![Fill {
                    ext_group_fill_id: None,
                    fill_id: "f1".into(),
                    quantity: 1,
                    fill_price: dec!(2.10),
                    filled_at: Utc::now(),
                }],
            },
            Leg {
                symbol: "SENX  250117C00460000".into(),
                instrument_type: InstrumentType::EquityOption,
                action: LegAction::BuyToOpen,
                quantity: 1,
                remaining_quantity: Some(0),
                fills: vec![Fill {
                    ext_group_fill_id: None,
                    fill_id: "f2".into(),
                    quantity: 1,
                    fill_price: dec!(0.40),
                    filled_at: Utc::now(),
                }],
            },
        ],
    };

    let outcome = process_order_event(&broker, &executor, &store, &opening_fill).await.unwrap();
    assert!(outcome.position_transitioned);
    assert_eq!(outcome.profit_targets_created, 1);
    assert_eq!(executor.placed_spread_types(), vec!["spread".to_string()]);

    let opened = store.get_position(position.id).await.unwrap();
    assert_eq!(opened.lifecycle_state, LifecycleState::OpenFull);
    let pt_order_id = opened
        .profit_target_details
        .get("spread")
        .and_then(|d| d.order_id.clone())
        .expect("profit target order id recorded");

    let pt_fill = PlacedOrder {
        id: pt_order_id.clone(),
        status: OrderStatus::Filled,
        order_type: "Limit".into(),
        size: 1,
        underlying_symbol: "SENX".into(),
        underlying_instrument_type: InstrumentType::EquityOption,
        time_in_force: "Gtc".into(),
        price: Some(dec!(0.85)),
        price_effect: Some(PriceEffect::Debit),
        received_at: Utc::now(),
        live_at: None,
        filled_at: Some(Utc::now()),
        cancelled_at: None,
        terminal_at: Some(Utc::now()),
        complex_order_id: None,
        parent_order_id: None,
        replaces_order_id: None,
        replacing_order_id: None,
        contingent_status: None,
        reject_reason: None,
        legs: vec![],
    };

    let outcome = process_order_event(&broker, &executor, &store, &pt_fill).await.unwrap();
    assert!(outcome.profit_target_filled);

    let closed = store.get_position(position.id).await.unwrap();
    assert_eq!(closed.lifecycle_state, LifecycleState::Closed);
    assert_eq!(closed.quantity, 0);
    // credit 1.70 - debit 0.85, times the default multiplier.
    assert_eq!(closed.total_realized_pnl, dec!(85.00));
}
