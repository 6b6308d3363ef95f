//! Single-event handler for one broker `PlacedOrder` push (spec §4.11).
//! Single-threaded per user; every Position write happens inside
//! [`crate::store::Store::with_position_locked`] so a racing C12 run never
//! overwrites a state this handler just applied, and vice versa.

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::broker::{self, calculate_fill_price, BrokerSession, OrderStatus, PlacedOrder};
use crate::error::EngineResult;
use crate::execution::{expected_spread_types, OrderExecutor};
use crate::models::{ClosureReason, LifecycleState, OrderHistory, Trade, TradeStatus, TradeType};
use crate::profit_targets::reconciler::{apply_filled_target, build_exit_spec};
use crate::report::PhaseReport;
use crate::store::{PositionFilter, Store};

/// What a single event call did, mostly useful for logging/metrics — no
/// caller depends on these fields for correctness.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventOutcome {
    pub position_transitioned: bool,
    pub profit_target_filled: bool,
    pub profit_targets_created: u64,
    /// Set when the caller should kick off an async Position Sync (C8) to
    /// populate legs and `avg_price` for a freshly opened position.
    pub triggers_sync: bool,
}

pub async fn process_order_event(
    broker: &dyn BrokerSession,
    executor: &dyn OrderExecutor,
    store: &Store,
    order: &PlacedOrder,
) -> EngineResult<EventOutcome> {
    let mut outcome = EventOutcome::default();

    let Some(mut trade) = store.get_trade_by_broker_order_id(&order.id).await? else {
        if let Some((position_id, spread_type)) = store.position_for_profit_target_order(&order.id).await? {
            if order.status == OrderStatus::Filled {
                outcome.profit_target_filled =
                    handle_profit_target_fill(store, position_id, &spread_type, order).await?;
            }
        } else {
            warn!(order_id = %order.id, "order event for unrecognized order; ignoring");
        }
        return Ok(outcome);
    };

    let new_status = to_trade_status(order.status);
    if trade.status == new_status {
        return Ok(outcome);
    }

    let position = store.get_position(trade.position).await?;

    if order.status == OrderStatus::Filled && position.lifecycle_state == LifecycleState::PendingEntry {
        let fill_price = order.price.or_else(|| calculate_fill_price(order));
        let filled_at = order.filled_at.unwrap_or_else(Utc::now);

        store
            .with_position_locked(position.id, true, move |p| {
                p.lifecycle_state = LifecycleState::OpenFull;
                if let Some(price) = fill_price {
                    p.avg_price = price;
                }
                Ok(())
            })
            .await?;
        outcome.position_transitioned = true;
        outcome.triggers_sync = true;

        trade.fill_price = fill_price;
        trade.filled_at = Some(filled_at);

        if trade.child_order_ids.is_empty() && !position.profit_targets_created {
            let child_order_ids = create_profit_targets(executor, store, position.id).await?;
            outcome.profit_targets_created = child_order_ids.len() as u64;
            trade.child_order_ids.extend(child_order_ids);
        }
        info!(position = position.id, order_id = %order.id, "opening order filled");
    } else if order.status.is_terminal()
        && order.status != OrderStatus::Filled
        && position.lifecycle_state == LifecycleState::PendingEntry
    {
        let reason = closure_reason_for_status(order.status);
        store
            .with_position_locked(position.id, true, move |p| {
                p.lifecycle_state = LifecycleState::Closed;
                p.closed_at = Some(Utc::now());
                p.closure_reason = Some(reason);
                p.quantity = 0;
                p.unrealized_pnl = Decimal::ZERO;
                Ok(())
            })
            .await?;
        outcome.position_transitioned = true;
        info!(position = position.id, order_id = %order.id, status = ?order.status, "opening order closed without a fill");
    }

    trade.status = new_status;
    store.upsert_trade(trade).await?;

    Ok(outcome)
}

/// C12 step 6, the batch counterpart of this module's single-event path:
/// finds Positions stuck in `pending_entry` whose opening order the broker
/// already reports filled or terminal, and replays the same transition this
/// module would have applied had the push event not been lost.
pub async fn reconcile_trades(
    broker: &dyn BrokerSession,
    executor: &dyn OrderExecutor,
    store: &Store,
    filter: &PositionFilter,
) -> PhaseReport {
    let started = std::time::Instant::now();
    let mut builder = PhaseReport::builder();

    let positions = match store.load_open_positions(filter, false).await {
        Ok(p) => p
            .into_iter()
            .filter(|p| p.lifecycle_state == LifecycleState::PendingEntry)
            .collect::<Vec<_>>(),
        Err(e) => {
            builder.error("reconcile_trades", e);
            return builder.finish(started, serde_json::Value::Null);
        }
    };

    for position in positions {
        builder.processed(1);
        let Some(order_id) = position.opening_order_id.clone() else { continue };

        match broker::retry_once(|| broker.get_order(&position.trading_account, &order_id)).await {
            Ok(Some(order)) if order.status.is_terminal() => {
                match process_order_event(broker, executor, store, &order).await {
                    Ok(outcome) if outcome.position_transitioned => {
                        builder.updated(1);
                    }
                    Ok(_) => {}
                    Err(e) => builder.error(format!("position:{}", position.id), e),
                }
            }
            Ok(_) => {}
            Err(e) => builder.error(format!("position:{}", position.id), e),
        }
    }

    builder.finish(started, serde_json::Value::Null)
}

async fn handle_profit_target_fill(
    store: &Store,
    position_id: i64,
    spread_type: &str,
    order: &PlacedOrder,
) -> EngineResult<bool> {
    let order_history = to_order_history(order);
    let filled = apply_filled_target(store, position_id, spread_type, &order_history).await?;
    if !filled {
        return Ok(false);
    }

    let position = store.get_position(position_id).await?;
    let detail = position.profit_target_details.get(spread_type);
    let trade = Trade {
        id: 0,
        user: position.user,
        position: position.id,
        trading_account: position.trading_account.clone(),
        broker_order_id: order.id.clone(),
        trade_type: TradeType::Close,
        order_legs: serde_json::to_value(&order.legs).unwrap_or(serde_json::Value::Null),
        executed_price: detail.and_then(|d| d.fill_price),
        fill_price: detail.and_then(|d| d.fill_price),
        quantity: order.size,
        status: TradeStatus::Filled,
        submitted_at: Some(order.received_at),
        filled_at: Some(order.filled_at.unwrap_or_else(Utc::now)),
        commission: Decimal::ZERO,
        parent_order_id: order.parent_order_id.clone(),
        child_order_ids: Vec::new(),
        lifecycle_event: Some("profit_target_fill".to_string()),
        lifecycle_snapshot: None,
        order_type: Some(order.order_type.clone()),
        time_in_force: Some(order.time_in_force.clone()),
        metadata: serde_json::json!({ "spread_type": spread_type }),
        realized_pnl: detail.and_then(|d| d.realized_pnl),
    };
    store.upsert_trade(trade).await?;
    info!(position = position.id, spread_type, order_id = %order.id, "profit target filled");
    Ok(true)
}

/// Places one exit order per expected spread type that this strategy
/// declares legs for (spec §4.11 step 5). Does not cancel or replace
/// anything already recorded — this only runs once, right after the
/// opening fill, before `profit_targets_created` is set. Returns the
/// broker order ids placed; the caller folds them into the opening
/// Trade's `child_order_ids` and saves it in one write.
async fn create_profit_targets(
    executor: &dyn OrderExecutor,
    store: &Store,
    position_id: i64,
) -> EngineResult<Vec<String>> {
    let position = store.get_position(position_id).await?;
    let strategy = position.strategy_type.as_deref().unwrap_or("");
    let expected = expected_spread_types(strategy);
    if expected.is_empty() {
        return Ok(Vec::new());
    }

    let mut child_order_ids = Vec::new();
    for (spread_type, target_pct) in expected {
        if !position.metadata.spread_legs.contains_key(spread_type) {
            continue;
        }
        let spec = match build_exit_spec(&position, spread_type, target_pct) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(position = position.id, spread_type, error = %e, "could not build profit-target spec");
                continue;
            }
        };
        let placed = executor.place_exit_order(&position.trading_account, &spec).await?;
        child_order_ids.push(placed.order_id.clone());

        store
            .with_position_locked(position.id, false, {
                let spread_type = spread_type.to_string();
                let order_id = placed.order_id.clone();
                move |p| {
                    let detail = p.profit_target_details.entry(spread_type).or_default();
                    detail.order_id = Some(order_id);
                    detail.percent = target_pct;
                    detail.original_credit = Some(p.avg_price);
                    detail.submitted_at = Some(Utc::now());
                    p.profit_targets_created = true;
                    Ok(())
                }
            })
            .await?;
    }

    Ok(child_order_ids)
}

fn closure_reason_for_status(status: OrderStatus) -> ClosureReason {
    match status {
        OrderStatus::Cancelled => ClosureReason::OrderCancelled,
        OrderStatus::Rejected => ClosureReason::OrderRejected,
        OrderStatus::Expired => ClosureReason::OrderExpired,
        _ => ClosureReason::Unknown,
    }
}

fn to_trade_status(status: OrderStatus) -> TradeStatus {
    match status {
        OrderStatus::Received => TradeStatus::Submitted,
        OrderStatus::Routed => TradeStatus::Routed,
        OrderStatus::InFlight => TradeStatus::Working,
        OrderStatus::Live => TradeStatus::Live,
        OrderStatus::Filled => TradeStatus::Filled,
        OrderStatus::Cancelled | OrderStatus::Expired => TradeStatus::Cancelled,
        OrderStatus::Rejected => TradeStatus::Rejected,
    }
}

fn to_order_history(order: &PlacedOrder) -> OrderHistory {
    OrderHistory {
        broker_order_id: order.id.clone(),
        user: 0,
        trading_account: String::new(),
        complex_order_id: order.complex_order_id.clone(),
        parent_order_id: order.parent_order_id.clone(),
        replaces_order_id: order.replaces_order_id.clone(),
        replacing_order_id: order.replacing_order_id.clone(),
        underlying_symbol: order.underlying_symbol.clone(),
        order_type: order.order_type.clone(),
        status: order.status,
        price: order.price,
        price_effect: order.price_effect,
        received_at: order.received_at,
        live_at: order.live_at,
        filled_at: order.filled_at,
        cancelled_at: order.cancelled_at,
        terminal_at: order.terminal_at,
        order_data: serde_json::to_value(order).unwrap_or(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::tests_support::StubBroker;
    use crate::broker::InstrumentType;
    use crate::execution::{ExecutionError, PlacedExitOrder, ProfitTargetSpec};
    use crate::models::{LifecycleState, Position, PositionLeg, PositionMetadata, ProfitTargetDetail};
    use crate::money::{self, PriceEffect, QuantityDirection};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StubExecutor {
        placed: Mutex<Vec<String>>,
    }

    impl StubExecutor {
        fn new() -> Self {
            StubExecutor { placed: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl OrderExecutor for StubExecutor {
        async fn place_exit_order(
            &self,
            _account: &str,
            spec: &ProfitTargetSpec,
        ) -> Result<PlacedExitOrder, ExecutionError> {
            let id = format!("PT-{}", spec.spread_type);
            self.placed.lock().unwrap().push(id.clone());
            Ok(PlacedExitOrder { spread_type: spec.spread_type.clone(), order_id: id })
        }

        async fn cancel_order(&self, _account: &str, _order_id: &str) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    fn pending_position() -> Position {
        Position {
            id: 0,
            user: 1,
            trading_account: "ACC1".into(),
            symbol: "SYM".into(),
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
            opening_order_id: Some("ORD1".into()),
            opening_complex_order_id: None,
            closure_reason: None,
            assigned_at: None,
            profit_targets_created: false,
            profit_target_details: HashMap::new(),
            metadata: PositionMetadata {
                legs: vec![
                    PositionLeg {
                        symbol: "SYM   250117C00455000".into(),
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
                        symbol: "SYM   250117C00460000".into(),
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
                        vec!["SYM   250117C00455000".to_string(), "SYM   250117C00460000".to_string()],
                    );
                    m
                },
                ..Default::default()
            },
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    fn opening_order(id: &str, status: OrderStatus) -> PlacedOrder {
        PlacedOrder {
            id: id.to_string(),
            status,
            order_type: "Limit".into(),
            size: 1,
            underlying_symbol: "SYM".into(),
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
        }
    }

    #[tokio::test]
    async fn opening_fill_transitions_and_creates_targets() {
        let store = Store::open_in_memory().unwrap();
        let position = store.insert_position(pending_position()).await.unwrap();
        store
            .upsert_trade(Trade {
                id: 0,
                user: 1,
                position: position.id,
                trading_account: "ACC1".into(),
                broker_order_id: "ORD1".into(),
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
            })
            .await
            .unwrap();

        let broker = StubBroker::new();
        let executor = StubExecutor::new();
        let order = opening_order("ORD1", OrderStatus::Filled);

        let outcome = process_order_event(&broker, &executor, &store, &order).await.unwrap();
        assert!(outcome.position_transitioned);
        assert!(outcome.triggers_sync);
        assert_eq!(outcome.profit_targets_created, 1);

        let saved = store.get_position(position.id).await.unwrap();
        assert_eq!(saved.lifecycle_state, LifecycleState::OpenFull);
        assert!(saved.profit_targets_created);
        assert_eq!(
            saved.profit_target_details.get("spread").and_then(|d| d.order_id.clone()),
            Some("PT-spread".to_string())
        );

        let trade = store.get_trade_by_broker_order_id("ORD1").await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Filled);
        assert_eq!(trade.child_order_ids, vec!["PT-spread".to_string()]);
    }

    #[tokio::test]
    async fn cancelled_opening_order_closes_pending_position() {
        let store = Store::open_in_memory().unwrap();
        let position = store.insert_position(pending_position()).await.unwrap();
        store
            .upsert_trade(Trade {
                id: 0,
                user: 1,
                position: position.id,
                trading_account: "ACC1".into(),
                broker_order_id: "ORD1".into(),
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
            })
            .await
            .unwrap();

        let broker = StubBroker::new();
        let executor = StubExecutor::new();
        let order = opening_order("ORD1", OrderStatus::Cancelled);

        let outcome = process_order_event(&broker, &executor, &store, &order).await.unwrap();
        assert!(outcome.position_transitioned);

        let saved = store.get_position(position.id).await.unwrap();
        assert_eq!(saved.lifecycle_state, LifecycleState::Closed);
        assert_eq!(saved.closure_reason, Some(ClosureReason::OrderCancelled));
    }

    #[tokio::test]
    async fn profit_target_fill_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let mut position = pending_position();
        position.lifecycle_state = LifecycleState::OpenFull;
        position.avg_price = dec!(1.70);
        position.profit_target_details.insert(
            "spread".to_string(),
            ProfitTargetDetail {
                order_id: Some("PT1".into()),
                percent: dec!(50),
                original_credit: Some(dec!(1.70)),
                target_price: Some(dec!(0.85)),
                status: None,
                submitted_at: None,
                filled_at: None,
                fill_price: None,
                realized_pnl: None,
                skip_recreation: false,
                skip_reason: None,
            },
        );
        let position = store.insert_position(position).await.unwrap();

        let broker = StubBroker::new();
        let executor = StubExecutor::new();
        let order = opening_order("PT1", OrderStatus::Filled);

        let first = process_order_event(&broker, &executor, &store, &order).await.unwrap();
        assert!(first.profit_target_filled);
        let second = process_order_event(&broker, &executor, &store, &order).await.unwrap();
        assert!(!second.profit_target_filled);

        let saved = store.get_position(position.id).await.unwrap();
        assert_eq!(saved.lifecycle_state, LifecycleState::Closed);
    }
}
