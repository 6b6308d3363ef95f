//! Position Sync (C8).
//!
//! Two-tier reconciliation against the broker's live position list: Tier A
//! refreshes app-managed positions from their cached opening order and
//! filled profit targets; Tier B upserts unmanaged positions grouped by
//! underlying. A pending-order sweep and a broker-absent safety net run
//! alongside both tiers.

use std::collections::{HashMap, HashSet};

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::broker::{self, BrokerPosition, BrokerSession, OrderStatus};
use crate::models::{ClosureReason, LifecycleState, Position, PositionLeg};
use crate::money::{self, QuantityDirection};
use crate::report::PhaseReport;
use crate::store::{PositionFilter, Store};

pub async fn sync_positions(
    broker: &dyn BrokerSession,
    store: &Store,
    user: i64,
    account: &str,
    filter: &PositionFilter,
) -> PhaseReport {
    let started = std::time::Instant::now();
    let mut builder = PhaseReport::builder();

    let broker_positions = match broker::retry_once(|| broker.list_positions(account, true)).await {
        Ok(p) => p,
        Err(e) => {
            builder.error(format!("account:{account}"), e);
            return builder.finish(started, serde_json::Value::Null);
        }
    };
    let broker_by_symbol: HashMap<String, &BrokerPosition> =
        broker_positions.iter().map(|p| (p.symbol.clone(), p)).collect();
    let broker_underlyings: HashSet<&str> =
        broker_positions.iter().map(|p| p.underlying_symbol.as_str()).collect();

    sync_tier_a(store, &broker_by_symbol, filter, &mut builder).await;
    sync_tier_b(store, user, account, &broker_positions, &mut builder).await;
    reconcile_pending_orders(broker, store, account, filter, &mut builder).await;
    close_broker_absent(store, &broker_underlyings, filter, &mut builder).await;

    info!(account, processed = builder.processed, "position sync complete");
    builder.finish(started, serde_json::Value::Null)
}

async fn sync_tier_a(
    store: &Store,
    broker_by_symbol: &HashMap<String, &BrokerPosition>,
    filter: &PositionFilter,
    builder: &mut crate::report::PhaseReportBuilder,
) {
    let positions = match store.load_open_positions(filter, true).await {
        Ok(p) => p,
        Err(e) => {
            builder.error("tier_a", e);
            return;
        }
    };

    let opening_ids: Vec<String> = positions.iter().filter_map(|p| p.opening_order_id.clone()).collect();
    let opening_orders = match store.load_order_history_batch(&opening_ids).await {
        Ok(m) => m,
        Err(e) => {
            builder.error("tier_a", e);
            return;
        }
    };

    let pt_ids: Vec<String> = positions
        .iter()
        .flat_map(|p| p.profit_target_details.values().filter_map(|d| d.order_id.clone()))
        .collect();
    let pt_orders = match store.load_order_history_batch(&pt_ids).await {
        Ok(m) => m,
        Err(e) => {
            builder.error("tier_a", e);
            return;
        }
    };
    let filled_pt_quantity_by_symbol = filled_pt_leg_quantities(&positions, &pt_orders);

    for position in positions {
        builder.processed(1);
        let opening_order = position
            .opening_order_id
            .as_ref()
            .and_then(|id| opening_orders.get(id));

        match reconstruct_position(&position, opening_order, broker_by_symbol, &filled_pt_quantity_by_symbol) {
            Ok(updated) => {
                if let Err(e) = store.save_position(&updated).await {
                    builder.error(format!("position:{}", position.id), e);
                } else {
                    builder.updated(1);
                }
            }
            Err(e) => {
                builder.error(format!("position:{}", position.id), e.clone());
                let mut flagged = position.clone();
                flagged.metadata.reconstruction_failed = true;
                flagged.metadata.reconstruction_error = Some(e);
                let _ = store.save_position(&flagged).await;
            }
        }
    }
}

/// Remaining open quantity per leg symbol after subtracting filled
/// profit-target fills, keyed by `(position_id, symbol)` (spec §4.8 Tier A
/// step 4).
fn filled_pt_leg_quantities(
    positions: &[Position],
    pt_orders: &HashMap<String, crate::models::OrderHistory>,
) -> HashMap<(i64, String), i64> {
    let mut out = HashMap::new();
    for position in positions {
        for detail in position.profit_target_details.values() {
            if detail.status() != crate::models::ProfitTargetStatus::Filled {
                continue;
            }
            let Some(order_id) = &detail.order_id else { continue };
            let Some(order) = pt_orders.get(order_id) else { continue };
            if let Ok(placed) = serde_json::from_value::<crate::broker::PlacedOrder>(order.order_data.clone()) {
                for leg in &placed.legs {
                    *out.entry((position.id, leg.symbol.clone())).or_insert(0) += leg.quantity.abs();
                }
            }
        }
    }
    out
}

fn reconstruct_position(
    position: &Position,
    opening_order: Option<&crate::models::OrderHistory>,
    broker_by_symbol: &HashMap<String, &BrokerPosition>,
    filled_pt_quantities: &HashMap<(i64, String), i64>,
) -> Result<Position, String> {
    let mut updated = position.clone();

    let Some(opening_order) = opening_order else {
        // No cached opening order yet (ingestion hasn't caught up); leave as-is.
        return Ok(updated);
    };

    let placed: crate::broker::PlacedOrder = serde_json::from_value(opening_order.order_data.clone())
        .map_err(|e| format!("opening order_data malformed: {e}"))?;

    let mut legs = Vec::new();
    let mut unrealized_total = Decimal::ZERO;

    for decl_leg in &placed.legs {
        let filled_qty = filled_pt_quantities
            .get(&(position.id, decl_leg.symbol.clone()))
            .copied()
            .unwrap_or(0);
        let remaining = decl_leg.quantity.abs() - filled_qty;
        if remaining <= 0 {
            continue;
        }

        let broker_leg = broker_by_symbol.get(&decl_leg.symbol);
        let direction = match decl_leg.action {
            crate::broker::LegAction::SellToOpen => QuantityDirection::Short,
            crate::broker::LegAction::BuyToOpen => QuantityDirection::Long,
            _ => QuantityDirection::Short,
        };

        let (average_open_price, close_price, mark_price, multiplier) = match broker_leg {
            Some(bp) => (bp.average_open_price, bp.close_price, bp.mark_price, bp.multiplier),
            None => (
                crate::broker::calculate_fill_price(&placed).unwrap_or_default(),
                None,
                None,
                money::DEFAULT_MULTIPLIER,
            ),
        };

        let current_price = mark_price.or(close_price).unwrap_or(average_open_price);
        unrealized_total += money::leg_unrealized_pnl(
            average_open_price,
            current_price,
            Decimal::from(remaining),
            direction,
            multiplier,
        );

        legs.push(PositionLeg {
            symbol: decl_leg.symbol.clone(),
            quantity: remaining,
            quantity_direction: direction,
            average_open_price,
            close_price,
            mark_price,
            multiplier,
            instrument_type: decl_leg.instrument_type,
            action: Some(decl_leg.action.as_broker_str().to_string()),
        });
    }

    updated.metadata.legs = legs;
    updated.unrealized_pnl = money::quantize_persist(unrealized_total);

    if let Some(fill_price) = crate::broker::calculate_fill_price(&placed) {
        updated.avg_price = money::quantize_persist(fill_price);
    }

    let expected = crate::execution::expected_spread_types(position.strategy_type.as_deref().unwrap_or(""));
    for (spread_type, _) in expected {
        let detail = updated.profit_target_details.entry(spread_type.to_string()).or_default();
        if detail.original_credit.is_none() {
            detail.original_credit = Some(updated.avg_price);
        }
    }

    Ok(updated)
}

async fn sync_tier_b(
    store: &Store,
    user: i64,
    account: &str,
    broker_positions: &[BrokerPosition],
    builder: &mut crate::report::PhaseReportBuilder,
) {
    let app_managed_symbols = match store
        .app_managed_open_symbols(&PositionFilter { user_id: Some(user), ..Default::default() })
        .await
    {
        Ok(s) => s.into_iter().collect::<HashSet<_>>(),
        Err(e) => {
            builder.error("tier_b", e);
            return;
        }
    };

    let mut by_underlying: HashMap<String, Vec<&BrokerPosition>> = HashMap::new();
    for p in broker_positions {
        if !app_managed_symbols.contains(&p.underlying_symbol) {
            by_underlying.entry(p.underlying_symbol.clone()).or_default().push(p);
        }
    }

    for (underlying, legs) in by_underlying {
        builder.processed(1);
        let spread_count = legs.iter().map(|l| l.quantity.unsigned_abs()).min().unwrap_or(1).max(1);
        let total_notional: Decimal = legs.iter().map(|l| l.average_open_price * Decimal::from(l.quantity.abs())).sum();
        let total_qty: Decimal = legs.iter().map(|l| Decimal::from(l.quantity.abs())).sum();
        let avg_price = if total_qty.is_zero() { Decimal::ZERO } else { total_notional / total_qty };

        let existing = match store
            .load_open_positions(
                &PositionFilter { user_id: Some(user), symbol: Some(underlying.clone()), ..Default::default() },
                false,
            )
            .await
        {
            Ok(v) => v.into_iter().find(|p| !p.is_app_managed),
            Err(e) => {
                builder.error(format!("underlying:{underlying}"), e);
                continue;
            }
        };

        let position_legs: Vec<PositionLeg> = legs
            .iter()
            .map(|l| PositionLeg {
                symbol: l.symbol.clone(),
                quantity: l.quantity,
                quantity_direction: l.quantity_direction,
                average_open_price: l.average_open_price,
                close_price: l.close_price,
                mark_price: l.mark_price,
                multiplier: l.multiplier,
                instrument_type: l.instrument_type,
                action: None,
            })
            .collect();

        match existing {
            Some(mut position) => {
                position.metadata.legs = position_legs;
                position.avg_price = money::quantize_persist(avg_price);
                position.number_of_spreads = Some(spread_count as i64);
                if let Err(e) = store.save_position(&position).await {
                    builder.error(format!("underlying:{underlying}"), e);
                } else {
                    builder.updated(1);
                }
            }
            None => {
                let position = Position {
                    id: 0,
                    user,
                    trading_account: account.to_string(),
                    symbol: underlying.clone(),
                    instrument_type: legs[0].instrument_type,
                    strategy_type: None,
                    lifecycle_state: LifecycleState::OpenFull,
                    quantity: spread_count as i64,
                    avg_price: money::quantize_persist(avg_price),
                    unrealized_pnl: Decimal::ZERO,
                    total_realized_pnl: Decimal::ZERO,
                    opening_price_effect: crate::money::PriceEffect::Credit,
                    initial_risk: None,
                    spread_width: None,
                    number_of_spreads: Some(spread_count as i64),
                    is_app_managed: false,
                    opening_order_id: None,
                    opening_complex_order_id: None,
                    closure_reason: None,
                    assigned_at: None,
                    profit_targets_created: false,
                    profit_target_details: HashMap::new(),
                    metadata: crate::models::PositionMetadata { legs: position_legs, ..Default::default() },
                    opened_at: chrono::Utc::now(),
                    closed_at: None,
                };
                if let Err(e) = store.insert_position(position).await {
                    builder.error(format!("underlying:{underlying}"), e);
                } else {
                    builder.created(1);
                }
            }
        }
    }
}

async fn reconcile_pending_orders(
    broker: &dyn BrokerSession,
    store: &Store,
    account: &str,
    filter: &PositionFilter,
    builder: &mut crate::report::PhaseReportBuilder,
) {
    let pending = match store.load_open_positions(filter, false).await {
        Ok(v) => v.into_iter().filter(|p| p.lifecycle_state == LifecycleState::PendingEntry).collect::<Vec<_>>(),
        Err(e) => {
            builder.error("pending_orders", e);
            return;
        }
    };
    if pending.is_empty() {
        return;
    }

    let live_orders = match broker::retry_once(|| broker.get_live_orders(account)).await {
        Ok(o) => o,
        Err(e) => {
            builder.error("pending_orders", e);
            return;
        }
    };
    let live_by_id: HashMap<&str, &crate::broker::PlacedOrder> =
        live_orders.iter().map(|o| (o.id.as_str(), o)).collect();

    for mut position in pending {
        let Some(order_id) = position.opening_order_id.clone() else { continue };
        builder.processed(1);

        if let Some(order) = live_by_id.get(order_id.as_str()) {
            if order.status.is_terminal() && order.status != OrderStatus::Filled {
                close_with_reason(&mut position, closure_reason_for_status(order.status));
                if let Err(e) = store.save_position(&position).await {
                    builder.error(format!("position:{}", position.id), e);
                } else {
                    builder.updated(1);
                }
            }
            continue;
        }

        match broker::retry_once(|| broker.get_order(account, &order_id)).await {
            Ok(Some(order)) if order.status == OrderStatus::Filled => {
                position.lifecycle_state = LifecycleState::OpenFull;
                if let Err(e) = store.save_position(&position).await {
                    builder.error(format!("position:{}", position.id), e);
                } else {
                    builder.updated(1);
                }
            }
            Ok(Some(order)) if order.status.is_terminal() => {
                close_with_reason(&mut position, closure_reason_for_status(order.status));
                if let Err(e) = store.save_position(&position).await {
                    builder.error(format!("position:{}", position.id), e);
                } else {
                    builder.updated(1);
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(position = position.id, error = %e, "failed to fetch opening order during pending reconciliation");
            }
        }
    }
}

fn closure_reason_for_status(status: OrderStatus) -> ClosureReason {
    match status {
        OrderStatus::Cancelled => ClosureReason::OrderCancelled,
        OrderStatus::Rejected => ClosureReason::OrderRejected,
        OrderStatus::Expired => ClosureReason::OrderExpired,
        _ => ClosureReason::Unknown,
    }
}

fn close_with_reason(position: &mut Position, reason: ClosureReason) {
    position.lifecycle_state = LifecycleState::Closed;
    position.closure_reason = Some(reason);
    position.closed_at = Some(chrono::Utc::now());
    position.quantity = 0;
    position.unrealized_pnl = Decimal::ZERO;
}

async fn close_broker_absent(
    store: &Store,
    broker_underlyings: &HashSet<&str>,
    filter: &PositionFilter,
    builder: &mut crate::report::PhaseReportBuilder,
) {
    let positions = match store.load_open_positions(filter, false).await {
        Ok(v) => v.into_iter().filter(|p| p.lifecycle_state != LifecycleState::PendingEntry).collect::<Vec<_>>(),
        Err(e) => {
            builder.error("broker_absent", e);
            return;
        }
    };

    for mut position in positions {
        if broker_underlyings.contains(position.symbol.as_str()) {
            continue;
        }
        builder.processed(1);
        close_with_reason(&mut position, ClosureReason::ClosedAtBroker);
        if let Err(e) = store.save_position(&position).await {
            builder.error(format!("position:{}", position.id), e);
        } else {
            builder.updated(1);
        }
    }
}
