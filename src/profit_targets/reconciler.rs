//! The per-position algorithm of C10. Runs inside a lock that reloads the
//! Position at entry and aborts if it's no longer open; recreation calls to
//! the execution collaborator happen outside any lock (spec §4.10).

use chrono::Duration;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::broker::{self, BrokerSession, LegAction, OrderLegSpec, OrderStatus};
use crate::config::Config;
use crate::execution::{expected_spread_types, OrderExecutor, ProfitTargetSpec};
use crate::models::{OrderHistory, Position, ProfitTargetStatus};
use crate::money::{self, PriceEffect};
use crate::occ::OccSymbol;
use crate::report::PhaseReport;
use crate::store::{PositionFilter, Store};

/// Applies a detected fill on one spread's exit order to its Position
/// (spec §4.10 step 6 / §4.11 step 4). Idempotent: a spread already marked
/// `filled` is left untouched and returns `Ok(false)`. Shared by C8's
/// post-sync reconciliation, C10 step 3's inline processing, and C11's
/// profit-target fill path.
pub async fn apply_filled_target(
    store: &Store,
    position_id: i64,
    spread_type: &str,
    order: &OrderHistory,
) -> crate::error::EngineResult<bool> {
    let spread_type = spread_type.to_string();
    let fill_price = fill_price_of(order);

    store
        .with_position_locked(position_id, false, move |position| {
            let detail = position
                .profit_target_details
                .entry(spread_type.clone())
                .or_default();

            if detail.status() == ProfitTargetStatus::Filled {
                return Ok(false);
            }

            let original_credit = detail.original_credit.unwrap_or_default();
            let fill_price = fill_price.unwrap_or_default();
            let realized_pnl =
                money::profit_target_realized_pnl(original_credit, fill_price, money::DEFAULT_MULTIPLIER);

            detail.status = Some(ProfitTargetStatus::Filled);
            detail.filled_at = Some(order.filled_at.unwrap_or_else(chrono::Utc::now));
            detail.fill_price = Some(fill_price);
            detail.realized_pnl = Some(realized_pnl);

            if position.metadata.original_quantity.is_none() {
                position.metadata.original_quantity = Some(position.quantity);
            }
            let original_quantity = position.metadata.original_quantity.unwrap_or(position.quantity);

            position.quantity = (position.quantity - 1).max(0);
            position.total_realized_pnl += realized_pnl;

            if position.quantity == 0 {
                position.lifecycle_state = crate::models::LifecycleState::Closed;
                position.closed_at = Some(chrono::Utc::now());
                position.unrealized_pnl = Decimal::ZERO;
            } else if position.quantity < original_quantity {
                position.lifecycle_state = crate::models::LifecycleState::OpenPartial;
            }

            Ok(true)
        })
        .await
}

fn fill_price_of(order: &OrderHistory) -> Option<Decimal> {
    if let Some(price) = order.price {
        return Some(price);
    }
    serde_json::from_value::<crate::broker::PlacedOrder>(order.order_data.clone())
        .ok()
        .and_then(|o| crate::broker::calculate_fill_price(&o))
}

pub async fn fix_profit_targets(
    broker: &dyn BrokerSession,
    executor: &dyn OrderExecutor,
    store: &Store,
    config: &Config,
    filter: &PositionFilter,
) -> PhaseReport {
    let started = std::time::Instant::now();
    let mut builder = PhaseReport::builder();

    let positions = match store.load_open_positions(filter, true).await {
        Ok(p) => p,
        Err(e) => {
            builder.error("fix_profit_targets", e);
            return builder.finish(started, serde_json::Value::Null);
        }
    };

    for position in positions {
        builder.processed(1);
        match reconcile_position(broker, executor, store, config, &position).await {
            Ok(outcome) => {
                builder.updated(outcome.updated);
                builder.created(outcome.created);
                for err in outcome.errors {
                    builder.error(format!("position:{}", position.id), err);
                }
            }
            Err(e) => {
                builder.error(format!("position:{}", position.id), e);
            }
        }
    }

    builder.finish(started, serde_json::Value::Null)
}

#[derive(Default)]
struct ReconcileOutcome {
    updated: u64,
    created: u64,
    errors: Vec<String>,
}

async fn reconcile_position(
    broker: &dyn BrokerSession,
    executor: &dyn OrderExecutor,
    store: &Store,
    config: &Config,
    position: &Position,
) -> crate::error::EngineResult<ReconcileOutcome> {
    let mut outcome = ReconcileOutcome::default();

    if position.metadata.dte_automation.as_ref().and_then(|d| d.last_processed_dte).is_some() {
        return Ok(outcome);
    }

    let strategy = position.strategy_type.as_deref().unwrap_or("");
    let expected = expected_spread_types(strategy);
    if expected.is_empty() {
        return Ok(outcome);
    }

    let open_set = open_spread_types(position, &expected);
    let mut needs_creation: Vec<(&'static str, Decimal)> = Vec::new();

    for (spread_type, target_pct) in &expected {
        if !open_set.contains(spread_type) {
            continue;
        }

        let detail = position.profit_target_details.get(*spread_type).cloned().unwrap_or_default();

        if detail.skip_recreation {
            continue;
        }

        if detail.order_id.is_none() {
            if position.profit_targets_created {
                error!(
                    position = position.id,
                    spread_type,
                    "profit_targets_created is set but order_id missing; needs operator review"
                );
                continue;
            }
            needs_creation.push((spread_type, *target_pct));
            continue;
        }

        let order_id = detail.order_id.clone().unwrap();
        match broker::retry_once(|| broker.get_order(&position.trading_account, &order_id)).await {
            Ok(Some(order)) if order.status.is_live_like() => continue,
            Ok(Some(order)) if order.status == OrderStatus::Filled => {
                let order_history = OrderHistory {
                    broker_order_id: order.id.clone(),
                    user: position.user,
                    trading_account: position.trading_account.clone(),
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
                    order_data: serde_json::to_value(&order)?,
                };
                match apply_filled_target(store, position.id, spread_type, &order_history).await {
                    Ok(true) => outcome.updated += 1,
                    Ok(false) => {}
                    Err(e) => outcome.errors.push(e.to_string()),
                }
            }
            Ok(_) => needs_creation.push((spread_type, *target_pct)),
            Err(e) => {
                warn!(position = position.id, spread_type, error = %e, "order fetch failed; will recreate");
                needs_creation.push((spread_type, *target_pct));
            }
        }
    }

    if config.cancel_orphaned_orders {
        let (cancelled, errors) = cancel_unattributable_orders(broker, executor, store, position, &expected).await;
        outcome.updated += cancelled;
        outcome.errors.extend(errors);
    }

    if needs_creation.is_empty() {
        return Ok(outcome);
    }

    let mut still_missing = Vec::new();
    for (spread_type, target_pct) in needs_creation {
        match find_orphaned_order(broker, store, position, spread_type).await {
            Ok(Some(order_id)) => {
                store
                    .with_position_locked(position.id, false, {
                        let spread_type = spread_type.to_string();
                        move |p| {
                            let detail = p.profit_target_details.entry(spread_type).or_default();
                            detail.order_id = Some(order_id);
                            detail.status = Some(ProfitTargetStatus::Pending);
                            Ok(())
                        }
                    })
                    .await?;
                outcome.updated += 1;
            }
            Ok(None) => still_missing.push((spread_type, target_pct)),
            Err(e) => {
                outcome.errors.push(e.to_string());
                still_missing.push((spread_type, target_pct));
            }
        }
    }

    if still_missing.is_empty() || !config.replace_cancelled_targets {
        return Ok(outcome);
    }

    for (spread_type, target_pct) in still_missing {
        match recreate_exit_order(executor, position, spread_type, target_pct).await {
            Ok(order_id) => {
                store
                    .with_position_locked(position.id, false, {
                        let spread_type = spread_type.to_string();
                        move |p| {
                            let detail = p.profit_target_details.entry(spread_type).or_default();
                            detail.order_id = Some(order_id);
                            detail.status = Some(ProfitTargetStatus::Pending);
                            detail.percent = target_pct;
                            detail.submitted_at = Some(chrono::Utc::now());
                            p.profit_targets_created = true;
                            Ok(())
                        }
                    })
                    .await?;
                outcome.created += 1;
            }
            Err(e) => outcome.errors.push(e.to_string()),
        }
    }

    Ok(outcome)
}

fn open_spread_types(position: &Position, expected: &[(&'static str, Decimal)]) -> Vec<&'static str> {
    if !position.metadata.spread_legs.is_empty() {
        let declared = position.declared_leg_symbols();
        return expected
            .iter()
            .filter(|(name, _)| {
                position
                    .metadata
                    .spread_legs
                    .get(*name)
                    .map(|legs| legs.iter().any(|s| declared.contains(&s.as_str())))
                    .unwrap_or(false)
            })
            .map(|(name, _)| *name)
            .collect();
    }

    let mut short_calls = 0u32;
    let mut long_calls = 0u32;
    let mut short_puts = 0u32;
    let mut long_puts = 0u32;
    for leg in &position.metadata.legs {
        if let Ok(occ) = OccSymbol::parse(&leg.symbol) {
            match (occ.option_type, leg.quantity_direction) {
                (crate::occ::OptionType::Call, crate::money::QuantityDirection::Short) => short_calls += 1,
                (crate::occ::OptionType::Call, crate::money::QuantityDirection::Long) => long_calls += 1,
                (crate::occ::OptionType::Put, crate::money::QuantityDirection::Short) => short_puts += 1,
                (crate::occ::OptionType::Put, crate::money::QuantityDirection::Long) => long_puts += 1,
            }
        }
    }
    let call_pairs = short_calls.min(long_calls);
    let put_pairs = short_puts.min(long_puts);
    let has_any_legs = !position.metadata.legs.is_empty();

    expected
        .iter()
        .filter(|(name, _)| match *name {
            "call_spread" => call_pairs >= 1,
            "put_spread_1" => put_pairs >= 1,
            "put_spread_2" => put_pairs >= 2,
            "put_spread" => put_pairs >= 1,
            "spread" => call_pairs >= 1 || put_pairs >= 1,
            "single_leg" => has_any_legs,
            _ => has_any_legs,
        })
        .map(|(name, _)| *name)
        .collect()
}

async fn find_orphaned_order(
    broker: &dyn BrokerSession,
    store: &Store,
    position: &Position,
    spread_type: &str,
) -> crate::error::EngineResult<Option<String>> {
    let expected_legs = match position.metadata.spread_legs.get(spread_type) {
        Some(legs) => legs.clone(),
        None => return Ok(None),
    };

    let candidates = store
        .list_orders_for_underlying(&position.symbol, Some("Live"))
        .await?;

    let window_start = position.opened_at - Duration::minutes(5);
    let window_end = position.opened_at + Duration::minutes(5);

    for candidate in candidates {
        if candidate.received_at < window_start || candidate.received_at > window_end {
            continue;
        }
        let Ok(placed) = serde_json::from_value::<crate::broker::PlacedOrder>(candidate.order_data.clone())
        else {
            continue;
        };
        let leg_symbols: Vec<&str> = placed.legs.iter().map(|l| l.symbol.as_str()).collect();
        let matches_leg_set =
            expected_legs.len() == leg_symbols.len() && expected_legs.iter().all(|s| leg_symbols.contains(&s.as_str()));
        if !matches_leg_set {
            continue;
        }
        if store.profit_target_order_is_claimed(&candidate.broker_order_id).await? {
            continue;
        }
        // Confirm it's still live at the broker, not merely last seen live.
        if let Ok(Some(order)) =
            broker::retry_once(|| broker.get_order(&position.trading_account, &candidate.broker_order_id)).await
        {
            if order.status.is_live_like() {
                info!(position = position.id, spread_type, order_id = %candidate.broker_order_id, "adopted orphaned live order");
                return Ok(Some(candidate.broker_order_id));
            }
        }
    }
    Ok(None)
}

/// `cancel_orphaned_orders` opt-in: broker-resident live orders near this
/// position's opening whose leg set matches none of its expected spreads
/// (and so would never be adopted by [`find_orphaned_order`]) are requests
/// this engine can't attribute to anything it manages. Cancels each one
/// found, collecting per-order failures instead of aborting the position.
async fn cancel_unattributable_orders(
    broker: &dyn BrokerSession,
    executor: &dyn OrderExecutor,
    store: &Store,
    position: &Position,
    expected: &[(&'static str, Decimal)],
) -> (u64, Vec<String>) {
    let known_leg_sets: Vec<&Vec<String>> = expected
        .iter()
        .filter_map(|(name, _)| position.metadata.spread_legs.get(*name))
        .collect();
    if known_leg_sets.is_empty() {
        return (0, Vec::new());
    }

    let candidates = match store.list_orders_for_underlying(&position.symbol, Some("Live")).await {
        Ok(c) => c,
        Err(e) => return (0, vec![e.to_string()]),
    };

    let window_start = position.opened_at - Duration::minutes(5);
    let window_end = position.opened_at + Duration::minutes(5);
    let mut cancelled = 0u64;
    let mut errors = Vec::new();

    for candidate in candidates {
        if candidate.received_at < window_start || candidate.received_at > window_end {
            continue;
        }
        let Ok(placed) = serde_json::from_value::<crate::broker::PlacedOrder>(candidate.order_data.clone())
        else {
            continue;
        };
        let leg_symbols: Vec<&str> = placed.legs.iter().map(|l| l.symbol.as_str()).collect();
        let matches_known = known_leg_sets
            .iter()
            .any(|legs| legs.len() == leg_symbols.len() && legs.iter().all(|s| leg_symbols.contains(&s.as_str())));
        if matches_known {
            continue;
        }
        match store.profit_target_order_is_claimed(&candidate.broker_order_id).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => {
                errors.push(e.to_string());
                continue;
            }
        }
        match broker::retry_once(|| broker.get_order(&position.trading_account, &candidate.broker_order_id)).await {
            Ok(Some(order)) if order.status.is_live_like() => {}
            _ => continue,
        }
        match executor.cancel_order(&position.trading_account, &candidate.broker_order_id).await {
            Ok(()) => {
                info!(position = position.id, order_id = %candidate.broker_order_id, "cancelled unattributable broker order");
                cancelled += 1;
            }
            Err(e) => errors.push(e.to_string()),
        }
    }
    (cancelled, errors)
}

/// Builds the exit-order spec for one spread_type from a Position's
/// recorded legs. Shared by C10's recreation path and C11 step 5's
/// creation-on-opening-fill path (spec §4.10 step 7 / §4.11 step 5).
pub(crate) fn build_exit_spec(
    position: &Position,
    spread_type: &str,
    target_pct: Decimal,
) -> crate::error::EngineResult<ProfitTargetSpec> {
    let leg_symbols = position
        .metadata
        .spread_legs
        .get(spread_type)
        .cloned()
        .unwrap_or_default();
    if leg_symbols.is_empty() {
        return Err(crate::error::EngineError::Validation(format!(
            "no spread_legs recorded for {spread_type} on position {}; cannot build exit order",
            position.id
        )));
    }

    let legs: Vec<OrderLegSpec> = leg_symbols
        .iter()
        .filter_map(|symbol| {
            let leg = position.metadata.legs.iter().find(|l| &l.symbol == symbol)?;
            let action = match leg.quantity_direction {
                crate::money::QuantityDirection::Short => LegAction::BuyToClose,
                crate::money::QuantityDirection::Long => LegAction::SellToClose,
            };
            Some(OrderLegSpec {
                symbol: symbol.clone(),
                instrument_type: leg.instrument_type,
                action,
                quantity: leg.quantity.unsigned_abs() as i64,
            })
        })
        .collect();

    let detail = position.profit_target_details.get(spread_type);
    let original_credit = detail.and_then(|d| d.original_credit).unwrap_or(position.avg_price);
    let closing_effect = match position.opening_price_effect {
        PriceEffect::Credit => PriceEffect::Debit,
        PriceEffect::Debit => PriceEffect::Credit,
    };
    let limit_price = detail
        .and_then(|d| d.target_price)
        .unwrap_or_else(|| money::profit_target_price(original_credit, target_pct, position.opening_price_effect));

    Ok(ProfitTargetSpec {
        spread_type: spread_type.to_string(),
        legs,
        limit_price,
        price_effect: closing_effect,
    })
}

async fn recreate_exit_order(
    executor: &dyn OrderExecutor,
    position: &Position,
    spread_type: &str,
    target_pct: Decimal,
) -> crate::error::EngineResult<String> {
    let spec = build_exit_spec(position, spread_type, target_pct)?;
    let placed = executor.place_exit_order(&position.trading_account, &spec).await?;
    Ok(placed.order_id)
}
