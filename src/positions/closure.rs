//! Closure Engine (C9).
//!
//! A Position closes when none of its declared legs still appear in the
//! broker's live OCC-symbol set. Closure then classifies why, computes
//! realised P&L from the Position's linked transactions, and — for
//! assignments — spins off an equity Position for the shares that changed
//! hands.

use std::collections::HashSet;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::broker::{self, BrokerSession};
use crate::models::{ClosureReason, LifecycleState, Position, Transaction};
use crate::money::{self, PnlTransaction};
use crate::occ::{OccSymbol, OptionType};
use crate::report::PhaseReport;
use crate::store::{PositionFilter, Store};

pub async fn process_closures(
    broker: &dyn BrokerSession,
    store: &Store,
    account: &str,
    filter: &PositionFilter,
) -> PhaseReport {
    let started = std::time::Instant::now();
    let mut builder = PhaseReport::builder();

    let broker_positions = match broker::retry_once(|| broker.list_positions(account, false)).await {
        Ok(p) => p,
        Err(e) => {
            builder.error(format!("account:{account}"), e);
            return builder.finish(started, serde_json::Value::Null);
        }
    };
    let broker_symbols: HashSet<&str> = broker_positions.iter().map(|p| p.symbol.as_str()).collect();

    let positions = match store.load_open_positions(filter, false).await {
        Ok(p) => p
            .into_iter()
            .filter(|p| {
                matches!(
                    p.lifecycle_state,
                    LifecycleState::OpenFull | LifecycleState::OpenPartial | LifecycleState::Closing
                )
            })
            .collect::<Vec<_>>(),
        Err(e) => {
            builder.error("process_closures", e);
            return builder.finish(started, serde_json::Value::Null);
        }
    };

    for position in positions {
        builder.processed(1);

        let still_open = position
            .declared_leg_symbols()
            .iter()
            .any(|symbol| broker_symbols.contains(*symbol));
        if still_open {
            continue;
        }

        match close_position(store, &position).await {
            Ok(created_equity) => {
                builder.updated(1);
                if created_equity {
                    builder.created(1);
                }
            }
            Err(e) => builder.error(format!("position:{}", position.id), e),
        }
    }

    builder.finish(started, serde_json::Value::Null)
}

async fn close_position(store: &Store, position: &Position) -> crate::error::EngineResult<bool> {
    let transactions = store.transactions_for_position(position.id).await?;

    let assignments: Vec<&Transaction> = transactions.iter().filter(|t| t.is_assignment()).collect();
    let exercises: Vec<&Transaction> = transactions.iter().filter(|t| t.is_exercise()).collect();
    let openings: Vec<&Transaction> = transactions.iter().filter(|t| t.is_opening()).collect();
    let closings: Vec<&Transaction> = transactions
        .iter()
        .filter(|t| t.is_closing() || t.is_assignment() || t.is_exercise())
        .collect();

    let closure_reason = if !assignments.is_empty() {
        ClosureReason::Assignment
    } else if !exercises.is_empty() {
        ClosureReason::Exercise
    } else if closings.iter().any(|t| {
        t.order_id
            .as_ref()
            .map(|oid| position.profit_target_details.values().any(|d| d.order_id.as_deref() == Some(oid)))
            .unwrap_or(false)
    }) {
        ClosureReason::ProfitTarget
    } else if !closings.is_empty() {
        ClosureReason::ManualClose
    } else if position
        .metadata
        .expiration_date
        .map(|d| d <= Utc::now().date_naive())
        .unwrap_or(false)
    {
        ClosureReason::ExpiredWorthless
    } else {
        ClosureReason::Unknown
    };

    let to_pnl = |t: &&Transaction| PnlTransaction {
        action: t.action.map(|a| a.as_broker_str().to_string()).unwrap_or_default(),
        net_value: t.net_value,
    };
    let opening_pnl: Vec<PnlTransaction> = openings.iter().map(to_pnl).collect();
    let closing_pnl: Vec<PnlTransaction> = closings.iter().map(to_pnl).collect();
    let realized_pnl = money::realized_position_pnl(&opening_pnl, &closing_pnl);

    let mut updated = position.clone();
    updated.lifecycle_state = LifecycleState::Closed;
    updated.closed_at = Some(Utc::now());
    updated.closure_reason = Some(closure_reason);
    updated.total_realized_pnl = realized_pnl;
    updated.quantity = 0;
    updated.unrealized_pnl = Decimal::ZERO;

    let mut created_equity = false;
    if closure_reason == ClosureReason::Assignment {
        updated.assigned_at = Some(Utc::now());
        if let Some(shares) = net_assigned_shares(&assignments) {
            if !shares.is_zero() {
                let total_cost: Decimal = assignments.iter().map(|t| t.net_value.abs()).sum();
                let avg_price = if shares.is_zero() { dec!(0) } else { total_cost / shares.abs() };
                let equity = Position {
                    id: 0,
                    user: position.user,
                    trading_account: position.trading_account.clone(),
                    symbol: position.symbol.clone(),
                    instrument_type: crate::broker::InstrumentType::Equity,
                    strategy_type: Some("stock_holding".to_string()),
                    lifecycle_state: LifecycleState::OpenFull,
                    quantity: shares.round().to_string().parse::<i64>().unwrap_or(0),
                    avg_price: money::quantize_persist(avg_price),
                    unrealized_pnl: Decimal::ZERO,
                    total_realized_pnl: Decimal::ZERO,
                    opening_price_effect: crate::money::PriceEffect::Debit,
                    initial_risk: None,
                    spread_width: None,
                    number_of_spreads: None,
                    is_app_managed: false,
                    opening_order_id: None,
                    opening_complex_order_id: None,
                    closure_reason: None,
                    assigned_at: Some(Utc::now()),
                    profit_targets_created: false,
                    profit_target_details: Default::default(),
                    metadata: Default::default(),
                    opened_at: Utc::now(),
                    closed_at: None,
                };
                let equity = store.insert_position(equity).await?;
                updated.metadata.assigned_equity_position_id = Some(equity.id);
                created_equity = true;
            }
        }
    }

    store.save_position(&updated).await?;
    Ok(created_equity)
}

/// `+100 × |qty|` per put assignment, `−100 × |qty|` per call assignment
/// (spec §4.9 step 4). Returns `None` if a transaction's symbol can't be
/// parsed as an OCC option (shouldn't happen for assignment transactions).
fn net_assigned_shares(assignments: &[&Transaction]) -> Option<Decimal> {
    let mut total = Decimal::ZERO;
    for txn in assignments {
        let symbol = txn.symbol.as_ref()?;
        let occ = OccSymbol::parse(symbol).ok()?;
        let qty = txn.quantity.unwrap_or(dec!(1)).abs();
        let shares = qty * dec!(100);
        total += match occ.option_type {
            OptionType::Put => shares,
            OptionType::Call => -shares,
        };
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::tests_support::StubBroker;
    use crate::broker::{InstrumentType, LegAction};
    use crate::models::{PositionLeg, PositionMetadata};
    use crate::money::{PriceEffect, QuantityDirection};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn assignment_txn(symbol: &str, net_value: Decimal, position: i64) -> Transaction {
        Transaction {
            transaction_id: format!("A-{symbol}"),
            user: 1,
            trading_account: "ACC1".into(),
            order_id: None,
            transaction_type: "Assignment".into(),
            transaction_sub_type: Some("Assignment".into()),
            action: None,
            value: net_value,
            net_value,
            commission: dec!(0),
            clearing_fees: dec!(0),
            regulatory_fees: dec!(0),
            symbol: Some(symbol.to_string()),
            underlying_symbol: Some("SYM".to_string()),
            instrument_type: InstrumentType::EquityOption,
            quantity: Some(dec!(2)),
            price: None,
            executed_at: Utc::now(),
            related_position: Some(position),
            raw_data: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn assignment_creates_equity_position() {
        let store = Store::open_in_memory().unwrap();
        let position = Position {
            id: 0,
            user: 1,
            trading_account: "ACC1".into(),
            symbol: "SYM".into(),
            instrument_type: InstrumentType::EquityOption,
            strategy_type: Some("short_put_vertical".into()),
            lifecycle_state: LifecycleState::OpenFull,
            quantity: 2,
            avg_price: dec!(1.70),
            unrealized_pnl: dec!(0),
            total_realized_pnl: dec!(0),
            opening_price_effect: PriceEffect::Credit,
            initial_risk: None,
            spread_width: None,
            number_of_spreads: Some(2),
            is_app_managed: true,
            opening_order_id: Some("ORD1".into()),
            opening_complex_order_id: None,
            closure_reason: None,
            assigned_at: None,
            profit_targets_created: false,
            profit_target_details: HashMap::new(),
            metadata: PositionMetadata {
                legs: vec![PositionLeg {
                    symbol: "SYM   250117P00450000".into(),
                    quantity: -2,
                    quantity_direction: QuantityDirection::Short,
                    average_open_price: dec!(1.70),
                    close_price: None,
                    mark_price: None,
                    multiplier: money::DEFAULT_MULTIPLIER,
                    instrument_type: InstrumentType::EquityOption,
                    action: Some(LegAction::SellToOpen.as_broker_str().to_string()),
                }],
                ..Default::default()
            },
            opened_at: Utc::now(),
            closed_at: None,
        };
        let position = store.insert_position(position).await.unwrap();
        store
            .upsert_transaction(&assignment_txn("SYM   250117P00450000", dec!(-90000.00), position.id))
            .await
            .unwrap();

        let broker = StubBroker::new();
        broker.set_positions(vec![]);

        let report = process_closures(&broker, &store, "ACC1", &PositionFilter::default()).await;
        assert_eq!(report.items_updated, 1);
        assert_eq!(report.items_created, 1);

        let closed = store.get_position(position.id).await.unwrap();
        assert_eq!(closed.lifecycle_state, LifecycleState::Closed);
        assert_eq!(closed.closure_reason, Some(ClosureReason::Assignment));
        let equity_id = closed.metadata.assigned_equity_position_id.expect("equity position linked");

        let equity = store.get_position(equity_id).await.unwrap();
        assert_eq!(equity.strategy_type.as_deref(), Some("stock_holding"));
        assert_eq!(equity.quantity, 200);
        assert_eq!(equity.avg_price, dec!(450.00));
    }

    #[tokio::test]
    async fn expired_worthless_keeps_full_credit() {
        let store = Store::open_in_memory().unwrap();
        let position = Position {
            id: 0,
            user: 1,
            trading_account: "ACC1".into(),
            symbol: "SYM".into(),
            instrument_type: InstrumentType::EquityOption,
            strategy_type: Some("short_put_vertical".into()),
            lifecycle_state: LifecycleState::OpenFull,
            quantity: 1,
            avg_price: dec!(1.70),
            unrealized_pnl: dec!(0),
            total_realized_pnl: dec!(0),
            opening_price_effect: PriceEffect::Credit,
            initial_risk: None,
            spread_width: None,
            number_of_spreads: Some(1),
            is_app_managed: true,
            opening_order_id: Some("ORD2".into()),
            opening_complex_order_id: None,
            closure_reason: None,
            assigned_at: None,
            profit_targets_created: false,
            profit_target_details: HashMap::new(),
            metadata: PositionMetadata {
                legs: vec![PositionLeg {
                    symbol: "SYM   250117P00450000".into(),
                    quantity: -1,
                    quantity_direction: QuantityDirection::Short,
                    average_open_price: dec!(1.70),
                    close_price: None,
                    mark_price: None,
                    multiplier: money::DEFAULT_MULTIPLIER,
                    instrument_type: InstrumentType::EquityOption,
                    action: None,
                }],
                expiration_date: Some(chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()),
                ..Default::default()
            },
            opened_at: Utc::now(),
            closed_at: None,
        };
        let position = store.insert_position(position).await.unwrap();
        store
            .upsert_transaction(&Transaction {
                transaction_id: "T-open".into(),
                user: 1,
                trading_account: "ACC1".into(),
                order_id: Some("ORD2".into()),
                transaction_type: "Trade".into(),
                transaction_sub_type: None,
                action: Some(LegAction::SellToOpen),
                value: dec!(170.00),
                net_value: dec!(170.00),
                commission: dec!(0),
                clearing_fees: dec!(0),
                regulatory_fees: dec!(0),
                symbol: Some("SYM   250117P00450000".into()),
                underlying_symbol: Some("SYM".into()),
                instrument_type: InstrumentType::EquityOption,
                quantity: Some(dec!(1)),
                price: Some(dec!(1.70)),
                executed_at: Utc::now(),
                related_position: Some(position.id),
                raw_data: serde_json::Value::Null,
            })
            .await
            .unwrap();

        let broker = StubBroker::new();
        broker.set_positions(vec![]);

        let report = process_closures(&broker, &store, "ACC1", &PositionFilter::default()).await;
        assert_eq!(report.items_updated, 1);

        let closed = store.get_position(position.id).await.unwrap();
        assert_eq!(closed.closure_reason, Some(ClosureReason::ExpiredWorthless));
        assert_eq!(closed.total_realized_pnl, dec!(170.00));
    }
}
