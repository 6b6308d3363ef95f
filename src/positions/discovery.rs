//! Position Discovery (C7).
//!
//! Broker-initiated opens have no local Position until a Transaction for
//! their opening order is ingested. For every opening transaction
//! (`Sell to Open` / `Buy to Open`) whose `order_id` doesn't match any
//! existing Position's `opening_order_id`, this creates one — grouping all
//! transactions that share that `order_id` into the Position's leg set.
//! Two positions with identical strikes but different `order_id`s are
//! always distinct; `opening_order_id` is the sole disambiguator.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::info;

use crate::broker::{InstrumentType, LegAction};
use crate::models::{
    LifecycleState, Position, PositionLeg, PositionMetadata, Transaction,
};
use crate::money::{PriceEffect, QuantityDirection};
use crate::report::PhaseReport;
use crate::store::Store;

pub async fn discover_positions(store: &Store, user: i64, account: &str) -> PhaseReport {
    let started = std::time::Instant::now();
    let mut builder = PhaseReport::builder();

    let transactions = match store.list_transactions_for_account(user, account).await {
        Ok(t) => t,
        Err(e) => {
            builder.error(format!("account:{account}"), e);
            return builder.finish(started, serde_json::Value::Null);
        }
    };

    let mut openings_by_order: HashMap<String, Vec<Transaction>> = HashMap::new();
    for txn in transactions {
        if txn.is_opening() {
            if let Some(order_id) = txn.order_id.clone() {
                openings_by_order.entry(order_id).or_default().push(txn);
            }
        }
    }

    for (order_id, group) in openings_by_order {
        builder.processed(1);

        match store.get_position_by_opening_order_id(&order_id).await {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => {
                builder.error(format!("order:{order_id}"), e);
                continue;
            }
        }

        let position = match build_position_from_group(user, account, &order_id, &group) {
            Some(p) => p,
            None => continue,
        };

        match store.insert_position(position).await {
            Ok(p) => {
                builder.created(1);
                info!(order_id, position = p.id, "discovered unmanaged position");
            }
            Err(e) => {
                builder.error(format!("order:{order_id}"), e);
            }
        }
    }

    builder.finish(started, serde_json::Value::Null)
}

fn build_position_from_group(
    user: i64,
    account: &str,
    order_id: &str,
    group: &[Transaction],
) -> Option<Position> {
    let first = group.first()?;
    let underlying = first
        .underlying_symbol
        .clone()
        .or_else(|| first.symbol.clone())?;

    let mut legs_by_symbol: HashMap<String, Vec<&Transaction>> = HashMap::new();
    for txn in group {
        let symbol = txn.symbol.clone().unwrap_or_else(|| underlying.clone());
        legs_by_symbol.entry(symbol).or_default().push(txn);
    }

    let mut legs = Vec::new();
    let mut opened_at: Option<DateTime<Utc>> = None;
    let mut opening_price_effect = PriceEffect::Credit;
    let mut instrument_type = first.instrument_type;

    for (symbol, txns) in &legs_by_symbol {
        let mut total_qty = Decimal::ZERO;
        let mut weighted_price = Decimal::ZERO;
        let mut direction = QuantityDirection::Short;
        for txn in txns {
            let qty = txn.quantity.unwrap_or(Decimal::ONE).abs();
            total_qty += qty;
            weighted_price += txn.price.unwrap_or_default() * qty;
            direction = match txn.action {
                Some(LegAction::BuyToOpen) => QuantityDirection::Long,
                _ => QuantityDirection::Short,
            };
            opened_at = Some(match opened_at {
                Some(existing) if existing <= txn.executed_at => existing,
                _ => txn.executed_at,
            });
            instrument_type = txn.instrument_type;
        }
        let avg_price = if total_qty.is_zero() {
            Decimal::ZERO
        } else {
            weighted_price / total_qty
        };
        let signed_qty = match direction {
            QuantityDirection::Short => -total_qty,
            QuantityDirection::Long => total_qty,
        };
        let signed_qty_i64 = signed_qty.round().to_string().parse::<i64>().unwrap_or(0);
        legs.push(PositionLeg {
            symbol: symbol.clone(),
            quantity: signed_qty_i64,
            quantity_direction: direction,
            average_open_price: avg_price,
            close_price: None,
            mark_price: None,
            multiplier: crate::money::DEFAULT_MULTIPLIER,
            instrument_type,
            action: txns.first().and_then(|t| t.action).map(|a| a.as_broker_str().to_string()),
        });
        if matches!(direction, QuantityDirection::Short) {
            opening_price_effect = PriceEffect::Credit;
        }
    }

    let is_single_equity_leg = legs.len() == 1 && instrument_type == InstrumentType::Equity;
    let strategy_type = if is_single_equity_leg {
        "stock_holding"
    } else {
        "external"
    };

    let opened_at = opened_at.unwrap_or(first.executed_at);
    let number_of_spreads = if is_single_equity_leg { None } else { Some(1) };

    let quantity = if is_single_equity_leg {
        legs.first().map(|l| l.quantity).unwrap_or(0)
    } else {
        legs.iter().map(|l| l.quantity.unsigned_abs()).min().unwrap_or(1).max(1) as i64
    };

    Some(Position {
        id: 0,
        user,
        trading_account: account.to_string(),
        symbol: underlying,
        instrument_type,
        strategy_type: Some(strategy_type.to_string()),
        lifecycle_state: LifecycleState::OpenFull,
        quantity,
        avg_price: Decimal::ZERO,
        unrealized_pnl: Decimal::ZERO,
        total_realized_pnl: Decimal::ZERO,
        opening_price_effect,
        initial_risk: None,
        spread_width: None,
        number_of_spreads,
        is_app_managed: false,
        opening_order_id: Some(order_id.to_string()),
        opening_complex_order_id: None,
        closure_reason: None,
        assigned_at: None,
        profit_targets_created: false,
        profit_target_details: HashMap::new(),
        metadata: PositionMetadata {
            legs,
            ..Default::default()
        },
        opened_at,
        closed_at: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InstrumentType;
    use rust_decimal_macros::dec;

    fn opening_txn(order_id: &str, symbol: &str, action: LegAction) -> Transaction {
        Transaction {
            transaction_id: format!("T-{symbol}-{order_id}"),
            user: 1,
            trading_account: "ACC1".into(),
            order_id: Some(order_id.to_string()),
            transaction_type: "Trade".into(),
            transaction_sub_type: None,
            action: Some(action),
            value: dec!(170.00),
            net_value: dec!(170.00),
            commission: dec!(0),
            clearing_fees: dec!(0),
            regulatory_fees: dec!(0),
            symbol: Some(symbol.to_string()),
            underlying_symbol: Some("SYM".to_string()),
            instrument_type: InstrumentType::EquityOption,
            quantity: Some(dec!(1)),
            price: Some(dec!(1.70)),
            executed_at: Utc::now(),
            related_position: None,
            raw_data: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn discovers_new_position_from_opening_transactions() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_transaction(&opening_txn("ORD1", "SYM   250117P00450000", LegAction::SellToOpen))
            .await
            .unwrap();
        store
            .upsert_transaction(&opening_txn("ORD1", "SYM   250117P00445000", LegAction::BuyToOpen))
            .await
            .unwrap();

        let report = discover_positions(&store, 1, "ACC1").await;
        assert_eq!(report.items_created, 1);

        let position = store
            .get_position_by_opening_order_id("ORD1")
            .await
            .unwrap()
            .expect("position discovered");
        assert_eq!(position.strategy_type.as_deref(), Some("external"));
        assert!(!position.is_app_managed);
        assert_eq!(position.metadata.legs.len(), 2);
    }

    #[tokio::test]
    async fn skips_orders_with_an_existing_position() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_transaction(&opening_txn("ORD2", "SYM   250117P00450000", LegAction::SellToOpen))
            .await
            .unwrap();

        let mut existing = build_position_from_group(
            1,
            "ACC1",
            "ORD2",
            &[opening_txn("ORD2", "SYM   250117P00450000", LegAction::SellToOpen)],
        )
        .unwrap();
        existing.is_app_managed = true;
        store.insert_position(existing).await.unwrap();

        let report = discover_positions(&store, 1, "ACC1").await;
        assert_eq!(report.items_created, 0);
        assert_eq!(report.items_processed, 1);
    }
}
