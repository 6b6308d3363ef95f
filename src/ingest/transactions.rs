//! Transaction Ingestor (C6).
//!
//! `import_transactions` pulls and upserts broker transactions by id.
//! `link_transactions_to_positions` then connects each unlinked transaction
//! to the Position it belongs to: first by matching `order_id` against a
//! Position's `opening_order_id` (the common case), falling back to
//! matching against the leg set of a Position that was still open at
//! execution time (rolls/partial closes whose own order id isn't the
//! opening one). Linking is monotonic — once set, never reassigned here.

use chrono::Utc;
use tracing::info;

use crate::broker::{self, BrokerSession};
use crate::models::Transaction;
use crate::report::PhaseReport;
use crate::store::{PositionFilter, Store};

pub async fn import_transactions(
    broker: &dyn BrokerSession,
    store: &Store,
    user: i64,
    account: &str,
    days_back: i64,
) -> PhaseReport {
    let started = std::time::Instant::now();
    let mut builder = PhaseReport::builder();
    let start_date = Utc::now() - chrono::Duration::days(days_back);

    let transactions = match broker::retry_once(|| broker.get_transactions(account, start_date)).await {
        Ok(t) => t,
        Err(e) => {
            builder.error(format!("account:{account}"), e);
            return builder.finish(started, serde_json::Value::Null);
        }
    };

    for txn in transactions {
        let is_new = match store.get_transaction(&txn.id).await {
            Ok(existing) => existing.is_none(),
            Err(e) => {
                builder.error(format!("txn:{}", txn.id), e);
                continue;
            }
        };

        let row = Transaction {
            transaction_id: txn.id.clone(),
            user,
            trading_account: account.to_string(),
            order_id: txn.order_id.clone(),
            transaction_type: txn.transaction_type.clone(),
            transaction_sub_type: txn.transaction_sub_type.clone(),
            action: txn.action,
            value: txn.value,
            net_value: txn.net_value,
            commission: txn.commission.unwrap_or_default(),
            clearing_fees: txn.clearing_fees.unwrap_or_default(),
            regulatory_fees: txn.regulatory_fees.unwrap_or_default(),
            symbol: txn.symbol.clone(),
            underlying_symbol: txn.underlying_symbol.clone(),
            instrument_type: txn.instrument_type,
            quantity: txn.quantity,
            price: txn.price,
            executed_at: txn.executed_at,
            related_position: None,
            raw_data: serde_json::to_value(&txn).unwrap_or(serde_json::Value::Null),
        };

        match store.upsert_transaction(&row).await {
            Ok(()) => {
                builder.processed(1);
                if is_new {
                    builder.created(1);
                } else {
                    builder.updated(1);
                }
            }
            Err(e) => {
                builder.error(format!("txn:{}", txn.id), e);
            }
        }
    }

    info!(account, processed = builder.processed, "transaction import complete");
    builder.finish(started, serde_json::json!({ "days_back": days_back }))
}

pub async fn link_transactions_to_positions(store: &Store, user: i64) -> PhaseReport {
    let started = std::time::Instant::now();
    let mut builder = PhaseReport::builder();

    let unlinked = match store.unlinked_transactions(user).await {
        Ok(t) => t,
        Err(e) => {
            builder.error("link", e);
            return builder.finish(started, serde_json::Value::Null);
        }
    };

    let open_positions = match store.load_open_positions(&PositionFilter { user_id: Some(user), ..Default::default() }, false).await {
        Ok(p) => p,
        Err(e) => {
            builder.error("link", e);
            return builder.finish(started, serde_json::Value::Null);
        }
    };

    for txn in unlinked {
        builder.processed(1);
        let Some(order_id) = &txn.order_id else { continue };

        // Primary path: order_id matches a Position's opening_order_id.
        let by_opening = match store.get_position_by_opening_order_id(order_id).await {
            Ok(p) => p,
            Err(e) => {
                builder.error(format!("txn:{}", txn.transaction_id), e);
                continue;
            }
        };

        let target = by_opening.map(|p| p.id).or_else(|| {
            // Fallback: the transaction's symbol appears in the leg set of
            // some still-open Position at the time of execution.
            txn.symbol.as_ref().and_then(|symbol| {
                open_positions
                    .iter()
                    .find(|p| {
                        p.opened_at <= txn.executed_at
                            && p.declared_leg_symbols().iter().any(|s| *s == symbol)
                    })
                    .map(|p| p.id)
            })
        });

        if let Some(position_id) = target {
            match store.set_transaction_related_position(&txn.transaction_id, position_id).await {
                Ok(()) => {
                    builder.updated(1);
                }
                Err(e) => {
                    builder.error(format!("txn:{}", txn.transaction_id), e);
                }
            }
        }
    }

    builder.finish(started, serde_json::Value::Null)
}
