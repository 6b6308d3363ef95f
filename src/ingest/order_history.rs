//! Order History Ingestor (C5).
//!
//! Strictly additive: pulls paginated order history from the broker and
//! upserts into the store. Never mutates Position or Trade rows. The
//! pagination is mandatory — spec.md calls out a prior incident where only
//! the first page (50 orders) was fetched and fills were silently lost.

use chrono::Utc;
use tracing::{info, warn};

use crate::broker::{self, BrokerSession, OrderStatus};
use crate::models::OrderHistory;
use crate::report::PhaseReport;
use crate::store::Store;

const PER_PAGE: u32 = 100;

pub async fn sync(
    broker: &dyn BrokerSession,
    store: &Store,
    user: i64,
    account: &str,
    days_back: i64,
) -> PhaseReport {
    let started = std::time::Instant::now();
    let mut builder = PhaseReport::builder();
    let start_date = Utc::now() - chrono::Duration::days(days_back);

    let mut page_offset = 0u32;
    loop {
        let page = match broker::retry_once(|| broker.get_order_history(account, start_date, PER_PAGE, page_offset)).await {
            Ok(page) => page,
            Err(e) => {
                builder.error(format!("account:{account}"), e);
                break;
            }
        };
        let page_len = page.len();
        if page_len == 0 {
            break;
        }

        for order in page {
            match upsert_one(store, user, account, &order).await {
                Ok(is_new) => {
                    builder.processed(1);
                    if is_new {
                        builder.created(1);
                    } else {
                        builder.updated(1);
                    }
                }
                Err(e) => {
                    builder.error(format!("order:{}", order.id), e);
                }
            }
        }

        if (page_len as u32) < PER_PAGE {
            break;
        }
        page_offset += 1;
    }

    info!(account, processed = builder.processed, "order history sync complete");
    builder.finish(started, serde_json::json!({ "days_back": days_back }))
}

async fn upsert_one(
    store: &Store,
    user: i64,
    account: &str,
    order: &broker::PlacedOrder,
) -> crate::error::EngineResult<bool> {
    let price = if order.status == OrderStatus::Filled {
        broker::calculate_fill_price(order).or(order.price)
    } else {
        order.price
    };

    if order.status == OrderStatus::Filled && broker::calculate_fill_price(order).is_none() {
        warn!(order_id = %order.id, "order reported filled but has no fill data");
    }

    let is_new = store.get_order_history(&order.id).await?.is_none();

    let row = OrderHistory {
        broker_order_id: order.id.clone(),
        user,
        trading_account: account.to_string(),
        complex_order_id: order.complex_order_id.clone(),
        parent_order_id: order.parent_order_id.clone(),
        replaces_order_id: order.replaces_order_id.clone(),
        replacing_order_id: order.replacing_order_id.clone(),
        underlying_symbol: order.underlying_symbol.clone(),
        order_type: order.order_type.clone(),
        status: order.status,
        price,
        price_effect: order.price_effect,
        received_at: order.received_at,
        live_at: order.live_at,
        filled_at: order.filled_at,
        cancelled_at: order.cancelled_at,
        terminal_at: order.terminal_at,
        order_data: serde_json::to_value(order)?,
    };
    store.upsert_order_history(&row).await?;
    Ok(is_new)
}
