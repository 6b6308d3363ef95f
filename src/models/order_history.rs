//! OrderHistory — immutable-feeling cache of broker orders (spec §3).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use crate::broker::OrderStatus;
use crate::money::PriceEffect;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderHistory {
    pub broker_order_id: String,
    pub user: i64,
    pub trading_account: String,
    pub complex_order_id: Option<String>,
    pub parent_order_id: Option<String>,
    pub replaces_order_id: Option<String>,
    pub replacing_order_id: Option<String>,
    pub underlying_symbol: String,
    pub order_type: String,
    pub status: OrderStatus,
    pub price: Option<Decimal>,
    pub price_effect: Option<PriceEffect>,
    pub received_at: DateTime<Utc>,
    pub live_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub terminal_at: Option<DateTime<Utc>>,
    /// Full serialized order including legs[] with fills[].
    pub order_data: serde_json::Value,
}
