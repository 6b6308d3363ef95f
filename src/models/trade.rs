//! Trade — a single order event for a position (spec §3).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeType {
    Open,
    Close,
    Adjustment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Pending,
    Submitted,
    Routed,
    Live,
    Working,
    Filled,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub user: i64,
    pub position: i64,
    pub trading_account: String,
    pub broker_order_id: String,
    pub trade_type: TradeType,
    pub order_legs: serde_json::Value,
    pub executed_price: Option<Decimal>,
    pub fill_price: Option<Decimal>,
    pub quantity: i64,
    pub status: TradeStatus,
    pub submitted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub commission: Decimal,
    pub parent_order_id: Option<String>,
    #[serde(default)]
    pub child_order_ids: Vec<String>,
    pub lifecycle_event: Option<String>,
    pub lifecycle_snapshot: Option<serde_json::Value>,
    pub order_type: Option<String>,
    pub time_in_force: Option<String>,
    pub metadata: serde_json::Value,
    pub realized_pnl: Option<Decimal>,
}
