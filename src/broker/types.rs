//! Wire-shaped types exchanged with the broker (spec §6).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::money::PriceEffect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentType {
    Equity,
    EquityOption,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Received,
    Routed,
    InFlight,
    Live,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    pub fn is_live_like(self) -> bool {
        matches!(
            self,
            OrderStatus::Received | OrderStatus::Routed | OrderStatus::InFlight | OrderStatus::Live
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegAction {
    SellToOpen,
    BuyToOpen,
    SellToClose,
    BuyToClose,
}

impl LegAction {
    pub fn as_broker_str(self) -> &'static str {
        match self {
            LegAction::SellToOpen => "Sell to Open",
            LegAction::BuyToOpen => "Buy to Open",
            LegAction::SellToClose => "Sell to Close",
            LegAction::BuyToClose => "Buy to Close",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub ext_group_fill_id: Option<String>,
    pub fill_id: String,
    pub quantity: i64,
    pub fill_price: Decimal,
    pub filled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    /// OCC symbol, or the bare underlying for equity legs.
    pub symbol: String,
    pub instrument_type: InstrumentType,
    pub action: LegAction,
    pub quantity: i64,
    pub remaining_quantity: Option<i64>,
    #[serde(default)]
    pub fills: Vec<Fill>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub id: String,
    pub status: OrderStatus,
    pub order_type: String,
    pub size: i64,
    pub underlying_symbol: String,
    pub underlying_instrument_type: InstrumentType,
    pub time_in_force: String,
    pub price: Option<Decimal>,
    pub price_effect: Option<PriceEffect>,
    pub received_at: DateTime<Utc>,
    pub live_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub terminal_at: Option<DateTime<Utc>>,
    pub complex_order_id: Option<String>,
    pub parent_order_id: Option<String>,
    pub replaces_order_id: Option<String>,
    pub replacing_order_id: Option<String>,
    pub contingent_status: Option<String>,
    pub reject_reason: Option<String>,
    #[serde(default)]
    pub legs: Vec<Leg>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerTransaction {
    pub id: String,
    pub transaction_type: String,
    pub transaction_sub_type: Option<String>,
    pub action: Option<LegAction>,
    pub symbol: Option<String>,
    pub underlying_symbol: Option<String>,
    pub instrument_type: InstrumentType,
    pub value: Decimal,
    pub net_value: Decimal,
    pub commission: Option<Decimal>,
    pub clearing_fees: Option<Decimal>,
    pub regulatory_fees: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub price: Option<Decimal>,
    pub executed_at: DateTime<Utc>,
    pub order_id: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub underlying_symbol: String,
    /// Signed count; sign convention matches `quantity_direction`.
    pub quantity: i64,
    pub quantity_direction: crate::money::QuantityDirection,
    pub average_open_price: Decimal,
    pub close_price: Option<Decimal>,
    pub mark_price: Option<Decimal>,
    pub multiplier: Decimal,
    pub instrument_type: InstrumentType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderChain {
    pub chain_id: String,
    pub underlying_symbol: String,
    pub total_commissions: Decimal,
    pub total_fees: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub chain_data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLegSpec {
    pub symbol: String,
    pub instrument_type: InstrumentType,
    pub action: LegAction,
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSpec {
    pub underlying_symbol: String,
    pub order_type: String,
    pub time_in_force: String,
    pub price: Decimal,
    pub price_effect: PriceEffect,
    pub legs: Vec<OrderLegSpec>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderResult {
    pub order_id: String,
    pub status: OrderStatus,
}
