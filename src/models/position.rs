//! Position — the canonical record of an open or closed exposure (spec §3).
//!
//! `metadata` and `profit_target_details` are dynamic record shapes in the
//! original Django models; per spec §9's design note they are closed sum
//! types here, with an `extra` map for broker keys this engine doesn't model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::broker::InstrumentType;
use crate::money::{PriceEffect, QuantityDirection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    PendingEntry,
    OpenFull,
    OpenPartial,
    Closing,
    Closed,
    Rolled,
    Adjusted,
    Expired,
}

impl LifecycleState {
    pub fn is_open_like(self) -> bool {
        matches!(
            self,
            LifecycleState::PendingEntry
                | LifecycleState::OpenFull
                | LifecycleState::OpenPartial
                | LifecycleState::Closing
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosureReason {
    Assignment,
    Exercise,
    ProfitTarget,
    ManualClose,
    ExpiredWorthless,
    Unknown,
    OrderCancelled,
    OrderRejected,
    OrderExpired,
    ClosedAtBroker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfitTargetStatus {
    Pending,
    Filled,
    Cancelled,
    CancelledDteAutomation,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfitTargetDetail {
    pub order_id: Option<String>,
    pub percent: Decimal,
    pub original_credit: Option<Decimal>,
    pub target_price: Option<Decimal>,
    #[serde(default = "default_pt_status")]
    pub status: Option<ProfitTargetStatus>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub fill_price: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    #[serde(default)]
    pub skip_recreation: bool,
    pub skip_reason: Option<String>,
}

fn default_pt_status() -> Option<ProfitTargetStatus> {
    Some(ProfitTargetStatus::Pending)
}

impl ProfitTargetDetail {
    pub fn status(&self) -> ProfitTargetStatus {
        self.status.unwrap_or(ProfitTargetStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionLeg {
    pub symbol: String,
    pub quantity: i64,
    pub quantity_direction: QuantityDirection,
    pub average_open_price: Decimal,
    pub close_price: Option<Decimal>,
    pub mark_price: Option<Decimal>,
    #[serde(default = "crate::money::default_multiplier")]
    pub multiplier: Decimal,
    pub instrument_type: InstrumentType,
    pub action: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DteAutomation {
    pub last_processed_dte: Option<i32>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PositionMetadata {
    #[serde(default)]
    pub legs: Vec<PositionLeg>,
    pub original_quantity: Option<i64>,
    pub suggestion_id: Option<String>,
    #[serde(default)]
    pub spread_legs: HashMap<String, Vec<String>>,
    pub dte_automation: Option<DteAutomation>,
    #[serde(default)]
    pub reconstruction_failed: bool,
    pub reconstruction_error: Option<String>,
    pub assigned_equity_position_id: Option<i64>,
    pub expiration_date: Option<NaiveDate>,
    pub strikes: Option<serde_json::Value>,
    pub streaming_pricing: Option<serde_json::Value>,
    pub tastytrade_data: Option<serde_json::Value>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub user: i64,
    pub trading_account: String,
    pub symbol: String,
    pub instrument_type: InstrumentType,
    pub strategy_type: Option<String>,
    pub lifecycle_state: LifecycleState,
    pub quantity: i64,
    pub avg_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_realized_pnl: Decimal,
    pub opening_price_effect: PriceEffect,
    pub initial_risk: Option<Decimal>,
    pub spread_width: Option<Decimal>,
    pub number_of_spreads: Option<i64>,
    pub is_app_managed: bool,
    pub opening_order_id: Option<String>,
    pub opening_complex_order_id: Option<String>,
    pub closure_reason: Option<ClosureReason>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub profit_targets_created: bool,
    pub profit_target_details: HashMap<String, ProfitTargetDetail>,
    pub metadata: PositionMetadata,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// OCC symbols declared by this position's legs (spec invariant 3).
    pub fn declared_leg_symbols(&self) -> Vec<&str> {
        self.metadata.legs.iter().map(|l| l.symbol.as_str()).collect()
    }

    pub fn is_open(&self) -> bool {
        self.lifecycle_state.is_open_like()
    }
}
