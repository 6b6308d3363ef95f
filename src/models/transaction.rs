//! Transaction — ground-truth fill/assignment/fee line (spec §3).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use crate::broker::LegAction as TransactionAction;
use crate::broker::InstrumentType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub user: i64,
    pub trading_account: String,
    pub order_id: Option<String>,
    pub transaction_type: String,
    pub transaction_sub_type: Option<String>,
    pub action: Option<TransactionAction>,
    pub value: Decimal,
    pub net_value: Decimal,
    pub commission: Decimal,
    pub clearing_fees: Decimal,
    pub regulatory_fees: Decimal,
    pub symbol: Option<String>,
    pub underlying_symbol: Option<String>,
    pub instrument_type: InstrumentType,
    pub quantity: Option<Decimal>,
    pub price: Option<Decimal>,
    pub executed_at: DateTime<Utc>,
    pub related_position: Option<i64>,
    pub raw_data: serde_json::Value,
}

impl Transaction {
    pub fn is_assignment(&self) -> bool {
        self.transaction_sub_type
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("Assignment"))
            .unwrap_or(false)
    }

    pub fn is_exercise(&self) -> bool {
        self.transaction_sub_type
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("Exercise"))
            .unwrap_or(false)
    }

    pub fn is_opening(&self) -> bool {
        matches!(
            self.action,
            Some(TransactionAction::SellToOpen) | Some(TransactionAction::BuyToOpen)
        )
    }

    pub fn is_closing(&self) -> bool {
        matches!(
            self.action,
            Some(TransactionAction::SellToClose) | Some(TransactionAction::BuyToClose)
        )
    }
}
