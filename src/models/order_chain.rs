//! OrderChain — broker-side aggregate of all orders for one symbol's
//! lifecycle (spec §3). Read-only reference material for this engine; no
//! component mutates it today, but it is kept in sync from ingestion.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

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

impl From<crate::broker::OrderChain> for OrderChain {
    fn from(c: crate::broker::OrderChain) -> Self {
        OrderChain {
            chain_id: c.chain_id,
            underlying_symbol: c.underlying_symbol,
            total_commissions: c.total_commissions,
            total_fees: c.total_fees,
            realized_pnl: c.realized_pnl,
            unrealized_pnl: c.unrealized_pnl,
            created_at: c.created_at,
            updated_at: c.updated_at,
            chain_data: c.chain_data,
        }
    }
}
