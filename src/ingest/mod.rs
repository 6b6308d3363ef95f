//! Ground-truth ingestion: order history (C5) and transactions (C6).

pub mod order_history;
pub mod transactions;
