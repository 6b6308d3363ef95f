//! Persistent Store (C4).
//!
//! Grounded on the teacher's `UserAccountsDB` (`src/vault/user_accounts.rs`)
//! and the indexed-JSON-blob schema style of `src/signals/db_storage.rs`:
//! each table keeps a handful of narrow, indexed columns for the predicates
//! spec §6 requires, plus a `data` TEXT column holding the full serialized
//! record. A single `Arc<tokio::sync::Mutex<Connection>>` serialises access;
//! row-level "select for update" semantics are emulated with `BEGIN
//! IMMEDIATE` transactions that re-read the row before mutating it
//! (`with_position_locked`), per spec §5's locking requirement.

mod order_chains;
mod order_history;
mod positions;
mod trades;
mod transactions;

use crate::error::{EngineError, EngineResult};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;

pub use positions::PositionFilter;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user INTEGER NOT NULL,
    trading_account TEXT NOT NULL,
    symbol TEXT NOT NULL,
    lifecycle_state TEXT NOT NULL,
    is_app_managed INTEGER NOT NULL,
    strategy_type TEXT,
    opening_order_id TEXT UNIQUE,
    opened_at TEXT NOT NULL,
    closed_at TEXT,
    data TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_positions_user_state ON positions(user, lifecycle_state);
CREATE INDEX IF NOT EXISTS idx_positions_account_state ON positions(trading_account, lifecycle_state);
CREATE INDEX IF NOT EXISTS idx_positions_symbol_state ON positions(symbol, lifecycle_state);

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    broker_order_id TEXT NOT NULL UNIQUE,
    position INTEGER NOT NULL,
    user INTEGER NOT NULL,
    status TEXT NOT NULL,
    data TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_position ON trades(position);

CREATE TABLE IF NOT EXISTS order_history (
    broker_order_id TEXT PRIMARY KEY,
    user INTEGER NOT NULL,
    trading_account TEXT NOT NULL,
    underlying_symbol TEXT NOT NULL,
    status TEXT NOT NULL,
    filled_at TEXT,
    data TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_order_history_user_symbol_filled
    ON order_history(user, underlying_symbol, filled_at);
CREATE INDEX IF NOT EXISTS idx_order_history_status ON order_history(status);

CREATE TABLE IF NOT EXISTS transactions (
    transaction_id TEXT PRIMARY KEY,
    user INTEGER NOT NULL,
    trading_account TEXT NOT NULL,
    order_id TEXT,
    related_position INTEGER,
    executed_at TEXT NOT NULL,
    data TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transactions_order_id ON transactions(order_id);
CREATE INDEX IF NOT EXISTS idx_transactions_related_position ON transactions(related_position);

CREATE TABLE IF NOT EXISTS order_chains (
    chain_id TEXT PRIMARY KEY,
    underlying_symbol TEXT NOT NULL,
    data TEXT NOT NULL
);
"#;

/// Typed record store for Positions, Trades, OrderHistory, Transactions and
/// OrderChains (spec §4.4).
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(database_path: &str) -> EngineResult<Self> {
        let conn = Connection::open(database_path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Distinct `(user, trading_account)` pairs the store has ever seen
    /// order history for. The operator CLI uses this to discover which
    /// accounts to pass to the orchestrator; a deployment with its own
    /// account registry would supply `UserAccount`s directly instead.
    pub async fn list_user_accounts(&self) -> EngineResult<Vec<(i64, String)>> {
        let conn = self.lock().await;
        let mut stmt =
            conn.prepare("SELECT DISTINCT user, trading_account FROM order_history ORDER BY user")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

pub(crate) fn row_not_found(err: rusqlite::Error, what: &str) -> EngineError {
    match err {
        rusqlite::Error::QueryReturnedNoRows => EngineError::NotFound(what.to_string()),
        other => EngineError::Store(other),
    }
}
