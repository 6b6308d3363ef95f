use super::{row_not_found, Store};
use crate::error::{EngineError, EngineResult};
use crate::models::{LifecycleState, Position};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;

/// Scoping filter applied by the orchestrator and by individual phases
/// (spec §4.12's scoped modes).
#[derive(Debug, Clone, Default)]
pub struct PositionFilter {
    pub user_id: Option<i64>,
    pub position_id: Option<i64>,
    pub symbol: Option<String>,
}

fn position_row_to_model(data: String) -> EngineResult<Position> {
    Ok(serde_json::from_str(&data)?)
}

impl Store {
    /// Insert a brand-new Position (id is assigned by the store) and return
    /// it with its id populated.
    pub async fn insert_position(&self, mut position: Position) -> EngineResult<Position> {
        let conn = self.lock().await;
        let data = serde_json::to_string(&position)?;
        conn.execute(
            "INSERT INTO positions
                (user, trading_account, symbol, lifecycle_state, is_app_managed,
                 strategy_type, opening_order_id, opened_at, closed_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                position.user,
                position.trading_account,
                position.symbol,
                serde_json::to_string(&position.lifecycle_state)?,
                position.is_app_managed as i64,
                position.strategy_type,
                position.opening_order_id,
                position.opened_at.to_rfc3339(),
                position.closed_at.map(|t| t.to_rfc3339()),
                data,
            ],
        )?;
        let id = conn.last_insert_rowid();
        position.id = id;
        // re-persist now that the id is known, so `data` matches `id`.
        conn.execute(
            "UPDATE positions SET data = ?1 WHERE id = ?2",
            params![serde_json::to_string(&position)?, id],
        )?;
        Ok(position)
    }

    pub async fn get_position(&self, id: i64) -> EngineResult<Position> {
        let conn = self.lock().await;
        let data: String = conn
            .query_row("SELECT data FROM positions WHERE id = ?1", params![id], |r| r.get(0))
            .map_err(|e| row_not_found(e, &format!("position {id}")))?;
        position_row_to_model(data)
    }

    pub async fn get_position_by_opening_order_id(
        &self,
        opening_order_id: &str,
    ) -> EngineResult<Option<Position>> {
        let conn = self.lock().await;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM positions WHERE opening_order_id = ?1",
                params![opening_order_id],
                |r| r.get(0),
            )
            .optional()?;
        data.map(position_row_to_model).transpose()
    }

    /// Positions in an open-like lifecycle state, honoring the scoping
    /// filter. `app_managed_only` restricts to `is_app_managed = true`
    /// (Tier A of C8, and the population C10 reconciles).
    pub async fn load_open_positions(
        &self,
        filter: &PositionFilter,
        app_managed_only: bool,
    ) -> EngineResult<Vec<Position>> {
        let conn = self.lock().await;
        let mut sql = String::from("SELECT data FROM positions WHERE lifecycle_state IN ('pending_entry','open_full','open_partial','closing')");
        if app_managed_only {
            sql.push_str(" AND is_app_managed = 1");
        }
        let mut bind_params: Vec<&dyn rusqlite::ToSql> = Vec::new();
        if let Some(uid) = &filter.user_id {
            sql.push_str(" AND user = ?");
            bind_params.push(uid);
        }
        if let Some(pid) = &filter.position_id {
            sql.push_str(" AND id = ?");
            bind_params.push(pid);
        }
        if let Some(symbol) = &filter.symbol {
            sql.push_str(" AND symbol = ?");
            bind_params.push(symbol);
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(bind_params.as_slice(), |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(position_row_to_model(row?)?);
        }
        Ok(out)
    }

    /// Scans all positions for one whose `profit_target_details` already
    /// claims `order_id`, so C10 step 4's orphan adoption never double-binds
    /// a live order to two spreads.
    pub async fn profit_target_order_is_claimed(&self, order_id: &str) -> EngineResult<bool> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare("SELECT data FROM positions")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        for row in rows {
            let position = position_row_to_model(row?)?;
            if position
                .profit_target_details
                .values()
                .any(|d| d.order_id.as_deref() == Some(order_id))
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Finds the open Position (and spread_type key) whose
    /// `profit_target_details` claims `order_id`, for C11 step 1's
    /// PT-fill-vs-ignore classification of an incoming push event.
    pub async fn position_for_profit_target_order(
        &self,
        order_id: &str,
    ) -> EngineResult<Option<(i64, String)>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare("SELECT data FROM positions")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        for row in rows {
            let position = position_row_to_model(row?)?;
            for (spread_type, detail) in &position.profit_target_details {
                if detail.order_id.as_deref() == Some(order_id) {
                    return Ok(Some((position.id, spread_type.clone())));
                }
            }
        }
        Ok(None)
    }

    /// All distinct underlying symbols with at least one app-managed open
    /// position, used by C8 Tier B to find underlyings not yet synced.
    pub async fn app_managed_open_symbols(&self, filter: &PositionFilter) -> EngineResult<Vec<String>> {
        Ok(self
            .load_open_positions(filter, true)
            .await?
            .into_iter()
            .map(|p| p.symbol)
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect())
    }

    /// Batched read: load full Positions for a set of ids in one query,
    /// avoiding the N+1 access spec §4.4 calls out.
    pub async fn load_positions_batch(&self, ids: &[i64]) -> EngineResult<HashMap<i64, Position>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.lock().await;
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT data FROM positions WHERE id IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|i| i as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(params.as_slice(), |r| r.get::<_, String>(0))?;
        let mut out = HashMap::new();
        for row in rows {
            let position = position_row_to_model(row?)?;
            out.insert(position.id, position);
        }
        Ok(out)
    }

    /// Save a Position without row-locking. Used by ingestors that only
    /// ever append or that already hold a lock acquired elsewhere.
    pub async fn save_position(&self, position: &Position) -> EngineResult<()> {
        let conn = self.lock().await;
        save_position_inner(&conn, position)
    }

    /// Re-read the Position under a write lock, run `f`, and persist
    /// whatever `f` leaves in the passed `&mut Position` iff `f` returns
    /// `Ok`. Aborts (rolls back, returns `StaleState`) if the position is no
    /// longer open when `require_open` is set — this is the row-lock
    /// emulation spec §5 and §9 require for C10/C11's fill-processing paths.
    pub async fn with_position_locked<T, F>(
        &self,
        id: i64,
        require_open: bool,
        f: F,
    ) -> EngineResult<T>
    where
        F: FnOnce(&mut Position) -> EngineResult<T>,
    {
        let mut conn = self.lock().await;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let data: String = tx
            .query_row("SELECT data FROM positions WHERE id = ?1", params![id], |r| r.get(0))
            .map_err(|e| row_not_found(e, &format!("position {id}")))?;
        let mut position = position_row_to_model(data)?;

        if require_open && !position.is_open() {
            tx.rollback()?;
            return Err(EngineError::StaleState(id));
        }

        let result = f(&mut position);
        match result {
            Ok(value) => {
                save_position_inner(&tx, &position)?;
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }
}

fn save_position_inner(conn: &rusqlite::Connection, position: &Position) -> EngineResult<()> {
    let data = serde_json::to_string(position)?;
    conn.execute(
        "UPDATE positions SET
            user = ?1, trading_account = ?2, symbol = ?3, lifecycle_state = ?4,
            is_app_managed = ?5, strategy_type = ?6, opening_order_id = ?7,
            opened_at = ?8, closed_at = ?9, data = ?10
         WHERE id = ?11",
        params![
            position.user,
            position.trading_account,
            position.symbol,
            serde_json::to_string(&position.lifecycle_state)?,
            position.is_app_managed as i64,
            position.strategy_type,
            position.opening_order_id,
            position.opened_at.to_rfc3339(),
            position.closed_at.map(|t| t.to_rfc3339()),
            data,
            position.id,
        ],
    )?;
    Ok(())
}

impl Position {
    pub fn lifecycle_label(&self) -> &'static str {
        match self.lifecycle_state {
            LifecycleState::PendingEntry => "pending_entry",
            LifecycleState::OpenFull => "open_full",
            LifecycleState::OpenPartial => "open_partial",
            LifecycleState::Closing => "closing",
            LifecycleState::Closed => "closed",
            LifecycleState::Rolled => "rolled",
            LifecycleState::Adjusted => "adjusted",
            LifecycleState::Expired => "expired",
        }
    }
}
