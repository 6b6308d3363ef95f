use super::Store;
use crate::error::EngineResult;
use crate::models::OrderHistory;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;

fn row_to_order(data: String) -> EngineResult<OrderHistory> {
    Ok(serde_json::from_str(&data)?)
}

impl Store {
    /// Upsert by `broker_order_id`, preserving the broker's own timestamps
    /// (spec §4.5 step 3). The ingestor is strictly additive — this never
    /// touches Position or Trade rows.
    pub async fn upsert_order_history(&self, order: &OrderHistory) -> EngineResult<()> {
        let conn = self.lock().await;
        let data = serde_json::to_string(order)?;
        let status = format!("{:?}", order.status);
        conn.execute(
            "INSERT INTO order_history
                (broker_order_id, user, trading_account, underlying_symbol, status, filled_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(broker_order_id) DO UPDATE SET
                user = excluded.user,
                trading_account = excluded.trading_account,
                underlying_symbol = excluded.underlying_symbol,
                status = excluded.status,
                filled_at = excluded.filled_at,
                data = excluded.data",
            params![
                order.broker_order_id,
                order.user,
                order.trading_account,
                order.underlying_symbol,
                status,
                order.filled_at.map(|t| t.to_rfc3339()),
                data,
            ],
        )?;
        Ok(())
    }

    pub async fn get_order_history(&self, broker_order_id: &str) -> EngineResult<Option<OrderHistory>> {
        let conn = self.lock().await;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM order_history WHERE broker_order_id = ?1",
                params![broker_order_id],
                |r| r.get(0),
            )
            .optional()?;
        data.map(row_to_order).transpose()
    }

    /// Batched: load opening OrderHistory rows for a set of broker order ids
    /// in one query (spec §4.4(c), used by C8 Tier A step 1).
    pub async fn load_order_history_batch(
        &self,
        broker_order_ids: &[String],
    ) -> EngineResult<HashMap<String, OrderHistory>> {
        if broker_order_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.lock().await;
        let placeholders = broker_order_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT data FROM order_history WHERE broker_order_id IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> =
            broker_order_ids.iter().map(|i| i as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(params.as_slice(), |r| r.get::<_, String>(0))?;
        let mut out = HashMap::new();
        for row in rows {
            let order = row_to_order(row?)?;
            out.insert(order.broker_order_id.clone(), order);
        }
        Ok(out)
    }

    pub async fn list_orders_for_underlying(
        &self,
        underlying_symbol: &str,
        status: Option<&str>,
    ) -> EngineResult<Vec<OrderHistory>> {
        let conn = self.lock().await;
        let mut sql = String::from("SELECT data FROM order_history WHERE underlying_symbol = ?1");
        if status.is_some() {
            sql.push_str(" AND status = ?2");
        }
        let mut stmt = conn.prepare(&sql)?;
        let mut bind_params: Vec<&dyn rusqlite::ToSql> = vec![underlying_symbol as &dyn rusqlite::ToSql];
        if let Some(s) = status {
            bind_params.push(s as &dyn rusqlite::ToSql);
        }
        let rows = stmt.query_map(bind_params.as_slice(), |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row_to_order(row?)?);
        }
        Ok(out)
    }
}
