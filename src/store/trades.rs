use super::Store;
use crate::error::EngineResult;
use crate::models::Trade;
use rusqlite::{params, OptionalExtension};

fn row_to_trade(data: String) -> EngineResult<Trade> {
    Ok(serde_json::from_str(&data)?)
}

impl Store {
    pub async fn upsert_trade(&self, mut trade: Trade) -> EngineResult<Trade> {
        let conn = self.lock().await;
        let existing_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM trades WHERE broker_order_id = ?1",
                params![trade.broker_order_id],
                |r| r.get(0),
            )
            .optional()?;

        if let Some(id) = existing_id {
            trade.id = id;
        }
        let data = serde_json::to_string(&trade)?;
        let status = serde_json::to_string(&trade.status)?;
        conn.execute(
            "INSERT INTO trades (broker_order_id, position, user, status, data)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(broker_order_id) DO UPDATE SET
                position = excluded.position,
                user = excluded.user,
                status = excluded.status,
                data = excluded.data",
            params![trade.broker_order_id, trade.position, trade.user, status, data],
        )?;
        if existing_id.is_none() {
            trade.id = conn.last_insert_rowid();
            conn.execute(
                "UPDATE trades SET data = ?1 WHERE id = ?2",
                params![serde_json::to_string(&trade)?, trade.id],
            )?;
        }
        Ok(trade)
    }

    pub async fn get_trade_by_broker_order_id(&self, broker_order_id: &str) -> EngineResult<Option<Trade>> {
        let conn = self.lock().await;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM trades WHERE broker_order_id = ?1",
                params![broker_order_id],
                |r| r.get(0),
            )
            .optional()?;
        data.map(row_to_trade).transpose()
    }

    pub async fn list_trades_for_position(&self, position_id: i64) -> EngineResult<Vec<Trade>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare("SELECT data FROM trades WHERE position = ?1")?;
        let rows = stmt.query_map(params![position_id], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row_to_trade(row?)?);
        }
        Ok(out)
    }
}
