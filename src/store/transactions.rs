use super::Store;
use crate::error::EngineResult;
use crate::models::Transaction;
use rusqlite::{params, OptionalExtension};

fn row_to_transaction(data: String) -> EngineResult<Transaction> {
    Ok(serde_json::from_str(&data)?)
}

impl Store {
    /// Upsert by `transaction_id` (spec §4.6).
    pub async fn upsert_transaction(&self, txn: &Transaction) -> EngineResult<()> {
        let conn = self.lock().await;
        let data = serde_json::to_string(txn)?;
        conn.execute(
            "INSERT INTO transactions
                (transaction_id, user, trading_account, order_id, related_position, executed_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(transaction_id) DO UPDATE SET
                order_id = excluded.order_id,
                related_position = excluded.related_position,
                data = excluded.data",
            params![
                txn.transaction_id,
                txn.user,
                txn.trading_account,
                txn.order_id,
                txn.related_position,
                txn.executed_at.to_rfc3339(),
                data,
            ],
        )?;
        Ok(())
    }

    pub async fn set_transaction_related_position(
        &self,
        transaction_id: &str,
        position_id: i64,
    ) -> EngineResult<()> {
        let mut txn = self
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| crate::error::EngineError::NotFound(transaction_id.to_string()))?;
        txn.related_position = Some(position_id);
        self.upsert_transaction(&txn).await
    }

    pub async fn get_transaction(&self, transaction_id: &str) -> EngineResult<Option<Transaction>> {
        let conn = self.lock().await;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM transactions WHERE transaction_id = ?1",
                params![transaction_id],
                |r| r.get(0),
            )
            .optional()?;
        data.map(row_to_transaction).transpose()
    }

    pub async fn unlinked_transactions(&self, user: i64) -> EngineResult<Vec<Transaction>> {
        let conn = self.lock().await;
        let mut stmt =
            conn.prepare("SELECT data FROM transactions WHERE user = ?1 AND related_position IS NULL")?;
        let rows = stmt.query_map(params![user], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row_to_transaction(row?)?);
        }
        Ok(out)
    }

    pub async fn transactions_for_order(&self, order_id: &str) -> EngineResult<Vec<Transaction>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare("SELECT data FROM transactions WHERE order_id = ?1")?;
        let rows = stmt.query_map(params![order_id], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row_to_transaction(row?)?);
        }
        Ok(out)
    }

    /// All transactions recorded for a user's account, for C7's grouping
    /// pass. Unindexed scan; acceptable at this table's expected size
    /// (bounded by `days_back` ingestion windows).
    pub async fn list_transactions_for_account(
        &self,
        user: i64,
        account: &str,
    ) -> EngineResult<Vec<Transaction>> {
        let conn = self.lock().await;
        let mut stmt =
            conn.prepare("SELECT data FROM transactions WHERE user = ?1 AND trading_account = ?2")?;
        let rows = stmt.query_map(params![user, account], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row_to_transaction(row?)?);
        }
        Ok(out)
    }

    pub async fn transactions_for_position(&self, position_id: i64) -> EngineResult<Vec<Transaction>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare("SELECT data FROM transactions WHERE related_position = ?1")?;
        let rows = stmt.query_map(params![position_id], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row_to_transaction(row?)?);
        }
        Ok(out)
    }
}
