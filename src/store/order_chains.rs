use super::Store;
use crate::error::EngineResult;
use crate::models::OrderChain;
use rusqlite::params;

impl Store {
    pub async fn upsert_order_chain(&self, chain: &OrderChain) -> EngineResult<()> {
        let conn = self.lock().await;
        let data = serde_json::to_string(chain)?;
        conn.execute(
            "INSERT INTO order_chains (chain_id, underlying_symbol, data)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(chain_id) DO UPDATE SET
                underlying_symbol = excluded.underlying_symbol,
                data = excluded.data",
            params![chain.chain_id, chain.underlying_symbol, data],
        )?;
        Ok(())
    }
}
