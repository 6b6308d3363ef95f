//! Order Execution collaborator (external, spec §4.10 step 7 / §4.11 step 5).
//!
//! Strategy scoring and order placement for *new* positions live outside
//! this core (spec §1); this crate only needs a narrow port for placing and
//! cancelling *exit* orders for spreads it already owns. Grounded on the
//! teacher's `TradeExecutor` (`src/vault/trade_executor.rs`): a thin trait
//! in front of whatever places the real order, with a `dry_run` flag honored
//! the same way.

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::broker::{BrokerError, BrokerSession, OrderLegSpec, OrderSpec};
use crate::money::PriceEffect;

#[derive(Debug, Error, Clone)]
pub enum ExecutionError {
    #[error("broker error placing exit order: {0}")]
    Broker(#[from] BrokerError),
    #[error("execution rejected: {0}")]
    Rejected(String),
}

/// One exit order to place for a single spread type.
#[derive(Debug, Clone)]
pub struct ProfitTargetSpec {
    pub spread_type: String,
    pub legs: Vec<OrderLegSpec>,
    pub limit_price: Decimal,
    pub price_effect: PriceEffect,
}

#[derive(Debug, Clone)]
pub struct PlacedExitOrder {
    pub spread_type: String,
    pub order_id: String,
}

/// Port for placing/cancelling exit orders. Strategy-specific profit-target
/// math (spec §4.3 formula 2 / the expected-spread table in §4.10) is
/// computed by callers; this trait only executes.
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn place_exit_order(
        &self,
        account: &str,
        spec: &ProfitTargetSpec,
    ) -> Result<PlacedExitOrder, ExecutionError>;

    async fn cancel_order(&self, account: &str, order_id: &str) -> Result<(), ExecutionError>;
}

/// Returns the per-spread profit-target specifications for a strategy, per
/// spec §4.10's expected-spread table. Returns an empty vec for strategies
/// with no defined set ("skip silently").
pub fn expected_spread_types(strategy_type: &str) -> Vec<(&'static str, Decimal)> {
    use rust_decimal_macros::dec;
    match strategy_type {
        "senex_trident" => vec![
            ("put_spread_1", dec!(40)),
            ("put_spread_2", dec!(60)),
            ("call_spread", dec!(50)),
        ],
        "short_iron_condor" | "long_iron_condor" | "iron_condor" => {
            vec![("put_spread", dec!(50)), ("call_spread", dec!(50))]
        }
        "short_put_vertical" | "short_call_vertical" | "long_call_vertical" | "long_put_vertical" => {
            vec![("spread", dec!(50))]
        }
        "cash_secured_put" | "covered_call" => vec![("single_leg", dec!(50))],
        _ => vec![],
    }
}

/// Default `OrderExecutor` that forwards straight to a [`BrokerSession`].
/// A `dry_run` deployment wants a different `OrderExecutor` that logs
/// instead of placing; this one always places.
pub struct BrokerBackedExecutor<'a> {
    broker: &'a dyn BrokerSession,
}

impl<'a> BrokerBackedExecutor<'a> {
    pub fn new(broker: &'a dyn BrokerSession) -> Self {
        BrokerBackedExecutor { broker }
    }
}

#[async_trait]
impl<'a> OrderExecutor for BrokerBackedExecutor<'a> {
    async fn place_exit_order(
        &self,
        account: &str,
        spec: &ProfitTargetSpec,
    ) -> Result<PlacedExitOrder, ExecutionError> {
        let mut tags = std::collections::HashMap::new();
        tags.insert("idempotency_key".to_string(), Uuid::new_v4().to_string());

        let order_spec = OrderSpec {
            underlying_symbol: spec
                .legs
                .first()
                .map(|l| l.symbol.clone())
                .unwrap_or_default(),
            order_type: "limit".to_string(),
            time_in_force: "gtc".to_string(),
            price: spec.limit_price,
            price_effect: spec.price_effect,
            legs: spec.legs.clone(),
            tags,
        };
        let placed = self.broker.place_order(account, order_spec).await?;
        Ok(PlacedExitOrder {
            spread_type: spec.spread_type.clone(),
            order_id: placed.order_id,
        })
    }

    async fn cancel_order(&self, account: &str, order_id: &str) -> Result<(), ExecutionError> {
        self.broker.cancel_order(account, order_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn senex_trident_has_three_targets() {
        let targets = expected_spread_types("senex_trident");
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].0, "put_spread_1");
    }

    #[test]
    fn unknown_strategy_has_no_targets() {
        assert!(expected_spread_types("mystery_strategy").is_empty());
    }
}
