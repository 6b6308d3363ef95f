//! Broker Session Port (C1).
//!
//! An opaque handle granting authenticated RPC to the brokerage, produced by
//! an external accounts/OAuth module that is out of scope for this crate
//! (spec §1, §4.1). The engine only ever talks to this trait; nothing here
//! knows the broker's wire protocol.

pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod tests_support;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use types::*;

/// Failure taxonomy from spec §4.1/§7. Only `Transient` is retried by the
/// core; everything else is surfaced with its reason.
#[derive(Debug, Error, Clone)]
pub enum BrokerError {
    #[error("transient broker error: {0}")]
    Transient(String),
    #[error("broker authentication error: {0}")]
    Authentication(String),
    #[error("not found")]
    NotFound,
    #[error("broker rejected request: {0}")]
    Validation(String),
    #[error("broker order conflict: {0}")]
    Conflict(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }
}

/// Retries a broker call exactly once if its first failure was transient
/// (spec §7: "Retry once per phase; otherwise record and continue"). Any
/// other error kind, or a second transient failure, is returned as-is.
pub async fn retry_once<T, F, Fut>(mut call: F) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, BrokerError>>,
{
    match call().await {
        Err(e) if e.is_transient() => call().await,
        other => other,
    }
}

#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn list_positions(
        &self,
        account: &str,
        include_marks: bool,
    ) -> Result<Vec<BrokerPosition>, BrokerError>;

    async fn get_order_history(
        &self,
        account: &str,
        start_date: DateTime<Utc>,
        per_page: u32,
        page_offset: u32,
    ) -> Result<Vec<PlacedOrder>, BrokerError>;

    async fn get_order(&self, account: &str, order_id: &str) -> Result<Option<PlacedOrder>, BrokerError>;

    async fn get_live_orders(&self, account: &str) -> Result<Vec<PlacedOrder>, BrokerError>;

    async fn get_order_chains(
        &self,
        account: &str,
        symbol: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Vec<OrderChain>, BrokerError>;

    async fn get_transactions(
        &self,
        account: &str,
        start_date: DateTime<Utc>,
    ) -> Result<Vec<BrokerTransaction>, BrokerError>;

    async fn place_order(&self, account: &str, spec: OrderSpec) -> Result<PlaceOrderResult, BrokerError>;

    async fn cancel_order(&self, account: &str, order_id: &str) -> Result<OrderStatus, BrokerError>;
}

/// Sum over leg fills: `+fill_price * |qty|` for sells, `-fill_price * |qty|`
/// for buys. Returns `None` if the order has no fills at all (spec §4.5
/// step 2).
pub fn calculate_fill_price(order: &PlacedOrder) -> Option<rust_decimal::Decimal> {
    let mut total = rust_decimal::Decimal::ZERO;
    let mut any_fill = false;
    for leg in &order.legs {
        let sign = match leg.action {
            LegAction::SellToOpen | LegAction::SellToClose => rust_decimal::Decimal::ONE,
            LegAction::BuyToOpen | LegAction::BuyToClose => -rust_decimal::Decimal::ONE,
        };
        for fill in &leg.fills {
            any_fill = true;
            total += sign * fill.fill_price * rust_decimal::Decimal::from(fill.quantity.abs());
        }
    }
    if any_fill {
        Some(total)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn fill(price: rust_decimal::Decimal, qty: i64) -> Fill {
        Fill {
            ext_group_fill_id: None,
            fill_id: "f1".into(),
            quantity: qty,
            fill_price: price,
            filled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn retry_once_recovers_from_a_single_transient_failure() {
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let result: Result<&str, BrokerError> = retry_once(|| {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(BrokerError::Transient("rate limited".into()))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_once_does_not_retry_non_transient_errors() {
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let result: Result<(), BrokerError> = retry_once(|| {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(BrokerError::NotFound) }
        })
        .await;
        assert!(matches!(result, Err(BrokerError::NotFound)));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn no_fills_returns_none() {
        let order = PlacedOrder {
            id: "o1".into(),
            status: OrderStatus::Live,
            order_type: "Limit".into(),
            size: 1,
            underlying_symbol: "SYM".into(),
            underlying_instrument_type: InstrumentType::EquityOption,
            time_in_force: "Day".into(),
            price: Some(dec!(1.70)),
            price_effect: Some(crate::money::PriceEffect::Credit),
            received_at: Utc::now(),
            live_at: None,
            filled_at: None,
            cancelled_at: None,
            terminal_at: None,
            complex_order_id: None,
            parent_order_id: None,
            replaces_order_id: None,
            replacing_order_id: None,
            contingent_status: None,
            reject_reason: None,
            legs: vec![Leg {
                symbol: "SYM   250117C00455000".into(),
                instrument_type: InstrumentType::EquityOption,
                action: LegAction::SellToOpen,
                quantity: 1,
                remaining_quantity: Some(1),
                fills: vec![],
            }],
        };
        assert_eq!(calculate_fill_price(&order), None);
    }

    #[test]
    fn credit_spread_fill_price_nets_legs() {
        let mut order_template = |action, price, qty| Leg {
            symbol: "SYM".into(),
            instrument_type: InstrumentType::EquityOption,
            action,
            quantity: qty,
            remaining_quantity: Some(0),
            fills: vec![fill(price, qty)],
        };
        let order = PlacedOrder {
            id: "o1".into(),
            status: OrderStatus::Filled,
            order_type: "Limit".into(),
            size: 2,
            underlying_symbol: "SYM".into(),
            underlying_instrument_type: InstrumentType::EquityOption,
            time_in_force: "Day".into(),
            price: None,
            price_effect: Some(crate::money::PriceEffect::Credit),
            received_at: Utc::now(),
            live_at: None,
            filled_at: Some(Utc::now()),
            cancelled_at: None,
            terminal_at: None,
            complex_order_id: None,
            parent_order_id: None,
            replaces_order_id: None,
            replacing_order_id: None,
            contingent_status: None,
            reject_reason: None,
            legs: vec![
                order_template(LegAction::SellToOpen, dec!(2.10), 2),
                order_template(LegAction::BuyToOpen, dec!(0.40), 2),
            ],
        };
        // (2.10 * 2) - (0.40 * 2) = 3.40
        assert_eq!(calculate_fill_price(&order), Some(dec!(3.40)));
    }
}
