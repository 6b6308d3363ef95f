//! In-memory `BrokerSession` stub shared by unit and integration tests.
//! Not part of the public API; compiled under `#[cfg(test)]` for unit tests
//! and under the `test-support` feature for the `tests/` integration suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;

#[derive(Default)]
pub struct StubBroker {
    history_pages: Mutex<Vec<Vec<PlacedOrder>>>,
    history_calls: AtomicUsize,
    positions: Mutex<Vec<BrokerPosition>>,
    live_orders: Mutex<Vec<PlacedOrder>>,
    orders_by_id: Mutex<HashMap<String, PlacedOrder>>,
    transactions: Mutex<Vec<BrokerTransaction>>,
    placed: Mutex<Vec<(String, OrderSpec)>>,
    next_order_id: AtomicUsize,
}

/// Exposed for other modules' tests that need a minimal `PlacedOrder` fixture.
pub fn make_order_for_tests(id: &str, underlying: &str, status: OrderStatus) -> PlacedOrder {
    make_order(id, underlying, status)
}

fn make_order(id: &str, underlying: &str, status: OrderStatus) -> PlacedOrder {
    PlacedOrder {
        id: id.to_string(),
        status,
        order_type: "Limit".to_string(),
        size: 1,
        underlying_symbol: underlying.to_string(),
        underlying_instrument_type: InstrumentType::EquityOption,
        time_in_force: "Day".to_string(),
        price: Some(rust_decimal_macros::dec!(1.00)),
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
        legs: vec![],
    }
}

impl StubBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a broker whose `get_order_history` returns successive pages of
    /// the given sizes (one call per page, in order), each page made of
    /// freshly-minted filled orders.
    pub fn with_order_pages(page_sizes: Vec<usize>) -> Self {
        let broker = Self::new();
        let mut pages = Vec::new();
        let mut counter = 0usize;
        for size in page_sizes {
            let mut page = Vec::new();
            for _ in 0..size {
                counter += 1;
                page.push(make_order(&format!("ORD{counter}"), "SYM", OrderStatus::Filled));
            }
            pages.push(page);
        }
        *broker.history_pages.lock() = pages;
        broker
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    pub fn push_live_order(&self, order: PlacedOrder) {
        self.orders_by_id.lock().insert(order.id.clone(), order.clone());
        self.live_orders.lock().push(order);
    }

    pub fn set_order(&self, order: PlacedOrder) {
        self.orders_by_id.lock().insert(order.id.clone(), order);
    }

    pub fn set_positions(&self, positions: Vec<BrokerPosition>) {
        *self.positions.lock() = positions;
    }

    pub fn push_transaction(&self, txn: BrokerTransaction) {
        self.transactions.lock().push(txn);
    }

    pub fn placed_orders(&self) -> Vec<(String, OrderSpec)> {
        self.placed.lock().clone()
    }
}

#[async_trait]
impl BrokerSession for StubBroker {
    async fn list_positions(&self, _account: &str, _include_marks: bool) -> Result<Vec<BrokerPosition>, BrokerError> {
        Ok(self.positions.lock().clone())
    }

    async fn get_order_history(
        &self,
        _account: &str,
        _start_date: DateTime<Utc>,
        _per_page: u32,
        page_offset: u32,
    ) -> Result<Vec<PlacedOrder>, BrokerError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let pages = self.history_pages.lock();
        Ok(pages.get(page_offset as usize).cloned().unwrap_or_default())
    }

    async fn get_order(&self, _account: &str, order_id: &str) -> Result<Option<PlacedOrder>, BrokerError> {
        Ok(self.orders_by_id.lock().get(order_id).cloned())
    }

    async fn get_live_orders(&self, _account: &str) -> Result<Vec<PlacedOrder>, BrokerError> {
        Ok(self.live_orders.lock().clone())
    }

    async fn get_order_chains(
        &self,
        _account: &str,
        _symbol: &str,
        _start_time: DateTime<Utc>,
        _end_time: DateTime<Utc>,
    ) -> Result<Vec<OrderChain>, BrokerError> {
        Ok(vec![])
    }

    async fn get_transactions(
        &self,
        _account: &str,
        _start_date: DateTime<Utc>,
    ) -> Result<Vec<BrokerTransaction>, BrokerError> {
        Ok(self.transactions.lock().clone())
    }

    async fn place_order(&self, account: &str, spec: OrderSpec) -> Result<PlaceOrderResult, BrokerError> {
        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        let order_id = format!("NEWORD{id}");
        self.placed.lock().push((account.to_string(), spec));
        Ok(PlaceOrderResult {
            order_id,
            status: OrderStatus::Live,
        })
    }

    async fn cancel_order(&self, _account: &str, _order_id: &str) -> Result<OrderStatus, BrokerError> {
        Ok(OrderStatus::Cancelled)
    }
}
