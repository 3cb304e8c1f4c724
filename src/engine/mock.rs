//! Scripted broker for engine scenario tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::broker::{BrokerApi, NormalizedOrder, OrderRequest, OrderStatus, Quote};

/// In-memory broker: records placements, serves a scripted order book.
#[derive(Default)]
pub struct MockBroker {
    pub placed: Mutex<Vec<OrderRequest>>,
    pub placed_ids: Mutex<Vec<String>>,
    pub cancelled: Mutex<Vec<String>>,
    pub book: Mutex<Vec<NormalizedOrder>>,
    pub ltps: Mutex<HashMap<String, f64>>,
    pub quotes: Mutex<HashMap<String, Quote>>,
    pub fail_order_fetch: AtomicBool,
    pub reject_placements: AtomicBool,
    pub refreshes: AtomicU64,
    next_id: AtomicU64,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ltp(&self, symbol: &str, ltp: f64) {
        self.ltps.lock().insert(symbol.to_uppercase(), ltp);
    }

    pub fn set_quote(&self, symbol: &str, quote: Quote) {
        self.quotes.lock().insert(symbol.to_uppercase(), quote);
        self.ltps.lock().insert(symbol.to_uppercase(), quote.ltp);
    }

    /// Latest placement matching a predicate, as (order_id, request).
    pub fn find_placed<F>(&self, pred: F) -> Option<(String, OrderRequest)>
    where
        F: Fn(&OrderRequest) -> bool,
    {
        let placed = self.placed.lock();
        let ids = self.placed_ids.lock();
        placed
            .iter()
            .zip(ids.iter())
            .rev()
            .find(|(req, _)| pred(req))
            .map(|(req, id)| (id.clone(), req.clone()))
    }

    pub fn last_placed_id(&self) -> Option<String> {
        self.placed_ids.lock().last().cloned()
    }

    pub fn placements(&self) -> usize {
        self.placed.lock().len()
    }

    /// Script a broker-side fill for an order already in the book, or add
    /// the row if the engine placed it without one.
    pub fn fill(&self, order_id: &str, filled: i64, avg_price: f64, complete: bool) {
        let status = if complete {
            OrderStatus::Complete
        } else {
            OrderStatus::Partial
        };
        let mut book = self.book.lock();
        if let Some(row) = book.iter_mut().find(|o| o.order_id == order_id) {
            row.status = status;
            row.filled_quantity = filled;
            row.average_price = avg_price;
        } else {
            book.push(NormalizedOrder {
                order_id: order_id.to_string(),
                status,
                average_price: avg_price,
                filled_quantity: filled,
                quantity: filled,
                status_message: String::new(),
                side: None,
                client_tag: String::new(),
            });
        }
    }

    pub fn reject(&self, order_id: &str, reason: &str) {
        let mut book = self.book.lock();
        if let Some(row) = book.iter_mut().find(|o| o.order_id == order_id) {
            row.status = OrderStatus::Rejected;
            row.status_message = reason.to_string();
        }
    }

    pub fn snapshot(&self) -> Vec<NormalizedOrder> {
        self.book.lock().clone()
    }
}

#[async_trait]
impl BrokerApi for MockBroker {
    async fn connect(&self, _symbols: &[String]) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn ltp(&self, symbol: &str) -> Option<f64> {
        self.ltps.lock().get(&symbol.to_uppercase()).copied()
    }

    async fn quote(&self, symbol: &str) -> Option<Quote> {
        self.quotes.lock().get(&symbol.to_uppercase()).copied()
    }

    async fn place_order(&self, req: &OrderRequest) -> Option<String> {
        if self.reject_placements.load(Ordering::SeqCst) {
            return None;
        }
        let id = format!("M{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.placed.lock().push(req.clone());
        self.placed_ids.lock().push(id.clone());
        self.book.lock().push(NormalizedOrder {
            order_id: id.clone(),
            status: OrderStatus::Open,
            average_price: 0.0,
            filled_quantity: 0,
            quantity: req.qty,
            status_message: String::new(),
            side: Some(req.side),
            client_tag: req.client_tag.clone(),
        });
        Some(id)
    }

    async fn cancel_order(&self, order_id: &str) -> bool {
        self.cancelled.lock().push(order_id.to_string());
        let mut book = self.book.lock();
        if let Some(row) = book.iter_mut().find(|o| o.order_id == order_id) {
            row.status = OrderStatus::Cancelled;
        }
        true
    }

    async fn orders(&self) -> Result<Vec<NormalizedOrder>> {
        if self.fail_order_fetch.load(Ordering::SeqCst) {
            bail!("broker unreachable");
        }
        Ok(self.snapshot())
    }

    async fn refresh_session(&self) -> bool {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        true
    }
}
