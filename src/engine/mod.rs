//! Shared engine plumbing.
//!
//! `FillRouter` turns the broker's repeated order-book snapshots into
//! idempotent updates; `SessionSentinel` decides when the shared broker
//! session needs a proactive or reactive refresh.

pub mod grid;
pub mod pairs;

#[cfg(test)]
pub mod mock;
#[cfg(test)]
mod grid_tests;

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::broker::NormalizedOrder;

pub const SESSION_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const POLL_ERROR_THRESHOLD: u32 = 5;
pub const REANCHOR_COOLDOWN: Duration = Duration::from_secs(60);

/// Deduplicates order-book snapshot rows.
///
/// The cache key includes `filled_quantity`, which is what turns repeated
/// partial-fill observations into monotone increments: a row is surfaced
/// again only when its status or cumulative fill changes.
#[derive(Debug, Default)]
pub struct FillRouter {
    seen: HashMap<String, String>,
}

impl FillRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows not yet processed under their current (status, filled) key,
    /// in the broker's returned order.
    pub fn fresh_updates(&mut self, orders: &[NormalizedOrder]) -> Vec<NormalizedOrder> {
        let mut fresh = Vec::new();
        for order in orders {
            if order.order_id.is_empty() {
                continue;
            }
            let key = format!("{:?}:{}", order.status, order.filled_quantity);
            if self.seen.get(&order.order_id) == Some(&key) {
                continue;
            }
            self.seen.insert(order.order_id.clone(), key);
            fresh.push(order.clone());
        }
        fresh
    }

    /// Forget everything; used when the ladder is torn down on re-anchor.
    pub fn reset(&mut self) {
        self.seen.clear();
    }
}

/// Session upkeep bookkeeping for the poll loop.
#[derive(Debug)]
pub struct SessionSentinel {
    last_refresh: Instant,
    refresh_interval: Duration,
    consecutive_errors: u32,
    error_threshold: u32,
}

impl SessionSentinel {
    pub fn new() -> Self {
        Self {
            last_refresh: Instant::now(),
            refresh_interval: SESSION_REFRESH_INTERVAL,
            consecutive_errors: 0,
            error_threshold: POLL_ERROR_THRESHOLD,
        }
    }

    pub fn refresh_due(&self) -> bool {
        self.last_refresh.elapsed() >= self.refresh_interval
    }

    pub fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
        self.consecutive_errors = 0;
    }

    /// Record one poll error; true when the reactive threshold is hit.
    pub fn record_error(&mut self) -> bool {
        self.consecutive_errors += 1;
        self.consecutive_errors >= self.error_threshold
    }

    pub fn clear_errors(&mut self) {
        self.consecutive_errors = 0;
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }
}

impl Default for SessionSentinel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{OrderSide, OrderStatus};

    fn order(id: &str, status: OrderStatus, filled: i64) -> NormalizedOrder {
        NormalizedOrder {
            order_id: id.to_string(),
            status,
            average_price: 99.9,
            filled_quantity: filled,
            quantity: 10,
            status_message: String::new(),
            side: Some(OrderSide::Buy),
            client_tag: String::new(),
        }
    }

    #[test]
    fn identical_snapshot_is_processed_once() {
        let mut router = FillRouter::new();
        let snapshot = vec![order("1", OrderStatus::Complete, 10)];
        assert_eq!(router.fresh_updates(&snapshot).len(), 1);
        assert_eq!(router.fresh_updates(&snapshot).len(), 0);
    }

    #[test]
    fn filled_qty_change_surfaces_again() {
        let mut router = FillRouter::new();
        assert_eq!(
            router
                .fresh_updates(&[order("1", OrderStatus::Partial, 4)])
                .len(),
            1
        );
        // Same status, more fills: must be surfaced for the increment.
        assert_eq!(
            router
                .fresh_updates(&[order("1", OrderStatus::Partial, 7)])
                .len(),
            1
        );
        // Status change on the same fill count too.
        assert_eq!(
            router
                .fresh_updates(&[order("1", OrderStatus::Complete, 7)])
                .len(),
            1
        );
    }

    #[test]
    fn broker_order_is_preserved() {
        let mut router = FillRouter::new();
        let fresh = router.fresh_updates(&[
            order("b", OrderStatus::Complete, 10),
            order("a", OrderStatus::Complete, 10),
        ]);
        let ids: Vec<_> = fresh.iter().map(|o| o.order_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn reset_forgets_history() {
        let mut router = FillRouter::new();
        let snapshot = vec![order("1", OrderStatus::Complete, 10)];
        router.fresh_updates(&snapshot);
        router.reset();
        assert_eq!(router.fresh_updates(&snapshot).len(), 1);
    }

    #[test]
    fn sentinel_triggers_after_threshold() {
        let mut sentinel = SessionSentinel::new();
        for _ in 0..POLL_ERROR_THRESHOLD - 1 {
            assert!(!sentinel.record_error());
        }
        assert!(sentinel.record_error());
        sentinel.clear_errors();
        assert_eq!(sentinel.consecutive_errors(), 0);
    }
}
