//! Broker capability surface shared by all engines.
//!
//! Engines talk to a `BrokerApi` trait object; the production implementation
//! is the XTS REST + WebSocket client in `xts.rs`. Vendor order statuses are
//! normalised here so the fill state machines never see raw broker strings.

pub mod feed;
pub mod session;
pub mod xts;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use xts::XtsClient;

/// Round a price to the exchange tick (two decimals for NSE equities).
pub fn round_tick(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Open,
    Partial,
    Complete,
    Cancelled,
    Rejected,
}

/// Map a vendor order status onto the normalised set.
///
/// Unknown statuses map to `Open` so the order stays tracked.
pub fn normalize_status(vendor: &str) -> OrderStatus {
    match vendor {
        "New" | "PendingNew" | "Open" | "Replaced" | "PendingReplace" => OrderStatus::Open,
        "PartiallyFilled" => OrderStatus::Partial,
        "Filled" => OrderStatus::Complete,
        "Cancelled" | "PendingCancel" => OrderStatus::Cancelled,
        "Rejected" => OrderStatus::Rejected,
        _ => OrderStatus::Open,
    }
}

/// A day order in engine-normalised form.
#[derive(Debug, Clone)]
pub struct NormalizedOrder {
    pub order_id: String,
    pub status: OrderStatus,
    pub average_price: f64,
    pub filled_quantity: i64,
    pub quantity: i64,
    pub status_message: String,
    pub side: Option<OrderSide>,
    pub client_tag: String,
}

/// Touchline snapshot: last trade plus best bid/ask.
#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub ltp: f64,
    pub best_bid: f64,
    pub best_ask: f64,
}

/// A DAY-validity LIMIT order request.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: i64,
    pub price: f64,
    pub product: String,
    pub client_tag: String,
}

/// Stable capability set over a vendor broker API.
///
/// Market-data reads return `None` on failure, order placement returns the
/// broker-assigned id or `None`; `orders()` returns an error (not an empty
/// list) when the broker is unreachable so callers can trigger a session
/// refresh.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Login, resolve instruments, open the market-data feed and subscribe.
    async fn connect(&self, symbols: &[String]) -> Result<()>;

    async fn disconnect(&self);

    /// Last traded price: WebSocket cache first, REST fallback.
    async fn ltp(&self, symbol: &str) -> Option<f64>;

    /// Full quote (LTP, best bid, best ask), same dual path as `ltp`.
    async fn quote(&self, symbol: &str) -> Option<Quote>;

    async fn place_order(&self, req: &OrderRequest) -> Option<String>;

    async fn cancel_order(&self, order_id: &str) -> bool;

    /// Every order of the day, normalised.
    async fn orders(&self) -> Result<Vec<NormalizedOrder>>;

    /// Re-read the shared session file first; only fresh-login if that is
    /// also invalid. Returns true if a usable session is in place after.
    async fn refresh_session(&self) -> bool;

    /// Market-like order: aggressive LIMIT at LTP +/- slippage.
    ///
    /// Returns the broker order id and the limit price used.
    async fn place_aggressive(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: i64,
        product: &str,
        client_tag: &str,
        slippage: f64,
    ) -> Option<(String, f64)> {
        let ltp = self.ltp(symbol).await?;
        let price = match side {
            OrderSide::Buy => round_tick(ltp + slippage),
            OrderSide::Sell => round_tick(ltp - slippage),
        };
        let price = price.max(0.05);
        let order_id = self
            .place_order(&OrderRequest {
                symbol: symbol.to_string(),
                side,
                qty,
                price,
                product: product.to_string(),
                client_tag: client_tag.to_string(),
            })
            .await?;
        Some((order_id, price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_statuses_normalise() {
        assert_eq!(normalize_status("Filled"), OrderStatus::Complete);
        assert_eq!(normalize_status("PartiallyFilled"), OrderStatus::Partial);
        assert_eq!(normalize_status("Rejected"), OrderStatus::Rejected);
        assert_eq!(normalize_status("PendingCancel"), OrderStatus::Cancelled);
        assert_eq!(normalize_status("New"), OrderStatus::Open);
    }

    #[test]
    fn unknown_status_stays_tracked_as_open() {
        assert_eq!(normalize_status("Frozen"), OrderStatus::Open);
        assert_eq!(normalize_status(""), OrderStatus::Open);
    }

    #[test]
    fn tick_rounding() {
        assert_eq!(round_tick(99.904999), 99.90);
        assert_eq!(round_tick(99.905), 99.91);
        assert_eq!(round_tick(100.0), 100.0);
    }
}
