//! XTS broker client: Interactive REST (orders) + Market Data (quotes, feed).
//!
//! Two authenticated sessions back this client. The interactive token is
//! shared with sibling engine processes through `SessionStore`; the market
//! data token feeds both the REST quote fallback and the WebSocket cache.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::feed::{value_f64, value_i64, TouchlineFeed, STALENESS_THRESHOLD};
use super::session::SessionStore;
use super::{normalize_status, BrokerApi, NormalizedOrder, OrderRequest, OrderSide, Quote};
use crate::config::BrokerCredentials;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const WS_CONNECT_WAIT: Duration = Duration::from_millis(250);
const WS_CONNECT_ATTEMPTS: u32 = 20;

pub struct XtsClient {
    http: reqwest::Client,
    creds: BrokerCredentials,
    /// Vendor segment string for order routing, e.g. "NSECM".
    exchange_segment: String,
    /// Numeric segment code for market data requests.
    segment_code: i64,
    session: SessionStore,

    token: RwLock<Option<String>>,
    user_id: RwLock<String>,
    md_token: RwLock<Option<String>>,
    md_user_id: RwLock<String>,

    /// symbol -> exchangeInstrumentID, built at connect time.
    instruments: RwLock<HashMap<String, i64>>,
    feed: RwLock<Option<Arc<TouchlineFeed>>>,
}

impl XtsClient {
    pub fn new(creds: BrokerCredentials, exchange: &str, session_file: &Path) -> Self {
        let (segment, code) = match exchange {
            "BSE" | "BSECM" => ("BSECM", 2),
            _ => ("NSECM", 1),
        };
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent("gridbot/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            creds,
            exchange_segment: segment.to_string(),
            segment_code: code,
            session: SessionStore::new(session_file),
            token: RwLock::new(None),
            user_id: RwLock::new(String::new()),
            md_token: RwLock::new(None),
            md_user_id: RwLock::new(String::new()),
            instruments: RwLock::new(HashMap::new()),
            feed: RwLock::new(None),
        }
    }

    // ----- REST plumbing -----

    async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        token: Option<String>,
        body: Option<Value>,
        query: Option<&[(&str, String)]>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.creds.root_url, path);
        let mut req = self.http.request(method, &url);
        if let Some(token) = token {
            req = req.header("authorization", token);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        if let Some(query) = query {
            req = req.query(query);
        }
        let resp = req.send().await.with_context(|| format!("request {}", path))?;
        let status = resp.status();
        let value: Value = resp
            .json()
            .await
            .with_context(|| format!("parse response from {} (status {})", path, status))?;
        Ok(value)
    }

    /// Unwrap the `{type, description, result}` envelope.
    fn envelope_result(value: Value, what: &str) -> Result<Value> {
        let kind = value.get("type").and_then(|v| v.as_str()).unwrap_or("");
        if kind != "success" {
            let description = value
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown broker error");
            bail!("{} failed: {}", what, description);
        }
        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    }

    // ----- Sessions -----

    async fn interactive_login(&self) -> Result<()> {
        let body = json!({
            "appKey": self.creds.interactive_key,
            "secretKey": self.creds.interactive_secret,
            "source": "WEBAPI",
        });
        let value = self
            .call(reqwest::Method::POST, "/interactive/user/session", None, Some(body), None)
            .await?;
        let result = Self::envelope_result(value, "interactive login")?;
        let token = result
            .get("token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("interactive login: no token in response"))?
            .to_string();
        let user_id = result
            .get("userID")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let is_investor = result
            .get("isInvestorClient")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        *self.token.write() = Some(token.clone());
        *self.user_id.write() = user_id.clone();
        self.session.save_logged(&token, &user_id, is_investor);
        info!("interactive fresh login OK: userID={}", user_id);
        Ok(())
    }

    async fn marketdata_login(&self) -> Result<()> {
        let body = json!({
            "appKey": self.creds.marketdata_key,
            "secretKey": self.creds.marketdata_secret,
            "source": "WEBAPI",
        });
        let value = self
            .call(reqwest::Method::POST, "/apimarketdata/auth/login", None, Some(body), None)
            .await?;
        let result = Self::envelope_result(value, "market data login")?;
        let token = result
            .get("token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("market data login: no token in response"))?
            .to_string();
        let user_id = result
            .get("userID")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        *self.md_token.write() = Some(token);
        *self.md_user_id.write() = user_id.clone();
        info!("market data login OK: userID={}", user_id);
        Ok(())
    }

    /// Adopt the shared session file if its token still works.
    async fn try_reuse_session(&self) -> bool {
        let Some(record) = self.session.load_fresh() else {
            return false;
        };
        *self.token.write() = Some(record.token.clone());
        *self.user_id.write() = record.user_id.clone();
        match self.fetch_order_book().await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "session file token failed probe");
                false
            }
        }
    }

    // ----- Instruments -----

    async fn resolve_instrument(&self, symbol: &str) -> Result<i64> {
        let symbol = symbol.to_uppercase();
        if let Some(id) = self.instruments.read().get(&symbol) {
            return Ok(*id);
        }
        let md_token = self.md_token.read().clone();
        let value = self
            .call(
                reqwest::Method::GET,
                "/apimarketdata/search/instruments",
                md_token,
                None,
                Some(&[("searchString", symbol.clone())]),
            )
            .await?;
        let result = Self::envelope_result(value, "instrument search")?;
        let hits = result
            .as_array()
            .cloned()
            .unwrap_or_default();
        if hits.is_empty() {
            bail!("{} not found in instrument search", symbol);
        }

        // Prefer the equity segment hit; fall back to the first result.
        let pick = hits
            .iter()
            .find(|h| {
                h.get("ExchangeSegment").and_then(|v| v.as_str()) == Some(&self.exchange_segment)
                    && h.get("ExchangeInstrumentID").and_then(value_i64).is_some()
            })
            .or_else(|| {
                hits.iter()
                    .find(|h| h.get("ExchangeInstrumentID").and_then(value_i64).is_some())
            })
            .ok_or_else(|| anyhow!("no usable instrument id for {}", symbol))?;

        let id = pick
            .get("ExchangeInstrumentID")
            .and_then(value_i64)
            .ok_or_else(|| anyhow!("no usable instrument id for {}", symbol))?;
        info!("resolved {}: exchangeInstrumentID={}", symbol, id);
        self.instruments.write().insert(symbol, id);
        Ok(id)
    }

    async fn subscribe_touchline(&self, instrument_ids: &[i64]) {
        let instruments: Vec<Value> = instrument_ids
            .iter()
            .map(|id| json!({"exchangeSegment": self.segment_code, "exchangeInstrumentID": id}))
            .collect();
        let body = json!({"instruments": instruments, "xtsMessageCode": 1501});
        let md_token = self.md_token.read().clone();
        match self
            .call(
                reqwest::Method::POST,
                "/apimarketdata/instruments/subscription",
                md_token,
                Some(body),
                None,
            )
            .await
            .and_then(|v| Self::envelope_result(v, "touchline subscription"))
        {
            Ok(_) => info!("subscribed {} instruments to touchline (1501)", instrument_ids.len()),
            Err(e) => error!(error = %e, "touchline subscription failed"),
        }
    }

    // ----- Quotes -----

    async fn rest_quote(&self, symbol: &str) -> Option<Quote> {
        let symbol = symbol.to_uppercase();
        let instrument_id = match self.instruments.read().get(&symbol) {
            Some(id) => *id,
            None => {
                error!("cannot quote {}: instrument not resolved", symbol);
                return None;
            }
        };
        let md_token = self.md_token.read().clone();
        let body = json!({
            "instruments": [{"exchangeSegment": self.segment_code, "exchangeInstrumentID": instrument_id}],
            "xtsMessageCode": 1501,
            "publishFormat": "JSON",
        });
        let result = match self
            .call(reqwest::Method::POST, "/apimarketdata/instruments/quotes", md_token, Some(body), None)
            .await
            .and_then(|v| Self::envelope_result(v, "quote"))
        {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "REST quote failed for {}", symbol);
                return None;
            }
        };

        let quotes = result.get("listQuotes")?.as_array()?.first()?.clone();
        // listQuotes entries are usually JSON strings.
        let data: Value = match quotes {
            Value::String(raw) => serde_json::from_str(&raw).ok()?,
            other => other,
        };
        let (ltp, best_bid, best_ask) = touchline_prices(&data);
        if ltp <= 0.0 {
            return None;
        }
        if let Some(feed) = self.feed.read().clone() {
            feed.store(&symbol, ltp, best_bid, best_ask);
        }
        Some(Quote { ltp, best_bid, best_ask })
    }

    async fn fetch_order_book(&self) -> Result<Vec<Value>> {
        let token = self.token.read().clone();
        let value = self
            .call(reqwest::Method::GET, "/interactive/orders", token, None, None)
            .await?;
        let result = Self::envelope_result(value, "order book fetch")?;
        Ok(result.as_array().cloned().unwrap_or_default())
    }
}

/// Extract (ltp, best_bid, best_ask) from a touchline-shaped payload.
fn touchline_prices(data: &Value) -> (f64, f64, f64) {
    let touchline = data.get("Touchline").unwrap_or(data);
    let ltp = touchline
        .get("LastTradedPrice")
        .and_then(value_f64)
        .unwrap_or(0.0);
    let mut bid = touchline
        .get("BidInfo")
        .and_then(|b| b.get("Price"))
        .and_then(value_f64)
        .unwrap_or(0.0);
    let mut ask = touchline
        .get("AskInfo")
        .and_then(|a| a.get("Price"))
        .and_then(value_f64)
        .unwrap_or(0.0);
    if bid == 0.0 {
        bid = touchline.get("BestBidPrice").and_then(value_f64).unwrap_or(0.0);
    }
    if ask == 0.0 {
        ask = touchline.get("BestAskPrice").and_then(value_f64).unwrap_or(0.0);
    }
    (ltp, bid, ask)
}

fn normalize_order(raw: &Value) -> NormalizedOrder {
    let vendor_status = raw.get("OrderStatus").and_then(|v| v.as_str()).unwrap_or("");
    let side = match raw.get("OrderSide").and_then(|v| v.as_str()) {
        Some("BUY") => Some(OrderSide::Buy),
        Some("SELL") => Some(OrderSide::Sell),
        _ => None,
    };
    NormalizedOrder {
        order_id: raw
            .get("AppOrderID")
            .and_then(value_i64)
            .map(|id| id.to_string())
            .unwrap_or_default(),
        status: normalize_status(vendor_status),
        average_price: raw
            .get("OrderAverageTradedPrice")
            .and_then(value_f64)
            .unwrap_or(0.0),
        filled_quantity: raw
            .get("CumulativeQuantity")
            .and_then(value_i64)
            .unwrap_or(0),
        quantity: raw.get("OrderQuantity").and_then(value_i64).unwrap_or(0),
        status_message: raw
            .get("CancelRejectReason")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        side,
        client_tag: raw
            .get("OrderUniqueIdentifier")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
    }
}

#[async_trait]
impl BrokerApi for XtsClient {
    async fn connect(&self, symbols: &[String]) -> Result<()> {
        // Interactive: reuse the shared session or login fresh.
        if self.try_reuse_session().await {
            info!("interactive session reused: userID={}", self.user_id.read());
        } else {
            self.interactive_login().await.context("interactive login")?;
        }

        self.marketdata_login().await.context("market data login")?;

        let mut instrument_ids = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let id = self
                .resolve_instrument(symbol)
                .await
                .with_context(|| format!("resolve {}", symbol))?;
            instrument_ids.push((id, symbol.to_uppercase()));
        }

        // Spawn the touchline feed and wait briefly for the socket.
        let md_token = self.md_token.read().clone().unwrap_or_default();
        let md_user = self.md_user_id.read().clone();
        let ws_root = self
            .creds
            .root_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        let url = format!(
            "{}/apimarketdata/socket.io/?EIO=3&transport=websocket&token={}&userID={}&publishFormat=JSON&broadcastMode=Full",
            ws_root, md_token, md_user
        );
        let feed = TouchlineFeed::spawn(url);
        for (id, symbol) in &instrument_ids {
            feed.track(*id, symbol);
        }
        *self.feed.write() = Some(feed.clone());

        for _ in 0..WS_CONNECT_ATTEMPTS {
            if feed.is_connected() {
                break;
            }
            sleep(WS_CONNECT_WAIT).await;
        }
        if feed.is_connected() {
            info!("market data WS connected");
        } else {
            warn!("market data WS did not connect within 5s; REST fallback remains available");
        }

        let ids: Vec<i64> = instrument_ids.iter().map(|(id, _)| *id).collect();
        self.subscribe_touchline(&ids).await;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(feed) = self.feed.read().clone() {
            feed.stop();
        }
        info!("broker client disconnected");
    }

    async fn ltp(&self, symbol: &str) -> Option<f64> {
        if let Some(feed) = self.feed.read().clone() {
            if let Some(entry) = feed.fresh(symbol, STALENESS_THRESHOLD) {
                return Some(entry.ltp);
            }
        }
        self.rest_quote(symbol).await.map(|q| q.ltp)
    }

    async fn quote(&self, symbol: &str) -> Option<Quote> {
        if let Some(feed) = self.feed.read().clone() {
            if let Some(entry) = feed.fresh(symbol, STALENESS_THRESHOLD) {
                return Some(Quote {
                    ltp: entry.ltp,
                    best_bid: entry.best_bid,
                    best_ask: entry.best_ask,
                });
            }
        }
        self.rest_quote(symbol).await
    }

    async fn place_order(&self, req: &OrderRequest) -> Option<String> {
        let instrument_id = match self.instruments.read().get(&req.symbol.to_uppercase()) {
            Some(id) => *id,
            None => {
                error!("ORDER FAILED: cannot resolve {}", req.symbol);
                return None;
            }
        };
        let token = self.token.read().clone();
        let body = json!({
            "exchangeSegment": self.exchange_segment,
            "exchangeInstrumentID": instrument_id,
            "productType": req.product,
            "orderType": "LIMIT",
            "orderSide": req.side.as_str(),
            "timeInForce": "DAY",
            "disclosedQuantity": 0,
            "orderQuantity": req.qty,
            "limitPrice": req.price,
            "stopPrice": 0,
            "orderUniqueIdentifier": req.client_tag,
            "apiOrderSource": "WebAPI",
        });
        match self
            .call(reqwest::Method::POST, "/interactive/orders", token, Some(body), None)
            .await
            .and_then(|v| Self::envelope_result(v, "place order"))
        {
            Ok(result) => {
                let order_id = result.get("AppOrderID").and_then(value_i64)?.to_string();
                info!(
                    "ORDER PLACED: {} {} {} @ {:.2} -> AppOrderID={}",
                    req.side, req.symbol, req.qty, req.price, order_id
                );
                Some(order_id)
            }
            Err(e) => {
                error!(
                    error = %e,
                    "ORDER FAILED: {} {} {} @ {:.2}",
                    req.side, req.symbol, req.qty, req.price
                );
                None
            }
        }
    }

    async fn cancel_order(&self, order_id: &str) -> bool {
        let token = self.token.read().clone();
        let query = [
            ("appOrderID", order_id.to_string()),
            ("orderUniqueIdentifier", format!("CXL_{}", order_id)),
        ];
        match self
            .call(reqwest::Method::DELETE, "/interactive/orders", token, None, Some(&query))
            .await
            .and_then(|v| Self::envelope_result(v, "cancel order"))
        {
            Ok(_) => {
                info!("ORDER CANCELLED: {}", order_id);
                true
            }
            Err(e) => {
                error!(error = %e, "CANCEL FAILED: {}", order_id);
                false
            }
        }
    }

    async fn orders(&self) -> Result<Vec<NormalizedOrder>> {
        let raw = self.fetch_order_book().await?;
        Ok(raw.iter().map(normalize_order).collect())
    }

    async fn refresh_session(&self) -> bool {
        // Re-read the shared file first: a sibling process may already have
        // refreshed, and a fresh login here would invalidate its token.
        if self.try_reuse_session().await {
            info!("picked up session from shared file, no login needed");
            return true;
        }
        match self.interactive_login().await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "session refresh failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_book_rows_normalise_with_string_numerics() {
        let raw = json!({
            "AppOrderID": 1128899,
            "OrderStatus": "PartiallyFilled",
            "OrderAverageTradedPrice": "99.90",
            "CumulativeQuantity": "6",
            "OrderQuantity": 10,
            "CancelRejectReason": "",
            "OrderSide": "BUY",
            "OrderUniqueIdentifier": "EN-BL0C1-abc12345",
        });
        let order = normalize_order(&raw);
        assert_eq!(order.order_id, "1128899");
        assert_eq!(order.status, super::super::OrderStatus::Partial);
        assert_eq!(order.average_price, 99.90);
        assert_eq!(order.filled_quantity, 6);
        assert_eq!(order.quantity, 10);
        assert_eq!(order.side, Some(OrderSide::Buy));
        assert_eq!(order.client_tag, "EN-BL0C1-abc12345");
    }

    #[test]
    fn rejected_row_carries_reason() {
        let raw = json!({
            "AppOrderID": 42,
            "OrderStatus": "Rejected",
            "CancelRejectReason": "margin exceeded",
            "OrderSide": "SELL",
        });
        let order = normalize_order(&raw);
        assert_eq!(order.status, super::super::OrderStatus::Rejected);
        assert_eq!(order.status_message, "margin exceeded");
    }

    #[test]
    fn envelope_error_surfaces_description() {
        let value = json!({"type": "error", "description": "Invalid Token"});
        let err = XtsClient::envelope_result(value, "order book fetch").unwrap_err();
        assert!(err.to_string().contains("Invalid Token"));
    }

    #[test]
    fn touchline_prices_fall_back_to_flat_fields() {
        let data = json!({
            "LastTradedPrice": 12.5,
            "BestBidPrice": 12.4,
            "BestAskPrice": 12.6,
        });
        let (ltp, bid, ask) = touchline_prices(&data);
        assert_eq!((ltp, bid, ask), (12.5, 12.4, 12.6));
    }
}
