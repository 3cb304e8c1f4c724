//! XTS market-data touchline cache.
//!
//! The XTS feed is Socket.IO (Engine.IO v3) over a plain WebSocket, so we
//! skip any Socket.IO client library and speak the text framing directly:
//! `0{...}` open, `2`/`3` ping-pong, `40` namespace ack, and
//! `42["1501-json-full", payload]` touchline events. A single background
//! task owns the connection and writes into a lock-guarded cache; engine
//! reads snapshot under the same lock and fall back to REST when stale.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// How long a cached touchline stays usable before REST fallback.
pub const STALENESS_THRESHOLD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct TouchlineEntry {
    pub ltp: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub at: Instant,
}

pub struct TouchlineFeed {
    quotes: RwLock<HashMap<String, TouchlineEntry>>,
    /// Reverse map built at subscription time: instrument id -> symbol.
    instruments: RwLock<HashMap<i64, String>>,
    connected: RwLock<bool>,
    stop_tx: watch::Sender<bool>,
}

impl TouchlineFeed {
    /// Spawn the feed worker for an already-authenticated market-data URL.
    pub fn spawn(url: String) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let feed = Arc::new(Self {
            quotes: RwLock::new(HashMap::new()),
            instruments: RwLock::new(HashMap::new()),
            connected: RwLock::new(false),
            stop_tx,
        });

        let worker = feed.clone();
        tokio::spawn(async move {
            worker.run(url, stop_rx).await;
            debug!("touchline feed worker exited");
        });

        feed
    }

    /// Register an instrument so its events can be routed back to a symbol.
    pub fn track(&self, instrument_id: i64, symbol: &str) {
        self.instruments
            .write()
            .insert(instrument_id, symbol.to_uppercase());
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Cached touchline if it is younger than `max_age`.
    pub fn fresh(&self, symbol: &str, max_age: Duration) -> Option<TouchlineEntry> {
        let quotes = self.quotes.read();
        let entry = quotes.get(&symbol.to_uppercase())?;
        if entry.at.elapsed() > max_age {
            debug!(
                "cached touchline for {} is stale ({:.1}s old)",
                symbol,
                entry.at.elapsed().as_secs_f64()
            );
            return None;
        }
        Some(*entry)
    }

    /// Store a touchline; also used by the REST fallback to refill the cache.
    pub fn store(&self, symbol: &str, ltp: f64, best_bid: f64, best_ask: f64) {
        if ltp <= 0.0 {
            return;
        }
        self.quotes.write().insert(
            symbol.to_uppercase(),
            TouchlineEntry {
                ltp,
                best_bid,
                best_ask,
                at: Instant::now(),
            },
        );
    }

    async fn run(self: Arc<Self>, url: String, mut stop_rx: watch::Receiver<bool>) {
        let mut reconnect_delay = Duration::from_secs(1);
        let max_reconnect_delay = Duration::from_secs(30);

        loop {
            if *stop_rx.borrow() {
                return;
            }
            match self.connect_and_stream(&url, &mut stop_rx).await {
                Ok(_) => return, // clean stop
                Err(e) => {
                    *self.connected.write() = false;
                    warn!(error = %e, "market data WS disconnected; reconnecting");
                    tokio::select! {
                        _ = sleep(reconnect_delay) => {}
                        _ = stop_rx.changed() => return,
                    }
                    reconnect_delay = (reconnect_delay * 2).min(max_reconnect_delay);
                }
            }
        }
    }

    async fn connect_and_stream(
        &self,
        url: &str,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        info!("connecting to market data WS");
        let (ws_stream, resp) = connect_async(url).await.context("connect market data ws")?;
        info!("market data WS connected (status={})", resp.status());
        *self.connected.write() = true;

        let (mut write, mut read) = ws_stream.split();

        // Engine.IO v3: the client drives the ping cycle.
        let mut ping = interval(Duration::from_secs(25));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    let _ = write.send(Message::Text("2".to_string())).await;
                }
                _ = stop_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    *self.connected.write() = false;
                    return Ok(());
                }
                ws_msg = read.next() => {
                    let Some(ws_msg) = ws_msg else {
                        return Err(anyhow!("market data ws stream ended"));
                    };
                    match ws_msg {
                        Ok(Message::Text(text)) => {
                            if text == "2" {
                                let _ = write.send(Message::Text("3".to_string())).await;
                            } else {
                                self.handle_frame(&text);
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "market data ws close");
                            return Err(anyhow!("market data ws closed by server"));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(anyhow!("market data ws error: {e}"));
                        }
                    }
                }
            }
        }
    }

    /// Decode one Engine.IO text frame; only `42[...]` events matter.
    fn handle_frame(&self, text: &str) {
        let Some(body) = text.strip_prefix("42") else {
            // "0{...}" open and "40" namespace ack carry no market data.
            return;
        };
        let parsed: Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "unparseable socket.io event frame");
                return;
            }
        };
        let Some(items) = parsed.as_array() else {
            return;
        };
        let event = items.first().and_then(|v| v.as_str()).unwrap_or("");
        if event != "1501-json-full" {
            return;
        }
        let Some(payload) = items.get(1) else {
            return;
        };
        // Payload may arrive as a JSON string or an inline object.
        let owned;
        let data: &Value = match payload {
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(v) => {
                    owned = v;
                    &owned
                }
                Err(e) => {
                    debug!(error = %e, "touchline payload parse error");
                    return;
                }
            },
            other => other,
        };
        self.apply_touchline(data);
    }

    fn apply_touchline(&self, data: &Value) {
        let touchline = data.get("Touchline").unwrap_or(data);

        let instrument_id = touchline
            .get("ExchangeInstrumentID")
            .or_else(|| data.get("ExchangeInstrumentID"))
            .and_then(value_i64);
        let Some(instrument_id) = instrument_id else {
            return;
        };
        let symbol = match self.instruments.read().get(&instrument_id) {
            Some(s) => s.clone(),
            None => return, // not one of ours
        };

        let ltp = touchline
            .get("LastTradedPrice")
            .and_then(value_f64)
            .unwrap_or(0.0);
        let mut best_bid = touchline
            .get("BidInfo")
            .and_then(|b| b.get("Price"))
            .and_then(value_f64)
            .unwrap_or(0.0);
        let mut best_ask = touchline
            .get("AskInfo")
            .and_then(|a| a.get("Price"))
            .and_then(value_f64)
            .unwrap_or(0.0);
        // Some feed versions publish flat fields instead.
        if best_bid == 0.0 {
            best_bid = touchline
                .get("BestBidPrice")
                .and_then(value_f64)
                .unwrap_or(0.0);
        }
        if best_ask == 0.0 {
            best_ask = touchline
                .get("BestAskPrice")
                .and_then(value_f64)
                .unwrap_or(0.0);
        }

        if ltp > 0.0 {
            self.store(&symbol, ltp, best_bid, best_ask);
            debug!(
                "touchline {}: ltp={:.2} bid={:.2} ask={:.2}",
                symbol, ltp, best_bid, best_ask
            );
        }
    }
}

/// Numeric field that may arrive as a JSON number or a string.
pub fn value_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn value_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_feed() -> Arc<TouchlineFeed> {
        let (stop_tx, _stop_rx) = watch::channel(false);
        Arc::new(TouchlineFeed {
            quotes: RwLock::new(HashMap::new()),
            instruments: RwLock::new(HashMap::new()),
            connected: RwLock::new(false),
            stop_tx,
        })
    }

    #[test]
    fn touchline_event_lands_in_cache() {
        let feed = test_feed();
        feed.track(22, "TESTSYM");
        feed.handle_frame(
            r#"42["1501-json-full",{"Touchline":{"ExchangeInstrumentID":22,"LastTradedPrice":101.5,"BidInfo":{"Price":101.4},"AskInfo":{"Price":101.6}}}]"#,
        );
        let entry = feed.fresh("TESTSYM", STALENESS_THRESHOLD).expect("entry");
        assert_eq!(entry.ltp, 101.5);
        assert_eq!(entry.best_bid, 101.4);
        assert_eq!(entry.best_ask, 101.6);
    }

    #[test]
    fn string_payload_and_flat_fields_parse() {
        let feed = test_feed();
        feed.track(7, "OTHER");
        let inner = r#"{"ExchangeInstrumentID":"7","LastTradedPrice":"55.20","BestBidPrice":"55.10","BestAskPrice":"55.30"}"#;
        let frame = format!("42[\"1501-json-full\",{}]", serde_json::to_string(inner).unwrap());
        feed.handle_frame(&frame);
        let entry = feed.fresh("OTHER", STALENESS_THRESHOLD).expect("entry");
        assert_eq!(entry.ltp, 55.20);
        assert_eq!(entry.best_bid, 55.10);
    }

    #[test]
    fn untracked_instrument_is_ignored() {
        let feed = test_feed();
        feed.handle_frame(
            r#"42["1501-json-full",{"ExchangeInstrumentID":99,"LastTradedPrice":10.0}]"#,
        );
        assert!(feed.quotes.read().is_empty());
    }

    #[test]
    fn zero_ltp_never_cached() {
        let feed = test_feed();
        feed.store("TESTSYM", 0.0, 1.0, 2.0);
        assert!(feed.fresh("TESTSYM", STALENESS_THRESHOLD).is_none());
    }

    #[test]
    fn control_frames_are_noise() {
        let feed = test_feed();
        feed.handle_frame(r#"0{"sid":"abc","pingInterval":25000}"#);
        feed.handle_frame("40");
        feed.handle_frame("3");
        assert!(feed.quotes.read().is_empty());
    }
}
