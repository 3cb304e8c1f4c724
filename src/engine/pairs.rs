//! Pair ratio mean-reversion engine.
//!
//! Samples numerator/denominator LTP ratios on a fixed cadence, computes
//! rolling mean and population sigma, and enters both legs simultaneously
//! when |z| exceeds the pair's threshold. Positions exit when the ratio
//! reverts to the rolling mean. No stop-loss; stacking is capped per pair.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{FillRouter, SessionSentinel};
use crate::broker::{BrokerApi, NormalizedOrder, OrderSide, OrderStatus};
use crate::config::{PairSpec, PairsConfig};
use crate::journal::pairs::{
    PairDirection, PairPosition, PairStatus, PairsJournal, RatioSample,
};

pub struct PairsEngine {
    cfg: PairsConfig,
    broker: Arc<dyn BrokerApi>,
    pub(crate) journal: PairsJournal,

    router: FillRouter,
    sentinel: SessionSentinel,
    last_sample: Option<Instant>,
    pub(crate) running: bool,
}

impl PairsEngine {
    pub fn new(cfg: PairsConfig, broker: Arc<dyn BrokerApi>) -> Self {
        let (journal, resumed) = PairsJournal::load_or_new(&cfg.state_file, cfg.rolling_window);
        if resumed {
            info!("resuming from saved pairs state");
        } else {
            info!("starting fresh pairs state");
        }
        Self {
            cfg,
            broker,
            journal,
            router: FillRouter::new(),
            sentinel: SessionSentinel::new(),
            last_sample: None,
            running: false,
        }
    }

    pub async fn start(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let symbols = self.cfg.all_symbols();
        info!("pairs engine starting with symbols: {}", symbols.join(", "));
        self.broker
            .connect(&symbols)
            .await
            .context("broker connect")?;

        self.reconcile().await;
        self.cfg.print_summary();
        self.summary();

        info!(
            "pairs engine started. sample every {}s, poll every {:.1}s",
            self.cfg.sample_interval_secs, self.cfg.poll_interval_secs
        );
        self.run_loop(shutdown).await;
        Ok(())
    }

    async fn run_loop(&mut self, mut shutdown: watch::Receiver<bool>) {
        self.running = true;
        let mut ticker = interval(Duration::from_secs_f64(self.cfg.poll_interval_secs.max(0.1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut poll_count: u64 = 0;

        while self.running {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.sentinel.refresh_due() {
                        info!("proactive session refresh");
                        if self.broker.refresh_session().await {
                            self.sentinel.mark_refreshed();
                        }
                    }

                    let sample_due = self
                        .last_sample
                        .map_or(true, |t| t.elapsed() >= Duration::from_secs(self.cfg.sample_interval_secs));
                    if sample_due {
                        self.sample_ratios().await;
                        self.last_sample = Some(Instant::now());
                    }

                    match self.poll_once().await {
                        None => {
                            if self.sentinel.record_error() {
                                warn!(
                                    "reactive session refresh after {} consecutive poll errors",
                                    self.sentinel.consecutive_errors()
                                );
                                self.broker.refresh_session().await;
                                self.sentinel.mark_refreshed();
                            }
                        }
                        Some(fills) => {
                            self.sentinel.clear_errors();
                            self.check_exits().await;
                            if fills > 0 {
                                self.journal.save();
                                self.summary();
                            }
                        }
                    }

                    poll_count += 1;
                    if poll_count % 100 == 0 {
                        info!(
                            "poll #{} | open: {} | PnL: {:.2} | trades: {}",
                            poll_count,
                            self.journal.open_positions.len(),
                            self.journal.total_pnl,
                            self.journal.total_trades
                        );
                        self.journal.save();
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("shutdown signal received");
                        self.running = false;
                    }
                }
            }
        }

        info!("pairs engine shutting down...");
        self.journal.save();
        self.broker.disconnect().await;
        info!(
            "pairs engine stopped. PnL={:.2}, trades={}",
            self.journal.total_pnl, self.journal.total_trades
        );
    }

    // ----- Sampling & entry -----

    /// Fetch LTPs, append ratio samples, and check entry signals.
    pub(crate) async fn sample_ratios(&mut self) {
        let pairs: Vec<(usize, PairSpec)> = self
            .cfg
            .pairs
            .iter()
            .cloned()
            .enumerate()
            .filter(|(_, p)| p.enabled)
            .collect();

        for (index, pair) in pairs {
            let num_ltp = self.broker.ltp(&pair.numerator).await;
            let den_ltp = self.broker.ltp(&pair.denominator).await;
            let (Some(num_ltp), Some(den_ltp)) = (num_ltp, den_ltp) else {
                debug!("pair {}: LTP unavailable", index);
                continue;
            };
            if den_ltp == 0.0 || num_ltp <= 0.0 {
                debug!("pair {}: unusable prices (num={}, den={})", index, num_ltp, den_ltp);
                continue;
            }

            let ratio = num_ltp / den_ltp;
            self.journal.add_sample(
                index,
                RatioSample {
                    timestamp: chrono::Utc::now(),
                    num_price: num_ltp,
                    den_price: den_ltp,
                    ratio,
                },
            );

            let Some((mean, sd)) = self.journal.rolling_stats(index) else {
                debug!(
                    "pair {}: warmup {}/{} (R={:.6})",
                    index,
                    self.journal.series_len(index),
                    self.cfg.warmup_samples.max(self.cfg.rolling_window),
                    ratio
                );
                continue;
            };
            if sd == 0.0 {
                debug!("pair {}: sigma=0, skipping signal check", index);
                continue;
            }

            let z = (ratio - mean) / sd;
            info!(
                "pair {} [{}/{}]: R={:.6} mean={:.6} sd={:.6} z={:.2}",
                index, pair.numerator, pair.denominator, ratio, mean, sd, z
            );

            if self.journal.active_count(index) >= self.cfg.max_positions_per_pair {
                continue;
            }
            if z > pair.entry_sd {
                info!(
                    "ENTRY SIGNAL: pair {} z={:.2} > {:.2} -> SHORT_NUM",
                    index, z, pair.entry_sd
                );
                self.enter_position(index, &pair, PairDirection::ShortNum, ratio, mean, sd, num_ltp, den_ltp)
                    .await;
            } else if z < -pair.entry_sd {
                info!(
                    "ENTRY SIGNAL: pair {} z={:.2} < -{:.2} -> LONG_NUM",
                    index, z, pair.entry_sd
                );
                self.enter_position(index, &pair, PairDirection::LongNum, ratio, mean, sd, num_ltp, den_ltp)
                    .await;
            }
        }
    }

    /// Place both legs as aggressive limits and register the position.
    #[allow(clippy::too_many_arguments)]
    async fn enter_position(
        &mut self,
        index: usize,
        pair: &PairSpec,
        direction: PairDirection,
        ratio: f64,
        mean: f64,
        sd: f64,
        num_ltp: f64,
        den_ltp: f64,
    ) {
        let num_qty = ((self.cfg.base_qty as f64 * pair.numerator_trade_pct / 100.0).round() as i64).max(1);
        let den_qty = ((self.cfg.base_qty as f64 * pair.denominator_trade_pct / 100.0).round() as i64).max(1);

        let mut position = PairPosition::open(
            index, direction, ratio, mean, sd, num_ltp, den_ltp, num_qty, den_qty,
        );

        let (num_side, den_side) = match direction {
            // Ratio high: numerator overpriced.
            PairDirection::ShortNum => (OrderSide::Sell, OrderSide::Buy),
            PairDirection::LongNum => (OrderSide::Buy, OrderSide::Sell),
        };

        info!(
            "ENTERING {}: pair {} [{}/{}] num={} {} den={} {} R={:.6} mean={:.6} sd={:.6}",
            direction, index, pair.numerator, pair.denominator,
            num_side, num_qty, den_side, den_qty, ratio, mean, sd
        );

        let num_tag = format!("EN-N-{}", position.position_id);
        let den_tag = format!("EN-D-{}", position.position_id);
        let num_oid = self
            .broker
            .place_aggressive(&pair.numerator, num_side, num_qty, &self.cfg.product, &num_tag, self.cfg.slippage)
            .await
            .map(|(oid, _)| oid);
        let den_oid = self
            .broker
            .place_aggressive(&pair.denominator, den_side, den_qty, &self.cfg.product, &den_tag, self.cfg.slippage)
            .await
            .map(|(oid, _)| oid);

        if num_oid.is_none() && den_oid.is_none() {
            warn!("both entry legs failed for position {}", position.position_id);
            return;
        }

        position.num_entry_order_id = num_oid.clone();
        position.den_entry_order_id = den_oid.clone();
        info!(
            "position {} created: numOID={:?} denOID={:?}",
            position.position_id, num_oid, den_oid
        );
        self.journal.register_position(position);
        self.journal.save();
    }

    // ----- Exit -----

    /// Close any OPEN position whose ratio has reverted to the mean.
    pub(crate) async fn check_exits(&mut self) {
        let open: Vec<(String, usize)> = self
            .journal
            .open_positions
            .values()
            .filter(|p| p.status == PairStatus::Open)
            .map(|p| (p.position_id.clone(), p.pair_index))
            .collect();

        for (pid, index) in open {
            let Some(pair) = self.cfg.pairs.get(index).cloned() else {
                continue;
            };
            let Some((mean, _sd)) = self.journal.rolling_stats(index) else {
                continue;
            };
            let num_ltp = self.broker.ltp(&pair.numerator).await;
            let den_ltp = self.broker.ltp(&pair.denominator).await;
            let (Some(num_ltp), Some(den_ltp)) = (num_ltp, den_ltp) else {
                continue;
            };
            if den_ltp == 0.0 {
                continue;
            }
            let ratio = num_ltp / den_ltp;
            let tolerance = self.cfg.mean_reversion_tolerance * mean;
            if (ratio - mean).abs() <= tolerance {
                info!(
                    "EXIT SIGNAL: position {} R={:.6} near mean={:.6} (tol={:.6})",
                    pid, ratio, mean, tolerance
                );
                self.exit_position(&pid, &pair, num_ltp, den_ltp).await;
            }
        }
    }

    async fn exit_position(&mut self, pid: &str, pair: &PairSpec, num_ltp: f64, den_ltp: f64) {
        let (direction, num_qty, den_qty) = {
            let Some(position) = self.journal.open_positions.get_mut(pid) else {
                return;
            };
            position.status = PairStatus::Exiting;
            (position.direction, position.num_qty, position.den_qty)
        };

        let (num_side, den_side) = match direction {
            // Unwind: buy back what was sold, sell what was bought.
            PairDirection::ShortNum => (OrderSide::Buy, OrderSide::Sell),
            PairDirection::LongNum => (OrderSide::Sell, OrderSide::Buy),
        };

        info!(
            "EXITING {}: position {} num={} {}@~{:.2} den={} {}@~{:.2}",
            direction, pid, num_side, num_qty, num_ltp, den_side, den_qty, den_ltp
        );

        let num_tag = format!("PX-N-{}", pid);
        let den_tag = format!("PX-D-{}", pid);
        let num_oid = self
            .broker
            .place_aggressive(&pair.numerator, num_side, num_qty, &self.cfg.product, &num_tag, self.cfg.slippage)
            .await
            .map(|(oid, _)| oid);
        let den_oid = self
            .broker
            .place_aggressive(&pair.denominator, den_side, den_qty, &self.cfg.product, &den_tag, self.cfg.slippage)
            .await
            .map(|(oid, _)| oid);

        if let Some(oid) = &num_oid {
            self.journal.register_order(oid, pid);
        }
        if let Some(oid) = &den_oid {
            self.journal.register_order(oid, pid);
        }
        if let Some(position) = self.journal.open_positions.get_mut(pid) {
            position.num_exit_order_id = num_oid;
            position.den_exit_order_id = den_oid;
        }
        self.journal.save();
    }

    // ----- Fill polling -----

    pub(crate) async fn poll_once(&mut self) -> Option<usize> {
        let orders = match self.broker.orders().await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(error = %e, "order book fetch failed");
                return None;
            }
        };

        let fresh = self.router.fresh_updates(&orders);
        let mut fills = 0;
        for order in &fresh {
            let Some(pid) = self.journal.position_id_for(&order.order_id) else {
                continue;
            };
            match order.status {
                OrderStatus::Complete | OrderStatus::Partial => {
                    if self.process_fill(&pid, order) {
                        fills += 1;
                    }
                }
                OrderStatus::Cancelled | OrderStatus::Rejected => {
                    warn!(
                        "order {} for position {}: {:?} - {}",
                        order.order_id, pid, order.status, order.status_message
                    );
                }
                OrderStatus::Open => {}
            }
        }
        Some(fills)
    }

    /// Apply a fill to whichever of the four legs the order id matches.
    fn process_fill(&mut self, pid: &str, order: &NormalizedOrder) -> bool {
        let Some(position) = self.journal.open_positions.get_mut(pid) else {
            return false;
        };
        let oid = order.order_id.as_str();
        let filled = order.filled_quantity;
        let price = order.average_price;

        let mut changed = false;
        if position.num_entry_order_id.as_deref() == Some(oid) {
            if filled > position.num_entry_filled {
                position.num_entry_filled = filled;
                position.num_entry_fill_price = price;
                info!("position {}: NUM entry fill {} @ {:.2}", pid, filled, price);
                changed = true;
            }
        } else if position.den_entry_order_id.as_deref() == Some(oid) {
            if filled > position.den_entry_filled {
                position.den_entry_filled = filled;
                position.den_entry_fill_price = price;
                info!("position {}: DEN entry fill {} @ {:.2}", pid, filled, price);
                changed = true;
            }
        } else if position.num_exit_order_id.as_deref() == Some(oid) {
            if filled > position.num_exit_filled {
                position.num_exit_filled = filled;
                position.num_exit_fill_price = price;
                info!("position {}: NUM exit fill {} @ {:.2}", pid, filled, price);
                changed = true;
            }
        } else if position.den_exit_order_id.as_deref() == Some(oid) {
            if filled > position.den_exit_filled {
                position.den_exit_filled = filled;
                position.den_exit_fill_price = price;
                info!("position {}: DEN exit fill {} @ {:.2}", pid, filled, price);
                changed = true;
            }
        }

        if !changed {
            return false;
        }

        match position.status {
            PairStatus::Entering => {
                if position.entry_legs_filled() {
                    position.status = PairStatus::Open;
                    info!("position {} -> OPEN (both entry legs filled)", pid);
                }
            }
            PairStatus::Exiting => {
                if position.exit_legs_filled() {
                    let pnl = position.compute_pnl();
                    position.realized_pnl = pnl;
                    info!("position {} -> CLOSED PnL={:.2}", pid, pnl);
                    self.journal.close_position(pid);
                }
            }
            _ => {}
        }
        true
    }

    // ----- Startup reconciliation -----

    /// Update leg fills from the broker book and replay any transitions
    /// that happened while the process was down.
    pub(crate) async fn reconcile(&mut self) {
        if self.journal.open_positions.is_empty() {
            return;
        }
        info!(
            "reconciling {} open positions with broker...",
            self.journal.open_positions.len()
        );
        let orders = match self.broker.orders().await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(error = %e, "cannot reconcile: order book fetch failed");
                return;
            }
        };
        let by_id: HashMap<String, NormalizedOrder> = orders
            .into_iter()
            .map(|o| (o.order_id.clone(), o))
            .collect();

        let pids: Vec<String> = self.journal.open_positions.keys().cloned().collect();
        for pid in pids {
            let mut to_close = false;
            {
                let Some(position) = self.journal.open_positions.get_mut(&pid) else {
                    continue;
                };
                let legs = [
                    (position.num_entry_order_id.clone(), 0),
                    (position.den_entry_order_id.clone(), 1),
                    (position.num_exit_order_id.clone(), 2),
                    (position.den_exit_order_id.clone(), 3),
                ];
                for (oid, slot) in legs {
                    let Some(order) = oid.as_ref().and_then(|o| by_id.get(o)) else {
                        continue;
                    };
                    let filled = order.filled_quantity;
                    let price = order.average_price;
                    match slot {
                        0 if filled > position.num_entry_filled => {
                            position.num_entry_filled = filled;
                            if price > 0.0 {
                                position.num_entry_fill_price = price;
                            }
                        }
                        1 if filled > position.den_entry_filled => {
                            position.den_entry_filled = filled;
                            if price > 0.0 {
                                position.den_entry_fill_price = price;
                            }
                        }
                        2 if filled > position.num_exit_filled => {
                            position.num_exit_filled = filled;
                            if price > 0.0 {
                                position.num_exit_fill_price = price;
                            }
                        }
                        3 if filled > position.den_exit_filled => {
                            position.den_exit_filled = filled;
                            if price > 0.0 {
                                position.den_exit_fill_price = price;
                            }
                        }
                        _ => {}
                    }
                }

                match position.status {
                    PairStatus::Entering if position.entry_legs_filled() => {
                        position.status = PairStatus::Open;
                        info!("reconcile: position {} -> OPEN", pid);
                    }
                    PairStatus::Exiting if position.exit_legs_filled() => {
                        position.realized_pnl = position.compute_pnl();
                        to_close = true;
                    }
                    _ => {}
                }
            }
            if to_close {
                info!("reconcile: position {} -> CLOSED", pid);
                self.journal.close_position(&pid);
            }
        }

        self.journal.save();
        info!("reconciliation complete");
    }

    /// Cancel tracked working orders without touching positions.
    pub async fn cancel_all(&mut self) -> usize {
        let mut to_cancel: Vec<String> = Vec::new();
        for position in self.journal.open_positions.values() {
            for (oid, filled, qty) in [
                (&position.num_entry_order_id, position.num_entry_filled, position.num_qty),
                (&position.den_entry_order_id, position.den_entry_filled, position.den_qty),
                (&position.num_exit_order_id, position.num_exit_filled, position.num_qty),
                (&position.den_exit_order_id, position.den_exit_filled, position.den_qty),
            ] {
                if let Some(oid) = oid {
                    if filled < qty {
                        to_cancel.push(oid.clone());
                    }
                }
            }
        }
        let mut cancelled = 0;
        for oid in to_cancel {
            if self.broker.cancel_order(&oid).await {
                cancelled += 1;
            }
        }
        info!("cancelled {} orders total", cancelled);
        self.journal.save();
        cancelled
    }

    fn summary(&self) {
        info!(
            "PAIRS STATE | PnL={:.2} trades={} | {} entering, {} open, {} exiting",
            self.journal.total_pnl,
            self.journal.total_trades,
            self.journal.count_with_status(PairStatus::Entering),
            self.journal.count_with_status(PairStatus::Open),
            self.journal.count_with_status(PairStatus::Exiting),
        );
        for (index, _) in self.cfg.pairs.iter().enumerate() {
            match self.journal.rolling_stats(index) {
                Some((mean, sd)) => {
                    debug!(
                        "pair {}: {} samples, mean={:.6}, sd={:.6}",
                        index,
                        self.journal.series_len(index),
                        mean,
                        sd
                    );
                }
                None => {
                    info!(
                        "pair {}: warmup {}/{}",
                        index,
                        self.journal.series_len(index),
                        self.cfg.rolling_window
                    );
                }
            }
        }
    }
}
