//! Grid market-making engine.
//!
//! A symmetric ladder of BUY/SELL limit entries brackets an anchor price.
//! Every entry fill increment gets its own opposite-side target at a fixed
//! profit offset; when one side of the ladder is exhausted the grid tears
//! down and re-anchors with widened spacing. With a hedge section in the
//! config, entry fills also trigger opposite-direction hedges on a secondary
//! ticker (partial and final fills at different ratios) and a re-anchor
//! flattens the net hedge position.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{FillRouter, SessionSentinel, REANCHOR_COOLDOWN};
use crate::broker::{round_tick, BrokerApi, NormalizedOrder, OrderRequest, OrderSide, OrderStatus};
use crate::config::{client_tag, GridConfig, GridLevel};
use crate::journal::grid::{
    level_key, GridJournal, GridPosition, GridStatus, HedgeOrder, TargetOrder,
};

pub struct GridEngine {
    cfg: GridConfig,
    broker: Arc<dyn BrokerApi>,
    pub(crate) journal: GridJournal,
    resumed: bool,

    buy_levels: Vec<GridLevel>,
    sell_levels: Vec<GridLevel>,
    /// `"SIDE:level"` -> position id, for free-level lookups.
    level_index: HashMap<String, String>,

    router: FillRouter,
    sentinel: SessionSentinel,
    last_reanchor: Option<Instant>,
    pub(crate) running: bool,
}

impl GridEngine {
    pub fn new(cfg: GridConfig, broker: Arc<dyn BrokerApi>) -> Self {
        let (journal, resumed) = GridJournal::load_or_new(&cfg.state_file, &cfg.symbol);
        Self {
            cfg,
            broker,
            journal,
            resumed,
            buy_levels: Vec::new(),
            sell_levels: Vec::new(),
            level_index: HashMap::new(),
            router: FillRouter::new(),
            sentinel: SessionSentinel::new(),
            last_reanchor: None,
            running: false,
        }
    }

    fn trade_symbols(&self) -> Vec<String> {
        let mut symbols = vec![self.cfg.symbol.clone()];
        if let Some(h) = &self.cfg.hedge {
            symbols.push(h.symbol.clone());
        }
        symbols
    }

    /// Connect, recover state, lay the ladder, and poll until shutdown.
    pub async fn start(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.broker
            .connect(&self.trade_symbols())
            .await
            .context("broker connect")?;

        self.initialize().await?;

        info!(
            "grid engine started. polling every {:.1}s",
            self.cfg.poll_interval_secs
        );
        self.run_loop(shutdown).await;
        Ok(())
    }

    /// Anchor/spacing resolution, ladder computation, reconciliation, and
    /// the initial entry sweep.
    pub(crate) async fn initialize(&mut self) -> Result<()> {
        if self.resumed {
            info!("resuming from saved state");
            if self.journal.current_spacing <= 0.0 {
                self.journal.current_spacing = self.cfg.base_spacing;
            }
            if self.journal.anchor_price <= 0.0 {
                self.journal.anchor_price = self.cfg.anchor_price;
            }
        } else {
            self.journal.anchor_price = self.resolve_anchor().await?;
            self.journal.current_spacing = self.cfg.base_spacing;
            info!(
                "starting fresh grid at anchor={:.2}",
                self.journal.anchor_price
            );
        }

        self.recompute_levels();
        self.rebuild_level_index();
        self.reconcile().await;

        self.cfg
            .print_ladder(self.journal.anchor_price, self.journal.current_spacing);

        self.place_entries().await;
        self.journal.save();
        self.summary();
        Ok(())
    }

    /// Anchor from config, or from the live quote when auto-anchoring.
    async fn resolve_anchor(&self) -> Result<f64> {
        if !self.cfg.auto_anchor {
            return Ok(self.cfg.anchor_price);
        }
        let Some(quote) = self.broker.quote(&self.cfg.symbol).await else {
            bail!("auto-anchor: no quote available for {}", self.cfg.symbol);
        };
        if quote.best_bid > 0.0 && quote.best_ask > 0.0 {
            let mid = round_tick((quote.best_bid + quote.best_ask) / 2.0);
            // Sanity-check the midpoint against the last trade.
            if quote.ltp <= 0.0 || ((mid - quote.ltp) / quote.ltp).abs() <= 0.02 {
                info!(
                    "auto-anchor from bid/ask midpoint: {:.2} (bid={:.2} ask={:.2})",
                    mid, quote.best_bid, quote.best_ask
                );
                return Ok(mid);
            }
            warn!(
                "midpoint {:.2} inconsistent with LTP {:.2}; anchoring to LTP",
                mid, quote.ltp
            );
        } else {
            warn!("no usable bid/ask; anchoring to LTP {:.2}", quote.ltp);
        }
        if quote.ltp <= 0.0 {
            bail!("auto-anchor: quote for {} has no price", self.cfg.symbol);
        }
        Ok(round_tick(quote.ltp))
    }

    fn recompute_levels(&mut self) {
        let (buys, sells) = self
            .cfg
            .compute_levels(self.journal.anchor_price, self.journal.current_spacing);
        self.buy_levels = buys;
        self.sell_levels = sells;
    }

    fn rebuild_level_index(&mut self) {
        self.level_index.clear();
        for position in self.journal.open_positions.values() {
            self.level_index.insert(
                level_key(position.side, position.level),
                position.position_id.clone(),
            );
        }
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
                            if let Some(side) = self.exhausted_side() {
                                self.reanchor(side).await;
                            }
                            if fills > 0 {
                                self.journal.save();
                                self.summary();
                            }
                        }
                    }

                    poll_count += 1;
                    if poll_count % 100 == 0 {
                        info!(
                            "poll #{} | open: {} | PnL: {:.2} | cycles: {} | inv: {}",
                            poll_count,
                            self.journal.open_positions.len(),
                            self.journal.total_pnl,
                            self.journal.total_cycles,
                            self.journal.net_inventory
                        );
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

        self.shutdown_save().await;
    }

    async fn shutdown_save(&mut self) {
        info!("shutting down grid engine...");
        self.journal.save();
        self.summary();
        self.broker.disconnect().await;
        info!(
            "state saved. orders remain active ({}). run cancel-all to cancel them. \
             total PnL: {:.2} | cycles: {} | inventory: {}",
            self.cfg.product,
            self.journal.total_pnl,
            self.journal.total_cycles,
            self.journal.net_inventory
        );
    }

    // ----- Polling -----

    /// One order-book pass. `None` when the fetch itself failed.
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
            match order.status {
                OrderStatus::Complete | OrderStatus::Partial => {
                    if self.handle_fill(order).await {
                        fills += 1;
                    }
                }
                OrderStatus::Rejected => self.handle_rejection(order),
                OrderStatus::Cancelled => self.handle_cancellation(order),
                OrderStatus::Open => {}
            }
        }
        Some(fills)
    }

    /// Route a fill to the entry or target leg of its position.
    async fn handle_fill(&mut self, order: &NormalizedOrder) -> bool {
        let Some(pid) = self.journal.position_id_for(&order.order_id) else {
            // Untracked, possibly a manual order on the same account.
            return false;
        };
        if order.average_price <= 0.0 || order.filled_quantity <= 0 {
            warn!("fill with zero price/qty: order={}", order.order_id);
            return false;
        }

        let (is_entry, target_hit) = {
            let Some(position) = self.journal.open_positions.get(&pid) else {
                return false;
            };
            (
                position.entry_order_id.as_deref() == Some(order.order_id.as_str()),
                position
                    .target_orders
                    .iter()
                    .any(|t| t.order_id == order.order_id),
            )
        };

        if is_entry {
            self.on_entry_fill(&pid, order).await
        } else if target_hit {
            self.on_target_fill(&pid, order).await
        } else {
            false
        }
    }

    /// Entry fill increment: hedge it, record it, and place a fresh target
    /// limit covering exactly this increment.
    async fn on_entry_fill(&mut self, pid: &str, order: &NormalizedOrder) -> bool {
        let complete = order.status == OrderStatus::Complete;

        let (increment, side, level, cycle, target_price, qty, already_hedged) = {
            let Some(position) = self.journal.open_positions.get(pid) else {
                return false;
            };
            let increment = order.filled_quantity - position.entry_filled_so_far;
            if increment <= 0 {
                return false;
            }
            (
                increment,
                position.side,
                position.level,
                position.cycle,
                position.target_price,
                position.qty,
                position.hedged_qty,
            )
        };

        // Opposite-direction hedge on the secondary ticker. Partials hedge
        // at the partial ratio; the completing fill tops up to the full
        // ratio, netting out whatever the partials already covered.
        if let Some(hedge) = self.cfg.hedge.clone() {
            let hedge_qty = if complete {
                (order.filled_quantity as f64 * hedge.hedge_ratio).round() as i64 - already_hedged
            } else {
                (increment as f64 * hedge.partial_hedge_ratio).round() as i64
            };
            if hedge_qty > 0 {
                self.place_hedge(pid, side.opposite(), hedge_qty, "PH").await;
            }
        }

        let seq = {
            let Some(position) = self.journal.open_positions.get_mut(pid) else {
                return false;
            };
            // Broker average_price is already the VWAP of all fills.
            position.entry_fill_price = order.average_price;
            position.entry_filled_so_far = order.filled_quantity;
            position.target_seq += 1;
            position.target_seq
        };
        match side {
            OrderSide::Buy => self.journal.net_inventory += increment,
            OrderSide::Sell => self.journal.net_inventory -= increment,
        }

        let tag = client_tag(&format!("T{}", seq), side, level, cycle, pid);
        let target_req = OrderRequest {
            symbol: self.cfg.symbol.clone(),
            side: side.opposite(),
            qty: increment,
            price: target_price,
            product: self.cfg.product.clone(),
            client_tag: tag,
        };
        match self.broker.place_order(&target_req).await {
            Some(target_oid) => {
                if let Some(position) = self.journal.open_positions.get_mut(pid) {
                    position.target_orders.push(TargetOrder {
                        order_id: target_oid.clone(),
                        qty: increment,
                        filled_qty: 0,
                        fill_price: None,
                        placed_at: Utc::now(),
                    });
                }
                self.journal.register_order(&target_oid, pid);
                info!(
                    "target T{} placed: {} {} @ {:.2} -> order={} (position={}, entry fill {}/{})",
                    seq,
                    side.opposite(),
                    increment,
                    target_price,
                    target_oid,
                    pid,
                    order.filled_quantity,
                    qty
                );
            }
            None => {
                error!(
                    "target FAILED: {} {} @ {:.2} for position={}",
                    side.opposite(),
                    increment,
                    target_price,
                    pid
                );
            }
        }

        if let Some(position) = self.journal.open_positions.get_mut(pid) {
            if complete {
                position.status = GridStatus::TargetPending;
                position.entry_filled_at = Some(Utc::now());
                info!(
                    "entry COMPLETE: {} L{} C{}, {} @ {:.2} (position={})",
                    side, level, cycle, order.filled_quantity, order.average_price, pid
                );
            } else {
                position.status = GridStatus::EntryPartial;
                info!(
                    "entry PARTIAL: {} L{} C{}, {}/{} @ {:.2} (position={})",
                    side, level, cycle, order.filled_quantity, qty, order.average_price, pid
                );
            }
        }
        true
    }

    /// Target fill increment: book PnL, unwind hedge, close on completion.
    async fn on_target_fill(&mut self, pid: &str, order: &NormalizedOrder) -> bool {
        let (increment, side, level, cycle, idx) = {
            let Some(position) = self.journal.open_positions.get(pid) else {
                return false;
            };
            let Some(idx) = position
                .target_orders
                .iter()
                .position(|t| t.order_id == order.order_id)
            else {
                return false;
            };
            let increment = order.filled_quantity - position.target_orders[idx].filled_qty;
            if increment <= 0 {
                return false;
            }
            (increment, position.side, position.level, position.cycle, idx)
        };

        // Unwind the hedge for this increment at the partial ratio; any
        // remainder is trued up when the position closes.
        if let Some(hedge) = self.cfg.hedge.clone() {
            let outstanding = self
                .journal
                .open_positions
                .get(pid)
                .map(GridPosition::hedge_outstanding)
                .unwrap_or(0);
            let unwind_qty =
                ((increment as f64 * hedge.partial_hedge_ratio).round() as i64).min(outstanding);
            if unwind_qty > 0 {
                self.place_hedge(pid, side, unwind_qty, "PU").await;
            }
        }

        let pnl_increment = {
            let Some(position) = self.journal.open_positions.get_mut(pid) else {
                return false;
            };
            position.target_orders[idx].filled_qty = order.filled_quantity;
            position.target_orders[idx].fill_price = Some(order.average_price);
            let pnl = match position.side {
                OrderSide::Buy => {
                    (order.average_price - position.entry_fill_price) * increment as f64
                }
                OrderSide::Sell => {
                    (position.entry_fill_price - order.average_price) * increment as f64
                }
            };
            position.realized_pnl += pnl;
            pnl
        };
        match side {
            OrderSide::Buy => self.journal.net_inventory -= increment,
            OrderSide::Sell => self.journal.net_inventory += increment,
        }
        info!(
            "target fill: {} L{} C{}, {} @ {:.2}, PnL incr={:.2} (position={})",
            side.opposite(),
            level,
            cycle,
            increment,
            order.average_price,
            pnl_increment,
            pid
        );

        // Cycle completes only when the entry is done and every target is
        // fully filled for at least the entry quantity.
        let done = {
            let Some(position) = self.journal.open_positions.get(pid) else {
                return true;
            };
            position.status == GridStatus::TargetPending
                && position.all_targets_filled()
                && position.total_target_filled() >= position.entry_filled_so_far
        };
        if done {
            if self.cfg.hedge.is_some() {
                let outstanding = self
                    .journal
                    .open_positions
                    .get(pid)
                    .map(GridPosition::hedge_outstanding)
                    .unwrap_or(0);
                if outstanding > 0 {
                    self.place_hedge(pid, side, outstanding, "PU").await;
                }
                if let Some(position) = self.journal.open_positions.get_mut(pid) {
                    position.hedge_pnl = match position.side {
                        OrderSide::Buy => position.hedge_total - position.unwind_total,
                        OrderSide::Sell => position.unwind_total - position.hedge_total,
                    };
                }
            }

            let realized = self
                .journal
                .open_positions
                .get(pid)
                .map(|p| p.realized_pnl)
                .unwrap_or(0.0);
            info!(
                "CYCLE COMPLETE: {} L{} C{}, PnL={:.2} (position={})",
                side, level, cycle, realized, pid
            );

            self.level_index.remove(&level_key(side, level));
            self.journal.close_position(pid);

            // Re-enter the same rung on a new cycle.
            let levels = match side {
                OrderSide::Buy => &self.buy_levels,
                OrderSide::Sell => &self.sell_levels,
            };
            if let Some(level_cfg) = levels.get(level).copied() {
                self.place_entry(level_cfg).await;
            }
        }
        true
    }

    /// Place a secondary-ticker order and book it into the hedge ledger.
    async fn place_hedge(&mut self, pid: &str, hedge_side: OrderSide, qty: i64, role: &str) {
        let Some(hedge) = self.cfg.hedge.clone() else {
            return;
        };
        let (level, cycle) = {
            let Some(position) = self.journal.open_positions.get(pid) else {
                return;
            };
            (position.level, position.cycle)
        };
        let tag = client_tag(role, hedge_side, level, cycle, pid);
        match self
            .broker
            .place_aggressive(
                &hedge.symbol,
                hedge_side,
                qty,
                &self.cfg.product,
                &tag,
                self.cfg.slippage,
            )
            .await
        {
            Some((order_id, price)) => {
                let Some(position) = self.journal.open_positions.get_mut(pid) else {
                    return;
                };
                if role == "PH" {
                    position.hedged_qty += qty;
                    position.hedge_total += price * qty as f64;
                    position.hedge_seq += 1;
                } else {
                    position.unwound_qty += qty;
                    position.unwind_total += price * qty as f64;
                    position.unwind_seq += 1;
                }
                position.hedge_orders.push(HedgeOrder {
                    order_id: order_id.clone(),
                    client_tag: tag,
                    side: hedge_side,
                    qty,
                    price,
                    role: role.to_string(),
                    at: Utc::now(),
                });
                info!(
                    "{} hedge: {} {} {} @ {:.2} -> order={} (position={})",
                    role, hedge_side, hedge.symbol, qty, price, order_id, pid
                );
            }
            None => {
                error!(
                    "{} hedge FAILED: {} {} {} (position={})",
                    role, hedge_side, hedge.symbol, qty, pid
                );
            }
        }
    }

    /// Entry rejection frees the grid level; nothing happened, so the
    /// position is dropped without a closed-history entry.
    fn handle_rejection(&mut self, order: &NormalizedOrder) {
        let Some(pid) = self.journal.position_id_for(&order.order_id) else {
            warn!(
                "REJECTED (untracked): order={}, reason={}",
                order.order_id, order.status_message
            );
            return;
        };
        error!(
            "ORDER REJECTED: order={}, position={}, reason={}",
            order.order_id, pid, order.status_message
        );
        let is_entry = self
            .journal
            .open_positions
            .get(&pid)
            .map(|p| p.entry_order_id.as_deref() == Some(order.order_id.as_str()))
            .unwrap_or(false);
        if is_entry {
            if let Some(position) = self.journal.open_positions.remove(&pid) {
                self.level_index
                    .remove(&level_key(position.side, position.level));
            }
            self.journal.order_to_position.remove(&order.order_id);
        }
    }

    fn handle_cancellation(&mut self, order: &NormalizedOrder) {
        if let Some(pid) = self.journal.position_id_for(&order.order_id) {
            info!("ORDER CANCELLED: order={}, position={}", order.order_id, pid);
        }
    }

    // ----- Ladder -----

    pub(crate) async fn place_entries(&mut self) {
        let levels: Vec<GridLevel> = self
            .buy_levels
            .iter()
            .chain(self.sell_levels.iter())
            .copied()
            .collect();
        for level in levels {
            if self
                .level_index
                .contains_key(&level_key(level.side, level.index))
            {
                debug!("{} L{} already active", level.side, level.index);
                continue;
            }
            self.place_entry(level).await;
        }
    }

    async fn place_entry(&mut self, level: GridLevel) -> bool {
        if level.entry_price <= 0.0 {
            error!(
                "entry SKIPPED: {} L{} has non-positive price {:.2}",
                level.side, level.index, level.entry_price
            );
            return false;
        }
        let cycle = self.journal.next_cycle_for_level(level.side, level.index);
        let mut position = GridPosition::open(
            level.side,
            level.index,
            cycle,
            level.entry_price,
            level.target_price,
            level.qty,
        );
        let tag = client_tag("EN", level.side, level.index, cycle, &position.position_id);
        let request = OrderRequest {
            symbol: self.cfg.symbol.clone(),
            side: level.side,
            qty: level.qty,
            price: level.entry_price,
            product: self.cfg.product.clone(),
            client_tag: tag,
        };
        match self.broker.place_order(&request).await {
            Some(order_id) => {
                position.entry_order_id = Some(order_id.clone());
                let pid = position.position_id.clone();
                self.journal.add_position(position);
                self.level_index
                    .insert(level_key(level.side, level.index), pid.clone());
                info!(
                    "entry placed: {} L{} C{} @ {:.2} -> order={} (position={})",
                    level.side, level.index, cycle, level.entry_price, order_id, pid
                );
                true
            }
            None => {
                error!(
                    "entry FAILED: {} L{} @ {:.2}",
                    level.side, level.index, level.entry_price
                );
                false
            }
        }
    }

    // ----- Exhaustion & re-anchor -----

    /// A side is exhausted when every level waits on its target.
    /// Partially-filled entries do not count.
    pub(crate) fn exhausted_side(&self) -> Option<OrderSide> {
        if let Some(last) = self.last_reanchor {
            if last.elapsed() < REANCHOR_COOLDOWN {
                return None;
            }
        }
        let n = self.cfg.levels_per_side;
        if n == 0 {
            return None;
        }
        let buy_tp = self
            .journal
            .count_with_status(OrderSide::Buy, GridStatus::TargetPending);
        if buy_tp >= n {
            info!("GRID EXHAUSTED: all {} buy levels are TARGET_PENDING", buy_tp);
            return Some(OrderSide::Buy);
        }
        let sell_tp = self
            .journal
            .count_with_status(OrderSide::Sell, GridStatus::TargetPending);
        if sell_tp >= n {
            info!(
                "GRID EXHAUSTED: all {} sell levels are TARGET_PENDING",
                sell_tp
            );
            return Some(OrderSide::Sell);
        }
        None
    }

    /// Deepest entry fill on a side; current anchor when nothing filled.
    fn deepest_fill(&self, side: OrderSide) -> f64 {
        let fills = self
            .journal
            .open_positions
            .values()
            .filter(|p| {
                p.side == side && p.status == GridStatus::TargetPending && p.entry_fill_price > 0.0
            })
            .map(|p| p.entry_fill_price);
        let deepest = match side {
            OrderSide::Buy => fills.fold(f64::INFINITY, f64::min),
            OrderSide::Sell => fills.fold(f64::NEG_INFINITY, f64::max),
        };
        if deepest.is_finite() {
            round_tick(deepest)
        } else {
            self.journal.anchor_price
        }
    }

    /// Tear down and rebuild the ladder around the deepest fill.
    ///
    /// The step order matters: counters and the safety stop come before any
    /// orders are touched, and state is cleared before the new ladder goes
    /// out so a failure mid-way leaves a retryable empty grid, never a
    /// half-built one.
    pub(crate) async fn reanchor(&mut self, side: OrderSide) {
        let old_anchor = self.journal.anchor_price;
        let new_anchor = self.deepest_fill(side);

        info!("{}", "=".repeat(60));
        info!(
            "REANCHORING ({} exhausted): {:.2} -> {:.2}",
            side, old_anchor, new_anchor
        );
        info!("{}", "=".repeat(60));

        match side {
            OrderSide::Buy => self.journal.buy_reanchor_count += 1,
            OrderSide::Sell => self.journal.sell_reanchor_count += 1,
        }
        self.journal.total_reanchors += 1;
        if self.journal.total_reanchors >= self.cfg.max_reanchors {
            warn!(
                "MAX REANCHORS REACHED: {} (limit={}). stopping engine.",
                self.journal.total_reanchors, self.cfg.max_reanchors
            );
            self.journal.save();
            self.running = false;
            return;
        }

        self.journal.current_spacing = round_spacing(
            self.journal.current_spacing + self.cfg.base_spacing,
        );
        info!(
            "spacing increased to {:.4} (reanchor #{})",
            self.journal.current_spacing, self.journal.total_reanchors
        );

        self.cancel_all().await;
        self.flatten_hedge().await;

        info!(
            "closing {} open positions as CANCELLED",
            self.journal.open_positions.len()
        );
        let now = Utc::now();
        let drained: Vec<GridPosition> = self
            .journal
            .open_positions
            .drain()
            .map(|(_, p)| p)
            .collect();
        for mut position in drained {
            position.status = GridStatus::Cancelled;
            position.realized_pnl = 0.0;
            position.closed_at = Some(now);
            self.journal.closed_positions.push(position);
        }

        self.journal.order_to_position.clear();
        self.level_index.clear();
        self.router.reset();

        self.journal.anchor_price = new_anchor;
        self.recompute_levels();

        self.place_entries().await;

        self.journal.save();
        self.last_reanchor = Some(Instant::now());
        self.summary();

        info!(
            "REANCHOR COMPLETE: {:.2} -> {:.2} | side: {} | open: {}",
            old_anchor,
            new_anchor,
            side,
            self.journal.open_positions.len()
        );
    }

    /// Flatten the net secondary position with one aggressive limit and
    /// book the price into every affected position's unwind ledger.
    async fn flatten_hedge(&mut self) {
        let Some(hedge) = self.cfg.hedge.clone() else {
            return;
        };
        let mut net: i64 = 0;
        for position in self.journal.open_positions.values() {
            let remaining = position.hedge_outstanding();
            if remaining <= 0 {
                continue;
            }
            match position.side {
                // Buy-side entries hedged by selling the secondary: short.
                OrderSide::Buy => net -= remaining,
                OrderSide::Sell => net += remaining,
            }
        }
        if net == 0 {
            info!("no net {} position to flatten", hedge.symbol);
            return;
        }
        let (flatten_side, qty) = if net > 0 {
            (OrderSide::Sell, net)
        } else {
            (OrderSide::Buy, -net)
        };
        let mut tag = format!("RA-{}", self.cfg.symbol);
        tag.truncate(20);
        info!(
            "flattening {}: {} {} (net={})",
            hedge.symbol, flatten_side, qty, net
        );
        match self
            .broker
            .place_aggressive(
                &hedge.symbol,
                flatten_side,
                qty,
                &self.cfg.product,
                &tag,
                hedge.flatten_slippage,
            )
            .await
        {
            Some((order_id, price)) => {
                info!(
                    "hedge flatten placed: {} {} {} @ {:.2}, order={}",
                    flatten_side, hedge.symbol, qty, price, order_id
                );
                for position in self.journal.open_positions.values_mut() {
                    let remaining = position.hedge_outstanding();
                    if remaining <= 0 {
                        continue;
                    }
                    position.unwound_qty = position.hedged_qty;
                    position.unwind_total += price * remaining as f64;
                    position.hedge_pnl = match position.side {
                        OrderSide::Buy => position.hedge_total - position.unwind_total,
                        OrderSide::Sell => position.unwind_total - position.hedge_total,
                    };
                    position.hedge_orders.push(HedgeOrder {
                        order_id: order_id.clone(),
                        client_tag: tag.clone(),
                        side: flatten_side,
                        qty: remaining,
                        price,
                        role: "FLATTEN".to_string(),
                        at: Utc::now(),
                    });
                }
            }
            None => {
                error!(
                    "hedge flatten FAILED: {} {} {}",
                    flatten_side, hedge.symbol, qty
                );
            }
        }
    }

    /// Cancel every working entry and target order. Positions are left
    /// untouched; used by re-anchor and the cancel-all CLI command.
    pub async fn cancel_all(&mut self) -> usize {
        let mut to_cancel: Vec<String> = Vec::new();
        for position in self.journal.open_positions.values() {
            if matches!(
                position.status,
                GridStatus::EntryPending | GridStatus::EntryPartial
            ) {
                if let Some(oid) = &position.entry_order_id {
                    to_cancel.push(oid.clone());
                }
            }
            for target in &position.target_orders {
                if target.filled_qty < target.qty {
                    to_cancel.push(target.order_id.clone());
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

    // ----- Startup reconciliation -----

    /// Replay fills and cancels that happened while the process was down.
    pub(crate) async fn reconcile(&mut self) {
        if self.journal.open_positions.is_empty() {
            return;
        }
        info!("reconciling state with broker orders...");
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

        let snapshot: Vec<(String, GridStatus, Option<String>, Vec<String>)> = self
            .journal
            .open_positions
            .values()
            .map(|p| {
                (
                    p.position_id.clone(),
                    p.status,
                    p.entry_order_id.clone(),
                    p.target_orders
                        .iter()
                        .filter(|t| t.filled_qty < t.qty)
                        .map(|t| t.order_id.clone())
                        .collect(),
                )
            })
            .collect();

        for (pid, status, entry_oid, target_oids) in snapshot {
            if matches!(status, GridStatus::EntryPending | GridStatus::EntryPartial) {
                if let Some(order) = entry_oid.as_ref().and_then(|oid| by_id.get(oid)) {
                    match order.status {
                        OrderStatus::Complete | OrderStatus::Partial => {
                            info!("reconcile: entry fill for position={}", pid);
                            self.handle_fill(order).await;
                        }
                        OrderStatus::Cancelled | OrderStatus::Rejected => {
                            info!("reconcile: entry {:?} for position={}", order.status, pid);
                            if let Some(position) = self.journal.open_positions.remove(&pid) {
                                self.level_index
                                    .remove(&level_key(position.side, position.level));
                            }
                        }
                        OrderStatus::Open => {}
                    }
                }
            }
            for oid in target_oids {
                if let Some(order) = by_id.get(&oid) {
                    if matches!(order.status, OrderStatus::Complete | OrderStatus::Partial) {
                        info!("reconcile: target fill for position={}", pid);
                        self.handle_fill(order).await;
                    }
                }
            }
        }

        self.journal.save();
        info!("reconciliation complete");
    }

    fn summary(&self) {
        let count = |side, status| self.journal.count_with_status(side, status);
        info!(
            "STATE {} | anchor={:.2} spacing={:.4} | PnL={:.2} cycles={} inv={} | reanchors={} (buy={}, sell={})",
            self.cfg.symbol,
            self.journal.anchor_price,
            self.journal.current_spacing,
            self.journal.total_pnl,
            self.journal.total_cycles,
            self.journal.net_inventory,
            self.journal.total_reanchors,
            self.journal.buy_reanchor_count,
            self.journal.sell_reanchor_count,
        );
        info!(
            "  buy:  {} pending, {} partial, {} target-pending | sell: {} pending, {} partial, {} target-pending",
            count(OrderSide::Buy, GridStatus::EntryPending),
            count(OrderSide::Buy, GridStatus::EntryPartial),
            count(OrderSide::Buy, GridStatus::TargetPending),
            count(OrderSide::Sell, GridStatus::EntryPending),
            count(OrderSide::Sell, GridStatus::EntryPartial),
            count(OrderSide::Sell, GridStatus::TargetPending),
        );
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

/// Keep widened spacings on clean decimals despite repeated f64 addition.
fn round_spacing(spacing: f64) -> f64 {
    (spacing * 1e6).round() / 1e6
}
