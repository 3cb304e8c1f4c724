//! Grid engine state: positions with partial-fill target tracking.
//!
//! A `GridPosition` is one round-trip attempt at one grid level. Unlike a
//! single-target design, `target_orders` holds one record per observed entry
//! fill increment, so straggling partials can never over-sell or over-buy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{load_json, save_json};
use crate::broker::OrderSide;

pub const CLOSED_RETENTION: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GridStatus {
    EntryPending,
    EntryPartial,
    TargetPending,
    Closed,
    Cancelled,
}

/// One opposite-side limit order covering a single entry fill increment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetOrder {
    pub order_id: String,
    pub qty: i64,
    #[serde(default)]
    pub filled_qty: i64,
    #[serde(default)]
    pub fill_price: Option<f64>,
    pub placed_at: DateTime<Utc>,
}

impl TargetOrder {
    pub fn is_filled(&self) -> bool {
        self.filled_qty >= self.qty
    }
}

/// Secondary-ticker order recorded in a position's hedge journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeOrder {
    pub order_id: String,
    pub client_tag: String,
    pub side: OrderSide,
    pub qty: i64,
    pub price: f64,
    pub role: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridPosition {
    pub position_id: String,
    pub side: OrderSide,
    pub level: usize,
    pub cycle: u32,

    /// Theoretical prices from the grid, not fill prices.
    pub entry_price: f64,
    pub target_price: f64,
    pub qty: i64,

    pub status: GridStatus,

    #[serde(default)]
    pub entry_order_id: Option<String>,
    /// Broker-reported VWAP across entry partials.
    #[serde(default)]
    pub entry_fill_price: f64,
    /// Cumulative entry qty filled; monotone per order.
    #[serde(default)]
    pub entry_filled_so_far: i64,

    #[serde(default)]
    pub target_orders: Vec<TargetOrder>,
    /// Counts target placements for T1/T2/... client tags.
    #[serde(default)]
    pub target_seq: u32,

    // Hedge ledger (hedged-grid only; zero otherwise).
    #[serde(default)]
    pub hedged_qty: i64,
    #[serde(default)]
    pub hedge_total: f64,
    #[serde(default)]
    pub hedge_seq: u32,
    #[serde(default)]
    pub unwound_qty: i64,
    #[serde(default)]
    pub unwind_total: f64,
    #[serde(default)]
    pub unwind_seq: u32,
    #[serde(default)]
    pub hedge_pnl: f64,
    #[serde(default)]
    pub hedge_orders: Vec<HedgeOrder>,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub entry_filled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub realized_pnl: f64,
}

impl GridPosition {
    pub fn open(side: OrderSide, level: usize, cycle: u32, entry_price: f64, target_price: f64, qty: i64) -> Self {
        Self {
            position_id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            side,
            level,
            cycle,
            entry_price,
            target_price,
            qty,
            status: GridStatus::EntryPending,
            entry_order_id: None,
            entry_fill_price: 0.0,
            entry_filled_so_far: 0,
            target_orders: Vec::new(),
            target_seq: 0,
            hedged_qty: 0,
            hedge_total: 0.0,
            hedge_seq: 0,
            unwound_qty: 0,
            unwind_total: 0.0,
            unwind_seq: 0,
            hedge_pnl: 0.0,
            hedge_orders: Vec::new(),
            created_at: Utc::now(),
            entry_filled_at: None,
            closed_at: None,
            realized_pnl: 0.0,
        }
    }

    pub fn target_side(&self) -> OrderSide {
        self.side.opposite()
    }

    pub fn all_targets_filled(&self) -> bool {
        !self.target_orders.is_empty() && self.target_orders.iter().all(TargetOrder::is_filled)
    }

    pub fn total_target_filled(&self) -> i64 {
        self.target_orders.iter().map(|t| t.filled_qty).sum()
    }

    pub fn total_target_qty(&self) -> i64 {
        self.target_orders.iter().map(|t| t.qty).sum()
    }

    pub fn hedge_outstanding(&self) -> i64 {
        self.hedged_qty - self.unwound_qty
    }

    pub fn hedge_vwap(&self) -> f64 {
        if self.hedged_qty > 0 {
            self.hedge_total / self.hedged_qty as f64
        } else {
            0.0
        }
    }

    pub fn unwind_vwap(&self) -> f64 {
        if self.unwound_qty > 0 {
            self.unwind_total / self.unwound_qty as f64
        } else {
            0.0
        }
    }
}

/// Level key used in per-level maps: `"BUY:3"`, `"SELL:0"`.
pub fn level_key(side: OrderSide, level: usize) -> String {
    format!("{}:{}", side, level)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GridJournal {
    #[serde(skip)]
    path: PathBuf,

    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub anchor_price: f64,
    #[serde(default)]
    pub current_spacing: f64,
    #[serde(default)]
    pub total_pnl: f64,
    #[serde(default)]
    pub total_cycles: u64,
    /// Signed shares: positive long, negative short.
    #[serde(default)]
    pub net_inventory: i64,
    #[serde(default)]
    pub buy_reanchor_count: u32,
    #[serde(default)]
    pub sell_reanchor_count: u32,
    #[serde(default)]
    pub total_reanchors: u32,
    /// `"SIDE:level"` -> next cycle number.
    #[serde(default)]
    pub level_cycle_counters: HashMap<String, u32>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub open_positions: HashMap<String, GridPosition>,
    #[serde(default)]
    pub closed_positions: Vec<GridPosition>,
    #[serde(default)]
    pub order_to_position: HashMap<String, String>,

    /// Unknown keys from older/newer schemas, preserved across saves.
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl GridJournal {
    pub fn new(path: &Path, symbol: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            symbol: symbol.to_string(),
            anchor_price: 0.0,
            current_spacing: 0.0,
            total_pnl: 0.0,
            total_cycles: 0,
            net_inventory: 0,
            buy_reanchor_count: 0,
            sell_reanchor_count: 0,
            total_reanchors: 0,
            level_cycle_counters: HashMap::new(),
            last_updated: None,
            open_positions: HashMap::new(),
            closed_positions: Vec::new(),
            order_to_position: HashMap::new(),
            extra: Map::new(),
        }
    }

    /// Load the journal or start fresh. Returns (journal, resumed).
    pub fn load_or_new(path: &Path, symbol: &str) -> (Self, bool) {
        match load_json::<Self>(path) {
            Some(mut journal) => {
                journal.path = path.to_path_buf();
                trim_front(&mut journal.closed_positions, CLOSED_RETENTION);
                info!(
                    "state loaded for {}: {} open, PnL={:.2}, cycles={}, inv={}",
                    journal.symbol,
                    journal.open_positions.len(),
                    journal.total_pnl,
                    journal.total_cycles,
                    journal.net_inventory
                );
                (journal, true)
            }
            None => (Self::new(path, symbol), false),
        }
    }

    pub fn save(&mut self) {
        self.last_updated = Some(Utc::now());
        trim_front(&mut self.closed_positions, CLOSED_RETENTION);
        if let Err(e) = save_json(&self.path, self) {
            warn!(error = %e, "failed to save grid state");
        } else {
            debug!(
                "state saved: {} open, {} closed, PnL={:.2}, inv={}",
                self.open_positions.len(),
                self.closed_positions.len(),
                self.total_pnl,
                self.net_inventory
            );
        }
    }

    /// Register a new position and its entry order.
    pub fn add_position(&mut self, position: GridPosition) {
        if let Some(oid) = &position.entry_order_id {
            self.order_to_position
                .insert(oid.clone(), position.position_id.clone());
        }
        self.open_positions
            .insert(position.position_id.clone(), position);
    }

    /// Map an order id to a position id (used for target orders).
    pub fn register_order(&mut self, order_id: &str, position_id: &str) {
        self.order_to_position
            .insert(order_id.to_string(), position_id.to_string());
    }

    pub fn position_id_for(&self, order_id: &str) -> Option<String> {
        let pid = self.order_to_position.get(order_id)?;
        if self.open_positions.contains_key(pid) {
            Some(pid.clone())
        } else {
            None
        }
    }

    /// Move a position from open to closed, accumulate PnL and cycle count.
    pub fn close_position(&mut self, position_id: &str) {
        let Some(mut position) = self.open_positions.remove(position_id) else {
            warn!("attempted to close unknown position: {}", position_id);
            return;
        };
        position.status = GridStatus::Closed;
        position.closed_at = Some(Utc::now());
        self.total_pnl += position.realized_pnl;
        self.total_cycles += 1;
        info!(
            "position {} closed. PnL={:.2}, Total PnL={:.2}, Cycles={}",
            position_id, position.realized_pnl, self.total_pnl, self.total_cycles
        );
        self.closed_positions.push(position);
        trim_front(&mut self.closed_positions, CLOSED_RETENTION);
    }

    /// Get and increment the cycle counter for a level.
    pub fn next_cycle_for_level(&mut self, side: OrderSide, level: usize) -> u32 {
        let key = level_key(side, level);
        let current = *self.level_cycle_counters.get(&key).unwrap_or(&1);
        self.level_cycle_counters.insert(key, current + 1);
        current
    }

    pub fn count_with_status(&self, side: OrderSide, status: GridStatus) -> usize {
        self.open_positions
            .values()
            .filter(|p| p.side == side && p.status == status)
            .count()
    }
}

/// Keep the newest `keep` elements of an append-ordered list.
pub(crate) fn trim_front<T>(list: &mut Vec<T>, keep: usize) {
    if list.len() > keep {
        let drop = list.len() - keep;
        list.drain(..drop);
    }
}
