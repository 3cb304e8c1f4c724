//! Pair mean-reversion state: ratio rings, positions, rolling statistics.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use statrs::statistics::Statistics;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::grid::trim_front;
use super::{load_json, save_json};

pub const CLOSED_RETENTION: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PairStatus {
    Entering,
    Open,
    Exiting,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairDirection {
    /// Ratio low: bought numerator, sold denominator.
    #[serde(rename = "LONG_NUM")]
    LongNum,
    /// Ratio high: sold numerator, bought denominator.
    #[serde(rename = "SHORT_NUM")]
    ShortNum,
}

impl std::fmt::Display for PairDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PairDirection::LongNum => "LONG_NUM",
            PairDirection::ShortNum => "SHORT_NUM",
        })
    }
}

/// One ratio data point for a pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatioSample {
    pub timestamp: DateTime<Utc>,
    pub num_price: f64,
    pub den_price: f64,
    pub ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairPosition {
    pub position_id: String,
    pub pair_index: usize,
    pub direction: PairDirection,

    pub entry_time: DateTime<Utc>,
    pub entry_ratio: f64,
    pub entry_mean: f64,
    pub entry_sd: f64,
    pub num_entry_price: f64,
    pub den_entry_price: f64,
    pub num_qty: i64,
    pub den_qty: i64,

    #[serde(default)]
    pub num_entry_order_id: Option<String>,
    #[serde(default)]
    pub den_entry_order_id: Option<String>,
    #[serde(default)]
    pub num_exit_order_id: Option<String>,
    #[serde(default)]
    pub den_exit_order_id: Option<String>,

    #[serde(default)]
    pub num_entry_filled: i64,
    #[serde(default)]
    pub den_entry_filled: i64,
    #[serde(default)]
    pub num_exit_filled: i64,
    #[serde(default)]
    pub den_exit_filled: i64,
    #[serde(default)]
    pub num_entry_fill_price: f64,
    #[serde(default)]
    pub den_entry_fill_price: f64,
    #[serde(default)]
    pub num_exit_fill_price: f64,
    #[serde(default)]
    pub den_exit_fill_price: f64,

    pub status: PairStatus,
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl PairPosition {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        pair_index: usize,
        direction: PairDirection,
        entry_ratio: f64,
        entry_mean: f64,
        entry_sd: f64,
        num_entry_price: f64,
        den_entry_price: f64,
        num_qty: i64,
        den_qty: i64,
    ) -> Self {
        Self {
            position_id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            pair_index,
            direction,
            entry_time: Utc::now(),
            entry_ratio,
            entry_mean,
            entry_sd,
            num_entry_price,
            den_entry_price,
            num_qty,
            den_qty,
            num_entry_order_id: None,
            den_entry_order_id: None,
            num_exit_order_id: None,
            den_exit_order_id: None,
            num_entry_filled: 0,
            den_entry_filled: 0,
            num_exit_filled: 0,
            den_exit_filled: 0,
            num_entry_fill_price: 0.0,
            den_entry_fill_price: 0.0,
            num_exit_fill_price: 0.0,
            den_exit_fill_price: 0.0,
            status: PairStatus::Entering,
            realized_pnl: 0.0,
            closed_at: None,
        }
    }

    pub fn entry_legs_filled(&self) -> bool {
        self.num_entry_filled >= self.num_qty && self.den_entry_filled >= self.den_qty
    }

    pub fn exit_legs_filled(&self) -> bool {
        self.num_exit_filled >= self.num_qty && self.den_exit_filled >= self.den_qty
    }

    /// Direction-signed PnL from the four leg fill prices.
    pub fn compute_pnl(&self) -> f64 {
        let (num_pnl, den_pnl) = match self.direction {
            PairDirection::ShortNum => (
                (self.num_entry_fill_price - self.num_exit_fill_price) * self.num_qty as f64,
                (self.den_exit_fill_price - self.den_entry_fill_price) * self.den_qty as f64,
            ),
            PairDirection::LongNum => (
                (self.num_exit_fill_price - self.num_entry_fill_price) * self.num_qty as f64,
                (self.den_entry_fill_price - self.den_exit_fill_price) * self.den_qty as f64,
            ),
        };
        num_pnl + den_pnl
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PairsJournal {
    #[serde(skip)]
    path: PathBuf,

    #[serde(default)]
    pub rolling_window: usize,
    #[serde(default)]
    pub total_pnl: f64,
    #[serde(default)]
    pub total_trades: u64,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    /// pair_index -> bounded ring of samples (2x window kept for display).
    #[serde(default)]
    pub ratio_series: HashMap<usize, Vec<RatioSample>>,
    #[serde(default)]
    pub open_positions: HashMap<String, PairPosition>,
    #[serde(default)]
    pub closed_positions: Vec<PairPosition>,
    #[serde(default)]
    pub order_to_position: HashMap<String, String>,

    /// Unknown keys from older/newer schemas, preserved across saves.
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl PairsJournal {
    pub fn new(path: &Path, rolling_window: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            rolling_window,
            total_pnl: 0.0,
            total_trades: 0,
            last_updated: None,
            ratio_series: HashMap::new(),
            open_positions: HashMap::new(),
            closed_positions: Vec::new(),
            order_to_position: HashMap::new(),
            extra: Map::new(),
        }
    }

    pub fn load_or_new(path: &Path, rolling_window: usize) -> (Self, bool) {
        match load_json::<Self>(path) {
            Some(mut journal) => {
                journal.path = path.to_path_buf();
                if journal.rolling_window == 0 {
                    journal.rolling_window = rolling_window;
                }
                trim_front(&mut journal.closed_positions, CLOSED_RETENTION);
                info!(
                    "pairs state loaded: {} open, PnL={:.2}, trades={}, series for {} pairs",
                    journal.open_positions.len(),
                    journal.total_pnl,
                    journal.total_trades,
                    journal.ratio_series.len()
                );
                (journal, true)
            }
            None => (Self::new(path, rolling_window), false),
        }
    }

    pub fn save(&mut self) {
        self.last_updated = Some(Utc::now());
        trim_front(&mut self.closed_positions, CLOSED_RETENTION);
        if let Err(e) = save_json(&self.path, self) {
            warn!(error = %e, "failed to save pairs state");
        } else {
            debug!(
                "pairs state saved: {} open, {} closed, PnL={:.2}",
                self.open_positions.len(),
                self.closed_positions.len(),
                self.total_pnl
            );
        }
    }

    /// Append a sample, trimming the ring to twice the rolling window.
    pub fn add_sample(&mut self, pair_index: usize, sample: RatioSample) {
        let series = self.ratio_series.entry(pair_index).or_default();
        series.push(sample);
        let max_keep = self.rolling_window * 2;
        trim_front(series, max_keep);
    }

    pub fn series_len(&self, pair_index: usize) -> usize {
        self.ratio_series.get(&pair_index).map_or(0, Vec::len)
    }

    /// Rolling (mean, population sd) over the newest `rolling_window`
    /// samples; `None` until warmup completes.
    pub fn rolling_stats(&self, pair_index: usize) -> Option<(f64, f64)> {
        let series = self.ratio_series.get(&pair_index)?;
        if series.len() < self.rolling_window {
            return None;
        }
        let recent: Vec<f64> = series[series.len() - self.rolling_window..]
            .iter()
            .map(|s| s.ratio)
            .collect();
        let mean = (&recent).mean();
        let sd = if recent.len() > 1 {
            (&recent).population_std_dev()
        } else {
            0.0
        };
        Some((mean, sd))
    }

    /// Open (non-closed) positions for a pair, for the stacking limit.
    pub fn active_count(&self, pair_index: usize) -> usize {
        self.open_positions
            .values()
            .filter(|p| p.pair_index == pair_index && p.status != PairStatus::Closed)
            .count()
    }

    pub fn register_position(&mut self, position: PairPosition) {
        if let Some(oid) = &position.num_entry_order_id {
            self.order_to_position
                .insert(oid.clone(), position.position_id.clone());
        }
        if let Some(oid) = &position.den_entry_order_id {
            self.order_to_position
                .insert(oid.clone(), position.position_id.clone());
        }
        self.open_positions
            .insert(position.position_id.clone(), position);
    }

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

    pub fn close_position(&mut self, position_id: &str) {
        let Some(mut position) = self.open_positions.remove(position_id) else {
            warn!("attempted to close unknown position: {}", position_id);
            return;
        };
        position.status = PairStatus::Closed;
        position.closed_at = Some(Utc::now());
        self.total_pnl += position.realized_pnl;
        self.total_trades += 1;
        info!(
            "position {} closed. PnL={:.2}, Total PnL={:.2}, Trades={}",
            position_id, position.realized_pnl, self.total_pnl, self.total_trades
        );
        self.closed_positions.push(position);
        trim_front(&mut self.closed_positions, CLOSED_RETENTION);
    }

    pub fn count_with_status(&self, status: PairStatus) -> usize {
        self.open_positions
            .values()
            .filter(|p| p.status == status)
            .count()
    }
}
