//! Engine configuration: grid geometry, pair parameters, broker credentials.
//!
//! Strategy parameters live in per-engine JSON files; broker credentials are
//! only ever read from the environment (`.env` supported via dotenv).

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::broker::{round_tick, OrderSide};

const DEFAULT_XTS_ROOT: &str = "https://xts.myfindoc.com";

/// XTS credential set: interactive (trading) + market data (quotes).
#[derive(Debug, Clone)]
pub struct BrokerCredentials {
    pub interactive_key: String,
    pub interactive_secret: String,
    pub marketdata_key: String,
    pub marketdata_secret: String,
    pub root_url: String,
}

impl BrokerCredentials {
    pub fn from_env() -> Result<Self> {
        let get = |key: &str| -> Result<String> {
            env::var(key).with_context(|| format!("missing env var {}", key))
        };
        Ok(Self {
            interactive_key: get("XTS_INTERACTIVE_KEY")?,
            interactive_secret: get("XTS_INTERACTIVE_SECRET")?,
            marketdata_key: get("XTS_MARKETDATA_KEY")?,
            marketdata_secret: get("XTS_MARKETDATA_SECRET")?,
            root_url: env::var("XTS_ROOT_URL").unwrap_or_else(|_| DEFAULT_XTS_ROOT.to_string()),
        })
    }
}

/// Secondary-ticker hedging for the hedged-grid variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeConfig {
    pub symbol: String,
    /// Multiplier applied to completed entry fills.
    pub hedge_ratio: f64,
    /// Multiplier applied to each partial fill increment.
    #[serde(default)]
    pub partial_hedge_ratio: f64,
    /// Aggressive-limit offset used when flattening the net hedge.
    #[serde(default = "default_flatten_slippage")]
    pub flatten_slippage: f64,
}

fn default_flatten_slippage() -> f64 {
    0.05
}

/// Grid market-maker configuration.
///
/// The ladder brackets `anchor_price` with `levels_per_side` rungs on each
/// side; every entry has a fixed-offset target on the opposite side. All buy
/// targets converge to `anchor + round_trip_profit`, all sell targets to
/// `anchor - round_trip_profit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub symbol: String,
    pub exchange: String,
    pub product: String,

    /// Grid center. Ignored when `auto_anchor` is set.
    pub anchor_price: f64,
    /// Derive the anchor from bid/ask midpoint (LTP fallback) at startup.
    pub auto_anchor: bool,

    pub base_spacing: f64,
    pub round_trip_profit: f64,
    pub levels_per_side: usize,
    pub qty_per_level: i64,

    /// Safety stop: halt the engine after this many re-anchors.
    pub max_reanchors: u32,

    pub poll_interval_secs: f64,
    pub slippage: f64,

    pub state_file: PathBuf,
    pub session_file: PathBuf,

    pub hedge: Option<HedgeConfig>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            exchange: "NSE".to_string(),
            product: "CNC".to_string(),
            anchor_price: 0.0,
            auto_anchor: false,
            base_spacing: 0.01,
            round_trip_profit: 0.01,
            levels_per_side: 10,
            qty_per_level: 1000,
            max_reanchors: 100,
            poll_interval_secs: 2.0,
            slippage: 0.02,
            state_file: PathBuf::from("state/grid_state.json"),
            session_file: PathBuf::from("state/xts_session.json"),
            hedge: None,
        }
    }
}

/// A single rung on one side of the ladder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridLevel {
    pub index: usize,
    pub side: OrderSide,
    pub entry_price: f64,
    pub target_price: f64,
    pub qty: i64,
}

impl GridConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("cannot parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            bail!("config: symbol is required");
        }
        if self.levels_per_side == 0 || self.qty_per_level <= 0 {
            bail!("config: levels_per_side and qty_per_level must be positive");
        }
        if self.base_spacing <= 0.0 || self.round_trip_profit <= 0.0 {
            bail!("config: base_spacing and round_trip_profit must be positive");
        }
        if !self.auto_anchor && self.anchor_price <= 0.0 {
            bail!("config: anchor_price required unless auto_anchor is set");
        }
        if let Some(h) = &self.hedge {
            if h.symbol.is_empty() || h.hedge_ratio <= 0.0 {
                bail!("config: hedge requires symbol and a positive hedge_ratio");
            }
        }
        Ok(())
    }

    /// Generate buy and sell levels around `anchor` with the given spacing.
    ///
    /// Buy level i: entry = anchor - spacing*(i+1), target = entry + profit.
    /// Sell level i: entry = anchor + spacing*(i+1), target = entry - profit.
    pub fn compute_levels(&self, anchor: f64, spacing: f64) -> (Vec<GridLevel>, Vec<GridLevel>) {
        let mut buys = Vec::with_capacity(self.levels_per_side);
        let mut sells = Vec::with_capacity(self.levels_per_side);
        for i in 0..self.levels_per_side {
            let distance = spacing * (i + 1) as f64;
            let buy_entry = round_tick(anchor - distance);
            let sell_entry = round_tick(anchor + distance);
            buys.push(GridLevel {
                index: i,
                side: OrderSide::Buy,
                entry_price: buy_entry,
                target_price: round_tick(buy_entry + self.round_trip_profit),
                qty: self.qty_per_level,
            });
            sells.push(GridLevel {
                index: i,
                side: OrderSide::Sell,
                entry_price: sell_entry,
                target_price: round_tick(sell_entry - self.round_trip_profit),
                qty: self.qty_per_level,
            });
        }
        (buys, sells)
    }

    /// Print the ladder for visual verification before trading.
    pub fn print_ladder(&self, anchor: f64, spacing: f64) {
        let (buys, sells) = self.compute_levels(anchor, spacing);
        let total_qty = self.levels_per_side as i64 * self.qty_per_level;

        println!("{}", "=".repeat(60));
        println!("  GRID LAYOUT: {}", self.symbol);
        println!("{}", "=".repeat(60));
        println!("  Anchor Price     : {:.2}", anchor);
        println!("  Base Spacing     : {}", self.base_spacing);
        println!("  Current Spacing  : {}", spacing);
        println!("  Round-Trip Profit: {}", self.round_trip_profit);
        println!("  Levels Per Side  : {}", self.levels_per_side);
        println!("  Qty Per Level    : {}", self.qty_per_level);
        println!("  Max Reanchors    : {}", self.max_reanchors);
        println!("  Product          : {}", self.product);
        if let Some(h) = &self.hedge {
            println!(
                "  Hedge            : {} x{} (partial x{})",
                h.symbol, h.hedge_ratio, h.partial_hedge_ratio
            );
        }

        println!("\n  BUY SIDE (entries below anchor)");
        println!("  {:<8} {:>10} {:>10} {:>8}", "Level", "Entry", "Target", "Qty");
        for lv in &buys {
            println!(
                "  {:<8} {:>10.2} {:>10.2} {:>8}",
                lv.index, lv.entry_price, lv.target_price, lv.qty
            );
        }

        println!("\n  SELL SIDE (entries above anchor)");
        println!("  {:<8} {:>10} {:>10} {:>8}", "Level", "Entry", "Target", "Qty");
        for lv in &sells {
            println!(
                "  {:<8} {:>10.2} {:>10.2} {:>8}",
                lv.index, lv.entry_price, lv.target_price, lv.qty
            );
        }

        println!(
            "\n  Max exposure per side: {} shares, deepest buy {:.2} / sell {:.2}",
            total_qty,
            buys.last().map(|l| l.entry_price).unwrap_or(anchor),
            sells.last().map(|l| l.entry_price).unwrap_or(anchor),
        );
        println!("  Effective spread     : {:.2}", 2.0 * spacing);
        println!("{}", "=".repeat(60));
    }
}

/// One ratio pair for the mean-reversion engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairSpec {
    pub numerator: String,
    pub denominator: String,
    #[serde(default = "default_entry_sd")]
    pub entry_sd: f64,
    #[serde(default = "default_trade_pct")]
    pub numerator_trade_pct: f64,
    #[serde(default = "default_trade_pct")]
    pub denominator_trade_pct: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_entry_sd() -> f64 {
    1.0
}
fn default_trade_pct() -> f64 {
    100.0
}
fn default_enabled() -> bool {
    true
}

/// Pair ratio mean-reversion configuration.
///
/// For each pair, R = numerator_LTP / denominator_LTP is sampled every
/// `sample_interval_secs`. Once `rolling_window` samples exist, enter when
/// |z| > entry_sd and exit when the ratio reverts to the rolling mean.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairsConfig {
    pub pairs: Vec<PairSpec>,

    /// Base quantity reference; per-leg qty = base_qty * trade_pct / 100.
    pub base_qty: i64,

    pub rolling_window: usize,
    pub sample_interval_secs: u64,
    pub warmup_samples: usize,

    pub max_positions_per_pair: usize,
    pub mean_reversion_tolerance: f64,

    pub exchange: String,
    pub product: String,
    pub poll_interval_secs: f64,
    pub slippage: f64,

    pub state_file: PathBuf,
    pub session_file: PathBuf,
}

impl Default for PairsConfig {
    fn default() -> Self {
        Self {
            pairs: Vec::new(),
            base_qty: 10_000,
            rolling_window: 30,
            sample_interval_secs: 60,
            warmup_samples: 30,
            max_positions_per_pair: 3,
            mean_reversion_tolerance: 0.002,
            exchange: "NSE".to_string(),
            product: "CNC".to_string(),
            poll_interval_secs: 2.0,
            slippage: 0.05,
            state_file: PathBuf::from("state/pairs_state.json"),
            session_file: PathBuf::from("state/xts_session.json"),
        }
    }
}

impl PairsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("cannot parse config {}", path.display()))?;
        if cfg.pairs.is_empty() {
            bail!("config: at least one pair is required");
        }
        if cfg.rolling_window == 0 {
            bail!("config: rolling_window must be positive");
        }
        Ok(cfg)
    }

    /// Unique ticker list across all pairs, for feed subscription.
    pub fn all_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = Vec::new();
        for pair in &self.pairs {
            for s in [&pair.numerator, &pair.denominator] {
                if !symbols.iter().any(|x| x == s) {
                    symbols.push(s.clone());
                }
            }
        }
        symbols.sort();
        symbols
    }

    pub fn print_summary(&self) {
        println!("{}", "=".repeat(60));
        println!("  PAIR MEAN-REVERSION");
        println!("{}", "=".repeat(60));
        println!("  Base Qty         : {}", self.base_qty);
        println!(
            "  Rolling Window   : {} samples every {}s",
            self.rolling_window, self.sample_interval_secs
        );
        println!("  Max Per Pair     : {}", self.max_positions_per_pair);
        println!("  Exit Tolerance   : {}", self.mean_reversion_tolerance);
        println!("  Product          : {}", self.product);
        for (i, p) in self.pairs.iter().enumerate() {
            println!(
                "  Pair {} : {}/{} entry_sd={} pct={}/{}{}",
                i,
                p.numerator,
                p.denominator,
                p.entry_sd,
                p.numerator_trade_pct,
                p.denominator_trade_pct,
                if p.enabled { "" } else { " (disabled)" }
            );
        }
        println!("{}", "=".repeat(60));
    }
}

/// Compact order identifier for the broker's `orderUniqueIdentifier`
/// (max 20 chars): `{ROLE}-{SIDE}L{LEVEL}C{CYCLE}-{POSITION_ID}`.
///
/// Roles: EN entry, T{n} nth target, PH pair hedge, PU pair unwind.
pub fn client_tag(role: &str, side: OrderSide, level: usize, cycle: u32, position_id: &str) -> String {
    let side_code = match side {
        OrderSide::Buy => 'B',
        OrderSide::Sell => 'S',
    };
    let tag = format!("{}-{}L{}C{}-{}", role, side_code, level, cycle, position_id);
    if tag.len() > 20 {
        tag[..20].to_string()
    } else {
        tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_cfg() -> GridConfig {
        GridConfig {
            symbol: "TESTSYM".to_string(),
            anchor_price: 100.0,
            base_spacing: 0.10,
            round_trip_profit: 0.10,
            levels_per_side: 3,
            qty_per_level: 10,
            ..Default::default()
        }
    }

    #[test]
    fn levels_bracket_the_anchor() {
        let cfg = grid_cfg();
        let (buys, sells) = cfg.compute_levels(100.0, 0.10);
        assert_eq!(buys.len(), 3);
        assert_eq!(sells.len(), 3);
        assert_eq!(buys[0].entry_price, 99.90);
        assert_eq!(buys[2].entry_price, 99.70);
        assert_eq!(sells[0].entry_price, 100.10);
        assert_eq!(sells[2].entry_price, 100.30);
    }

    #[test]
    fn targets_converge_past_the_anchor() {
        let cfg = grid_cfg();
        let (buys, sells) = cfg.compute_levels(100.0, 0.10);
        // Buy targets all sit round_trip_profit above their entry.
        for lv in &buys {
            assert!((lv.target_price - lv.entry_price - 0.10).abs() < 1e-9);
        }
        for lv in &sells {
            assert!((lv.entry_price - lv.target_price - 0.10).abs() < 1e-9);
        }
        // Innermost targets land on anchor +/- profit.
        assert_eq!(buys[0].target_price, 100.00);
        assert_eq!(sells[0].target_price, 100.00);
    }

    #[test]
    fn widened_spacing_moves_every_rung() {
        let cfg = grid_cfg();
        let (buys, _) = cfg.compute_levels(99.70, 0.20);
        assert_eq!(buys[0].entry_price, 99.50);
        assert_eq!(buys[2].entry_price, 99.10);
    }

    #[test]
    fn client_tag_stays_within_broker_limit() {
        let tag = client_tag("EN", OrderSide::Buy, 0, 1, "abc12345");
        assert_eq!(tag, "EN-BL0C1-abc12345");
        assert!(tag.len() <= 20);

        let long = client_tag("T12", OrderSide::Sell, 9, 999, "abcdef01");
        assert!(long.len() <= 20);
    }

    #[test]
    fn pairs_symbols_deduplicated() {
        let cfg = PairsConfig {
            pairs: vec![
                PairSpec {
                    numerator: "AAA".into(),
                    denominator: "CCC".into(),
                    entry_sd: 1.0,
                    numerator_trade_pct: 100.0,
                    denominator_trade_pct: 100.0,
                    enabled: true,
                },
                PairSpec {
                    numerator: "BBB".into(),
                    denominator: "CCC".into(),
                    entry_sd: 1.0,
                    numerator_trade_pct: 100.0,
                    denominator_trade_pct: 100.0,
                    enabled: true,
                },
            ],
            ..Default::default()
        };
        assert_eq!(cfg.all_symbols(), vec!["AAA", "BBB", "CCC"]);
    }

    #[test]
    fn grid_config_round_trips_through_json() {
        let cfg = grid_cfg();
        let raw = serde_json::to_string(&cfg).unwrap();
        let back: GridConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.symbol, cfg.symbol);
        assert_eq!(back.levels_per_side, cfg.levels_per_side);
    }
}
