//! End-to-end grid engine scenarios against the scripted broker.

use std::sync::Arc;

use tempfile::{tempdir, TempDir};
use tokio::sync::watch;

use super::grid::GridEngine;
use super::mock::MockBroker;
use crate::broker::{OrderSide, Quote};
use crate::config::{GridConfig, HedgeConfig};
use crate::journal::grid::GridStatus;

fn cfg(dir: &TempDir, levels: usize) -> GridConfig {
    GridConfig {
        symbol: "TESTSYM".to_string(),
        anchor_price: 100.0,
        base_spacing: 0.10,
        round_trip_profit: 0.10,
        levels_per_side: levels,
        qty_per_level: 10,
        state_file: dir.path().join("grid.json"),
        session_file: dir.path().join("session.json"),
        ..Default::default()
    }
}

async fn engine_with(cfg: GridConfig) -> (GridEngine, Arc<MockBroker>) {
    let broker = Arc::new(MockBroker::new());
    let mut engine = GridEngine::new(cfg, broker.clone());
    engine.initialize().await.expect("initialize");
    (engine, broker)
}

fn entry_id(broker: &MockBroker, side: OrderSide, price: f64) -> String {
    broker
        .find_placed(|req| req.side == side && (req.price - price).abs() < 1e-9)
        .map(|(id, _)| id)
        .expect("entry order")
}

#[tokio::test]
async fn single_cycle_books_profit_and_reenters() {
    // Scenario: one level each side, complete fill, full round trip.
    let dir = tempdir().unwrap();
    let (mut engine, broker) = engine_with(cfg(&dir, 1)).await;

    // Ladder out: BUY@99.90 and SELL@100.10.
    assert_eq!(broker.placements(), 2);
    let buy_entry = entry_id(&broker, OrderSide::Buy, 99.90);

    broker.fill(&buy_entry, 10, 99.90, true);
    assert_eq!(engine.poll_once().await, Some(1));

    // Target SELL 10 @ 100.00 went out; position waits on it.
    let (target_id, target_req) = broker
        .find_placed(|req| req.side == OrderSide::Sell && (req.price - 100.00).abs() < 1e-9)
        .expect("target order");
    assert_eq!(target_req.qty, 10);
    assert!(target_req.client_tag.starts_with("T1-"));
    assert_eq!(engine.journal.net_inventory, 10);
    let position = engine.journal.open_positions.values().find(|p| p.side == OrderSide::Buy).unwrap();
    assert_eq!(position.status, GridStatus::TargetPending);
    assert_eq!(position.entry_fill_price, 99.90);

    broker.fill(&target_id, 10, 100.00, true);
    assert_eq!(engine.poll_once().await, Some(1));

    assert!((engine.journal.total_pnl - 1.00).abs() < 1e-9);
    assert_eq!(engine.journal.total_cycles, 1);
    assert_eq!(engine.journal.net_inventory, 0);

    // Same rung re-entered on cycle 2.
    let (_, reentry) = broker
        .find_placed(|req| req.side == OrderSide::Buy && req.client_tag.starts_with("EN-BL0C2"))
        .expect("re-entry order");
    assert_eq!(reentry.price, 99.90);
}

#[tokio::test]
async fn partial_fills_get_one_target_per_increment() {
    // Scenario: entry arrives 6 then 10; two targets, PnL accrues per leg.
    let dir = tempdir().unwrap();
    let (mut engine, broker) = engine_with(cfg(&dir, 1)).await;
    let buy_entry = entry_id(&broker, OrderSide::Buy, 99.90);

    broker.fill(&buy_entry, 6, 99.90, false);
    assert_eq!(engine.poll_once().await, Some(1));
    let (t1, t1_req) = broker
        .find_placed(|req| req.side == OrderSide::Sell && req.qty == 6)
        .expect("T1");
    assert!((t1_req.price - 100.00).abs() < 1e-9);
    {
        let position = engine.journal.open_positions.values().find(|p| p.side == OrderSide::Buy).unwrap();
        assert_eq!(position.status, GridStatus::EntryPartial);
        // Targets never promise more than has been bought.
        assert!(position.total_target_qty() <= position.entry_filled_so_far);
    }

    broker.fill(&buy_entry, 10, 99.90, true);
    assert_eq!(engine.poll_once().await, Some(1));
    let (t2, _) = broker
        .find_placed(|req| req.side == OrderSide::Sell && req.qty == 4)
        .expect("T2");
    {
        let position = engine.journal.open_positions.values().find(|p| p.side == OrderSide::Buy).unwrap();
        assert_eq!(position.status, GridStatus::TargetPending);
        assert_eq!(position.total_target_qty(), 10);
    }

    broker.fill(&t1, 6, 100.00, true);
    assert_eq!(engine.poll_once().await, Some(1));
    {
        let position = engine.journal.open_positions.values().find(|p| p.side == OrderSide::Buy).unwrap();
        assert!((position.realized_pnl - 0.60).abs() < 1e-9);
        assert_eq!(position.status, GridStatus::TargetPending);
    }
    assert_eq!(engine.journal.total_cycles, 0);

    broker.fill(&t2, 4, 100.00, true);
    assert_eq!(engine.poll_once().await, Some(1));
    assert!((engine.journal.total_pnl - 1.00).abs() < 1e-9);
    assert_eq!(engine.journal.total_cycles, 1);
    assert_eq!(engine.journal.net_inventory, 0);
}

#[tokio::test]
async fn processing_the_same_snapshot_twice_changes_nothing() {
    let dir = tempdir().unwrap();
    let (mut engine, broker) = engine_with(cfg(&dir, 1)).await;
    let buy_entry = entry_id(&broker, OrderSide::Buy, 99.90);

    broker.fill(&buy_entry, 10, 99.90, true);
    assert_eq!(engine.poll_once().await, Some(1));
    let placements_after_first = broker.placements();
    let inventory_after_first = engine.journal.net_inventory;

    // Identical book again: no new fills, no duplicate targets.
    assert_eq!(engine.poll_once().await, Some(0));
    assert_eq!(broker.placements(), placements_after_first);
    assert_eq!(engine.journal.net_inventory, inventory_after_first);
}

#[tokio::test]
async fn buy_exhaustion_reanchors_to_deepest_fill() {
    // Scenario: three buy levels all waiting on targets; deepest at 99.70.
    let dir = tempdir().unwrap();
    let (mut engine, broker) = engine_with(cfg(&dir, 3)).await;
    assert_eq!(broker.placements(), 6);

    for price in [99.90, 99.80, 99.70] {
        let oid = entry_id(&broker, OrderSide::Buy, price);
        broker.fill(&oid, 10, price, true);
    }
    assert_eq!(engine.poll_once().await, Some(3));

    let side = engine.exhausted_side().expect("buy side exhausted");
    assert_eq!(side, OrderSide::Buy);
    engine.reanchor(side).await;

    assert_eq!(engine.journal.anchor_price, 99.70);
    assert!((engine.journal.current_spacing - 0.20).abs() < 1e-9);
    assert_eq!(engine.journal.total_reanchors, 1);
    assert_eq!(engine.journal.buy_reanchor_count, 1);

    // All six prior positions cancelled with zero PnL, none counted as cycles.
    assert_eq!(engine.journal.closed_positions.len(), 6);
    assert!(engine
        .journal
        .closed_positions
        .iter()
        .all(|p| p.status == GridStatus::Cancelled && p.realized_pnl == 0.0));
    assert_eq!(engine.journal.total_cycles, 0);

    // Fresh ladder around 99.70 with 0.20 spacing.
    assert_eq!(engine.journal.open_positions.len(), 6);
    broker
        .find_placed(|req| req.side == OrderSide::Buy && (req.price - 99.50).abs() < 1e-9)
        .expect("new innermost buy");
    broker
        .find_placed(|req| req.side == OrderSide::Sell && (req.price - 100.30).abs() < 1e-9)
        .expect("new outermost sell");

    // Working sell entries and the unfilled targets were cancelled.
    assert!(broker.cancelled.lock().len() >= 6);
}

#[tokio::test]
async fn partially_filled_level_blocks_exhaustion() {
    let dir = tempdir().unwrap();
    let (mut engine, broker) = engine_with(cfg(&dir, 2)).await;

    let first = entry_id(&broker, OrderSide::Buy, 99.90);
    let second = entry_id(&broker, OrderSide::Buy, 99.80);
    broker.fill(&first, 10, 99.90, true);
    broker.fill(&second, 4, 99.80, false); // still ENTRY_PARTIAL
    assert_eq!(engine.poll_once().await, Some(2));

    assert!(engine.exhausted_side().is_none());
}

#[tokio::test]
async fn max_reanchors_stops_the_engine() {
    let dir = tempdir().unwrap();
    let mut config = cfg(&dir, 1);
    config.max_reanchors = 1;
    let (mut engine, broker) = engine_with(config).await;

    let buy_entry = entry_id(&broker, OrderSide::Buy, 99.90);
    broker.fill(&buy_entry, 10, 99.90, true);
    engine.poll_once().await;

    engine.running = true;
    engine.reanchor(OrderSide::Buy).await;

    assert!(!engine.running);
    assert_eq!(engine.journal.total_reanchors, 1);
    // Safety stop fires before any orders are touched.
    assert!(broker.cancelled.lock().is_empty());
    assert!(!engine.journal.open_positions.is_empty());
}

#[tokio::test]
async fn rejected_entry_frees_the_level_without_history() {
    // Scenario: placement accepted, then the broker rejects the order.
    let dir = tempdir().unwrap();
    let (mut engine, broker) = engine_with(cfg(&dir, 1)).await;
    let buy_entry = entry_id(&broker, OrderSide::Buy, 99.90);

    broker.reject(&buy_entry, "margin exceeded");
    assert_eq!(engine.poll_once().await, Some(0));

    assert!(engine
        .journal
        .open_positions
        .values()
        .all(|p| p.side != OrderSide::Buy));
    assert!(engine.journal.position_id_for(&buy_entry).is_none());
    assert!(engine.journal.closed_positions.is_empty());
    assert_eq!(engine.journal.total_pnl, 0.0);

    // The freed level accepts a new entry on the next sweep.
    let before = broker.placements();
    engine.place_entries().await;
    assert_eq!(broker.placements(), before + 1);
}

#[tokio::test]
async fn hedged_entry_and_targets_use_dual_ratios() {
    let dir = tempdir().unwrap();
    let mut config = cfg(&dir, 1);
    config.hedge = Some(HedgeConfig {
        symbol: "HEDGESYM".to_string(),
        hedge_ratio: 2.0,
        partial_hedge_ratio: 1.0,
        flatten_slippage: 0.05,
    });
    let broker = Arc::new(MockBroker::new());
    broker.set_ltp("HEDGESYM", 50.0);
    let mut engine = GridEngine::new(config, broker.clone());
    engine.initialize().await.unwrap();

    let buy_entry = entry_id(&broker, OrderSide::Buy, 99.90);

    // Partial 6: hedge SELL 6 x partial ratio 1.
    broker.fill(&buy_entry, 6, 99.90, false);
    engine.poll_once().await;
    let (_, hedge1) = broker
        .find_placed(|req| req.symbol == "HEDGESYM" && req.side == OrderSide::Sell && req.qty == 6)
        .expect("partial hedge");
    assert!((hedge1.price - 49.98).abs() < 1e-9);

    // Complete 10: top up to 10 x 2 = 20 minus the 6 already hedged.
    broker.fill(&buy_entry, 10, 99.90, true);
    engine.poll_once().await;
    broker
        .find_placed(|req| req.symbol == "HEDGESYM" && req.side == OrderSide::Sell && req.qty == 14)
        .expect("top-up hedge");
    {
        let position = engine
            .journal
            .open_positions
            .values()
            .find(|p| p.side == OrderSide::Buy)
            .unwrap();
        assert_eq!(position.hedged_qty, 20);
        assert!((position.hedge_vwap() - 49.98).abs() < 1e-9);
        assert_eq!(position.hedge_orders.len(), 2);
    }

    // Target fills unwind at the partial ratio, trued up at close.
    let (t1, _) = broker
        .find_placed(|req| req.symbol == "TESTSYM" && req.side == OrderSide::Sell && req.qty == 6)
        .expect("T1");
    let (t2, _) = broker
        .find_placed(|req| req.symbol == "TESTSYM" && req.side == OrderSide::Sell && req.qty == 4)
        .expect("T2");
    broker.fill(&t1, 6, 100.00, true);
    engine.poll_once().await;
    broker.fill(&t2, 4, 100.00, true);
    engine.poll_once().await;

    // Position closed and hedge flat: 6 + 4 partial unwinds + 10 true-up.
    assert_eq!(engine.journal.total_cycles, 1);
    let closed = engine.journal.closed_positions.last().unwrap();
    assert_eq!(closed.unwound_qty, 20);
    assert_eq!(closed.hedge_outstanding(), 0);
    // Short hedge: sold at 49.98, bought back at 50.02.
    assert!((closed.hedge_pnl - (20.0 * 49.98 - 20.0 * 50.02)).abs() < 1e-6);
}

#[tokio::test]
async fn reanchor_flattens_net_hedge_in_one_order() {
    let dir = tempdir().unwrap();
    let mut config = cfg(&dir, 1);
    config.hedge = Some(HedgeConfig {
        symbol: "HEDGESYM".to_string(),
        hedge_ratio: 2.0,
        partial_hedge_ratio: 0.0,
        flatten_slippage: 0.05,
    });
    let broker = Arc::new(MockBroker::new());
    broker.set_ltp("HEDGESYM", 50.0);
    let mut engine = GridEngine::new(config, broker.clone());
    engine.initialize().await.unwrap();

    let buy_entry = entry_id(&broker, OrderSide::Buy, 99.90);
    broker.fill(&buy_entry, 10, 99.90, true);
    engine.poll_once().await;

    // One level per side: the filled buy side is already exhausted.
    let side = engine.exhausted_side().expect("exhausted");
    engine.reanchor(side).await;

    // Net short 20 flattened with a single aggressive BUY.
    let (_, flatten) = broker
        .find_placed(|req| req.symbol == "HEDGESYM" && req.side == OrderSide::Buy && req.qty == 20)
        .expect("flatten order");
    assert!((flatten.price - 50.05).abs() < 1e-9);

    let cancelled_position = engine
        .journal
        .closed_positions
        .iter()
        .find(|p| p.hedged_qty == 20)
        .expect("hedged position moved to history");
    assert_eq!(cancelled_position.status, GridStatus::Cancelled);
    assert_eq!(cancelled_position.unwound_qty, 20);
    assert!(cancelled_position
        .hedge_orders
        .iter()
        .any(|o| o.role == "FLATTEN"));
    assert!((cancelled_position.hedge_pnl - (20.0 * 49.98 - 20.0 * 50.05)).abs() < 1e-6);
}

#[tokio::test]
async fn restart_recovers_fills_seen_while_down() {
    // Session round-trip: a fresh process reconstructs everything from the
    // journal plus one order-book pass.
    let dir = tempdir().unwrap();
    let config = cfg(&dir, 1);

    let target_id;
    {
        let (mut engine, broker) = engine_with(config.clone()).await;
        let buy_entry = entry_id(&broker, OrderSide::Buy, 99.90);
        broker.fill(&buy_entry, 10, 99.90, true);
        engine.poll_once().await;
        target_id = broker
            .find_placed(|req| req.side == OrderSide::Sell && (req.price - 100.00).abs() < 1e-9)
            .map(|(id, _)| id)
            .unwrap();
        engine.journal.save();
    }

    // New process; the target filled while we were down.
    let broker = Arc::new(MockBroker::new());
    broker.fill(&target_id, 10, 100.00, true);
    let mut engine = GridEngine::new(config, broker.clone());
    engine.initialize().await.unwrap();

    assert_eq!(engine.journal.total_cycles, 1);
    assert!((engine.journal.total_pnl - 1.00).abs() < 1e-9);
    assert_eq!(engine.journal.net_inventory, 0);
}

#[tokio::test]
async fn auto_anchor_prefers_the_midpoint() {
    let dir = tempdir().unwrap();
    let mut config = cfg(&dir, 1);
    config.auto_anchor = true;
    config.anchor_price = 0.0;
    let broker = Arc::new(MockBroker::new());
    broker.set_quote(
        "TESTSYM",
        Quote {
            ltp: 100.02,
            best_bid: 99.95,
            best_ask: 100.05,
        },
    );
    let mut engine = GridEngine::new(config, broker.clone());
    engine.initialize().await.unwrap();
    assert_eq!(engine.journal.anchor_price, 100.00);
}

#[tokio::test]
async fn auto_anchor_falls_back_to_ltp_when_book_is_empty() {
    let dir = tempdir().unwrap();
    let mut config = cfg(&dir, 1);
    config.auto_anchor = true;
    config.anchor_price = 0.0;
    let broker = Arc::new(MockBroker::new());
    broker.set_quote(
        "TESTSYM",
        Quote {
            ltp: 100.10,
            best_bid: 0.0,
            best_ask: 0.0,
        },
    );
    let mut engine = GridEngine::new(config, broker.clone());
    engine.initialize().await.unwrap();
    assert_eq!(engine.journal.anchor_price, 100.10);
}

#[tokio::test]
async fn poll_error_is_distinguished_from_empty_book() {
    let dir = tempdir().unwrap();
    let (mut engine, broker) = engine_with(cfg(&dir, 1)).await;

    broker
        .fail_order_fetch
        .store(true, std::sync::atomic::Ordering::SeqCst);
    assert_eq!(engine.poll_once().await, None);

    broker
        .fail_order_fetch
        .store(false, std::sync::atomic::Ordering::SeqCst);
    assert!(engine.poll_once().await.is_some());
}

#[tokio::test]
async fn loop_exits_cleanly_on_shutdown_signal() {
    let dir = tempdir().unwrap();
    let (tx, rx) = watch::channel(false);
    let broker = Arc::new(MockBroker::new());
    let mut engine = GridEngine::new(cfg(&dir, 1), broker);

    let handle = tokio::spawn(async move {
        engine.start(rx).await.unwrap();
        engine
    });
    tx.send(true).unwrap();
    let engine = handle.await.unwrap();
    assert!(!engine.running);
}
