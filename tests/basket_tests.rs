//! Basket executor scenarios against the simulated exchange.
//!
//! Covers the all-or-nothing contract: complete baskets settle into the
//! ledger, pre-flight failures send zero orders, and partial fills are
//! cancelled and liquidated so no unhedged exposure survives an abort.

use std::sync::Arc;

use prediction_market_mm::config::ExecConfig;
use prediction_market_mm::executor::{
    BasketExecutor, BasketLeg, ExecutionPhase, InFlightSet, LegStatus,
};
use prediction_market_mm::ledger::InventoryLedger;
use prediction_market_mm::market_data::MarketDataCache;
use prediction_market_mm::metrics::Metrics;
use prediction_market_mm::risk::{RiskController, TradingState};
use prediction_market_mm::sim::{FillScript, SimExchange};
use prediction_market_mm::telemetry::TelemetryBus;
use prediction_market_mm::types::{now_ms, BookLevel, MarketPayload, Side};

struct Stack {
    sim: Arc<SimExchange>,
    cache: Arc<MarketDataCache>,
    ledger: Arc<InventoryLedger>,
    risk: Arc<RiskController>,
    in_flight: Arc<InFlightSet>,
    executor: BasketExecutor,
}

fn stack() -> Stack {
    let (telemetry, _rx) = TelemetryBus::new();
    let metrics = Arc::new(Metrics::new());
    let sim = Arc::new(SimExchange::new().with_balance(100_000));
    let cache = Arc::new(MarketDataCache::new(metrics.clone(), telemetry.clone()));
    let ledger = Arc::new(InventoryLedger::new(0.1, 3.0));
    let risk = Arc::new(RiskController::new(metrics.clone(), telemetry.clone()));
    let in_flight = Arc::new(InFlightSet::new());
    let executor = BasketExecutor::new(
        sim.clone(),
        cache.clone(),
        ledger.clone(),
        risk.clone(),
        in_flight.clone(),
        metrics,
        telemetry,
        ExecConfig::default(),
    );
    Stack {
        sim,
        cache,
        ledger,
        risk,
        in_flight,
        executor,
    }
}

/// Feed a book where a buy at `price` passes depth and slippage checks.
/// The cache is fed directly; no feed loop runs in these tests.
fn feed_buyable(stack: &Stack, instrument: &str, price: i64, depth: i64) {
    let bid = BookLevel::new(price - 2, depth);
    let ask = BookLevel::new(price, depth);
    stack.cache.subscribe(instrument);
    stack.sim.set_book(instrument, bid, ask);
    stack.cache.apply(&MarketPayload::FullSnapshot {
        instrument: instrument.to_string(),
        bid,
        ask,
        ts_ms: now_ms(),
    });
}

fn buy_leg(instrument: &str, price: i64, size: i64) -> BasketLeg {
    BasketLeg {
        instrument: instrument.to_string(),
        side: Side::Buy,
        price_cents: price,
        size,
    }
}

#[tokio::test]
async fn scenario_a_three_leg_basket_completes() {
    let s = stack();
    // Prices [0.32, 0.33, 0.32]: sum 0.97, depth ample on all legs
    feed_buyable(&s, "leg-a", 32, 50);
    feed_buyable(&s, "leg-b", 33, 50);
    feed_buyable(&s, "leg-c", 32, 50);

    let result = s
        .executor
        .execute(vec![
            buy_leg("leg-a", 32, 10),
            buy_leg("leg-b", 33, 10),
            buy_leg("leg-c", 32, 10),
        ])
        .await;

    assert!(result.success, "reason: {:?}", result.error);
    assert_eq!(result.phase, ExecutionPhase::FillCompletion);
    assert_eq!(result.matched_contracts, 10);
    // Total cost = 0.97 x 10 contracts x 100c
    assert_eq!(result.total_cost_cents, 970);
    assert!(result.legs.iter().all(|l| l.status == LegStatus::Filled));
    assert_eq!(s.sim.submit_count(), 3);

    // Fills settled into the ledger
    assert_eq!(s.ledger.get_position("leg-a").qty, 10);
    assert_eq!(s.ledger.get_position("leg-b").qty, 10);
    assert_eq!(s.ledger.get_position("leg-c").qty, 10);
}

#[tokio::test]
async fn scenario_b_partial_fill_cancels_and_liquidates() {
    let s = stack();
    feed_buyable(&s, "leg-a", 32, 50);
    feed_buyable(&s, "leg-b", 33, 50);
    feed_buyable(&s, "leg-c", 32, 50);

    // Leg B fills half and goes terminal: the critical failure mode
    s.sim.set_script("leg-a", FillScript::NoFill);
    s.sim.set_script("leg-b", FillScript::Partial(5));
    s.sim.set_script("leg-c", FillScript::NoFill);

    let result = s
        .executor
        .execute(vec![
            buy_leg("leg-a", 32, 10),
            buy_leg("leg-b", 33, 10),
            buy_leg("leg-c", 32, 10),
        ])
        .await;

    assert!(!result.success);
    assert_eq!(result.phase, ExecutionPhase::FillMonitoring);
    assert!(result.partial_fill, "partial_fill flag must be set");
    assert!(result.liquidated, "filled quantity must be liquidated");

    // Open legs were cancelled
    assert!(s.sim.cancel_count() >= 2);

    // The partial leg was flattened: +5 fill, -5 liquidation
    assert_eq!(s.ledger.get_position("leg-b").qty, 0);
    // Untouched legs carry no position
    assert_eq!(s.ledger.get_position("leg-a").qty, 0);
    assert_eq!(s.ledger.get_position("leg-c").qty, 0);
}

#[tokio::test]
async fn preflight_depth_failure_sends_zero_orders() {
    let s = stack();
    // Depth 10 < required 12 (1.2x buffer on size 10)
    feed_buyable(&s, "leg-a", 32, 10);

    let result = s.executor.execute(vec![buy_leg("leg-a", 32, 10)]).await;

    assert!(!result.success);
    assert_eq!(result.phase, ExecutionPhase::PreFlight);
    assert_eq!(s.sim.submit_count(), 0, "pre-flight failure must not submit");
    assert!(result.error.unwrap().to_string().contains("depth"));
}

#[tokio::test]
async fn preflight_budget_failure_sends_zero_orders() {
    let s = stack();
    feed_buyable(&s, "leg-a", 50, 5000);

    // 50c x 300 contracts = 15000c > default 10000c budget
    let result = s.executor.execute(vec![buy_leg("leg-a", 50, 300)]).await;

    assert!(!result.success);
    assert_eq!(s.sim.submit_count(), 0);
    assert!(result.error.unwrap().to_string().contains("budget"));
}

#[tokio::test]
async fn preflight_slippage_failure_sends_zero_orders() {
    let s = stack();
    // Mid = 31; a buy at 40 deviates 9c > 3c bound
    feed_buyable(&s, "leg-a", 32, 50);

    let result = s.executor.execute(vec![buy_leg("leg-a", 40, 10)]).await;

    assert!(!result.success);
    assert_eq!(s.sim.submit_count(), 0);
    assert!(result.error.unwrap().to_string().contains("mid"));
}

#[tokio::test]
async fn preflight_staleness_failure_sends_zero_orders() {
    let s = stack();
    // Subscribed but never fed: stale/absent by definition
    s.cache.subscribe("leg-a");

    let result = s.executor.execute(vec![buy_leg("leg-a", 32, 10)]).await;

    assert!(!result.success);
    assert_eq!(result.phase, ExecutionPhase::PreFlight);
    assert_eq!(s.sim.submit_count(), 0);
}

#[tokio::test]
async fn placement_rejection_cancels_other_legs() {
    let s = stack();
    feed_buyable(&s, "leg-a", 32, 50);
    feed_buyable(&s, "leg-b", 33, 50);

    s.sim.set_script("leg-a", FillScript::NoFill);
    s.sim.set_script("leg-b", FillScript::Reject);

    let result = s
        .executor
        .execute(vec![buy_leg("leg-a", 32, 10), buy_leg("leg-b", 33, 10)])
        .await;

    assert!(!result.success);
    assert_eq!(result.phase, ExecutionPhase::ConcurrentPlacement);
    assert!(!result.partial_fill);
    assert!(!result.liquidated);
    // Both submits were attempted, the surviving leg was cancelled
    assert_eq!(s.sim.submit_count(), 2);
    assert_eq!(s.sim.cancel_count(), 1);
    // No position change on a pure placement failure
    assert_eq!(s.ledger.get_position("leg-a").qty, 0);
    assert_eq!(s.ledger.get_position("leg-b").qty, 0);
    // Risk state untouched: placement errors are recoverable
    assert_eq!(s.risk.current_state(), TradingState::Running);
}

#[tokio::test]
async fn atomicity_every_filled_leg_has_opposing_liquidation() {
    let s = stack();
    feed_buyable(&s, "leg-a", 32, 50);
    feed_buyable(&s, "leg-b", 33, 50);

    // Leg A fills in full immediately, leg B only partially: on abort the
    // fully filled leg must be flattened too, not just the partial one.
    s.sim.set_script("leg-a", FillScript::Immediate);
    s.sim.set_script("leg-b", FillScript::Partial(3));

    let result = s
        .executor
        .execute(vec![buy_leg("leg-a", 32, 10), buy_leg("leg-b", 33, 10)])
        .await;

    assert!(!result.success);
    assert!(result.liquidated);
    // Net position reflects no unhedged single leg
    assert_eq!(s.ledger.get_position("leg-a").qty, 0);
    assert_eq!(s.ledger.get_position("leg-b").qty, 0);
}

#[tokio::test]
async fn in_flight_instrument_rejects_second_basket() {
    let s = stack();
    feed_buyable(&s, "leg-a", 32, 50);

    assert!(s.in_flight.try_acquire("leg-a"));
    let result = s.executor.execute(vec![buy_leg("leg-a", 32, 10)]).await;

    assert!(!result.success);
    assert_eq!(s.sim.submit_count(), 0);
    assert!(result.error.unwrap().to_string().contains("in flight"));
}

#[tokio::test]
async fn killed_state_blocks_preflight() {
    let s = stack();
    feed_buyable(&s, "leg-a", 32, 50);
    s.risk
        .trigger_kill_switch(prediction_market_mm::risk::KillReason::Manual {
            reason: "test".into(),
        });

    let result = s.executor.execute(vec![buy_leg("leg-a", 32, 10)]).await;

    assert!(!result.success);
    assert_eq!(result.phase, ExecutionPhase::PreFlight);
    assert_eq!(s.sim.submit_count(), 0, "no orders once killed");
}
