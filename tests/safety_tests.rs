//! Safety-property tests: staleness refusal, kill-switch monotonicity,
//! idempotent fill application, and checkpoint rehydration validation.

use std::sync::Arc;
use std::time::Duration;

use prediction_market_mm::checkpoint::{export_state, import_state};
use prediction_market_mm::config::QuoteConfig;
use prediction_market_mm::executor::InFlightSet;
use prediction_market_mm::ledger::InventoryLedger;
use prediction_market_mm::market_data::MarketDataCache;
use prediction_market_mm::metrics::Metrics;
use prediction_market_mm::quote::{QuoteEngine, QuoteRefusal};
use prediction_market_mm::risk::{KillReason, RiskController, TradingState};
use prediction_market_mm::sim::SimExchange;
use prediction_market_mm::telemetry::TelemetryBus;
use prediction_market_mm::types::{now_ms, BookLevel, Fill, MarketPayload, Side};

struct Stack {
    cache: Arc<MarketDataCache>,
    ledger: Arc<InventoryLedger>,
    risk: Arc<RiskController>,
    engine: QuoteEngine,
    telemetry: TelemetryBus,
}

fn stack() -> Stack {
    let (telemetry, _rx) = TelemetryBus::new();
    let metrics = Arc::new(Metrics::new());
    let cache = Arc::new(MarketDataCache::new(metrics.clone(), telemetry.clone()));
    let ledger = Arc::new(InventoryLedger::new(0.1, 3.0));
    let risk = Arc::new(RiskController::new(metrics.clone(), telemetry.clone()));
    let engine = QuoteEngine::new(
        QuoteConfig::default(),
        cache.clone(),
        ledger.clone(),
        risk.clone(),
        Arc::new(InFlightSet::new()),
        metrics,
        telemetry.clone(),
    );
    Stack {
        cache,
        ledger,
        risk,
        engine,
        telemetry,
    }
}

fn feed(cache: &MarketDataCache, instrument: &str, bid: (i64, i64), ask: (i64, i64)) {
    cache.subscribe(instrument);
    cache.apply(&MarketPayload::FullSnapshot {
        instrument: instrument.to_string(),
        bid: BookLevel::new(bid.0, bid.1),
        ask: BookLevel::new(ask.0, ask.1),
        ts_ms: now_ms(),
    });
}

fn fill(id: &str, instrument: &str, side: Side, price: i64, size: i64) -> Fill {
    Fill {
        fill_id: id.to_string(),
        instrument: instrument.to_string(),
        side,
        price_cents: price,
        size,
        micro_price_cents: None,
        ts_ms: now_ms(),
    }
}

// Scenario C: staleness beyond the 2.0s threshold refuses quoting.
#[tokio::test]
async fn scenario_c_stale_snapshot_refuses_quotes() {
    let s = stack();
    feed(&s.cache, "tok", (48, 100), (52, 100));

    // Fresh snapshot quotes fine
    assert!(s.engine.compute_quotes("tok").is_ok());

    // Let the snapshot age past the 2.0s default threshold
    tokio::time::sleep(Duration::from_millis(2_200)).await;

    assert!(s.cache.is_stale("tok", Duration::from_secs(2)));
    match s.engine.compute_quotes("tok") {
        Err(QuoteRefusal::Stale { age_ms }) => assert!(age_ms >= 2_000),
        other => panic!("expected stale refusal, got {:?}", other),
    }
}

#[tokio::test]
async fn kill_switch_is_monotonic_without_reset() {
    let s = stack();
    feed(&s.cache, "tok", (48, 100), (52, 100));

    s.risk.trigger_kill_switch(KillReason::Manual {
        reason: "operator".into(),
    });
    assert_eq!(s.risk.current_state(), TradingState::Killed);

    // No sequence of ordinary calls returns it to RUNNING
    s.risk.feed_up();
    s.risk.update_equity(1_000_000);
    s.risk.feed_down();
    s.risk.feed_up();
    assert_eq!(s.risk.current_state(), TradingState::Killed);
    assert!(matches!(
        s.engine.compute_quotes("tok"),
        Err(QuoteRefusal::NotRunning(TradingState::Killed))
    ));

    // Only the explicit operator reset recovers
    s.risk.reset();
    assert_eq!(s.risk.current_state(), TradingState::Running);
    assert!(s.engine.compute_quotes("tok").is_ok());
}

// Scenario D: a 2.5% drawdown against a 2% limit kills within one update,
// and every subsequent quote request refuses.
#[tokio::test]
async fn scenario_d_drawdown_kills_and_quotes_refuse() {
    let s = stack();
    feed(&s.cache, "tok", (48, 100), (52, 100));

    s.risk.update_equity(10_000);
    s.risk.update_equity(9_750);

    assert_eq!(s.risk.current_state(), TradingState::Killed);
    assert!(matches!(
        s.risk.kill_reasons()[0],
        KillReason::Drawdown { .. }
    ));

    for _ in 0..5 {
        assert!(matches!(
            s.engine.compute_quotes("tok"),
            Err(QuoteRefusal::NotRunning(TradingState::Killed))
        ));
    }
}

#[tokio::test]
async fn duplicate_fill_delivery_does_not_double_count() {
    let s = stack();

    let f = fill("dup-1", "tok", Side::Buy, 40, 10);
    s.ledger.apply_fill(&f);
    s.ledger.apply_fill(&f);
    s.ledger.apply_fill(&f);

    let position = s.ledger.get_position("tok");
    assert_eq!(position.qty, 10, "duplicate delivery must be idempotent");
}

#[tokio::test]
async fn rehydrate_with_matching_balance_restores_positions() {
    let s = stack();
    let sim = Arc::new(SimExchange::new());

    s.ledger.apply_fill(&fill("f1", "tok", Side::Buy, 40, 10));
    s.ledger.record_mark("tok", 45.0);
    s.risk.update_equity(10_050); // cash 10000 + 50 unrealized
    let snapshot = export_state(&s.ledger, &s.risk);

    // Fresh process: empty ledger, matching exchange balance
    let fresh_ledger = InventoryLedger::new(0.1, 3.0);
    let (bus, _rx) = TelemetryBus::new();
    let fresh_risk = RiskController::new(Arc::new(Metrics::new()), bus);
    sim.set_balance(10_000);

    import_state(&snapshot, &fresh_ledger, &fresh_risk, sim, &s.telemetry)
        .await
        .expect("matching balance must rehydrate");

    assert_eq!(fresh_ledger.get_position("tok").qty, 10);
    assert_eq!(fresh_risk.peak_equity_cents(), 10_050);
    assert_eq!(fresh_risk.current_state(), TradingState::Running);
}

#[tokio::test]
async fn rehydrate_with_mismatched_balance_trips_kill_switch() {
    let s = stack();
    let sim = Arc::new(SimExchange::new());

    s.ledger.apply_fill(&fill("f1", "tok", Side::Buy, 40, 10));
    s.ledger.record_mark("tok", 45.0);
    s.risk.update_equity(10_050);
    let snapshot = export_state(&s.ledger, &s.risk);

    let fresh_ledger = InventoryLedger::new(0.1, 3.0);
    let (bus, _rx) = TelemetryBus::new();
    let fresh_risk = RiskController::new(Arc::new(Metrics::new()), bus);
    // Exchange reports 5000c less than the snapshot claims
    sim.set_balance(5_000);

    let result = import_state(&snapshot, &fresh_ledger, &fresh_risk, sim, &s.telemetry).await;

    assert!(result.is_err());
    assert_eq!(fresh_risk.current_state(), TradingState::Killed);
    assert!(matches!(
        fresh_risk.kill_reasons()[0],
        KillReason::RehydrateMismatch { .. }
    ));
    // Positions were not restored
    assert_eq!(fresh_ledger.get_position("tok").qty, 0);
}

#[tokio::test]
async fn degraded_state_refuses_quotes_but_recovers() {
    let s = stack();
    feed(&s.cache, "tok", (48, 100), (52, 100));

    // Force DEGRADED through the public surface is monitor-driven; the
    // quote gate itself must refuse anything that is not RUNNING.
    s.risk.trigger_kill_switch(KillReason::Manual {
        reason: "halt".into(),
    });
    assert!(s.engine.compute_quotes("tok").is_err());
    s.risk.reset();

    feed(&s.cache, "tok", (48, 100), (52, 100));
    assert!(s.engine.compute_quotes("tok").is_ok());
}
