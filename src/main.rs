//! Demo wiring for the market maker core.
//!
//! Runs the full stack against the in-process simulated exchange: feed
//! ingestion, risk monitor, and a quoting loop over a handful of synthetic
//! instruments. Real deployments replace [`sim::SimExchange`] with a
//! transport-backed `ExchangeClient` and drive the same components.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, info_span, warn};

use prediction_market_mm::config::{ExecConfig, QuoteConfig};
use prediction_market_mm::exchange::ExchangeClient;
use prediction_market_mm::executor::{BasketExecutor, InFlightSet};
use prediction_market_mm::ledger::InventoryLedger;
use prediction_market_mm::logging;
use prediction_market_mm::market_data::{run_feed_loop, MarketDataCache};
use prediction_market_mm::metrics::Metrics;
use prediction_market_mm::quote::QuoteEngine;
use prediction_market_mm::risk::{run_monitor_loop, RiskController};
use prediction_market_mm::sim::SimExchange;
use prediction_market_mm::telemetry::TelemetryBus;
use prediction_market_mm::types::{BookLevel, Fill, MarketPayload};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before any config/logging initialization so OnceLock
    // caches see the configured values.
    dotenvy::dotenv().ok();

    let _log_guard = logging::init_logging();
    let run_id = logging::get_run_id();

    let metrics = Arc::new(Metrics::new());
    let (telemetry, mut telemetry_rx) = TelemetryBus::new();

    let dry_run = std::env::var("DRY_RUN")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(true);

    let root_span = info_span!("market_maker", run_id = %run_id, dry_run = dry_run);
    let _enter = root_span.enter();

    info!("Prediction Market MM starting");
    if dry_run {
        info!("   Mode: DRY RUN against simulated exchange");
    } else {
        warn!("   Mode: LIVE wiring requested, but only the sim client is bundled");
    }

    // Core components
    let client: Arc<SimExchange> = Arc::new(SimExchange::new().with_balance(100_000));
    let exchange: Arc<dyn ExchangeClient> = client.clone();

    let quote_cfg = QuoteConfig::from_env();
    let cache = Arc::new(MarketDataCache::new(metrics.clone(), telemetry.clone()));
    let ledger = Arc::new(InventoryLedger::new(
        quote_cfg.risk_aversion_base,
        quote_cfg.risk_aversion_cap,
    ));
    let risk = Arc::new(RiskController::new(metrics.clone(), telemetry.clone()));
    let in_flight = Arc::new(InFlightSet::new());

    let quote_engine = QuoteEngine::new(
        quote_cfg,
        cache.clone(),
        ledger.clone(),
        risk.clone(),
        in_flight.clone(),
        metrics.clone(),
        telemetry.clone(),
    );
    let _executor = Arc::new(BasketExecutor::new(
        exchange.clone(),
        cache.clone(),
        ledger.clone(),
        risk.clone(),
        in_flight.clone(),
        metrics.clone(),
        telemetry.clone(),
        ExecConfig::from_env(),
    ));

    risk.register_shutdown_callback(|| {
        warn!("[SHUTDOWN] cancel-all dispatched");
    });

    // Synthetic instruments the demo quotes
    let instruments = ["demo-yes", "demo-no"];
    for inst in instruments {
        cache.subscribe(inst);
        client.set_book(inst, BookLevel::new(48, 200), BookLevel::new(52, 180));
    }

    // Background tasks: feed ingestion, fill routing, risk monitor
    let (fill_tx, mut fill_rx) = mpsc::channel::<MarketPayload>(256);
    tokio::spawn(run_feed_loop(
        cache.clone(),
        exchange.clone(),
        risk.clone(),
        fill_tx,
    ));

    let fill_ledger = ledger.clone();
    let fill_cache = cache.clone();
    tokio::spawn(async move {
        while let Some(payload) = fill_rx.recv().await {
            if let MarketPayload::FillEvent {
                fill_id,
                instrument,
                side,
                price_cents,
                size,
                ts_ms,
                ..
            } = payload
            {
                let micro = fill_cache
                    .get_snapshot(&instrument)
                    .map(|s| s.micro_price_cents.round() as i64);
                fill_ledger.apply_fill(&Fill {
                    fill_id: fill_id.clone(),
                    instrument: instrument.clone(),
                    side,
                    price_cents,
                    size,
                    micro_price_cents: micro,
                    ts_ms,
                });

                // Resolve the markout once the horizon elapses
                let ledger = fill_ledger.clone();
                let cache = fill_cache.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(prediction_market_mm::config::markout_horizon()).await;
                    if let Some(snap) = cache.get_snapshot(&instrument) {
                        let later = snap.micro_price_cents.round() as i64;
                        if let Some(pnl) = ledger.record_markout(&fill_id, later) {
                            info!(
                                fill_id = %fill_id,
                                markout_cents = pnl,
                                "markout resolved"
                            );
                        }
                    }
                });
            }
        }
    });

    let (_monitor_shutdown_tx, monitor_shutdown_rx) = mpsc::channel(1);
    tokio::spawn(run_monitor_loop(
        risk.clone(),
        ledger.clone(),
        exchange.clone(),
        monitor_shutdown_rx,
    ));

    // Drain telemetry for the demo (a real deployment ships this to the
    // alerting collaborator)
    tokio::spawn(async move {
        while let Some(event) = telemetry_rx.recv().await {
            info!(
                kind = %event.kind,
                instrument = event.instrument.as_deref().unwrap_or(""),
                "telemetry consumed"
            );
        }
    });

    // Demo quoting loop: wiggle the sim books, recompute quotes
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    let mut step: i64 = 0;
    loop {
        tick.tick().await;
        step += 1;

        let drift = (step % 7) - 3; // deterministic wiggle
        for inst in instruments {
            client.set_book(
                inst,
                BookLevel::new(48 + drift, 200),
                BookLevel::new(52 + drift, 180),
            );
        }

        for inst in instruments {
            if let Some(snap) = cache.get_snapshot(inst) {
                ledger.record_mark(inst, snap.micro_price_cents);
            }
            match quote_engine.compute_quotes(inst) {
                Ok(quote) => info!(
                    instrument = inst,
                    bid = quote.bid_price_cents,
                    ask = quote.ask_price_cents,
                    "quote"
                ),
                Err(refusal) => info!(instrument = inst, reason = %refusal, "no quote"),
            }
        }

        if step % 20 == 0 {
            metrics.log_summary();
        }
    }
}
