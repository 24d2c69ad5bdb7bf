//! Quote generation: inventory-skewed bid/ask around the micro-price.
//!
//! The reservation price shifts away from the micro-price against current
//! inventory so fills that reduce exposure are favored. The half-spread
//! widens with inventory and with the volatility regime, and is multiplied
//! up near the probability boundaries where Bernoulli variance collapses
//! and naive spreads get unrealistically tight exactly where adverse
//! selection is worst.

use std::sync::Arc;
use tracing::debug;

use crate::config::QuoteConfig;
use crate::executor::InFlightSet;
use crate::ledger::InventoryLedger;
use crate::market_data::MarketDataCache;
use crate::metrics::Metrics;
use crate::risk::{RiskController, TradingState};
use crate::telemetry::{EventKind, TelemetryBus, TelemetryEvent};
use crate::types::{snap_to_tick, SETTLEMENT_CENTS, TICK_CENTS};

/// Target two-sided quote for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub bid_price_cents: i64,
    pub ask_price_cents: i64,
    pub bid_size: i64,
    pub ask_size: i64,
}

/// Why no quote was produced. Every refusal is typed so the scheduling
/// loop can distinguish "wait" from "investigate".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuoteRefusal {
    /// Risk state is not RUNNING
    NotRunning(TradingState),
    /// No snapshot has ever arrived for the instrument
    NoSnapshot,
    /// Snapshot is older than the staleness threshold
    Stale { age_ms: u64 },
    /// A basket execution is in flight for this instrument (self-cross risk)
    InFlight,
}

impl std::fmt::Display for QuoteRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuoteRefusal::NotRunning(state) => write!(f, "risk state {}", state),
            QuoteRefusal::NoSnapshot => write!(f, "no snapshot"),
            QuoteRefusal::Stale { age_ms } => write!(f, "stale snapshot ({}ms)", age_ms),
            QuoteRefusal::InFlight => write!(f, "basket in flight"),
        }
    }
}

/// Reconciliation decision against an existing resting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteAction {
    /// New price within one tick of the resting order: keep queue position
    Leave,
    /// Cancel-and-replace at the new price
    Replace,
}

pub struct QuoteEngine {
    cfg: QuoteConfig,
    cache: Arc<MarketDataCache>,
    ledger: Arc<InventoryLedger>,
    risk: Arc<RiskController>,
    in_flight: Arc<InFlightSet>,
    metrics: Arc<Metrics>,
    telemetry: TelemetryBus,
}

impl QuoteEngine {
    pub fn new(
        cfg: QuoteConfig,
        cache: Arc<MarketDataCache>,
        ledger: Arc<InventoryLedger>,
        risk: Arc<RiskController>,
        in_flight: Arc<InFlightSet>,
        metrics: Arc<Metrics>,
        telemetry: TelemetryBus,
    ) -> Self {
        Self {
            cfg,
            cache,
            ledger,
            risk,
            in_flight,
            metrics,
            telemetry,
        }
    }

    /// Compute the target quote for an instrument, or a typed refusal.
    pub fn compute_quotes(&self, instrument: &str) -> Result<Quote, QuoteRefusal> {
        let state = self.risk.current_state();
        if state != TradingState::Running {
            return self.refuse(instrument, QuoteRefusal::NotRunning(state));
        }

        if self.in_flight.contains(instrument) {
            return self.refuse(instrument, QuoteRefusal::InFlight);
        }

        let threshold = crate::config::staleness_threshold();
        let snap = match self.cache.get_snapshot(instrument) {
            Some(s) => s,
            None => return self.refuse(instrument, QuoteRefusal::NoSnapshot),
        };
        let age = snap.age();
        if age > threshold {
            self.cache.note_staleness(instrument, age);
            return self.refuse(
                instrument,
                QuoteRefusal::Stale {
                    age_ms: age.as_millis() as u64,
                },
            );
        }

        let position = self.ledger.get_position(instrument);
        let inventory = position.qty as f64;
        let gamma = self.ledger.dynamic_risk_aversion(instrument);

        let micro = snap.micro_price_cents;
        let reservation = micro - inventory * gamma;

        let mut half_spread = (self.cfg.base_spread_cents / 2.0
            + inventory.abs() * self.cfg.widen_per_contract_cents)
            .max(self.cfg.min_half_spread_cents);

        // Bernoulli variance compensation near the boundaries
        let band = self.cfg.boundary_band_cents as f64;
        if micro < band || micro > SETTLEMENT_CENTS as f64 - band {
            half_spread *= self.cfg.boundary_spread_mult;
        }

        let bid_price_cents = snap_to_tick(reservation - half_spread);
        let mut ask_price_cents = snap_to_tick(reservation + half_spread);
        if ask_price_cents <= bid_price_cents {
            // Tick snapping collapsed the spread; never cross ourselves
            ask_price_cents = (bid_price_cents + TICK_CENTS).min(SETTLEMENT_CENTS - TICK_CENTS);
        }

        let (bid_size, ask_size) = self.sized_for_inventory(position.qty);

        debug!(
            event = "quote_computed",
            instrument = instrument,
            micro = micro,
            reservation = reservation,
            half_spread = half_spread,
            gamma = gamma,
            inventory = position.qty,
            bid = bid_price_cents,
            ask = ask_price_cents,
            "Quote computed"
        );
        self.metrics.quotes_computed.inc();

        Ok(Quote {
            bid_price_cents,
            ask_price_cents,
            bid_size,
            ask_size,
        })
    }

    /// Taper quoted size linearly toward zero as inventory approaches the
    /// cap on the risk-increasing side.
    fn sized_for_inventory(&self, inventory: i64) -> (i64, i64) {
        let max_inv = self.cfg.max_inventory.max(1);
        let scale = |room: i64| -> i64 {
            let room = room.clamp(0, max_inv);
            (self.cfg.quote_size * room + max_inv - 1) / max_inv
        };
        // Bid adds long exposure; ask adds short exposure
        let bid_size = scale(max_inv - inventory);
        let ask_size = scale(max_inv + inventory);
        (bid_size.min(self.cfg.quote_size), ask_size.min(self.cfg.quote_size))
    }

    /// Quote update policy: leave a resting order alone when the new price
    /// is within one tick (queue position beats a cosmetic reprice).
    pub fn reconcile(&self, resting_price_cents: i64, new_price_cents: i64) -> QuoteAction {
        if (new_price_cents - resting_price_cents).abs() <= TICK_CENTS {
            self.metrics.quotes_left_resting.inc();
            QuoteAction::Leave
        } else {
            self.metrics.quotes_replaced.inc();
            QuoteAction::Replace
        }
    }

    fn refuse(&self, instrument: &str, refusal: QuoteRefusal) -> Result<Quote, QuoteRefusal> {
        self.metrics.quotes_refused.inc();
        self.telemetry.emit(
            TelemetryEvent::new(EventKind::QuoteRefused)
                .instrument(instrument)
                .detail("reason", format!("{:?}", refusal)),
        );
        Err(refusal)
    }
}
