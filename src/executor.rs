//! Atomic multi-leg basket execution.
//!
//! A basket is a set of order legs that must trade as one: either every
//! leg fills, or no unhedged exposure survives. The executor walks a
//! strict one-way state machine:
//!
//!   PRE_FLIGHT -> CONCURRENT_PLACEMENT -> FILL_MONITORING
//!     -> FILL_COMPLETION (success) | ABORT (failure)
//!
//! PRE_FLIGHT is the only side-effect-free phase: it validates freshness,
//! depth, budget, and slippage from cache reads alone, and a failure there
//! sends zero orders. Past placement, any leg that cannot complete is
//! cancelled, and any quantity already filled is liquidated with an
//! immediate opposing order.

use futures_util::future::join_all;
use rustc_hash::FxHashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{self, ExecConfig};
use crate::errors::ExecError;
use crate::exchange::ExchangeClient;
use crate::ledger::InventoryLedger;
use crate::market_data::MarketDataCache;
use crate::metrics::{Metrics, Timer};
use crate::risk::{KillReason, RiskController};
use crate::telemetry::{EventKind, TelemetryBus, TelemetryEvent};
use crate::types::{
    now_ms, Fill, OrderRequest, OrderState, OrderTicket, Side, TimeInForce, SETTLEMENT_CENTS,
    TICK_CENTS,
};

/// Delay before an instrument leaves the in-flight set after execution,
/// letting fills and book state settle before quoting resumes.
const RELEASE_DELAY: Duration = Duration::from_secs(10);

/// One instrument-side-price-size order within a basket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasketLeg {
    pub instrument: String,
    pub side: Side,
    pub price_cents: i64,
    pub size: i64,
}

/// Executor phase. No state is revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    PreFlight,
    ConcurrentPlacement,
    FillMonitoring,
    FillCompletion,
    Abort,
}

impl std::fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionPhase::PreFlight => "pre_flight",
            ExecutionPhase::ConcurrentPlacement => "concurrent_placement",
            ExecutionPhase::FillMonitoring => "fill_monitoring",
            ExecutionPhase::FillCompletion => "fill_completion",
            ExecutionPhase::Abort => "abort",
        };
        write!(f, "{}", s)
    }
}

/// Per-leg order status at basket termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegStatus {
    Pending,
    Filled,
    Partial,
    Failed,
    Cancelled,
}

/// Terminal view of one leg.
#[derive(Debug, Clone)]
pub struct LegOutcome {
    pub leg: BasketLeg,
    pub status: LegStatus,
    pub order_id: Option<String>,
    pub filled: i64,
    pub fill_cost_cents: i64,
}

/// Machine-readable result of one basket attempt. Failure paths are data,
/// never opaque errors: `phase` records where the attempt terminated and
/// `error` carries the typed reason, so a caller can distinguish "safe to
/// retry" from "requires human review".
#[derive(Debug, Clone)]
pub struct BasketResult {
    pub success: bool,
    /// Phase in which the basket terminated: FillCompletion on success,
    /// otherwise the phase where the failure occurred.
    pub phase: ExecutionPhase,
    pub legs: Vec<LegOutcome>,
    /// An unhedged partial fill occurred
    pub partial_fill: bool,
    /// Emergency liquidation orders were sent
    pub liquidated: bool,
    pub total_cost_cents: i64,
    /// Min fill across legs: the hedged quantity
    pub matched_contracts: i64,
    /// Typed failure on abort; `None` on success
    pub error: Option<ExecError>,
    pub latency_us: u64,
}

/// Per-instrument execution guard shared with the quote engine so quoting
/// never crosses an in-flight basket on the same instrument.
pub struct InFlightSet {
    inner: Mutex<FxHashSet<String>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FxHashSet::default()),
        }
    }

    pub fn contains(&self, instrument: &str) -> bool {
        self.inner.lock().unwrap().contains(instrument)
    }

    /// Acquire a single instrument. False if already held.
    pub fn try_acquire(&self, instrument: &str) -> bool {
        self.inner.lock().unwrap().insert(instrument.to_string())
    }

    /// Acquire every instrument or none.
    pub fn try_acquire_all(&self, instruments: &[String]) -> bool {
        let mut set = self.inner.lock().unwrap();
        if instruments.iter().any(|i| set.contains(i.as_str())) {
            return false;
        }
        for i in instruments {
            set.insert(i.clone());
        }
        true
    }

    pub fn release(&self, instrument: &str) {
        self.inner.lock().unwrap().remove(instrument);
    }

    pub fn release_all(&self, instruments: &[String]) {
        let mut set = self.inner.lock().unwrap();
        for i in instruments {
            set.remove(i.as_str());
        }
    }
}

impl Default for InFlightSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Working state for one leg during placement/monitoring.
struct LegState {
    leg: BasketLeg,
    ticket: Option<OrderTicket>,
    status: LegStatus,
    filled: i64,
    fill_cost_cents: i64,
}

impl LegState {
    fn outcome(&self) -> LegOutcome {
        LegOutcome {
            leg: self.leg.clone(),
            status: self.status,
            order_id: self.ticket.as_ref().map(|t| t.order_id.clone()),
            filled: self.filled,
            fill_cost_cents: self.fill_cost_cents,
        }
    }

    fn is_open(&self) -> bool {
        self.ticket.is_some() && matches!(self.status, LegStatus::Pending | LegStatus::Partial)
    }
}

enum MonitorOutcome {
    AllFilled,
    Incomplete { error: ExecError },
}

pub struct BasketExecutor {
    client: Arc<dyn ExchangeClient>,
    cache: Arc<MarketDataCache>,
    ledger: Arc<InventoryLedger>,
    risk: Arc<RiskController>,
    in_flight: Arc<InFlightSet>,
    metrics: Arc<Metrics>,
    telemetry: TelemetryBus,
    cfg: ExecConfig,
}

impl BasketExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        cache: Arc<MarketDataCache>,
        ledger: Arc<InventoryLedger>,
        risk: Arc<RiskController>,
        in_flight: Arc<InFlightSet>,
        metrics: Arc<Metrics>,
        telemetry: TelemetryBus,
        cfg: ExecConfig,
    ) -> Self {
        Self {
            client,
            cache,
            ledger,
            risk,
            in_flight,
            metrics,
            telemetry,
            cfg,
        }
    }

    /// Execute a basket to a terminal state. Never returns an opaque
    /// error: every outcome is a `BasketResult`.
    pub async fn execute(&self, legs: Vec<BasketLeg>) -> BasketResult {
        let timer = Timer::start();
        let basket_id = Uuid::new_v4().to_string();
        let instruments: Vec<String> = legs.iter().map(|l| l.instrument.clone()).collect();

        if legs.is_empty() {
            return rejected(&[], ExecError::validation("empty basket"), &timer);
        }

        if !self.in_flight.try_acquire_all(&instruments) {
            return rejected(
                &legs,
                ExecError::validation("instrument already in flight"),
                &timer,
            );
        }

        // ==== PRE_FLIGHT (side-effect-free) ====
        self.phase_event(&basket_id, ExecutionPhase::PreFlight);
        if let Err(reason) = self.pre_flight(&legs) {
            self.in_flight.release_all(&instruments);
            self.metrics.preflight_rejections.inc();
            info!(
                event = "basket_rejected",
                basket_id = %basket_id,
                reason = %reason,
                "Pre-flight rejected basket, zero orders sent"
            );
            return rejected(&legs, ExecError::validation(reason), &timer);
        }

        self.metrics.baskets_attempted.inc();
        let mut states: Vec<LegState> = legs
            .into_iter()
            .map(|leg| LegState {
                leg,
                ticket: None,
                status: LegStatus::Pending,
                filled: 0,
                fill_cost_cents: 0,
            })
            .collect();

        // ==== CONCURRENT_PLACEMENT ====
        self.phase_event(&basket_id, ExecutionPhase::ConcurrentPlacement);

        // Placement and monitoring span real time: re-validate freshness
        // immediately before commit. A leg gone stale mid-flight aborts
        // before anything is sent; already-placed legs are cancelled by
        // the shared abort path.
        if let Some(stale) = self.first_stale_leg(&states) {
            self.cancel_open(&mut states).await;
            return self
                .finish_abort(
                    &basket_id,
                    states,
                    ExecutionPhase::ConcurrentPlacement,
                    ExecError::validation(format!("stale before commit: {}", stale)),
                    &timer,
                    &instruments,
                )
                .await;
        }

        if self.place_all(&mut states).await {
            // At least one submission rejected or timed out: cancel every
            // acknowledged leg, leave no partial basket open.
            let failed = states
                .iter()
                .find(|s| s.status == LegStatus::Failed)
                .map(|s| s.leg.instrument.clone())
                .unwrap_or_default();
            self.cancel_open(&mut states).await;
            return self
                .finish_abort(
                    &basket_id,
                    states,
                    ExecutionPhase::ConcurrentPlacement,
                    ExecError::placement(failed, "submission rejected or timed out"),
                    &timer,
                    &instruments,
                )
                .await;
        }

        // ==== FILL_MONITORING ====
        self.phase_event(&basket_id, ExecutionPhase::FillMonitoring);
        match self.monitor_fills(&mut states).await {
            MonitorOutcome::AllFilled => {
                // ==== FILL_COMPLETION ====
                self.phase_event(&basket_id, ExecutionPhase::FillCompletion);
                self.apply_basket_fills(&states);
                let total_cost: i64 = states.iter().map(|s| s.fill_cost_cents).sum();
                let matched = states.iter().map(|s| s.filled).min().unwrap_or(0);
                self.metrics.baskets_completed.inc();
                self.release_delayed(&instruments);

                let result = BasketResult {
                    success: true,
                    phase: ExecutionPhase::FillCompletion,
                    legs: states.iter().map(|s| s.outcome()).collect(),
                    partial_fill: false,
                    liquidated: false,
                    total_cost_cents: total_cost,
                    matched_contracts: matched,
                    error: None,
                    latency_us: timer.elapsed_us(),
                };
                info!(
                    event = "basket_completed",
                    basket_id = %basket_id,
                    total_cost_cents = total_cost,
                    matched = matched,
                    latency_us = result.latency_us,
                    "Basket completed"
                );
                result
            }
            MonitorOutcome::Incomplete { error } => {
                self.cancel_open(&mut states).await;
                self.finish_abort(
                    &basket_id,
                    states,
                    ExecutionPhase::FillMonitoring,
                    error,
                    &timer,
                    &instruments,
                )
                .await
            }
        }
    }

    // ==== PRE_FLIGHT checks (pure cache reads) ====

    fn pre_flight(&self, legs: &[BasketLeg]) -> Result<(), String> {
        if !self.risk.is_running() {
            return Err(format!("risk state {}", self.risk.current_state()));
        }

        let threshold = config::staleness_threshold();
        let mut aggregate_cost = 0i64;

        for leg in legs {
            if leg.size <= 0 {
                return Err(format!("{}: non-positive size", leg.instrument));
            }
            if leg.price_cents < TICK_CENTS || leg.price_cents >= SETTLEMENT_CENTS {
                return Err(format!("{}: price out of range", leg.instrument));
            }

            let snap = match self.cache.get_snapshot(&leg.instrument) {
                Some(s) => s,
                None => return Err(format!("{}: no snapshot", leg.instrument)),
            };
            let age = snap.age();
            if age > threshold {
                self.cache.note_staleness(&leg.instrument, age);
                return Err(format!(
                    "{}: stale snapshot ({}ms)",
                    leg.instrument,
                    age.as_millis()
                ));
            }

            // Depth at the target price with safety buffer, absorbing book
            // movement during the placement window.
            let available = match leg.side {
                Side::Buy => {
                    if snap.ask.price_cents <= leg.price_cents && !snap.ask.is_empty() {
                        snap.ask.size
                    } else {
                        0
                    }
                }
                Side::Sell => {
                    if snap.bid.price_cents >= leg.price_cents && !snap.bid.is_empty() {
                        snap.bid.size
                    } else {
                        0
                    }
                }
            };
            let required = self.cfg.required_depth(leg.size);
            if available < required {
                return Err(format!(
                    "{}: depth {} < required {}",
                    leg.instrument, available, required
                ));
            }

            // Per-leg price deviation from mid
            let mid = snap.mid_cents();
            let deviation = (leg.price_cents as f64 - mid).abs();
            if deviation > self.cfg.max_slippage_cents as f64 {
                return Err(format!(
                    "{}: {}c deviates {:.1}c from mid (max {}c)",
                    leg.instrument, leg.price_cents, deviation, self.cfg.max_slippage_cents
                ));
            }

            if leg.side == Side::Buy {
                aggregate_cost += leg.price_cents * leg.size;
            }
        }

        if aggregate_cost > self.cfg.budget_cents {
            return Err(format!(
                "aggregate cost {}c exceeds budget {}c",
                aggregate_cost, self.cfg.budget_cents
            ));
        }

        Ok(())
    }

    fn first_stale_leg(&self, states: &[LegState]) -> Option<String> {
        let threshold = config::staleness_threshold();
        states
            .iter()
            .find(|s| self.cache.is_stale(&s.leg.instrument, threshold))
            .map(|s| s.leg.instrument.clone())
    }

    // ==== CONCURRENT_PLACEMENT ====

    /// Fire all leg submissions without waiting on one before starting the
    /// next. Returns true if any submission was rejected or timed out.
    async fn place_all(&self, states: &mut [LegState]) -> bool {
        let submits = states.iter().map(|s| {
            let req = OrderRequest {
                instrument: s.leg.instrument.clone(),
                side: s.leg.side,
                price_cents: s.leg.price_cents,
                size: s.leg.size,
                time_in_force: TimeInForce::Gtc,
            };
            let client = self.client.clone();
            let deadline = self.cfg.placement_timeout;
            async move {
                match timeout(deadline, client.submit_order(&req)).await {
                    Ok(Ok(ack)) => Ok((req, ack)),
                    Ok(Err(e)) => Err(format!("{}: {}", req.instrument, e)),
                    // A timeout is handled exactly like an explicit reject
                    Err(_) => Err(format!("{}: submit timeout", req.instrument)),
                }
            }
        });

        let results = join_all(submits).await;
        let mut any_failed = false;

        for (state, result) in states.iter_mut().zip(results) {
            match result {
                Ok((req, ack)) => {
                    self.metrics.orders_submitted.inc();
                    state.filled = ack.filled.min(state.leg.size);
                    state.fill_cost_cents = ack.fill_cost_cents;
                    state.ticket = Some(OrderTicket::from_ack(&req, &ack));
                    if state.filled >= state.leg.size {
                        state.status = LegStatus::Filled;
                    }
                }
                Err(e) => {
                    warn!(event = "leg_rejected", error = %e, "Leg submission failed");
                    state.status = LegStatus::Failed;
                    any_failed = true;
                }
            }
        }

        any_failed
    }

    // ==== FILL_MONITORING ====

    /// Poll fill status for all legs until every leg fills, a leg turns
    /// terminal without filling, or the deadline passes.
    async fn monitor_fills(&self, states: &mut [LegState]) -> MonitorOutcome {
        let deadline = tokio::time::Instant::now() + self.cfg.fill_deadline;
        let mut poll = tokio::time::interval(self.cfg.fill_poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            poll.tick().await;

            for state in states.iter_mut() {
                if !state.is_open() {
                    continue;
                }
                let order_id = state.ticket.as_ref().map(|t| t.order_id.clone()).unwrap();
                match self.client.order_status(&order_id).await {
                    Ok(status) => {
                        state.filled = status.filled.min(state.leg.size);
                        state.fill_cost_cents = status.fill_cost_cents;
                        match status.state {
                            OrderState::Filled => state.status = LegStatus::Filled,
                            OrderState::PartiallyFilled | OrderState::Cancelled
                                if state.filled > 0 && state.filled < state.leg.size =>
                            {
                                state.status = LegStatus::Partial
                            }
                            OrderState::Cancelled | OrderState::Rejected => {
                                state.status = LegStatus::Cancelled
                            }
                            OrderState::Open | OrderState::PartiallyFilled => {
                                // Still working; a resting partial is only
                                // terminal once cancelled or at deadline.
                                if state.filled >= state.leg.size {
                                    state.status = LegStatus::Filled;
                                }
                            }
                        }
                    }
                    Err(e) => warn!("[EXEC] status poll failed for {}: {}", order_id, e),
                }
            }

            if states.iter().all(|s| s.status == LegStatus::Filled) {
                return MonitorOutcome::AllFilled;
            }

            // A leg that went terminal short while the basket cannot
            // complete is the critical failure mode.
            if let Some(partial) = states.iter().find(|s| s.status == LegStatus::Partial) {
                return MonitorOutcome::Incomplete {
                    error: ExecError::PartialFill {
                        instrument: partial.leg.instrument.clone(),
                        filled: partial.filled,
                        wanted: partial.leg.size,
                    },
                };
            }
            if let Some(dead) = states.iter().find(|s| s.status == LegStatus::Cancelled) {
                return MonitorOutcome::Incomplete {
                    error: ExecError::placement(
                        dead.leg.instrument.clone(),
                        "cancelled by exchange without fill",
                    ),
                };
            }

            if tokio::time::Instant::now() >= deadline {
                let open = states
                    .iter()
                    .find(|s| s.status != LegStatus::Filled)
                    .map(|s| s.leg.instrument.clone())
                    .unwrap_or_default();
                return MonitorOutcome::Incomplete {
                    error: ExecError::placement(
                        open,
                        format!(
                            "fill deadline ({}ms) expired",
                            self.cfg.fill_deadline.as_millis()
                        ),
                    ),
                };
            }
        }
    }

    // ==== ABORT path ====

    /// Cancel every leg that still has an open order.
    async fn cancel_open(&self, states: &mut [LegState]) {
        let cancels = states
            .iter()
            .filter(|s| s.is_open())
            .filter_map(|s| s.ticket.as_ref())
            .map(|t| {
                let client = self.client.clone();
                let order_id = t.order_id.clone();
                let deadline = self.cfg.placement_timeout;
                async move {
                    match timeout(deadline, client.cancel_order(&order_id)).await {
                        Ok(Ok(())) => Ok(order_id),
                        Ok(Err(e)) => Err(format!("{}: {}", order_id, e)),
                        Err(_) => Err(format!("{}: cancel timeout", order_id)),
                    }
                }
            });

        for result in join_all(cancels).await {
            match result {
                Ok(order_id) => {
                    self.metrics.orders_cancelled.inc();
                    // Pick up any fill that landed before the cancel
                    if let Ok(status) = self.client.order_status(&order_id).await {
                        if let Some(state) = states.iter_mut().find(|s| {
                            s.ticket.as_ref().map(|t| t.order_id.as_str()) == Some(&order_id)
                        }) {
                            state.filled = status.filled.min(state.leg.size);
                            state.fill_cost_cents = status.fill_cost_cents;
                        }
                    }
                }
                Err(e) => warn!(event = "cancel_failed", error = %e, "Cancel failed"),
            }
        }

        for state in states.iter_mut() {
            if state.is_open() {
                state.status = if state.filled > 0 && state.filled < state.leg.size {
                    LegStatus::Partial
                } else if state.filled >= state.leg.size {
                    LegStatus::Filled
                } else {
                    LegStatus::Cancelled
                };
            }
        }
    }

    /// Terminal failure: liquidate anything filled, record fills, emit the
    /// abort result. The partially filled leg cannot be uncancelled, so an
    /// equal-and-opposite order flattens it.
    async fn finish_abort(
        &self,
        basket_id: &str,
        mut states: Vec<LegState>,
        failed_in: ExecutionPhase,
        error: ExecError,
        timer: &Timer,
        instruments: &[String],
    ) -> BasketResult {
        let partial_fill = states
            .iter()
            .any(|s| s.filled > 0 && s.filled < s.leg.size);
        let any_filled = states.iter().any(|s| s.filled > 0);
        let incomplete = states.iter().any(|s| s.filled < s.leg.size);

        let mut liquidated = false;
        if any_filled && incomplete {
            if partial_fill {
                self.metrics.partial_fills.inc();
                for s in states.iter().filter(|s| s.filled > 0 && s.filled < s.leg.size) {
                    self.telemetry.emit(
                        TelemetryEvent::new(EventKind::PartialFill)
                            .instrument(s.leg.instrument.clone())
                            .detail("filled", s.filled)
                            .detail("wanted", s.leg.size)
                            .detail("basket_id", basket_id),
                    );
                }
            }
            liquidated = self.liquidate_filled(basket_id, &mut states).await;

            if config::kill_on_partial_fill() {
                let instrument = states
                    .iter()
                    .find(|s| s.filled > 0)
                    .map(|s| s.leg.instrument.clone())
                    .unwrap_or_default();
                self.risk
                    .trigger_kill_switch(KillReason::PositionMismatch { instrument });
            }
        }

        self.metrics.baskets_aborted.inc();
        self.phase_event(basket_id, ExecutionPhase::Abort);
        self.release_delayed(instruments);

        warn!(
            event = "basket_aborted",
            basket_id = %basket_id,
            failed_in = %failed_in,
            error = %error,
            partial_fill = partial_fill,
            liquidated = liquidated,
            "Basket aborted"
        );
        BasketResult {
            success: false,
            phase: failed_in,
            legs: states.iter().map(|s| s.outcome()).collect(),
            partial_fill,
            liquidated,
            total_cost_cents: states.iter().map(|s| s.fill_cost_cents).sum(),
            matched_contracts: 0,
            error: Some(error),
            latency_us: timer.elapsed_us(),
        }
    }

    /// Send an immediate opposing IOC order for every filled quantity and
    /// record both sides in the ledger so no unhedged exposure survives
    /// the abort.
    async fn liquidate_filled(&self, basket_id: &str, states: &mut [LegState]) -> bool {
        let mut liquidated = false;

        for state in states.iter_mut() {
            if state.filled == 0 {
                continue;
            }

            // Record the original fill first
            self.apply_leg_fill(state);

            let unwind_side = state.leg.side.opposite();
            let price = self.liquidation_price(&state.leg.instrument, unwind_side, state.leg.price_cents);
            let req = OrderRequest {
                instrument: state.leg.instrument.clone(),
                side: unwind_side,
                price_cents: price,
                size: state.filled,
                time_in_force: TimeInForce::Ioc,
            };

            warn!(
                event = "liquidation",
                basket_id = %basket_id,
                instrument = %req.instrument,
                side = %req.side,
                qty = req.size,
                price_cents = req.price_cents,
                "Liquidating partial exposure"
            );

            match timeout(self.cfg.placement_timeout, self.client.submit_order(&req)).await {
                Ok(Ok(ack)) => {
                    self.metrics.orders_submitted.inc();
                    self.metrics.liquidations.inc();
                    liquidated = true;
                    self.telemetry.emit(
                        TelemetryEvent::new(EventKind::Liquidation)
                            .instrument(req.instrument.clone())
                            .detail("qty", req.size)
                            .detail("price_cents", req.price_cents)
                            .detail("filled", ack.filled)
                            .detail("basket_id", basket_id),
                    );
                    if ack.filled > 0 {
                        self.ledger.apply_fill(&Fill {
                            fill_id: format!("{}:liq", ack.order_id),
                            instrument: req.instrument.clone(),
                            side: unwind_side,
                            price_cents: price,
                            size: ack.filled,
                            micro_price_cents: self.micro_at(&req.instrument),
                            ts_ms: now_ms(),
                        });
                    }
                    if ack.filled < req.size {
                        warn!(
                            event = "liquidation_residual",
                            instrument = %req.instrument,
                            residual = req.size - ack.filled,
                            "Liquidation left residual exposure"
                        );
                    }
                }
                Ok(Err(e)) => {
                    warn!(event = "liquidation_failed", error = %e, "Liquidation order rejected");
                }
                Err(_) => {
                    warn!(event = "liquidation_failed", "Liquidation order timed out");
                }
            }
        }

        liquidated
    }

    /// Aggressive liquidation price: cross the touch by a configured
    /// offset so the unwind fills immediately.
    fn liquidation_price(&self, instrument: &str, side: Side, fallback_cents: i64) -> i64 {
        let aggression = self.cfg.liquidation_aggression_cents;
        let snap = self.cache.get_snapshot(instrument);
        let raw = match (side, snap) {
            (Side::Sell, Some(s)) if !s.bid.is_empty() => s.bid.price_cents - aggression,
            (Side::Buy, Some(s)) if !s.ask.is_empty() => s.ask.price_cents + aggression,
            (Side::Sell, _) => fallback_cents - aggression,
            (Side::Buy, _) => fallback_cents + aggression,
        };
        raw.clamp(TICK_CENTS, SETTLEMENT_CENTS - TICK_CENTS)
    }

    // ==== bookkeeping ====

    fn apply_basket_fills(&self, states: &[LegState]) {
        for state in states {
            self.apply_leg_fill(state);
        }
    }

    fn apply_leg_fill(&self, state: &LegState) {
        if state.filled == 0 {
            return;
        }
        let Some(ticket) = &state.ticket else { return };
        let price = if state.filled > 0 && state.fill_cost_cents > 0 {
            state.fill_cost_cents / state.filled
        } else {
            state.leg.price_cents
        };
        self.ledger.apply_fill(&Fill {
            fill_id: format!("{}:fill", ticket.order_id),
            instrument: state.leg.instrument.clone(),
            side: state.leg.side,
            price_cents: price,
            size: state.filled,
            micro_price_cents: self.micro_at(&state.leg.instrument),
            ts_ms: now_ms(),
        });
    }

    fn micro_at(&self, instrument: &str) -> Option<i64> {
        self.cache
            .get_snapshot(instrument)
            .map(|s| s.micro_price_cents.round() as i64)
    }

    fn phase_event(&self, basket_id: &str, phase: ExecutionPhase) {
        self.telemetry.emit(
            TelemetryEvent::new(EventKind::PhaseTransition)
                .detail("basket_id", basket_id)
                .detail("phase", phase.to_string()),
        );
    }

    /// Delayed release: quoting stays off the touched instruments briefly
    /// while fills and book state settle.
    fn release_delayed(&self, instruments: &[String]) {
        let in_flight = self.in_flight.clone();
        let instruments = instruments.to_vec();
        tokio::spawn(async move {
            tokio::time::sleep(RELEASE_DELAY).await;
            in_flight.release_all(&instruments);
        });
    }
}

/// Zero-order rejection result (pre-flight or guard failure).
fn rejected(legs: &[BasketLeg], error: ExecError, timer: &Timer) -> BasketResult {
    BasketResult {
        success: false,
        phase: ExecutionPhase::PreFlight,
        legs: legs
            .iter()
            .map(|leg| LegOutcome {
                leg: leg.clone(),
                status: LegStatus::Pending,
                order_id: None,
                filled: 0,
                fill_cost_cents: 0,
            })
            .collect(),
        partial_fill: false,
        liquidated: false,
        total_cost_cents: 0,
        matched_contracts: 0,
        error: Some(error),
        latency_us: timer.elapsed_us(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_all_or_nothing() {
        let set = InFlightSet::new();
        assert!(set.try_acquire("a"));

        // "a" is held: the basket acquiring [a, b] must get neither
        let basket = vec!["a".to_string(), "b".to_string()];
        assert!(!set.try_acquire_all(&basket));
        assert!(!set.contains("b"));

        set.release("a");
        assert!(set.try_acquire_all(&basket));
        assert!(set.contains("a"));
        assert!(set.contains("b"));

        set.release_all(&basket);
        assert!(!set.contains("a"));
        assert!(!set.contains("b"));
    }

    #[test]
    fn test_rejected_result_shape() {
        let legs = vec![BasketLeg {
            instrument: "tok".into(),
            side: Side::Buy,
            price_cents: 32,
            size: 10,
        }];
        let timer = Timer::start();
        let result = rejected(&legs, ExecError::validation("depth short"), &timer);

        assert!(!result.success);
        assert_eq!(result.phase, ExecutionPhase::PreFlight);
        assert_eq!(result.legs.len(), 1);
        assert_eq!(result.legs[0].filled, 0);
        assert!(result.legs[0].order_id.is_none());
        let err = result.error.unwrap();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("depth short"));
    }
}
