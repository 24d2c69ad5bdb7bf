//! Risk controller: trading-state machine, kill switch, and the background
//! equity/connectivity monitor.
//!
//! The state lives in one atomic so every quoting/execution entry point
//! can gate on it without taking a lock; a trigger is visible to all
//! readers within the store. Shutdown callbacks (cancel-all, strategy
//! halt) run on spawned tasks so slow I/O never delays the state
//! transition itself. KILLED is one-way: only an explicit operator
//! `reset()` leaves it.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{self, MONITOR_INTERVAL};
use crate::exchange::ExchangeClient;
use crate::ledger::InventoryLedger;
use crate::metrics::Metrics;
use crate::telemetry::{EventKind, TelemetryBus, TelemetryEvent};

/// Trading state. DEGRADED is reversible; KILLED is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingState {
    Running,
    Degraded,
    Killed,
}

impl TradingState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TradingState::Running,
            1 => TradingState::Degraded,
            _ => TradingState::Killed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TradingState::Running => 0,
            TradingState::Degraded => 1,
            TradingState::Killed => 2,
        }
    }
}

impl std::fmt::Display for TradingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingState::Running => write!(f, "running"),
            TradingState::Degraded => write!(f, "degraded"),
            TradingState::Killed => write!(f, "killed"),
        }
    }
}

/// Why the kill switch fired.
#[derive(Debug, Clone, PartialEq)]
pub enum KillReason {
    /// Drawdown from peak equity exceeded the limit
    Drawdown { drawdown_bps: u32, limit_bps: u32 },
    /// Feed disconnected past the hard timeout
    FeedTimeout { elapsed: Duration },
    /// Unhedged exposure after a partial fill
    PositionMismatch { instrument: String },
    /// Rehydrated state disagreed with exchange balances
    RehydrateMismatch { delta_cents: i64 },
    /// Operator-triggered shutdown
    Manual { reason: String },
}

impl std::fmt::Display for KillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillReason::Drawdown {
                drawdown_bps,
                limit_bps,
            } => write!(
                f,
                "drawdown {}bps > limit {}bps",
                drawdown_bps, limit_bps
            ),
            KillReason::FeedTimeout { elapsed } => {
                write!(f, "feed down for {:.1}s", elapsed.as_secs_f64())
            }
            KillReason::PositionMismatch { instrument } => {
                write!(f, "unhedged exposure on {}", instrument)
            }
            KillReason::RehydrateMismatch { delta_cents } => {
                write!(f, "rehydrate mismatch of {} cents", delta_cents)
            }
            KillReason::Manual { reason } => write!(f, "manual: {}", reason),
        }
    }
}

type ShutdownCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct EquityTrack {
    equity_cents: i64,
    peak_equity_cents: i64,
}

struct FeedTrack {
    down_since: Option<Instant>,
}

/// Central risk state: equity watermarks, connectivity, kill switch.
pub struct RiskController {
    state: AtomicU8,
    equity: Mutex<EquityTrack>,
    feed: Mutex<FeedTrack>,
    callbacks: Mutex<Vec<ShutdownCallback>>,
    kill_reasons: Mutex<Vec<KillReason>>,
    metrics: Arc<Metrics>,
    telemetry: TelemetryBus,
}

impl RiskController {
    pub fn new(metrics: Arc<Metrics>, telemetry: TelemetryBus) -> Self {
        Self {
            state: AtomicU8::new(TradingState::Running.as_u8()),
            equity: Mutex::new(EquityTrack::default()),
            feed: Mutex::new(FeedTrack { down_since: None }),
            callbacks: Mutex::new(Vec::new()),
            kill_reasons: Mutex::new(Vec::new()),
            metrics,
            telemetry,
        }
    }

    /// Fast atomic read for hot paths.
    #[inline]
    pub fn current_state(&self) -> TradingState {
        TradingState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether quoting/execution entry points may proceed.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.current_state() == TradingState::Running
    }

    /// Register a callback run on every kill-switch trigger (cancel-all,
    /// strategy halt). Dispatched on a spawned task, never inline.
    pub fn register_shutdown_callback<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().push(Arc::new(f));
    }

    /// Trip the kill switch. One-way; later triggers only add reasons.
    pub fn trigger_kill_switch(&self, reason: KillReason) {
        let prev = self
            .state
            .swap(TradingState::Killed.as_u8(), Ordering::AcqRel);
        self.kill_reasons.lock().unwrap().push(reason.clone());

        if TradingState::from_u8(prev) != TradingState::Killed {
            self.metrics.kill_switch_trips.inc();
            error!(
                event = "kill_switch",
                reason = %reason,
                "KILL SWITCH TRIGGERED - trading halted"
            );
            self.telemetry.emit(
                TelemetryEvent::new(EventKind::KillSwitch).detail("reason", reason.to_string()),
            );

            // Callbacks run off the trigger path; a slow cancel-all must
            // not delay state visibility.
            let callbacks: Vec<ShutdownCallback> =
                self.callbacks.lock().unwrap().iter().cloned().collect();
            for cb in callbacks {
                tokio::spawn(async move {
                    (*cb)();
                });
            }
        }
    }

    /// Reasons recorded since the last reset.
    pub fn kill_reasons(&self) -> Vec<KillReason> {
        self.kill_reasons.lock().unwrap().clone()
    }

    /// Explicit operator reset: the only path out of KILLED. Also resets
    /// the equity high-water mark so a restart does not instantly re-trip.
    pub fn reset(&self) {
        let mut equity = self.equity.lock().unwrap();
        equity.peak_equity_cents = equity.equity_cents;
        drop(equity);

        self.kill_reasons.lock().unwrap().clear();
        self.state
            .store(TradingState::Running.as_u8(), Ordering::Release);
        warn!(event = "risk_reset", "Risk state reset by operator");
        self.telemetry
            .emit(TelemetryEvent::new(EventKind::RiskStateChange).detail("state", "running"));
    }

    /// Update equity and evaluate the drawdown trigger.
    pub fn update_equity(&self, equity_cents: i64) {
        let (drawdown_bps, peak) = {
            let mut track = self.equity.lock().unwrap();
            track.equity_cents = equity_cents;
            if equity_cents > track.peak_equity_cents {
                track.peak_equity_cents = equity_cents;
            }
            let peak = track.peak_equity_cents;
            let dd = if peak > 0 {
                ((peak - equity_cents).max(0) * 10_000 / peak) as u32
            } else {
                0
            };
            (dd, peak)
        };

        self.metrics.equity_cents.set(equity_cents);

        let limit_bps = config::max_drawdown_bps();
        if drawdown_bps > limit_bps {
            warn!(
                event = "drawdown_breach",
                equity_cents = equity_cents,
                peak_cents = peak,
                drawdown_bps = drawdown_bps,
                limit_bps = limit_bps,
                "Drawdown limit breached"
            );
            self.trigger_kill_switch(KillReason::Drawdown {
                drawdown_bps,
                limit_bps,
            });
        }
    }

    pub fn equity_cents(&self) -> i64 {
        self.equity.lock().unwrap().equity_cents
    }

    pub fn peak_equity_cents(&self) -> i64 {
        self.equity.lock().unwrap().peak_equity_cents
    }

    /// Seed the high-water mark (checkpoint import).
    pub fn restore_peak_equity(&self, peak_cents: i64) {
        self.equity.lock().unwrap().peak_equity_cents = peak_cents;
    }

    /// Feed loop reports the connection lost. Degrades after the timeout;
    /// the transition to DEGRADED is evaluated on the monitor tick.
    pub fn feed_down(&self) {
        let mut feed = self.feed.lock().unwrap();
        if feed.down_since.is_none() {
            feed.down_since = Some(Instant::now());
        }
    }

    /// Feed loop reports the connection healthy again.
    pub fn feed_up(&self) {
        self.feed.lock().unwrap().down_since = None;
        // Recovery: DEGRADED -> RUNNING. Never touches KILLED.
        let _ = self.state.compare_exchange(
            TradingState::Degraded.as_u8(),
            TradingState::Running.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Evaluate connectivity, called from the monitor tick.
    fn check_feed(&self) {
        let down_for = self.feed.lock().unwrap().down_since.map(|t| t.elapsed());
        if let Some(elapsed) = down_for {
            if elapsed > config::feed_timeout()
                && self.current_state() == TradingState::Running
            {
                warn!(
                    event = "feed_degraded",
                    down_secs = elapsed.as_secs(),
                    "Feed down past timeout, degrading"
                );
                let _ = self.state.compare_exchange(
                    TradingState::Running.as_u8(),
                    TradingState::Degraded.as_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                self.telemetry.emit(
                    TelemetryEvent::new(EventKind::RiskStateChange)
                        .detail("state", "degraded")
                        .detail("feed_down_secs", elapsed.as_secs()),
                );
            }
        }
    }
}

/// Background monitor: recomputes equity (exchange balance plus marked
/// unrealized P&L) and evaluates connectivity on a fixed interval,
/// independent of trading activity. Runs until `shutdown` fires.
pub async fn run_monitor_loop(
    risk: Arc<RiskController>,
    ledger: Arc<InventoryLedger>,
    client: Arc<dyn ExchangeClient>,
    mut shutdown: mpsc::Receiver<()>,
) {
    let mut tick = tokio::time::interval(MONITOR_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!("[RISK] monitor started");

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.recv() => {
                info!("[RISK] monitor stopped");
                return;
            }
        }

        match client.get_balance().await {
            Ok(balance_cents) => {
                let equity = balance_cents + ledger.total_unrealized_cents();
                risk.update_equity(equity);
            }
            Err(e) => warn!("[RISK] balance poll failed: {}", e),
        }

        risk.check_feed();
        risk.metrics
            .realized_pnl_cents
            .set(ledger.total_realized_cents());
        risk.metrics.open_positions.set(ledger.open_positions() as i64);
    }
}
