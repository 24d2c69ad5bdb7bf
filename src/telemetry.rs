//! Structured telemetry events for the external logging/alerting collaborator.
//!
//! Every phase transition, kill-switch trigger, staleness detection, and
//! partial-fill/liquidation event is published here. Events carry a kind, a
//! wall-clock timestamp, the instrument where applicable, and a free-form
//! detail map. Emission never blocks a trading path: the bus drops the
//! event (and counts the drop) when the consumer falls behind.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::types::now_ms;

/// Bus capacity before events are dropped.
const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Basket executor moved to a new phase
    PhaseTransition,
    /// Kill switch fired
    KillSwitch,
    /// Risk state changed (Running/Degraded/Killed)
    RiskStateChange,
    /// Snapshot crossed the staleness threshold
    StalenessDetected,
    /// Silence past the liveness bound; REST refresh requested
    SuspectedGap,
    /// A leg filled partially while the basket could not complete
    PartialFill,
    /// Emergency opposing order sent for a partial fill
    Liquidation,
    /// Quote engine refused to quote
    QuoteRefused,
    /// Feed connection re-established
    Reconnect,
    /// Rehydrated state rejected against exchange balances
    RehydrateMismatch,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::PhaseTransition => "phase_transition",
            EventKind::KillSwitch => "kill_switch",
            EventKind::RiskStateChange => "risk_state_change",
            EventKind::StalenessDetected => "staleness_detected",
            EventKind::SuspectedGap => "suspected_gap",
            EventKind::PartialFill => "partial_fill",
            EventKind::Liquidation => "liquidation",
            EventKind::QuoteRefused => "quote_refused",
            EventKind::Reconnect => "reconnect",
            EventKind::RehydrateMismatch => "rehydrate_mismatch",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub kind: EventKind,
    pub ts_ms: u64,
    pub instrument: Option<String>,
    pub detail: Map<String, Value>,
}

impl TelemetryEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            ts_ms: now_ms(),
            instrument: None,
            detail: Map::new(),
        }
    }

    pub fn instrument(mut self, instrument: impl Into<String>) -> Self {
        self.instrument = Some(instrument.into());
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }
}

/// Fan-in bus for telemetry events. Cheap to clone; all clones feed the
/// single receiver handed to the external collaborator.
#[derive(Clone)]
pub struct TelemetryBus {
    tx: mpsc::Sender<TelemetryEvent>,
    dropped: Arc<AtomicU64>,
}

impl TelemetryBus {
    pub fn new() -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::channel(BUS_CAPACITY);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Publish an event without blocking. Also mirrored to tracing so the
    /// log stream stays self-contained even if no consumer is attached.
    pub fn emit(&self, event: TelemetryEvent) {
        let detail_json = Value::Object(event.detail.clone());
        info!(
            event = %event.kind,
            instrument = event.instrument.as_deref().unwrap_or(""),
            detail = %detail_json,
            "telemetry"
        );

        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of events dropped due to a slow consumer.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_delivers_event() {
        let (bus, mut rx) = TelemetryBus::new();
        bus.emit(
            TelemetryEvent::new(EventKind::StalenessDetected)
                .instrument("tok")
                .detail("age_ms", 2500),
        );

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::StalenessDetected);
        assert_eq!(ev.instrument.as_deref(), Some("tok"));
        assert_eq!(ev.detail.get("age_ms").and_then(|v| v.as_i64()), Some(2500));
    }

    #[tokio::test]
    async fn test_overflow_drops_instead_of_blocking() {
        let (bus, _rx) = TelemetryBus::new();
        for _ in 0..(BUS_CAPACITY + 10) {
            bus.emit(TelemetryEvent::new(EventKind::QuoteRefused));
        }
        assert!(bus.dropped() >= 10);
    }
}
