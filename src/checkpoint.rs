//! State export/import for the external persistence collaborator.
//!
//! `export_state` produces a serializable snapshot of positions and risk
//! state for periodic checkpointing. `import_state` rehydrates on restart,
//! and re-validates the imported exposure against the exchange's reported
//! balances before trading resumes: a mismatch beyond tolerance rejects
//! the snapshot and trips the kill switch.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config;
use crate::errors::ExecError;
use crate::exchange::ExchangeClient;
use crate::ledger::{InventoryLedger, PositionView};
use crate::risk::{KillReason, RiskController, TradingState};
use crate::telemetry::{EventKind, TelemetryBus, TelemetryEvent};
use crate::types::now_ms;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub ts_ms: u64,
    pub positions: HashMap<String, PositionView>,
    pub risk_state: TradingState,
    pub peak_equity_cents: i64,
    /// Equity at snapshot time, used to sanity-check rehydration
    pub equity_cents: i64,
}

/// Capture current positions and risk state.
pub fn export_state(ledger: &InventoryLedger, risk: &RiskController) -> StateSnapshot {
    StateSnapshot {
        ts_ms: now_ms(),
        positions: ledger.positions().into_iter().collect(),
        risk_state: risk.current_state(),
        peak_equity_cents: risk.peak_equity_cents(),
        equity_cents: risk.equity_cents(),
    }
}

/// Rehydrate a snapshot after validating it against exchange balances.
///
/// The expected cash is snapshot equity minus marked unrealized P&L; if
/// the exchange reports a balance off by more than the configured
/// tolerance, the snapshot is rejected and the kill switch trips — resuming
/// on top of positions the exchange does not corroborate is how unattended
/// systems double exposure.
pub async fn import_state(
    snapshot: &StateSnapshot,
    ledger: &InventoryLedger,
    risk: &RiskController,
    client: Arc<dyn ExchangeClient>,
    telemetry: &TelemetryBus,
) -> Result<(), ExecError> {
    let balance_cents = client.get_balance().await.map_err(|e| ExecError::Connectivity {
        detail: format!("balance check during rehydrate: {}", e),
    })?;

    let snapshot_unrealized: i64 = snapshot
        .positions
        .values()
        .map(|p| p.unrealized_pnl_cents())
        .sum();
    let expected_cash = snapshot.equity_cents - snapshot_unrealized;
    let delta = (balance_cents - expected_cash).abs();
    let tolerance = config::rehydrate_tolerance_cents();

    if delta > tolerance {
        warn!(
            event = "rehydrate_mismatch",
            balance_cents = balance_cents,
            expected_cash = expected_cash,
            delta_cents = delta,
            tolerance_cents = tolerance,
            "Rehydrated state disagrees with exchange balance"
        );
        telemetry.emit(
            TelemetryEvent::new(EventKind::RehydrateMismatch)
                .detail("delta_cents", delta)
                .detail("tolerance_cents", tolerance),
        );
        risk.trigger_kill_switch(KillReason::RehydrateMismatch { delta_cents: delta });
        return Err(ExecError::Invariant {
            detail: format!(
                "rehydrate mismatch: {}c off exchange balance (tolerance {}c)",
                delta, tolerance
            ),
        });
    }

    for (instrument, view) in &snapshot.positions {
        ledger.restore_position(instrument, view);
    }
    risk.restore_peak_equity(snapshot.peak_equity_cents);

    // A snapshot taken while killed stays killed until an operator reset.
    if snapshot.risk_state == TradingState::Killed {
        risk.trigger_kill_switch(KillReason::Manual {
            reason: "rehydrated from killed snapshot".to_string(),
        });
    }

    info!(
        event = "state_rehydrated",
        positions = snapshot.positions.len(),
        peak_equity_cents = snapshot.peak_equity_cents,
        "State rehydrated"
    );
    Ok(())
}

/// Write a snapshot as pretty JSON.
pub fn save_snapshot<P: AsRef<Path>>(snapshot: &StateSnapshot, path: P) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshot)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Load a snapshot written by `save_snapshot`.
pub fn load_snapshot<P: AsRef<Path>>(path: P) -> Result<StateSnapshot> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::types::{Fill, Side};

    fn fixtures() -> (InventoryLedger, RiskController, TelemetryBus) {
        let (bus, _rx) = TelemetryBus::new();
        let metrics = Arc::new(Metrics::new());
        (
            InventoryLedger::new(0.1, 3.0),
            RiskController::new(metrics, bus.clone()),
            bus,
        )
    }

    #[test]
    fn test_export_captures_positions_and_risk() {
        let (ledger, risk, _bus) = fixtures();
        ledger.apply_fill(&Fill {
            fill_id: "f1".into(),
            instrument: "tok".into(),
            side: Side::Buy,
            price_cents: 40,
            size: 10,
            micro_price_cents: None,
            ts_ms: 1,
        });
        risk.update_equity(10_000);

        let snap = export_state(&ledger, &risk);
        assert_eq!(snap.positions.get("tok").unwrap().qty, 10);
        assert_eq!(snap.risk_state, TradingState::Running);
        assert_eq!(snap.peak_equity_cents, 10_000);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (ledger, risk, _bus) = fixtures();
        ledger.apply_fill(&Fill {
            fill_id: "f1".into(),
            instrument: "tok".into(),
            side: Side::Buy,
            price_cents: 40,
            size: 10,
            micro_price_cents: None,
            ts_ms: 1,
        });

        let snap = export_state(&ledger, &risk);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        save_snapshot(&snap, &path).unwrap();
        let loaded = load_snapshot(&path).unwrap();

        assert_eq!(loaded.positions.get("tok").unwrap().qty, 10);
        assert_eq!(loaded.risk_state, snap.risk_state);
    }
}
