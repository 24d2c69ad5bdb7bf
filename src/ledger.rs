//! Inventory ledger: positions, realized P&L, markouts, and the
//! volatility-adaptive risk-aversion factor.
//!
//! `apply_fill` is the single mutation entry point, guarded per instrument
//! so quoting fills and basket fills on different instruments never block
//! each other. Duplicate fill delivery is idempotent: every fill carries an
//! id and replays are dropped.
//!
//! All monetary values use integer cents (i64); no floating-point money.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

use crate::config::{FILL_HISTORY_LEN, MARK_HISTORY_LEN};
use crate::types::{Fill, Instrument, Side};

/// Marks sampled into the short volatility window.
const SHORT_VOL_WINDOW: usize = 32;

/// Retained fill ids per instrument for duplicate-delivery guarding.
const SEEN_FILL_IDS: usize = 1024;

/// One fill retained in the bounded history, used for markout evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub fill_id: String,
    pub side: Side,
    pub price_cents: i64,
    pub size: i64,
    pub ts_ms: u64,
    /// Cache micro-price at fill time, when a snapshot was available
    pub micro_at_fill_cents: Option<i64>,
}

/// Read-only copy of a position handed to strategy code.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PositionView {
    /// Signed contracts: positive = long, negative = short
    pub qty: i64,
    /// Weighted-average entry price per contract, cents
    pub avg_cost_cents: i64,
    /// Cumulative realized P&L, cents
    pub realized_pnl_cents: i64,
    /// Last observed micro-price, cents (unrealized P&L base)
    pub last_mark_cents: Option<i64>,
}

impl PositionView {
    pub fn unrealized_pnl_cents(&self) -> i64 {
        match self.last_mark_cents {
            Some(mark) if self.qty > 0 => self.qty * (mark - self.avg_cost_cents),
            Some(mark) if self.qty < 0 => (-self.qty) * (self.avg_cost_cents - mark),
            _ => 0,
        }
    }
}

/// Mutable per-instrument state. One critical section per instrument.
#[derive(Default)]
struct PositionCell {
    qty: i64,
    avg_cost_cents: i64,
    realized_pnl_cents: i64,
    last_mark_cents: Option<i64>,
    fills: VecDeque<FillRecord>,
    seen_fill_ids: FxHashSet<String>,
    seen_order: VecDeque<String>,
    /// Recent micro-price marks (cents) for volatility estimation
    marks: VecDeque<f64>,
}

impl PositionCell {
    /// Weighted-average cost update with realize-on-reduce. Returns the
    /// realized P&L from this fill.
    fn apply(&mut self, side: Side, size: i64, price_cents: i64) -> i64 {
        let size = size.abs();
        match side {
            Side::Buy => {
                if self.qty >= 0 {
                    // Adding to long: new avg = weighted average of entries
                    let old_total = self.qty * self.avg_cost_cents;
                    let combined = self.qty + size;
                    if combined > 0 {
                        self.avg_cost_cents = (old_total + size * price_cents) / combined;
                    }
                    self.qty = combined;
                    0
                } else {
                    // Buying to cover a short realizes P&L
                    let close_qty = size.min(-self.qty);
                    let realized = close_qty * (self.avg_cost_cents - price_cents);
                    self.realized_pnl_cents += realized;
                    self.qty += size;
                    if self.qty > 0 {
                        // Flipped long: remainder enters at this price
                        self.avg_cost_cents = price_cents;
                    }
                    realized
                }
            }
            Side::Sell => {
                if self.qty > 0 {
                    let close_qty = size.min(self.qty);
                    let realized = close_qty * (price_cents - self.avg_cost_cents);
                    self.realized_pnl_cents += realized;
                    self.qty -= size;
                    if self.qty < 0 {
                        self.avg_cost_cents = price_cents;
                    }
                    realized
                } else {
                    // Adding to short
                    let old_total = (-self.qty) * self.avg_cost_cents;
                    let combined = (-self.qty) + size;
                    if combined > 0 {
                        self.avg_cost_cents = (old_total + size * price_cents) / combined;
                    }
                    self.qty -= size;
                    0
                }
            }
        }
    }

    fn view(&self) -> PositionView {
        PositionView {
            qty: self.qty,
            avg_cost_cents: self.avg_cost_cents,
            realized_pnl_cents: self.realized_pnl_cents,
            last_mark_cents: self.last_mark_cents,
        }
    }

    fn remember_fill_id(&mut self, fill_id: &str) {
        self.seen_fill_ids.insert(fill_id.to_string());
        self.seen_order.push_back(fill_id.to_string());
        while self.seen_order.len() > SEEN_FILL_IDS {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen_fill_ids.remove(&old);
            }
        }
    }

    /// Realized volatility (stddev of mark-to-mark moves, cents) over the
    /// most recent `window` marks.
    fn realized_vol(&self, window: usize) -> Option<f64> {
        let n = self.marks.len();
        if n < 3 {
            return None;
        }
        let start = n.saturating_sub(window);
        let slice: Vec<f64> = self.marks.iter().skip(start).copied().collect();
        let diffs: Vec<f64> = slice.windows(2).map(|w| w[1] - w[0]).collect();
        if diffs.is_empty() {
            return None;
        }
        let mean = diffs.iter().sum::<f64>() / diffs.len() as f64;
        let var = diffs.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / diffs.len() as f64;
        Some(var.sqrt())
    }
}

/// Markout base captured at fill time, resolved later at the horizon.
#[derive(Debug, Clone)]
struct MarkoutBase {
    side: Side,
    price_cents: i64,
    size: i64,
}

/// Tracks positions for every instrument with per-instrument locking.
pub struct InventoryLedger {
    cells: RwLock<FxHashMap<Instrument, Arc<Mutex<PositionCell>>>>,
    markout_bases: Mutex<FxHashMap<String, MarkoutBase>>,
    /// Base risk-aversion coefficient, scaled by the volatility regime
    risk_aversion_base: f64,
    /// Cap on the volatility multiple
    risk_aversion_cap: f64,
}

impl InventoryLedger {
    pub fn new(risk_aversion_base: f64, risk_aversion_cap: f64) -> Self {
        Self {
            cells: RwLock::new(FxHashMap::default()),
            markout_bases: Mutex::new(FxHashMap::default()),
            risk_aversion_base,
            risk_aversion_cap,
        }
    }

    fn cell(&self, instrument: &str) -> Arc<Mutex<PositionCell>> {
        if let Some(cell) = self.cells.read().unwrap().get(instrument) {
            return cell.clone();
        }
        let mut cells = self.cells.write().unwrap();
        cells
            .entry(instrument.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(PositionCell::default())))
            .clone()
    }

    /// Apply a fill. The single mutation entry point; atomic per
    /// instrument and idempotent under duplicate delivery.
    pub fn apply_fill(&self, fill: &Fill) -> PositionView {
        let cell = self.cell(&fill.instrument);
        let mut pos = cell.lock().unwrap();

        if pos.seen_fill_ids.contains(&fill.fill_id) {
            debug!(
                event = "duplicate_fill_dropped",
                fill_id = %fill.fill_id,
                instrument = %fill.instrument,
                "Duplicate fill delivery ignored"
            );
            return pos.view();
        }
        pos.remember_fill_id(&fill.fill_id);

        let realized = pos.apply(fill.side, fill.size, fill.price_cents);
        pos.fills.push_back(FillRecord {
            fill_id: fill.fill_id.clone(),
            side: fill.side,
            price_cents: fill.price_cents,
            size: fill.size,
            ts_ms: fill.ts_ms,
            micro_at_fill_cents: fill.micro_price_cents,
        });
        while pos.fills.len() > FILL_HISTORY_LEN {
            pos.fills.pop_front();
        }

        self.markout_bases.lock().unwrap().insert(
            fill.fill_id.clone(),
            MarkoutBase {
                side: fill.side,
                price_cents: fill.price_cents,
                size: fill.size,
            },
        );

        debug!(
            event = "fill_applied",
            instrument = %fill.instrument,
            side = %fill.side,
            qty = fill.size,
            price_cents = fill.price_cents,
            realized_cents = realized,
            position_qty = pos.qty,
            "Fill applied"
        );
        pos.view()
    }

    pub fn get_position(&self, instrument: &str) -> PositionView {
        match self.cells.read().unwrap().get(instrument) {
            Some(cell) => cell.lock().unwrap().view(),
            None => PositionView::default(),
        }
    }

    /// Record a micro-price observation for marking and volatility
    /// estimation. Called on each strategy tick.
    pub fn record_mark(&self, instrument: &str, micro_price_cents: f64) {
        let cell = self.cell(instrument);
        let mut pos = cell.lock().unwrap();
        pos.last_mark_cents = Some(micro_price_cents.round() as i64);
        pos.marks.push_back(micro_price_cents);
        while pos.marks.len() > MARK_HISTORY_LEN {
            pos.marks.pop_front();
        }
    }

    /// Resolve a markout: forward P&L of the fill at the horizon price.
    /// Returns `None` for unknown (or already-resolved) fill ids.
    pub fn record_markout(&self, fill_id: &str, later_price_cents: i64) -> Option<i64> {
        let base = self.markout_bases.lock().unwrap().remove(fill_id)?;
        let delta = match base.side {
            Side::Buy => (later_price_cents - base.price_cents) * base.size,
            Side::Sell => (base.price_cents - later_price_cents) * base.size,
        };
        Some(delta)
    }

    /// Risk-aversion factor for an instrument: the base coefficient scaled
    /// by the ratio of short-window realized volatility to the rolling
    /// baseline, capped at a configured multiple of the base.
    pub fn dynamic_risk_aversion(&self, instrument: &str) -> f64 {
        let ratio = match self.cells.read().unwrap().get(instrument) {
            Some(cell) => {
                let pos = cell.lock().unwrap();
                match (
                    pos.realized_vol(SHORT_VOL_WINDOW),
                    pos.realized_vol(MARK_HISTORY_LEN),
                ) {
                    (Some(short), Some(long)) if long > 1e-9 => short / long,
                    _ => 1.0,
                }
            }
            None => 1.0,
        };
        self.risk_aversion_base * ratio.min(self.risk_aversion_cap)
    }

    /// All instruments with any recorded state.
    pub fn positions(&self) -> Vec<(Instrument, PositionView)> {
        let cells = self.cells.read().unwrap();
        cells
            .iter()
            .map(|(k, cell)| (k.clone(), cell.lock().unwrap().view()))
            .collect()
    }

    /// Count of instruments with a non-flat position.
    pub fn open_positions(&self) -> usize {
        self.positions().iter().filter(|(_, p)| p.qty != 0).count()
    }

    pub fn total_realized_cents(&self) -> i64 {
        self.positions()
            .iter()
            .map(|(_, p)| p.realized_pnl_cents)
            .sum()
    }

    pub fn total_unrealized_cents(&self) -> i64 {
        self.positions()
            .iter()
            .map(|(_, p)| p.unrealized_pnl_cents())
            .sum()
    }

    /// Overwrite a position from a rehydrated snapshot. Only the
    /// checkpoint import path calls this.
    pub fn restore_position(&self, instrument: &str, view: &PositionView) {
        let cell = self.cell(instrument);
        let mut pos = cell.lock().unwrap();
        pos.qty = view.qty;
        pos.avg_cost_cents = view.avg_cost_cents;
        pos.realized_pnl_cents = view.realized_pnl_cents;
        pos.last_mark_cents = view.last_mark_cents;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_ms;

    fn fill(id: &str, side: Side, price: i64, size: i64) -> Fill {
        Fill {
            fill_id: id.to_string(),
            instrument: "tok".to_string(),
            side,
            price_cents: price,
            size,
            micro_price_cents: None,
            ts_ms: now_ms(),
        }
    }

    fn ledger() -> InventoryLedger {
        InventoryLedger::new(0.1, 3.0)
    }

    #[test]
    fn test_buy_builds_weighted_average() {
        let l = ledger();
        l.apply_fill(&fill("f1", Side::Buy, 40, 10));
        let view = l.apply_fill(&fill("f2", Side::Buy, 50, 10));

        assert_eq!(view.qty, 20);
        assert_eq!(view.avg_cost_cents, 45);
        assert_eq!(view.realized_pnl_cents, 0);
    }

    #[test]
    fn test_sell_realizes_pnl() {
        let l = ledger();
        l.apply_fill(&fill("f1", Side::Buy, 40, 10));
        let view = l.apply_fill(&fill("f2", Side::Sell, 60, 10));

        assert_eq!(view.qty, 0);
        assert_eq!(view.realized_pnl_cents, 200); // (60-40)*10
    }

    #[test]
    fn test_flip_long_to_short_resets_basis() {
        let l = ledger();
        l.apply_fill(&fill("f1", Side::Buy, 40, 10));
        let view = l.apply_fill(&fill("f2", Side::Sell, 60, 15));

        assert_eq!(view.qty, -5);
        assert_eq!(view.avg_cost_cents, 60);
        assert_eq!(view.realized_pnl_cents, 200); // only the closed 10
    }

    #[test]
    fn test_duplicate_fill_id_is_idempotent() {
        let l = ledger();
        l.apply_fill(&fill("f1", Side::Buy, 40, 10));
        let view = l.apply_fill(&fill("f1", Side::Buy, 40, 10));

        assert_eq!(view.qty, 10, "duplicate delivery must not double-count");
    }

    #[test]
    fn test_markout_buy_direction() {
        let l = ledger();
        l.apply_fill(&fill("f1", Side::Buy, 40, 10));

        // Price moved up 3 cents after the buy: positive markout
        assert_eq!(l.record_markout("f1", 43), Some(30));
        // Second resolution of the same fill returns None
        assert_eq!(l.record_markout("f1", 43), None);
    }

    #[test]
    fn test_markout_sell_direction() {
        let l = ledger();
        l.apply_fill(&fill("f1", Side::Sell, 40, 10));
        // Price fell after the sell: positive markout for the seller
        assert_eq!(l.record_markout("f1", 35), Some(50));
    }

    #[test]
    fn test_markout_unknown_fill() {
        let l = ledger();
        assert_eq!(l.record_markout("nope", 50), None);
    }

    #[test]
    fn test_unrealized_follows_mark() {
        let l = ledger();
        l.apply_fill(&fill("f1", Side::Buy, 40, 10));
        l.record_mark("tok", 47.0);

        let view = l.get_position("tok");
        assert_eq!(view.unrealized_pnl_cents(), 70); // (47-40)*10
    }

    #[test]
    fn test_risk_aversion_flat_history_is_base() {
        let l = ledger();
        for i in 0..100 {
            l.record_mark("tok", 50.0 + (i % 2) as f64);
        }
        // Uniform moves: short/long ratio ~= 1
        let gamma = l.dynamic_risk_aversion("tok");
        assert!((gamma - 0.1).abs() < 0.02, "gamma={}", gamma);
    }

    #[test]
    fn test_risk_aversion_spikes_with_recent_vol_and_caps() {
        let l = ledger();
        // Long quiet baseline
        for _ in 0..400 {
            l.record_mark("tok", 50.0);
        }
        // Violent recent regime
        for i in 0..SHORT_VOL_WINDOW {
            l.record_mark("tok", if i % 2 == 0 { 40.0 } else { 60.0 });
        }
        let gamma = l.dynamic_risk_aversion("tok");
        // Capped at base * cap
        assert!((gamma - 0.1 * 3.0).abs() < 1e-9, "gamma={}", gamma);
    }

    #[test]
    fn test_risk_aversion_unknown_instrument_is_base() {
        let l = ledger();
        assert!((l.dynamic_risk_aversion("unknown") - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_totals_across_instruments() {
        let l = ledger();
        l.apply_fill(&fill("f1", Side::Buy, 40, 10));
        let mut other = fill("f2", Side::Buy, 30, 5);
        other.instrument = "tok2".to_string();
        l.apply_fill(&other);

        assert_eq!(l.open_positions(), 2);
        assert_eq!(l.total_realized_cents(), 0);
    }

    #[test]
    fn test_restore_position() {
        let l = ledger();
        l.restore_position(
            "tok",
            &PositionView {
                qty: 7,
                avg_cost_cents: 33,
                realized_pnl_cents: 120,
                last_mark_cents: Some(35),
            },
        );
        let view = l.get_position("tok");
        assert_eq!(view.qty, 7);
        assert_eq!(view.avg_cost_cents, 33);
        assert_eq!(view.realized_pnl_cents, 120);
    }
}
