//! Production metrics for the market maker.
//!
//! Atomic counters and gauges for quoting activity, basket execution,
//! feed health, and risk events, with Prometheus text export for an
//! external scraper.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Global metrics registry
#[derive(Debug, Clone)]
pub struct Metrics {
    /// Quotes computed successfully
    pub quotes_computed: Arc<Counter>,
    /// Quotes refused (risk state, staleness, in-flight)
    pub quotes_refused: Arc<Counter>,
    /// Resting orders left untouched by reconciliation
    pub quotes_left_resting: Arc<Counter>,
    /// Cancel-and-replace operations issued
    pub quotes_replaced: Arc<Counter>,

    /// Basket executions attempted (past pre-flight)
    pub baskets_attempted: Arc<Counter>,
    /// Baskets completed with all legs filled
    pub baskets_completed: Arc<Counter>,
    /// Baskets aborted in any phase
    pub baskets_aborted: Arc<Counter>,
    /// Pre-flight rejections (no orders sent)
    pub preflight_rejections: Arc<Counter>,
    /// Partial-fill events (unhedged exposure detected)
    pub partial_fills: Arc<Counter>,
    /// Emergency liquidation orders sent
    pub liquidations: Arc<Counter>,

    /// Orders submitted to the exchange
    pub orders_submitted: Arc<Counter>,
    /// Orders cancelled
    pub orders_cancelled: Arc<Counter>,

    /// Staleness threshold crossings observed
    pub staleness_events: Arc<Counter>,
    /// Suspected feed gaps (liveness bound crossed)
    pub suspected_gaps: Arc<Counter>,
    /// Feed reconnections
    pub feed_reconnects: Arc<Counter>,

    /// Kill switch trips
    pub kill_switch_trips: Arc<Counter>,

    /// Total realized P&L in cents
    pub realized_pnl_cents: Arc<Gauge>,
    /// Open positions count
    pub open_positions: Arc<Gauge>,
    /// Current equity in cents
    pub equity_cents: Arc<Gauge>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            quotes_computed: Arc::new(Counter::new("quotes_computed")),
            quotes_refused: Arc::new(Counter::new("quotes_refused")),
            quotes_left_resting: Arc::new(Counter::new("quotes_left_resting")),
            quotes_replaced: Arc::new(Counter::new("quotes_replaced")),

            baskets_attempted: Arc::new(Counter::new("baskets_attempted")),
            baskets_completed: Arc::new(Counter::new("baskets_completed")),
            baskets_aborted: Arc::new(Counter::new("baskets_aborted")),
            preflight_rejections: Arc::new(Counter::new("preflight_rejections")),
            partial_fills: Arc::new(Counter::new("partial_fills")),
            liquidations: Arc::new(Counter::new("liquidations")),

            orders_submitted: Arc::new(Counter::new("orders_submitted")),
            orders_cancelled: Arc::new(Counter::new("orders_cancelled")),

            staleness_events: Arc::new(Counter::new("staleness_events")),
            suspected_gaps: Arc::new(Counter::new("suspected_gaps")),
            feed_reconnects: Arc::new(Counter::new("feed_reconnects")),

            kill_switch_trips: Arc::new(Counter::new("kill_switch_trips")),

            realized_pnl_cents: Arc::new(Gauge::new("realized_pnl_cents")),
            open_positions: Arc::new(Gauge::new("open_positions")),
            equity_cents: Arc::new(Gauge::new("equity_cents")),
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let counters: [(&Counter, &str); 16] = [
            (&self.quotes_computed, "Quotes computed successfully"),
            (&self.quotes_refused, "Quotes refused"),
            (&self.quotes_left_resting, "Resting orders left untouched"),
            (&self.quotes_replaced, "Cancel-and-replace operations"),
            (&self.baskets_attempted, "Basket executions attempted"),
            (&self.baskets_completed, "Baskets fully filled"),
            (&self.baskets_aborted, "Baskets aborted"),
            (&self.preflight_rejections, "Pre-flight rejections"),
            (&self.partial_fills, "Partial-fill events"),
            (&self.liquidations, "Emergency liquidations"),
            (&self.orders_submitted, "Orders submitted"),
            (&self.orders_cancelled, "Orders cancelled"),
            (&self.staleness_events, "Staleness threshold crossings"),
            (&self.suspected_gaps, "Suspected feed gaps"),
            (&self.feed_reconnects, "Feed reconnections"),
            (&self.kill_switch_trips, "Kill switch trips"),
        ];
        let gauges: [(&Gauge, &str); 3] = [
            (&self.realized_pnl_cents, "Realized profit/loss in cents"),
            (&self.open_positions, "Open positions count"),
            (&self.equity_cents, "Current equity in cents"),
        ];

        let mut output = String::new();
        for (c, help) in counters {
            output.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n\n",
                name = c.name(),
                help = help,
                value = c.get()
            ));
        }
        for (g, help) in gauges {
            output.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n\n",
                name = g.name(),
                help = help,
                value = g.get()
            ));
        }
        output
    }

    /// Log a one-shot summary of the registry state.
    pub fn log_summary(&self) {
        tracing::info!("Quoting:");
        tracing::info!(
            "  computed: {} refused: {} left: {} replaced: {}",
            self.quotes_computed.get(),
            self.quotes_refused.get(),
            self.quotes_left_resting.get(),
            self.quotes_replaced.get()
        );
        tracing::info!("Baskets:");
        tracing::info!(
            "  attempted: {} completed: {} aborted: {} (success rate {:.1}%)",
            self.baskets_attempted.get(),
            self.baskets_completed.get(),
            self.baskets_aborted.get(),
            self.basket_success_rate()
        );
        tracing::info!(
            "  pre-flight rejections: {} partial fills: {} liquidations: {}",
            self.preflight_rejections.get(),
            self.partial_fills.get(),
            self.liquidations.get()
        );
        tracing::info!("Feed:");
        tracing::info!(
            "  staleness events: {} suspected gaps: {} reconnects: {}",
            self.staleness_events.get(),
            self.suspected_gaps.get(),
            self.feed_reconnects.get()
        );
        tracing::info!(
            "Risk: kill trips: {} equity: {}c realized: {}c",
            self.kill_switch_trips.get(),
            self.equity_cents.get(),
            self.realized_pnl_cents.get()
        );
    }

    fn basket_success_rate(&self) -> f64 {
        let total = self.baskets_attempted.get();
        if total == 0 {
            return 0.0;
        }
        (self.baskets_completed.get() as f64 / total as f64) * 100.0
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Atomic counter for monotonically increasing metrics
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    /// Increment counter by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment counter by n
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Atomic gauge for metrics that can go up or down
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    value: AtomicU64,
}

impl Gauge {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    /// Set gauge to specific value
    pub fn set(&self, value: i64) {
        // Stored as u64, interpreted as i64 (two's complement)
        self.value.store(value as u64, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: i64) {
        if n >= 0 {
            self.value.fetch_add(n as u64, Ordering::Relaxed);
        } else {
            self.value.fetch_sub((-n) as u64, Ordering::Relaxed);
        }
    }

    /// Get current value (as signed integer)
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed) as i64
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_basic() {
        let counter = Counter::new("test");
        assert_eq!(counter.get(), 0);

        counter.inc();
        assert_eq!(counter.get(), 1);

        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge_signed() {
        let gauge = Gauge::new("test");
        gauge.set(-250);
        assert_eq!(gauge.get(), -250);

        gauge.add(300);
        assert_eq!(gauge.get(), 50);

        gauge.dec();
        assert_eq!(gauge.get(), 49);
    }

    #[test]
    fn test_counter_concurrent() {
        use std::thread;

        let counter = Arc::new(Counter::new("test"));
        let mut handles = vec![];

        for _ in 0..10 {
            let c = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    c.inc();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.get(), 1000);
    }

    #[test]
    fn test_prometheus_export_contains_metrics() {
        let m = Metrics::new();
        m.baskets_attempted.inc();
        m.equity_cents.set(12_345);

        let out = m.export_prometheus();
        assert!(out.contains("baskets_attempted 1"));
        assert!(out.contains("equity_cents 12345"));
        assert!(out.contains("# TYPE baskets_attempted counter"));
        assert!(out.contains("# TYPE equity_cents gauge"));
    }
}
