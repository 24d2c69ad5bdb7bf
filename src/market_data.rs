//! Real-time market-data cache fed by the streaming book feed.
//!
//! One `MarketSnapshot` per instrument, replaced wholesale on every feed
//! message: the cache map holds `Arc<MarketSnapshot>` values and the write
//! lock is held only for the pointer swap, so readers never observe a
//! half-updated snapshot. Staleness and liveness are tracked per
//! instrument; the feed loop reconnects with exponential backoff and
//! resubscribes everything that was active at disconnect time.

use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{self, RECONNECT_BASE_DELAY_SECS, RECONNECT_MAX_DELAY_SECS};
use crate::exchange::ExchangeClient;
use crate::metrics::Metrics;
use crate::retry::{retry_async, RetryPolicy};
use crate::risk::RiskController;
use crate::telemetry::{EventKind, TelemetryBus, TelemetryEvent};
use crate::types::{BookLevel, Instrument, MarketPayload};

/// Immutable view of one instrument's top of book.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub instrument: Instrument,
    pub bid: BookLevel,
    pub ask: BookLevel,
    /// Size-weighted price between bid and ask, cents. Falls back to the
    /// arithmetic mid when both sides are empty.
    pub micro_price_cents: f64,
    /// Local monotonic sequence number assigned on ingestion. The upstream
    /// feed carries no server-side sequence, so gaps are inferred from
    /// silence, not from this counter.
    pub seq: u64,
    pub last_update: Instant,
    pub ts_ms: u64,
}

impl MarketSnapshot {
    /// Arithmetic midpoint in cents.
    pub fn mid_cents(&self) -> f64 {
        (self.bid.price_cents + self.ask.price_cents) as f64 / 2.0
    }

    pub fn age(&self) -> Duration {
        self.last_update.elapsed()
    }
}

/// Size-weighted micro-price: leans toward the side with less resting
/// size, where the next print is more likely.
fn micro_price(bid: BookLevel, ask: BookLevel) -> f64 {
    let total = bid.size + ask.size;
    if total == 0 {
        return (bid.price_cents + ask.price_cents) as f64 / 2.0;
    }
    (bid.size * ask.price_cents + ask.size * bid.price_cents) as f64 / total as f64
}

#[derive(Default)]
struct CacheInner {
    snapshots: FxHashMap<Instrument, Arc<MarketSnapshot>>,
    /// Instruments the feed should carry; survives reconnects.
    subscribed: FxHashSet<Instrument>,
    /// Instruments marked stale (pre-first-message or post-reconnect).
    awaiting_refresh: FxHashSet<Instrument>,
}

/// Cache of the latest book snapshot per instrument.
pub struct MarketDataCache {
    inner: RwLock<CacheInner>,
    seq: AtomicU64,
    metrics: Arc<Metrics>,
    telemetry: TelemetryBus,
}

impl MarketDataCache {
    pub fn new(metrics: Arc<Metrics>, telemetry: TelemetryBus) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            seq: AtomicU64::new(0),
            metrics,
            telemetry,
        }
    }

    /// Latest snapshot for an instrument, if any message has arrived.
    pub fn get_snapshot(&self, instrument: &str) -> Option<Arc<MarketSnapshot>> {
        let inner = self.inner.read().unwrap();
        if inner.awaiting_refresh.contains(instrument) {
            return None;
        }
        inner.snapshots.get(instrument).cloned()
    }

    /// Whether the instrument's data is older than the threshold. Absent
    /// snapshots and post-reconnect instruments are stale by definition.
    pub fn is_stale(&self, instrument: &str, threshold: Duration) -> bool {
        let inner = self.inner.read().unwrap();
        if inner.awaiting_refresh.contains(instrument) {
            return true;
        }
        match inner.snapshots.get(instrument) {
            Some(snap) => snap.age() > threshold,
            None => true,
        }
    }

    /// Register an instrument for the streaming feed. Until its first
    /// message arrives the instrument reads as stale.
    pub fn subscribe(&self, instrument: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.subscribed.insert(instrument.to_string());
        inner.awaiting_refresh.insert(instrument.to_string());
    }

    pub fn unsubscribe(&self, instrument: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.subscribed.remove(instrument);
        inner.snapshots.remove(instrument);
        inner.awaiting_refresh.remove(instrument);
    }

    /// Currently subscribed instruments (resubscribe set on reconnect).
    pub fn subscribed(&self) -> Vec<Instrument> {
        self.inner
            .read()
            .unwrap()
            .subscribed
            .iter()
            .cloned()
            .collect()
    }

    /// Mark every subscribed instrument stale. Called on disconnect so no
    /// consumer trades on pre-disconnect data; cleared per instrument by
    /// its first post-reconnect message.
    pub fn mark_all_stale(&self) {
        let mut inner = self.inner.write().unwrap();
        let keys: Vec<Instrument> = inner.subscribed.iter().cloned().collect();
        for k in keys {
            inner.awaiting_refresh.insert(k);
        }
    }

    /// Ingest one feed payload. Book messages atomically replace the
    /// affected snapshot; fill events pass through untouched (the caller
    /// routes them to the ledger).
    pub fn apply(&self, payload: &MarketPayload) {
        let (instrument, bid, ask, ts_ms) = match payload {
            MarketPayload::BookDelta {
                instrument,
                bid,
                ask,
                ts_ms,
            }
            | MarketPayload::FullSnapshot {
                instrument,
                bid,
                ask,
                ts_ms,
            } => (instrument, *bid, *ask, *ts_ms),
            MarketPayload::FillEvent { .. } => return,
        };

        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let snap = Arc::new(MarketSnapshot {
            instrument: instrument.clone(),
            bid,
            ask,
            micro_price_cents: micro_price(bid, ask),
            seq,
            last_update: Instant::now(),
            ts_ms,
        });

        let mut inner = self.inner.write().unwrap();
        inner.awaiting_refresh.remove(instrument.as_str());
        inner.snapshots.insert(instrument.clone(), snap);
    }

    /// Instruments silent past the liveness bound: suspected gaps needing
    /// a REST refresh. Staleness (the harder bound) is left to callers.
    pub fn silent_instruments(&self, liveness: Duration) -> Vec<Instrument> {
        let inner = self.inner.read().unwrap();
        inner
            .subscribed
            .iter()
            .filter(|k| match inner.snapshots.get(*k) {
                Some(snap) => snap.age() > liveness,
                // No snapshot yet: refresh until the stream delivers one
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Report a staleness refusal for telemetry/metrics bookkeeping.
    pub fn note_staleness(&self, instrument: &str, age: Duration) {
        self.metrics.staleness_events.inc();
        self.telemetry.emit(
            TelemetryEvent::new(EventKind::StalenessDetected)
                .instrument(instrument)
                .detail("age_ms", age.as_millis() as u64),
        );
    }
}

/// Long-lived feed ingestion loop.
///
/// Owns the streaming connection: applies every payload to the cache,
/// forwards fill events to `fill_tx`, watches per-instrument silence, and
/// reconnects with exponential backoff (base doubling, capped). The risk
/// controller is told when the feed goes down and back up so prolonged
/// outages degrade the trading state. This task never awaits strategy
/// logic.
pub async fn run_feed_loop(
    cache: Arc<MarketDataCache>,
    client: Arc<dyn ExchangeClient>,
    risk: Arc<RiskController>,
    fill_tx: tokio::sync::mpsc::Sender<MarketPayload>,
) {
    let mut backoff_secs = RECONNECT_BASE_DELAY_SECS;
    let retry_policy = RetryPolicy::from_env();

    loop {
        let instruments = cache.subscribed();
        if instruments.is_empty() {
            tokio::time::sleep(Duration::from_millis(200)).await;
            continue;
        }

        let mut rx = match client.stream_book(&instruments).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(
                    "[FEED] connect failed: {} (retrying in {}s)",
                    e, backoff_secs
                );
                risk.feed_down();
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(RECONNECT_MAX_DELAY_SECS);
                continue;
            }
        };

        backoff_secs = RECONNECT_BASE_DELAY_SECS;
        risk.feed_up();
        cache.metrics.feed_reconnects.inc();
        cache.telemetry.emit(
            TelemetryEvent::new(EventKind::Reconnect)
                .detail("instruments", instruments.len() as u64),
        );
        info!("[FEED] connected ({} instruments)", instruments.len());

        let mut liveness_tick = tokio::time::interval(config::liveness_threshold());
        liveness_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                payload = rx.recv() => {
                    match payload {
                        Some(p) => {
                            cache.apply(&p);
                            if matches!(p, MarketPayload::FillEvent { .. }) {
                                if fill_tx.send(p).await.is_err() {
                                    debug!("[FEED] fill consumer gone");
                                }
                            }
                        }
                        None => {
                            warn!("[FEED] stream closed, reconnecting");
                            break;
                        }
                    }
                }
                _ = liveness_tick.tick() => {
                    refresh_silent(&cache, &client, &retry_policy).await;
                }
            }
        }

        // Connection lost: nothing read from here on is trustworthy.
        cache.mark_all_stale();
        risk.feed_down();
    }
}

/// REST full-snapshot refresh for instruments silent past the liveness
/// bound, without tearing down the streaming connection.
async fn refresh_silent(
    cache: &Arc<MarketDataCache>,
    client: &Arc<dyn ExchangeClient>,
    retry_policy: &RetryPolicy,
) {
    for instrument in cache.silent_instruments(config::liveness_threshold()) {
        cache.metrics.suspected_gaps.inc();
        cache.telemetry.emit(
            TelemetryEvent::new(EventKind::SuspectedGap)
                .instrument(instrument.clone())
                .detail("liveness_ms", config::liveness_threshold().as_millis() as u64),
        );
        warn!("[FEED] suspected gap on {}, refreshing via REST", instrument);

        let inst = instrument.clone();
        let result = retry_async(retry_policy, "book_refresh", || {
            let client = client.clone();
            let inst = inst.clone();
            async move { client.fetch_book(&inst).await }
        })
        .await;

        match result {
            Ok(payload) => cache.apply(&payload),
            Err(e) => warn!("[FEED] refresh failed for {}: {}", instrument, e),
        }
    }
}
