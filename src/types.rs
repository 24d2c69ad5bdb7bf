//! Core domain types shared across the trading system.
//!
//! All monetary values use integer cents (i64). Binary contracts settle at
//! 100 cents, so valid limit prices live in 1..=99. Sizes are whole
//! contracts (i64).

use serde::{Deserialize, Serialize};

/// Instrument identifier (exchange token id for one outcome of a market).
pub type Instrument = String;

/// Settlement value of a winning binary contract, in cents.
pub const SETTLEMENT_CENTS: i64 = 100;

/// Price granularity: one cent per tick.
pub const TICK_CENTS: i64 = 1;

/// Order/position side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side that flattens a position opened on this side.
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Time-in-force for submitted orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    /// Immediate-or-cancel: fill what rests, cancel the remainder
    Ioc,
    /// Good-till-cancelled: rest on the book
    Gtc,
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeInForce::Ioc => write!(f, "ioc"),
            TimeInForce::Gtc => write!(f, "gtc"),
        }
    }
}

/// One price level of a book: best bid or best ask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    /// Limit price in cents (0 = side empty)
    pub price_cents: i64,
    /// Resting size in contracts at that price
    pub size: i64,
}

impl BookLevel {
    pub fn new(price_cents: i64, size: i64) -> Self {
        Self { price_cents, size }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Market-data payload parsed once at the feed boundary.
///
/// The upstream feed is a mix of incremental top-of-book updates, full
/// snapshots (also produced by REST refresh), and fill notifications.
/// Everything downstream matches on this enum; untyped maps never travel
/// past the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketPayload {
    /// Incremental top-of-book update
    BookDelta {
        instrument: Instrument,
        bid: BookLevel,
        ask: BookLevel,
        ts_ms: u64,
    },
    /// Full book snapshot (stream-initial or REST gap refresh)
    FullSnapshot {
        instrument: Instrument,
        bid: BookLevel,
        ask: BookLevel,
        ts_ms: u64,
    },
    /// A fill against one of our resting or taker orders
    FillEvent {
        fill_id: String,
        order_id: String,
        instrument: Instrument,
        side: Side,
        price_cents: i64,
        size: i64,
        ts_ms: u64,
    },
}

impl MarketPayload {
    pub fn instrument(&self) -> &str {
        match self {
            MarketPayload::BookDelta { instrument, .. } => instrument,
            MarketPayload::FullSnapshot { instrument, .. } => instrument,
            MarketPayload::FillEvent { instrument, .. } => instrument,
        }
    }
}

/// A single fill applied to the inventory ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    /// Exchange fill identifier, used for duplicate-delivery guarding
    pub fill_id: String,
    pub instrument: Instrument,
    pub side: Side,
    pub price_cents: i64,
    pub size: i64,
    /// Cache micro-price at fill time, if a snapshot was available (markout base)
    pub micro_price_cents: Option<i64>,
    pub ts_ms: u64,
}

/// Request shape handed to the exchange client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub instrument: Instrument,
    pub side: Side,
    pub price_cents: i64,
    pub size: i64,
    pub time_in_force: TimeInForce,
}

/// Acknowledgement returned by the exchange on submission.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    /// Contracts filled immediately on the ack (IOC fast path)
    pub filled: i64,
    /// Cost of the immediate fill in cents
    pub fill_cost_cents: i64,
}

/// Lifecycle state of a working order, as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Open,
    Filled,
    PartiallyFilled,
    Cancelled,
    Rejected,
}

/// Poll result for a working order.
#[derive(Debug, Clone)]
pub struct OrderStatus {
    pub order_id: String,
    pub state: OrderState,
    pub filled: i64,
    pub remaining: i64,
    /// Cumulative fill cost in cents
    pub fill_cost_cents: i64,
}

/// Local shadow copy of a submitted order, retained until terminal so the
/// executor can cancel and poll without re-deriving request parameters.
#[derive(Debug, Clone)]
pub struct OrderTicket {
    pub order_id: String,
    pub instrument: Instrument,
    pub side: Side,
    pub price_cents: i64,
    pub size: i64,
    pub time_in_force: TimeInForce,
}

impl OrderTicket {
    pub fn from_ack(req: &OrderRequest, ack: &OrderAck) -> Self {
        Self {
            order_id: ack.order_id.clone(),
            instrument: req.instrument.clone(),
            side: req.side,
            price_cents: req.price_cents,
            size: req.size,
            time_in_force: req.time_in_force,
        }
    }
}

/// Snap a fractional cent price to the instrument tick, clamped to the
/// valid binary-contract range.
pub fn snap_to_tick(price_cents: f64) -> i64 {
    let snapped = (price_cents / TICK_CENTS as f64).round() as i64 * TICK_CENTS;
    snapped.clamp(TICK_CENTS, SETTLEMENT_CENTS - TICK_CENTS)
}

/// Wall-clock milliseconds since the epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
