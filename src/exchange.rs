//! Narrow exchange capability consumed by the core.
//!
//! Order signing, HTTP/WebSocket transport, and authentication live behind
//! this trait; the core never constructs exchange-specific auth. Fill
//! events for resting orders arrive on the same channel as book updates so
//! the ingestion task owns a single stream.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{MarketPayload, OrderAck, OrderRequest, OrderStatus};

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Submit an order; returns the exchange-assigned id and any immediate
    /// fill. A rejection is an `Err`.
    async fn submit_order(&self, req: &OrderRequest) -> Result<OrderAck>;

    /// Cancel a working order. Cancelling an already-terminal order is not
    /// an error.
    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    /// Poll the current state of a working order.
    async fn order_status(&self, order_id: &str) -> Result<OrderStatus>;

    /// Available cash balance in cents.
    async fn get_balance(&self) -> Result<i64>;

    /// REST full-snapshot fetch for one instrument, used for gap recovery.
    async fn fetch_book(&self, instrument: &str) -> Result<MarketPayload>;

    /// Open the streaming feed for the given instruments. The receiver
    /// yields book deltas, full snapshots, and fill events; it closing
    /// means the connection dropped and the caller should reconnect.
    async fn stream_book(&self, instruments: &[String])
        -> Result<mpsc::Receiver<MarketPayload>>;
}
