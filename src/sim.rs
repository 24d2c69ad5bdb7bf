//! In-process exchange for demo runs and integration tests.
//!
//! Deterministic: books and fill behavior are scripted per instrument, and
//! every call path counts invocations so tests can assert properties like
//! "pre-flight failure sends zero orders". IOC orders always fill in full
//! at the ack (an aggressive taker against a scripted book); GTC orders
//! follow the instrument's fill script.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::exchange::ExchangeClient;
use crate::types::{
    now_ms, BookLevel, MarketPayload, OrderAck, OrderRequest, OrderState, OrderStatus,
    TimeInForce,
};

/// How a GTC order on an instrument behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillScript {
    /// Fill the full size at the ack
    Immediate,
    /// Rest, then report a terminal partial fill of this quantity
    Partial(i64),
    /// Reject the submission
    Reject,
    /// Rest open and never fill
    NoFill,
    /// Hang past any reasonable placement timeout
    Timeout,
}

struct SimOrder {
    req: OrderRequest,
    filled: i64,
    state: OrderState,
}

#[derive(Default)]
struct SimBooks {
    books: FxHashMap<String, (BookLevel, BookLevel)>,
    scripts: FxHashMap<String, FillScript>,
}

pub struct SimExchange {
    inner: Mutex<SimBooks>,
    orders: Mutex<FxHashMap<String, SimOrder>>,
    balance_cents: AtomicI64,
    next_order_id: AtomicU64,
    submit_count: AtomicU64,
    cancel_count: AtomicU64,
    stream_txs: Mutex<Vec<mpsc::Sender<MarketPayload>>>,
}

impl SimExchange {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SimBooks::default()),
            orders: Mutex::new(FxHashMap::default()),
            balance_cents: AtomicI64::new(100_000),
            next_order_id: AtomicU64::new(1),
            submit_count: AtomicU64::new(0),
            cancel_count: AtomicU64::new(0),
            stream_txs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_balance(self, cents: i64) -> Self {
        self.balance_cents.store(cents, Ordering::Relaxed);
        self
    }

    /// Set the top of book for an instrument and broadcast it to every
    /// open stream.
    pub fn set_book(&self, instrument: &str, bid: BookLevel, ask: BookLevel) {
        self.inner
            .lock()
            .unwrap()
            .books
            .insert(instrument.to_string(), (bid, ask));
        self.broadcast(MarketPayload::FullSnapshot {
            instrument: instrument.to_string(),
            bid,
            ask,
            ts_ms: now_ms(),
        });
    }

    /// Script GTC fill behavior for an instrument (default Immediate).
    pub fn set_script(&self, instrument: &str, script: FillScript) {
        self.inner
            .lock()
            .unwrap()
            .scripts
            .insert(instrument.to_string(), script);
    }

    /// Inject an arbitrary payload into every open stream (fills, deltas).
    pub fn push_payload(&self, payload: MarketPayload) {
        self.broadcast(payload);
    }

    pub fn submit_count(&self) -> u64 {
        self.submit_count.load(Ordering::Relaxed)
    }

    pub fn cancel_count(&self) -> u64 {
        self.cancel_count.load(Ordering::Relaxed)
    }

    pub fn set_balance(&self, cents: i64) {
        self.balance_cents.store(cents, Ordering::Relaxed);
    }

    fn broadcast(&self, payload: MarketPayload) {
        let mut txs = self.stream_txs.lock().unwrap();
        txs.retain(|tx| tx.try_send(payload.clone()).is_ok());
    }

    fn script_for(&self, instrument: &str) -> FillScript {
        self.inner
            .lock()
            .unwrap()
            .scripts
            .get(instrument)
            .copied()
            .unwrap_or(FillScript::Immediate)
    }

    fn book_for(&self, instrument: &str) -> Option<(BookLevel, BookLevel)> {
        self.inner.lock().unwrap().books.get(instrument).copied()
    }
}

impl Default for SimExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeClient for SimExchange {
    async fn submit_order(&self, req: &OrderRequest) -> Result<OrderAck> {
        self.submit_count.fetch_add(1, Ordering::Relaxed);

        let script = if req.time_in_force == TimeInForce::Ioc {
            // Aggressive taker: crosses the scripted book in full
            match self.script_for(&req.instrument) {
                FillScript::Reject => FillScript::Reject,
                _ => FillScript::Immediate,
            }
        } else {
            self.script_for(&req.instrument)
        };

        match script {
            FillScript::Reject => Err(anyhow!("order rejected: {}", req.instrument)),
            FillScript::Timeout => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(anyhow!("unreachable"))
            }
            FillScript::Immediate => {
                let order_id = format!("sim-{}", self.next_order_id.fetch_add(1, Ordering::Relaxed));
                self.orders.lock().unwrap().insert(
                    order_id.clone(),
                    SimOrder {
                        req: req.clone(),
                        filled: req.size,
                        state: OrderState::Filled,
                    },
                );
                Ok(OrderAck {
                    order_id,
                    filled: req.size,
                    fill_cost_cents: req.price_cents * req.size,
                })
            }
            FillScript::Partial(qty) => {
                let order_id = format!("sim-{}", self.next_order_id.fetch_add(1, Ordering::Relaxed));
                self.orders.lock().unwrap().insert(
                    order_id.clone(),
                    SimOrder {
                        req: req.clone(),
                        filled: qty.min(req.size),
                        state: OrderState::PartiallyFilled,
                    },
                );
                // The partial lands after the ack, during monitoring
                Ok(OrderAck {
                    order_id,
                    filled: 0,
                    fill_cost_cents: 0,
                })
            }
            FillScript::NoFill => {
                let order_id = format!("sim-{}", self.next_order_id.fetch_add(1, Ordering::Relaxed));
                self.orders.lock().unwrap().insert(
                    order_id.clone(),
                    SimOrder {
                        req: req.clone(),
                        filled: 0,
                        state: OrderState::Open,
                    },
                );
                Ok(OrderAck {
                    order_id,
                    filled: 0,
                    fill_cost_cents: 0,
                })
            }
        }
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.cancel_count.fetch_add(1, Ordering::Relaxed);
        let mut orders = self.orders.lock().unwrap();
        match orders.get_mut(order_id) {
            Some(order) => {
                if order.state != OrderState::Filled {
                    order.state = OrderState::Cancelled;
                }
                Ok(())
            }
            // Cancelling an unknown/terminal order is not an error
            None => Ok(()),
        }
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatus> {
        let orders = self.orders.lock().unwrap();
        let order = orders
            .get(order_id)
            .ok_or_else(|| anyhow!("unknown order {}", order_id))?;
        Ok(OrderStatus {
            order_id: order_id.to_string(),
            state: order.state,
            filled: order.filled,
            remaining: order.req.size - order.filled,
            fill_cost_cents: order.req.price_cents * order.filled,
        })
    }

    async fn get_balance(&self) -> Result<i64> {
        Ok(self.balance_cents.load(Ordering::Relaxed))
    }

    async fn fetch_book(&self, instrument: &str) -> Result<MarketPayload> {
        let (bid, ask) = self
            .book_for(instrument)
            .ok_or_else(|| anyhow!("no book for {}", instrument))?;
        Ok(MarketPayload::FullSnapshot {
            instrument: instrument.to_string(),
            bid,
            ask,
            ts_ms: now_ms(),
        })
    }

    async fn stream_book(
        &self,
        instruments: &[String],
    ) -> Result<mpsc::Receiver<MarketPayload>> {
        let (tx, rx) = mpsc::channel(256);

        // Seed the stream with current books
        for instrument in instruments {
            if let Some((bid, ask)) = self.book_for(instrument) {
                let _ = tx.try_send(MarketPayload::FullSnapshot {
                    instrument: instrument.clone(),
                    bid,
                    ask,
                    ts_ms: now_ms(),
                });
            }
        }

        self.stream_txs.lock().unwrap().push(tx);
        Ok(rx)
    }
}
