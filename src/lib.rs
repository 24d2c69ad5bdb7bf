//! Market maker and basket arbitrageur for binary-outcome prediction markets.
//!
//! The execution-safety core that makes unattended, capital-at-risk trading
//! survivable:
//!
//! - **Market-data cache** fed by a persistent streaming connection, with
//!   staleness and gap detection and reconnect/resubscribe
//! - **Atomic basket executor** turning multi-leg placements into an
//!   all-or-nothing operation with emergency liquidation of partial fills
//! - **Inventory ledger** with race-free, idempotent fill application and
//!   volatility-adaptive risk parameters
//! - **Risk controller** with a sub-second one-way kill switch and a
//!   background equity/connectivity monitor
//! - **Quote engine** producing inventory-skewed bid/ask prices with
//!   cancel-and-replace reconciliation
//!
//! Exchange transport (signing, HTTP/WebSocket, auth) lives behind the
//! narrow [`exchange::ExchangeClient`] trait; market discovery, credential
//! management, and process lifecycle are external collaborators.

pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod executor;
pub mod ledger;
pub mod logging;
pub mod market_data;
pub mod metrics;
pub mod quote;
pub mod retry;
pub mod risk;
pub mod sim;
pub mod telemetry;
pub mod types;
