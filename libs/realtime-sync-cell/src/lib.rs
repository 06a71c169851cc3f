// libs/realtime-sync-cell/src/lib.rs
//! # Realtime Sync Cell
//!
//! Multi-channel delivery of SOS alerts and consultation chat messages. Every
//! event can reach a client through several channels at once; this cell
//! reconciles them so the consumer renders each logical event exactly once.
//!
//! ## Features
//!
//! - **Push change feed**: row inserts/updates as they happen
//! - **Broadcast side-channel**: low-latency SOS copies with placeholder ids
//! - **Polling backstop**: recency-window queries, accelerated while push is down
//! - **Optimistic sends**: chat messages rendered before the server confirms them,
//!   upgraded in place once the authoritative copy arrives
//! - **Delivery monitoring**: bounded alert latency under push failure
//!
//! ## Architecture
//!
//! ```text
//! +-----------------------------------------------------+
//! |                  Realtime Sync Cell                 |
//! +-----------------------------------------------------+
//! |  handlers.rs    |  HTTP endpoint handlers           |
//! |  router.rs      |  Route definitions                |
//! |  models.rs      |  Envelopes, keys, notifications   |
//! |  services/      |  Business logic layer             |
//! |    adapters/    |  Push, broadcast, poll channels   |
//! |    engine.rs    |  Reconciliation state machine     |
//! |    monitor.rs   |  Push health and poll cadence     |
//! |    session.rs   |  Per-view engine + adapters       |
//! |    transport/   |  Memory, Redis, Supabase backends |
//! +-----------------------------------------------------+
//! ```
//!
//! ## API Endpoints
//!
//! - `GET /realtime/health` - Delivery health of the alert session
//! - `GET /realtime/alerts/stream` - Server-Sent Events alert feed
//! - `POST /realtime/sos` - Raise an SOS alert
//! - `POST /realtime/alerts/{id}/resolve` - Resolve an SOS alert

pub mod models;
pub mod error;
pub mod services;
pub mod handlers;
pub mod router;

pub use models::*;
pub use error::*;
pub use services::*;
pub use router::create_realtime_router;
