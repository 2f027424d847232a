//! Market Data Service
//!
//! Keeps live ticker and candle snapshots for the symbols an application
//! is interested in:
//! - Per-symbol stream groups with one feed connection per cadence class
//! - A serialised subscribe/unsubscribe lifecycle per symbol
//! - A concurrent last-value cache with freshness checks and age sweeps
//! - Update fan-out to consumers with bounded, policy-driven queues
//!
//! # Architecture
//!
//! ```text
//!   MarketFeed connections
//!        │ raw JSON (per subscription)
//!    ┌───▼─────┐
//!    │ Ingest  │  ← decode, validate, count
//!    └───┬─────┘
//!        │ put
//!  ┌─────▼─────────┐        ┌──────────────┐
//!  │ SnapshotCache │◀──get──│ Front end    │
//!  └─────┬─────────┘        └──────┬───────┘
//!        │ broadcast               │ subscribe / unsubscribe
//!  ┌─────▼──────┐          ┌───────▼──────────────┐
//!  │ Dispatcher │          │ SubscriptionRegistry │
//!  └─────┬──────┘          └──────────────────────┘
//!        │ bounded queues
//!     consumers
//! ```

pub mod backpressure;
pub mod cache;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod feed;
pub mod ingestion;
pub mod metrics;
pub mod registry;
pub mod service;
pub mod snapshot;
pub mod stream_group;

pub use service::MarketDataService;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
