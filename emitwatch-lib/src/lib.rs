#![forbid(unsafe_code)]

//! emitwatch-lib: ingestion pipeline for live license-plate recognition emits.
//!
//! The library follows a push feed of emit records and turns it into state a
//! rendering layer can draw without ever blocking on the network or the disk:
//! - Connection state machine with exponential backoff and staleness detection
//! - Ingestion buffer flushed on a fixed cadence into a bounded visible log
//! - Durable log store with age-based pruning for refresh resilience
//! - Rolling per-category metrics series for charting
//! - Presentation filter that suppresses noisy duplicate emits
//!
//! The [`pipeline`] module ties these together behind an actor handle.

pub mod clock;
pub mod config;
pub mod connection;
pub mod filter;
pub mod ingest;
pub mod metrics;
pub mod models;
pub mod persist;
pub mod pipeline;
pub mod store;
pub mod telemetry;

pub use clock::{Clock, SystemClock};
pub use config::{Config, ConfigLoader};
pub use connection::{ConnectionState, Connector, WebSocketConnector};
pub use models::{BatchSummary, BatchToken, CategoryCounts, EmitKind, EventRecord};
pub use pipeline::{Pipeline, PipelineEvent, PipelineHandle, PipelineSnapshot};
pub use store::{FileLogStore, LogStore, MemoryLogStore};
