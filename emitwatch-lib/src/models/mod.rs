//! Core data models for emit records and flush batches.

pub mod batch;
pub mod record;

pub use batch::{BatchSummary, BatchToken, CategoryCounts};
pub use record::{EmitKind, EventRecord, RecordError};
