//! Batching planes for the enrichment engine.
//!
//! Two aggregators with the same lifecycle (accumulate, flush on size or
//! timer, fan results back out to blocked submitters, drain on close):
//!
//! - [`EmbedBatcher`] coalesces per-item embedding requests into bounded
//!   multi-item API calls.
//! - [`WriteBatcher`] groups persistence closures into single SQLite
//!   transactions, amortizing write-lock acquisition across many logical
//!   writes.

mod embed;
mod error;
mod write;

pub use embed::{EmbedBackend, EmbedBatcher, EmbedBatcherConfig, EmbedBatcherStats};
pub use error::BatchError;
pub use write::{WriteBatcher, WriteBatcherConfig, WriteBatcherStats, WriteOp};
