//! Adaptive bulk LLM enrichment engine.
//!
//! `distill` drives a model endpoint to analyze and embed conversational
//! episodes held in a local SQLite store: a durable job queue feeds a
//! fixed worker pool whose throughput is shaped by two feedback
//! controllers (in-flight concurrency and request rate), with per-item
//! embedding requests coalesced into batch calls and store writes
//! amortized across transactions.
//!
//! This crate re-exports the member crates; see [`engine::Engine`] for
//! the entry point.

pub use distill_batch as batch;
pub use distill_core as core;
pub use distill_engine as engine;
pub use distill_llm as llm;
pub use distill_store as store;
pub use distill_throttle as throttle;

pub use distill_engine::{Engine, EngineConfig, EngineError};
pub use distill_store::{JobQueue, JobType, TargetKind};
