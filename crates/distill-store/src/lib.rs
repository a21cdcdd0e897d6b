//! SQLite persistence for the enrichment engine.
//!
//! Three concerns live here:
//! - pool construction and schema bootstrap ([`db`], [`schema`]),
//! - the enrichment records the handlers read and write ([`records`],
//!   [`vector`]),
//! - the durable, leased job queue the scheduler drains ([`queue`]).

pub mod db;
mod error;
pub mod queue;
pub mod records;
pub mod schema;
pub mod vector;

pub use db::connect;
pub use error::StoreError;
pub use queue::{Job, JobQueue, JobState, JobType, QueueConfig, QueueStats};
pub use records::{
    AnalysisRun, AnalysisType, BeginRun, Embedding, Facet, OutputKind, RunStatus, TargetKind,
};
