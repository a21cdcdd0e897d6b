//! Core infrastructure for distill.
//!
//! This crate provides the shared vocabulary used across all distill
//! components:
//! - Outcome taxonomy and error classification
//! - Fixed-cadence observation windows for the feedback controllers
//! - Structured controller snapshots for observability

pub mod outcome;
pub mod snapshot;
pub mod window;

pub use outcome::Outcome;
pub use snapshot::ControllerSnapshot;
pub use window::{ObservationWindow, WindowStats};
