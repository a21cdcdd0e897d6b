//! Adaptive throttling primitives.
//!
//! This crate provides the three orthogonal back-pressure primitives the
//! enrichment engine composes, plus the two feedback controllers that tune
//! them at runtime:
//!
//! - [`RateLimiter`]: a leaky bucket shaping outbound requests to a
//!   requests-per-minute cap, reconfigurable while waiters are parked.
//! - [`AdaptiveSemaphore`]: a counting semaphore whose capacity can be
//!   resized at runtime without cancelling in-flight holders.
//! - [`ConcurrencyController`]: an AIMD ticker that resizes the semaphore
//!   from latency and error signals.
//! - [`RateController`]: a multiplicative-decrease / slow-start ticker that
//!   retunes the rate limiter from error signals alone.
//!
//! Handlers never read limits directly; they only interact with the
//! limiter and the semaphore, both of which are safe to reconfigure while
//! in use.

mod concurrency;
mod error;
mod limiter;
mod rate;
mod semaphore;

pub use concurrency::{ConcurrencyController, ConcurrencyControllerConfig};
pub use error::ThrottleError;
pub use limiter::RateLimiter;
pub use rate::{RateController, RateControllerConfig};
pub use semaphore::{AdaptiveSemaphore, Permit};
