use thiserror::Error;

/// Errors surfaced by the throttling primitives.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleError {
    /// The caller's cancellation token fired while waiting.
    #[error("wait cancelled")]
    Cancelled,
}
