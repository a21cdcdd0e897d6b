use thiserror::Error;

/// Errors surfaced by the batchers.
///
/// A whole batch shares one failure, so the type is `Clone` and carries
/// rendered messages rather than source errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// The embedding backend rejected or failed the batch call.
    #[error("embed backend: {0}")]
    Backend(String),
    /// The backend returned a different number of vectors than inputs.
    #[error("embed backend returned {got} vectors for {expected} inputs")]
    Mismatch { expected: usize, got: usize },
    /// The batch transaction failed to apply or commit.
    #[error("write batch failed: {0}")]
    Commit(String),
    /// The batcher is shut down and no longer accepts work.
    #[error("batcher closed")]
    Closed,
    /// The caller's cancellation token fired while waiting for the batch.
    #[error("wait cancelled")]
    Cancelled,
}
