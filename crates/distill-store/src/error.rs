use thiserror::Error;

/// Errors surfaced by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// A vector blob whose length is not a multiple of 8 bytes.
    #[error("malformed vector blob of {len} bytes")]
    InvalidVector { len: usize },

    /// Lookup of a row that must exist (e.g. a job being completed).
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}
