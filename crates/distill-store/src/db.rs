//! Pool construction.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::StoreError;
use crate::schema;

/// Open (creating if missing) the store at `path` and bootstrap the schema.
///
/// WAL mode keeps readers unblocked while the write batcher holds the
/// single writer; the busy timeout covers the brief windows where two
/// writers do collide.
pub async fn connect(path: &Path, max_connections: u32) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    schema::init(&pool).await?;
    info!(path = %path.display(), max_connections, "store opened");
    Ok(pool)
}
