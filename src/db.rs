//! Anomaly-store connection pool.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Create the Postgres pool for the anomaly store.
///
/// Connect attempts are bounded at 5 s so an unreachable required backend
/// fails startup quickly instead of hanging.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}
