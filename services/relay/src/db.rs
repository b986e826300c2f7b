//! Postgres setup for the relay.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::RelayConfig;

/// Connect with the configured pool size and bring the schema up to date.
/// Startup is the only caller, so either failure is fatal: the relay cannot
/// accept signals or run workers without its store.
pub async fn connect(config: &RelayConfig) -> PgPool {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_size)
        .connect(&config.database_url)
        .await
        .expect("could not reach Postgres at DATABASE_URL");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("schema migrations did not apply cleanly");
    pool
}
