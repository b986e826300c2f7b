use chrono::{DateTime, Utc};
use herald_protocol::{generate_id, id_prefix};
use sqlx::PgPool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeadLetterRow {
    pub dead_letter_id: String,
    pub delivery_id: String,
    pub signal_id: String,
    pub subscription_id: String,
    pub payload: serde_json::Value,
    pub error_history: serde_json::Value,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

const COLUMNS: &str = "dead_letter_id, delivery_id, signal_id, subscription_id, payload, \
                       error_history, resolved_at, created_at";

/// Record a terminally failed (signal, subscription) pair.  At most one
/// entry per pair; a pair that exhausts the ladder again after a retry
/// reopens its entry with the fresh error history.
pub async fn insert(
    pool: &PgPool,
    delivery_id: &str,
    signal_id: &str,
    subscription_id: &str,
    payload: &serde_json::Value,
    error_history: &serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"INSERT INTO dead_letters
              (dead_letter_id, delivery_id, signal_id, subscription_id, payload, error_history)
          VALUES ($1, $2, $3, $4, $5, $6)
          ON CONFLICT (signal_id, subscription_id)
          DO UPDATE SET delivery_id = EXCLUDED.delivery_id,
                        payload = EXCLUDED.payload,
                        error_history = EXCLUDED.error_history,
                        resolved_at = NULL",
    )
    .bind(generate_id(id_prefix::DEAD_LETTER))
    .bind(delivery_id)
    .bind(signal_id)
    .bind(subscription_id)
    .bind(payload)
    .bind(error_history)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(
    pool: &PgPool,
    dead_letter_id: &str,
) -> Result<Option<DeadLetterRow>, sqlx::Error> {
    sqlx::query_as::<_, DeadLetterRow>(sqlx::AssertSqlSafe(format!(
        "SELECT {COLUMNS} FROM dead_letters WHERE dead_letter_id = $1"
    )))
    .bind(dead_letter_id)
    .fetch_optional(pool)
    .await
}

pub async fn list_unresolved(pool: &PgPool) -> Result<Vec<DeadLetterRow>, sqlx::Error> {
    sqlx::query_as::<_, DeadLetterRow>(sqlx::AssertSqlSafe(format!(
        "SELECT {COLUMNS} FROM dead_letters
         WHERE resolved_at IS NULL
         ORDER BY created_at ASC"
    )))
    .fetch_all(pool)
    .await
}

/// Mark an entry resolved.  Returns `false` when it already was, which lets
/// the retry endpoint enqueue at most one new attempt chain per entry.
pub async fn resolve(pool: &PgPool, dead_letter_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE dead_letters SET resolved_at = now()
         WHERE dead_letter_id = $1 AND resolved_at IS NULL",
    )
    .bind(dead_letter_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}
