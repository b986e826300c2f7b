use chrono::{DateTime, Utc};
use herald_protocol::{generate_id, id_prefix};
use sqlx::PgPool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeliveryRow {
    pub delivery_id: String,
    pub signal_id: String,
    pub subscription_id: String,
    pub webhook_id: Option<String>,
    pub mode: String,
    pub attempt: i32,
    pub status: String,
    pub http_status: Option<i32>,
    pub error: Option<String>,
    pub latency_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

const COLUMNS: &str = "delivery_id, signal_id, subscription_id, webhook_id, mode, attempt, \
                       status, http_status, error, latency_ms, created_at, completed_at";

/// Create the attempt row in `pending` state before any side effect.
///
/// Replayed jobs re-claim the existing row for the same (signal,
/// subscription, attempt) instead of creating a duplicate; the transport
/// columns are refreshed because the effective mode is resolved per dispatch.
pub async fn claim(
    pool: &PgPool,
    signal_id: &str,
    subscription_id: &str,
    webhook_id: Option<&str>,
    mode: &str,
    attempt: i32,
) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as(
        r"INSERT INTO deliveries (delivery_id, signal_id, subscription_id, webhook_id, mode, attempt)
          VALUES ($1, $2, $3, $4, $5, $6)
          ON CONFLICT (signal_id, subscription_id, attempt)
          DO UPDATE SET status = 'pending', webhook_id = EXCLUDED.webhook_id,
                        mode = EXCLUDED.mode, completed_at = NULL
          RETURNING delivery_id",
    )
    .bind(generate_id(id_prefix::DELIVERY))
    .bind(signal_id)
    .bind(subscription_id)
    .bind(webhook_id)
    .bind(mode)
    .bind(attempt)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

pub async fn mark_success(
    pool: &PgPool,
    delivery_id: &str,
    http_status: Option<i32>,
    latency_ms: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"UPDATE deliveries
          SET status = 'success', http_status = $2, latency_ms = $3, completed_at = now()
          WHERE delivery_id = $1",
    )
    .bind(delivery_id)
    .bind(http_status)
    .bind(latency_ms)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_failed(
    pool: &PgPool,
    delivery_id: &str,
    http_status: Option<i32>,
    error: &str,
    latency_ms: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"UPDATE deliveries
          SET status = 'failed', http_status = $2, error = $3, latency_ms = $4,
              completed_at = now()
          WHERE delivery_id = $1",
    )
    .bind(delivery_id)
    .bind(http_status)
    .bind(error)
    .bind(latency_ms)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(pool: &PgPool, delivery_id: &str) -> Result<Option<DeliveryRow>, sqlx::Error> {
    sqlx::query_as::<_, DeliveryRow>(sqlx::AssertSqlSafe(format!(
        "SELECT {COLUMNS} FROM deliveries WHERE delivery_id = $1"
    )))
    .bind(delivery_id)
    .fetch_optional(pool)
    .await
}

/// Flip a recorded success back to failed after a negative ack.  Returns the
/// row only when it actually transitioned, so duplicate negative acks for
/// the same delivery are applied once.
pub async fn downgrade_to_failed(
    pool: &PgPool,
    delivery_id: &str,
    error: &str,
) -> Result<Option<DeliveryRow>, sqlx::Error> {
    sqlx::query_as::<_, DeliveryRow>(sqlx::AssertSqlSafe(format!(
        "UPDATE deliveries
         SET status = 'failed', error = $2, completed_at = now()
         WHERE delivery_id = $1 AND status = 'success'
         RETURNING {COLUMNS}"
    )))
    .bind(delivery_id)
    .bind(error)
    .fetch_optional(pool)
    .await
}

/// One entry per failed attempt, ordered by attempt, for the dead-letter
/// error history.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FailedAttempt {
    pub attempt: i32,
    pub http_status: Option<i32>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub async fn failed_history(
    pool: &PgPool,
    signal_id: &str,
    subscription_id: &str,
) -> Result<Vec<FailedAttempt>, sqlx::Error> {
    sqlx::query_as::<_, FailedAttempt>(
        r"SELECT attempt, http_status, error, completed_at
          FROM deliveries
          WHERE signal_id = $1 AND subscription_id = $2 AND status = 'failed'
          ORDER BY attempt ASC",
    )
    .bind(signal_id)
    .bind(subscription_id)
    .fetch_all(pool)
    .await
}

/// Page of delivery records for a webhook, newest first.
pub async fn list_for_webhook(
    pool: &PgPool,
    webhook_id: &str,
    after: Option<(DateTime<Utc>, String)>,
    limit: i64,
) -> Result<Vec<DeliveryRow>, sqlx::Error> {
    match after {
        Some((created_at, delivery_id)) => {
            sqlx::query_as::<_, DeliveryRow>(sqlx::AssertSqlSafe(format!(
                "SELECT {COLUMNS} FROM deliveries
                 WHERE webhook_id = $1 AND (created_at, delivery_id) < ($2, $3)
                 ORDER BY created_at DESC, delivery_id DESC
                 LIMIT $4"
            )))
            .bind(webhook_id)
            .bind(created_at)
            .bind(delivery_id)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, DeliveryRow>(sqlx::AssertSqlSafe(format!(
                "SELECT {COLUMNS} FROM deliveries
                 WHERE webhook_id = $1
                 ORDER BY created_at DESC, delivery_id DESC
                 LIMIT $2"
            )))
            .bind(webhook_id)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
    }
}
