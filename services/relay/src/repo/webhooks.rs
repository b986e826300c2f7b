use chrono::{DateTime, Utc};
use sqlx::PgPool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookRow {
    pub webhook_id: String,
    pub subscriber_id: String,
    pub url: String,
    pub token: Option<String>,
    pub status: String,
    pub failure_count: i64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

const COLUMNS: &str = "webhook_id, subscriber_id, url, token, status, failure_count, \
                       last_success_at, last_failure_at";

pub async fn get(pool: &PgPool, webhook_id: &str) -> Result<Option<WebhookRow>, sqlx::Error> {
    sqlx::query_as::<_, WebhookRow>(sqlx::AssertSqlSafe(format!(
        "SELECT {COLUMNS} FROM webhooks WHERE webhook_id = $1"
    )))
    .bind(webhook_id)
    .fetch_optional(pool)
    .await
}

/// The fallback endpoint for unpinned subscriptions: the subscriber's single
/// active webhook.  Returns `None` when the subscriber has zero or several.
pub async fn single_active_for_subscriber(
    pool: &PgPool,
    subscriber_id: &str,
) -> Result<Option<WebhookRow>, sqlx::Error> {
    let rows = sqlx::query_as::<_, WebhookRow>(sqlx::AssertSqlSafe(format!(
        "SELECT {COLUMNS} FROM webhooks
         WHERE subscriber_id = $1 AND status = 'active' LIMIT 2"
    )))
    .bind(subscriber_id)
    .fetch_all(pool)
    .await?;
    Ok(match rows.as_slice() {
        [only] => Some(only.clone()),
        _ => None,
    })
}

pub async fn record_success(pool: &PgPool, webhook_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE webhooks SET last_success_at = now() WHERE webhook_id = $1")
        .bind(webhook_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn record_failure(pool: &PgPool, webhook_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE webhooks SET failure_count = failure_count + 1, last_failure_at = now()
         WHERE webhook_id = $1",
    )
    .bind(webhook_id)
    .execute(pool)
    .await?;
    Ok(())
}
