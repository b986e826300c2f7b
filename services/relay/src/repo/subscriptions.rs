use sqlx::{PgPool, Postgres, Transaction};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub subscription_id: String,
    pub subscriber_id: String,
    pub channel_id: String,
    pub webhook_id: Option<String>,
    pub status: String,
}

pub async fn get(
    pool: &PgPool,
    subscription_id: &str,
) -> Result<Option<SubscriptionRow>, sqlx::Error> {
    sqlx::query_as::<_, SubscriptionRow>(
        r"SELECT subscription_id, subscriber_id, channel_id, webhook_id, status
          FROM subscriptions WHERE subscription_id = $1",
    )
    .bind(subscription_id)
    .fetch_optional(pool)
    .await
}

/// Fan-out lookup.  Runs inside the ingest transaction so the job inserts
/// commit atomically with the signal row.
pub async fn active_for_channel(
    tx: &mut Transaction<'_, Postgres>,
    channel_id: &str,
) -> Result<Vec<SubscriptionRow>, sqlx::Error> {
    sqlx::query_as::<_, SubscriptionRow>(
        r"SELECT subscription_id, subscriber_id, channel_id, webhook_id, status
          FROM subscriptions WHERE channel_id = $1 AND status = 'active'",
    )
    .bind(channel_id)
    .fetch_all(&mut **tx)
    .await
}
