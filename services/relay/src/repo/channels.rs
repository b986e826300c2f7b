use chrono::{DateTime, Utc};
use sqlx::PgPool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChannelRow {
    pub channel_id: String,
    pub publisher_id: String,
    pub slug: String,
    pub display_name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

pub async fn get(pool: &PgPool, channel_id: &str) -> Result<Option<ChannelRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelRow>(
        r"SELECT channel_id, publisher_id, slug, display_name, status, created_at
          FROM channels WHERE channel_id = $1",
    )
    .bind(channel_id)
    .fetch_optional(pool)
    .await
}

/// Authoritative statistics for the channel stats endpoint, computed from
/// the underlying rows rather than the advisory counters.
#[derive(Debug, Clone, Copy, sqlx::FromRow)]
pub struct ChannelStats {
    pub signal_count: i64,
    pub subscriber_count: i64,
    pub delivery_success: i64,
    pub delivery_total: i64,
}

pub async fn stats(pool: &PgPool, channel_id: &str) -> Result<ChannelStats, sqlx::Error> {
    sqlx::query_as::<_, ChannelStats>(
        r"SELECT
            (SELECT count(*) FROM signals WHERE channel_id = $1) AS signal_count,
            (SELECT count(*) FROM subscriptions WHERE channel_id = $1 AND status = 'active')
                AS subscriber_count,
            (SELECT count(*) FROM deliveries d
               JOIN signals s ON s.signal_id = d.signal_id
              WHERE s.channel_id = $1 AND d.status = 'success') AS delivery_success,
            (SELECT count(*) FROM deliveries d
               JOIN signals s ON s.signal_id = d.signal_id
              WHERE s.channel_id = $1 AND d.status <> 'pending') AS delivery_total",
    )
    .bind(channel_id)
    .fetch_one(pool)
    .await
}
