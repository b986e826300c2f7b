use sqlx::PgPool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriberRow {
    pub subscriber_id: String,
    pub delivery_mode: String,
    pub webhook_secret: String,
    pub status: String,
}

pub async fn get(pool: &PgPool, subscriber_id: &str) -> Result<Option<SubscriberRow>, sqlx::Error> {
    sqlx::query_as::<_, SubscriberRow>(
        r"SELECT subscriber_id, delivery_mode, webhook_secret, status
          FROM subscribers WHERE subscriber_id = $1",
    )
    .bind(subscriber_id)
    .fetch_optional(pool)
    .await
}
