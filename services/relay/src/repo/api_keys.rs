use chrono::{DateTime, Utc};
use herald_protocol::generate_id;
use sqlx::PgPool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKeyRow {
    pub api_key_id: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub owner_type: String,
    pub owner_id: String,
    pub tier: String,
    pub status: String,
    pub last_used_at: Option<DateTime<Utc>>,
}

pub async fn insert(
    pool: &PgPool,
    key_hash: &str,
    key_prefix: &str,
    owner_type: &str,
    owner_id: &str,
    tier: &str,
) -> Result<ApiKeyRow, sqlx::Error> {
    sqlx::query_as::<_, ApiKeyRow>(
        r"INSERT INTO api_keys (api_key_id, key_hash, key_prefix, owner_type, owner_id, tier)
          VALUES ($1, $2, $3, $4, $5, $6)
          RETURNING api_key_id, key_hash, key_prefix, owner_type, owner_id, tier, status, last_used_at",
    )
    .bind(generate_id("key_"))
    .bind(key_hash)
    .bind(key_prefix)
    .bind(owner_type)
    .bind(owner_id)
    .bind(tier)
    .fetch_one(pool)
    .await
}

pub async fn find_active_by_hash(
    pool: &PgPool,
    key_hash: &str,
) -> Result<Option<ApiKeyRow>, sqlx::Error> {
    sqlx::query_as::<_, ApiKeyRow>(
        r"SELECT api_key_id, key_hash, key_prefix, owner_type, owner_id, tier, status, last_used_at
          FROM api_keys
          WHERE key_hash = $1 AND status = 'active'",
    )
    .bind(key_hash)
    .fetch_optional(pool)
    .await
}

pub async fn touch_last_used(pool: &PgPool, api_key_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE api_keys SET last_used_at = now() WHERE api_key_id = $1")
        .bind(api_key_id)
        .execute(pool)
        .await?;
    Ok(())
}
