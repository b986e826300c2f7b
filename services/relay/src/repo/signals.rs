use chrono::{DateTime, Utc};
use herald_protocol::{SignalPayload, Urgency};
use sqlx::{PgPool, Postgres, Transaction};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SignalRow {
    pub signal_id: String,
    pub channel_id: String,
    pub title: String,
    pub body: String,
    pub urgency: String,
    pub metadata: serde_json::Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl SignalRow {
    pub fn urgency(&self) -> Urgency {
        Urgency::parse(&self.urgency).unwrap_or(Urgency::Normal)
    }

    /// The wire form carried in tunnel pushes and webhook envelopes.
    pub fn payload(&self) -> SignalPayload {
        SignalPayload {
            id: self.signal_id.clone(),
            title: self.title.clone(),
            body: self.body.clone(),
            urgency: self.urgency(),
            metadata: self.metadata.clone(),
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

const COLUMNS: &str =
    "signal_id, channel_id, title, body, urgency, metadata, status, created_at";

/// Insert the immutable signal row.  Runs inside the ingest transaction.
pub async fn insert(
    tx: &mut Transaction<'_, Postgres>,
    signal_id: &str,
    channel_id: &str,
    title: &str,
    body: &str,
    urgency: Urgency,
    metadata: &serde_json::Value,
) -> Result<SignalRow, sqlx::Error> {
    sqlx::query_as::<_, SignalRow>(sqlx::AssertSqlSafe(format!(
        "INSERT INTO signals (signal_id, channel_id, title, body, urgency, metadata)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING {COLUMNS}"
    )))
    .bind(signal_id)
    .bind(channel_id)
    .bind(title)
    .bind(body)
    .bind(urgency.as_str())
    .bind(metadata)
    .fetch_one(&mut **tx)
    .await
}

pub async fn get(pool: &PgPool, signal_id: &str) -> Result<Option<SignalRow>, sqlx::Error> {
    sqlx::query_as::<_, SignalRow>(sqlx::AssertSqlSafe(format!("SELECT {COLUMNS} FROM signals WHERE signal_id = $1")))
        .bind(signal_id)
        .fetch_optional(pool)
        .await
}

/// Page of signals for a channel, newest first.  The cursor is the
/// (created_at, signal_id) of the last row of the previous page.
pub async fn list_for_channel(
    pool: &PgPool,
    channel_id: &str,
    after: Option<(DateTime<Utc>, String)>,
    limit: i64,
) -> Result<Vec<SignalRow>, sqlx::Error> {
    match after {
        Some((created_at, signal_id)) => {
            sqlx::query_as::<_, SignalRow>(sqlx::AssertSqlSafe(format!(
                "SELECT {COLUMNS} FROM signals
                 WHERE channel_id = $1
                   AND (created_at, signal_id) < ($2, $3)
                 ORDER BY created_at DESC, signal_id DESC
                 LIMIT $4"
            )))
            .bind(channel_id)
            .bind(created_at)
            .bind(signal_id)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, SignalRow>(sqlx::AssertSqlSafe(format!(
                "SELECT {COLUMNS} FROM signals
                 WHERE channel_id = $1
                 ORDER BY created_at DESC, signal_id DESC
                 LIMIT $2"
            )))
            .bind(channel_id)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
    }
}
