//! The transactional delivery job queue.
//!
//! Jobs live in the same Postgres as the entities so fan-out commits
//! atomically with the signal row.  Dequeue locks the claimed row
//! (`FOR UPDATE SKIP LOCKED`) and the caller holds the transaction for the
//! duration of the attempt: deletion on completion and the follow-up insert
//! on failure commit together, and a crashed worker releases the row for
//! someone else by dropping the transaction.

use herald_protocol::Urgency;
use sqlx::{PgPool, Postgres, Transaction};

pub const QUEUE_HIGH: &str = "delivery-high";
pub const QUEUE_NORMAL: &str = "delivery-normal";

/// Which lane a signal's jobs go through.  Retries reuse the job's stored
/// lane, so the choice sticks for the whole ladder.
pub fn lane_for(urgency: Urgency) -> &'static str {
    if urgency.is_high_priority() {
        QUEUE_HIGH
    } else {
        QUEUE_NORMAL
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub job_id: i64,
    pub queue: String,
    pub signal_id: String,
    pub subscription_id: String,
    pub webhook_id: Option<String>,
    pub attempt: i32,
}

/// Insert a job inside an existing transaction (fan-out path).
pub async fn enqueue(
    tx: &mut Transaction<'_, Postgres>,
    queue: &str,
    signal_id: &str,
    subscription_id: &str,
    webhook_id: Option<&str>,
    attempt: i32,
    delay_secs: u64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"INSERT INTO delivery_jobs (queue, signal_id, subscription_id, webhook_id, attempt, not_before)
          VALUES ($1, $2, $3, $4, $5, now() + make_interval(secs => $6))",
    )
    .bind(queue)
    .bind(signal_id)
    .bind(subscription_id)
    .bind(webhook_id)
    .bind(attempt)
    .bind(delay_secs as f64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Insert a job outside any transaction (negative-ack and DLQ-retry paths).
pub async fn enqueue_one(
    pool: &PgPool,
    queue: &str,
    signal_id: &str,
    subscription_id: &str,
    webhook_id: Option<&str>,
    attempt: i32,
    delay_secs: u64,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    enqueue(
        &mut tx,
        queue,
        signal_id,
        subscription_id,
        webhook_id,
        attempt,
        delay_secs,
    )
    .await?;
    tx.commit().await?;
    Ok(())
}

pub type PgTx = Transaction<'static, Postgres>;

/// Claim one due job from a lane.  The returned transaction holds the row
/// lock; dropping it without commit releases the job for another worker.
pub async fn dequeue(pool: &PgPool, queue: &str) -> Result<Option<(PgTx, JobRow)>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let job = sqlx::query_as::<_, JobRow>(
        r"SELECT job_id, queue, signal_id, subscription_id, webhook_id, attempt
          FROM delivery_jobs
          WHERE queue = $1 AND not_before <= now()
          ORDER BY not_before ASC
          FOR UPDATE SKIP LOCKED
          LIMIT 1",
    )
    .bind(queue)
    .fetch_optional(&mut *tx)
    .await?;
    Ok(job.map(|job| (tx, job)))
}

/// Delete the claimed job and commit.  Used for both delivered jobs and
/// terminal failures (the DLQ entry is written by the caller first).
pub async fn complete(mut tx: PgTx, job_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM delivery_jobs WHERE job_id = $1")
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Replace the claimed job with its follow-up attempt in the same lane,
/// atomically.
pub async fn reschedule(
    mut tx: PgTx,
    job: &JobRow,
    next_attempt: i32,
    delay_secs: u64,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM delivery_jobs WHERE job_id = $1")
        .bind(job.job_id)
        .execute(&mut *tx)
        .await?;
    enqueue(
        &mut tx,
        &job.queue,
        &job.signal_id,
        &job.subscription_id,
        job.webhook_id.as_deref(),
        next_attempt,
        delay_secs,
    )
    .await?;
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lanes_follow_urgency() {
        assert_eq!(lane_for(Urgency::Low), QUEUE_NORMAL);
        assert_eq!(lane_for(Urgency::Normal), QUEUE_NORMAL);
        assert_eq!(lane_for(Urgency::High), QUEUE_HIGH);
        assert_eq!(lane_for(Urgency::Critical), QUEUE_HIGH);
    }
}
