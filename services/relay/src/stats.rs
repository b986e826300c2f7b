//! Background refresh of the denormalized counters.
//!
//! Channel and signal counters are advisory summaries for reporting;
//! keeping them off the delivery hot path avoids write amplification.
//! Authoritative counts always derive from the delivery rows.

use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, warn};

pub async fn run_stats_refresher(
    pool: PgPool,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = refresh(&pool).await {
                    warn!(error = %e, "stats refresh failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("stats refresher stopped");
}

async fn refresh(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"UPDATE channels c SET
              signal_count = (SELECT count(*) FROM signals s
                              WHERE s.channel_id = c.channel_id),
              subscriber_count = (SELECT count(*) FROM subscriptions su
                                  WHERE su.channel_id = c.channel_id
                                    AND su.status = 'active')",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"UPDATE signals s SET
              total_attempts = d.total,
              delivered_count = d.delivered,
              failed_count = d.failed
          FROM (SELECT signal_id,
                       count(*) FILTER (WHERE status <> 'pending') AS total,
                       count(*) FILTER (WHERE status = 'success') AS delivered,
                       count(*) FILTER (WHERE status = 'failed') AS failed
                FROM deliveries
                GROUP BY signal_id) d
          WHERE d.signal_id = s.signal_id",
    )
    .execute(pool)
    .await?;

    debug!("counters refreshed");
    Ok(())
}
