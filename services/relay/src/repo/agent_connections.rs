use sqlx::PgPool;

pub async fn insert(
    pool: &PgPool,
    connection_id: &str,
    subscriber_id: &str,
    server_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"INSERT INTO agent_connections (connection_id, subscriber_id, server_id)
          VALUES ($1, $2, $3)",
    )
    .bind(connection_id)
    .bind(subscriber_id)
    .bind(server_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_disconnected(
    pool: &PgPool,
    connection_id: &str,
    reason: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"UPDATE agent_connections
          SET disconnected_at = now(), disconnect_reason = $2
          WHERE connection_id = $1 AND disconnected_at IS NULL",
    )
    .bind(connection_id)
    .bind(reason)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn increment_delivered(pool: &PgPool, connection_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE agent_connections SET signals_delivered = signals_delivered + 1
         WHERE connection_id = $1",
    )
    .bind(connection_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Close out rows left live by an unclean shutdown of this instance.
pub async fn close_stale_for_server(pool: &PgPool, server_id: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r"UPDATE agent_connections
          SET disconnected_at = now(), disconnect_reason = 'server_restart'
          WHERE server_id = $1 AND disconnected_at IS NULL",
    )
    .bind(server_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
