//! Dead-letter administration: inspection and re-enqueue.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use tracing::info;

use crate::http::response::{internal_error, not_found, with_rate_limit_headers, HttpResponse};
use crate::http::{enforce_rate_limit, require_auth};
use crate::repo::{dead_letters, deliveries, jobs, signals};
use crate::state::AppState;

/// `GET /v1/admin/dlq`
pub async fn list_dlq(State(state): State<AppState>, headers: HeaderMap) -> HttpResponse {
    let ctx = match require_auth(&state, &headers).await {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    let decision = match enforce_rate_limit(&state, &ctx).await {
        Ok(decision) => decision,
        Err(response) => return response,
    };
    let rows = match dead_letters::list_unresolved(&state.pool).await {
        Ok(rows) => rows,
        Err(e) => return internal_error(e),
    };
    let items: Vec<serde_json::Value> = rows
        .iter()
        .map(|r| {
            serde_json::json!({
                "id": r.dead_letter_id,
                "deliveryId": r.delivery_id,
                "signalId": r.signal_id,
                "subscriptionId": r.subscription_id,
                "payload": r.payload,
                "errorHistory": r.error_history,
                "createdAt": r.created_at.to_rfc3339(),
            })
        })
        .collect();
    with_rate_limit_headers(
        Json(serde_json::json!({ "items": items })).into_response(),
        &decision,
    )
}

/// `POST /v1/admin/dlq/{id}/retry`
///
/// Starts a fresh attempt chain for the entry's (signal, subscription) pair
/// in its original priority lane.  Marking the entry resolved first makes a
/// repeated retry a no-op, so at most one new chain is enqueued per entry.
pub async fn retry_dlq(
    State(state): State<AppState>,
    Path(dead_letter_id): Path<String>,
    headers: HeaderMap,
) -> HttpResponse {
    let ctx = match require_auth(&state, &headers).await {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    let decision = match enforce_rate_limit(&state, &ctx).await {
        Ok(decision) => decision,
        Err(response) => return response,
    };
    let entry = match dead_letters::get(&state.pool, &dead_letter_id).await {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            return with_rate_limit_headers(not_found("dead-letter entry not found"), &decision)
        }
        Err(e) => return internal_error(e),
    };

    let freshly_resolved = match dead_letters::resolve(&state.pool, &dead_letter_id).await {
        Ok(resolved) => resolved,
        Err(e) => return internal_error(e),
    };
    if freshly_resolved {
        let signal = match signals::get(&state.pool, &entry.signal_id).await {
            Ok(Some(signal)) => signal,
            Ok(None) => return not_found("signal no longer exists"),
            Err(e) => return internal_error(e),
        };
        let webhook_id = match deliveries::get(&state.pool, &entry.delivery_id).await {
            Ok(row) => row.and_then(|r| r.webhook_id),
            Err(e) => return internal_error(e),
        };
        if let Err(e) = jobs::enqueue_one(
            &state.pool,
            jobs::lane_for(signal.urgency()),
            &entry.signal_id,
            &entry.subscription_id,
            webhook_id.as_deref(),
            1,
            0,
        )
        .await
        {
            return internal_error(e);
        }
        info!(
            dead_letter_id = %dead_letter_id,
            signal_id = %entry.signal_id,
            "dead-letter entry re-enqueued"
        );
    }

    with_rate_limit_headers(
        Json(serde_json::json!({ "status": "queued" })).into_response(),
        &decision,
    )
}
