//! Subscriber-facing delivery records listing.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;

use crate::auth::OwnerType;
use crate::http::response::{
    forbidden, internal_error, invalid_request, not_found, with_rate_limit_headers, HttpResponse,
};
use crate::http::signals::ListQuery;
use crate::http::{decode_cursor, encode_cursor, enforce_rate_limit, require_auth};
use crate::repo::{deliveries, webhooks};
use crate::state::AppState;

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 200;

/// `GET /v1/webhooks/{id}/deliveries`
pub async fn list_deliveries(
    State(state): State<AppState>,
    Path(webhook_id): Path<String>,
    Query(query): Query<ListQuery>,
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
    let webhook = match webhooks::get(&state.pool, &webhook_id).await {
        Ok(Some(webhook)) => webhook,
        Ok(None) => return with_rate_limit_headers(not_found("webhook not found"), &decision),
        Err(e) => return internal_error(e),
    };
    if ctx.owner_type != OwnerType::Subscriber || webhook.subscriber_id != ctx.owner_id {
        return with_rate_limit_headers(
            forbidden("webhook belongs to another subscriber"),
            &decision,
        );
    }

    let after = match query.cursor.as_deref() {
        Some(cursor) => match decode_cursor(cursor) {
            Some(after) => Some(after),
            None => return with_rate_limit_headers(invalid_request("malformed cursor"), &decision),
        },
        None => None,
    };
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);

    let rows = match deliveries::list_for_webhook(&state.pool, &webhook_id, after, limit).await {
        Ok(rows) => rows,
        Err(e) => return internal_error(e),
    };
    let next_cursor = (rows.len() as i64 == limit)
        .then(|| {
            rows.last()
                .map(|r| encode_cursor(r.created_at, &r.delivery_id))
        })
        .flatten();
    let items: Vec<serde_json::Value> = rows
        .iter()
        .map(|r| {
            serde_json::json!({
                "id": r.delivery_id,
                "signalId": r.signal_id,
                "mode": r.mode,
                "attempt": r.attempt,
                "status": r.status,
                "httpStatus": r.http_status,
                "error": r.error,
                "latencyMs": r.latency_ms,
                "createdAt": r.created_at.to_rfc3339(),
                "completedAt": r.completed_at.map(|t| t.to_rfc3339()),
            })
        })
        .collect();

    with_rate_limit_headers(
        Json(serde_json::json!({ "items": items, "nextCursor": next_cursor })).into_response(),
        &decision,
    )
}
