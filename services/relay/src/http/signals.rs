//! Publisher-facing signal endpoints: ingest, listing, channel stats.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use herald_protocol::{generate_id, id_prefix, Urgency};
use serde::Deserialize;
use tracing::info;

use crate::auth::OwnerType;
use crate::http::response::{
    forbidden, internal_error, invalid_request, not_found, with_rate_limit_headers, HttpResponse,
};
use crate::http::{decode_cursor, encode_cursor, enforce_rate_limit, require_auth};
use crate::repo::{channels, jobs, signals, subscriptions};
use crate::state::AppState;

/// Largest accepted `body` field, serialized bytes.
const MAX_BODY_BYTES: usize = 1024 * 1024;

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 200;

#[derive(Debug, PartialEq)]
pub(crate) struct SignalRequest {
    pub title: String,
    pub body: String,
    pub urgency: Urgency,
    pub metadata: serde_json::Value,
}

/// Validate the ingest payload.  Errors are client-attributable prose for
/// the `invalid_request` envelope.
pub(crate) fn parse_signal_request(raw: &[u8]) -> Result<SignalRequest, String> {
    let value: serde_json::Value =
        serde_json::from_slice(raw).map_err(|e| format!("request body is not valid JSON: {e}"))?;
    let obj = value
        .as_object()
        .ok_or_else(|| "request body must be a JSON object".to_owned())?;

    let title = obj
        .get("title")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "title is required".to_owned())?;
    if title.trim().is_empty() {
        return Err("title must be non-empty".to_owned());
    }

    let body = obj.get("body").and_then(|v| v.as_str()).unwrap_or_default();
    if body.len() > MAX_BODY_BYTES {
        return Err("body exceeds 1 MiB".to_owned());
    }

    let urgency = match obj.get("urgency") {
        None | Some(serde_json::Value::Null) => Urgency::Normal,
        Some(serde_json::Value::String(s)) => Urgency::parse(s)
            .ok_or_else(|| "urgency must be one of low, normal, high, critical".to_owned())?,
        Some(_) => return Err("urgency must be a string".to_owned()),
    };

    let metadata = match obj.get("metadata") {
        None | Some(serde_json::Value::Null) => serde_json::json!({}),
        Some(v @ serde_json::Value::Object(_)) => v.clone(),
        Some(_) => return Err("metadata must be an object".to_owned()),
    };

    Ok(SignalRequest {
        title: title.to_owned(),
        body: body.to_owned(),
        urgency,
        metadata,
    })
}

/// `POST /v1/channels/{id}/signals`
pub async fn push_signal(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
    raw_body: Bytes,
) -> HttpResponse {
    let deadline = state.config.ingest_deadline;
    match tokio::time::timeout(deadline, handle_push(state, channel_id, headers, raw_body)).await {
        Ok(response) => response,
        Err(_) => internal_error("ingest deadline exceeded"),
    }
}

async fn handle_push(
    state: AppState,
    channel_id: String,
    headers: HeaderMap,
    raw_body: Bytes,
) -> HttpResponse {
    let ctx = match require_auth(&state, &headers).await {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    if ctx.owner_type != OwnerType::Publisher {
        return forbidden("signal ingest requires a publisher key");
    }
    let decision = match enforce_rate_limit(&state, &ctx).await {
        Ok(decision) => decision,
        Err(response) => return response,
    };

    let request = match parse_signal_request(&raw_body) {
        Ok(request) => request,
        Err(message) => return with_rate_limit_headers(invalid_request(message), &decision),
    };

    let channel = match channels::get(&state.pool, &channel_id).await {
        Ok(Some(channel)) => channel,
        Ok(None) => return with_rate_limit_headers(not_found("channel not found"), &decision),
        Err(e) => return internal_error(e),
    };
    if channel.publisher_id != ctx.owner_id {
        return with_rate_limit_headers(forbidden("channel belongs to another publisher"), &decision);
    }
    if channel.status != "active" {
        return with_rate_limit_headers(not_found("channel is not active"), &decision);
    }

    // The signal row and its fan-out jobs commit together.
    let signal = {
        let mut tx = match state.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => return internal_error(e),
        };
        let signal = match signals::insert(
            &mut tx,
            &generate_id(id_prefix::SIGNAL),
            &channel.channel_id,
            &request.title,
            &request.body,
            request.urgency,
            &request.metadata,
        )
        .await
        {
            Ok(signal) => signal,
            Err(e) => return internal_error(e),
        };
        let subs = match subscriptions::active_for_channel(&mut tx, &channel.channel_id).await {
            Ok(subs) => subs,
            Err(e) => return internal_error(e),
        };
        let lane = jobs::lane_for(request.urgency);
        for sub in &subs {
            if let Err(e) = jobs::enqueue(
                &mut tx,
                lane,
                &signal.signal_id,
                &sub.subscription_id,
                sub.webhook_id.as_deref(),
                1,
                0,
            )
            .await
            {
                return internal_error(e);
            }
        }
        if let Err(e) = tx.commit().await {
            return internal_error(e);
        }
        info!(
            signal_id = %signal.signal_id,
            channel_id = %channel.channel_id,
            urgency = %request.urgency.as_str(),
            fan_out = subs.len(),
            "signal accepted"
        );
        signal
    };

    with_rate_limit_headers(
        Json(serde_json::json!({
            "id": signal.signal_id,
            "channelId": signal.channel_id,
            "status": signal.status,
            "createdAt": signal.created_at.to_rfc3339(),
        }))
        .into_response(),
        &decision,
    )
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

/// `GET /v1/channels/{id}/signals`
pub async fn list_signals(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
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
    let channel = match channels::get(&state.pool, &channel_id).await {
        Ok(Some(channel)) => channel,
        Ok(None) => return with_rate_limit_headers(not_found("channel not found"), &decision),
        Err(e) => return internal_error(e),
    };
    if ctx.owner_type != OwnerType::Publisher || channel.publisher_id != ctx.owner_id {
        return with_rate_limit_headers(forbidden("channel belongs to another publisher"), &decision);
    }

    let after = match query.cursor.as_deref() {
        Some(cursor) => match decode_cursor(cursor) {
            Some(after) => Some(after),
            None => return with_rate_limit_headers(invalid_request("malformed cursor"), &decision),
        },
        None => None,
    };
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);

    let rows = match signals::list_for_channel(&state.pool, &channel_id, after, limit).await {
        Ok(rows) => rows,
        Err(e) => return internal_error(e),
    };
    let next_cursor = (rows.len() as i64 == limit)
        .then(|| rows.last().map(|r| encode_cursor(r.created_at, &r.signal_id)))
        .flatten();
    let items: Vec<serde_json::Value> = rows
        .iter()
        .map(|r| {
            serde_json::json!({
                "id": r.signal_id,
                "title": r.title,
                "urgency": r.urgency,
                "status": r.status,
                "createdAt": r.created_at.to_rfc3339(),
            })
        })
        .collect();

    with_rate_limit_headers(
        Json(serde_json::json!({ "items": items, "nextCursor": next_cursor })).into_response(),
        &decision,
    )
}

/// `GET /v1/channels/{id}/stats`
pub async fn channel_stats(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
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
    let channel = match channels::get(&state.pool, &channel_id).await {
        Ok(Some(channel)) => channel,
        Ok(None) => return with_rate_limit_headers(not_found("channel not found"), &decision),
        Err(e) => return internal_error(e),
    };
    if ctx.owner_type != OwnerType::Publisher || channel.publisher_id != ctx.owner_id {
        return with_rate_limit_headers(forbidden("channel belongs to another publisher"), &decision);
    }

    let stats = match channels::stats(&state.pool, &channel_id).await {
        Ok(stats) => stats,
        Err(e) => return internal_error(e),
    };
    let success_rate = (stats.delivery_total > 0)
        .then(|| stats.delivery_success as f64 / stats.delivery_total as f64);

    with_rate_limit_headers(
        Json(serde_json::json!({
            "signalCount": stats.signal_count,
            "subscriberCount": stats.subscriber_count,
            "deliverySuccessRate": success_rate,
        }))
        .into_response(),
        &decision,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_payload_parses() {
        let request = parse_signal_request(
            br#"{"title": "t", "body": "b", "urgency": "critical", "metadata": {"k": 1}}"#,
        )
        .unwrap();
        assert_eq!(request.title, "t");
        assert_eq!(request.urgency, Urgency::Critical);
        assert_eq!(request.metadata["k"], 1);
    }

    #[test]
    fn urgency_defaults_to_normal() {
        let request = parse_signal_request(br#"{"title": "t", "body": "b"}"#).unwrap();
        assert_eq!(request.urgency, Urgency::Normal);
    }

    #[test]
    fn title_is_required_and_non_empty() {
        assert!(parse_signal_request(br#"{"body": "b"}"#).is_err());
        assert!(parse_signal_request(br#"{"title": "   ", "body": "b"}"#).is_err());
    }

    #[test]
    fn unknown_urgency_is_rejected() {
        let err = parse_signal_request(br#"{"title": "t", "urgency": "urgent"}"#).unwrap_err();
        assert!(err.contains("urgency"));
    }

    #[test]
    fn metadata_must_be_an_object() {
        assert!(parse_signal_request(br#"{"title": "t", "metadata": [1]}"#).is_err());
        assert!(parse_signal_request(br#"{"title": "t", "metadata": null}"#).is_ok());
    }

    #[test]
    fn oversized_body_is_rejected() {
        let body = "x".repeat(MAX_BODY_BYTES + 1);
        let raw = serde_json::to_vec(&serde_json::json!({"title": "t", "body": body})).unwrap();
        assert!(parse_signal_request(&raw).is_err());
    }

    #[test]
    fn non_json_is_rejected() {
        assert!(parse_signal_request(b"not json").is_err());
        assert!(parse_signal_request(br#"["array"]"#).is_err());
    }
}
