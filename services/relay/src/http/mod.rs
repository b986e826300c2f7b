pub mod admin;
pub mod deliveries;
pub mod response;
pub mod signals;

use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};

use crate::auth::{self, AuthContext, AuthError};
use crate::rate_limit::{self, RateLimitDecision};
use crate::state::AppState;

use response::{internal_error, rate_limited, unauthorized, with_rate_limit_headers, HttpResponse};

/// Authenticate the request from its `Authorization` header.
pub(crate) async fn require_auth(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthContext, HttpResponse> {
    let value = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| unauthorized("missing Authorization header"))?;
    auth::validate_bearer(&state.pool, value)
        .await
        .map_err(|e| match e {
            AuthError::Unauthorized => unauthorized("unknown or revoked API key"),
            AuthError::Store(e) => internal_error(e),
        })
}

/// Consume one rate-limit token for the caller's key.  A denial comes back
/// as a ready-to-return 429 with the limit headers attached.
pub(crate) async fn enforce_rate_limit(
    state: &AppState,
    ctx: &AuthContext,
) -> Result<RateLimitDecision, HttpResponse> {
    let mut redis = state.redis.manager().await.map_err(internal_error)?;
    let limit = state.config.tier_limit(&ctx.tier);
    let decision = rate_limit::check(&mut redis, &ctx.api_key_id, limit, Utc::now().timestamp())
        .await
        .map_err(internal_error)?;
    if decision.allowed {
        Ok(decision)
    } else {
        Err(with_rate_limit_headers(
            rate_limited("rate limit exceeded"),
            &decision,
        ))
    }
}

// ---------------------------------------------------------------------------
// Pagination cursors
// ---------------------------------------------------------------------------

/// Opaque list cursor: base64 of `<rfc3339>|<id>` for the last row served.
pub(crate) fn encode_cursor(created_at: DateTime<Utc>, id: &str) -> String {
    URL_SAFE_NO_PAD.encode(format!("{}|{id}", created_at.to_rfc3339()))
}

pub(crate) fn decode_cursor(cursor: &str) -> Option<(DateTime<Utc>, String)> {
    let decoded = URL_SAFE_NO_PAD.decode(cursor).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (ts, id) = decoded.split_once('|')?;
    let ts = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
    Some((ts, id.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trip() {
        let ts = Utc::now();
        let cursor = encode_cursor(ts, "sig_abc");
        let (decoded_ts, decoded_id) = decode_cursor(&cursor).expect("cursor should decode");
        assert_eq!(decoded_ts, ts);
        assert_eq!(decoded_id, "sig_abc");
    }

    #[test]
    fn malformed_cursors_are_rejected() {
        assert!(decode_cursor("not-base64!").is_none());
        assert!(decode_cursor(&URL_SAFE_NO_PAD.encode("missing-separator")).is_none());
        assert!(decode_cursor(&URL_SAFE_NO_PAD.encode("not-a-date|sig_x")).is_none());
    }
}
