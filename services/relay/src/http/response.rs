use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use herald_protocol::{error_codes, ErrorEnvelope};
use std::fmt::Display;

use crate::rate_limit::{self, RateLimitDecision};

pub type HttpResponse = Response;
pub type HttpResult<T = Response> = Result<T, HttpResponse>;

pub(crate) fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> HttpResponse {
    (status, Json(ErrorEnvelope::new(code, message))).into_response()
}

pub fn invalid_request(message: impl Into<String>) -> HttpResponse {
    json_error(
        StatusCode::BAD_REQUEST,
        error_codes::INVALID_REQUEST,
        message,
    )
}

pub fn unauthorized(message: impl Into<String>) -> HttpResponse {
    json_error(
        StatusCode::UNAUTHORIZED,
        error_codes::UNAUTHORIZED,
        message,
    )
}

pub fn forbidden(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::FORBIDDEN, error_codes::FORBIDDEN, message)
}

pub fn not_found(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::NOT_FOUND, error_codes::NOT_FOUND, message)
}

pub fn rate_limited(message: impl Into<String>) -> HttpResponse {
    json_error(
        StatusCode::TOO_MANY_REQUESTS,
        error_codes::RATE_LIMITED,
        message,
    )
}

pub fn internal_error(err: impl Display) -> HttpResponse {
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        error_codes::INTERNAL_ERROR,
        err.to_string(),
    )
}

/// Attach `X-RateLimit-{Limit,Remaining,Reset}` to an outgoing response.
pub fn with_rate_limit_headers(mut response: Response, decision: &RateLimitDecision) -> Response {
    let headers = response.headers_mut();
    for (name, value) in rate_limit::headers(decision) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn assert_error_response(
        response: Response,
        expected_status: StatusCode,
        expected_code: &str,
    ) {
        assert_eq!(response.status(), expected_status);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        let parsed: ErrorEnvelope =
            serde_json::from_slice(&body).expect("response body should be valid error json");
        assert_eq!(parsed.error.code, expected_code);
        assert!(parsed.error.request_id.starts_with("req_"));
    }

    #[tokio::test]
    async fn error_helpers_set_status_and_code() {
        assert_error_response(
            invalid_request("bad"),
            StatusCode::BAD_REQUEST,
            "invalid_request",
        )
        .await;
        assert_error_response(unauthorized("no"), StatusCode::UNAUTHORIZED, "unauthorized").await;
        assert_error_response(forbidden("no"), StatusCode::FORBIDDEN, "forbidden").await;
        assert_error_response(not_found("missing"), StatusCode::NOT_FOUND, "not_found").await;
        assert_error_response(
            rate_limited("slow down"),
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
        )
        .await;
        assert_error_response(
            internal_error("boom"),
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
        )
        .await;
    }

    #[tokio::test]
    async fn rate_limit_headers_are_attached() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: 60,
            remaining: 0,
            reset: 1_700_000_060,
        };
        let response = with_rate_limit_headers(rate_limited("slow down"), &decision);
        assert_eq!(response.headers()["X-RateLimit-Limit"], "60");
        assert_eq!(response.headers()["X-RateLimit-Remaining"], "0");
        assert_eq!(response.headers()["X-RateLimit-Reset"], "1700000060");
    }
}
