// herald-protocol: shared wire contracts for the Herald relay.
//
// All tunnel messages use a top-level `type` field for discriminated
// deserialization.  One JSON object per WebSocket text frame; frames larger
// than MAX_FRAME_BYTES are rejected at the transport layer.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Entity identifiers
// ---------------------------------------------------------------------------

/// Length of the random portion of every generated identifier.
pub const ID_RANDOM_LEN: usize = 24;

/// Identifier prefixes.  Every entity id is `<prefix><24 url-safe chars>`.
pub mod id_prefix {
    pub const SIGNAL: &str = "sig_";
    pub const SUBSCRIPTION: &str = "sub_";
    pub const CHANNEL: &str = "ch_";
    pub const DELIVERY: &str = "del_";
    pub const WEBHOOK: &str = "wh_";
    pub const CONNECTION: &str = "conn_";
    pub const DEAD_LETTER: &str = "dlq_";
    pub const REQUEST: &str = "req_";
    pub const SERVER: &str = "srv_";
    /// Raw API key prefixes.  The key itself is `<prefix><24 chars>`; the
    /// store retains only its sha256 and the first 12 raw characters.
    pub const PUBLISHER_KEY: &str = "hld_pub_";
    pub const SUBSCRIBER_KEY: &str = "hld_sub_";
}

/// Generate an opaque identifier: `prefix` followed by [`ID_RANDOM_LEN`]
/// URL-safe characters from the thread-local CSPRNG.
pub fn generate_id(prefix: &str) -> String {
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{prefix}{random}")
}

// ---------------------------------------------------------------------------
// Urgency and retry schedule
// ---------------------------------------------------------------------------

/// Signal urgency.  Chooses the priority lane at fan-out time; retries stay
/// in the lane the first attempt used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Normal,
    High,
    Critical,
}

impl Urgency {
    pub fn as_str(self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Normal => "normal",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Urgency> {
        match s {
            "low" => Some(Urgency::Low),
            "normal" => Some(Urgency::Normal),
            "high" => Some(Urgency::High),
            "critical" => Some(Urgency::Critical),
            _ => None,
        }
    }

    /// High and critical signals go through the high-priority lane.
    pub fn is_high_priority(self) -> bool {
        matches!(self, Urgency::High | Urgency::Critical)
    }
}

/// Seconds of delay before each attempt, indexed by attempt number - 1.
/// Attempt 1 runs immediately; after attempt 6 fails the pair dead-letters.
pub const RETRY_LADDER: [u64; 6] = [0, 60, 300, 1_800, 7_200, 21_600];

/// Maximum attempt number before a (signal, subscription) pair dead-letters.
pub const MAX_ATTEMPTS: i32 = 6;

/// Delay in seconds before the given 1-based attempt number, or `None` once
/// the ladder is exhausted.
pub fn retry_delay_secs(attempt: i32) -> Option<u64> {
    if attempt < 1 || attempt > MAX_ATTEMPTS {
        return None;
    }
    Some(RETRY_LADDER[(attempt - 1) as usize])
}

// ---------------------------------------------------------------------------
// Tunnel protocol
// ---------------------------------------------------------------------------

/// Maximum size of a single tunnel frame (one JSON object per text frame).
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// WebSocket close codes used by the tunnel server.
pub mod close_codes {
    /// Sent when a client talks before completing the auth handshake.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Sent when the heartbeat grace period expires.
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// The signal body carried in tunnel pushes and webhook envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    pub id: String,
    pub title: String,
    pub body: String,
    pub urgency: Urgency,
    pub metadata: serde_json::Value,
    /// RFC3339 creation timestamp.
    pub created_at: String,
}

/// All tunnel messages, in both directions.
///
/// Client→server: `auth` (must be the first frame), `ack`, `pong`.
/// Server→client: `auth_ok`, `auth_error`, `signal`, `ping`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelMessage {
    /// First client frame.  Anything else before auth closes the
    /// connection with [`close_codes::POLICY_VIOLATION`].
    Auth { token: String },
    /// Acknowledges a pushed signal.  A bare ack is observability only;
    /// an ack carrying `error` downgrades the delivery and re-enters the
    /// retry ladder.
    Ack {
        delivery_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Heartbeat response.
    Pong,
    AuthOk {
        connection_id: String,
        subscriber_id: String,
    },
    AuthError {
        message: String,
    },
    /// A signal to forward to the agent's local endpoint.
    Signal {
        delivery_id: String,
        channel_id: String,
        channel_slug: String,
        signal: SignalPayload,
    },
    /// Heartbeat probe; clients must answer with `pong`.
    Ping,
}

// ---------------------------------------------------------------------------
// Webhook envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookChannel {
    pub id: String,
    pub slug: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
}

/// Body of every outbound webhook POST.  The exact serialized bytes are what
/// the HMAC signature covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    /// Always `"signal"`.
    pub event: String,
    pub channel: WebhookChannel,
    pub signal: SignalPayload,
}

impl WebhookEnvelope {
    pub fn new(channel: WebhookChannel, signal: SignalPayload) -> Self {
        WebhookEnvelope {
            event: "signal".to_owned(),
            channel,
            signal,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP error envelope
// ---------------------------------------------------------------------------

/// Stable API error codes.
pub mod error_codes {
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const FORBIDDEN: &str = "forbidden";
    pub const NOT_FOUND: &str = "not_found";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub request_id: String,
}

/// `{"error": {"code", "message", "request_id"}}` on every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

impl ErrorEnvelope {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorEnvelope {
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
                request_id: generate_id(id_prefix::REQUEST),
            },
        }
    }
}
