//! Token-bucket rate limiting against the shared Redis store.
//!
//! One bucket per API key, stored as a hash with fields `tokens` (float)
//! and `ts` (unix seconds).  Capacity equals the per-minute tier limit and
//! refills continuously.  The read-refill-decrement step runs as a Lua
//! script so concurrent callers cannot double-spend; idle buckets expire
//! after 120 s.

use redis::aio::ConnectionManager;

/// Atomic bucket update.  Returns `{allowed, remaining_tokens_as_string}`.
const TOKEN_BUCKET_SCRIPT: &str = r"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil then tokens = capacity end
if ts == nil then ts = now end
local refilled = math.min(capacity, tokens + (now - ts) * capacity / 60)
local allowed = 0
if refilled >= 1 then
  refilled = refilled - 1
  allowed = 1
end
redis.call('HSET', key, 'tokens', tostring(refilled), 'ts', tostring(now))
redis.call('EXPIRE', key, 120)
return {allowed, tostring(refilled)}
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Tier capacity, for the `X-RateLimit-Limit` header.
    pub limit: u32,
    /// Whole tokens left after this check.
    pub remaining: u32,
    /// Epoch seconds when at least one token will be available again.
    pub reset: i64,
}

/// Check and consume one token for `api_key_id`.
pub async fn check(
    redis: &mut ConnectionManager,
    api_key_id: &str,
    limit: u32,
    now: i64,
) -> Result<RateLimitDecision, redis::RedisError> {
    let key = format!("herald:bucket:{api_key_id}");
    let (allowed, remaining): (i64, String) = redis::Script::new(TOKEN_BUCKET_SCRIPT)
        .key(key)
        .arg(limit)
        .arg(now)
        .invoke_async(redis)
        .await?;
    let remaining: f64 = remaining.parse().unwrap_or(0.0);
    Ok(decision(allowed == 1, limit, remaining, now))
}

/// Build the decision from the post-update bucket level.  Mirrors the Lua
/// arithmetic so the header math stays unit-testable.
fn decision(allowed: bool, limit: u32, remaining_tokens: f64, now: i64) -> RateLimitDecision {
    let reset = if remaining_tokens >= 1.0 {
        now
    } else {
        let deficit = 1.0 - remaining_tokens;
        now + (deficit * 60.0 / f64::from(limit)).ceil() as i64
    };
    RateLimitDecision {
        allowed,
        limit,
        remaining: remaining_tokens.floor() as u32,
        reset,
    }
}

/// Pure mirror of the script's refill step, used by the unit tests to pin
/// the bucket arithmetic.
fn refill(tokens: f64, ts: i64, now: i64, capacity: u32) -> f64 {
    let capacity = f64::from(capacity);
    (tokens + (now - ts) as f64 * capacity / 60.0).min(capacity)
}

/// `X-RateLimit-{Limit,Remaining,Reset}` header values for a decision.
pub fn headers(decision: &RateLimitDecision) -> [(&'static str, String); 3] {
    [
        ("X-RateLimit-Limit", decision.limit.to_string()),
        ("X-RateLimit-Remaining", decision.remaining.to_string()),
        ("X-RateLimit-Reset", decision.reset.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive the pure refill/decrement mirror the way the script does.
    fn simulate(tokens: &mut f64, ts: &mut i64, now: i64, capacity: u32) -> bool {
        let mut refilled = refill(*tokens, *ts, now, capacity);
        let allowed = refilled >= 1.0;
        if allowed {
            refilled -= 1.0;
        }
        *tokens = refilled;
        *ts = now;
        allowed
    }

    #[test]
    fn full_bucket_drains_to_denial() {
        let capacity = 60;
        let mut tokens = f64::from(capacity);
        let mut ts = 0;
        // All capacity consumed within the same second…
        for _ in 0..60 {
            assert!(simulate(&mut tokens, &mut ts, 0, capacity));
        }
        // …and the 61st check is denied.
        assert!(!simulate(&mut tokens, &mut ts, 0, capacity));
    }

    #[test]
    fn sustained_hammering_is_bounded_by_burst_plus_refill() {
        let capacity = 60;
        let mut tokens = f64::from(capacity);
        let mut ts = 0;
        let mut allowed = 0;
        // Hammer the bucket every 250 ms-ish over one minute (240 checks).
        for i in 0..240 {
            if simulate(&mut tokens, &mut ts, i / 4, capacity) {
                allowed += 1;
            }
        }
        // Initial burst of 60 plus at most the refill earned during the
        // window; a depleted bucket never exceeds the refill rate.
        assert!(allowed <= 2 * capacity);
    }

    #[test]
    fn idle_bucket_refills_to_capacity() {
        let capacity = 60;
        let mut tokens = 0.0;
        let mut ts = 0;
        // 60 s idle refills the whole bucket, not more.
        assert!(simulate(&mut tokens, &mut ts, 60, capacity));
        assert!((tokens - 59.0).abs() < 1e-9);
    }

    #[test]
    fn refill_is_proportional() {
        // 30 s at capacity 60 earns 30 tokens.
        assert!((refill(0.0, 0, 30, 60) - 30.0).abs() < 1e-9);
        // Cap applies.
        assert!((refill(50.0, 0, 3600, 60) - 60.0).abs() < 1e-9);
    }

    #[test]
    fn denied_decision_reports_zero_remaining_and_future_reset() {
        let d = decision(false, 60, 0.25, 1_000);
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert!(d.reset > 1_000);

        let hs = headers(&d);
        assert_eq!(hs[0], ("X-RateLimit-Limit", "60".to_owned()));
        assert_eq!(hs[1], ("X-RateLimit-Remaining", "0".to_owned()));
    }

    #[test]
    fn allowed_decision_reset_is_now() {
        let d = decision(true, 60, 59.0, 1_000);
        assert!(d.allowed);
        assert_eq!(d.remaining, 59);
        assert_eq!(d.reset, 1_000);
    }
}
