//! Delivery workers: consume jobs from both priority lanes, resolve the
//! transport per dispatch, record one Delivery row per attempt, and feed
//! failures back through the retry ladder until they dead-letter.

use std::time::Instant;

use chrono::Utc;
use herald_protocol::{
    retry_delay_secs, SignalPayload, TunnelMessage, WebhookChannel, WebhookEnvelope, MAX_ATTEMPTS,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::repo::channels::ChannelRow;
use crate::repo::deliveries::FailedAttempt;
use crate::repo::jobs::{JobRow, PgTx, QUEUE_HIGH, QUEUE_NORMAL};
use crate::repo::subscribers::SubscriberRow;
use crate::repo::subscriptions::SubscriptionRow;
use crate::repo::webhooks::WebhookRow;
use crate::repo::signals::SignalRow;
use crate::repo::{channels, dead_letters, deliveries, jobs, signals, subscribers, subscriptions,
    webhooks};
use crate::routing::{self, ForwardedPush};
use crate::signing::sign_payload;
use crate::state::{AgentHandle, AppState};

/// At most this many consecutive high-lane jobs before one normal-lane job
/// is drained, so the normal lane cannot starve.
const HIGH_LANE_BURST: u32 = 32;

/// Lane polling order for the next dequeue given the current streak of
/// consecutive high-lane jobs.
fn lane_order(high_streak: u32) -> [&'static str; 2] {
    if high_streak >= HIGH_LANE_BURST {
        [QUEUE_NORMAL, QUEUE_HIGH]
    } else {
        [QUEUE_HIGH, QUEUE_NORMAL]
    }
}

/// Shared outbound HTTP client for webhook POSTs: pooled connections, total
/// deadline per request including connect.
pub fn http_client(timeout: std::time::Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .expect("failed to build HTTP client")
}

pub fn spawn(
    state: AppState,
    http: reqwest::Client,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..state.config.worker_concurrency)
        .map(|slot| {
            let state = state.clone();
            let http = http.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(worker_loop(state, http, shutdown, slot))
        })
        .collect()
}

async fn worker_loop(
    state: AppState,
    http: reqwest::Client,
    mut shutdown: watch::Receiver<bool>,
    slot: usize,
) {
    debug!(slot, "delivery worker started");
    let mut high_streak: u32 = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }
        match next_job(&state, &mut high_streak).await {
            Ok(Some((tx, job))) => {
                if let Err(e) = process_job(&state, &http, tx, job).await {
                    warn!(slot, error = %e, "job processing failed, job released");
                }
            }
            Ok(None) => {
                tokio::select! {
                    () = tokio::time::sleep(state.config.worker_poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => {
                warn!(slot, error = %e, "queue poll failed");
                tokio::time::sleep(state.config.worker_poll_interval).await;
            }
        }
    }
    debug!(slot, "delivery worker stopped");
}

/// Strict priority with a fairness guard: prefer the high lane, but after
/// [`HIGH_LANE_BURST`] consecutive high-lane jobs serve the normal lane
/// first.
async fn next_job(
    state: &AppState,
    high_streak: &mut u32,
) -> Result<Option<(PgTx, JobRow)>, sqlx::Error> {
    for queue in lane_order(*high_streak) {
        if let Some((tx, job)) = jobs::dequeue(&state.pool, queue).await? {
            if job.queue == QUEUE_HIGH {
                *high_streak += 1;
            } else {
                *high_streak = 0;
            }
            return Ok(Some((tx, job)));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Transport resolution
// ---------------------------------------------------------------------------

enum Transport {
    /// The subscriber's agent is connected to this instance.
    TunnelLocal(AgentHandle),
    /// Another instance holds the socket; forward over its channel.
    TunnelRemote(String),
    Webhook(WebhookRow),
    /// No viable transport at dispatch time: a normal, retryable failure.
    Unavailable,
}

impl Transport {
    fn mode(&self, subscriber: &SubscriberRow) -> &'static str {
        match self {
            Transport::TunnelLocal(_) | Transport::TunnelRemote(_) => "agent",
            Transport::Webhook(_) => "webhook",
            Transport::Unavailable => {
                if subscriber.delivery_mode == "agent" {
                    "agent"
                } else {
                    "webhook"
                }
            }
        }
    }

    fn webhook_id(&self) -> Option<&str> {
        match self {
            Transport::Webhook(w) => Some(&w.webhook_id),
            _ => None,
        }
    }
}

/// The effective delivery mode is decided here, per dispatch, not frozen at
/// subscription time.
async fn resolve_transport(
    state: &AppState,
    job: &JobRow,
    subscription: &SubscriptionRow,
    subscriber: &SubscriberRow,
) -> Transport {
    if subscriber.delivery_mode == "agent" {
        if let Some(agent) = state.agents.lookup(&subscriber.subscriber_id).await {
            return Transport::TunnelLocal(agent);
        }
        if let Ok(mut redis) = state.redis.manager().await {
            match routing::lookup(&mut redis, &subscriber.subscriber_id).await {
                Ok(Some(server)) if server != state.config.server_id => {
                    return Transport::TunnelRemote(server);
                }
                // A claim pointing at this instance without a registry entry
                // is stale; fall through to the webhook path.
                Ok(_) => {}
                Err(e) => debug!(error = %e, "routing lookup failed"),
            }
        }
    }

    let pinned = job.webhook_id.as_deref().or(subscription.webhook_id.as_deref());
    let webhook = match pinned {
        Some(webhook_id) => match webhooks::get(&state.pool, webhook_id).await {
            Ok(Some(w)) if w.status == "active" => Some(w),
            _ => None,
        },
        None => webhooks::single_active_for_subscriber(&state.pool, &subscriber.subscriber_id)
            .await
            .ok()
            .flatten(),
    };
    match webhook {
        Some(w) => Transport::Webhook(w),
        None => Transport::Unavailable,
    }
}

// ---------------------------------------------------------------------------
// Attempt execution
// ---------------------------------------------------------------------------

struct AttemptOutcome {
    success: bool,
    http_status: Option<i32>,
    error: Option<String>,
}

impl AttemptOutcome {
    fn success(http_status: Option<i32>) -> Self {
        AttemptOutcome {
            success: true,
            http_status,
            error: None,
        }
    }

    fn failure(error: impl Into<String>, http_status: Option<i32>) -> Self {
        AttemptOutcome {
            success: false,
            http_status,
            error: Some(error.into()),
        }
    }
}

fn tunnel_push(delivery_id: &str, channel: &ChannelRow, payload: SignalPayload) -> TunnelMessage {
    TunnelMessage::Signal {
        delivery_id: delivery_id.to_owned(),
        channel_id: channel.channel_id.clone(),
        channel_slug: channel.slug.clone(),
        signal: payload,
    }
}

/// The frozen payload stored with a dead-letter entry: the envelope the
/// endpoint would have received.
fn frozen_payload(channel: &ChannelRow, signal: &SignalRow) -> serde_json::Value {
    serde_json::to_value(WebhookEnvelope::new(
        WebhookChannel {
            id: channel.channel_id.clone(),
            slug: channel.slug.clone(),
            display_name: channel.display_name.clone(),
        },
        signal.payload(),
    ))
    .expect("envelope serializes")
}

/// Error history for a dead-letter entry: one entry per failed attempt.
fn error_history_json(history: &[FailedAttempt]) -> serde_json::Value {
    serde_json::Value::Array(
        history
            .iter()
            .map(|h| {
                serde_json::json!({
                    "timestamp": h.completed_at.map(|t| t.to_rfc3339()),
                    "code": h.http_status.map_or_else(|| "error".to_owned(), |s| s.to_string()),
                    "message": h.error,
                })
            })
            .collect(),
    )
}

async fn attempt_delivery(
    state: &AppState,
    http: &reqwest::Client,
    transport: &Transport,
    delivery_id: &str,
    channel: &ChannelRow,
    signal: &SignalRow,
    subscriber: &SubscriberRow,
) -> AttemptOutcome {
    match transport {
        Transport::TunnelLocal(agent) => {
            // Success as soon as the push is queued toward the socket; a
            // full channel means a slow consumer, retried later.
            match agent.tx.try_send(tunnel_push(delivery_id, channel, signal.payload())) {
                Ok(()) => AttemptOutcome::success(None),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    AttemptOutcome::failure("tunnel_saturated", None)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    AttemptOutcome::failure("agent_disconnected", None)
                }
            }
        }
        Transport::TunnelRemote(server) => {
            let push = ForwardedPush {
                subscriber_id: subscriber.subscriber_id.clone(),
                message: tunnel_push(delivery_id, channel, signal.payload()),
            };
            match state.redis.manager().await {
                Ok(mut redis) => match routing::forward(&mut redis, server, &push).await {
                    Ok(receivers) if receivers > 0 => AttemptOutcome::success(None),
                    Ok(_) => AttemptOutcome::failure("tunnel_unavailable", None),
                    Err(e) => AttemptOutcome::failure(format!("tunnel forward failed: {e}"), None),
                },
                Err(e) => AttemptOutcome::failure(format!("tunnel forward failed: {e}"), None),
            }
        }
        Transport::Webhook(webhook) => {
            deliver_webhook(state, http, webhook, delivery_id, channel, signal, subscriber).await
        }
        Transport::Unavailable => AttemptOutcome::failure("no_transport", None),
    }
}

async fn deliver_webhook(
    state: &AppState,
    http: &reqwest::Client,
    webhook: &WebhookRow,
    delivery_id: &str,
    channel: &ChannelRow,
    signal: &SignalRow,
    subscriber: &SubscriberRow,
) -> AttemptOutcome {
    let envelope = WebhookEnvelope::new(
        WebhookChannel {
            id: channel.channel_id.clone(),
            slug: channel.slug.clone(),
            display_name: channel.display_name.clone(),
        },
        signal.payload(),
    );
    let body = serde_json::to_vec(&envelope).expect("envelope serializes");

    // Per-subscriber secret, with the process-wide secret as fallback.
    let secret = if subscriber.webhook_secret.is_empty() {
        state.config.hmac_secret.as_str()
    } else {
        subscriber.webhook_secret.as_str()
    };
    let timestamp = Utc::now().timestamp();
    let signature = sign_payload(secret, timestamp, &body);

    let mut request = http
        .post(&webhook.url)
        .header("Content-Type", "application/json")
        .header("X-Herald-Signature", signature)
        .header("X-Herald-Timestamp", timestamp.to_string())
        .header("X-Herald-Delivery-Id", delivery_id)
        .body(body);
    if let Some(token) = &webhook.token {
        request = request.bearer_auth(token);
    }

    let outcome = match request.send().await {
        Ok(response) => {
            let status = response.status();
            if status.is_success() {
                AttemptOutcome::success(Some(i32::from(status.as_u16())))
            } else {
                AttemptOutcome::failure(
                    format!("endpoint returned {status}"),
                    Some(i32::from(status.as_u16())),
                )
            }
        }
        Err(e) => {
            let reason = if e.is_timeout() {
                "timeout".to_owned()
            } else if e.is_connect() {
                format!("connect error: {e}")
            } else {
                e.to_string()
            };
            AttemptOutcome::failure(reason, None)
        }
    };

    let record = if outcome.success {
        webhooks::record_success(&state.pool, &webhook.webhook_id).await
    } else {
        webhooks::record_failure(&state.pool, &webhook.webhook_id).await
    };
    if let Err(e) = record {
        debug!(error = %e, "webhook counter update failed");
    }
    outcome
}

// ---------------------------------------------------------------------------
// Job processing
// ---------------------------------------------------------------------------

async fn process_job(
    state: &AppState,
    http: &reqwest::Client,
    tx: PgTx,
    job: JobRow,
) -> Result<(), sqlx::Error> {
    // Rows whose subscription went away or was paused/canceled after
    // enqueue are dropped without a delivery attempt.
    let Some(subscription) = subscriptions::get(&state.pool, &job.subscription_id).await? else {
        return jobs::complete(tx, job.job_id).await;
    };
    if subscription.status != "active" {
        debug!(
            subscription_id = %subscription.subscription_id,
            status = %subscription.status,
            "dropping job for inactive subscription"
        );
        return jobs::complete(tx, job.job_id).await;
    }
    let Some(signal) = signals::get(&state.pool, &job.signal_id).await? else {
        return jobs::complete(tx, job.job_id).await;
    };
    let Some(channel) = channels::get(&state.pool, &signal.channel_id).await? else {
        return jobs::complete(tx, job.job_id).await;
    };
    let Some(subscriber) = subscribers::get(&state.pool, &subscription.subscriber_id).await? else {
        return jobs::complete(tx, job.job_id).await;
    };

    let transport = resolve_transport(state, &job, &subscription, &subscriber).await;

    // The attempt row exists, in pending state, before any side effect.
    let delivery_id = deliveries::claim(
        &state.pool,
        &job.signal_id,
        &job.subscription_id,
        transport.webhook_id(),
        transport.mode(&subscriber),
        job.attempt,
    )
    .await?;

    let started = Instant::now();
    let outcome = match tokio::time::timeout(
        state.config.worker_job_budget,
        attempt_delivery(
            state,
            http,
            &transport,
            &delivery_id,
            &channel,
            &signal,
            &subscriber,
        ),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => AttemptOutcome::failure("timeout", None),
    };
    let latency_ms = started.elapsed().as_millis() as i64;

    if outcome.success {
        deliveries::mark_success(&state.pool, &delivery_id, outcome.http_status, latency_ms)
            .await?;
        jobs::complete(tx, job.job_id).await?;
        info!(
            delivery_id = %delivery_id,
            signal_id = %job.signal_id,
            attempt = job.attempt,
            latency_ms,
            "delivery succeeded"
        );
        return Ok(());
    }

    let error = outcome.error.as_deref().unwrap_or("delivery failed");
    deliveries::mark_failed(&state.pool, &delivery_id, outcome.http_status, error, latency_ms)
        .await?;
    warn!(
        delivery_id = %delivery_id,
        signal_id = %job.signal_id,
        attempt = job.attempt,
        error,
        "delivery attempt failed"
    );

    if job.attempt >= MAX_ATTEMPTS {
        dead_letter(state, &delivery_id, &channel, &signal, &job.subscription_id).await?;
        return jobs::complete(tx, job.job_id).await;
    }

    let next_attempt = job.attempt + 1;
    let delay = retry_delay_secs(next_attempt).unwrap_or(0);
    jobs::reschedule(tx, &job, next_attempt, delay).await
}

async fn dead_letter(
    state: &AppState,
    delivery_id: &str,
    channel: &ChannelRow,
    signal: &SignalRow,
    subscription_id: &str,
) -> Result<(), sqlx::Error> {
    let history =
        deliveries::failed_history(&state.pool, &signal.signal_id, subscription_id).await?;
    dead_letters::insert(
        &state.pool,
        delivery_id,
        &signal.signal_id,
        subscription_id,
        &frozen_payload(channel, signal),
        &error_history_json(&history),
    )
    .await?;
    warn!(
        signal_id = %signal.signal_id,
        subscription_id = %subscription_id,
        attempts = history.len(),
        "retries exhausted, dead-lettered"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Negative acks
// ---------------------------------------------------------------------------

/// An agent reported that a signal it had accepted could not be forwarded
/// locally.  Downgrade the recorded delivery and re-enter the ladder; a
/// delivery that was not recorded as success is left alone.
pub async fn handle_negative_ack(
    state: &AppState,
    delivery_id: &str,
    error: &str,
) -> Result<(), sqlx::Error> {
    let reason = format!("agent rejected: {error}");
    let Some(delivery) =
        deliveries::downgrade_to_failed(&state.pool, delivery_id, &reason).await?
    else {
        debug!(delivery_id = %delivery_id, "negative ack for non-success delivery ignored");
        return Ok(());
    };
    let Some(signal) = signals::get(&state.pool, &delivery.signal_id).await? else {
        return Ok(());
    };

    if delivery.attempt >= MAX_ATTEMPTS {
        if let Some(channel) = channels::get(&state.pool, &signal.channel_id).await? {
            dead_letter(
                state,
                delivery_id,
                &channel,
                &signal,
                &delivery.subscription_id,
            )
            .await?;
        }
        return Ok(());
    }

    let next_attempt = delivery.attempt + 1;
    let delay = retry_delay_secs(next_attempt).unwrap_or(0);
    jobs::enqueue_one(
        &state.pool,
        jobs::lane_for(signal.urgency()),
        &delivery.signal_id,
        &delivery.subscription_id,
        delivery.webhook_id.as_deref(),
        next_attempt,
        delay,
    )
    .await?;
    info!(
        delivery_id = %delivery_id,
        attempt = delivery.attempt,
        "delivery downgraded by negative ack, retry scheduled"
    );
    Ok(())
}
