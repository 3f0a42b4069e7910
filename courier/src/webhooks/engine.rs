//! One attempt of one delivery.
//!
//! ```text
//! attempt(delivery, subscription)
//!   ├─ store.transition(Pending → Retrying, attempts + 1)   // persisted before the call;
//!   │                                                       // lost race ⇒ skipped
//!   ├─ build_request()      // headers + HMAC signature over the stored payload
//!   ├─ http.post()          // timeout = subscription.timeout_seconds, no redirects
//!   └─ store.transition(Retrying → outcome)
//!        ├─ 2xx                                  → Success
//!        ├─ failure, attempts < max_retries + 1  → Pending, next_retry_at = now + backoff
//!        └─ failure, attempts exhausted          → Failed
//! ```
//!
//! Every store write is a compare-and-set on `(status, attempts)`, so two processes
//! racing on the same delivery cannot both claim the same attempt.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::instrument;

use crate::db::DeliveryStore;
use crate::db::errors::Result;
use crate::db::models::deliveries::{Delivery, DeliveryStatus};
use crate::db::models::subscriptions::Subscription;
use crate::types::abbrev_uuid;
use crate::webhooks::backoff::BackoffPolicy;
use crate::webhooks::clock::Clock;
use crate::webhooks::http::{HttpClient, HttpResponse, OutboundRequest, TransportError};
use crate::webhooks::signing;

pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const DELIVERY_HEADER: &str = "X-Webhook-Delivery";
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Subscription headers under this prefix are dropped (compared case-insensitively).
pub const RESERVED_HEADER_PREFIX: &str = "x-webhook-";

/// Headers the engine always sets itself. Subscription headers cannot override them.
const ENGINE_HEADERS: [&str; 2] = ["content-type", "user-agent"];

/// Outcome of a single attempt, before it is folded into the delivery record.
enum AttemptResult {
    Response(HttpResponse),
    Transport(TransportError),
}

#[derive(Clone)]
pub struct DeliveryEngine {
    deliveries: Arc<dyn DeliveryStore>,
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    user_agent: String,
}

impl DeliveryEngine {
    pub fn new(
        deliveries: Arc<dyn DeliveryStore>,
        http: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
        backoff: BackoffPolicy,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            deliveries,
            http,
            clock,
            backoff,
            user_agent: user_agent.into(),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Perform one attempt of `delivery` against `subscription`.
    ///
    /// Returns the delivery as persisted after the attempt, or `None` if the attempt was
    /// skipped because another worker changed the record first. HTTP failures are not
    /// errors here: they are folded into the returned record. Only store failures are `Err`.
    #[instrument(
        skip(self, delivery, subscription),
        fields(delivery_id = %abbrev_uuid(&delivery.id), subscription_id = %abbrev_uuid(&subscription.id), attempt = delivery.attempts + 1),
        err
    )]
    pub async fn attempt(&self, delivery: &Delivery, subscription: &Subscription) -> Result<Option<Delivery>> {
        if delivery.status != DeliveryStatus::Pending {
            tracing::debug!(status = %delivery.status, "Delivery is not pending, skipping attempt");
            return Ok(None);
        }

        // max_retries may have been lowered since this delivery last ran
        if delivery.attempts >= subscription.max_attempts() {
            let reason = format!(
                "retry limit reached: {} attempts made, subscription allows {}",
                delivery.attempts,
                subscription.max_attempts()
            );
            return self.abandon(delivery, &reason).await;
        }

        let now = self.clock.now();
        let mut claimed = delivery.clone();
        claimed.status = DeliveryStatus::Retrying;
        claimed.attempts = delivery.attempts + 1;
        claimed.last_attempt_at = Some(now);
        claimed.next_retry_at = None;
        claimed.updated_at = now;

        if !self
            .deliveries
            .transition(DeliveryStatus::Pending, delivery.attempts, &claimed)
            .await?
        {
            tracing::debug!("Delivery was claimed elsewhere, skipping attempt");
            return Ok(None);
        }
        counter!("courier_webhook_deliveries_claimed_total").increment(1);

        let request = self.build_request(&claimed, subscription);
        tracing::debug!(url = %request.url, "Sending webhook");

        let result = match self.http.post(request).await {
            Ok(response) => AttemptResult::Response(response),
            Err(error) => AttemptResult::Transport(error),
        };

        self.complete(claimed, subscription, result).await
    }

    /// Treat an in-flight attempt with no recorded outcome as a failed attempt.
    ///
    /// Used for `Retrying` deliveries left behind by a crashed or stalled worker. The
    /// abandoned attempt counts against the retry budget.
    #[instrument(skip(self, delivery, subscription), fields(delivery_id = %abbrev_uuid(&delivery.id)), err)]
    pub async fn reclaim(&self, delivery: &Delivery, subscription: &Subscription) -> Result<Option<Delivery>> {
        if delivery.status != DeliveryStatus::Retrying {
            return Ok(None);
        }
        let started = delivery
            .last_attempt_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "an unknown time".to_string());
        let error = TransportError::Other(format!("attempt abandoned: no outcome recorded for attempt started at {started}"));
        tracing::warn!(attempt = delivery.attempts, "Reclaiming stale delivery attempt");
        self.complete(delivery.clone(), subscription, AttemptResult::Transport(error))
            .await
    }

    /// Move a non-terminal delivery straight to `Failed` without an attempt.
    ///
    /// For deliveries whose subscription was deleted or deactivated, or whose retry
    /// budget shrank below the attempts already made.
    #[instrument(skip(self, delivery), fields(delivery_id = %abbrev_uuid(&delivery.id)), err)]
    pub async fn abandon(&self, delivery: &Delivery, reason: &str) -> Result<Option<Delivery>> {
        if delivery.status.is_terminal() {
            return Ok(None);
        }
        let now = self.clock.now();
        let mut failed = delivery.clone();
        failed.status = DeliveryStatus::Failed;
        failed.next_retry_at = None;
        failed.error_message = Some(reason.to_string());
        failed.updated_at = now;

        if !self
            .deliveries
            .transition(delivery.status, delivery.attempts, &failed)
            .await?
        {
            tracing::debug!("Delivery changed before it could be abandoned");
            return Ok(None);
        }

        counter!("courier_webhook_deliveries_total", "outcome" => "abandoned").increment(1);
        tracing::warn!(reason = %reason, "Webhook delivery abandoned");
        Ok(Some(failed))
    }

    /// Build the signed request for the current attempt of `delivery`.
    pub fn build_request(&self, delivery: &Delivery, subscription: &Subscription) -> OutboundRequest {
        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("User-Agent".to_string(), self.user_agent.clone()),
            (EVENT_HEADER.to_string(), delivery.event.clone()),
            (DELIVERY_HEADER.to_string(), delivery.id.to_string()),
        ];

        for (name, value) in &subscription.headers {
            let lower = name.to_ascii_lowercase();
            if lower.starts_with(RESERVED_HEADER_PREFIX) || ENGINE_HEADERS.contains(&lower.as_str()) {
                tracing::debug!(header = %name, "Ignoring reserved subscription header");
                continue;
            }
            headers.push((name.clone(), value.clone()));
        }

        if let Some(secret) = &subscription.secret {
            headers.push((
                SIGNATURE_HEADER.to_string(),
                signing::sign(secret, delivery.payload.as_bytes()),
            ));
        }

        OutboundRequest {
            url: subscription.url.clone(),
            headers,
            body: delivery.payload.clone(),
            timeout: subscription.timeout(),
        }
    }

    /// Fold an attempt result into the claimed record and persist it.
    async fn complete(
        &self,
        claimed: Delivery,
        subscription: &Subscription,
        result: AttemptResult,
    ) -> Result<Option<Delivery>> {
        let now = self.clock.now();
        let mut finished = claimed.clone();
        finished.updated_at = now;

        let outcome = match result {
            AttemptResult::Response(response) if response.is_success() => {
                finished.status = DeliveryStatus::Success;
                finished.response_status = Some(response.status);
                finished.response_headers = Some(response.headers);
                finished.response_body = Some(response.body);
                finished.error_message = None;
                finished.next_retry_at = None;
                finished.delivered_at = Some(now);
                tracing::info!(status_code = response_status(&finished), "Webhook delivered");
                "success"
            }
            AttemptResult::Response(response) => {
                let error = http_error_message(response.status);
                finished.response_status = Some(response.status);
                finished.response_headers = Some(response.headers);
                finished.response_body = Some(response.body);
                self.record_failure(&mut finished, subscription, error, now)
            }
            AttemptResult::Transport(error) => {
                finished.response_status = None;
                finished.response_headers = None;
                finished.response_body = None;
                self.record_failure(&mut finished, subscription, error.to_string(), now)
            }
        };

        if !self
            .deliveries
            .transition(DeliveryStatus::Retrying, claimed.attempts, &finished)
            .await?
        {
            tracing::warn!(outcome, "Delivery changed while its attempt was in flight, discarding outcome");
            return Ok(None);
        }

        counter!("courier_webhook_deliveries_total", "outcome" => outcome).increment(1);
        Ok(Some(finished))
    }

    fn record_failure(
        &self,
        delivery: &mut Delivery,
        subscription: &Subscription,
        error: String,
        now: DateTime<Utc>,
    ) -> &'static str {
        let max_attempts = subscription.max_attempts();
        delivery.error_message = Some(error);

        if delivery.attempts < max_attempts {
            let delay = self.backoff.delay(delivery.attempts);
            let next_retry_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            delivery.status = DeliveryStatus::Pending;
            delivery.next_retry_at = Some(next_retry_at);
            tracing::warn!(
                attempt = delivery.attempts,
                max_attempts,
                status_code = ?delivery.response_status,
                error = ?delivery.error_message,
                next_retry_at = ?delivery.next_retry_at,
                "Webhook delivery failed, will retry"
            );
            "retry"
        } else {
            delivery.status = DeliveryStatus::Failed;
            delivery.next_retry_at = None;
            tracing::warn!(
                attempt = delivery.attempts,
                max_attempts,
                status_code = ?delivery.response_status,
                error = ?delivery.error_message,
                "Webhook delivery failed, retries exhausted"
            );
            "failed"
        }
    }
}

fn response_status(delivery: &Delivery) -> u16 {
    delivery.response_status.unwrap_or_default()
}

/// `"HTTP 503 Service Unavailable"`, or `"HTTP 599"` for codes without a standard reason.
pub fn http_error_message(status: u16) -> String {
    match reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
    {
        Some(reason) => format!("HTTP {status} {reason}"),
        None => format!("HTTP {status}"),
    }
}
