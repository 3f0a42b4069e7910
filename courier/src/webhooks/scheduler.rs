//! Periodic retry sweep.
//!
//! Each tick:
//! 1. reclaims `Retrying` deliveries whose attempt outlived
//!    `stale_attempt_factor × timeout_seconds` (counted as a failed attempt),
//! 2. fetches up to `batch_size` due `Pending` deliveries, earliest `next_retry_at`
//!    first,
//! 3. fills what is left of `batch_size` with never-attempted deliveries older than
//!    `orphan_grace` whose queued intent was lost,
//!
//! and attempts everything from steps 2 and 3 concurrently.
//!
//! The tick waits for its attempts before returning. Deliveries beyond the batch cap
//! stay due and are picked up by a later tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use tokio::task::JoinSet;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;

use crate::db::errors::Result;
use crate::db::models::deliveries::Delivery;
use crate::db::models::subscriptions::{Subscription, TIMEOUT_SECONDS_RANGE};
use crate::db::{DeliveryStore, SubscriptionLookup};
use crate::types::{SubscriptionId, abbrev_uuid};
use crate::webhooks::engine::DeliveryEngine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub batch_size: usize,
    /// `None` disables stale-attempt reclamation.
    pub stale_attempt_factor: Option<u32>,
    /// `None` disables recovery of never-attempted deliveries.
    pub orphan_grace: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 100,
            stale_attempt_factor: Some(2),
            orphan_grace: Some(Duration::from_secs(5 * 60)),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Due deliveries fetched this tick
    pub claimed: usize,
    /// Never-attempted deliveries picked up this tick
    pub recovered: usize,
    /// Attempts that ran and were recorded
    pub attempted: usize,
    /// Attempts skipped because the delivery changed underneath us
    pub skipped: usize,
    /// Deliveries failed without an attempt (subscription gone or inactive)
    pub abandoned: usize,
    /// Stale in-flight attempts turned into failed attempts
    pub reclaimed: usize,
    /// Store errors while finishing an attempt
    pub errors: usize,
}

pub struct RetryScheduler {
    subscriptions: Arc<dyn SubscriptionLookup>,
    deliveries: Arc<dyn DeliveryStore>,
    engine: DeliveryEngine,
    config: SchedulerConfig,
}

/// Subscription lookups are cached for the duration of a tick.
type SubscriptionCache = HashMap<SubscriptionId, Option<Subscription>>;

impl RetryScheduler {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionLookup>,
        deliveries: Arc<dyn DeliveryStore>,
        engine: DeliveryEngine,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            subscriptions,
            deliveries,
            engine,
            config,
        }
    }

    /// Tick every `config.interval` until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        self.run_with_ticks(IntervalStream::new(interval).map(|_| ()), shutdown).await;
    }

    /// Tick once per item of `ticks` until the stream ends or `shutdown` is cancelled.
    pub async fn run_with_ticks<S>(self, ticks: S, shutdown: CancellationToken)
    where
        S: Stream<Item = ()> + Send,
    {
        tracing::info!(
            interval = ?self.config.interval,
            batch_size = self.config.batch_size,
            "Starting webhook retry scheduler"
        );
        let mut ticks = std::pin::pin!(ticks);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Webhook retry scheduler shutting down");
                    break;
                }
                tick = ticks.next() => {
                    if tick.is_none() {
                        tracing::debug!("Tick source ended, stopping retry scheduler");
                        break;
                    }
                    match self.tick().await {
                        Ok(report) if report != TickReport::default() => {
                            tracing::debug!(?report, "Webhook retry tick complete");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "Webhook retry tick failed"),
                    }
                }
            }
        }
    }

    /// Run one sweep. Only store errors while listing work are returned; per-delivery
    /// errors are logged and counted in the report.
    ///
    /// Due and recovered deliveries share one `batch_size` budget, due ones first.
    /// Every subscription is resolved before the first attempt starts, so a lookup
    /// failure never leaves a claimed delivery without an outcome.
    pub async fn tick(&self) -> Result<TickReport> {
        let now = self.engine.clock().now();
        let mut report = TickReport::default();
        let mut cache = SubscriptionCache::new();

        if let Some(factor) = self.config.stale_attempt_factor {
            self.reclaim_stale(now, factor, &mut cache, &mut report).await?;
        }

        let mut work = self.deliveries.due_deliveries(now, self.config.batch_size).await?;
        report.claimed = work.len();

        let remaining = self.config.batch_size.saturating_sub(work.len());
        if let Some(grace) = self.config.orphan_grace.filter(|_| remaining > 0) {
            let orphans = self.deliveries.unattempted_deliveries(before(now, grace), remaining).await?;
            report.recovered = orphans.len();
            work.extend(orphans);
        }

        if work.is_empty() {
            return Ok(report);
        }
        tracing::debug!(due = report.claimed, recovered = report.recovered, "Retrying webhook deliveries");

        let mut ready = Vec::with_capacity(work.len());
        for delivery in work {
            match self.usable_subscription(&delivery, &mut cache, &mut report).await {
                Ok(Some(subscription)) => ready.push((delivery, subscription)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        delivery_id = %abbrev_uuid(&delivery.id),
                        subscription_id = %abbrev_uuid(&delivery.subscription_id),
                        error = %e,
                        "Failed to look up subscription, leaving delivery for a later tick"
                    );
                    report.errors += 1;
                }
            }
        }

        let mut attempts = JoinSet::new();
        for (delivery, subscription) in ready {
            let engine = self.engine.clone();
            attempts.spawn(async move { engine.attempt(&delivery, &subscription).await });
        }

        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(Ok(Some(_))) => report.attempted += 1,
                Ok(Ok(None)) => report.skipped += 1,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Failed to record webhook attempt");
                    report.errors += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Webhook attempt task panicked");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    async fn reclaim_stale(
        &self,
        now: DateTime<Utc>,
        factor: u32,
        cache: &mut SubscriptionCache,
        report: &mut TickReport,
    ) -> Result<()> {
        // Candidates use the shortest allowed timeout; each is checked against its own below
        let min_timeout = Duration::from_secs(u64::from(*TIMEOUT_SECONDS_RANGE.start()));
        let cutoff = before(now, min_timeout.saturating_mul(factor));
        let candidates = self.deliveries.stale_attempts(cutoff, self.config.batch_size).await?;

        for delivery in candidates {
            let subscription = match self.usable_subscription(&delivery, cache, report).await {
                Ok(Some(subscription)) => subscription,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(
                        delivery_id = %abbrev_uuid(&delivery.id),
                        error = %e,
                        "Failed to look up subscription for stale attempt"
                    );
                    report.errors += 1;
                    continue;
                }
            };
            let stale_before = before(now, subscription.timeout().saturating_mul(factor));
            if delivery.last_attempt_at.is_some_and(|started| started > stale_before) {
                continue;
            }
            match self.engine.reclaim(&delivery, &subscription).await {
                Ok(Some(_)) => report.reclaimed += 1,
                Ok(None) => report.skipped += 1,
                Err(_) => report.errors += 1,
            }
        }
        Ok(())
    }

    /// Resolve the delivery's subscription. If it was deleted or deactivated the
    /// delivery is abandoned and `None` is returned.
    async fn usable_subscription(
        &self,
        delivery: &Delivery,
        cache: &mut SubscriptionCache,
        report: &mut TickReport,
    ) -> Result<Option<Subscription>> {
        let subscription = match cache.get(&delivery.subscription_id) {
            Some(cached) => cached.clone(),
            None => {
                let fetched = self.subscriptions.get_subscription(delivery.subscription_id).await?;
                cache.insert(delivery.subscription_id, fetched.clone());
                fetched
            }
        };

        let reason = match &subscription {
            None => format!("subscription {} no longer exists", delivery.subscription_id),
            Some(s) if !s.is_active() => format!("subscription {} is {}", s.id, s.status),
            Some(_) => return Ok(subscription),
        };

        tracing::debug!(
            delivery_id = %abbrev_uuid(&delivery.id),
            subscription_id = %abbrev_uuid(&delivery.subscription_id),
            "Subscription unavailable, abandoning delivery"
        );
        match self.engine.abandon(delivery, &reason).await {
            Ok(Some(_)) => report.abandoned += 1,
            Ok(None) => report.skipped += 1,
            Err(_) => report.errors += 1,
        }
        Ok(None)
    }
}

/// `now - duration`, saturating at the earliest representable time.
fn before(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
