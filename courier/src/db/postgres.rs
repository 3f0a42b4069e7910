//! PostgreSQL implementation of the store traits.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use tracing::instrument;
use uuid::Uuid;

use super::errors::{DbError, Result};
use super::models::deliveries::{Delivery, DeliveryCreateDBRequest, DeliveryStatus, DeliveryStatusCounts};
use super::models::subscriptions::{Subscription, SubscriptionStatus};
use super::{DeliveryStore, SubscriptionLookup};
use crate::types::{DeliveryId, SubscriptionId, abbrev_uuid};

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    url: String,
    secret: Option<String>,
    headers: Json<BTreeMap<String, String>>,
    events: Vec<String>,
    max_retries: i32,
    timeout_seconds: i32,
    status: String,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = DbError;

    fn try_from(row: SubscriptionRow) -> Result<Self> {
        Ok(Subscription {
            id: SubscriptionId(row.id),
            url: row.url,
            secret: row.secret,
            headers: row.headers.0,
            events: row.events.into_iter().collect::<BTreeSet<_>>(),
            max_retries: u32::try_from(row.max_retries).map_err(|e| anyhow!("invalid max_retries: {e}"))?,
            timeout_seconds: u32::try_from(row.timeout_seconds).map_err(|e| anyhow!("invalid timeout_seconds: {e}"))?,
            status: row.status.parse::<SubscriptionStatus>().map_err(|e| anyhow!(e))?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeliveryRow {
    id: Uuid,
    subscription_id: Uuid,
    event: String,
    payload: String,
    status: String,
    attempts: i32,
    response_status: Option<i32>,
    response_body: Option<String>,
    response_headers: Option<Json<BTreeMap<String, String>>>,
    error_message: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    last_attempt_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeliveryRow> for Delivery {
    type Error = DbError;

    fn try_from(row: DeliveryRow) -> Result<Self> {
        Ok(Delivery {
            id: DeliveryId(row.id),
            subscription_id: SubscriptionId(row.subscription_id),
            event: row.event,
            payload: row.payload,
            status: row.status.parse::<DeliveryStatus>().map_err(|e| anyhow!(e))?,
            attempts: u32::try_from(row.attempts).map_err(|e| anyhow!("invalid attempts: {e}"))?,
            response_status: row
                .response_status
                .map(u16::try_from)
                .transpose()
                .map_err(|e| anyhow!("invalid response_status: {e}"))?,
            response_body: row.response_body,
            response_headers: row.response_headers.map(|h| h.0),
            error_message: row.error_message,
            next_retry_at: row.next_retry_at,
            last_attempt_at: row.last_attempt_at,
            delivered_at: row.delivered_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn to_deliveries(rows: Vec<DeliveryRow>) -> Result<Vec<Delivery>> {
    rows.into_iter().map(Delivery::try_from).collect()
}

fn attempts_param(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Store backed by the `webhook_subscriptions` and `webhook_deliveries` tables.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run pending migrations.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(url).await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionLookup for PostgresStore {
    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&id)), err)]
    async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>("SELECT * FROM webhook_subscriptions WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Subscription::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn active_subscriptions_for_event(&self, event: &str) -> Result<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT * FROM webhook_subscriptions
            WHERE status = 'active' AND $1 = ANY(events)
            ORDER BY id
            "#,
        )
        .bind(event)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Subscription::try_from).collect()
    }
}

#[async_trait]
impl DeliveryStore for PostgresStore {
    #[instrument(skip(self, request), fields(subscription_id = %abbrev_uuid(&request.subscription_id)), err)]
    async fn create_delivery(&self, request: &DeliveryCreateDBRequest) -> Result<Delivery> {
        let row = sqlx::query_as::<_, DeliveryRow>(
            r#"
            INSERT INTO webhook_deliveries (id, subscription_id, event, payload, status, attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'pending', 0, $5, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.subscription_id.0)
        .bind(&request.event)
        .bind(&request.payload)
        .bind(request.created_at)
        .fetch_one(&self.pool)
        .await?;

        Delivery::try_from(row)
    }

    #[instrument(skip(self), fields(delivery_id = %abbrev_uuid(&id)), err)]
    async fn get_delivery(&self, id: DeliveryId) -> Result<Option<Delivery>> {
        let row = sqlx::query_as::<_, DeliveryRow>("SELECT * FROM webhook_deliveries WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Delivery::try_from).transpose()
    }

    #[instrument(skip(self, delivery), fields(delivery_id = %abbrev_uuid(&delivery.id), to = %delivery.status), err)]
    async fn transition(&self, from: DeliveryStatus, from_attempts: u32, delivery: &Delivery) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET
                status = $4,
                attempts = $5,
                response_status = $6,
                response_body = $7,
                response_headers = $8,
                error_message = $9,
                next_retry_at = $10,
                last_attempt_at = $11,
                delivered_at = $12,
                updated_at = $13
            WHERE id = $1 AND status = $2 AND attempts = $3
            "#,
        )
        .bind(delivery.id.0)
        .bind(from.as_str())
        .bind(attempts_param(from_attempts))
        .bind(delivery.status.as_str())
        .bind(attempts_param(delivery.attempts))
        .bind(delivery.response_status.map(i32::from))
        .bind(delivery.response_body.as_deref())
        .bind(delivery.response_headers.as_ref().map(Json))
        .bind(delivery.error_message.as_deref())
        .bind(delivery.next_retry_at)
        .bind(delivery.last_attempt_at)
        .bind(delivery.delivered_at)
        .bind(delivery.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn due_deliveries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Delivery>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            r#"
            SELECT * FROM webhook_deliveries
            WHERE status = 'pending' AND next_retry_at <= $1
            ORDER BY next_retry_at, created_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;

        to_deliveries(rows)
    }

    #[instrument(skip(self), err)]
    async fn stale_attempts(&self, started_before: DateTime<Utc>, limit: usize) -> Result<Vec<Delivery>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            r#"
            SELECT * FROM webhook_deliveries
            WHERE status = 'retrying' AND last_attempt_at <= $1
            ORDER BY last_attempt_at
            LIMIT $2
            "#,
        )
        .bind(started_before)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;

        to_deliveries(rows)
    }

    #[instrument(skip(self), err)]
    async fn unattempted_deliveries(&self, created_before: DateTime<Utc>, limit: usize) -> Result<Vec<Delivery>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            r#"
            SELECT * FROM webhook_deliveries
            WHERE status = 'pending' AND attempts = 0 AND next_retry_at IS NULL AND created_at <= $1
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(created_before)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;

        to_deliveries(rows)
    }

    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&subscription_id)), err)]
    async fn deliveries_for_subscription(&self, subscription_id: SubscriptionId) -> Result<Vec<Delivery>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            r#"
            SELECT * FROM webhook_deliveries
            WHERE subscription_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(subscription_id.0)
        .fetch_all(&self.pool)
        .await?;

        to_deliveries(rows)
    }

    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&subscription_id)), err)]
    async fn status_counts(&self, subscription_id: SubscriptionId) -> Result<DeliveryStatusCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT status, COUNT(*) FROM webhook_deliveries
            WHERE subscription_id = $1
            GROUP BY status
            "#,
        )
        .bind(subscription_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = DeliveryStatusCounts::default();
        for (status, count) in rows {
            let status = status.parse::<DeliveryStatus>().map_err(|e| anyhow!(e))?;
            counts.add(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }
}
