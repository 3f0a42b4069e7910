//! Configuration loading.
//!
//! Values come from a YAML file (default `config.yaml`, or `-f`/`COURIER_CONFIG`),
//! overridden by `COURIER_`-prefixed environment variables. Nested keys use `__`:
//!
//! ```bash
//! COURIER_PORT=8080
//! COURIER_WEBHOOKS__RETRY_INTERVAL=30s
//! COURIER_WEBHOOKS__MAX_CONCURRENT_SENDS=50
//! ```
//!
//! `DATABASE_URL` is also honoured for the PostgreSQL store.

use std::collections::BTreeMap;
use std::time::Duration;

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::db::models::subscriptions::{Subscription, SubscriptionStatus};
use crate::errors::Error;
use crate::types::SubscriptionId;
use crate::webhooks::backoff::BackoffPolicy;
use crate::webhooks::scheduler::SchedulerConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "COURIER_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Root configuration. All fields have defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Reported in the outbound `User-Agent` as `<service_name>/<version>`
    pub service_name: String,
    /// Emit logs as JSON lines instead of human-readable text
    pub log_json: bool,
    /// Serve Prometheus metrics on `/metrics`
    pub metrics_enabled: bool,
    /// PostgreSQL connection string. Requires the `postgres` feature; without it the
    /// in-memory store is used.
    pub database_url: Option<String>,
    pub webhooks: WebhookConfig,
    /// Subscriptions loaded into the in-memory store at startup
    pub subscriptions: Vec<SubscriptionConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            service_name: "courier".to_string(),
            log_json: false,
            metrics_enabled: true,
            database_url: None,
            webhooks: WebhookConfig::default(),
            subscriptions: Vec::new(),
        }
    }
}

/// Webhook delivery settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebhookConfig {
    /// Enable webhook delivery (default: true). When disabled, events are accepted and dropped.
    pub enabled: bool,
    /// Outbound `User-Agent`. Defaults to `<service_name>/<version>`.
    pub user_agent: Option<String>,
    /// Capacity of the queue between `emit_event` and the delivery workers (default: 1024)
    pub queue_capacity: usize,
    /// Maximum concurrent first-attempt requests (default: 20)
    pub max_concurrent_sends: usize,
    /// How often the retry scheduler sweeps for due deliveries (default: 60s)
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Maximum due deliveries attempted per sweep (default: 100)
    pub retry_batch_size: usize,
    /// Backoff delay after the zeroth attempt; later delays multiply by `backoff_factor` (default: 60s)
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    pub backoff_factor: u32,
    /// Cap on the delay between attempts (default: 1h)
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// An in-flight attempt older than this many times its subscription's timeout is
    /// treated as failed. `null` disables reclamation. (default: 2)
    pub stale_attempt_factor: Option<u32>,
    /// Never-attempted deliveries older than this are picked up by the scheduler.
    /// `null` disables recovery. (default: 5m)
    #[serde(with = "humantime_serde")]
    pub orphan_grace: Option<Duration>,
    /// Response bodies are truncated to this many bytes before being stored (default: 64 KiB)
    pub max_response_body_bytes: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        let scheduler = SchedulerConfig::default();
        Self {
            enabled: true,
            user_agent: None,
            queue_capacity: 1024,
            max_concurrent_sends: 20,
            retry_interval: scheduler.interval,
            retry_batch_size: scheduler.batch_size,
            backoff_base: backoff.base,
            backoff_factor: backoff.factor,
            max_backoff: backoff.max,
            stale_attempt_factor: scheduler.stale_attempt_factor,
            orphan_grace: scheduler.orphan_grace,
            max_response_body_bytes: 64 * 1024,
        }
    }
}

impl WebhookConfig {
    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("courier/{}", env!("CARGO_PKG_VERSION")))
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.backoff_base,
            factor: self.backoff_factor,
            max: self.max_backoff,
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: self.retry_interval,
            batch_size: self.retry_batch_size,
            stale_attempt_factor: self.stale_attempt_factor,
            orphan_grace: self.orphan_grace,
        }
    }
}

/// A subscription declared in configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionConfig {
    /// Stable ID. A random one is assigned at startup if omitted.
    #[serde(default)]
    pub id: Option<Uuid>,
    pub url: Url,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub events: Vec<String>,
    #[serde(default = "SubscriptionConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "SubscriptionConfig::default_timeout_seconds")]
    pub timeout_seconds: u32,
    #[serde(default)]
    pub status: SubscriptionStatus,
}

impl SubscriptionConfig {
    fn default_max_retries() -> u32 {
        3
    }

    fn default_timeout_seconds() -> u32 {
        30
    }

    pub fn to_subscription(&self) -> Subscription {
        Subscription {
            id: self.id.map(SubscriptionId::from).unwrap_or_default(),
            url: self.url.to_string(),
            secret: self.secret.clone(),
            headers: self.headers.clone(),
            events: self.events.iter().cloned().collect(),
            max_retries: self.max_retries,
            timeout_seconds: self.timeout_seconds,
            status: self.status,
        }
    }
}

impl Config {
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;

        if config.webhooks.user_agent.is_none() {
            config.webhooks.user_agent = Some(format!("{}/{}", config.service_name, env!("CARGO_PKG_VERSION")));
        }

        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can override specific values
            .merge(Env::prefixed("COURIER_").split("__"))
            // Common DATABASE_URL pattern
            .merge(Env::raw().only(&["DATABASE_URL"]))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let webhooks = &self.webhooks;
        let invalid = |message: String| Error::Other(anyhow::anyhow!("Config validation: {message}"));

        if webhooks.queue_capacity == 0 {
            return Err(invalid("webhooks.queue_capacity must be at least 1".to_string()));
        }
        if webhooks.max_concurrent_sends == 0 {
            return Err(invalid("webhooks.max_concurrent_sends must be at least 1".to_string()));
        }
        if webhooks.retry_batch_size == 0 {
            return Err(invalid("webhooks.retry_batch_size must be at least 1".to_string()));
        }
        if webhooks.retry_interval.is_zero() {
            return Err(invalid("webhooks.retry_interval must be greater than zero".to_string()));
        }
        if webhooks.backoff_factor == 0 {
            return Err(invalid("webhooks.backoff_factor must be at least 1".to_string()));
        }
        if webhooks.max_backoff < webhooks.backoff_base {
            return Err(invalid(format!(
                "webhooks.max_backoff ({:?}) is shorter than webhooks.backoff_base ({:?})",
                webhooks.max_backoff, webhooks.backoff_base
            )));
        }
        if webhooks.stale_attempt_factor == Some(0) {
            return Err(invalid("webhooks.stale_attempt_factor must be at least 1 (or null to disable)".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for (index, subscription) in self.subscriptions.iter().enumerate() {
            subscription
                .to_subscription()
                .validate()
                .map_err(|e| invalid(format!("subscriptions[{index}]: {e}")))?;
            if subscription.events.is_empty() {
                return Err(invalid(format!("subscriptions[{index}]: events must not be empty")));
            }
            if let Some(id) = subscription.id {
                if !seen.insert(id) {
                    return Err(invalid(format!("subscriptions[{index}]: duplicate id {id}")));
                }
            }
        }

        if cfg!(not(feature = "postgres")) && self.database_url.is_some() {
            tracing::warn!("database_url is set but courier was built without the postgres feature; using the in-memory store");
        }

        Ok(())
    }
}
