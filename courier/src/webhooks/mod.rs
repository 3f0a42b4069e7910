//! Outbound webhook delivery.
//!
//! - [`signing`]: HMAC-SHA256 payload signatures
//! - [`events`]: Event envelope and payload serialization
//! - [`backoff`]: Delay between attempts
//! - [`http`]: Transport seam, reqwest and mock implementations
//! - [`engine`]: One attempt of one delivery, and the retry decision
//! - [`dispatcher`]: Event fan-out and the first-attempt worker pool
//! - [`scheduler`]: Periodic sweep of due retries
//! - [`service`]: The facade business code calls

pub mod backoff;
pub mod clock;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod http;
pub mod scheduler;
pub mod service;
pub mod signing;
pub mod stats;

pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::DeliveryEngine;
pub use events::{EmitOptions, EventEnvelope};
pub use http::{HttpClient, MockHttpClient, ReqwestHttpClient};
pub use service::{BackgroundServices, WebhookService};
pub use signing::sign;
pub use stats::DeliveryStats;
