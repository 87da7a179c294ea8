//! Runtime configuration of the sync engine.
//!
//! These structures are deserialized from the agent configuration file; every
//! field has a default so a minimal file only names the endpoints.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// How far dependent-entity deletion reaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependentDeletion {
    /// Only entities whose relations point directly at the deleted entity.
    #[default]
    Direct,
    /// Follow dependents of dependents until no new entity is reached.
    Transitive,
}

/// Knobs of a resync pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResyncSettings {
    /// Entities per reconciler batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Objects requested per upstream page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Kinds fetched and reconciled at the same time.
    #[serde(default = "default_kind_concurrency")]
    pub kind_concurrency: usize,
    /// In-flight catalog upserts per batch.
    #[serde(default = "default_upsert_concurrency")]
    pub upsert_concurrency: usize,
    /// Whether a completed resync deletes entities it did not observe.
    #[serde(default = "default_true")]
    pub delete_stale: bool,
    #[serde(default)]
    pub dependent_deletion: DependentDeletion,
    /// Timeout of every upstream call (ms).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_batch_size() -> usize {
    100
}

fn default_page_size() -> usize {
    100
}

fn default_kind_concurrency() -> usize {
    2
}

fn default_upsert_concurrency() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for ResyncSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            page_size: default_page_size(),
            kind_concurrency: default_kind_concurrency(),
            upsert_concurrency: default_upsert_concurrency(),
            delete_stale: true,
            dependent_deletion: DependentDeletion::Direct,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ResyncSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Exponential backoff for retryable upstream errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per page, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Adds up to 25% random jitter to every delay.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed). A server-provided
    /// `Retry-After` replaces the computed backoff, still capped by
    /// `max_backoff_ms`.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let cap = Duration::from_millis(self.max_backoff_ms);
        if let Some(requested) = retry_after {
            return requested.min(cap);
        }

        let base = self.initial_backoff_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff_ms as f64);
        let with_jitter = if self.jitter {
            capped * (1.0 + rand::thread_rng().gen_range(0.0..0.25))
        } else {
            capped
        };
        Duration::from_millis(with_jitter as u64)
    }
}

/// How resync triggers and live events reach the integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventListenerConfig {
    /// Resync on a fixed interval.
    Polling {
        #[serde(default = "default_interval_secs")]
        interval_secs: u64,
        #[serde(default = "default_true")]
        resync_on_start: bool,
    },
    /// Accept vendor webhooks over HTTP.
    Webhook {
        #[serde(default = "default_bind")]
        bind: SocketAddr,
        #[serde(default = "default_webhook_path")]
        path: String,
        /// Shared secret for `X-Ocean-Signature`. Usually supplied through
        /// the environment rather than the file.
        #[serde(default, skip_serializing)]
        secret: Option<String>,
        #[serde(default = "default_workers")]
        workers: usize,
        #[serde(default = "default_queue_capacity")]
        queue_capacity: usize,
        #[serde(default = "default_true")]
        resync_on_start: bool,
    },
    /// Consume event messages from a queue.
    Queue {
        #[serde(default = "default_workers")]
        workers: usize,
        #[serde(default = "default_queue_capacity")]
        capacity: usize,
        /// Redeliveries of a transiently failing message before it is dropped.
        #[serde(default = "default_max_redeliveries")]
        max_redeliveries: u32,
        #[serde(default = "default_true")]
        resync_on_start: bool,
    },
    /// Resync once, then stop.
    Once,
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_webhook_path() -> String {
    "/integration/webhook".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_redeliveries() -> u32 {
    5
}

impl Default for EventListenerConfig {
    fn default() -> Self {
        Self::Polling {
            interval_secs: default_interval_secs(),
            resync_on_start: true,
        }
    }
}

impl EventListenerConfig {
    /// Short name for logs.
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Polling { .. } => "POLLING",
            Self::Webhook { .. } => "WEBHOOK",
            Self::Queue { .. } => "QUEUE",
            Self::Once => "ONCE",
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub resync: ResyncSettings,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub event_listener: EventListenerConfig,
}

impl SyncConfig {
    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> crate::SyncResult<()> {
        let r = &self.resync;
        for (name, value) in [
            ("batch_size", r.batch_size),
            ("page_size", r.page_size),
            ("kind_concurrency", r.kind_concurrency),
            ("upsert_concurrency", r.upsert_concurrency),
        ] {
            if value == 0 {
                return Err(crate::SyncError::Config(format!("{name} must be at least 1")));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(crate::SyncError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        match &self.event_listener {
            EventListenerConfig::Polling { interval_secs: 0, .. } => Err(crate::SyncError::Config(
                "polling interval must be at least 1 second".into(),
            )),
            EventListenerConfig::Webhook { workers: 0, .. }
            | EventListenerConfig::Queue { workers: 0, .. } => {
                Err(crate::SyncError::Config("workers must be at least 1".into()))
            }
            EventListenerConfig::Webhook { queue_capacity: 0, .. }
            | EventListenerConfig::Queue { capacity: 0, .. } => Err(crate::SyncError::Config(
                "queue capacity must be at least 1".into(),
            )),
            _ => Ok(()),
        }
    }
}
