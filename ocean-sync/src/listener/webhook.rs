//! Webhook listener.
//!
//! `POST {path}` accepts vendor events, `GET /health` answers `200`. The
//! handler only authenticates, parses and enqueues; a fixed pool of workers
//! drains the queue into the integration, so a slow catalog never blocks the
//! vendor's delivery.

use crate::config::EventListenerConfig;
use crate::error::{SyncError, SyncResult};
use crate::event::LiveEvent;
use crate::integration::Integration;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex HMAC of the raw body>`.
pub const SIGNATURE_HEADER: &str = "x-ocean-signature";

/// Turns a vendor payload into live events.
pub trait WebhookProcessor: Send + Sync {
    fn parse(&self, headers: &HeaderMap, body: &[u8]) -> SyncResult<Vec<LiveEvent>>;
}

/// Understands the generic event envelope (see [`crate::event`]).
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericWebhookProcessor;

impl WebhookProcessor for GenericWebhookProcessor {
    fn parse(&self, _headers: &HeaderMap, body: &[u8]) -> SyncResult<Vec<LiveEvent>> {
        LiveEvent::parse_payload(body)
    }
}

/// Signature header value for `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> SyncResult<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|e| SyncError::Config(format!("unusable webhook secret: {e}")))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Constant-time check of a signature header against `body`.
pub fn verify_signature(secret: &[u8], body: &[u8], header: Option<&str>) -> bool {
    let Some(hex_sig) = header.and_then(|h| h.trim().strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookSettings {
    pub bind: SocketAddr,
    pub path: String,
    pub secret: Option<String>,
    pub workers: usize,
    pub queue_capacity: usize,
    pub resync_on_start: bool,
}

impl WebhookSettings {
    /// Extracts the webhook block of a listener configuration.
    pub fn from_config(config: &EventListenerConfig) -> Option<Self> {
        match config {
            EventListenerConfig::Webhook {
                bind,
                path,
                secret,
                workers,
                queue_capacity,
                resync_on_start,
            } => Some(Self {
                bind: *bind,
                path: path.clone(),
                secret: secret.clone(),
                workers: *workers,
                queue_capacity: *queue_capacity,
                resync_on_start: *resync_on_start,
            }),
            _ => None,
        }
    }
}

#[derive(Clone)]
struct WebhookState {
    secret: Option<Arc<[u8]>>,
    processor: Arc<dyn WebhookProcessor>,
    queue: mpsc::Sender<LiveEvent>,
}

/// Builds the webhook router. Accepted events are sent to `queue`.
pub fn build_router(
    path: &str,
    secret: Option<&str>,
    processor: Arc<dyn WebhookProcessor>,
    queue: mpsc::Sender<LiveEvent>,
) -> Router {
    let state = WebhookState {
        secret: secret.map(|s| Arc::from(s.as_bytes())),
        processor,
        queue,
    };
    Router::new()
        .route(path, post(webhook_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn webhook_handler(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if let Some(secret) = &state.secret {
        let header = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
        if !verify_signature(secret, &body, header) {
            warn!("rejected webhook with a bad signature");
            return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid signature" })));
        }
    }

    let events = match state.processor.parse(&headers, &body) {
        Ok(events) => events,
        Err(e) => {
            debug!(error = %e, "malformed webhook payload");
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })));
        }
    };

    let mut accepted = 0usize;
    for event in events {
        match state.queue.try_send(event) {
            Ok(()) => accepted += 1,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(accepted, "webhook queue is full");
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "error": SyncError::QueueFull.to_string(), "accepted": accepted })),
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "error": SyncError::ChannelClosed.to_string(), "accepted": accepted })),
                );
            }
        }
    }
    (StatusCode::ACCEPTED, Json(json!({ "accepted": accepted })))
}

/// Drains `queue` into the integration with `workers` tasks.
pub fn spawn_workers(
    integration: Arc<Integration>,
    queue: mpsc::Receiver<LiveEvent>,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    let queue = Arc::new(Mutex::new(queue));
    (0..workers.max(1))
        .map(|worker| {
            let integration = Arc::clone(&integration);
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                loop {
                    // The lock is held only while waiting for the next event.
                    let Some(event) = queue.lock().await.recv().await else {
                        break;
                    };
                    match integration.handle_event(event).await {
                        Ok(outcome) => debug!(worker, outcome = ?outcome, "webhook event applied"),
                        Err(e) => warn!(worker, error = %e, "webhook event failed"),
                    }
                }
            })
        })
        .collect()
}

pub struct WebhookListener {
    integration: Arc<Integration>,
    settings: WebhookSettings,
    processor: Arc<dyn WebhookProcessor>,
}

impl WebhookListener {
    pub fn new(integration: Arc<Integration>, settings: WebhookSettings) -> Self {
        Self {
            integration,
            settings,
            processor: Arc::new(GenericWebhookProcessor),
        }
    }

    #[must_use]
    pub fn with_processor(mut self, processor: Arc<dyn WebhookProcessor>) -> Self {
        self.processor = processor;
        self
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(self) -> SyncResult<()> {
        let listener = TcpListener::bind(self.settings.bind).await?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener until the integration shuts down.
    pub async fn serve(self, listener: TcpListener) -> SyncResult<()> {
        let (tx, rx) = mpsc::channel(self.settings.queue_capacity.max(1));
        let workers = spawn_workers(Arc::clone(&self.integration), rx, self.settings.workers);
        let router = build_router(
            &self.settings.path,
            self.settings.secret.as_deref(),
            Arc::clone(&self.processor),
            tx,
        );

        if self.settings.resync_on_start {
            self.integration.trigger_resync();
        }

        let shutdown = self.integration.shutdown_token();
        info!(
            addr = %listener.local_addr()?,
            path = %self.settings.path,
            workers = workers.len(),
            "webhook listener started"
        );
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        // The router (and with it the sender) is gone; workers finish the
        // backlog and exit.
        futures::future::join_all(workers).await;
        Ok(())
    }
}
