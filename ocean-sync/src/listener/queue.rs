//! Queue listener.
//!
//! Messages carry the same envelope as webhooks. A message is acked only
//! after every event in it was applied; a transient failure nacks it with
//! requeue (until its redelivery budget is spent) and a malformed message is
//! nacked without requeue.

use crate::error::{SyncError, SyncResult};
use crate::event::LiveEvent;
use crate::integration::Integration;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Settles a message with its broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self);
    async fn nack(&self, requeue: bool);
}

/// One delivery.
pub struct QueueMessage {
    pub payload: Vec<u8>,
    /// How many times this message was delivered before.
    pub redeliveries: u32,
    acker: Box<dyn Acknowledger>,
}

impl QueueMessage {
    pub fn new(payload: Vec<u8>, redeliveries: u32, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            payload,
            redeliveries,
            acker,
        }
    }

    pub async fn ack(self) {
        self.acker.ack().await;
    }

    pub async fn nack(self, requeue: bool) {
        self.acker.nack(requeue).await;
    }
}

/// A stream of deliveries. Broker adapters implement this.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// The next message, or `None` once the source is exhausted.
    async fn next(&self) -> Option<QueueMessage>;
}

#[derive(Debug, Default)]
struct ChannelCounters {
    acked: AtomicUsize,
    requeued: AtomicUsize,
    dead_letters: std::sync::Mutex<Vec<Vec<u8>>>,
}

/// Counters of a [`ChannelSource`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub acked: usize,
    pub requeued: usize,
    /// Payloads nacked without requeue.
    pub dead_letters: Vec<Vec<u8>>,
}

struct Envelope {
    payload: Vec<u8>,
    redeliveries: u32,
}

/// In-process queue over a bounded channel. Requeued messages go to the back.
pub struct ChannelSource {
    receiver: Mutex<mpsc::Receiver<Envelope>>,
    sender: mpsc::Sender<Envelope>,
    counters: Arc<ChannelCounters>,
}

/// Producer side of a [`ChannelSource`].
#[derive(Clone)]
pub struct ChannelPublisher {
    sender: mpsc::Sender<Envelope>,
}

impl ChannelPublisher {
    /// Enqueues a payload, failing if the queue is full.
    pub fn try_publish(&self, payload: impl Into<Vec<u8>>) -> SyncResult<()> {
        self.sender
            .try_send(Envelope {
                payload: payload.into(),
                redeliveries: 0,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SyncError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SyncError::ChannelClosed,
            })
    }

    /// Enqueues a payload, waiting for room.
    pub async fn publish(&self, payload: impl Into<Vec<u8>>) -> SyncResult<()> {
        self.sender
            .send(Envelope {
                payload: payload.into(),
                redeliveries: 0,
            })
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (Self, ChannelPublisher) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let source = Self {
            receiver: Mutex::new(receiver),
            sender: sender.clone(),
            counters: Arc::new(ChannelCounters::default()),
        };
        (source, ChannelPublisher { sender })
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            acked: self.counters.acked.load(Ordering::SeqCst),
            requeued: self.counters.requeued.load(Ordering::SeqCst),
            dead_letters: self
                .counters
                .dead_letters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

struct ChannelAcker {
    payload: Vec<u8>,
    redeliveries: u32,
    requeue: mpsc::Sender<Envelope>,
    counters: Arc<ChannelCounters>,
}

#[async_trait]
impl Acknowledger for ChannelAcker {
    async fn ack(&self) {
        self.counters.acked.fetch_add(1, Ordering::SeqCst);
    }

    async fn nack(&self, requeue: bool) {
        if requeue {
            self.counters.requeued.fetch_add(1, Ordering::SeqCst);
            let envelope = Envelope {
                payload: self.payload.clone(),
                redeliveries: self.redeliveries + 1,
            };
            if self.requeue.send(envelope).await.is_ok() {
                return;
            }
        }
        self.counters
            .dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.payload.clone());
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    /// Never returns `None` on its own: the source holds a sender for
    /// requeues. Consumers stop on shutdown.
    async fn next(&self) -> Option<QueueMessage> {
        let envelope = self.receiver.lock().await.recv().await?;
        let acker = ChannelAcker {
            payload: envelope.payload.clone(),
            redeliveries: envelope.redeliveries,
            requeue: self.sender.clone(),
            counters: Arc::clone(&self.counters),
        };
        Some(QueueMessage::new(envelope.payload, envelope.redeliveries, Box::new(acker)))
    }
}

/// Consumes `source` with `workers` tasks until it is exhausted or the
/// integration shuts down.
pub async fn run(
    integration: Arc<Integration>,
    source: Arc<dyn MessageSource>,
    workers: usize,
    max_redeliveries: u32,
) -> SyncResult<()> {
    let shutdown = integration.shutdown_token();
    info!(workers, max_redeliveries, "queue listener started");

    let handles: Vec<_> = (0..workers.max(1))
        .map(|worker| {
            let integration = Arc::clone(&integration);
            let source = Arc::clone(&source);
            let shutdown = shutdown.clone();
            tokio::spawn(consume(worker, integration, source, shutdown, max_redeliveries))
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        result.map_err(|e| SyncError::Task(e.to_string()))?;
    }
    Ok(())
}

async fn consume(
    worker: usize,
    integration: Arc<Integration>,
    source: Arc<dyn MessageSource>,
    shutdown: CancellationToken,
    max_redeliveries: u32,
) {
    loop {
        let message = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            message = source.next() => message,
        };
        let Some(message) = message else {
            break;
        };
        process(worker, &integration, message, max_redeliveries).await;
    }
    debug!(worker, "queue worker stopped");
}

/// Applies one message and settles it.
pub async fn process(worker: usize, integration: &Integration, message: QueueMessage, max_redeliveries: u32) {
    let events = match LiveEvent::parse_payload(&message.payload) {
        Ok(events) => events,
        Err(e) => {
            warn!(worker, error = %e, "dropping malformed message");
            message.nack(false).await;
            return;
        }
    };

    for event in events {
        if let Err(e) = integration.handle_event(event).await {
            let requeue = e.is_transient() && message.redeliveries < max_redeliveries;
            warn!(
                worker,
                error = %e,
                redeliveries = message.redeliveries,
                requeue,
                "message processing failed"
            );
            message.nack(requeue).await;
            return;
        }
    }
    message.ack().await;
}
