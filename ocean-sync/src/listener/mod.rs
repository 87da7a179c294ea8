//! Event listeners: what makes an integration do work.
//!
//! | Mode      | Trigger                                          |
//! |-----------|--------------------------------------------------|
//! | `POLLING` | a resync every interval                          |
//! | `WEBHOOK` | HTTP deliveries, applied as live events          |
//! | `QUEUE`   | broker messages, acked after they are applied    |
//! | `ONCE`    | a single resync, then the listener returns       |

pub mod once;
pub mod polling;
pub mod queue;
pub mod webhook;

pub use queue::{
    Acknowledger, ChannelPublisher, ChannelSource, ChannelStats, MessageSource, QueueMessage,
};
pub use webhook::{
    build_router, sign, verify_signature, GenericWebhookProcessor, WebhookListener,
    WebhookProcessor, WebhookSettings, SIGNATURE_HEADER,
};

use crate::config::EventListenerConfig;
use crate::error::{SyncError, SyncResult};
use crate::integration::Integration;
use crate::state::ResyncReport;
use std::sync::Arc;
use std::time::Duration;

/// Runs the listener configured for an integration.
pub struct EventListener {
    integration: Arc<Integration>,
    processor: Arc<dyn WebhookProcessor>,
    source: Option<Arc<dyn MessageSource>>,
}

impl EventListener {
    pub fn new(integration: Arc<Integration>) -> Self {
        Self {
            integration,
            processor: Arc::new(GenericWebhookProcessor),
            source: None,
        }
    }

    /// Vendor-specific webhook parsing.
    #[must_use]
    pub fn with_processor(mut self, processor: Arc<dyn WebhookProcessor>) -> Self {
        self.processor = processor;
        self
    }

    /// Message source for `QUEUE` mode.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn MessageSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Runs until shutdown. `ONCE` returns the report of its run.
    pub async fn run(self) -> SyncResult<Option<ResyncReport>> {
        let config = self.integration.config().event_listener.clone();
        match config {
            EventListenerConfig::Polling {
                interval_secs,
                resync_on_start,
            } => {
                polling::run(self.integration, Duration::from_secs(interval_secs), resync_on_start).await?;
                Ok(None)
            }
            EventListenerConfig::Webhook { .. } => {
                let settings = WebhookSettings::from_config(&config).ok_or_else(|| {
                    SyncError::Config("webhook listener without webhook settings".into())
                })?;
                WebhookListener::new(self.integration, settings)
                    .with_processor(self.processor)
                    .run()
                    .await?;
                Ok(None)
            }
            EventListenerConfig::Queue {
                workers,
                max_redeliveries,
                resync_on_start,
                ..
            } => {
                let source = self.source.ok_or_else(|| {
                    SyncError::Config("queue listener needs a message source".into())
                })?;
                if resync_on_start {
                    self.integration.trigger_resync();
                }
                queue::run(self.integration, source, workers, max_redeliveries).await?;
                Ok(None)
            }
            EventListenerConfig::Once => Ok(Some(once::run(&self.integration).await?)),
        }
    }
}
