//! Ocean agent: loads an agent configuration, wires one integration against
//! a REST upstream and the catalog, and runs its event listener.
//!
//! ```yaml
//! integration: acme-github
//! mapping: mapping.yaml
//! upstream:
//!   base_url: https://api.example.com
//! catalog:
//!   base_url: https://catalog.example.com
//! event_listener:
//!   type: POLLING
//!   interval_secs: 600
//! ```
//!
//! Secrets never live in the file; they come from [`CATALOG_TOKEN_ENV`],
//! [`UPSTREAM_TOKEN_ENV`] and [`WEBHOOK_SECRET_ENV`].

use anyhow::{bail, Context, Result};
use ocean_mapping::PortAppConfig;
use ocean_sync::http::{HttpCatalogClient, HttpCatalogConfig, HttpUpstreamClient, HttpUpstreamConfig};
use ocean_sync::listener::{ChannelPublisher, ChannelSource};
use ocean_sync::{EventListener, EventListenerConfig, Integration, ResyncReport, SyncConfig};
use ocean_types::{IntegrationId, RunStatus};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const CATALOG_TOKEN_ENV: &str = "OCEAN_CATALOG_TOKEN";
pub const UPSTREAM_TOKEN_ENV: &str = "OCEAN_UPSTREAM_TOKEN";
pub const WEBHOOK_SECRET_ENV: &str = "OCEAN_WEBHOOK_SECRET";

fn default_mapping() -> PathBuf {
    PathBuf::from("mapping.yaml")
}

/// Agent configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub integration: IntegrationId,
    /// Mapping document. Relative paths resolve against the config file.
    #[serde(default = "default_mapping")]
    pub mapping: PathBuf,
    pub upstream: HttpUpstreamConfig,
    pub catalog: HttpCatalogConfig,
    #[serde(flatten)]
    pub sync: SyncConfig,
}

impl AgentConfig {
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(source).context("invalid agent configuration")?;
        config.sync.validate().context("invalid sync settings")?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config =
            Self::from_yaml_str(&source).with_context(|| format!("failed to load {}", path.display()))?;
        if config.mapping.is_relative() {
            if let Some(dir) = path.parent() {
                config.mapping = dir.join(&config.mapping);
            }
        }
        Ok(config)
    }

    /// Fills in secrets from the environment. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());
        if let Some(token) = get(CATALOG_TOKEN_ENV) {
            self.catalog.token = Some(token);
        }
        if let Some(token) = get(UPSTREAM_TOKEN_ENV) {
            self.upstream.token = Some(token);
        }
        if let Some(value) = get(WEBHOOK_SECRET_ENV) {
            match &mut self.sync.event_listener {
                EventListenerConfig::Webhook { secret, .. } => *secret = Some(value),
                other => debug!(listener = other.mode(), "webhook secret set but unused"),
            }
        }
    }

    pub fn load_mapping(&self) -> Result<PortAppConfig> {
        PortAppConfig::from_path(&self.mapping)
            .with_context(|| format!("failed to load mapping {}", self.mapping.display()))
    }

    pub fn build_integration(&self, mapping: PortAppConfig) -> Result<Integration> {
        let upstream =
            HttpUpstreamClient::new(self.upstream.clone()).context("failed to build upstream client")?;
        let catalog =
            HttpCatalogClient::new(self.catalog.clone()).context("failed to build catalog client")?;
        Integration::new(
            self.integration.clone(),
            mapping,
            Arc::new(upstream),
            Arc::new(catalog),
            self.sync.clone(),
        )
        .context("failed to initialize integration")
    }
}

/// Publishes every non-blank line of `reader` as one queue message. Returns
/// the number of lines published once the reader is exhausted or the queue
/// closes.
pub fn spawn_line_feeder<R>(reader: R, publisher: ChannelPublisher) -> JoinHandle<usize>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = reader.lines();
        let mut published = 0;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if publisher.publish(line.as_bytes().to_vec()).await.is_err() {
                        break;
                    }
                    published += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to read event line");
                    break;
                }
            }
        }
        debug!(published, "event input exhausted");
        published
    })
}

/// Runs the configured listener. In `QUEUE` mode messages are read line by
/// line from `input`.
pub async fn run_with_input<R>(integration: Arc<Integration>, input: R) -> Result<Option<ResyncReport>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let mut listener = EventListener::new(Arc::clone(&integration));
    if let EventListenerConfig::Queue { capacity, .. } = integration.config().event_listener {
        let (source, publisher) = ChannelSource::new(capacity);
        spawn_line_feeder(input, publisher);
        listener = listener.with_source(Arc::new(source));
    }
    info!(
        integration = %integration.id(),
        listener = integration.config().event_listener.mode(),
        "event listener starting"
    );
    listener.run().await.context("event listener failed")
}

/// Runs the configured listener, reading queue messages from stdin.
pub async fn run(integration: Arc<Integration>) -> Result<Option<ResyncReport>> {
    run_with_input(integration, tokio::io::BufReader::new(tokio::io::stdin())).await
}

/// Turns a failed run into an error for the exit status.
pub fn check_report(report: &ResyncReport) -> Result<()> {
    match report.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Failed => bail!(
            "resync {} failed: {}",
            report.run_id,
            report.error.as_deref().unwrap_or("unknown error")
        ),
        other => bail!("resync {} ended {other}", report.run_id),
    }
}
