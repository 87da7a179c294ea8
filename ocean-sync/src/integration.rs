//! The integration runtime.
//!
//! Owns the compiled mapper and the shared pieces (registry, reconciler,
//! fetcher) and is what every event listener drives: full resyncs go through
//! the coordinator, live events go straight to the reconciler under the same
//! per-key locks.

use crate::catalog::{CatalogClient, UpsertContext};
use crate::config::SyncConfig;
use crate::coordinator::ResyncCoordinator;
use crate::error::{CatalogError, SyncError, SyncResult};
use crate::event::{EventOutcome, LiveEvent};
use crate::fetcher::ResourceFetcher;
use crate::reconciler::{Reconciler, ReconcilerOptions, UpsertOutcome};
use crate::registry::RunRegistry;
use crate::state::ResyncReport;
use crate::upstream::UpstreamClient;
use ocean_mapping::{EntityMapper, PortAppConfig};
use ocean_types::{EntityKey, IntegrationId, RunId};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A resync running in the background.
pub struct ResyncHandle {
    run_id: RunId,
    handle: JoinHandle<ResyncReport>,
}

impl ResyncHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Waits for the run to finish.
    pub async fn wait(self) -> SyncResult<ResyncReport> {
        self.handle
            .await
            .map_err(|e| SyncError::Task(e.to_string()))
    }
}

/// A running integration: the compiled mapping plus the engine pieces every
/// event listener drives.
///
/// Dropping it cancels the active resync and any in-flight upstream call.
pub struct Integration {
    id: IntegrationId,
    config: SyncConfig,
    mapping: Arc<PortAppConfig>,
    mapper: Arc<EntityMapper>,
    fetcher: ResourceFetcher,
    reconciler: Arc<Reconciler>,
    registry: Arc<RunRegistry>,
    coordinator: Arc<ResyncCoordinator>,
    shutdown: CancellationToken,
}

impl Integration {
    /// Compiles the mapping document and wires the engine together.
    pub fn new(
        id: IntegrationId,
        mapping: PortAppConfig,
        upstream: Arc<dyn UpstreamClient>,
        catalog: Arc<dyn CatalogClient>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        Self::with_registry(id, mapping, upstream, catalog, config, Arc::new(RunRegistry::new()))
    }

    /// Like [`Integration::new`], sharing a registry with other integrations
    /// of the same process.
    pub fn with_registry(
        id: IntegrationId,
        mapping: PortAppConfig,
        upstream: Arc<dyn UpstreamClient>,
        catalog: Arc<dyn CatalogClient>,
        config: SyncConfig,
        registry: Arc<RunRegistry>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let mapper = Arc::new(EntityMapper::compile(&mapping)?);
        let mapping = Arc::new(mapping);

        let fetcher = ResourceFetcher::new(upstream, &config.resync, config.retry.clone());
        let reconciler = Arc::new(Reconciler::new(
            catalog,
            ReconcilerOptions::new(&config.resync, &mapping),
        ));
        let coordinator = Arc::new(ResyncCoordinator::new(
            id.clone(),
            Arc::clone(&mapping),
            Arc::clone(&mapper),
            fetcher.clone(),
            Arc::clone(&reconciler),
            Arc::clone(&registry),
            config.resync.clone(),
        ));

        info!(
            integration = %id,
            kinds = mapper.kinds().len(),
            listener = config.event_listener.mode(),
            "integration initialized"
        );

        Ok(Self {
            id,
            config,
            mapping,
            mapper,
            fetcher,
            reconciler,
            registry,
            coordinator,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &IntegrationId {
        &self.id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn mapper(&self) -> &EntityMapper {
        &self.mapper
    }

    /// Cancelled when the integration shuts down. Listeners stop on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops listeners and cancels the active resync.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(run_id) = self.registry.cancel_if_active(&self.id) {
            info!(integration = %self.id, run_id = %run_id, "cancelled active resync on shutdown");
        }
    }

    /// Starts a resync in the background, superseding any active one.
    pub fn trigger_resync(&self) -> ResyncHandle {
        let prepared = self.coordinator.prepare();
        let run_id = prepared.run_id();
        let coordinator = Arc::clone(&self.coordinator);
        let handle = tokio::spawn(async move { coordinator.execute(prepared).await });
        ResyncHandle { run_id, handle }
    }

    /// Runs a resync to completion on the current task.
    pub async fn resync(&self) -> ResyncReport {
        self.coordinator.run().await
    }

    /// Applies one live event.
    ///
    /// Returns an error only when processing failed in a way worth retrying
    /// (upstream or catalog unavailable). Mapping failures and rejected
    /// writes are counted in the outcome instead.
    pub async fn handle_event(&self, event: LiveEvent) -> SyncResult<EventOutcome> {
        debug!(integration = %self.id, event = ?event, "handling live event");
        match event {
            LiveEvent::Changed { kind, id } => self.refetch(&kind, &id).await,
            LiveEvent::Upserted { kind, object } => self.upsert_one(&kind, &object).await,
            LiveEvent::Deleted { kind, object } => self.delete_mapped(&kind, &object).await,
            LiveEvent::Remove { key } => self.delete_one(&key).await,
            LiveEvent::Resync => {
                let handle = self.trigger_resync();
                Ok(EventOutcome {
                    resync: Some(handle.run_id()),
                    ..Default::default()
                })
            }
        }
    }

    /// Maps a raw object and upserts the resulting entities.
    pub async fn upsert_one(&self, kind: &str, raw: &Value) -> SyncResult<EventOutcome> {
        let ctx = UpsertContext::new(self.id.clone(), kind)
            .with_create_missing_related(self.mapping.create_missing_related_entities);
        let mut outcome = EventOutcome::default();
        let mut transient: Option<CatalogError> = None;

        for mapped in self.mapper.map(kind, raw) {
            let entity = match mapped {
                Ok(entity) => entity,
                Err(e) => {
                    warn!(error = %e, "mapping failed for live event");
                    outcome.failures += 1;
                    continue;
                }
            };
            match self.reconciler.upsert_one(&ctx, &entity).await {
                UpsertOutcome::Created | UpsertOutcome::Updated => outcome.upserted += 1,
                UpsertOutcome::Failed(e) if e.is_transient() => {
                    transient.get_or_insert(e);
                }
                UpsertOutcome::Failed(_) => outcome.failures += 1,
            }
        }

        match transient {
            Some(e) => Err(e.into()),
            None => Ok(outcome),
        }
    }

    /// Deletes one entity (and its dependents when enabled).
    pub async fn delete_one(&self, key: &EntityKey) -> SyncResult<EventOutcome> {
        let report = self.reconciler.delete_one(key).await;
        Ok(EventOutcome {
            deleted: report.deleted + report.dependents_deleted,
            failures: report.failed,
            ..Default::default()
        })
    }

    async fn refetch(&self, kind: &str, id: &str) -> SyncResult<EventOutcome> {
        if self.mapper.rules_for(kind).is_none() {
            debug!(kind, "event for an unmapped kind, ignoring");
            return Ok(EventOutcome::default());
        }
        match self.fetcher.get_object(kind, id, &self.shutdown).await? {
            Some(object) => self.upsert_one(kind, &object).await,
            None => {
                debug!(kind, id, "object is gone upstream, deleting its entities");
                self.delete_gone(kind, &json!({ "id": id })).await
            }
        }
    }

    /// Deletes the entities of an object only known by reference. The
    /// selector is not consulted: the last synced state is not available.
    async fn delete_gone(&self, kind: &str, reference: &Value) -> SyncResult<EventOutcome> {
        let mut outcome = EventOutcome::default();
        for resolved in self.mapper.resolve_keys(kind, reference) {
            match resolved {
                Ok(key) => {
                    let report = self.delete_one(&key).await?;
                    outcome.deleted += report.deleted;
                    outcome.failures += report.failures;
                }
                Err(e) => {
                    warn!(error = %e, "could not resolve the entity of a gone object");
                    outcome.failures += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn delete_mapped(&self, kind: &str, raw: &Value) -> SyncResult<EventOutcome> {
        let mut outcome = EventOutcome::default();
        for mapped in self.mapper.map(kind, raw) {
            match mapped {
                Ok(entity) => {
                    let report = self.delete_one(&entity.key()).await?;
                    outcome.deleted += report.deleted;
                    outcome.failures += report.failures;
                }
                Err(e) => {
                    warn!(error = %e, "could not map deleted object");
                    outcome.failures += 1;
                }
            }
        }
        Ok(outcome)
    }
}

impl Drop for Integration {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
