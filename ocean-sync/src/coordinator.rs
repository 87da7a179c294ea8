//! Resync Coordinator: drives one full resync of an integration.
//!
//! A run registers itself (superseding any active run), fetches every kind
//! with bounded concurrency, maps and upserts in batches, and finally deletes
//! catalog entities it did not observe. Only kinds that fetched completely
//! take part in the deletion phase, so a kind whose upstream failed never
//! loses its entities.

use crate::catalog::{CatalogEntityRef, UpsertContext};
use crate::config::ResyncSettings;
use crate::error::FetchError;
use crate::fetcher::ResourceFetcher;
use crate::reconciler::Reconciler;
use crate::registry::RunRegistry;
use crate::state::{KindStatistics, ResyncReport, ResyncRun};
use futures::stream::{self, StreamExt};
use ocean_mapping::{EntityMapper, OnFetchError, PortAppConfig};
use ocean_types::{Entity, EntityKey, IntegrationId, RunStatus};
use serde_json::Map;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one kind within a run.
struct KindResult {
    kind: String,
    stats: KindStatistics,
    observed: HashSet<EntityKey>,
    /// Set when the kind failed and its policy is to abort the run.
    critical: Option<String>,
}

/// A run that has been registered but not executed yet.
pub struct PreparedRun {
    run: ResyncRun,
    token: CancellationToken,
}

impl PreparedRun {
    pub fn run_id(&self) -> ocean_types::RunId {
        self.run.run_id
    }
}

/// Drives full resyncs of one integration.
///
/// A run fetches the configured kinds a few at a time, maps and upserts the
/// objects, then deletes the integration's entities that no kind observed.
/// Starting a run supersedes and cancels the one in flight.
pub struct ResyncCoordinator {
    /// Owner of the entities this coordinator writes and deletes.
    integration: IntegrationId,
    mapping: Arc<PortAppConfig>,
    mapper: Arc<EntityMapper>,
    fetcher: ResourceFetcher,
    reconciler: Arc<Reconciler>,
    registry: Arc<RunRegistry>,
    settings: ResyncSettings,
}

impl ResyncCoordinator {
    pub fn new(
        integration: IntegrationId,
        mapping: Arc<PortAppConfig>,
        mapper: Arc<EntityMapper>,
        fetcher: ResourceFetcher,
        reconciler: Arc<Reconciler>,
        registry: Arc<RunRegistry>,
        settings: ResyncSettings,
    ) -> Self {
        Self {
            integration,
            mapping,
            mapper,
            fetcher,
            reconciler,
            registry,
            settings,
        }
    }

    pub fn integration(&self) -> &IntegrationId {
        &self.integration
    }

    /// Registers a new run, cancelling the active one. Registration happens
    /// here, synchronously, so the most recent trigger always wins.
    pub fn prepare(&self) -> PreparedRun {
        let run = ResyncRun::new(self.integration.clone(), self.mapper.kinds().to_vec());
        let (token, superseded) = self.registry.register(&self.integration, run.run_id);
        if let Some(previous) = superseded {
            debug!(run_id = %run.run_id, previous = %previous, "registered over an active run");
        }
        PreparedRun { run, token }
    }

    /// Registers and executes a run.
    pub async fn run(&self) -> ResyncReport {
        let prepared = self.prepare();
        self.execute(prepared).await
    }

    pub async fn execute(&self, prepared: PreparedRun) -> ResyncReport {
        let PreparedRun { mut run, token } = prepared;
        let run_id = run.run_id;

        if token.is_cancelled() {
            run.transition(RunStatus::Cancelled);
            info!(run_id = %run_id, integration = %self.integration, "resync cancelled before start");
            return self.finish(run);
        }

        run.transition(RunStatus::Running);
        info!(
            run_id = %run_id,
            integration = %self.integration,
            kinds = run.kinds.len(),
            "resync started"
        );

        // Child token: a critical kind failing stops the sibling kinds
        // without touching the registry entry.
        let abort = token.child_token();
        let results: Vec<KindResult> = stream::iter(run.kinds.clone())
            .map(|kind| {
                let abort = abort.clone();
                async move { self.sync_kind(kind, &abort).await }
            })
            .buffer_unordered(self.settings.kind_concurrency.max(1))
            .collect()
            .await;

        let mut critical = None;
        for result in results {
            if critical.is_none() {
                critical = result.critical.map(|e| format!("kind '{}': {e}", result.kind));
            }
            run.record_kind(&result.kind, result.stats, result.observed);
        }

        if token.is_cancelled() {
            run.transition(RunStatus::Cancelled);
            info!(run_id = %run_id, integration = %self.integration, "resync cancelled");
            return self.finish(run);
        }

        if let Some(error) = critical {
            error!(run_id = %run_id, integration = %self.integration, error = %error, "resync failed");
            run.fail(error);
            return self.finish(run);
        }

        if self.settings.delete_stale {
            self.delete_phase(&mut run, &token).await;
            if token.is_cancelled() {
                run.transition(RunStatus::Cancelled);
                info!(run_id = %run_id, integration = %self.integration, "resync cancelled during deletion");
                return self.finish(run);
            }
        }

        run.transition(RunStatus::Completed);
        let stats = run.statistics();
        info!(
            run_id = %run_id,
            integration = %self.integration,
            objects = stats.objects(),
            upserted = stats.upserted(),
            mapping_failures = stats.mapping_failures(),
            upsert_failures = stats.upsert_failures(),
            deleted = stats.deleted,
            "resync completed"
        );
        self.finish(run)
    }

    fn finish(&self, run: ResyncRun) -> ResyncReport {
        self.registry.complete(&self.integration, run.run_id);
        run.into_report()
    }

    async fn delete_phase(&self, run: &mut ResyncRun, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }

        let entities = match self.reconciler.catalog().list_entities(&self.integration).await {
            Ok(entities) => entities,
            Err(e) => {
                warn!(run_id = %run.run_id, error = %e, "could not list catalog entities, skipping deletion");
                run.record_deletion(&crate::reconciler::DeleteReport {
                    failed: 1,
                    ..Default::default()
                });
                return;
            }
        };

        let scope = self.deletion_scope(run, entities);
        debug!(run_id = %run.run_id, scope = scope.len(), observed = run.observed().len(), "deletion scope");
        let report = self
            .reconciler
            .delete_stale(&scope, run.observed(), token)
            .await;
        run.record_deletion(&report);
    }

    /// Catalog entities whose origin kind fetched completely. Entities the
    /// catalog cannot attribute to a kind count only when every kind
    /// completed.
    fn deletion_scope(&self, run: &ResyncRun, entities: Vec<CatalogEntityRef>) -> Vec<EntityKey> {
        let completed: HashSet<&str> = run.completed_kinds().collect();
        let all_completed = completed.len() == run.kinds.len();
        entities
            .into_iter()
            .filter(|e| match &e.kind {
                Some(kind) => completed.contains(kind.as_str()),
                None => all_completed,
            })
            .map(|e| e.key)
            .collect()
    }

    async fn sync_kind(&self, kind: String, cancel: &CancellationToken) -> KindResult {
        let mut result = KindResult {
            kind,
            stats: KindStatistics::default(),
            observed: HashSet::new(),
            critical: None,
        };
        let kind = result.kind.as_str();

        let Some(rules) = self.mapper.rules_for(kind) else {
            result.stats.completed = true;
            return result;
        };

        let params: Map<_, _> = self.mapping.query_params(kind).into_iter().collect();
        let ctx = UpsertContext::new(self.integration.clone(), kind)
            .with_create_missing_related(self.mapping.create_missing_related_entities);
        let batch_size = self.settings.batch_size.max(1);

        let mut pages = self.fetcher.fetch(kind, params, cancel.clone());
        let mut buffer: Vec<Entity> = Vec::new();

        while let Some(page) = pages.next().await {
            let page = match page {
                Ok(page) => page,
                Err(FetchError::Cancelled { .. }) => {
                    result.stats.error = Some("cancelled".to_string());
                    return result;
                }
                Err(e) => {
                    result.stats.error = Some(e.to_string());
                    if self.mapping.on_fetch_error(kind) == OnFetchError::Abort {
                        cancel.cancel();
                        result.critical = Some(e.to_string());
                    } else {
                        warn!(kind, error = %e, "fetch failed, skipping kind");
                    }
                    return result;
                }
            };

            result.stats.pages += 1;
            result.stats.objects += page.items.len();
            for raw in &page.items {
                for mapped in ocean_mapping::map(raw, rules) {
                    match mapped {
                        Ok(entity) => {
                            result.stats.mapped += 1;
                            result.observed.insert(entity.key());
                            buffer.push(entity);
                        }
                        Err(e) => {
                            result.stats.mapping_failures += 1;
                            warn!(error = %e, "mapping failed");
                        }
                    }
                }
            }

            while buffer.len() >= batch_size {
                let batch: Vec<Entity> = buffer.drain(..batch_size).collect();
                if !self.flush(&ctx, batch, &mut result.stats, cancel).await {
                    result.stats.error = Some("cancelled".to_string());
                    return result;
                }
            }
        }

        if !buffer.is_empty() && !self.flush(&ctx, buffer, &mut result.stats, cancel).await {
            result.stats.error = Some("cancelled".to_string());
            return result;
        }

        result.stats.completed = true;
        debug!(kind, stats = ?result.stats, "kind synced");
        result
    }

    /// Forwards one batch. Returns `false` without writing if the run was
    /// cancelled.
    async fn flush(
        &self,
        ctx: &UpsertContext,
        batch: Vec<Entity>,
        stats: &mut KindStatistics,
        cancel: &CancellationToken,
    ) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        let outcomes = self.reconciler.upsert(ctx, batch).await;
        stats.record_upserts(&outcomes);
        true
    }
}
