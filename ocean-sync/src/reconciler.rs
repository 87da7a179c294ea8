//! Reconciler: applies entity batches and deletions to the catalog.
//!
//! Writes to the same [`EntityKey`] never overlap. Resync batches and live
//! events share one reconciler, and each write holds a striped async lock
//! picked by the key's hash for the duration of the catalog call.

use crate::catalog::{CatalogClient, UpsertContext, UpsertResult};
use crate::config::{DependentDeletion, ResyncSettings};
use crate::error::{CatalogError, CatalogResult};
use futures::stream::{self, StreamExt};
use ocean_mapping::PortAppConfig;
use ocean_types::{Entity, EntityKey};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LOCK_STRIPES: usize = 64;

/// Result of writing one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Failed(CatalogError),
}

impl UpsertOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl From<CatalogResult<UpsertResult>> for UpsertOutcome {
    fn from(result: CatalogResult<UpsertResult>) -> Self {
        match result {
            Ok(UpsertResult::Created) => Self::Created,
            Ok(UpsertResult::Updated) => Self::Updated,
            Err(e) => Self::Failed(e),
        }
    }
}

/// Counts from a deletion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    /// Stale entities removed.
    pub deleted: usize,
    /// Dependents removed along with them.
    pub dependents_deleted: usize,
    /// Deletes (or dependent lookups) the catalog refused.
    pub failed: usize,
    /// Stale entities left in place because the deletion guard tripped.
    pub skipped: usize,
    /// The pass stopped early because its run was cancelled.
    pub cancelled: bool,
}

impl DeleteReport {
    fn absorb(&mut self, other: DeleteReport) {
        self.deleted += other.deleted;
        self.dependents_deleted += other.dependents_deleted;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.cancelled |= other.cancelled;
    }
}

/// Deletion behavior, drawn from the mapping document and the engine
/// settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerOptions {
    pub upsert_concurrency: usize,
    pub delete_dependents: bool,
    pub dependent_deletion: DependentDeletion,
    /// Largest fraction of the scope one deletion pass may remove.
    pub deletion_threshold: Option<f64>,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self::new(&ResyncSettings::default(), &PortAppConfig::default())
    }
}

impl ReconcilerOptions {
    pub fn new(settings: &ResyncSettings, mapping: &PortAppConfig) -> Self {
        Self {
            upsert_concurrency: settings.upsert_concurrency.max(1),
            delete_dependents: mapping.delete_dependent_entities,
            dependent_deletion: settings.dependent_deletion,
            deletion_threshold: mapping.entity_deletion_threshold,
        }
    }
}

/// Applies mapped entities to the catalog.
///
/// Writes to the same entity key are serialized through a fixed set of
/// striped locks, so a live event and a resync never interleave on one key.
pub struct Reconciler {
    catalog: Arc<dyn CatalogClient>,
    locks: Vec<Mutex<()>>,
    options: ReconcilerOptions,
}

impl Reconciler {
    pub fn new(catalog: Arc<dyn CatalogClient>, options: ReconcilerOptions) -> Self {
        Self {
            catalog,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            options,
        }
    }

    pub fn options(&self) -> &ReconcilerOptions {
        &self.options
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogClient> {
        &self.catalog
    }

    fn stripe(&self, key: &EntityKey) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.locks[(hasher.finish() as usize) % self.locks.len()]
    }

    /// Upserts a batch. Duplicate keys collapse to their last occurrence,
    /// which takes the position of the first. One entity failing does not
    /// affect the others.
    pub async fn upsert(&self, ctx: &UpsertContext, batch: Vec<Entity>) -> Vec<(EntityKey, UpsertOutcome)> {
        let entities = dedupe(batch);
        stream::iter(entities)
            .map(|entity| async move {
                let outcome = self.upsert_one(ctx, &entity).await;
                (entity.key(), outcome)
            })
            .buffered(self.options.upsert_concurrency)
            .collect()
            .await
    }

    /// Upserts a single entity under its key lock.
    pub async fn upsert_one(&self, ctx: &UpsertContext, entity: &Entity) -> UpsertOutcome {
        let key = entity.key();
        let _guard = self.stripe(&key).lock().await;
        let outcome = UpsertOutcome::from(self.catalog.upsert_entity(entity, ctx).await);
        match &outcome {
            UpsertOutcome::Failed(error) => {
                warn!(entity = %key, kind = %ctx.kind, error = %error, "catalog rejected upsert");
            }
            other => debug!(entity = %key, outcome = ?other, "upserted entity"),
        }
        outcome
    }

    /// Deletes every entity of `scope` that is not in `observed`.
    ///
    /// If the stale share of the scope exceeds the deletion threshold nothing
    /// is deleted. Cancellation is checked before every delete.
    pub async fn delete_stale(
        &self,
        scope: &[EntityKey],
        observed: &HashSet<EntityKey>,
        cancel: &CancellationToken,
    ) -> DeleteReport {
        let scope: Vec<&EntityKey> = {
            let mut seen = HashSet::new();
            scope.iter().filter(|k| seen.insert(*k)).collect()
        };
        let stale: Vec<&EntityKey> = scope
            .iter()
            .copied()
            .filter(|k| !observed.contains(*k))
            .collect();

        let mut report = DeleteReport::default();
        if stale.is_empty() {
            return report;
        }

        if let Some(threshold) = self.options.deletion_threshold {
            let ratio = stale.len() as f64 / scope.len() as f64;
            if ratio > threshold {
                warn!(
                    stale = stale.len(),
                    scope = scope.len(),
                    threshold,
                    "stale share exceeds the deletion threshold, skipping deletion"
                );
                report.skipped = stale.len();
                return report;
            }
        }

        info!(stale = stale.len(), scope = scope.len(), "deleting stale entities");
        for key in stale {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.absorb(self.delete_one(key).await);
        }
        report
    }

    /// Deletes one entity and, when enabled, its dependents.
    pub async fn delete_one(&self, key: &EntityKey) -> DeleteReport {
        let mut report = DeleteReport::default();

        // Dependents are resolved first; the catalog may forget the
        // relation once the target is gone.
        let dependents = if self.options.delete_dependents {
            self.collect_dependents(key, &mut report).await
        } else {
            Vec::new()
        };

        match self.delete_locked(key).await {
            Ok(true) => report.deleted += 1,
            Ok(false) => debug!(entity = %key, "entity already absent"),
            Err(error) => {
                warn!(entity = %key, error = %error, "catalog refused delete");
                report.failed += 1;
                return report;
            }
        }

        for dependent in dependents {
            match self.delete_locked(&dependent).await {
                Ok(true) => report.dependents_deleted += 1,
                Ok(false) => {}
                Err(error) => {
                    warn!(entity = %dependent, of = %key, error = %error, "catalog refused dependent delete");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn delete_locked(&self, key: &EntityKey) -> CatalogResult<bool> {
        let _guard = self.stripe(key).lock().await;
        self.catalog.delete_entity(key).await
    }

    async fn collect_dependents(&self, key: &EntityKey, report: &mut DeleteReport) -> Vec<EntityKey> {
        let transitive = self.options.dependent_deletion == DependentDeletion::Transitive;
        let mut seen = HashSet::from([key.clone()]);
        let mut queue = VecDeque::from([key.clone()]);
        let mut found = Vec::new();

        while let Some(target) = queue.pop_front() {
            let dependents = match self.catalog.list_dependents(&target).await {
                Ok(dependents) => dependents,
                Err(error) => {
                    warn!(entity = %target, error = %error, "could not list dependents");
                    report.failed += 1;
                    continue;
                }
            };
            for dependent in dependents {
                if !seen.insert(dependent.clone()) {
                    continue;
                }
                if transitive {
                    queue.push_back(dependent.clone());
                }
                found.push(dependent);
            }
        }
        found
    }
}

fn dedupe(batch: Vec<Entity>) -> Vec<Entity> {
    let mut positions: HashMap<EntityKey, usize> = HashMap::with_capacity(batch.len());
    let mut out: Vec<Entity> = Vec::with_capacity(batch.len());
    for entity in batch {
        match positions.get(&entity.key()) {
            Some(&index) => out[index] = entity,
            None => {
                positions.insert(entity.key(), out.len());
                out.push(entity);
            }
        }
    }
    out
}
