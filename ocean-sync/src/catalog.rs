//! Catalog service abstraction.
//!
//! The catalog stores entities; the engine only creates, updates, deletes
//! and lists them. Authentication and storage are the catalog's business.

use crate::error::CatalogResult;
use async_trait::async_trait;
use ocean_types::{Entity, EntityKey, IntegrationId};
use serde::{Deserialize, Serialize};

/// Outcome of a successful create-or-update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertResult {
    Created,
    Updated,
}

/// Who is writing an entity, forwarded with every upsert so the catalog can
/// attribute the entity to an integration and kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertContext {
    pub integration: IntegrationId,
    /// The resource kind the entity was mapped from.
    pub kind: String,
    /// Let the catalog create placeholder targets for unknown relations.
    pub create_missing_related: bool,
}

impl UpsertContext {
    pub fn new(integration: IntegrationId, kind: impl Into<String>) -> Self {
        Self {
            integration,
            kind: kind.into(),
            create_missing_related: true,
        }
    }

    #[must_use]
    pub fn with_create_missing_related(mut self, create: bool) -> Self {
        self.create_missing_related = create;
        self
    }
}

/// An entity as listed by the catalog for an integration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogEntityRef {
    #[serde(flatten)]
    pub key: EntityKey,
    /// Kind that last wrote the entity, when the catalog knows it.
    #[serde(default)]
    pub kind: Option<String>,
}

/// Catalog service client.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Creates or replaces an entity. Resubmitting an unchanged entity is not
    /// an error and reports [`UpsertResult::Updated`].
    async fn upsert_entity(&self, entity: &Entity, ctx: &UpsertContext) -> CatalogResult<UpsertResult>;

    /// Deletes an entity. Returns `false` if it did not exist.
    async fn delete_entity(&self, key: &EntityKey) -> CatalogResult<bool>;

    /// Every entity currently attributed to `integration`.
    async fn list_entities(&self, integration: &IntegrationId) -> CatalogResult<Vec<CatalogEntityRef>>;

    /// Entities with a relation pointing at `key`.
    async fn list_dependents(&self, key: &EntityKey) -> CatalogResult<Vec<EntityKey>>;
}

/// In-memory catalog for tests.
pub mod mock {
    use super::*;
    use crate::error::CatalogError;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct Stored {
        entity: Entity,
        integration: IntegrationId,
        kind: String,
    }

    #[derive(Debug, Default)]
    struct Inner {
        entities: BTreeMap<EntityKey, Stored>,
        upserts: Vec<(EntityKey, bool)>,
        deletes: Vec<EntityKey>,
        rejected: HashSet<EntityKey>,
        unavailable: bool,
        in_flight: HashSet<EntityKey>,
        overlapping_writes: usize,
    }

    /// A catalog kept in a map. Records every write and can be told to
    /// reject keys or to be unavailable.
    #[derive(Debug, Default)]
    pub struct InMemoryCatalog {
        inner: Mutex<Inner>,
        write_delay: Mutex<Option<Duration>>,
    }

    impl InMemoryCatalog {
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Seeds an entity as if an earlier run had written it.
        pub fn insert(&self, entity: Entity, integration: &IntegrationId, kind: &str) {
            self.lock().entities.insert(
                entity.key(),
                Stored {
                    entity,
                    integration: integration.clone(),
                    kind: kind.to_string(),
                },
            );
        }

        pub fn entity(&self, key: &EntityKey) -> Option<Entity> {
            self.lock().entities.get(key).map(|s| s.entity.clone())
        }

        pub fn contains(&self, key: &EntityKey) -> bool {
            self.lock().entities.contains_key(key)
        }

        /// All keys, sorted.
        pub fn keys(&self) -> Vec<EntityKey> {
            self.lock().entities.keys().cloned().collect()
        }

        pub fn len(&self) -> usize {
            self.lock().entities.len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Every upsert call with its `create_missing_related` flag.
        pub fn upserts(&self) -> Vec<(EntityKey, bool)> {
            self.lock().upserts.clone()
        }

        /// Every delete call, including deletes of absent entities.
        pub fn deletes(&self) -> Vec<EntityKey> {
            self.lock().deletes.clone()
        }

        /// Writes to `key` fail with [`CatalogError::Rejected`].
        pub fn reject(&self, key: EntityKey) {
            self.lock().rejected.insert(key);
        }

        pub fn set_unavailable(&self, unavailable: bool) {
            self.lock().unavailable = unavailable;
        }

        /// Slows every write down, so overlapping writes would be visible.
        pub fn set_write_delay(&self, delay: Option<Duration>) {
            *self
                .write_delay
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = delay;
        }

        /// Number of writes that started while another write to the same key
        /// was still in flight.
        pub fn overlapping_writes(&self) -> usize {
            self.lock().overlapping_writes
        }

        fn check(&self, key: &EntityKey) -> CatalogResult<()> {
            let inner = self.lock();
            if inner.unavailable {
                return Err(CatalogError::Unavailable("catalog is down".into()));
            }
            if inner.rejected.contains(key) {
                return Err(CatalogError::Rejected {
                    status: 422,
                    message: format!("entity {key} failed validation"),
                });
            }
            Ok(())
        }

        async fn enter(&self, key: &EntityKey) {
            {
                let mut inner = self.lock();
                if !inner.in_flight.insert(key.clone()) {
                    inner.overlapping_writes += 1;
                }
            }
            let delay = *self
                .write_delay
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }

        fn leave(&self, key: &EntityKey) {
            self.lock().in_flight.remove(key);
        }
    }

    #[async_trait]
    impl CatalogClient for InMemoryCatalog {
        async fn upsert_entity(&self, entity: &Entity, ctx: &UpsertContext) -> CatalogResult<UpsertResult> {
            let key = entity.key();
            self.check(&key)?;
            self.enter(&key).await;

            let mut inner = self.lock();
            inner.in_flight.remove(&key);
            inner.upserts.push((key.clone(), ctx.create_missing_related));
            let previous = inner.entities.insert(
                key,
                Stored {
                    entity: entity.clone(),
                    integration: ctx.integration.clone(),
                    kind: ctx.kind.clone(),
                },
            );
            Ok(match previous {
                Some(_) => UpsertResult::Updated,
                None => UpsertResult::Created,
            })
        }

        async fn delete_entity(&self, key: &EntityKey) -> CatalogResult<bool> {
            self.check(key)?;
            self.enter(key).await;
            self.leave(key);

            let mut inner = self.lock();
            inner.deletes.push(key.clone());
            Ok(inner.entities.remove(key).is_some())
        }

        async fn list_entities(&self, integration: &IntegrationId) -> CatalogResult<Vec<CatalogEntityRef>> {
            let inner = self.lock();
            if inner.unavailable {
                return Err(CatalogError::Unavailable("catalog is down".into()));
            }
            Ok(inner
                .entities
                .iter()
                .filter(|(_, s)| &s.integration == integration)
                .map(|(key, s)| CatalogEntityRef {
                    key: key.clone(),
                    kind: Some(s.kind.clone()),
                })
                .collect())
        }

        /// Relation targets carry only an identifier, so any entity with a
        /// relation value equal to `key.identifier` counts as a dependent.
        async fn list_dependents(&self, key: &EntityKey) -> CatalogResult<Vec<EntityKey>> {
            let inner = self.lock();
            Ok(inner
                .entities
                .iter()
                .filter(|(k, s)| {
                    *k != key
                        && s
                            .entity
                            .related_identifiers()
                            .iter()
                            .any(|id| id == &key.identifier)
                })
                .map(|(k, _)| k.clone())
                .collect())
        }
    }
}
