use ocean_sync::catalog::mock::InMemoryCatalog;
use ocean_sync::catalog::UpsertContext;
use ocean_sync::{DependentDeletion, Reconciler, ReconcilerOptions, UpsertOutcome};
use ocean_types::{Entity, EntityKey, IntegrationId};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn integration() -> IntegrationId {
    IntegrationId::new("acme").unwrap()
}

fn ctx() -> UpsertContext {
    UpsertContext::new(integration(), "service")
}

fn options() -> ReconcilerOptions {
    ReconcilerOptions {
        upsert_concurrency: 4,
        delete_dependents: false,
        dependent_deletion: DependentDeletion::Direct,
        deletion_threshold: None,
    }
}

fn reconciler(catalog: &Arc<InMemoryCatalog>, options: ReconcilerOptions) -> Reconciler {
    Reconciler::new(catalog.clone(), options)
}

fn service(id: &str) -> Entity {
    Entity::new("service", id)
}

fn key(blueprint: &str, id: &str) -> EntityKey {
    EntityKey::new(blueprint, id)
}

// ── Upserts ─────────────────────────────────────────────────────

#[tokio::test]
async fn upsert_reports_created_then_updated() {
    let catalog = Arc::new(InMemoryCatalog::new());
    let reconciler = reconciler(&catalog, options());

    let first = reconciler.upsert(&ctx(), vec![service("a"), service("b")]).await;
    assert_eq!(
        first,
        vec![
            (key("service", "a"), UpsertOutcome::Created),
            (key("service", "b"), UpsertOutcome::Created),
        ]
    );

    let again = reconciler.upsert(&ctx(), vec![service("a")]).await;
    assert_eq!(again, vec![(key("service", "a"), UpsertOutcome::Updated)]);
    assert_eq!(catalog.len(), 2);
}

#[tokio::test]
async fn duplicate_keys_in_a_batch_keep_the_last_version() {
    let catalog = Arc::new(InMemoryCatalog::new());
    let reconciler = reconciler(&catalog, options());

    let batch = vec![
        service("a").with_title("old"),
        service("b"),
        service("a").with_title("new"),
    ];
    let outcomes = reconciler.upsert(&ctx(), batch).await;

    let keys: Vec<EntityKey> = outcomes.into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![key("service", "a"), key("service", "b")]);
    assert_eq!(catalog.upserts().len(), 2);
    assert_eq!(
        catalog.entity(&key("service", "a")).unwrap().title.as_deref(),
        Some("new")
    );
}

#[tokio::test]
async fn one_rejected_entity_does_not_fail_the_batch() {
    let catalog = Arc::new(InMemoryCatalog::new());
    catalog.reject(key("service", "bad"));
    let reconciler = reconciler(&catalog, options());

    let outcomes = reconciler
        .upsert(&ctx(), vec![service("a"), service("bad"), service("c")])
        .await;
    assert_eq!(outcomes.iter().filter(|(_, o)| o.is_failed()).count(), 1);
    assert!(catalog.contains(&key("service", "a")));
    assert!(catalog.contains(&key("service", "c")));
    assert!(!catalog.contains(&key("service", "bad")));
}

#[tokio::test]
async fn create_missing_related_is_forwarded() {
    let catalog = Arc::new(InMemoryCatalog::new());
    let reconciler = reconciler(&catalog, options());
    let ctx = ctx().with_create_missing_related(false);

    reconciler.upsert_one(&ctx, &service("a")).await;
    assert_eq!(catalog.upserts(), vec![(key("service", "a"), false)]);
}

#[tokio::test]
async fn concurrent_writes_to_one_key_never_overlap() {
    let catalog = Arc::new(InMemoryCatalog::new());
    catalog.set_write_delay(Some(Duration::from_millis(5)));
    let reconciler = Arc::new(reconciler(&catalog, options()));

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move {
                let entity = service("shared").with_property("n", json!(i));
                reconciler.upsert_one(&ctx(), &entity).await
            })
        })
        .collect();
    for task in tasks {
        assert!(!task.await.unwrap().is_failed());
    }

    assert_eq!(catalog.upserts().len(), 8);
    assert_eq!(catalog.overlapping_writes(), 0);
}

// ── Stale deletion ──────────────────────────────────────────────

#[tokio::test]
async fn deletes_scope_minus_observed() {
    let catalog = Arc::new(InMemoryCatalog::new());
    for id in ["1", "2", "3"] {
        catalog.insert(service(id), &integration(), "service");
    }
    let reconciler = reconciler(&catalog, options());

    let scope = vec![key("service", "1"), key("service", "2"), key("service", "3")];
    let observed: HashSet<EntityKey> = [key("service", "1"), key("service", "2")].into();
    let report = reconciler
        .delete_stale(&scope, &observed, &CancellationToken::new())
        .await;

    assert_eq!(report.deleted, 1);
    assert_eq!(catalog.deletes(), vec![key("service", "3")]);
    assert_eq!(catalog.keys(), vec![key("service", "1"), key("service", "2")]);
}

#[tokio::test]
async fn nothing_stale_means_no_deletes() {
    let catalog = Arc::new(InMemoryCatalog::new());
    catalog.insert(service("1"), &integration(), "service");
    let reconciler = reconciler(&catalog, options());

    let scope = vec![key("service", "1")];
    let observed: HashSet<EntityKey> = scope.iter().cloned().collect();
    let report = reconciler
        .delete_stale(&scope, &observed, &CancellationToken::new())
        .await;
    assert_eq!(report, Default::default());
    assert!(catalog.deletes().is_empty());
}

#[tokio::test]
async fn threshold_guard_skips_mass_deletion() {
    let catalog = Arc::new(InMemoryCatalog::new());
    let scope: Vec<EntityKey> = (0..10)
        .map(|i| {
            catalog.insert(service(&i.to_string()), &integration(), "service");
            key("service", &i.to_string())
        })
        .collect();
    let reconciler = reconciler(
        &catalog,
        ReconcilerOptions {
            deletion_threshold: Some(0.5),
            ..options()
        },
    );

    let report = reconciler
        .delete_stale(&scope, &HashSet::new(), &CancellationToken::new())
        .await;
    assert_eq!(report.skipped, 10);
    assert_eq!(report.deleted, 0);
    assert_eq!(catalog.len(), 10);

    // Below the threshold deletion goes ahead.
    let observed: HashSet<EntityKey> = scope[..6].iter().cloned().collect();
    let report = reconciler
        .delete_stale(&scope, &observed, &CancellationToken::new())
        .await;
    assert_eq!(report.deleted, 4);
    assert_eq!(catalog.len(), 6);
}

#[tokio::test]
async fn cancelled_deletion_stops_before_writing() {
    let catalog = Arc::new(InMemoryCatalog::new());
    catalog.insert(service("1"), &integration(), "service");
    let reconciler = reconciler(&catalog, options());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = reconciler
        .delete_stale(&[key("service", "1")], &HashSet::new(), &cancel)
        .await;
    assert!(report.cancelled);
    assert!(catalog.deletes().is_empty());
}

#[tokio::test]
async fn failed_delete_is_counted() {
    let catalog = Arc::new(InMemoryCatalog::new());
    catalog.insert(service("1"), &integration(), "service");
    catalog.reject(key("service", "1"));
    let reconciler = reconciler(&catalog, options());

    let report = reconciler.delete_one(&key("service", "1")).await;
    assert_eq!(report.failed, 1);
    assert!(catalog.contains(&key("service", "1")));
}

// ── Dependents ──────────────────────────────────────────────────

/// team/core <- service/api <- deployment/d1
fn seed_chain(catalog: &InMemoryCatalog) {
    catalog.insert(Entity::new("team", "core"), &integration(), "team");
    catalog.insert(
        service("api").with_relation("team", json!("core")),
        &integration(),
        "service",
    );
    catalog.insert(
        Entity::new("deployment", "d1").with_relation("service", json!("api")),
        &integration(),
        "deployment",
    );
}

#[tokio::test]
async fn dependents_are_kept_when_disabled() {
    let catalog = Arc::new(InMemoryCatalog::new());
    seed_chain(&catalog);
    let reconciler = reconciler(&catalog, options());

    let report = reconciler.delete_one(&key("team", "core")).await;
    assert_eq!(report.deleted, 1);
    assert_eq!(report.dependents_deleted, 0);
    assert!(catalog.contains(&key("service", "api")));
}

#[tokio::test]
async fn direct_dependents_are_deleted() {
    let catalog = Arc::new(InMemoryCatalog::new());
    seed_chain(&catalog);
    let reconciler = reconciler(
        &catalog,
        ReconcilerOptions {
            delete_dependents: true,
            ..options()
        },
    );

    let report = reconciler.delete_one(&key("team", "core")).await;
    assert_eq!(report.deleted, 1);
    assert_eq!(report.dependents_deleted, 1);
    assert!(!catalog.contains(&key("service", "api")));
    assert!(catalog.contains(&key("deployment", "d1")));
}

#[tokio::test]
async fn transitive_dependents_are_deleted() {
    let catalog = Arc::new(InMemoryCatalog::new());
    seed_chain(&catalog);
    let reconciler = reconciler(
        &catalog,
        ReconcilerOptions {
            delete_dependents: true,
            dependent_deletion: DependentDeletion::Transitive,
            ..options()
        },
    );

    let report = reconciler.delete_one(&key("team", "core")).await;
    assert_eq!(report.dependents_deleted, 2);
    assert!(catalog.is_empty());
}

#[tokio::test]
async fn relation_cycles_terminate() {
    let catalog = Arc::new(InMemoryCatalog::new());
    catalog.insert(service("a").with_relation("peer", json!("b")), &integration(), "service");
    catalog.insert(service("b").with_relation("peer", json!("a")), &integration(), "service");
    let reconciler = reconciler(
        &catalog,
        ReconcilerOptions {
            delete_dependents: true,
            dependent_deletion: DependentDeletion::Transitive,
            ..options()
        },
    );

    let report = reconciler.delete_one(&key("service", "a")).await;
    assert_eq!(report.deleted, 1);
    assert_eq!(report.dependents_deleted, 1);
    assert!(catalog.is_empty());
}

#[test]
fn options_follow_mapping_document_and_settings() {
    let mapping = ocean_mapping::PortAppConfig::from_yaml_str(
        "deleteDependentEntities: true\nentityDeletionThreshold: 0.25\nresources: []\n",
    )
    .unwrap();
    let settings = ocean_sync::ResyncSettings {
        dependent_deletion: DependentDeletion::Transitive,
        upsert_concurrency: 3,
        ..Default::default()
    };
    let options = ReconcilerOptions::new(&settings, &mapping);
    assert!(options.delete_dependents);
    assert_eq!(options.deletion_threshold, Some(0.25));
    assert_eq!(options.dependent_deletion, DependentDeletion::Transitive);
    assert_eq!(options.upsert_concurrency, 3);
}

proptest! {
    #[test]
    fn dedupe_keeps_first_position_and_last_version(ids in proptest::collection::vec(0u8..6, 0..24)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let catalog = Arc::new(InMemoryCatalog::new());
        let reconciler = reconciler(&catalog, options());
        let batch: Vec<Entity> = ids
            .iter()
            .enumerate()
            .map(|(pos, id)| service(&id.to_string()).with_property("pos", json!(pos)))
            .collect();

        let outcomes = runtime.block_on(reconciler.upsert(&ctx(), batch));

        let mut expected: Vec<String> = Vec::new();
        for id in &ids {
            if !expected.contains(&id.to_string()) {
                expected.push(id.to_string());
            }
        }
        let keys: Vec<String> = outcomes.iter().map(|(k, _)| k.identifier.clone()).collect();
        prop_assert_eq!(&keys, &expected);
        prop_assert_eq!(catalog.upserts().len(), expected.len());

        for id in &expected {
            let last = ids.iter().rposition(|i| &i.to_string() == id).unwrap();
            let stored = catalog.entity(&key("service", id)).unwrap();
            prop_assert_eq!(stored.properties.get("pos"), Some(&json!(last)));
        }
    }
}
