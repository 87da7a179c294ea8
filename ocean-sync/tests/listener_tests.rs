mod common;

use common::{eventually, fast_config, harness_with, SERVICES};
use ocean_sync::listener::ChannelSource;
use ocean_sync::{EventListener, EventListenerConfig, SyncConfig, SyncError};
use ocean_types::{EntityKey, RunStatus};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn with_listener(listener: EventListenerConfig) -> SyncConfig {
    SyncConfig {
        event_listener: listener,
        ..fast_config()
    }
}

// ── Once ────────────────────────────────────────────────────────

#[tokio::test]
async fn once_runs_a_single_resync() {
    let h = harness_with(SERVICES, with_listener(EventListenerConfig::Once));
    h.upstream.set_objects("service", vec![json!({"id": 1, "name": "x"})]);

    let report = EventListener::new(Arc::clone(&h.integration))
        .run()
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert!(h.catalog.contains(&EntityKey::new("service", "1")));
}

// ── Polling ─────────────────────────────────────────────────────

#[tokio::test]
async fn polling_resyncs_on_every_tick() {
    let h = harness_with(
        SERVICES,
        with_listener(EventListenerConfig::Polling {
            interval_secs: 1,
            resync_on_start: true,
        }),
    );
    h.upstream.set_objects("service", vec![json!({"id": 1})]);

    let listener = tokio::spawn(EventListener::new(Arc::clone(&h.integration)).run());
    assert!(eventually(|| h.catalog.contains(&EntityKey::new("service", "1"))).await);

    h.integration.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn polling_can_wait_for_the_first_interval() {
    let h = harness_with(
        SERVICES,
        with_listener(EventListenerConfig::Polling {
            interval_secs: 3600,
            resync_on_start: false,
        }),
    );

    let listener = tokio::spawn(EventListener::new(Arc::clone(&h.integration)).run());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.upstream.calls().is_empty());

    h.integration.shutdown();
    tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

// ── Queue ───────────────────────────────────────────────────────

#[tokio::test]
async fn queue_mode_needs_a_source() {
    let h = harness_with(
        SERVICES,
        with_listener(EventListenerConfig::Queue {
            workers: 1,
            capacity: 4,
            max_redeliveries: 1,
            resync_on_start: false,
        }),
    );
    let err = EventListener::new(Arc::clone(&h.integration)).run().await.unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
}

#[tokio::test]
async fn queue_mode_consumes_the_source() {
    let h = harness_with(
        SERVICES,
        with_listener(EventListenerConfig::Queue {
            workers: 1,
            capacity: 4,
            max_redeliveries: 1,
            resync_on_start: false,
        }),
    );
    let (source, publisher) = ChannelSource::new(4);
    let listener = tokio::spawn(
        EventListener::new(Arc::clone(&h.integration))
            .with_source(Arc::new(source))
            .run(),
    );

    publisher
        .publish(br#"{"action": "upsert", "kind": "service", "object": {"id": "q"}}"#.to_vec())
        .await
        .unwrap();
    assert!(eventually(|| h.catalog.contains(&EntityKey::new("service", "q"))).await);

    h.integration.shutdown();
    tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

// ── Configuration ───────────────────────────────────────────────

#[test]
fn minimal_config_uses_defaults() {
    let config: SyncConfig = serde_json::from_value(json!({})).unwrap();
    assert_eq!(config, SyncConfig::default());
    assert_eq!(config.resync.batch_size, 100);
    assert!(config.resync.delete_stale);
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.event_listener.mode(), "POLLING");
    config.validate().unwrap();
}

#[test]
fn listener_modes_parse_from_their_tag() {
    let config: SyncConfig = serde_json::from_value(json!({
        "event_listener": {"type": "QUEUE", "workers": 3},
        "resync": {"dependent_deletion": "transitive"}
    }))
    .unwrap();
    assert_eq!(
        config.event_listener,
        EventListenerConfig::Queue {
            workers: 3,
            capacity: 1024,
            max_redeliveries: 5,
            resync_on_start: true,
        }
    );
    assert_eq!(config.resync.dependent_deletion, ocean_sync::DependentDeletion::Transitive);

    let once: EventListenerConfig = serde_json::from_value(json!({"type": "ONCE"})).unwrap();
    assert_eq!(once, EventListenerConfig::Once);
}

#[test]
fn validation_rejects_zero_values() {
    let mut config = SyncConfig::default();
    config.resync.batch_size = 0;
    assert!(matches!(config.validate(), Err(SyncError::Config(_))));

    let config = SyncConfig {
        event_listener: EventListenerConfig::Polling {
            interval_secs: 0,
            resync_on_start: true,
        },
        ..SyncConfig::default()
    };
    assert!(config.validate().is_err());

    let mut config = SyncConfig::default();
    config.retry.max_attempts = 0;
    assert!(config.validate().is_err());
}

#[test]
fn webhook_secret_is_not_written_back() {
    let config = with_listener(EventListenerConfig::Webhook {
        bind: "127.0.0.1:9000".parse().unwrap(),
        path: "/hook".into(),
        secret: Some("hunter2".into()),
        workers: 1,
        queue_capacity: 8,
        resync_on_start: false,
    });
    let text = serde_json::to_string(&config).unwrap();
    assert!(!text.contains("hunter2"));
}
