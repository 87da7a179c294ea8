#![allow(dead_code)]

use ocean_mapping::PortAppConfig;
use ocean_sync::catalog::mock::InMemoryCatalog;
use ocean_sync::upstream::mock::MockUpstream;
use ocean_sync::{EventListenerConfig, Integration, RetryPolicy, SyncConfig};
use ocean_types::{Entity, IntegrationId};
use std::sync::Arc;
use std::time::Duration;

pub const SERVICES: &str = r#"
resources:
  - kind: service
    selector:
      query: "true"
    port:
      entity:
        mappings:
          identifier: .id
          title: .name
          blueprint: '"service"'
          properties:
            name: .name
          relations:
            team: .team
"#;

pub const SERVICES_AND_TEAMS: &str = r#"
resources:
  - kind: service
    port:
      entity:
        mappings:
          identifier: .id
          title: .name
          blueprint: '"service"'
          relations:
            team: .team
  - kind: team
    port:
      entity:
        mappings:
          identifier: .id
          blueprint: '"team"'
"#;

pub fn integration_id() -> IntegrationId {
    IntegrationId::new("acme-github").unwrap()
}

/// Fast retries, no jitter, single resync.
pub fn fast_config() -> SyncConfig {
    let mut config = SyncConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
            jitter: false,
        },
        event_listener: EventListenerConfig::Once,
        ..SyncConfig::default()
    };
    config.resync.request_timeout_ms = 2_000;
    config
}

pub struct Harness {
    pub upstream: Arc<MockUpstream>,
    pub catalog: Arc<InMemoryCatalog>,
    pub integration: Arc<Integration>,
}

pub fn harness(mapping: &str) -> Harness {
    harness_with(mapping, fast_config())
}

/// Routes engine logs to the test output. `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn harness_with(mapping: &str, config: SyncConfig) -> Harness {
    init_tracing();
    let upstream = Arc::new(MockUpstream::new());
    let catalog = Arc::new(InMemoryCatalog::new());
    let integration = Integration::new(
        integration_id(),
        PortAppConfig::from_yaml_str(mapping).unwrap(),
        upstream.clone(),
        catalog.clone(),
        config,
    )
    .unwrap();
    Harness {
        upstream,
        catalog,
        integration: Arc::new(integration),
    }
}

impl Harness {
    /// Seeds an entity as if a previous run of this integration wrote it.
    pub fn seed(&self, entity: Entity, kind: &str) {
        self.catalog.insert(entity, &integration_id(), kind);
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
