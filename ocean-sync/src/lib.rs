//! Resync and live-event sync engine for Ocean integrations.
//!
//! Keeps a catalog in step with an upstream API:
//! - full resyncs page through every configured kind, map raw objects to
//!   entities, upsert them in batches and delete what was not seen
//! - live events (webhooks, queue messages) apply the same mapping to single
//!   objects between resyncs
//!
//! # Architecture
//!
//! - **Fetcher**: pages raw objects from an [`UpstreamClient`] with retry,
//!   timeout and cancellation
//! - **Coordinator**: runs one resync; kinds in parallel, batches in order
//! - **Reconciler**: writes to a [`CatalogClient`], serializing writes per
//!   entity key, and owns the deletion rules
//! - **Registry**: at most one active resync per integration; a new one
//!   cancels the old
//! - **Listeners**: polling, webhook, queue and once, all driving an
//!   [`Integration`]
//!
//! ## Resync
//!
//! 1. **Register**: the run becomes active, cancelling its predecessor
//! 2. **Fetch & map**: each kind streams pages through the mapper
//! 3. **Upsert**: entities go to the catalog in batches
//! 4. **Delete**: catalog entities of fully fetched kinds that were not
//!    observed are removed, unless the deletion guard trips
//! 5. **Complete**: the run unregisters itself if it is still active
//!
//! # Example
//!
//! ```no_run
//! use ocean_mapping::PortAppConfig;
//! use ocean_sync::catalog::mock::InMemoryCatalog;
//! use ocean_sync::upstream::mock::MockUpstream;
//! use ocean_sync::{Integration, SyncConfig};
//! use ocean_types::IntegrationId;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mapping = PortAppConfig::from_yaml_str(
//!     r#"
//! resources:
//!   - kind: service
//!     port:
//!       entity:
//!         mappings: { identifier: .id, blueprint: '"service"' }
//! "#,
//! )?;
//! let integration = Integration::new(
//!     IntegrationId::new("demo")?,
//!     mapping,
//!     Arc::new(MockUpstream::new()),
//!     Arc::new(InMemoryCatalog::new()),
//!     SyncConfig::default(),
//! )?;
//! let report = integration.resync().await;
//! println!("{} objects", report.statistics.objects());
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod coordinator;
mod error;
pub mod event;
pub mod fetcher;
pub mod http;
pub mod integration;
pub mod listener;
pub mod reconciler;
pub mod registry;
pub mod state;
pub mod upstream;

pub use catalog::{CatalogClient, CatalogEntityRef, UpsertContext, UpsertResult};
pub use config::{DependentDeletion, EventListenerConfig, ResyncSettings, RetryPolicy, SyncConfig};
pub use coordinator::{PreparedRun, ResyncCoordinator};
pub use error::{
    CatalogError, CatalogResult, FetchError, FetchResult, SyncError, SyncResult, UpstreamError,
    UpstreamResult,
};
pub use event::{EventOutcome, LiveEvent};
pub use fetcher::ResourceFetcher;
pub use integration::{Integration, ResyncHandle};
pub use listener::EventListener;
pub use reconciler::{DeleteReport, Reconciler, ReconcilerOptions, UpsertOutcome};
pub use registry::RunRegistry;
pub use state::{KindStatistics, ResyncReport, ResyncRun, RunStatistics};
pub use upstream::{Page, PageRequest, UpstreamClient};
