//! Core type definitions for the Ocean integration engine.
//!
//! This crate defines the fundamental, vendor-agnostic types shared by the
//! mapping layer and the sync engine:
//! - Integration and run identifiers (run IDs are UUID v7)
//! - Normalized catalog entities and their identity key
//! - The lifecycle status of a resync run
//!
//! Vendor-specific shapes (GitHub issues, PagerDuty incidents, ...) never
//! appear here; they stay raw JSON until the mapper turns them into entities.

mod entity;
mod ids;
mod status;

pub use entity::{Entity, EntityKey};
pub use ids::{IntegrationId, RunId};
pub use status::RunStatus;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("invalid run status: {0}")]
    InvalidStatus(String),
}
