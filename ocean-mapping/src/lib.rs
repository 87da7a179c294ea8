//! Declarative entity mapping for Ocean integrations.
//!
//! An integration ships a mapping document ([`PortAppConfig`]) describing,
//! per resource kind, which raw upstream objects to keep and how to turn them
//! into catalog entities. The document's expressions are compiled once into
//! an [`EntityMapper`], which then maps raw JSON objects without side effects.

pub mod config;
pub mod expr;
pub mod mapper;

pub use config::{
    EntityConfig, EntityMappings, OnFetchError, PortAppConfig, PortConfig, ResourceConfig,
    Selector,
};
pub use expr::{ExprError, Expression, ExpressionCompiler, JqCompiler, JqExpression};
pub use mapper::{
    map, CompiledRule, EntityMapper, MappingError, MappingFailure, MappingResult, RuleSet,
};

use std::path::PathBuf;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading or compiling a mapping document. Per-object
/// failures are [`MappingError`]s instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read mapping document {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid YAML mapping document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON mapping document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid mapping document: {0}")]
    Invalid(String),

    #[error("kind '{kind}' rule #{rule}: cannot compile {field}: {source}")]
    Expression {
        kind: String,
        rule: usize,
        field: String,
        source: ExprError,
    },
}
