//! The mapping document of an integration.
//!
//! ```yaml
//! deleteDependentEntities: false
//! createMissingRelatedEntities: true
//! resources:
//!   - kind: issue
//!     selector:
//!       query: .fields.status != "archived"
//!       jql: project = PROJ
//!     port:
//!       entity:
//!         mappings:
//!           identifier: .key
//!           title: .fields.summary
//!           blueprint: '"jiraIssue"'
//!           properties:
//!             status: .fields.status.name
//!           relations:
//!             project: .fields.project.key
//! ```
//!
//! Field values are expression source text; they are compiled by
//! [`EntityMapper`](crate::EntityMapper), not here. JSON documents load the
//! same way since YAML is a superset.

use crate::{Error, Result};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// What to do when fetching a kind fails fatally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFetchError {
    /// Skip the kind; its entities are excluded from deletion for the run.
    #[default]
    Skip,
    /// Fail the whole run.
    Abort,
}

/// Top-level mapping document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortAppConfig {
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Delete entities whose relations point at a deleted entity.
    #[serde(default)]
    pub delete_dependent_entities: bool,
    /// Ask the catalog to create placeholder targets for unknown relations.
    #[serde(default = "default_true")]
    pub create_missing_related_entities: bool,
    /// Largest fraction of an integration's entities one resync may delete.
    /// An explicit `null` disables the guard.
    #[serde(default = "default_deletion_threshold")]
    pub entity_deletion_threshold: Option<f64>,
}

fn default_true() -> bool {
    true
}

fn default_deletion_threshold() -> Option<f64> {
    Some(0.9)
}

impl Default for PortAppConfig {
    fn default() -> Self {
        Self {
            resources: Vec::new(),
            delete_dependent_entities: false,
            create_missing_related_entities: true,
            entity_deletion_threshold: default_deletion_threshold(),
        }
    }
}

/// One mapping rule for a kind. A kind may have several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    pub kind: String,
    #[serde(default)]
    pub selector: Selector,
    pub port: PortConfig,
    #[serde(default)]
    pub on_fetch_error: OnFetchError,
}

/// Selects which raw objects a rule applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    /// Predicate expression; objects for which it is falsy are dropped.
    #[serde(default = "default_query", deserialize_with = "expression_source")]
    pub query: String,
    /// Kind-specific filters, passed to the upstream client as query
    /// parameters when listing the kind.
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

fn default_query() -> String {
    "true".to_string()
}

impl Default for Selector {
    fn default() -> Self {
        Self {
            query: default_query(),
            params: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConfig {
    /// Expression yielding an array; the rule is applied once per element,
    /// which is visible to the mappings as `.item`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_to_parse: Option<String>,
    pub entity: EntityConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityConfig {
    pub mappings: EntityMappings,
}

/// Field-extraction expressions for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMappings {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub blueprint: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub relations: BTreeMap<String, String>,
}

/// Accepts `query: true` as well as `query: ".a == 1"`.
fn expression_source<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(de::Error::custom(format!(
            "expected an expression string or boolean, got {other}"
        ))),
    }
}

impl PortAppConfig {
    /// Parses a YAML (or JSON) mapping document.
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a mapping document from disk. `.json` files are parsed as JSON,
    /// anything else as YAML.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let config = if is_json {
            let config: Self = serde_json::from_str(&contents)?;
            config.validate()?;
            config
        } else {
            Self::from_yaml_str(&contents)?
        };

        debug!(
            path = %path.display(),
            resources = config.resources.len(),
            "loaded mapping document"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some((index, _)) = self
            .resources
            .iter()
            .enumerate()
            .find(|(_, r)| r.kind.trim().is_empty())
        {
            return Err(Error::Invalid(format!("resource #{index} has an empty kind")));
        }
        if let Some(threshold) = self.entity_deletion_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(Error::Invalid(format!(
                    "entityDeletionThreshold must be between 0 and 1, got {threshold}"
                )));
            }
        }
        Ok(())
    }

    /// Distinct kinds in order of first appearance.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = Vec::new();
        for resource in &self.resources {
            if !kinds.contains(&resource.kind.as_str()) {
                kinds.push(&resource.kind);
            }
        }
        kinds
    }

    /// Every rule declared for `kind`, in document order.
    pub fn rules_for<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a ResourceConfig> + 'a {
        self.resources.iter().filter(move |r| r.kind == kind)
    }

    /// Fetch-error policy of a kind. `abort` on any of its rules wins.
    pub fn on_fetch_error(&self, kind: &str) -> OnFetchError {
        if self
            .rules_for(kind)
            .any(|r| r.on_fetch_error == OnFetchError::Abort)
        {
            OnFetchError::Abort
        } else {
            OnFetchError::Skip
        }
    }

    /// Upstream query parameters for a kind, merged across its rules. Later
    /// rules override earlier ones on conflicting names.
    pub fn query_params(&self, kind: &str) -> BTreeMap<String, Value> {
        let mut params = BTreeMap::new();
        for rule in self.rules_for(kind) {
            params.extend(rule.selector.params.clone());
        }
        params
    }
}
