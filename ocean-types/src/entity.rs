//! Normalized catalog entities.
//!
//! An entity is what the mapper produces from a raw upstream object and what
//! the reconciler writes to the catalog. Within one integration an entity is
//! identified by its blueprint plus its identifier; two entities with the same
//! [`EntityKey`] are the same catalog record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Identity of an entity inside the catalog namespace of an integration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Blueprint (catalog type) of the entity.
    pub blueprint: String,
    /// Unique identifier within the blueprint.
    pub identifier: String,
}

impl EntityKey {
    /// Creates a new entity key.
    pub fn new(blueprint: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            blueprint: blueprint.into(),
            identifier: identifier.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.blueprint, self.identifier)
    }
}

/// A normalized catalog record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Blueprint (catalog type) of the entity.
    pub blueprint: String,
    /// Unique identifier within the blueprint.
    pub identifier: String,
    /// Human readable title, if the mapping produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Property name to value.
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Relation name to related identifier(s), or `null` for an unset relation.
    #[serde(default)]
    pub relations: Map<String, Value>,
}

impl Entity {
    /// Creates an entity with no title, properties or relations.
    pub fn new(blueprint: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            blueprint: blueprint.into(),
            identifier: identifier.into(),
            title: None,
            properties: Map::new(),
            relations: Map::new(),
        }
    }

    /// Returns the identity key of this entity.
    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.blueprint.clone(), self.identifier.clone())
    }

    /// Sets the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Adds a relation.
    #[must_use]
    pub fn with_relation(mut self, name: impl Into<String>, target: Value) -> Self {
        self.relations.insert(name.into(), target);
        self
    }

    /// Returns the identifiers this entity's relations point at, flattened.
    ///
    /// `null` relations contribute nothing; array relations contribute each
    /// string or number element.
    pub fn related_identifiers(&self) -> Vec<String> {
        let mut out = Vec::new();
        for value in self.relations.values() {
            match value {
                Value::String(s) => out.push(s.clone()),
                Value::Number(n) => out.push(n.to_string()),
                Value::Array(items) => {
                    for item in items {
                        match item {
                            Value::String(s) => out.push(s.clone()),
                            Value::Number(n) => out.push(n.to_string()),
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }
}
