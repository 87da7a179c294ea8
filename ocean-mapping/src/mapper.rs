//! The entity mapper: raw upstream object + rule set → entities.
//!
//! Mapping is pure. Each rule whose selector holds produces one entity or
//! one [`MappingError`]; a failing rule never stops the rules after it, and
//! an object no rule selects maps to nothing at all.

use crate::config::{PortAppConfig, ResourceConfig};
use crate::expr::{is_truthy, ExprError, Expression, ExpressionCompiler, JqCompiler};
use crate::{Error, Result};
use ocean_types::{Entity, EntityKey};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Why a single rule failed for a single object.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MappingFailure {
    #[error("selector failed: {0}")]
    Selector(ExprError),

    #[error("itemsToParse failed: {0}")]
    ItemsToParse(ExprError),

    #[error("itemsToParse must produce an array, got {0}")]
    ItemsNotArray(&'static str),

    #[error("expression for '{field}' failed: {source}")]
    Field { field: String, source: ExprError },

    #[error("identifier must be a non-empty string or a number, got {0}")]
    InvalidIdentifier(String),

    #[error("blueprint must be a non-empty string, got {0}")]
    InvalidBlueprint(String),

    #[error("title must be a string, number or null, got {0}")]
    InvalidTitle(String),

    #[error("relation '{name}' must be an identifier, a list of identifiers or null, got {found}")]
    InvalidRelation { name: String, found: String },
}

/// A rule that failed for one object. Recoverable: the caller logs and
/// counts it, then moves on.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("kind '{kind}' rule #{rule} failed for object {}: {cause}", .object.as_deref().unwrap_or("<unknown>"))]
pub struct MappingError {
    pub kind: String,
    /// Index of the rule among the rules of its kind.
    pub rule: usize,
    /// Best-effort identifier of the raw object (`id`, `identifier` or `key`).
    pub object: Option<String>,
    pub cause: MappingFailure,
}

pub type MappingResult = std::result::Result<Entity, MappingError>;

/// One mapping rule with its expressions compiled.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    kind: String,
    index: usize,
    selector: Arc<dyn Expression>,
    items_to_parse: Option<Arc<dyn Expression>>,
    identifier: Arc<dyn Expression>,
    title: Option<Arc<dyn Expression>>,
    blueprint: Arc<dyn Expression>,
    properties: Vec<(String, Arc<dyn Expression>)>,
    relations: Vec<(String, Arc<dyn Expression>)>,
}

impl CompiledRule {
    pub fn compile(
        resource: &ResourceConfig,
        index: usize,
        compiler: &dyn ExpressionCompiler,
    ) -> Result<Self> {
        let kind = resource.kind.as_str();
        let compile = |field: &str, source: &str| {
            compiler.compile(source).map_err(|source| Error::Expression {
                kind: kind.to_string(),
                rule: index,
                field: field.to_string(),
                source,
            })
        };

        let mappings = &resource.port.entity.mappings;
        let selector = compile("selector.query", resource.selector.query.as_str())?;
        let items_to_parse = resource
            .port
            .items_to_parse
            .as_deref()
            .map(|src| compile("itemsToParse", src))
            .transpose()?;
        let identifier = compile("identifier", mappings.identifier.as_str())?;
        let title = mappings
            .title
            .as_deref()
            .map(|src| compile("title", src))
            .transpose()?;
        let blueprint = compile("blueprint", mappings.blueprint.as_str())?;

        let mut properties = Vec::with_capacity(mappings.properties.len());
        for (name, src) in &mappings.properties {
            properties.push((name.clone(), compile(&format!("properties.{name}"), src.as_str())?));
        }
        let mut relations = Vec::with_capacity(mappings.relations.len());
        for (name, src) in &mappings.relations {
            relations.push((name.clone(), compile(&format!("relations.{name}"), src.as_str())?));
        }

        Ok(Self {
            kind: kind.to_string(),
            index,
            selector,
            items_to_parse,
            identifier,
            title,
            blueprint,
            properties,
            relations,
        })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Applies the rule to one raw object. Returns nothing when the selector
    /// does not hold, one result per item when `itemsToParse` is set, and a
    /// single result otherwise.
    pub fn apply(&self, raw: &Value) -> Vec<MappingResult> {
        let fail = |object: &Value, cause| MappingError {
            kind: self.kind.clone(),
            rule: self.index,
            object: object_hint(object),
            cause,
        };

        match self.selector.evaluate(raw) {
            Ok(selected) if is_truthy(&selected) => {}
            Ok(_) => return Vec::new(),
            Err(e) => return vec![Err(fail(raw, MappingFailure::Selector(e)))],
        }

        let Some(items_expr) = &self.items_to_parse else {
            return vec![self.build(raw).map_err(|cause| fail(raw, cause))];
        };

        let items = match items_expr.evaluate(raw) {
            Ok(Value::Array(items)) => items,
            Ok(other) => {
                return vec![Err(fail(
                    raw,
                    MappingFailure::ItemsNotArray(json_type(&other)),
                ))];
            }
            Err(e) => return vec![Err(fail(raw, MappingFailure::ItemsToParse(e)))],
        };

        items
            .into_iter()
            .map(|item| {
                let context = with_item(raw, item.clone());
                self.build(&context).map_err(|cause| fail(&item, cause))
            })
            .collect()
    }

    /// Resolves the key `reference` maps to from the identifier and
    /// blueprint expressions alone. The selector and all other fields are
    /// skipped, so an object that is gone upstream can still be located by
    /// the id it was known under.
    pub fn resolve_key(&self, reference: &Value) -> std::result::Result<EntityKey, MappingError> {
        self.identifier_of(reference)
            .and_then(|identifier| Ok(EntityKey::new(self.blueprint_of(reference)?, identifier)))
            .map_err(|cause| MappingError {
                kind: self.kind.clone(),
                rule: self.index,
                object: object_hint(reference),
                cause,
            })
    }

    fn identifier_of(&self, input: &Value) -> std::result::Result<String, MappingFailure> {
        match evaluate_field("identifier", &self.identifier, input)? {
            Value::String(s) if !s.trim().is_empty() => Ok(s),
            Value::Number(n) => Ok(number_to_string(&n)),
            other => Err(MappingFailure::InvalidIdentifier(describe(&other))),
        }
    }

    fn blueprint_of(&self, input: &Value) -> std::result::Result<String, MappingFailure> {
        match evaluate_field("blueprint", &self.blueprint, input)? {
            Value::String(s) if !s.trim().is_empty() => Ok(s),
            other => Err(MappingFailure::InvalidBlueprint(describe(&other))),
        }
    }

    fn build(&self, input: &Value) -> std::result::Result<Entity, MappingFailure> {
        let field = |name: &str, expr: &Arc<dyn Expression>| evaluate_field(name, expr, input);

        let identifier = self.identifier_of(input)?;
        let blueprint = self.blueprint_of(input)?;

        let title = match &self.title {
            None => None,
            Some(expr) => match field("title", expr)? {
                Value::Null => None,
                Value::String(s) => Some(s),
                Value::Number(n) => Some(number_to_string(&n)),
                other => return Err(MappingFailure::InvalidTitle(describe(&other))),
            },
        };

        let mut properties = Map::new();
        for (name, expr) in &self.properties {
            properties.insert(name.clone(), field(name.as_str(), expr)?);
        }

        let mut relations = Map::new();
        for (name, expr) in &self.relations {
            let value = normalize_relation(field(name.as_str(), expr)?).map_err(|found| {
                MappingFailure::InvalidRelation {
                    name: name.clone(),
                    found,
                }
            })?;
            relations.insert(name.clone(), value);
        }

        Ok(Entity {
            blueprint,
            identifier,
            title,
            properties,
            relations,
        })
    }
}

/// The compiled rules of one kind, in document order.
#[derive(Debug, Clone)]
pub struct RuleSet {
    kind: String,
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn new(kind: impl Into<String>, rules: Vec<CompiledRule>) -> Self {
        Self {
            kind: kind.into(),
            rules,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Maps one raw object through a rule set.
pub fn map(raw: &Value, rules: &RuleSet) -> Vec<MappingResult> {
    let results: Vec<MappingResult> = rules.rules.iter().flat_map(|rule| rule.apply(raw)).collect();
    if results.is_empty() {
        trace!(kind = %rules.kind, object = ?object_hint(raw), "object matched no rule");
    }
    results
}

/// All compiled rule sets of a mapping document.
#[derive(Debug, Clone)]
pub struct EntityMapper {
    kinds: Vec<String>,
    rule_sets: HashMap<String, RuleSet>,
}

impl EntityMapper {
    /// Compiles every expression of the document with [`JqCompiler`].
    pub fn compile(config: &PortAppConfig) -> Result<Self> {
        Self::compile_with(config, &JqCompiler)
    }

    /// Compiles with a caller-supplied expression engine.
    pub fn compile_with(config: &PortAppConfig, compiler: &dyn ExpressionCompiler) -> Result<Self> {
        let mut kinds = Vec::new();
        let mut rule_sets = HashMap::new();

        for kind in config.kinds() {
            let mut rules = Vec::new();
            for (index, resource) in config.rules_for(kind).enumerate() {
                rules.push(CompiledRule::compile(resource, index, compiler)?);
            }
            kinds.push(kind.to_string());
            rule_sets.insert(kind.to_string(), RuleSet::new(kind, rules));
        }

        Ok(Self { kinds, rule_sets })
    }

    /// Kinds in document order.
    pub fn kinds(&self) -> &[String] {
        &self.kinds
    }

    pub fn rules_for(&self, kind: &str) -> Option<&RuleSet> {
        self.rule_sets.get(kind)
    }

    /// Maps `raw` with the rules of `kind`. Unknown kinds map to nothing.
    pub fn map(&self, kind: &str, raw: &Value) -> Vec<MappingResult> {
        match self.rule_sets.get(kind) {
            Some(rules) => map(raw, rules),
            None => Vec::new(),
        }
    }

    /// The distinct keys every rule of `kind` resolves `reference` to, see
    /// [`CompiledRule::resolve_key`]. Unknown kinds resolve to nothing.
    pub fn resolve_keys(
        &self,
        kind: &str,
        reference: &Value,
    ) -> Vec<std::result::Result<EntityKey, MappingError>> {
        let Some(rules) = self.rule_sets.get(kind) else {
            return Vec::new();
        };
        let mut resolved: Vec<std::result::Result<EntityKey, MappingError>> = Vec::new();
        for result in rules.rules.iter().map(|rule| rule.resolve_key(reference)) {
            let duplicate = matches!(&result, Ok(key) if resolved.iter().any(|r| r.as_ref() == Ok(key)));
            if !duplicate {
                resolved.push(result);
            }
        }
        resolved
    }
}

fn evaluate_field(
    name: &str,
    expr: &Arc<dyn Expression>,
    input: &Value,
) -> std::result::Result<Value, MappingFailure> {
    expr.evaluate(input).map_err(|source| MappingFailure::Field {
        field: name.to_string(),
        source,
    })
}

fn with_item(raw: &Value, item: Value) -> Value {
    let mut context = match raw {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    context.insert("item".to_string(), item);
    Value::Object(context)
}

fn object_hint(object: &Value) -> Option<String> {
    ["id", "identifier", "key"]
        .iter()
        .find_map(|field| match object.get(field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(number_to_string(n)),
            _ => None,
        })
}

/// Renders integral numbers without a fractional part, so `1.0` and `1` give
/// the same identifier.
fn number_to_string(n: &serde_json::Number) -> String {
    if n.is_f64() {
        if let Some(f) = n.as_f64() {
            if f.is_finite() && f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
                return (f as i64).to_string();
            }
        }
    }
    n.to_string()
}

fn normalize_relation(value: Value) -> std::result::Result<Value, String> {
    match value {
        Value::Null | Value::String(_) => Ok(value),
        Value::Number(n) => Ok(Value::String(number_to_string(&n))),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(_) => Ok(item),
                Value::Number(n) => Ok(Value::String(number_to_string(&n))),
                other => Err(describe(&other)),
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Err(describe(&other)),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) if s.trim().is_empty() => "an empty string".to_string(),
        other => json_type(other).to_string(),
    }
}

impl fmt::Display for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} rules)", self.kind, self.rules.len())
    }
}
