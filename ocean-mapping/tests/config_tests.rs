use ocean_mapping::{Error, OnFetchError, PortAppConfig};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::io::Write;

const MAPPING: &str = r#"
deleteDependentEntities: true
resources:
  - kind: issue
    selector:
      query: .status != "archived"
      jql: project = PROJ
      maxResults: 50
    port:
      entity:
        mappings:
          identifier: .key
          title: .fields.summary
          blueprint: '"jiraIssue"'
          properties:
            status: .fields.status.name
          relations:
            project: .fields.project.key
  - kind: project
    onFetchError: abort
    selector:
      query: true
    port:
      entity:
        mappings:
          identifier: .key
          blueprint: '"jiraProject"'
  - kind: issue
    port:
      itemsToParse: .subtasks
      entity:
        mappings:
          identifier: .item.key
          blueprint: '"jiraSubtask"'
"#;

// ── Parsing ───────────────────────────────────────────────────────

#[test]
fn parses_full_document() {
    let config = PortAppConfig::from_yaml_str(MAPPING).unwrap();

    assert_eq!(config.resources.len(), 3);
    assert!(config.delete_dependent_entities);
    assert!(config.create_missing_related_entities);
    assert_eq!(config.entity_deletion_threshold, Some(0.9));

    let issue = &config.resources[0];
    assert_eq!(issue.kind, "issue");
    assert_eq!(issue.selector.query, r#".status != "archived""#);
    assert_eq!(issue.selector.params["jql"], json!("project = PROJ"));
    assert_eq!(issue.selector.params["maxResults"], json!(50));
    assert_eq!(issue.port.entity.mappings.title.as_deref(), Some(".fields.summary"));
    assert_eq!(issue.port.entity.mappings.properties["status"], ".fields.status.name");
    assert_eq!(issue.on_fetch_error, OnFetchError::Skip);
}

#[test]
fn boolean_query_and_missing_selector() {
    let config = PortAppConfig::from_yaml_str(MAPPING).unwrap();
    assert_eq!(config.resources[1].selector.query, "true");
    assert_eq!(config.resources[2].selector.query, "true");
    assert!(config.resources[2].selector.params.is_empty());
    assert_eq!(config.resources[2].port.items_to_parse.as_deref(), Some(".subtasks"));
}

#[test]
fn kinds_keep_first_appearance_order() {
    let config = PortAppConfig::from_yaml_str(MAPPING).unwrap();
    assert_eq!(config.kinds(), vec!["issue", "project"]);
    assert_eq!(config.rules_for("issue").count(), 2);
    assert_eq!(config.rules_for("unknown").count(), 0);
}

#[test]
fn fetch_error_policy_abort_wins() {
    let config = PortAppConfig::from_yaml_str(MAPPING).unwrap();
    assert_eq!(config.on_fetch_error("project"), OnFetchError::Abort);
    assert_eq!(config.on_fetch_error("issue"), OnFetchError::Skip);
}

#[test]
fn query_params_merge_across_rules() {
    let config = PortAppConfig::from_yaml_str(MAPPING).unwrap();
    let params = config.query_params("issue");
    assert_eq!(params.len(), 2);
    assert!(config.query_params("project").is_empty());
}

#[test]
fn deletion_threshold_null_disables_guard() {
    let config = PortAppConfig::from_yaml_str("resources: []\nentityDeletionThreshold: null\n").unwrap();
    assert_eq!(config.entity_deletion_threshold, None);
}

#[test]
fn defaults_for_empty_document() {
    let config = PortAppConfig::from_yaml_str("{}").unwrap();
    assert_eq!(config, PortAppConfig::default());
}

// ── Validation ────────────────────────────────────────────────────

#[test]
fn rejects_threshold_out_of_range() {
    let err = PortAppConfig::from_yaml_str("entityDeletionThreshold: 1.5").unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
}

#[test]
fn rejects_empty_kind() {
    let doc = r#"
resources:
  - kind: " "
    port:
      entity:
        mappings: { identifier: .id, blueprint: '"x"' }
"#;
    assert!(matches!(PortAppConfig::from_yaml_str(doc), Err(Error::Invalid(_))));
}

#[test]
fn rejects_missing_mappings() {
    let doc = "resources:\n  - kind: issue\n    port: {}\n";
    assert!(matches!(PortAppConfig::from_yaml_str(doc), Err(Error::Yaml(_))));
}

#[test]
fn rejects_non_expression_query() {
    let doc = r#"
resources:
  - kind: issue
    selector: { query: [1] }
    port:
      entity:
        mappings: { identifier: .id, blueprint: '"x"' }
"#;
    assert!(PortAppConfig::from_yaml_str(doc).is_err());
}

// ── Files ─────────────────────────────────────────────────────────

#[test]
fn loads_yaml_file() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(MAPPING.as_bytes()).unwrap();

    let config = PortAppConfig::from_path(file.path()).unwrap();
    assert_eq!(config.kinds(), vec!["issue", "project"]);
}

#[test]
fn loads_json_file() {
    let doc = json!({
        "createMissingRelatedEntities": false,
        "resources": [{
            "kind": "service",
            "selector": {"query": ".active"},
            "port": {"entity": {"mappings": {"identifier": ".id", "blueprint": "\"service\""}}}
        }]
    });
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    file.write_all(doc.to_string().as_bytes()).unwrap();

    let config = PortAppConfig::from_path(file.path()).unwrap();
    assert!(!config.create_missing_related_entities);
    assert_eq!(config.resources[0].selector.query, ".active");
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = PortAppConfig::from_path(dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, Error::Io { .. }));
}
