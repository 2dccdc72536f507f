use super::*;
use serde_json::json;

fn service(id: &str) -> Entity {
    let mut entity = Entity::new(id, "service");
    entity.title = Some(id.to_uppercase());
    entity.datasource = Some("github/prod".to_string());
    entity.properties.insert("language".to_string(), json!("rust"));
    entity
        .relations
        .insert("owner".to_string(), RelationTarget::One("team-a".to_string()));
    entity
}

#[test]
fn test_identical_entities_have_no_changes() {
    assert!(!service("api").has_mapped_changes(&service("api")));
}

#[test]
fn test_title_change_detected() {
    let mut changed = service("api");
    changed.title = Some("New title".to_string());
    assert!(changed.has_mapped_changes(&service("api")));
}

#[test]
fn test_relation_change_detected() {
    let mut changed = service("api");
    changed
        .relations
        .insert("owner".to_string(), RelationTarget::One("team-b".to_string()));
    assert!(changed.has_mapped_changes(&service("api")));
}

#[test]
fn test_null_property_equals_absent_property() {
    let mut with_null = service("api");
    with_null
        .properties
        .insert("description".to_string(), Value::Null);
    assert!(!with_null.has_mapped_changes(&service("api")));
}

#[test]
fn test_datasource_not_compared() {
    let mut other = service("api");
    other.datasource = None;
    assert!(!service("api").has_mapped_changes(&other));
}

#[test]
fn test_relation_target_serde_shapes() {
    let one: RelationTarget = serde_json::from_value(json!("team-a")).unwrap();
    assert_eq!(one, RelationTarget::One("team-a".to_string()));
    let many: RelationTarget = serde_json::from_value(json!(["a", "b"])).unwrap();
    assert_eq!(many.identifiers(), vec!["a", "b"]);
}

#[test]
fn test_relation_retain() {
    let one = RelationTarget::One("x".to_string());
    assert_eq!(one.retain(|_| false), None);
    let many = RelationTarget::Many(vec!["a".into(), "b".into()]);
    assert_eq!(
        many.retain(|id| id == "b"),
        Some(RelationTarget::Many(vec!["b".into()]))
    );
}

#[test]
fn test_placeholder_drops_relations_only() {
    let placeholder = service("api").placeholder();
    assert!(placeholder.relations.is_empty());
    assert_eq!(placeholder.title.as_deref(), Some("API"));
    assert_eq!(placeholder.properties["language"], json!("rust"));
}

#[test]
fn test_entity_serialization_skips_empty_optionals() {
    let value = serde_json::to_value(Entity::stub(&EntityRef::new("team", "team-a"))).unwrap();
    assert_eq!(
        value,
        json!({"identifier": "team-a", "blueprint": "team", "properties": {}, "relations": {}})
    );
}

#[test]
fn test_refs_and_scopes_display() {
    assert_eq!(EntityRef::new("service", "api").to_string(), "service/api");
    assert_eq!(EntityScope::new("github/prod", "repository").to_string(), "github/prod:repository");
}
