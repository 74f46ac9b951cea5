//! Structural and semantic validation of request payloads and query
//! parameters against the JSON:API shape and the resource schema.
//!
//! Structural failures (wrong shape) are payload errors (400) carrying the
//! offending path; semantic failures (unknown type, kind mismatch, missing
//! required attribute) are validation errors (422) carrying violations.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use japi_data::Record;

use crate::document::{RelationshipData, ResourceIdentifier};
use crate::error::{ApiError, Violation};
use crate::query::QueryParams;
use crate::schema::{
    FieldKind, FieldSpec, OperationKind, RelationshipKind, ResourceDefinition, ResourceRegistry,
};

/// The outcome of body validation: typed primary data ready for the
/// relationship processor and the executor.
#[derive(Debug, Clone)]
pub struct ValidatedDocument {
    pub resource_type: String,
    pub id: Option<String>,
    pub attributes: Record,
    pub relationships: BTreeMap<String, RelationshipData>,
}

/// Validate a write body against the operation's shape contract.
pub fn validate_document(
    registry: &ResourceRegistry,
    def: &ResourceDefinition,
    body: Option<&Value>,
    op: OperationKind,
) -> Result<ValidatedDocument, ApiError> {
    let body = body.ok_or_else(|| ApiError::payload("", "a JSON:API document", "no body"))?;
    let data = member(body, "data", "data")?;
    let data = as_object(data, "data")?;

    let type_value = data
        .get("type")
        .ok_or_else(|| ApiError::payload("data.type", "a resource type string", "absent"))?;
    let resource_type = type_value
        .as_str()
        .ok_or_else(|| ApiError::payload("data.type", "a string", kind_name(type_value)))?
        .to_string();

    let mut violations = Vec::new();
    if !registry.contains(&resource_type) {
        violations.push(Violation::new(
            "data.type",
            "unknown_type",
            format!("Unknown resource type: {resource_type}"),
        ));
    } else if resource_type != def.name {
        violations.push(Violation::new(
            "data.type",
            "type_mismatch",
            format!("Expected type {}, received {resource_type}", def.name),
        ));
    }

    let id = match data.get("id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(other) => {
            return Err(ApiError::payload(
                "data.id",
                "a string or number",
                kind_name(other),
            ))
        }
    };
    if id.is_none() && matches!(op, OperationKind::Put | OperationKind::Patch) {
        return Err(ApiError::payload("data.id", "a resource id", "absent"));
    }

    let attributes = match data.get("attributes") {
        None => Record::new(),
        Some(value) => as_object(value, "data.attributes")?.clone(),
    };

    let raw_relationships = match data.get("relationships") {
        None => None,
        Some(value) => Some(as_object(value, "data.relationships")?),
    };

    if op == OperationKind::Patch && data.get("attributes").is_none() && raw_relationships.is_none()
    {
        return Err(ApiError::payload(
            "data",
            "at least one of attributes or relationships",
            "neither",
        ));
    }

    match body.get("included") {
        None => {}
        Some(included) if op == OperationKind::Post => {
            validate_included(registry, included, &mut violations)?;
        }
        Some(_) => {
            return Err(ApiError::payload(
                "included",
                "no included member on this operation",
                "present",
            ));
        }
    }

    let mut relationships = BTreeMap::new();
    if let Some(raw) = raw_relationships {
        for (name, entry) in raw {
            let path = format!("data.relationships.{name}");
            let entry = as_object(entry, &path)?;
            let data = entry
                .get("data")
                .ok_or_else(|| ApiError::payload(format!("{path}.data"), "a data member", "absent"))?;
            let Some(rel) = def.relationship(name) else {
                violations.push(Violation::new(
                    path,
                    "unknown_relationship",
                    format!("No relationship named {name} on {}", def.name),
                ));
                continue;
            };
            let parsed = parse_relationship_data(
                registry,
                data,
                &format!("{path}.data"),
                rel.is_to_many(),
                &mut violations,
            )?;
            if let Some(parsed) = parsed {
                relationships.insert(name.clone(), parsed);
            }
        }
    }

    validate_attributes(def, &attributes, &relationships, op, &mut violations);

    if violations.is_empty() {
        Ok(ValidatedDocument {
            resource_type,
            id,
            attributes,
            relationships,
        })
    } else {
        Err(ApiError::validation(violations))
    }
}

/// Validate collection query parameters: sort keys must be declared
/// sortable.
pub fn validate_query(def: &ResourceDefinition, params: &QueryParams) -> Result<(), ApiError> {
    let violations: Vec<Violation> = params
        .sort
        .iter()
        .filter(|key| !def.search.is_sortable(&key.field))
        .map(|key| {
            Violation::new(
                format!("sort.{}", key.field),
                "not_sortable",
                format!("Field {} is not sortable on {}", key.field, def.name),
            )
        })
        .collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ApiError::validation(violations))
    }
}

/// Validate a relationship-endpoint body: `{ "data": null | identifier |
/// [identifiers] }`, with the cardinality the relationship demands.
pub fn validate_relationship_payload(
    registry: &ResourceRegistry,
    body: Option<&Value>,
    to_many: bool,
) -> Result<RelationshipData, ApiError> {
    let body =
        body.ok_or_else(|| ApiError::payload("", "a relationship document", "no body"))?;
    let data = member(body, "data", "data")?;
    let mut violations = Vec::new();
    let parsed = parse_relationship_data(registry, data, "data", to_many, &mut violations)?;
    match (parsed, violations.is_empty()) {
        (Some(parsed), true) => Ok(parsed),
        (_, _) if !violations.is_empty() => Err(ApiError::validation(violations)),
        _ => Err(ApiError::payload(
            "data",
            "a relationship data member",
            "an unparseable value",
        )),
    }
}

/// Split `fields[type]` values into per-type attribute sets.
pub fn sparse_fields(params: &QueryParams) -> BTreeMap<String, HashSet<String>> {
    params
        .fields
        .iter()
        .map(|(kind, joined)| {
            (
                kind.clone(),
                joined
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            )
        })
        .collect()
}

fn validate_included(
    registry: &ResourceRegistry,
    included: &Value,
    violations: &mut Vec<Violation>,
) -> Result<(), ApiError> {
    let items = included
        .as_array()
        .ok_or_else(|| ApiError::payload("included", "an array", kind_name(included)))?;
    for (index, item) in items.iter().enumerate() {
        let path = format!("included.{index}");
        let obj = as_object(item, &path)?;
        match obj.get("type").and_then(Value::as_str) {
            Some(kind) if registry.contains(kind) => {}
            Some(kind) => violations.push(Violation::new(
                format!("{path}.type"),
                "unknown_type",
                format!("Unknown resource type: {kind}"),
            )),
            None => {
                return Err(ApiError::payload(
                    format!("{path}.type"),
                    "a resource type string",
                    "absent",
                ))
            }
        }
        match obj.get("id") {
            Some(Value::String(_)) | Some(Value::Number(_)) => {}
            _ => violations.push(Violation::new(
                format!("{path}.id"),
                "non_null",
                "Included resources must carry a non-null id",
            )),
        }
    }
    Ok(())
}

/// Parse a relationship `data` member. `path` addresses the data member
/// itself (e.g. `data.relationships.author.data`).
fn parse_relationship_data(
    registry: &ResourceRegistry,
    data: &Value,
    path: &str,
    to_many: bool,
    violations: &mut Vec<Violation>,
) -> Result<Option<RelationshipData>, ApiError> {
    match data {
        Value::Null => Ok(Some(if to_many {
            RelationshipData::Many(Vec::new())
        } else {
            RelationshipData::One(None)
        })),
        Value::Object(_) => {
            if to_many {
                violations.push(Violation::new(
                    path.to_string(),
                    "cardinality",
                    "Expected an identifier array for a to-many relationship",
                ));
                return Ok(None);
            }
            let ident = parse_identifier(registry, data, path, false, violations)?;
            Ok(ident.map(|i| RelationshipData::One(Some(i))))
        }
        Value::Array(items) => {
            if !to_many {
                violations.push(Violation::new(
                    path.to_string(),
                    "cardinality",
                    "Expected a single identifier for a to-one relationship",
                ));
                return Ok(None);
            }
            let mut idents = Vec::with_capacity(items.len());
            let mut complete = true;
            for (index, item) in items.iter().enumerate() {
                match parse_identifier(
                    registry,
                    item,
                    &format!("{path}.{index}"),
                    true,
                    violations,
                )? {
                    Some(ident) => idents.push(ident),
                    None => complete = false,
                }
            }
            Ok(complete.then_some(RelationshipData::Many(idents)))
        }
        other => Err(ApiError::payload(
            path.to_string(),
            "null, an identifier object, or an identifier array",
            kind_name(other),
        )),
    }
}

fn parse_identifier(
    registry: &ResourceRegistry,
    value: &Value,
    path: &str,
    in_array: bool,
    violations: &mut Vec<Violation>,
) -> Result<Option<ResourceIdentifier>, ApiError> {
    let obj = as_object(value, path)?;

    let kind = match obj.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => {
            return Err(ApiError::payload(
                format!("{path}.type"),
                "a resource type string",
                "absent",
            ))
        }
    };
    if !registry.contains(&kind) {
        violations.push(Violation::new(
            format!("{path}.type"),
            "unknown_type",
            format!("Unknown resource type: {kind}"),
        ));
        return Ok(None);
    }

    match obj.get("id") {
        Some(Value::String(s)) => Ok(Some(ResourceIdentifier::new(kind, s.clone()))),
        Some(Value::Number(n)) => Ok(Some(ResourceIdentifier::new(kind, n.to_string()))),
        Some(Value::Null) if !in_array => {
            violations.push(Violation::new(
                format!("{path}.id"),
                "non_null",
                "Relationship identifier id must not be null",
            ));
            Ok(None)
        }
        Some(Value::Null) => {
            violations.push(Violation::new(
                format!("{path}.id"),
                "non_null",
                "Identifier array members must carry a non-null id",
            ));
            Ok(None)
        }
        Some(other) => Err(ApiError::payload(
            format!("{path}.id"),
            "a string or number",
            kind_name(other),
        )),
        None => Err(ApiError::payload(
            format!("{path}.id"),
            "an id member",
            "absent",
        )),
    }
}

fn validate_attributes(
    def: &ResourceDefinition,
    attributes: &Record,
    relationships: &BTreeMap<String, RelationshipData>,
    op: OperationKind,
    violations: &mut Vec<Violation>,
) {
    let hidden = def.hidden_columns();

    for (name, value) in attributes {
        let path = format!("data.attributes.{name}");
        if name == &def.id_field {
            violations.push(Violation::new(
                path,
                "read_only",
                "The id is managed by the server",
            ));
            continue;
        }
        if hidden.contains(name.as_str()) {
            violations.push(Violation::new(
                path,
                "use_relationship",
                format!("{name} is a relationship column; write it via data.relationships"),
            ));
            continue;
        }
        let Some(spec) = def.fields.get(name) else {
            violations.push(Violation::new(
                path,
                "unknown_attribute",
                format!("No attribute named {name} on {}", def.name),
            ));
            continue;
        };
        validate_attribute_value(name, spec, value, &path, violations);
    }

    // Required attributes matter on full writes; a PATCH may omit anything.
    if matches!(op, OperationKind::Post | OperationKind::Put) {
        for (name, spec) in &def.fields {
            if !spec.required || spec.default.is_some() || *name == def.id_field {
                continue;
            }
            let satisfied = match attributes.get(name) {
                Some(value) => !value.is_null(),
                None => fk_provided_by_relationship(def, name, relationships),
            };
            if !satisfied {
                violations.push(Violation::new(
                    format!("data.attributes.{name}"),
                    "required",
                    format!("{name} is required"),
                ));
            }
        }
    }
}

fn fk_provided_by_relationship(
    def: &ResourceDefinition,
    field: &str,
    relationships: &BTreeMap<String, RelationshipData>,
) -> bool {
    def.relationships.iter().any(|rel| match &rel.kind {
        RelationshipKind::BelongsTo { foreign_key, .. } if foreign_key == field => {
            matches!(
                relationships.get(&rel.name),
                Some(RelationshipData::One(Some(_)))
            )
        }
        _ => false,
    })
}

fn validate_attribute_value(
    name: &str,
    spec: &FieldSpec,
    value: &Value,
    path: &str,
    violations: &mut Vec<Violation>,
) {
    if value.is_null() {
        if !spec.nullable {
            violations.push(Violation::new(
                path.to_string(),
                "non_null",
                format!("{name} must not be null"),
            ));
        }
        return;
    }

    let ok = match spec.kind {
        FieldKind::Id | FieldKind::BelongsTo => true,
        FieldKind::String | FieldKind::File => value.is_string(),
        FieldKind::Integer => value.is_i64() || value.is_u64(),
        FieldKind::Number => value.is_number(),
        FieldKind::Boolean => value.is_boolean(),
        FieldKind::Timestamp => value
            .as_str()
            .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok()),
    };
    if !ok {
        violations.push(Violation::new(
            path.to_string(),
            "kind",
            format!("{name} has the wrong kind for {:?}", spec.kind),
        ));
        return;
    }

    if let (Some(max), Some(text)) = (spec.max_length, value.as_str()) {
        if text.chars().count() > max {
            violations.push(Violation::new(
                path.to_string(),
                "max_length",
                format!("{name} exceeds the maximum length of {max}"),
            ));
        }
    }
}

fn member<'a>(value: &'a Value, key: &str, path: &str) -> Result<&'a Value, ApiError> {
    value
        .get(key)
        .ok_or_else(|| ApiError::payload(path, format!("a {key} member"), "absent"))
}

fn as_object<'a>(
    value: &'a Value,
    path: &str,
) -> Result<&'a serde_json::Map<String, Value>, ApiError> {
    value
        .as_object()
        .ok_or_else(|| ApiError::payload(path, "an object", kind_name(value)))
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, RegistryBuilder};
    use serde_json::json;

    fn registry() -> ResourceRegistry {
        RegistryBuilder::new()
            .register(
                ResourceDefinition::new("users").attribute("email", FieldSpec::string()),
            )
            .register(
                ResourceDefinition::new("articles")
                    .attribute("title", FieldSpec::string().required().max(80))
                    .attribute("body", FieldSpec::string())
                    .attribute("views", FieldSpec::integer())
                    .belongs_to("author", "users", "author_id")
                    .many_to_many("tags", "tags", "article_tags", "article_id", "tag_id"),
            )
            .register(ResourceDefinition::new("tags").attribute("label", FieldSpec::string()))
            .freeze()
            .unwrap()
    }

    fn validate(body: Value, op: OperationKind) -> Result<ValidatedDocument, ApiError> {
        let registry = registry();
        let def = registry.get("articles").unwrap().clone();
        validate_document(&registry, &def, Some(&body), op)
    }

    #[test]
    fn accepts_a_well_formed_post() {
        let doc = validate(
            json!({"data": {"type": "articles", "attributes": {"title": "T"},
                "relationships": {"author": {"data": {"type": "users", "id": 7}},
                                   "tags": {"data": [{"type": "tags", "id": "1"}]}}}}),
            OperationKind::Post,
        )
        .unwrap();
        assert_eq!(doc.resource_type, "articles");
        assert_eq!(
            doc.relationships["author"],
            RelationshipData::One(Some(ResourceIdentifier::new("users", "7")))
        );
        assert_eq!(
            doc.relationships["tags"],
            RelationshipData::Many(vec![ResourceIdentifier::new("tags", "1")])
        );
    }

    #[test]
    fn null_identifier_id_has_the_exact_path() {
        let err = validate(
            json!({"data": {"type": "articles", "attributes": {"title": "T"},
                "relationships": {"author": {"data": {"type": "users", "id": null}}}}}),
            OperationKind::Post,
        )
        .unwrap_err();
        assert_eq!(err.status(), http::StatusCode::UNPROCESSABLE_ENTITY);
        let doc = err.to_document();
        assert_eq!(
            doc["errors"][0]["source"]["pointer"],
            "data.relationships.author.data.id"
        );
    }

    #[test]
    fn missing_data_member_is_a_payload_error() {
        let err = validate(json!({"type": "articles"}), OperationKind::Post).unwrap_err();
        assert_eq!(err.status(), http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn relationship_entry_without_data_is_a_payload_error() {
        let err = validate(
            json!({"data": {"type": "articles", "attributes": {"title": "T"},
                "relationships": {"author": {"links": {}}}}}),
            OperationKind::Post,
        )
        .unwrap_err();
        assert_eq!(err.status(), http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn put_requires_id_and_rejects_included() {
        let err = validate(
            json!({"data": {"type": "articles", "attributes": {"title": "T"}}}),
            OperationKind::Put,
        )
        .unwrap_err();
        assert_eq!(err.status(), http::StatusCode::BAD_REQUEST);

        let err = validate(
            json!({"data": {"type": "articles", "id": "1", "attributes": {"title": "T"}},
                "included": []}),
            OperationKind::Put,
        )
        .unwrap_err();
        assert_eq!(err.status(), http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn patch_needs_attributes_or_relationships() {
        let err = validate(
            json!({"data": {"type": "articles", "id": "1"}}),
            OperationKind::Patch,
        )
        .unwrap_err();
        assert_eq!(err.status(), http::StatusCode::BAD_REQUEST);

        validate(
            json!({"data": {"type": "articles", "id": "1",
                "relationships": {"tags": {"data": []}}}}),
            OperationKind::Patch,
        )
        .unwrap();
    }

    #[test]
    fn semantic_checks_collect_violations() {
        let err = validate(
            json!({"data": {"type": "articles", "attributes":
                {"title": null, "views": "many", "bogus": 1}}}),
            OperationKind::Post,
        )
        .unwrap_err();
        let doc = err.to_document();
        let pointers: Vec<String> = doc["errors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["source"]["pointer"].as_str().unwrap().to_string())
            .collect();
        assert!(pointers.contains(&"data.attributes.title".to_string()));
        assert!(pointers.contains(&"data.attributes.views".to_string()));
        assert!(pointers.contains(&"data.attributes.bogus".to_string()));
    }

    #[test]
    fn required_fk_satisfied_via_relationship() {
        let registry = RegistryBuilder::new()
            .register(ResourceDefinition::new("users"))
            .register(
                ResourceDefinition::new("notes")
                    .attribute("author_id", FieldSpec::belongs_to("users").required())
                    .attribute("text", FieldSpec::string()),
            )
            .freeze()
            .unwrap();
        let def = registry.get("notes").unwrap().clone();

        let ok = validate_document(
            &registry,
            &def,
            Some(&json!({"data": {"type": "notes",
                "relationships": {"author": {"data": {"type": "users", "id": "3"}}}}})),
            OperationKind::Post,
        );
        assert!(ok.is_ok());

        let err = validate_document(
            &registry,
            &def,
            Some(&json!({"data": {"type": "notes", "attributes": {"text": "x"}}})),
            OperationKind::Post,
        )
        .unwrap_err();
        assert!(err.to_string().contains("author_id"));
    }

    #[test]
    fn to_one_null_clears_and_to_many_null_empties() {
        let doc = validate(
            json!({"data": {"type": "articles", "id": "1", "relationships": {
                "author": {"data": null}, "tags": {"data": null}}}}),
            OperationKind::Patch,
        )
        .unwrap();
        assert_eq!(doc.relationships["author"], RelationshipData::One(None));
        assert_eq!(doc.relationships["tags"], RelationshipData::Many(vec![]));
    }

    #[test]
    fn unknown_sort_field_fails_query_validation() {
        let registry = registry();
        let def = registry.get("articles").unwrap().clone();
        let params = QueryParams::parse("sort=-bogus");
        let err = validate_query(&def, &params).unwrap_err();
        assert_eq!(err.status(), http::StatusCode::UNPROCESSABLE_ENTITY);
    }
}
