//! Relationship decomposition: turn validated relationship payloads into
//! foreign-key column writes and pivot-table operations.

use serde_json::Value;

use japi_data::Record;

use crate::document::{RelationshipData, ResourceIdentifier};
use crate::error::{ApiError, Violation};
use crate::schema::{RelationshipKind, ResourceDefinition};

/// A deferred pivot-table write, executed after the primary write.
#[derive(Debug, Clone, PartialEq)]
pub struct PivotOp {
    pub relationship: String,
    pub through: String,
    pub local_key: String,
    pub other_key: String,
    pub identifiers: Vec<ResourceIdentifier>,
}

/// The decomposition result: attribute-level foreign-key writes plus
/// pivot operations.
#[derive(Debug, Clone, Default)]
pub struct DecomposedWrite {
    pub foreign_keys: Record,
    pub pivots: Vec<PivotOp>,
}

/// Decompose validated relationship payloads against the schema.
pub fn decompose(
    def: &ResourceDefinition,
    relationships: &std::collections::BTreeMap<String, RelationshipData>,
) -> Result<DecomposedWrite, ApiError> {
    let mut out = DecomposedWrite::default();
    let mut violations = Vec::new();

    for (name, data) in relationships {
        // The validator has already rejected unknown aliases.
        let Some(rel) = def.relationship(name) else {
            continue;
        };
        let path = format!("data.relationships.{name}");

        match (&rel.kind, data) {
            (RelationshipKind::BelongsTo { target, foreign_key }, RelationshipData::One(ident)) => {
                match ident {
                    None => {
                        out.foreign_keys.insert(foreign_key.clone(), Value::Null);
                    }
                    Some(ident) => {
                        if ident.kind != *target {
                            violations.push(Violation::new(
                                format!("{path}.data.type"),
                                "target_mismatch",
                                format!("Expected type {target}, received {}", ident.kind),
                            ));
                            continue;
                        }
                        out.foreign_keys
                            .insert(foreign_key.clone(), Value::String(ident.id.clone()));
                    }
                }
            }
            (
                RelationshipKind::PolymorphicBelongsTo {
                    allowed,
                    type_field,
                    id_field,
                },
                RelationshipData::One(ident),
            ) => match ident {
                None => {
                    out.foreign_keys.insert(type_field.clone(), Value::Null);
                    out.foreign_keys.insert(id_field.clone(), Value::Null);
                }
                Some(ident) => {
                    if !allowed.contains(&ident.kind) {
                        violations.push(Violation::new(
                            format!("{path}.data.type"),
                            "invalid_polymorphic_type",
                            format!(
                                "Type {} is not allowed for {name}; allowed: {}",
                                ident.kind,
                                allowed.join(", ")
                            ),
                        ));
                        continue;
                    }
                    out.foreign_keys
                        .insert(type_field.clone(), Value::String(ident.kind.clone()));
                    out.foreign_keys
                        .insert(id_field.clone(), Value::String(ident.id.clone()));
                }
            },
            (
                RelationshipKind::ManyToMany {
                    target,
                    through,
                    local_key,
                    other_key,
                },
                RelationshipData::Many(idents),
            ) => {
                let mut checked = Vec::with_capacity(idents.len());
                let mut ok = true;
                for (index, ident) in idents.iter().enumerate() {
                    if ident.kind != *target {
                        violations.push(Violation::new(
                            format!("{path}.data.{index}.type"),
                            "target_mismatch",
                            format!("Expected type {target}, received {}", ident.kind),
                        ));
                        ok = false;
                        continue;
                    }
                    checked.push(ident.clone());
                }
                if ok {
                    out.pivots.push(PivotOp {
                        relationship: name.clone(),
                        through: through.clone(),
                        local_key: local_key.clone(),
                        other_key: other_key.clone(),
                        identifiers: checked,
                    });
                }
            }
            (RelationshipKind::HasMany { .. }, _)
            | (RelationshipKind::ReversePolymorphic { .. }, _) => {
                violations.push(Violation::new(
                    path,
                    "not_writable",
                    format!(
                        "{name} is maintained from the related side; use the relationship endpoints"
                    ),
                ));
            }
            // Cardinality mismatches are caught by the validator; anything
            // that slips through is a defect in the caller.
            (_, _) => {
                violations.push(Violation::new(
                    path,
                    "cardinality",
                    "Relationship payload cardinality does not match the schema",
                ));
            }
        }
    }

    if violations.is_empty() {
        Ok(out)
    } else {
        Err(ApiError::validation(violations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::RelationshipData;
    use std::collections::BTreeMap;

    fn comments() -> ResourceDefinition {
        ResourceDefinition::new("comments")
            .belongs_to("author", "users", "author_id")
            .polymorphic_belongs_to(
                "commentable",
                ["articles", "videos"],
                "commentable_type",
                "commentable_id",
            )
            .many_to_many("tags", "tags", "comment_tags", "comment_id", "tag_id")
            .has_many("replies", "comments", "parent_id")
    }

    fn rels(
        entries: Vec<(&str, RelationshipData)>,
    ) -> BTreeMap<String, RelationshipData> {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn belongs_to_writes_the_foreign_key() {
        let out = decompose(
            &comments(),
            &rels(vec![(
                "author",
                RelationshipData::One(Some(ResourceIdentifier::new("users", "7"))),
            )]),
        )
        .unwrap();
        assert_eq!(out.foreign_keys.get("author_id"), Some(&"7".into()));
        assert!(out.pivots.is_empty());
    }

    #[test]
    fn null_to_one_clears_both_polymorphic_columns() {
        let out = decompose(
            &comments(),
            &rels(vec![
                ("author", RelationshipData::One(None)),
                ("commentable", RelationshipData::One(None)),
            ]),
        )
        .unwrap();
        assert_eq!(out.foreign_keys.get("author_id"), Some(&Value::Null));
        assert_eq!(out.foreign_keys.get("commentable_type"), Some(&Value::Null));
        assert_eq!(out.foreign_keys.get("commentable_id"), Some(&Value::Null));
    }

    #[test]
    fn polymorphic_writes_type_and_id() {
        let out = decompose(
            &comments(),
            &rels(vec![(
                "commentable",
                RelationshipData::One(Some(ResourceIdentifier::new("videos", "9"))),
            )]),
        )
        .unwrap();
        assert_eq!(out.foreign_keys.get("commentable_type"), Some(&"videos".into()));
        assert_eq!(out.foreign_keys.get("commentable_id"), Some(&"9".into()));
    }

    #[test]
    fn disallowed_polymorphic_type_is_a_violation_with_path() {
        let err = decompose(
            &comments(),
            &rels(vec![(
                "commentable",
                RelationshipData::One(Some(ResourceIdentifier::new("users", "1"))),
            )]),
        )
        .unwrap_err();
        let doc = err.to_document();
        assert_eq!(
            doc["errors"][0]["source"]["pointer"],
            "data.relationships.commentable.data.type"
        );
    }

    #[test]
    fn many_to_many_captures_identifiers_verbatim() {
        let out = decompose(
            &comments(),
            &rels(vec![(
                "tags",
                RelationshipData::Many(vec![
                    ResourceIdentifier::new("tags", "1"),
                    ResourceIdentifier::new("tags", "2"),
                ]),
            )]),
        )
        .unwrap();
        assert_eq!(out.pivots.len(), 1);
        let pivot = &out.pivots[0];
        assert_eq!(pivot.through, "comment_tags");
        assert_eq!(pivot.identifiers.len(), 2);
    }

    #[test]
    fn plain_has_many_is_not_writable() {
        let err = decompose(
            &comments(),
            &rels(vec![("replies", RelationshipData::Many(vec![]))]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("replies"));
    }
}
