//! Compound document assembly: resource objects with linkage and links,
//! deduplicated `included`, pagination meta and links.

use std::collections::{BTreeMap, HashSet};

use serde_json::json;

use japi_data::{id_string, record_id, PaginationMeta, Record};

use crate::document::{
    Document, Links, PrimaryData, RelationshipData, RelationshipObject, ResourceIdentifier,
    ResourceObject,
};
use crate::include::{IncludeOutput, LinkageKey};
use crate::schema::{RelationshipKind, ResourceDefinition, ResourceRegistry};

/// Builds JSON:API documents for one request.
pub struct Assembler<'a> {
    pub registry: &'a ResourceRegistry,
    /// Transport-supplied prefix; takes precedence over each resource's
    /// declared base path.
    pub url_prefix_override: Option<&'a str>,
    /// Per-type sparse fieldsets from `fields[type]`.
    pub sparse: BTreeMap<String, HashSet<String>>,
}

impl<'a> Assembler<'a> {
    pub fn new(registry: &'a ResourceRegistry) -> Self {
        Self {
            registry,
            url_prefix_override: None,
            sparse: BTreeMap::new(),
        }
    }

    pub fn with_url_prefix(mut self, prefix: Option<&'a str>) -> Self {
        self.url_prefix_override = prefix;
        self
    }

    pub fn with_sparse(mut self, sparse: BTreeMap<String, HashSet<String>>) -> Self {
        self.sparse = sparse;
        self
    }

    fn prefix_for<'b>(&self, def: &'b ResourceDefinition) -> &'b str
    where
        'a: 'b,
    {
        self.url_prefix_override
            .or(def.base_path.as_deref())
            .unwrap_or("")
    }

    fn resource_url(&self, def: &ResourceDefinition, id: &str) -> String {
        format!("{}/{}/{id}", self.prefix_for(def), def.name)
    }

    /// Serialize one record as a resource object: id stringified, hidden
    /// columns stripped, sparse fieldset applied, every declared
    /// relationship present with links.
    pub fn resource_object(
        &self,
        def: &ResourceDefinition,
        record: &Record,
        linkage: Option<&IncludeOutput>,
    ) -> ResourceObject {
        let id = record_id(record, &def.id_field).unwrap_or_default();
        let hidden = def.hidden_columns();
        let fieldset = self.sparse.get(&def.name);

        let attributes: Record = record
            .iter()
            .filter(|(name, _)| !hidden.contains(name.as_str()))
            .filter(|(name, _)| fieldset.is_none_or(|set| set.contains(name.as_str())))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let mut relationships = BTreeMap::new();
        for rel in &def.relationships {
            let key = LinkageKey::new(&def.name, &id, &rel.name);
            let data = match linkage.and_then(|out| out.linkage.get(&key)) {
                Some(data) => Some(data.clone()),
                None => self.derive_linkage(def, rel.name.as_str(), record),
            };
            let self_url = self.resource_url(def, &id);
            relationships.insert(
                rel.name.clone(),
                RelationshipObject {
                    data,
                    links: Some(Links {
                        self_link: Some(format!("{self_url}/relationships/{}", rel.name)),
                        related: Some(format!("{self_url}/{}", rel.name)),
                        ..Default::default()
                    }),
                },
            );
        }

        ResourceObject {
            kind: def.name.clone(),
            id: id.clone(),
            attributes,
            relationships,
            links: Some(Links::self_only(self.resource_url(def, &id))),
        }
    }

    /// Linkage derivable without a load: belongsTo and polymorphic
    /// identifiers come straight from the record's columns. To-many
    /// relationships stay links-only until the include engine ran.
    fn derive_linkage(
        &self,
        def: &ResourceDefinition,
        rel_name: &str,
        record: &Record,
    ) -> Option<RelationshipData> {
        match &def.relationship(rel_name)?.kind {
            RelationshipKind::BelongsTo {
                target,
                foreign_key,
            } => Some(RelationshipData::One(
                record
                    .get(foreign_key)
                    .and_then(id_string)
                    .map(|fk| ResourceIdentifier::new(target.clone(), fk)),
            )),
            RelationshipKind::PolymorphicBelongsTo {
                allowed,
                type_field,
                id_field,
            } => {
                let kind = record.get(type_field).and_then(|v| v.as_str());
                let target_id = record.get(id_field).and_then(id_string);
                Some(RelationshipData::One(match (kind, target_id) {
                    (Some(kind), Some(target_id)) if allowed.iter().any(|a| a == kind) => {
                        Some(ResourceIdentifier::new(kind, target_id))
                    }
                    _ => None,
                }))
            }
            _ => None,
        }
    }

    fn included_objects(&self, output: &IncludeOutput) -> Vec<ResourceObject> {
        // The linkage map is keyed by (type, id, relationship), so nested
        // linkage lands on included resources the same way as on primaries.
        output
            .included
            .iter()
            .map(|(def, record)| self.resource_object(def, record, Some(output)))
            .collect()
    }

    /// A single-resource document with optional includes.
    pub fn single(
        &self,
        def: &ResourceDefinition,
        record: &Record,
        includes: Option<&IncludeOutput>,
    ) -> Document {
        let mut doc = Document::one(Some(self.resource_object(def, record, includes)));
        if let Some(output) = includes {
            doc.included = self.included_objects(output);
        }
        let id = record_id(record, &def.id_field).unwrap_or_default();
        doc.links = Some(Links::self_only(self.resource_url(def, &id)));
        doc
    }

    /// A collection document with optional includes and pagination.
    pub fn collection(
        &self,
        def: &ResourceDefinition,
        records: &[Record],
        includes: Option<&IncludeOutput>,
        pagination: Option<&PaginationMeta>,
    ) -> Document {
        let resources = records
            .iter()
            .map(|record| self.resource_object(def, record, includes))
            .collect();
        let mut doc = Document::many(resources);
        if let Some(output) = includes {
            doc.included = self.included_objects(output);
        }

        let base = format!("{}/{}", self.prefix_for(def), def.name);
        let mut links = Links {
            self_link: Some(base.clone()),
            ..Default::default()
        };
        if let Some(meta) = pagination {
            doc.meta = Some(json!({
                "pagination": {
                    "page": meta.page,
                    "pageSize": meta.page_size,
                    "pageCount": meta.page_count,
                    "total": meta.total,
                }
            }));
            let page_url =
                |n: u64| format!("{base}?page%5Bnumber%5D={n}&page%5Bsize%5D={}", meta.page_size);
            links.first = Some(page_url(1));
            links.last = Some(page_url(meta.page_count.max(1)));
            if meta.has_prev() {
                links.prev = Some(page_url(meta.page - 1));
            }
            if meta.has_next() {
                links.next = Some(page_url(meta.page + 1));
            }
        }
        doc.links = Some(links);
        doc
    }

    /// An identifiers-only document for `GET …/relationships/{rel}`.
    pub fn identifiers(
        &self,
        def: &ResourceDefinition,
        id: &str,
        rel_name: &str,
        data: RelationshipData,
    ) -> Document {
        let self_url = self.resource_url(def, id);
        let mut doc = Document::identifiers(data);
        doc.links = Some(Links {
            self_link: Some(format!("{self_url}/relationships/{rel_name}")),
            related: Some(format!("{self_url}/{rel_name}")),
            ..Default::default()
        });
        doc
    }
}

/// Serialize a document to its wire form.
pub fn to_value(document: &Document) -> serde_json::Value {
    serde_json::to_value(document).unwrap_or_else(|_| json!({ "data": null }))
}

/// Convenience: extract the primary data array/object for assertions.
pub fn primary_len(document: &Document) -> usize {
    match &document.data {
        PrimaryData::One(None) => 0,
        PrimaryData::One(Some(_)) => 1,
        PrimaryData::Many(items) => items.len(),
        PrimaryData::Identifiers(data) => data.identifiers().len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, RegistryBuilder};
    use serde_json::json;

    fn registry() -> ResourceRegistry {
        RegistryBuilder::new()
            .register(ResourceDefinition::new("users").attribute("name", FieldSpec::string()))
            .register(
                ResourceDefinition::new("articles")
                    .attribute("title", FieldSpec::string())
                    .attribute("body", FieldSpec::string())
                    .belongs_to("author", "users", "author_id")
                    .has_many("comments", "comments", "article_id"),
            )
            .register(
                ResourceDefinition::new("comments")
                    .attribute("body", FieldSpec::string())
                    .belongs_to("article", "articles", "article_id"),
            )
            .freeze()
            .unwrap()
    }

    fn record(pairs: &[(&str, serde_json::Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn ids_are_stringified_and_fks_stripped() {
        let registry = registry();
        let def = registry.get("articles").unwrap();
        let assembler = Assembler::new(&registry);
        let object = assembler.resource_object(
            def,
            &record(&[
                ("id", json!(1)),
                ("title", json!("T")),
                ("author_id", json!(7)),
            ]),
            None,
        );
        assert_eq!(object.id, "1");
        assert!(!object.attributes.contains_key("author_id"));
        assert!(!object.attributes.contains_key("id"));
        assert_eq!(
            object.relationships["author"].data,
            Some(RelationshipData::One(Some(ResourceIdentifier::new(
                "users", "7"
            ))))
        );
        // Unloaded to-many: links only.
        assert_eq!(object.relationships["comments"].data, None);
        assert_eq!(
            object.relationships["comments"]
                .links
                .as_ref()
                .unwrap()
                .related
                .as_deref(),
            Some("/articles/1/comments")
        );
    }

    #[test]
    fn sparse_fieldsets_limit_attributes() {
        let registry = registry();
        let def = registry.get("articles").unwrap();
        let mut sparse = BTreeMap::new();
        sparse.insert(
            "articles".to_string(),
            HashSet::from(["title".to_string()]),
        );
        let assembler = Assembler::new(&registry).with_sparse(sparse);
        let object = assembler.resource_object(
            def,
            &record(&[("id", json!(1)), ("title", json!("T")), ("body", json!("B"))]),
            None,
        );
        assert!(object.attributes.contains_key("title"));
        assert!(!object.attributes.contains_key("body"));
    }

    #[test]
    fn url_prefix_override_wins_over_base_path() {
        let registry = RegistryBuilder::new()
            .register(ResourceDefinition::new("articles").base_path("/api/v1"))
            .freeze()
            .unwrap();
        let def = registry.get("articles").unwrap();

        let declared = Assembler::new(&registry);
        let object = declared.resource_object(def, &record(&[("id", json!(1))]), None);
        assert_eq!(
            object.links.unwrap().self_link.as_deref(),
            Some("/api/v1/articles/1")
        );

        let overridden = Assembler::new(&registry).with_url_prefix(Some("/tenant/acme"));
        let object = overridden.resource_object(def, &record(&[("id", json!(1))]), None);
        assert_eq!(
            object.links.unwrap().self_link.as_deref(),
            Some("/tenant/acme/articles/1")
        );
    }

    #[test]
    fn pagination_meta_and_links_render() {
        let registry = registry();
        let def = registry.get("articles").unwrap();
        let assembler = Assembler::new(&registry);
        let meta = PaginationMeta::new(2, 10, 35);
        let doc = assembler.collection(def, &[], None, Some(&meta));
        assert_eq!(doc.meta.as_ref().unwrap()["pagination"]["pageCount"], 4);
        let links = doc.links.unwrap();
        assert!(links.prev.unwrap().contains("page%5Bnumber%5D=1"));
        assert!(links.next.unwrap().contains("page%5Bnumber%5D=3"));
        assert!(links.last.unwrap().contains("page%5Bnumber%5D=4"));
    }
}
