//! JSON:API document shapes: resource objects, identifiers, relationship
//! objects, links, and the top-level compound document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use japi_data::Record;

/// A `(type, id)` pair. Ids are always decimal strings on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

impl ResourceIdentifier {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

/// Linkage inside a relationship object: a to-one identifier (possibly
/// null) or a to-many identifier list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationshipData {
    One(Option<ResourceIdentifier>),
    Many(Vec<ResourceIdentifier>),
}

impl RelationshipData {
    pub fn identifiers(&self) -> Vec<&ResourceIdentifier> {
        match self {
            RelationshipData::One(None) => vec![],
            RelationshipData::One(Some(ident)) => vec![ident],
            RelationshipData::Many(idents) => idents.iter().collect(),
        }
    }
}

/// Links object used at every level; absent members are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Links {
    #[serde(rename = "self", skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<String>,
}

impl Links {
    pub fn self_only(url: impl Into<String>) -> Self {
        Links {
            self_link: Some(url.into()),
            ..Default::default()
        }
    }
}

/// One relationship member of a resource object. `data` is omitted (not
/// `null`) when the linkage was not loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipObject {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<RelationshipData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<Links>,
}

/// A JSON:API resource object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(skip_serializing_if = "Record::is_empty", default)]
    pub attributes: Record,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub relationships: BTreeMap<String, RelationshipObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<Links>,
}

impl ResourceObject {
    pub fn identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier::new(self.kind.clone(), self.id.clone())
    }
}

/// Primary data: single resource (possibly null) or a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryData {
    One(Option<ResourceObject>),
    Many(Vec<ResourceObject>),
    /// Relationship endpoints return bare identifiers.
    Identifiers(RelationshipData),
}

/// A top-level JSON:API document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub data: PrimaryData,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub included: Vec<ResourceObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<Links>,
}

impl Document {
    pub fn one(resource: Option<ResourceObject>) -> Self {
        Document {
            data: PrimaryData::One(resource),
            included: Vec::new(),
            meta: None,
            links: None,
        }
    }

    pub fn many(resources: Vec<ResourceObject>) -> Self {
        Document {
            data: PrimaryData::Many(resources),
            included: Vec::new(),
            meta: None,
            links: None,
        }
    }

    pub fn identifiers(data: RelationshipData) -> Self {
        Document {
            data: PrimaryData::Identifiers(data),
            included: Vec::new(),
            meta: None,
            links: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn relationship_data_serializes_untagged() {
        let one = RelationshipData::One(Some(ResourceIdentifier::new("users", "7")));
        assert_eq!(
            serde_json::to_value(&one).unwrap(),
            json!({"type": "users", "id": "7"})
        );
        let none = RelationshipData::One(None);
        assert_eq!(serde_json::to_value(&none).unwrap(), json!(null));
        let many = RelationshipData::Many(vec![ResourceIdentifier::new("tags", "1")]);
        assert_eq!(
            serde_json::to_value(&many).unwrap(),
            json!([{"type": "tags", "id": "1"}])
        );
    }

    #[test]
    fn empty_members_are_omitted() {
        let doc = Document::one(Some(ResourceObject {
            kind: "articles".into(),
            id: "1".into(),
            attributes: Record::new(),
            relationships: BTreeMap::new(),
            links: None,
        }));
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value, json!({"data": {"type": "articles", "id": "1"}}));
    }

    #[test]
    fn links_self_renames() {
        let links = Links::self_only("/articles/1");
        assert_eq!(
            serde_json::to_value(&links).unwrap(),
            json!({"self": "/articles/1"})
        );
    }
}
