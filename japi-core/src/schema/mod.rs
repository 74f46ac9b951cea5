//! Resource definitions and the frozen registry.
//!
//! Definitions are assembled with fluent builder methods and handed to a
//! [`RegistryBuilder`]; `freeze()` validates the topology (alias uniqueness,
//! foreign-key/alias bijection, known relationship targets, ownership field
//! injection) and produces an immutable [`ResourceRegistry`] that request
//! workers read without coordination.

pub mod search;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use japi_data::{CompareOp, SortKey};

use crate::error::ApiError;
use search::{FilterKind, RecordPredicate, SearchField, SearchSchema};

/// The kind of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Id,
    String,
    Integer,
    Number,
    Boolean,
    Timestamp,
    File,
    BelongsTo,
}

/// Per-field schema: kind plus constraints. Relationship kinds additionally
/// carry the target resource and the exposed alias.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub required: bool,
    pub nullable: bool,
    pub max_length: Option<usize>,
    pub default: Option<Value>,
    /// Target resource, for `BelongsTo` fields.
    pub target: Option<String>,
    /// Exposed relationship alias, for `BelongsTo` fields.
    pub alias: Option<String>,
}

impl FieldSpec {
    fn of(kind: FieldKind) -> Self {
        Self {
            kind,
            required: false,
            nullable: true,
            max_length: None,
            default: None,
            target: None,
            alias: None,
        }
    }

    pub fn id() -> Self {
        Self::of(FieldKind::Id)
    }

    pub fn string() -> Self {
        Self::of(FieldKind::String)
    }

    pub fn integer() -> Self {
        Self::of(FieldKind::Integer)
    }

    pub fn number() -> Self {
        Self::of(FieldKind::Number)
    }

    pub fn boolean() -> Self {
        Self::of(FieldKind::Boolean)
    }

    pub fn timestamp() -> Self {
        Self::of(FieldKind::Timestamp)
    }

    pub fn file() -> Self {
        Self::of(FieldKind::File)
    }

    /// A foreign-key field exposed as a relationship. The alias defaults to
    /// the field name with a trailing `_id` stripped; override with
    /// [`aliased`](Self::aliased).
    pub fn belongs_to(target: impl Into<String>) -> Self {
        let mut spec = Self::of(FieldKind::BelongsTo);
        spec.target = Some(target.into());
        spec
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self.nullable = false;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn max(mut self, length: usize) -> Self {
        self.max_length = Some(length);
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn aliased(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

/// Per-parent cap for to-many includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncludeLimit {
    /// Demand at most `n` related records per parent. Requires the backend's
    /// `window_functions` capability.
    Limit(u64),
    /// Explicitly disable any cap, including engine-wide defaults.
    Unlimited,
}

/// The relationship topology, dispatched by variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationshipKind {
    /// Foreign key on this resource pointing at `target`.
    BelongsTo { target: String, foreign_key: String },
    /// Foreign key on `target` pointing back at this resource.
    HasMany { target: String, foreign_key: String },
    /// Pivot table `through` carrying `(local_key, other_key)`.
    ManyToMany {
        target: String,
        through: String,
        local_key: String,
        other_key: String,
    },
    /// Type/id column pair on this resource; target varies per record.
    PolymorphicBelongsTo {
        allowed: Vec<String>,
        type_field: String,
        id_field: String,
    },
    /// The many side of a `PolymorphicBelongsTo` declared on `target` as
    /// the relationship named `via`.
    ReversePolymorphic { target: String, via: String },
}

/// A named relationship on a resource.
#[derive(Debug, Clone)]
pub struct RelationshipSpec {
    pub name: String,
    pub kind: RelationshipKind,
    /// Per-parent include cap (to-many kinds only).
    pub limit: Option<IncludeLimit>,
    /// Include ordering; defaults to `id ASC` when empty.
    pub order_by: Vec<SortKey>,
}

impl RelationshipSpec {
    pub fn is_to_many(&self) -> bool {
        matches!(
            self.kind,
            RelationshipKind::HasMany { .. }
                | RelationshipKind::ManyToMany { .. }
                | RelationshipKind::ReversePolymorphic { .. }
        )
    }
}

/// Operation kinds auth rules are declared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Query,
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Get => "get",
            OperationKind::Post => "post",
            OperationKind::Put => "put",
            OperationKind::Patch => "patch",
            OperationKind::Delete => "delete",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            OperationKind::Post | OperationKind::Put | OperationKind::Patch | OperationKind::Delete
        )
    }
}

/// One authorization rule: a checker name with an optional parameter
/// (`"owns"`, `"role:admin"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRule {
    pub name: String,
    pub param: Option<String>,
}

impl AuthRule {
    pub fn parse(expr: &str) -> Self {
        match expr.split_once(':') {
            Some((name, param)) => Self {
                name: name.to_string(),
                param: Some(param.to_string()),
            },
            None => Self {
                name: expr.to_string(),
                param: None,
            },
        }
    }
}

impl std::fmt::Display for AuthRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.param {
            Some(param) => write!(f, "{}:{param}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Ownership posture of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ownership {
    /// The owner field is enforced and injected into the schema if absent.
    Always,
    /// No ownership semantics.
    #[default]
    Never,
    /// Enforced when the owner field exists in the schema, skipped otherwise.
    Auto,
}

/// A resource definition. Built fluently, validated at registry freeze.
#[derive(Debug, Clone)]
pub struct ResourceDefinition {
    pub name: String,
    pub id_field: String,
    pub fields: BTreeMap<String, FieldSpec>,
    pub relationships: Vec<RelationshipSpec>,
    pub auth_rules: HashMap<OperationKind, Vec<AuthRule>>,
    pub ownership: Ownership,
    pub owner_field: String,
    pub search: SearchSchema,
    pub base_path: Option<String>,
    pub timestamps: bool,
}

impl ResourceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), FieldSpec::id());
        Self {
            name: name.into(),
            id_field: "id".to_string(),
            fields,
            relationships: Vec::new(),
            auth_rules: HashMap::new(),
            ownership: Ownership::default(),
            owner_field: "user_id".to_string(),
            search: SearchSchema::default(),
            base_path: None,
            timestamps: false,
        }
    }

    pub fn id_field(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.fields.remove(&self.id_field);
        self.fields.insert(name.clone(), FieldSpec::id());
        self.id_field = name;
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn belongs_to(
        mut self,
        alias: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        let foreign_key = foreign_key.into();
        let target = target.into();
        self.fields.insert(
            foreign_key.clone(),
            FieldSpec::belongs_to(target.clone()),
        );
        self.relationships.push(RelationshipSpec {
            name: alias.into(),
            kind: RelationshipKind::BelongsTo {
                target,
                foreign_key,
            },
            limit: None,
            order_by: Vec::new(),
        });
        self
    }

    pub fn has_many(
        mut self,
        alias: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.relationships.push(RelationshipSpec {
            name: alias.into(),
            kind: RelationshipKind::HasMany {
                target: target.into(),
                foreign_key: foreign_key.into(),
            },
            limit: None,
            order_by: Vec::new(),
        });
        self
    }

    pub fn many_to_many(
        mut self,
        alias: impl Into<String>,
        target: impl Into<String>,
        through: impl Into<String>,
        local_key: impl Into<String>,
        other_key: impl Into<String>,
    ) -> Self {
        self.relationships.push(RelationshipSpec {
            name: alias.into(),
            kind: RelationshipKind::ManyToMany {
                target: target.into(),
                through: through.into(),
                local_key: local_key.into(),
                other_key: other_key.into(),
            },
            limit: None,
            order_by: Vec::new(),
        });
        self
    }

    pub fn polymorphic_belongs_to<I, S>(
        mut self,
        alias: impl Into<String>,
        allowed: I,
        type_field: impl Into<String>,
        id_field: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relationships.push(RelationshipSpec {
            name: alias.into(),
            kind: RelationshipKind::PolymorphicBelongsTo {
                allowed: allowed.into_iter().map(Into::into).collect(),
                type_field: type_field.into(),
                id_field: id_field.into(),
            },
            limit: None,
            order_by: Vec::new(),
        });
        self
    }

    pub fn reverse_polymorphic(
        mut self,
        alias: impl Into<String>,
        target: impl Into<String>,
        via: impl Into<String>,
    ) -> Self {
        self.relationships.push(RelationshipSpec {
            name: alias.into(),
            kind: RelationshipKind::ReversePolymorphic {
                target: target.into(),
                via: via.into(),
            },
            limit: None,
            order_by: Vec::new(),
        });
        self
    }

    /// Cap a to-many relationship's include expansion per parent.
    pub fn include_limit(mut self, alias: &str, limit: IncludeLimit) -> Self {
        if let Some(rel) = self.relationships.iter_mut().find(|r| r.name == alias) {
            rel.limit = Some(limit);
        }
        self
    }

    /// Set the include ordering of a to-many relationship.
    pub fn include_order(mut self, alias: &str, order_by: Vec<SortKey>) -> Self {
        if let Some(rel) = self.relationships.iter_mut().find(|r| r.name == alias) {
            rel.order_by = order_by;
        }
        self
    }

    /// Declare the rule set for one operation, replacing any prior set.
    pub fn rules<'a, I>(mut self, op: OperationKind, rules: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.auth_rules
            .insert(op, rules.into_iter().map(AuthRule::parse).collect());
        self
    }

    pub fn ownership(mut self, ownership: Ownership) -> Self {
        self.ownership = ownership;
        self
    }

    pub fn owner_field(mut self, field: impl Into<String>) -> Self {
        self.owner_field = field.into();
        self
    }

    /// Declare a filterable field with the given operator, searchable under
    /// its own name.
    pub fn filterable(mut self, name: impl Into<String>, op: CompareOp) -> Self {
        let name = name.into();
        self.search.fields.insert(
            name.clone(),
            SearchField {
                field: name,
                kind: FilterKind::Op(op),
                sortable: false,
            },
        );
        self
    }

    /// Declare a filter whose public name differs from the stored column.
    pub fn filterable_as(
        mut self,
        name: impl Into<String>,
        field: impl Into<String>,
        op: CompareOp,
    ) -> Self {
        self.search.fields.insert(
            name.into(),
            SearchField {
                field: field.into(),
                kind: FilterKind::Op(op),
                sortable: false,
            },
        );
        self
    }

    /// Declare a custom filter. Without an in-memory predicate it is
    /// SQL-only and cannot back realtime subscriptions.
    pub fn custom_filter(
        mut self,
        name: impl Into<String>,
        filter_record: Option<RecordPredicate>,
    ) -> Self {
        let name = name.into();
        self.search.fields.insert(
            name.clone(),
            SearchField {
                field: name,
                kind: FilterKind::Custom { filter_record },
                sortable: false,
            },
        );
        self
    }

    /// Mark a field sortable (and filterable with equality if not already
    /// declared).
    pub fn sortable(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.search
            .fields
            .entry(name.clone())
            .or_insert(SearchField {
                field: name,
                kind: FilterKind::Op(CompareOp::Eq),
                sortable: true,
            })
            .sortable = true;
        self
    }

    /// Maintain `created_at` / `updated_at` on writes.
    pub fn timestamps(mut self) -> Self {
        self.timestamps = true;
        self.fields
            .entry("created_at".to_string())
            .or_insert_with(FieldSpec::timestamp);
        self.fields
            .entry("updated_at".to_string())
            .or_insert_with(FieldSpec::timestamp);
        self
    }

    pub fn base_path(mut self, path: impl Into<String>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Look up a relationship by alias.
    ///
    /// Linear scan — resources have a handful of relationships.
    pub fn relationship(&self, alias: &str) -> Option<&RelationshipSpec> {
        self.relationships.iter().find(|r| r.name == alias)
    }

    /// The rule set declared for an operation; `None` means denial.
    pub fn rules_for(&self, op: OperationKind) -> Option<&[AuthRule]> {
        self.auth_rules.get(&op).map(|v| v.as_slice())
    }

    /// Whether the owner field is declared on this resource's schema.
    pub fn has_owner_field(&self) -> bool {
        self.owner_field == self.id_field || self.fields.contains_key(&self.owner_field)
    }

    /// Columns never surfaced as attributes: the id, belongsTo foreign
    /// keys, and polymorphic discriminator/id column pairs.
    pub fn hidden_columns(&self) -> HashSet<&str> {
        let mut hidden: HashSet<&str> = HashSet::new();
        hidden.insert(self.id_field.as_str());
        for rel in &self.relationships {
            match &rel.kind {
                RelationshipKind::BelongsTo { foreign_key, .. } => {
                    hidden.insert(foreign_key.as_str());
                }
                RelationshipKind::PolymorphicBelongsTo {
                    type_field,
                    id_field,
                    ..
                } => {
                    hidden.insert(type_field.as_str());
                    hidden.insert(id_field.as_str());
                }
                _ => {}
            }
        }
        hidden
    }
}

/// Errors detected at registry freeze. These are configuration bugs, not
/// request-time failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    DuplicateResource(String),
    DuplicateAlias { resource: String, alias: String },
    ForeignKeyAliasConflict { resource: String, foreign_key: String },
    UnknownTarget { resource: String, alias: String, target: String },
    InvalidReverse { resource: String, alias: String, reason: String },
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaError::DuplicateResource(name) => {
                write!(f, "Resource registered twice: {name}")
            }
            SchemaError::DuplicateAlias { resource, alias } => {
                write!(f, "Relationship alias declared twice on {resource}: {alias}")
            }
            SchemaError::ForeignKeyAliasConflict {
                resource,
                foreign_key,
            } => write!(
                f,
                "Foreign key {resource}.{foreign_key} is claimed by more than one relationship alias"
            ),
            SchemaError::UnknownTarget {
                resource,
                alias,
                target,
            } => write!(
                f,
                "Relationship {resource}.{alias} targets unknown resource {target}"
            ),
            SchemaError::InvalidReverse {
                resource,
                alias,
                reason,
            } => write!(f, "Reverse relationship {resource}.{alias} is invalid: {reason}"),
        }
    }
}

impl std::error::Error for SchemaError {}

/// The frozen, concurrently-readable resource registry.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    resources: HashMap<String, Arc<ResourceDefinition>>,
}

impl ResourceRegistry {
    pub fn get(&self, name: &str) -> Option<&Arc<ResourceDefinition>> {
        self.resources.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Arc<ResourceDefinition>, ApiError> {
        self.resources
            .get(name)
            .ok_or_else(|| ApiError::not_found(format!("Unknown resource: {name}")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(|s| s.as_str())
    }
}

/// Accumulates resource definitions during the startup phase; terminated by
/// [`freeze`](Self::freeze).
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    definitions: Vec<ResourceDefinition>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, definition: ResourceDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Validate the topology and produce the immutable registry.
    pub fn freeze(self) -> Result<ResourceRegistry, SchemaError> {
        let mut definitions = self.definitions;
        for def in &mut definitions {
            normalize(def);
        }

        let mut by_name: HashMap<&str, &ResourceDefinition> = HashMap::new();
        for def in &definitions {
            if by_name.insert(def.name.as_str(), def).is_some() {
                return Err(SchemaError::DuplicateResource(def.name.clone()));
            }
        }

        for def in &definitions {
            validate_definition(def, &by_name)?;
        }

        let resources = definitions
            .into_iter()
            .map(|def| (def.name.clone(), Arc::new(def)))
            .collect();
        Ok(ResourceRegistry { resources })
    }
}

/// Fold field-form belongsTo declarations into relationship entries and
/// inject the owner field for ALWAYS-owned resources.
fn normalize(def: &mut ResourceDefinition) {
    let field_rels: Vec<(String, String, String)> = def
        .fields
        .iter()
        .filter(|(_, spec)| spec.kind == FieldKind::BelongsTo)
        .filter_map(|(field, spec)| {
            let target = spec.target.clone()?;
            let alias = spec
                .alias
                .clone()
                .unwrap_or_else(|| field.strip_suffix("_id").unwrap_or(field).to_string());
            Some((alias, target, field.clone()))
        })
        .collect();
    for (alias, target, foreign_key) in field_rels {
        let claimed = def.relationships.iter().any(|r| {
            matches!(&r.kind, RelationshipKind::BelongsTo { foreign_key: fk, .. } if *fk == foreign_key)
        });
        if !claimed {
            def.relationships.push(RelationshipSpec {
                name: alias,
                kind: RelationshipKind::BelongsTo {
                    target,
                    foreign_key,
                },
                limit: None,
                order_by: Vec::new(),
            });
        }
    }

    if def.ownership == Ownership::Always
        && def.owner_field != def.id_field
        && !def.fields.contains_key(&def.owner_field)
    {
        def.fields.insert(
            def.owner_field.clone(),
            FieldSpec::belongs_to("users").aliased("owner"),
        );
        let claimed = def.relationships.iter().any(|r| {
            matches!(&r.kind, RelationshipKind::BelongsTo { foreign_key, .. } if *foreign_key == def.owner_field)
        });
        if !claimed {
            def.relationships.push(RelationshipSpec {
                name: "owner".to_string(),
                kind: RelationshipKind::BelongsTo {
                    target: "users".to_string(),
                    foreign_key: def.owner_field.clone(),
                },
                limit: None,
                order_by: Vec::new(),
            });
        }
    }
}

fn validate_definition(
    def: &ResourceDefinition,
    by_name: &HashMap<&str, &ResourceDefinition>,
) -> Result<(), SchemaError> {
    let mut aliases = HashSet::new();
    let mut foreign_keys = HashSet::new();

    for rel in &def.relationships {
        if !aliases.insert(rel.name.as_str()) {
            return Err(SchemaError::DuplicateAlias {
                resource: def.name.clone(),
                alias: rel.name.clone(),
            });
        }
        match &rel.kind {
            RelationshipKind::BelongsTo {
                target,
                foreign_key,
            } => {
                if !foreign_keys.insert(foreign_key.as_str()) {
                    return Err(SchemaError::ForeignKeyAliasConflict {
                        resource: def.name.clone(),
                        foreign_key: foreign_key.clone(),
                    });
                }
                require_target(def, rel, target, by_name)?;
            }
            RelationshipKind::HasMany { target, .. } => {
                require_target(def, rel, target, by_name)?;
            }
            RelationshipKind::ManyToMany { target, .. } => {
                require_target(def, rel, target, by_name)?;
            }
            RelationshipKind::PolymorphicBelongsTo { allowed, .. } => {
                for target in allowed {
                    require_target(def, rel, target, by_name)?;
                }
            }
            RelationshipKind::ReversePolymorphic { target, via } => {
                require_target(def, rel, target, by_name)?;
                let target_def = by_name[target.as_str()];
                match target_def.relationship(via).map(|r| &r.kind) {
                    Some(RelationshipKind::PolymorphicBelongsTo { allowed, .. }) => {
                        if !allowed.contains(&def.name) {
                            return Err(SchemaError::InvalidReverse {
                                resource: def.name.clone(),
                                alias: rel.name.clone(),
                                reason: format!(
                                    "{target}.{via} does not allow type {}",
                                    def.name
                                ),
                            });
                        }
                    }
                    Some(_) => {
                        return Err(SchemaError::InvalidReverse {
                            resource: def.name.clone(),
                            alias: rel.name.clone(),
                            reason: format!("{target}.{via} is not polymorphic"),
                        });
                    }
                    None => {
                        return Err(SchemaError::InvalidReverse {
                            resource: def.name.clone(),
                            alias: rel.name.clone(),
                            reason: format!("{target} has no relationship {via}"),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

fn require_target(
    def: &ResourceDefinition,
    rel: &RelationshipSpec,
    target: &str,
    by_name: &HashMap<&str, &ResourceDefinition>,
) -> Result<(), SchemaError> {
    if by_name.contains_key(target) {
        Ok(())
    } else {
        Err(SchemaError::UnknownTarget {
            resource: def.name.clone(),
            alias: rel.name.clone(),
            target: target.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> ResourceDefinition {
        ResourceDefinition::new("users")
            .attribute("email", FieldSpec::string())
            .attribute("name", FieldSpec::string())
    }

    #[test]
    fn field_form_belongs_to_becomes_a_relationship() {
        let registry = RegistryBuilder::new()
            .register(users())
            .register(
                ResourceDefinition::new("articles")
                    .attribute("author_id", FieldSpec::belongs_to("users").aliased("author")),
            )
            .freeze()
            .unwrap();
        let articles = registry.get("articles").unwrap();
        let rel = articles.relationship("author").unwrap();
        assert_eq!(
            rel.kind,
            RelationshipKind::BelongsTo {
                target: "users".into(),
                foreign_key: "author_id".into()
            }
        );
    }

    #[test]
    fn always_ownership_injects_owner_field() {
        let registry = RegistryBuilder::new()
            .register(users())
            .register(ResourceDefinition::new("notes").ownership(Ownership::Always))
            .freeze()
            .unwrap();
        let notes = registry.get("notes").unwrap();
        assert!(notes.fields.contains_key("user_id"));
        assert!(notes.relationship("owner").is_some());
    }

    #[test]
    fn duplicate_alias_is_rejected() {
        let err = RegistryBuilder::new()
            .register(users())
            .register(
                ResourceDefinition::new("articles")
                    .has_many("comments", "users", "article_id")
                    .has_many("comments", "users", "other_id"),
            )
            .freeze()
            .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateAlias { alias, .. } if alias == "comments"));
    }

    #[test]
    fn two_aliases_cannot_share_a_foreign_key() {
        let err = RegistryBuilder::new()
            .register(users())
            .register(
                ResourceDefinition::new("articles")
                    .belongs_to("author", "users", "user_id")
                    .belongs_to("editor", "users", "user_id"),
            )
            .freeze()
            .unwrap_err();
        assert!(
            matches!(err, SchemaError::ForeignKeyAliasConflict { foreign_key, .. } if foreign_key == "user_id")
        );
    }

    #[test]
    fn unknown_target_is_rejected() {
        let err = RegistryBuilder::new()
            .register(ResourceDefinition::new("articles").belongs_to(
                "author",
                "ghosts",
                "ghost_id",
            ))
            .freeze()
            .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownTarget { target, .. } if target == "ghosts"));
    }

    #[test]
    fn hidden_columns_cover_fks_and_discriminators() {
        let def = ResourceDefinition::new("comments")
            .belongs_to("author", "users", "author_id")
            .polymorphic_belongs_to(
                "commentable",
                ["articles", "videos"],
                "commentable_type",
                "commentable_id",
            );
        let hidden = def.hidden_columns();
        assert!(hidden.contains("id"));
        assert!(hidden.contains("author_id"));
        assert!(hidden.contains("commentable_type"));
        assert!(hidden.contains("commentable_id"));
        assert!(!hidden.contains("body"));
    }

    #[test]
    fn auth_rule_parses_param_form() {
        let rule = AuthRule::parse("role:admin");
        assert_eq!(rule.name, "role");
        assert_eq!(rule.param.as_deref(), Some("admin"));
        assert_eq!(rule.to_string(), "role:admin");
    }
}
