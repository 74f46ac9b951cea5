//! Include expansion: batch-load related resources for a set of primary
//! records, with nested includes, polymorphism, per-parent window limits,
//! and `(type, id)` deduplication in first-insertion order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;

use japi_data::{
    id_string, record_id, FilterClause, Query, Record, SortKey, StorageAdapter, Tx, WindowSpec,
};

use crate::document::{RelationshipData, ResourceIdentifier};
use crate::error::ApiError;
use crate::schema::{
    IncludeLimit, RelationshipKind, RelationshipSpec, ResourceDefinition, ResourceRegistry,
};

/// A parsed include parameter: dot-paths folded into a tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncludeTree(pub std::collections::BTreeMap<String, IncludeTree>);

impl IncludeTree {
    pub fn parse<S: AsRef<str>>(paths: &[S]) -> Self {
        let mut root = IncludeTree::default();
        for path in paths {
            let mut node = &mut root;
            for segment in path.as_ref().split('.').filter(|s| !s.is_empty()) {
                node = node.0.entry(segment.to_string()).or_default();
            }
        }
        root
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Identifies one relationship slot on one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkageKey {
    pub resource: String,
    pub id: String,
    pub relationship: String,
}

impl LinkageKey {
    pub fn new(
        resource: impl Into<String>,
        id: impl Into<String>,
        relationship: impl Into<String>,
    ) -> Self {
        Self {
            resource: resource.into(),
            id: id.into(),
            relationship: relationship.into(),
        }
    }
}

/// Loaded relationship linkage, consulted by the response assembler.
pub type LinkageMap = HashMap<LinkageKey, RelationshipData>;

/// The deduplicated `included` accumulator; order is first insertion.
#[derive(Default)]
pub struct IncludedSet {
    order: Vec<(Arc<ResourceDefinition>, Record)>,
    seen: HashSet<(String, String)>,
}

impl IncludedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, def: &Arc<ResourceDefinition>, record: Record) {
        let Some(id) = record_id(&record, &def.id_field) else {
            return;
        };
        if self.seen.insert((def.name.clone(), id)) {
            self.order.push((def.clone(), record));
        }
    }

    pub fn into_vec(self) -> Vec<(Arc<ResourceDefinition>, Record)> {
        self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Result of an expansion pass.
pub struct IncludeOutput {
    pub included: Vec<(Arc<ResourceDefinition>, Record)>,
    pub linkage: LinkageMap,
}

/// The include engine. Stateless between calls; borrows the frozen
/// registry and the storage capability.
pub struct IncludeEngine<'a> {
    pub registry: &'a ResourceRegistry,
    pub storage: &'a dyn StorageAdapter,
    /// Engine-wide default per-parent cap for to-many includes.
    pub limit_default: Option<u64>,
    /// Engine-wide ceiling for per-parent caps.
    pub limit_max: Option<u64>,
}

impl<'a> IncludeEngine<'a> {
    /// Expand the include tree for a set of primary records.
    pub async fn expand(
        &self,
        def: &Arc<ResourceDefinition>,
        records: &[Record],
        paths: &[String],
        tx: Tx<'_>,
    ) -> Result<IncludeOutput, ApiError> {
        let tree = IncludeTree::parse(paths);
        let mut included = IncludedSet::new();
        let mut linkage = LinkageMap::new();

        let mut work: VecDeque<(Arc<ResourceDefinition>, Vec<Record>, IncludeTree, String)> =
            VecDeque::new();
        work.push_back((def.clone(), records.to_vec(), tree, String::new()));
        let mut visited: HashSet<(String, String)> = HashSet::new();

        while let Some((def, records, tree, prefix)) = work.pop_front() {
            for (segment, subtree) in tree.0 {
                let path = if prefix.is_empty() {
                    segment.clone()
                } else {
                    format!("{prefix}.{segment}")
                };
                let Some(rel) = def.relationship(&segment) else {
                    return Err(ApiError::violation(
                        format!("include.{path}"),
                        "unknown_relationship",
                        format!("No relationship named {segment} on {}", def.name),
                    ));
                };
                // Re-walking an already-processed (resource, path) pair can
                // only revisit the same records; skip it.
                if !visited.insert((def.name.clone(), path.clone())) {
                    continue;
                }
                let groups = self
                    .load_relationship(&def, rel, &records, tx, &mut linkage, &mut included)
                    .await?;
                for (child_def, child_records) in groups {
                    if !subtree.is_empty() && !child_records.is_empty() {
                        work.push_back((child_def, child_records, subtree.clone(), path.clone()));
                    }
                }
            }
        }

        Ok(IncludeOutput {
            included: included.into_vec(),
            linkage,
        })
    }

    /// Batch-load one relationship for a set of parent records, filling
    /// linkage and the included set. Returns the loaded records grouped by
    /// their definition, for recursion and for relationship endpoints.
    pub async fn load_relationship(
        &self,
        def: &Arc<ResourceDefinition>,
        rel: &RelationshipSpec,
        parents: &[Record],
        tx: Tx<'_>,
        linkage: &mut LinkageMap,
        included: &mut IncludedSet,
    ) -> Result<Vec<(Arc<ResourceDefinition>, Vec<Record>)>, ApiError> {
        match &rel.kind {
            RelationshipKind::BelongsTo {
                target,
                foreign_key,
            } => {
                self.load_belongs_to(def, rel, target, foreign_key, parents, tx, linkage, included)
                    .await
            }
            RelationshipKind::HasMany {
                target,
                foreign_key,
            } => {
                self.load_has_many(def, rel, target, foreign_key, parents, tx, linkage, included)
                    .await
            }
            RelationshipKind::ManyToMany {
                target,
                through,
                local_key,
                other_key,
            } => {
                self.load_many_to_many(
                    def, rel, target, through, local_key, other_key, parents, tx, linkage, included,
                )
                .await
            }
            RelationshipKind::PolymorphicBelongsTo {
                allowed,
                type_field,
                id_field,
            } => {
                self.load_polymorphic(
                    def, rel, allowed, type_field, id_field, parents, tx, linkage, included,
                )
                .await
            }
            RelationshipKind::ReversePolymorphic { target, via } => {
                self.load_reverse_polymorphic(def, rel, target, via, parents, tx, linkage, included)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn load_belongs_to(
        &self,
        def: &Arc<ResourceDefinition>,
        rel: &RelationshipSpec,
        target: &str,
        foreign_key: &str,
        parents: &[Record],
        tx: Tx<'_>,
        linkage: &mut LinkageMap,
        included: &mut IncludedSet,
    ) -> Result<Vec<(Arc<ResourceDefinition>, Vec<Record>)>, ApiError> {
        let target_def = self.registry.require(target)?.clone();

        let mut wanted: Vec<String> = Vec::new();
        for parent in parents {
            let Some(parent_id) = record_id(parent, &def.id_field) else {
                continue;
            };
            let fk = parent.get(foreign_key).and_then(id_string);
            let data = match &fk {
                None => RelationshipData::One(None),
                Some(fk) => {
                    if !wanted.contains(fk) {
                        wanted.push(fk.clone());
                    }
                    RelationshipData::One(Some(ResourceIdentifier::new(target, fk.clone())))
                }
            };
            linkage.insert(LinkageKey::new(&def.name, parent_id, &rel.name), data);
        }
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let query = Query::new().filter(FilterClause::id_in(&target_def.id_field, &wanted));
        let result = self.storage.query(target, &query, tx).await?;
        for record in &result.records {
            included.push(&target_def, record.clone());
        }
        Ok(vec![(target_def, result.records)])
    }

    #[allow(clippy::too_many_arguments)]
    async fn load_has_many(
        &self,
        def: &Arc<ResourceDefinition>,
        rel: &RelationshipSpec,
        target: &str,
        foreign_key: &str,
        parents: &[Record],
        tx: Tx<'_>,
        linkage: &mut LinkageMap,
        included: &mut IncludedSet,
    ) -> Result<Vec<(Arc<ResourceDefinition>, Vec<Record>)>, ApiError> {
        let target_def = self.registry.require(target)?.clone();
        let parent_ids = parent_ids(parents, &def.id_field);
        if parent_ids.is_empty() {
            return Ok(Vec::new());
        }

        let order_by = effective_order(rel, &target_def);
        let mut query = Query::new().filter(FilterClause::id_in(foreign_key, &parent_ids));
        for key in &order_by {
            query = query.order_by(key.clone());
        }
        query = self.apply_window(query, rel, foreign_key, &order_by)?;

        let result = self.storage.query(target, &query, tx).await?;
        self.group_children(
            def,
            rel,
            &target_def,
            foreign_key,
            &parent_ids,
            result.records,
            linkage,
            included,
        )
    }

    #[allow(clippy::too_many_arguments)]
    async fn load_many_to_many(
        &self,
        def: &Arc<ResourceDefinition>,
        rel: &RelationshipSpec,
        target: &str,
        through: &str,
        local_key: &str,
        other_key: &str,
        parents: &[Record],
        tx: Tx<'_>,
        linkage: &mut LinkageMap,
        included: &mut IncludedSet,
    ) -> Result<Vec<(Arc<ResourceDefinition>, Vec<Record>)>, ApiError> {
        let target_def = self.registry.require(target)?.clone();
        let parent_ids = parent_ids(parents, &def.id_field);
        if parent_ids.is_empty() {
            return Ok(Vec::new());
        }

        let pivot_order = vec![SortKey::asc(other_key)];
        let mut pivot_query = Query::new().filter(FilterClause::id_in(local_key, &parent_ids));
        pivot_query = self.apply_window(pivot_query, rel, local_key, &pivot_order)?;
        let pivot_rows = self.storage.query(through, &pivot_query, tx).await?.records;

        // parent id -> ordered other ids, via the pivot.
        let mut membership: HashMap<String, Vec<String>> = HashMap::new();
        let mut other_ids: Vec<String> = Vec::new();
        for row in &pivot_rows {
            let (Some(local), Some(other)) = (
                row.get(local_key).and_then(id_string),
                row.get(other_key).and_then(id_string),
            ) else {
                continue;
            };
            if !other_ids.contains(&other) {
                other_ids.push(other.clone());
            }
            membership.entry(local).or_default().push(other);
        }

        let mut by_id: HashMap<String, Record> = HashMap::new();
        if !other_ids.is_empty() {
            let query = Query::new().filter(FilterClause::id_in(&target_def.id_field, &other_ids));
            for record in self.storage.query(target, &query, tx).await?.records {
                if let Some(id) = record_id(&record, &target_def.id_field) {
                    by_id.insert(id, record);
                }
            }
        }

        let mut loaded: Vec<Record> = Vec::new();
        for parent_id in &parent_ids {
            let members = membership.remove(parent_id).unwrap_or_default();
            let mut identifiers = Vec::with_capacity(members.len());
            for other in members {
                if let Some(record) = by_id.get(&other) {
                    identifiers.push(ResourceIdentifier::new(target, other.clone()));
                    included.push(&target_def, record.clone());
                    loaded.push(record.clone());
                }
            }
            linkage.insert(
                LinkageKey::new(&def.name, parent_id.clone(), &rel.name),
                RelationshipData::Many(identifiers),
            );
        }
        Ok(vec![(target_def, loaded)])
    }

    #[allow(clippy::too_many_arguments)]
    async fn load_polymorphic(
        &self,
        def: &Arc<ResourceDefinition>,
        rel: &RelationshipSpec,
        allowed: &[String],
        type_field: &str,
        id_field: &str,
        parents: &[Record],
        tx: Tx<'_>,
        linkage: &mut LinkageMap,
        included: &mut IncludedSet,
    ) -> Result<Vec<(Arc<ResourceDefinition>, Vec<Record>)>, ApiError> {
        // Group parents by discriminator value.
        let mut by_type: HashMap<String, Vec<String>> = HashMap::new();
        for parent in parents {
            let Some(parent_id) = record_id(parent, &def.id_field) else {
                continue;
            };
            let kind = parent.get(type_field).and_then(Value::as_str);
            let target_id = parent.get(id_field).and_then(id_string);
            let data = match (kind, target_id) {
                (Some(kind), Some(target_id)) if allowed.iter().any(|a| a == kind) => {
                    let ids = by_type.entry(kind.to_string()).or_default();
                    if !ids.contains(&target_id) {
                        ids.push(target_id.clone());
                    }
                    RelationshipData::One(Some(ResourceIdentifier::new(kind, target_id)))
                }
                _ => RelationshipData::One(None),
            };
            linkage.insert(LinkageKey::new(&def.name, parent_id, &rel.name), data);
        }

        let mut groups = Vec::new();
        // Deterministic group order: the declared allowed-type order.
        for kind in allowed {
            let Some(ids) = by_type.get(kind) else {
                continue;
            };
            let target_def = self.registry.require(kind)?.clone();
            let query = Query::new().filter(FilterClause::id_in(&target_def.id_field, ids));
            let records = self.storage.query(kind, &query, tx).await?.records;
            for record in &records {
                included.push(&target_def, record.clone());
            }
            groups.push((target_def, records));
        }
        Ok(groups)
    }

    #[allow(clippy::too_many_arguments)]
    async fn load_reverse_polymorphic(
        &self,
        def: &Arc<ResourceDefinition>,
        rel: &RelationshipSpec,
        target: &str,
        via: &str,
        parents: &[Record],
        tx: Tx<'_>,
        linkage: &mut LinkageMap,
        included: &mut IncludedSet,
    ) -> Result<Vec<(Arc<ResourceDefinition>, Vec<Record>)>, ApiError> {
        let target_def = self.registry.require(target)?.clone();
        let Some(RelationshipKind::PolymorphicBelongsTo {
            type_field,
            id_field,
            ..
        }) = target_def.relationship(via).map(|r| r.kind.clone())
        else {
            return Err(ApiError::storage(format!(
                "{target}.{via} is not a polymorphic relationship"
            )));
        };

        let parent_ids = parent_ids(parents, &def.id_field);
        if parent_ids.is_empty() {
            return Ok(Vec::new());
        }

        let order_by = effective_order(rel, &target_def);
        let mut query = Query::new()
            .filter(FilterClause::eq(
                type_field.clone(),
                Value::String(def.name.clone()),
            ))
            .filter(FilterClause::id_in(&id_field, &parent_ids));
        for key in &order_by {
            query = query.order_by(key.clone());
        }
        query = self.apply_window(query, rel, &id_field, &order_by)?;

        let result = self.storage.query(target, &query, tx).await?;
        self.group_children(
            def,
            rel,
            &target_def,
            &id_field,
            &parent_ids,
            result.records,
            linkage,
            included,
        )
    }

    /// Group fetched children under their parents and record linkage for
    /// every parent (empty lists included).
    #[allow(clippy::too_many_arguments)]
    fn group_children(
        &self,
        def: &Arc<ResourceDefinition>,
        rel: &RelationshipSpec,
        target_def: &Arc<ResourceDefinition>,
        group_key: &str,
        parent_ids: &[String],
        children: Vec<Record>,
        linkage: &mut LinkageMap,
        included: &mut IncludedSet,
    ) -> Result<Vec<(Arc<ResourceDefinition>, Vec<Record>)>, ApiError> {
        let mut grouped: HashMap<String, Vec<ResourceIdentifier>> = HashMap::new();
        for child in &children {
            let (Some(parent), Some(child_id)) = (
                child.get(group_key).and_then(id_string),
                record_id(child, &target_def.id_field),
            ) else {
                continue;
            };
            grouped
                .entry(parent)
                .or_default()
                .push(ResourceIdentifier::new(&target_def.name, child_id));
            included.push(target_def, child.clone());
        }
        for parent_id in parent_ids {
            let identifiers = grouped.remove(parent_id).unwrap_or_default();
            linkage.insert(
                LinkageKey::new(&def.name, parent_id.clone(), &rel.name),
                RelationshipData::Many(identifiers),
            );
        }
        Ok(vec![(target_def.clone(), children)])
    }

    /// Apply the per-parent window if a limit is in force. An explicitly
    /// demanded limit on a backend without window functions is an
    /// unsupported operation; a limit derived from engine defaults falls
    /// back to unlimited.
    fn apply_window(
        &self,
        query: Query,
        rel: &RelationshipSpec,
        partition_by: &str,
        order_by: &[SortKey],
    ) -> Result<Query, ApiError> {
        let (limit, explicit) = self.resolve_limit(rel);
        let Some(limit) = limit else {
            return Ok(query);
        };
        if !self.storage.capabilities().window_functions {
            if explicit {
                return Err(ApiError::unsupported("window_functions"));
            }
            return Ok(query);
        }
        Ok(query.window(WindowSpec {
            partition_by: partition_by.to_string(),
            order_by: order_by.to_vec(),
            limit,
        }))
    }

    /// Limit hierarchy: the relationship's declared limit, else the engine
    /// default, clamped by the engine maximum. `Unlimited` disables the
    /// cap entirely.
    fn resolve_limit(&self, rel: &RelationshipSpec) -> (Option<u64>, bool) {
        let clamp = |n: u64| match self.limit_max {
            Some(max) => n.min(max),
            None => n,
        };
        match rel.limit {
            Some(IncludeLimit::Unlimited) => (None, false),
            Some(IncludeLimit::Limit(n)) => (Some(clamp(n)), true),
            None => (self.limit_default.map(clamp), false),
        }
    }
}

fn parent_ids(parents: &[Record], id_field: &str) -> Vec<String> {
    let mut ids = Vec::with_capacity(parents.len());
    for parent in parents {
        if let Some(id) = record_id(parent, id_field) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}

/// The relationship's declared ordering, defaulting to `id ASC`.
fn effective_order(rel: &RelationshipSpec, target_def: &ResourceDefinition) -> Vec<SortKey> {
    if rel.order_by.is_empty() {
        vec![SortKey::asc(&target_def.id_field)]
    } else {
        rel.order_by.clone()
    }
}
