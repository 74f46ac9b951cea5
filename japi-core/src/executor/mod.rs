//! The request executor: a state machine per HTTP verb that orchestrates
//! validation, authorization, ownership, relationship decomposition,
//! storage calls, include expansion, and response assembly — inside a
//! caller-supplied or executor-owned transaction — and emits change events
//! to the broadcaster after commit.

pub mod bulk;

use std::sync::Arc;

use chrono::Utc;
use http::StatusCode;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use japi_data::{
    record_id, FilterClause, PageSpec, Query, Record, SortKey, StorageAdapter, TransactionHandle,
    Tx,
};

use crate::auth::{AnonymousProvider, AuthContext, AuthProvider, Checker, CheckerRegistry};
use crate::document::{RelationshipData, ResourceIdentifier};
use crate::error::ApiError;
use crate::include::{IncludeEngine, IncludeOutput, IncludedSet, LinkageKey, LinkageMap};
use crate::ownership;
use crate::plugin::EnginePlugin;
use crate::query::QueryParams;
use crate::relationships;
use crate::response::{to_value, Assembler};
use crate::schema::{
    OperationKind, RegistryBuilder, RelationshipKind, ResourceDefinition, ResourceRegistry,
    SchemaError,
};
use crate::schema::search::translate_filters;
use crate::sink::{ChangeEvent, ChangeSink, WriteKind};
use crate::validator::{
    sparse_fields, validate_document, validate_query, validate_relationship_payload,
};

/// What a write returns in its response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadBack {
    /// No body; 204.
    None,
    /// A bare resource identifier.
    Identifier,
    /// The full resource, through the normal read path (includes and
    /// sparse fieldsets apply).
    Full,
}

/// Engine-wide knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub page_size_default: u64,
    pub page_size_max: u64,
    pub include_limit_default: Option<u64>,
    pub include_limit_max: Option<u64>,
    pub bulk_max_items: usize,
    pub bulk_chunk_size: usize,
    pub read_back_post: ReadBack,
    pub read_back_put: ReadBack,
    pub read_back_patch: ReadBack,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size_default: 20,
            page_size_max: 100,
            include_limit_default: None,
            include_limit_max: Some(1000),
            bulk_max_items: 100,
            bulk_chunk_size: 25,
            read_back_post: ReadBack::Full,
            read_back_put: ReadBack::Full,
            read_back_patch: ReadBack::Full,
        }
    }
}

/// The operation a normalized request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    List,
    Get,
    Post,
    Put,
    Patch,
    Delete,
    /// `GET /{resource}/{id}/{rel}` — full related resources.
    Related { relationship: String },
    /// `GET /{resource}/{id}/relationships/{rel}` — identifiers only.
    RelationshipGet { relationship: String },
    /// `POST …/relationships/{rel}` — add members to a to-many.
    RelationshipPost { relationship: String },
    /// `PATCH …/relationships/{rel}` — replace the set or to-one.
    RelationshipPatch { relationship: String },
    /// `DELETE …/relationships/{rel}` — remove members.
    RelationshipDelete { relationship: String },
}

impl Operation {
    /// The operation kind auth rules are evaluated against.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::List => OperationKind::Query,
            Operation::Get | Operation::Related { .. } | Operation::RelationshipGet { .. } => {
                OperationKind::Get
            }
            Operation::Post => OperationKind::Post,
            Operation::Put => OperationKind::Put,
            Operation::Patch
            | Operation::RelationshipPost { .. }
            | Operation::RelationshipPatch { .. }
            | Operation::RelationshipDelete { .. } => OperationKind::Patch,
            Operation::Delete => OperationKind::Delete,
        }
    }
}

/// How the caller authenticated.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// No token presented.
    None,
    /// An opaque token plus the transport-chosen provider name.
    Token {
        token: String,
        provider: Option<String>,
    },
    /// A pre-built context (internal callers, tests, bulk items).
    Context(AuthContext),
}

/// A normalized request, as handed over by the transport layer.
#[derive(Debug, Clone)]
pub struct Request {
    pub operation: Operation,
    pub resource: String,
    pub id: Option<String>,
    pub body: Option<Value>,
    pub query: QueryParams,
    pub credentials: Credentials,
    pub url_prefix: Option<String>,
    pub transaction: Option<TransactionHandle>,
    pub cancellation: Option<CancellationToken>,
}

impl Request {
    fn new(operation: Operation, resource: impl Into<String>) -> Self {
        Self {
            operation,
            resource: resource.into(),
            id: None,
            body: None,
            query: QueryParams::default(),
            credentials: Credentials::None,
            url_prefix: None,
            transaction: None,
            cancellation: None,
        }
    }

    pub fn list(resource: impl Into<String>) -> Self {
        Self::new(Operation::List, resource)
    }

    pub fn get(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(Operation::Get, resource).with_id(id)
    }

    pub fn post(resource: impl Into<String>, body: Value) -> Self {
        Self::new(Operation::Post, resource).with_body(body)
    }

    pub fn put(resource: impl Into<String>, id: impl Into<String>, body: Value) -> Self {
        Self::new(Operation::Put, resource).with_id(id).with_body(body)
    }

    pub fn patch(resource: impl Into<String>, id: impl Into<String>, body: Value) -> Self {
        Self::new(Operation::Patch, resource)
            .with_id(id)
            .with_body(body)
    }

    pub fn delete(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(Operation::Delete, resource).with_id(id)
    }

    pub fn related(
        resource: impl Into<String>,
        id: impl Into<String>,
        relationship: impl Into<String>,
    ) -> Self {
        Self::new(
            Operation::Related {
                relationship: relationship.into(),
            },
            resource,
        )
        .with_id(id)
    }

    pub fn relationship_get(
        resource: impl Into<String>,
        id: impl Into<String>,
        relationship: impl Into<String>,
    ) -> Self {
        Self::new(
            Operation::RelationshipGet {
                relationship: relationship.into(),
            },
            resource,
        )
        .with_id(id)
    }

    pub fn relationship_post(
        resource: impl Into<String>,
        id: impl Into<String>,
        relationship: impl Into<String>,
        body: Value,
    ) -> Self {
        Self::new(
            Operation::RelationshipPost {
                relationship: relationship.into(),
            },
            resource,
        )
        .with_id(id)
        .with_body(body)
    }

    pub fn relationship_patch(
        resource: impl Into<String>,
        id: impl Into<String>,
        relationship: impl Into<String>,
        body: Value,
    ) -> Self {
        Self::new(
            Operation::RelationshipPatch {
                relationship: relationship.into(),
            },
            resource,
        )
        .with_id(id)
        .with_body(body)
    }

    pub fn relationship_delete(
        resource: impl Into<String>,
        id: impl Into<String>,
        relationship: impl Into<String>,
        body: Value,
    ) -> Self {
        Self::new(
            Operation::RelationshipDelete {
                relationship: relationship.into(),
            },
            resource,
        )
        .with_id(id)
        .with_body(body)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, query: QueryParams) -> Self {
        self.query = query;
        self
    }

    pub fn with_query_string(mut self, query: &str) -> Self {
        self.query = QueryParams::parse(query);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>, provider: Option<String>) -> Self {
        self.credentials = Credentials::Token {
            token: token.into(),
            provider,
        };
        self
    }

    pub fn with_auth(mut self, auth: AuthContext) -> Self {
        self.credentials = Credentials::Context(auth);
        self
    }

    pub fn with_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.url_prefix = Some(prefix.into());
        self
    }

    pub fn in_transaction(mut self, tx: TransactionHandle) -> Self {
        self.transaction = Some(tx);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|token| token.is_cancelled())
    }
}

/// The executor's answer: a status and, usually, a JSON:API document.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineResponse {
    pub status: StatusCode,
    pub document: Option<Value>,
}

impl EngineResponse {
    pub fn ok(document: Value) -> Self {
        Self {
            status: StatusCode::OK,
            document: Some(document),
        }
    }

    pub fn created(document: Value) -> Self {
        Self {
            status: StatusCode::CREATED,
            document: Some(document),
        }
    }

    pub fn no_content() -> Self {
        Self {
            status: StatusCode::NO_CONTENT,
            document: None,
        }
    }
}

/// Write transaction scope: caller-supplied (left open) or executor-owned
/// (committed/rolled back here). `None` when the backend has no
/// transactions; each storage call then auto-commits.
struct TxScope {
    handle: Option<TransactionHandle>,
    owned: bool,
}

impl TxScope {
    fn tx(&self) -> Tx<'_> {
        self.handle.as_ref()
    }
}

/// The frozen request engine.
pub struct Engine {
    registry: Arc<ResourceRegistry>,
    checkers: Arc<CheckerRegistry>,
    storage: Arc<dyn StorageAdapter>,
    auth_provider: Arc<dyn AuthProvider>,
    sink: Option<Arc<dyn ChangeSink>>,
    config: EngineConfig,
}

impl Engine {
    pub fn builder(storage: Arc<dyn StorageAdapter>) -> EngineBuilder {
        EngineBuilder::new(storage)
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn checkers(&self) -> &Arc<CheckerRegistry> {
        &self.checkers
    }

    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Attach (or replace) the change sink after build. The broadcaster
    /// needs the frozen registry, so wiring usually happens in this
    /// order: build, create the broadcaster from `engine.registry()`,
    /// attach it.
    pub fn with_change_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Open a transaction for a multi-request unit of work. Broadcasts
    /// produced inside it are buffered until [`commit`](Self::commit).
    pub async fn begin(&self) -> Result<TransactionHandle, ApiError> {
        Ok(self.storage.begin().await?)
    }

    /// Commit a caller-held transaction, then flush its buffered
    /// broadcasts.
    pub async fn commit(&self, tx: TransactionHandle) -> Result<(), ApiError> {
        self.storage.commit(tx).await?;
        if let Some(sink) = &self.sink {
            sink.commit(&tx).await;
        }
        Ok(())
    }

    /// Roll back a caller-held transaction and discard its buffered
    /// broadcasts.
    pub async fn rollback(&self, tx: TransactionHandle) -> Result<(), ApiError> {
        let result = self.storage.rollback(tx).await;
        if let Some(sink) = &self.sink {
            sink.discard(&tx).await;
        }
        Ok(result?)
    }

    /// Execute one normalized request.
    pub async fn execute(&self, request: Request) -> Result<EngineResponse, ApiError> {
        let def = self.registry.require(&request.resource)?.clone();
        let auth = self.authenticate_credentials(&request.credentials).await?;
        debug!(
            resource = %def.name,
            operation = ?request.operation,
            user = auth.user_id.as_deref().unwrap_or("-"),
            "executing request"
        );
        match request.operation.clone() {
            Operation::List => self.list(&def, &request, &auth).await,
            Operation::Get => self.get_one(&def, &request, &auth).await,
            Operation::Post => self.post(&def, &request, &auth).await,
            Operation::Put => self.update(&def, &request, &auth, WriteKind::Put).await,
            Operation::Patch => self.update(&def, &request, &auth, WriteKind::Patch).await,
            Operation::Delete => self.delete(&def, &request, &auth).await,
            Operation::Related { relationship } => {
                self.related(&def, &request, &auth, &relationship).await
            }
            Operation::RelationshipGet { relationship } => {
                self.relationship_get(&def, &request, &auth, &relationship).await
            }
            Operation::RelationshipPost { relationship } => {
                self.relationship_write(&def, &request, &auth, &relationship, RelWrite::Add)
                    .await
            }
            Operation::RelationshipPatch { relationship } => {
                self.relationship_write(&def, &request, &auth, &relationship, RelWrite::Replace)
                    .await
            }
            Operation::RelationshipDelete { relationship } => {
                self.relationship_write(&def, &request, &auth, &relationship, RelWrite::Remove)
                    .await
            }
        }
    }

    pub(crate) async fn authenticate_credentials(
        &self,
        credentials: &Credentials,
    ) -> Result<AuthContext, ApiError> {
        match credentials {
            Credentials::None => self.auth_provider.build(None, None).await,
            Credentials::Token { token, provider } => {
                self.auth_provider
                    .build(Some(token), provider.as_deref())
                    .await
            }
            Credentials::Context(auth) => Ok(auth.clone()),
        }
    }

    fn include_engine(&self) -> IncludeEngine<'_> {
        IncludeEngine {
            registry: &self.registry,
            storage: self.storage.as_ref(),
            limit_default: self.config.include_limit_default,
            limit_max: self.config.include_limit_max,
        }
    }

    fn assembler<'a>(&'a self, request: &'a Request) -> Assembler<'a> {
        Assembler::new(&self.registry)
            .with_url_prefix(request.url_prefix.as_deref())
            .with_sparse(sparse_fields(&request.query))
    }

    async fn expand_includes(
        &self,
        def: &Arc<ResourceDefinition>,
        records: &[Record],
        request: &Request,
        tx: Tx<'_>,
    ) -> Result<Option<IncludeOutput>, ApiError> {
        if request.query.include.is_empty() {
            return Ok(None);
        }
        let output = self
            .include_engine()
            .expand(def, records, &request.query.include, tx)
            .await?;
        Ok(Some(output))
    }

    fn require_id<'r>(request: &'r Request) -> Result<&'r str, ApiError> {
        request
            .id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::payload("id", "a non-empty resource id", "absent"))
    }

    async fn load_minimal(
        &self,
        def: &ResourceDefinition,
        id: &str,
        tx: Tx<'_>,
    ) -> Result<Record, ApiError> {
        self.storage
            .get_minimal(&def.name, id, tx)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("No {} with the requested id", def.name)))
    }

    /// Authorization followed by the ownership mask — with the mask
    /// outranking a 403: cross-owner access on an owned resource must be
    /// indistinguishable from a truly absent id, even when the rule set
    /// denies.
    async fn authorize_masked(
        &self,
        def: &ResourceDefinition,
        op: OperationKind,
        auth: &AuthContext,
        minimal: &Record,
    ) -> Result<(), ApiError> {
        match self.checkers.authorize(def, op, auth, Some(minimal)).await {
            Ok(()) => ownership::mask_single(def, auth, minimal),
            Err(denied) => {
                ownership::mask_single(def, auth, minimal)?;
                Err(denied)
            }
        }
    }

    fn page_spec(&self, query: &QueryParams) -> PageSpec {
        let number = query.page_number("number").unwrap_or(1);
        let size = query
            .page_number("size")
            .unwrap_or(self.config.page_size_default)
            .min(self.config.page_size_max);
        PageSpec::new(number, size)
    }

    // ── Reads ────────────────────────────────────────────────────────────

    async fn list(
        &self,
        def: &Arc<ResourceDefinition>,
        request: &Request,
        auth: &AuthContext,
    ) -> Result<EngineResponse, ApiError> {
        validate_query(def, &request.query)?;
        self.checkers
            .authorize(def, OperationKind::Query, auth, None)
            .await?;

        let mut filters = translate_filters(&def.search, &request.query.filters)?;
        if let Some(owner) = ownership::collection_filter(def, auth) {
            filters.push(owner);
        }
        let mut sort = request.query.sort.clone();
        if sort.is_empty() {
            sort.push(SortKey::asc(&def.id_field));
        }
        let query = Query {
            filters,
            sort,
            page: Some(self.page_spec(&request.query)),
            window: None,
            selection: None,
        };

        let tx = request.transaction;
        let result = self.storage.query(&def.name, &query, tx.as_ref()).await?;
        let includes = self
            .expand_includes(def, &result.records, request, tx.as_ref())
            .await?;
        let doc = self.assembler(request).collection(
            def,
            &result.records,
            includes.as_ref(),
            result.pagination.as_ref(),
        );
        Ok(EngineResponse::ok(to_value(&doc)))
    }

    async fn get_one(
        &self,
        def: &Arc<ResourceDefinition>,
        request: &Request,
        auth: &AuthContext,
    ) -> Result<EngineResponse, ApiError> {
        let id = Self::require_id(request)?;
        let tx = request.transaction;
        let minimal = self.load_minimal(def, id, tx.as_ref()).await?;
        self.authorize_masked(def, OperationKind::Get, auth, &minimal)
            .await?;

        let record = self
            .storage
            .get(&def.name, id, None, tx.as_ref())
            .await?
            .ok_or_else(|| ApiError::not_found(format!("No {} with the requested id", def.name)))?;
        let includes = self
            .expand_includes(def, std::slice::from_ref(&record), request, tx.as_ref())
            .await?;
        let doc = self.assembler(request).single(def, &record, includes.as_ref());
        Ok(EngineResponse::ok(to_value(&doc)))
    }

    // ── Writes ───────────────────────────────────────────────────────────

    async fn begin_scope(&self, request: &Request) -> Result<TxScope, ApiError> {
        if let Some(handle) = request.transaction {
            return Ok(TxScope {
                handle: Some(handle),
                owned: false,
            });
        }
        match self.storage.begin().await {
            Ok(handle) => Ok(TxScope {
                handle: Some(handle),
                owned: true,
            }),
            // Transactionless backends run each call auto-committed.
            Err(japi_data::StorageError::Unsupported { .. }) => Ok(TxScope {
                handle: None,
                owned: false,
            }),
            Err(other) => Err(other.into()),
        }
    }

    async fn finish_ok(&self, scope: &TxScope) -> Result<(), ApiError> {
        if let (true, Some(handle)) = (scope.owned, scope.handle) {
            self.storage.commit(handle).await?;
            if let Some(sink) = &self.sink {
                sink.commit(&handle).await;
            }
        }
        Ok(())
    }

    async fn finish_err(&self, scope: &TxScope) {
        if let (true, Some(handle)) = (scope.owned, scope.handle) {
            if let Err(err) = self.storage.rollback(handle).await {
                warn!(error = %err, "rollback failed");
            }
            if let Some(sink) = &self.sink {
                sink.discard(&handle).await;
            }
        }
    }

    async fn emit(
        &self,
        kind: WriteKind,
        def: &ResourceDefinition,
        id: &str,
        record: &Record,
        scope: &TxScope,
    ) {
        if let Some(sink) = &self.sink {
            sink.publish(ChangeEvent {
                kind,
                resource: def.name.clone(),
                id: id.to_string(),
                record: record.clone(),
                transaction: scope.handle,
                occurred_at: Utc::now(),
            })
            .await;
        }
    }

    fn stamp_timestamps(def: &ResourceDefinition, attributes: &mut Record, creating: bool) {
        if !def.timestamps {
            return;
        }
        let now = Value::String(Utc::now().to_rfc3339());
        if creating {
            attributes
                .entry("created_at".to_string())
                .or_insert_with(|| now.clone());
        }
        attributes.insert("updated_at".to_string(), now);
    }

    async fn post(
        &self,
        def: &Arc<ResourceDefinition>,
        request: &Request,
        auth: &AuthContext,
    ) -> Result<EngineResponse, ApiError> {
        self.checkers
            .authorize(def, OperationKind::Post, auth, None)
            .await?;
        let doc = validate_document(
            &self.registry,
            def,
            request.body.as_ref(),
            OperationKind::Post,
        )?;
        let decomposed = relationships::decompose(def, &doc.relationships)?;

        let mut attributes = doc.attributes.clone();
        for (name, spec) in &def.fields {
            if let Some(default) = &spec.default {
                attributes
                    .entry(name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
        for (field, value) in &decomposed.foreign_keys {
            attributes.insert(field.clone(), value.clone());
        }
        ownership::stamp_owner(def, auth, &mut attributes);
        Self::stamp_timestamps(def, &mut attributes, true);
        if let Some(id) = &doc.id {
            attributes.insert(def.id_field.clone(), Value::String(id.clone()));
        }

        if request.is_cancelled() {
            return Err(ApiError::Cancelled);
        }
        let scope = self.begin_scope(request).await?;
        let result = self.post_inner(def, request, &attributes, &decomposed.pivots, &scope).await;
        match result {
            Ok(response) => {
                self.finish_ok(&scope).await?;
                Ok(response)
            }
            Err(err) => {
                self.finish_err(&scope).await;
                Err(err)
            }
        }
    }

    async fn post_inner(
        &self,
        def: &Arc<ResourceDefinition>,
        request: &Request,
        attributes: &Record,
        pivots: &[relationships::PivotOp],
        scope: &TxScope,
    ) -> Result<EngineResponse, ApiError> {
        let stored = self.storage.insert(&def.name, attributes, scope.tx()).await?;
        let id = record_id(&stored, &def.id_field)
            .ok_or_else(|| ApiError::storage("backend returned a record without an id"))?;
        self.insert_pivots(pivots, &id, scope.tx()).await?;
        let response = self
            .read_back(
                def,
                &id,
                request,
                self.config.read_back_post,
                StatusCode::CREATED,
                scope.tx(),
            )
            .await?;
        self.emit(WriteKind::Post, def, &id, &stored, scope).await;
        Ok(response)
    }

    async fn update(
        &self,
        def: &Arc<ResourceDefinition>,
        request: &Request,
        auth: &AuthContext,
        kind: WriteKind,
    ) -> Result<EngineResponse, ApiError> {
        let id = Self::require_id(request)?;
        let op = match kind {
            WriteKind::Put => OperationKind::Put,
            _ => OperationKind::Patch,
        };
        let doc = validate_document(&self.registry, def, request.body.as_ref(), op)?;
        if doc.id.as_deref() != Some(id) {
            return Err(ApiError::payload(
                "data.id",
                "the id addressed by the request",
                doc.id.as_deref().unwrap_or("absent"),
            ));
        }

        let minimal = self.load_minimal(def, id, request.transaction.as_ref()).await?;
        self.authorize_masked(def, op, auth, &minimal).await?;

        let decomposed = relationships::decompose(def, &doc.relationships)?;
        let mut attributes = doc.attributes.clone();
        if op == OperationKind::Put {
            for (name, spec) in &def.fields {
                if let Some(default) = &spec.default {
                    attributes
                        .entry(name.clone())
                        .or_insert_with(|| default.clone());
                }
            }
            // A full replace must not lose the creation timestamp or the
            // owner linkage.
            if let Some(created) = minimal.get("created_at") {
                attributes
                    .entry("created_at".to_string())
                    .or_insert_with(|| created.clone());
            }
            if ownership::applies(def) && def.owner_field != def.id_field {
                if let Some(owner) = minimal.get(&def.owner_field) {
                    attributes
                        .entry(def.owner_field.clone())
                        .or_insert_with(|| owner.clone());
                }
            }
        }
        for (field, value) in &decomposed.foreign_keys {
            attributes.insert(field.clone(), value.clone());
        }
        ownership::stamp_owner(def, auth, &mut attributes);
        Self::stamp_timestamps(def, &mut attributes, op == OperationKind::Put);

        if request.is_cancelled() {
            return Err(ApiError::Cancelled);
        }
        let scope = self.begin_scope(request).await?;
        let result: Result<EngineResponse, ApiError> = async {
            let stored = match op {
                OperationKind::Put => {
                    self.storage
                        .replace(&def.name, id, &attributes, scope.tx())
                        .await?
                }
                _ => {
                    self.storage
                        .update(&def.name, id, &attributes, scope.tx())
                        .await?
                }
            };
            self.replace_pivots(&decomposed.pivots, id, scope.tx()).await?;
            let read_back = match kind {
                WriteKind::Put => self.config.read_back_put,
                _ => self.config.read_back_patch,
            };
            let response = self
                .read_back(def, id, request, read_back, StatusCode::OK, scope.tx())
                .await?;
            self.emit(kind, def, id, &stored, &scope).await;
            Ok(response)
        }
        .await;
        match result {
            Ok(response) => {
                self.finish_ok(&scope).await?;
                Ok(response)
            }
            Err(err) => {
                self.finish_err(&scope).await;
                Err(err)
            }
        }
    }

    async fn delete(
        &self,
        def: &Arc<ResourceDefinition>,
        request: &Request,
        auth: &AuthContext,
    ) -> Result<EngineResponse, ApiError> {
        let id = Self::require_id(request)?;
        let minimal = self.load_minimal(def, id, request.transaction.as_ref()).await?;
        self.authorize_masked(def, OperationKind::Delete, auth, &minimal)
            .await?;

        if request.is_cancelled() {
            return Err(ApiError::Cancelled);
        }
        let scope = self.begin_scope(request).await?;
        let result: Result<EngineResponse, ApiError> = async {
            let removed = self.storage.delete(&def.name, id, scope.tx()).await?;
            if !removed {
                return Err(ApiError::not_found(format!(
                    "No {} with the requested id",
                    def.name
                )));
            }
            self.emit(WriteKind::Delete, def, id, &minimal, &scope).await;
            Ok(EngineResponse::no_content())
        }
        .await;
        match result {
            Ok(response) => {
                self.finish_ok(&scope).await?;
                Ok(response)
            }
            Err(err) => {
                self.finish_err(&scope).await;
                Err(err)
            }
        }
    }

    async fn insert_pivots(
        &self,
        pivots: &[relationships::PivotOp],
        parent_id: &str,
        tx: Tx<'_>,
    ) -> Result<(), ApiError> {
        for pivot in pivots {
            let rows: Vec<Record> = pivot
                .identifiers
                .iter()
                .map(|ident| {
                    let mut row = Record::new();
                    row.insert(
                        pivot.local_key.clone(),
                        Value::String(parent_id.to_string()),
                    );
                    row.insert(pivot.other_key.clone(), Value::String(ident.id.clone()));
                    row
                })
                .collect();
            if !rows.is_empty() {
                self.storage.pivot_insert(&pivot.through, &rows, tx).await?;
            }
        }
        Ok(())
    }

    /// A write that mentions a many-to-many relationship replaces its
    /// membership set.
    async fn replace_pivots(
        &self,
        pivots: &[relationships::PivotOp],
        parent_id: &str,
        tx: Tx<'_>,
    ) -> Result<(), ApiError> {
        for pivot in pivots {
            self.storage
                .pivot_delete(
                    &pivot.through,
                    &[FilterClause::eq(
                        pivot.local_key.clone(),
                        Value::String(parent_id.to_string()),
                    )],
                    tx,
                )
                .await?;
        }
        self.insert_pivots(pivots, parent_id, tx).await
    }

    async fn read_back(
        &self,
        def: &Arc<ResourceDefinition>,
        id: &str,
        request: &Request,
        mode: ReadBack,
        success: StatusCode,
        tx: Tx<'_>,
    ) -> Result<EngineResponse, ApiError> {
        match mode {
            ReadBack::None => Ok(EngineResponse::no_content()),
            ReadBack::Identifier => {
                let doc = crate::document::Document::identifiers(RelationshipData::One(Some(
                    ResourceIdentifier::new(def.name.clone(), id),
                )));
                Ok(EngineResponse {
                    status: success,
                    document: Some(to_value(&doc)),
                })
            }
            ReadBack::Full => {
                let record = self
                    .storage
                    .get(&def.name, id, None, tx)
                    .await?
                    .ok_or_else(|| ApiError::storage("written record vanished before read-back"))?;
                let includes = self
                    .expand_includes(def, std::slice::from_ref(&record), request, tx)
                    .await?;
                let doc = self.assembler(request).single(def, &record, includes.as_ref());
                Ok(EngineResponse {
                    status: success,
                    document: Some(to_value(&doc)),
                })
            }
        }
    }

    // ── Relationship endpoints ───────────────────────────────────────────

    async fn load_single_linkage(
        &self,
        def: &Arc<ResourceDefinition>,
        request: &Request,
        auth: &AuthContext,
        rel_name: &str,
    ) -> Result<(String, Record, LinkageMap, IncludedSet), ApiError> {
        let id = Self::require_id(request)?;
        let tx = request.transaction;
        let minimal = self.load_minimal(def, id, tx.as_ref()).await?;
        self.authorize_masked(def, OperationKind::Get, auth, &minimal)
            .await?;

        let record = self
            .storage
            .get(&def.name, id, None, tx.as_ref())
            .await?
            .ok_or_else(|| ApiError::not_found(format!("No {} with the requested id", def.name)))?;

        let rel = def.relationship(rel_name).ok_or_else(|| {
            ApiError::not_found(format!("No relationship {rel_name} on {}", def.name))
        })?;
        let mut linkage = LinkageMap::new();
        let mut included = IncludedSet::new();
        self.include_engine()
            .load_relationship(
                def,
                rel,
                std::slice::from_ref(&record),
                tx.as_ref(),
                &mut linkage,
                &mut included,
            )
            .await?;
        Ok((id.to_string(), record, linkage, included))
    }

    async fn related(
        &self,
        def: &Arc<ResourceDefinition>,
        request: &Request,
        auth: &AuthContext,
        rel_name: &str,
    ) -> Result<EngineResponse, ApiError> {
        let (id, _record, linkage, included) = self
            .load_single_linkage(def, request, auth, rel_name)
            .await?;
        let data = linkage
            .get(&LinkageKey::new(&def.name, &id, rel_name))
            .cloned();

        let loaded = included.into_vec();
        let assembler = self.assembler(request);
        let doc = match data {
            Some(RelationshipData::One(ident)) => {
                let object = ident.and_then(|ident| {
                    loaded
                        .iter()
                        .find(|(d, r)| {
                            d.name == ident.kind
                                && record_id(r, &d.id_field).as_deref() == Some(ident.id.as_str())
                        })
                        .map(|(d, r)| assembler.resource_object(d, r, None))
                });
                crate::document::Document::one(object)
            }
            Some(RelationshipData::Many(idents)) => {
                let objects = idents
                    .iter()
                    .filter_map(|ident| {
                        loaded
                            .iter()
                            .find(|(d, r)| {
                                d.name == ident.kind
                                    && record_id(r, &d.id_field).as_deref()
                                        == Some(ident.id.as_str())
                            })
                            .map(|(d, r)| assembler.resource_object(d, r, None))
                    })
                    .collect();
                crate::document::Document::many(objects)
            }
            None => crate::document::Document::one(None),
        };
        Ok(EngineResponse::ok(to_value(&doc)))
    }

    async fn relationship_get(
        &self,
        def: &Arc<ResourceDefinition>,
        request: &Request,
        auth: &AuthContext,
        rel_name: &str,
    ) -> Result<EngineResponse, ApiError> {
        let (id, _record, linkage, _included) = self
            .load_single_linkage(def, request, auth, rel_name)
            .await?;
        let rel = def
            .relationship(rel_name)
            .ok_or_else(|| ApiError::not_found(format!("No relationship {rel_name}")))?;
        let data = linkage
            .get(&LinkageKey::new(&def.name, &id, rel_name))
            .cloned()
            .unwrap_or(if rel.is_to_many() {
                RelationshipData::Many(Vec::new())
            } else {
                RelationshipData::One(None)
            });
        let doc = self.assembler(request).identifiers(def, &id, rel_name, data);
        Ok(EngineResponse::ok(to_value(&doc)))
    }

    async fn relationship_write(
        &self,
        def: &Arc<ResourceDefinition>,
        request: &Request,
        auth: &AuthContext,
        rel_name: &str,
        mode: RelWrite,
    ) -> Result<EngineResponse, ApiError> {
        let id = Self::require_id(request)?;
        let minimal = self.load_minimal(def, id, request.transaction.as_ref()).await?;
        self.authorize_masked(def, OperationKind::Patch, auth, &minimal)
            .await?;

        let rel = def.relationship(rel_name).ok_or_else(|| {
            ApiError::not_found(format!("No relationship {rel_name} on {}", def.name))
        })?;
        let data = validate_relationship_payload(
            &self.registry,
            request.body.as_ref(),
            rel.is_to_many(),
        )?;

        if request.is_cancelled() {
            return Err(ApiError::Cancelled);
        }
        let kind = rel.kind.clone();
        let scope = self.begin_scope(request).await?;
        let result = self
            .relationship_write_inner(def, rel_name, &kind, id, &data, mode, &scope)
            .await;
        match result {
            Ok(()) => {
                self.emit(WriteKind::Patch, def, id, &minimal, &scope).await;
                self.finish_ok(&scope).await?;
                Ok(EngineResponse::no_content())
            }
            Err(err) => {
                self.finish_err(&scope).await;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn relationship_write_inner(
        &self,
        def: &Arc<ResourceDefinition>,
        rel_name: &str,
        kind: &RelationshipKind,
        id: &str,
        data: &RelationshipData,
        mode: RelWrite,
        scope: &TxScope,
    ) -> Result<(), ApiError> {
        let path = format!("data.relationships.{rel_name}");
        match kind {
            RelationshipKind::BelongsTo {
                target,
                foreign_key,
            } => {
                if mode != RelWrite::Replace {
                    return Err(ApiError::payload(
                        &path,
                        "PATCH on a to-one relationship",
                        "POST/DELETE",
                    ));
                }
                let RelationshipData::One(ident) = data else {
                    return Err(ApiError::payload(&path, "a single identifier", "an array"));
                };
                let value = match ident {
                    None => Value::Null,
                    Some(ident) => {
                        if ident.kind != *target {
                            return Err(ApiError::violation(
                                format!("{path}.data.type"),
                                "target_mismatch",
                                format!("Expected type {target}, received {}", ident.kind),
                            ));
                        }
                        Value::String(ident.id.clone())
                    }
                };
                let mut patch = Record::new();
                patch.insert(foreign_key.clone(), value);
                self.storage.update(&def.name, id, &patch, scope.tx()).await?;
            }
            RelationshipKind::PolymorphicBelongsTo {
                allowed,
                type_field,
                id_field,
            } => {
                if mode != RelWrite::Replace {
                    return Err(ApiError::payload(
                        &path,
                        "PATCH on a to-one relationship",
                        "POST/DELETE",
                    ));
                }
                let RelationshipData::One(ident) = data else {
                    return Err(ApiError::payload(&path, "a single identifier", "an array"));
                };
                let mut patch = Record::new();
                match ident {
                    None => {
                        patch.insert(type_field.clone(), Value::Null);
                        patch.insert(id_field.clone(), Value::Null);
                    }
                    Some(ident) => {
                        if !allowed.contains(&ident.kind) {
                            return Err(ApiError::violation(
                                format!("{path}.data.type"),
                                "invalid_polymorphic_type",
                                format!("Type {} is not allowed for {rel_name}", ident.kind),
                            ));
                        }
                        patch.insert(type_field.clone(), Value::String(ident.kind.clone()));
                        patch.insert(id_field.clone(), Value::String(ident.id.clone()));
                    }
                }
                self.storage.update(&def.name, id, &patch, scope.tx()).await?;
            }
            RelationshipKind::ManyToMany {
                target,
                through,
                local_key,
                other_key,
            } => {
                let idents = expect_many(data, &path)?;
                for ident in idents {
                    if ident.kind != *target {
                        return Err(ApiError::violation(
                            format!("{path}.data.type"),
                            "target_mismatch",
                            format!("Expected type {target}, received {}", ident.kind),
                        ));
                    }
                }
                match mode {
                    RelWrite::Replace => {
                        self.storage
                            .pivot_delete(
                                through,
                                &[FilterClause::eq(
                                    local_key.clone(),
                                    Value::String(id.to_string()),
                                )],
                                scope.tx(),
                            )
                            .await?;
                        self.insert_pivot_rows(through, local_key, other_key, id, idents, scope)
                            .await?;
                    }
                    RelWrite::Add => {
                        self.insert_pivot_rows(through, local_key, other_key, id, idents, scope)
                            .await?;
                    }
                    RelWrite::Remove => {
                        let ids: Vec<String> =
                            idents.iter().map(|ident| ident.id.clone()).collect();
                        self.storage
                            .pivot_delete(
                                through,
                                &[
                                    FilterClause::eq(
                                        local_key.clone(),
                                        Value::String(id.to_string()),
                                    ),
                                    FilterClause::id_in(other_key.clone(), &ids),
                                ],
                                scope.tx(),
                            )
                            .await?;
                    }
                }
            }
            RelationshipKind::HasMany {
                target,
                foreign_key,
            } => {
                let idents = expect_many(data, &path)?;
                for ident in idents {
                    if ident.kind != *target {
                        return Err(ApiError::violation(
                            format!("{path}.data.type"),
                            "target_mismatch",
                            format!("Expected type {target}, received {}", ident.kind),
                        ));
                    }
                }
                match mode {
                    RelWrite::Add => {
                        for ident in idents {
                            self.repoint_child(target, &ident.id, foreign_key, Some(id), scope)
                                .await?;
                        }
                    }
                    RelWrite::Replace => {
                        let current = self
                            .storage
                            .query(
                                target,
                                &Query::new().filter(FilterClause::eq(
                                    foreign_key.clone(),
                                    Value::String(id.to_string()),
                                )),
                                scope.tx(),
                            )
                            .await?
                            .records;
                        let target_def = self.registry.require(target)?;
                        let keep: Vec<&str> =
                            idents.iter().map(|ident| ident.id.as_str()).collect();
                        for child in &current {
                            if let Some(child_id) = record_id(child, &target_def.id_field) {
                                if !keep.contains(&child_id.as_str()) {
                                    self.repoint_child(
                                        target,
                                        &child_id,
                                        foreign_key,
                                        None,
                                        scope,
                                    )
                                    .await?;
                                }
                            }
                        }
                        for ident in idents {
                            self.repoint_child(target, &ident.id, foreign_key, Some(id), scope)
                                .await?;
                        }
                    }
                    RelWrite::Remove => {
                        for ident in idents {
                            // Only detach children actually pointing here.
                            let child = self
                                .storage
                                .get_minimal(target, &ident.id, scope.tx())
                                .await?;
                            let points_here = child
                                .as_ref()
                                .and_then(|c| c.get(foreign_key))
                                .and_then(japi_data::id_string)
                                .as_deref()
                                == Some(id);
                            if points_here {
                                self.repoint_child(target, &ident.id, foreign_key, None, scope)
                                    .await?;
                            }
                        }
                    }
                }
            }
            RelationshipKind::ReversePolymorphic { .. } => {
                return Err(ApiError::payload(
                    &path,
                    "a writable relationship",
                    "a reverse polymorphic relationship",
                ));
            }
        }
        Ok(())
    }

    async fn insert_pivot_rows(
        &self,
        through: &str,
        local_key: &str,
        other_key: &str,
        parent_id: &str,
        idents: &[ResourceIdentifier],
        scope: &TxScope,
    ) -> Result<(), ApiError> {
        let rows: Vec<Record> = idents
            .iter()
            .map(|ident| {
                let mut row = Record::new();
                row.insert(local_key.to_string(), Value::String(parent_id.to_string()));
                row.insert(other_key.to_string(), Value::String(ident.id.clone()));
                row
            })
            .collect();
        if !rows.is_empty() {
            self.storage.pivot_insert(through, &rows, scope.tx()).await?;
        }
        Ok(())
    }

    async fn repoint_child(
        &self,
        target: &str,
        child_id: &str,
        foreign_key: &str,
        parent: Option<&str>,
        scope: &TxScope,
    ) -> Result<(), ApiError> {
        let mut patch = Record::new();
        patch.insert(
            foreign_key.to_string(),
            match parent {
                Some(parent) => Value::String(parent.to_string()),
                None => Value::Null,
            },
        );
        self.storage
            .update(target, child_id, &patch, scope.tx())
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelWrite {
    Add,
    Replace,
    Remove,
}

fn expect_many<'d>(
    data: &'d RelationshipData,
    path: &str,
) -> Result<&'d [ResourceIdentifier], ApiError> {
    match data {
        RelationshipData::Many(idents) => Ok(idents),
        RelationshipData::One(_) => Err(ApiError::payload(
            path,
            "an identifier array",
            "a single identifier",
        )),
    }
}

/// Assembles an [`Engine`]: resources, checkers, storage, auth, sink,
/// config. Terminated by [`build`](Self::build), which freezes the
/// registries.
pub struct EngineBuilder {
    registry: RegistryBuilder,
    checkers: CheckerRegistry,
    storage: Arc<dyn StorageAdapter>,
    auth_provider: Arc<dyn AuthProvider>,
    sink: Option<Arc<dyn ChangeSink>>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            registry: RegistryBuilder::new(),
            checkers: CheckerRegistry::new(),
            storage,
            auth_provider: Arc::new(AnonymousProvider),
            sink: None,
            config: EngineConfig::default(),
        }
    }

    pub fn resource(mut self, definition: ResourceDefinition) -> Self {
        self.registry = self.registry.register(definition);
        self
    }

    pub fn checker(mut self, name: impl Into<String>, checker: Arc<dyn Checker>) -> Self {
        self.checkers.register(name, checker);
        self
    }

    pub fn checker_fn<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&AuthContext, &crate::auth::CheckerContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.checkers.register_fn(name, f);
        self
    }

    pub fn auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth_provider = provider;
        self
    }

    pub fn change_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Install a plugin: a composable unit that registers resources and
    /// checkers.
    pub fn with<P: EnginePlugin>(self, plugin: P) -> Self {
        plugin.install(self)
    }

    /// Freeze the registries and produce the engine.
    pub fn build(self) -> Result<Engine, SchemaError> {
        Ok(Engine {
            registry: Arc::new(self.registry.freeze()?),
            checkers: Arc::new(self.checkers),
            storage: self.storage,
            auth_provider: self.auth_provider,
            sink: self.sink,
            config: self.config,
        })
    }
}
