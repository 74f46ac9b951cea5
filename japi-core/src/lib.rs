//! # japi-core — The JSON:API request execution engine
//!
//! Turns normalized JSON:API requests into validated storage operations and
//! compound responses, over any [`StorageAdapter`](japi_data::StorageAdapter).
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`schema`] | Resource definitions, relationship topology, search schema, frozen registry |
//! | [`query`] | Query-string decoding into [`QueryParams`] |
//! | [`validator`] | Structural (400) and semantic (422) payload validation with pathed errors |
//! | [`auth`] | [`AuthContext`], the [`AuthProvider`](auth::AuthProvider) seam, checker registry and rule evaluation |
//! | [`ownership`] | Owner stamping, owner filters, 404-masking |
//! | [`relationships`] | Relationship payloads → foreign-key writes + pivot operations |
//! | [`include`] | Batched include expansion with windows, polymorphism, dedup |
//! | [`response`] | Compound document assembly, links, pagination |
//! | [`executor`] | The per-verb state machine, transactions, bulk operations |
//! | [`sink`] | Post-commit change emission toward the realtime broadcaster |
//! | [`plugin`] | Composable feature installation into the engine builder |
//! | [`error`] | The [`ApiError`] taxonomy |
//!
//! Transports, physical storage drivers, and token verifiers are external
//! collaborators reached through capability traits.

pub mod auth;
pub mod document;
pub mod error;
pub mod executor;
pub mod include;
pub mod ownership;
pub mod plugin;
pub mod query;
pub mod relationships;
pub mod response;
pub mod schema;
pub mod sink;
pub mod validator;

pub use auth::{AuthContext, CheckerRegistry};
pub use document::{Document, RelationshipData, ResourceIdentifier, ResourceObject};
pub use error::{ApiError, Violation};
pub use executor::{
    Credentials, Engine, EngineBuilder, EngineConfig, EngineResponse, Operation, ReadBack, Request,
};
pub use include::{IncludeEngine, IncludeOutput, IncludeTree};
pub use plugin::EnginePlugin;
pub use query::QueryParams;
pub use schema::{
    AuthRule, FieldKind, FieldSpec, IncludeLimit, OperationKind, Ownership, RegistryBuilder,
    RelationshipKind, RelationshipSpec, ResourceDefinition, ResourceRegistry, SchemaError,
};
pub use sink::{ChangeEvent, ChangeSink, WriteKind};
pub use validator::ValidatedDocument;

/// Re-exports of the most commonly used engine types.
pub mod prelude {
    pub use crate::auth::{AuthContext, AuthProvider, Checker, CheckerContext, CheckerRegistry};
    pub use crate::error::ApiError;
    pub use crate::executor::{
        Credentials, Engine, EngineBuilder, EngineConfig, EngineResponse, Operation, Request,
    };
    pub use crate::plugin::EnginePlugin;
    pub use crate::query::QueryParams;
    pub use crate::schema::{
        FieldSpec, IncludeLimit, OperationKind, Ownership, ResourceDefinition,
    };
    pub use crate::sink::{ChangeEvent, ChangeSink, WriteKind};
}
