//! The auth-context builder: token → verified claims → [`AuthContext`],
//! with local user linking.
//!
//! Flow per request: no token ⇒ anonymous; verified-but-revoked ⇒
//! anonymous; present-but-invalid ⇒ authentication error; verified ⇒
//! claims extracted by the provider's field mapping, then linked to a
//! local user row (by provider id, then optionally by email, else a new
//! row is created).

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use japi_core::auth::{AuthContext, AuthProvider};
use japi_core::ApiError;
use japi_data::{record_id, FilterClause, Query, Record, StorageAdapter, StorageError};

use crate::provider::{Provider, ProviderRegistry};
use crate::revocation::RevocationStore;

/// Builds [`AuthContext`]s for the engine. Implements the core
/// [`AuthProvider`] capability.
pub struct AuthContextBuilder {
    providers: ProviderRegistry,
    revocations: Option<Arc<dyn RevocationStore>>,
    storage: Option<Arc<dyn StorageAdapter>>,
    users_resource: String,
    email_column: String,
}

impl AuthContextBuilder {
    pub fn new(providers: ProviderRegistry) -> Self {
        Self {
            providers,
            revocations: None,
            storage: None,
            users_resource: "users".to_string(),
            email_column: "email".to_string(),
        }
    }

    /// Consult a revocation store before trusting verified tokens.
    pub fn with_revocations(mut self, store: Arc<dyn RevocationStore>) -> Self {
        self.revocations = Some(store);
        self
    }

    /// Link verified subjects to rows of the users resource. Without
    /// storage, contexts carry only the provider identity.
    pub fn with_user_store(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_users_resource(mut self, resource: impl Into<String>) -> Self {
        self.users_resource = resource.into();
        self
    }

    pub fn with_email_column(mut self, column: impl Into<String>) -> Self {
        self.email_column = column.into();
        self
    }

    async fn find_user_by(
        &self,
        storage: &Arc<dyn StorageAdapter>,
        column: &str,
        value: &str,
    ) -> Result<Option<String>, ApiError> {
        let query = Query::new().filter(FilterClause::eq(
            column.to_string(),
            Value::String(value.to_string()),
        ));
        let result = storage.query(&self.users_resource, &query, None).await?;
        Ok(result
            .records
            .first()
            .and_then(|record| record_id(record, "id")))
    }

    /// Link by provider id, then (if enabled) by email, else create.
    /// On a unique violation the provider-id lookup is retried once;
    /// persistent contention surfaces as a conflict.
    async fn link_user(
        &self,
        storage: &Arc<dyn StorageAdapter>,
        provider: &Provider,
        provider_id: &str,
        email: Option<&str>,
    ) -> Result<Option<String>, ApiError> {
        if let Some(id) = self
            .find_user_by(storage, &provider.id_column, provider_id)
            .await?
        {
            return Ok(Some(id));
        }

        if provider.link_by_email {
            if let Some(email) = email {
                if let Some(id) = self.find_user_by(storage, &self.email_column, email).await? {
                    let mut claim = Record::new();
                    claim.insert(
                        provider.id_column.clone(),
                        Value::String(provider_id.to_string()),
                    );
                    return match storage
                        .update(&self.users_resource, &id, &claim, None)
                        .await
                    {
                        Ok(_) => {
                            debug!(user = %id, provider = %provider.name, "linked user by email");
                            Ok(Some(id))
                        }
                        Err(StorageError::UniqueViolation { .. }) => {
                            self.retry_by_provider_id(storage, provider, provider_id).await
                        }
                        Err(other) => Err(other.into()),
                    };
                }
            }
        }

        let mut row = Record::new();
        row.insert(
            provider.id_column.clone(),
            Value::String(provider_id.to_string()),
        );
        if let Some(email) = email {
            row.insert(self.email_column.clone(), Value::String(email.to_string()));
        }
        match storage.insert(&self.users_resource, &row, None).await {
            Ok(record) => {
                let id = record_id(&record, "id");
                debug!(user = ?id, provider = %provider.name, "created local user");
                Ok(id)
            }
            Err(StorageError::UniqueViolation { .. }) => {
                self.retry_by_provider_id(storage, provider, provider_id).await
            }
            Err(other) => Err(other.into()),
        }
    }

    async fn retry_by_provider_id(
        &self,
        storage: &Arc<dyn StorageAdapter>,
        provider: &Provider,
        provider_id: &str,
    ) -> Result<Option<String>, ApiError> {
        match self
            .find_user_by(storage, &provider.id_column, provider_id)
            .await?
        {
            Some(id) => Ok(Some(id)),
            None => Err(ApiError::conflict(
                "Concurrent login produced a conflicting user record",
            )),
        }
    }
}

fn claim_string(claims: &Value, name: &str) -> Option<String> {
    match claims.get(name)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn claim_roles(claims: &Value, name: &str) -> Vec<String> {
    claims
        .get(name)
        .and_then(Value::as_array)
        .map(|roles| {
            roles
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl AuthProvider for AuthContextBuilder {
    async fn build(
        &self,
        token: Option<&str>,
        provider: Option<&str>,
    ) -> Result<AuthContext, ApiError> {
        let Some(token) = token else {
            return Ok(AuthContext::anonymous());
        };

        let provider = self.providers.resolve(provider)?;
        let claims = provider.verifier.verify(token).await.map_err(|err| {
            warn!(provider = %provider.name, error = %err, "token rejected");
            ApiError::from(err)
        })?;

        let token_id = claim_string(&claims, &provider.token_id_claim);
        if let (Some(jti), Some(store)) = (&token_id, &self.revocations) {
            if store.is_revoked(jti, Utc::now()).await {
                debug!(jti = %jti, "token revoked; treating caller as anonymous");
                return Ok(AuthContext::anonymous());
            }
        }

        let provider_id = claim_string(&claims, &provider.user_id_claim);
        let email = claim_string(&claims, &provider.email_claim);
        let roles = claim_roles(&claims, &provider.roles_claim);

        let user_id = match (&self.storage, &provider_id) {
            (Some(storage), Some(provider_id)) => {
                self.link_user(storage, provider, provider_id, email.as_deref())
                    .await?
            }
            _ => None,
        };

        Ok(AuthContext {
            user_id,
            provider_id,
            email,
            roles,
            claims,
            token_id,
            system: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revocation::MemoryRevocationStore;
    use crate::verifier::StaticVerifier;
    use japi_data_memory::MemoryBackend;
    use serde_json::json;

    fn builder(storage: Arc<dyn StorageAdapter>) -> AuthContextBuilder {
        let verifier = StaticVerifier::new()
            .with_token(
                "alice",
                json!({"sub": "auth0|alice", "email": "alice@example.com",
                    "roles": ["editor"], "jti": "jti-alice"}),
            )
            .with_token("bob", json!({"sub": "auth0|bob", "jti": "jti-bob"}));
        let provider =
            Provider::new("auth0", Arc::new(verifier)).with_link_by_email(true);
        AuthContextBuilder::new(ProviderRegistry::new(provider)).with_user_store(storage)
    }

    fn memory() -> Arc<dyn StorageAdapter> {
        Arc::new(MemoryBackend::new().with_unique("users", "email"))
    }

    #[tokio::test]
    async fn no_token_is_anonymous() {
        let builder = builder(memory());
        let ctx = builder.build(None, None).await.unwrap();
        assert!(!ctx.is_authenticated());
    }

    #[tokio::test]
    async fn invalid_token_is_rejected() {
        let builder = builder(memory());
        let err = builder.build(Some("nonsuch"), None).await.unwrap_err();
        assert_eq!(err.status(), http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn first_login_creates_and_second_reuses_the_local_user() {
        let storage = memory();
        let builder = builder(storage.clone());

        let first = builder.build(Some("alice"), None).await.unwrap();
        assert_eq!(first.provider_id.as_deref(), Some("auth0|alice"));
        assert_eq!(first.email.as_deref(), Some("alice@example.com"));
        assert_eq!(first.roles, vec!["editor"]);
        let user_id = first.user_id.clone().expect("linked");

        let second = builder.build(Some("alice"), None).await.unwrap();
        assert_eq!(second.user_id.as_deref(), Some(user_id.as_str()));

        let rows = storage
            .query("users", &Query::new(), None)
            .await
            .unwrap()
            .records;
        assert_eq!(rows.len(), 1, "no duplicate user rows");
    }

    #[tokio::test]
    async fn link_by_email_claims_an_existing_row() {
        let storage = memory();
        let mut row = Record::new();
        row.insert("email".into(), json!("alice@example.com"));
        row.insert("name".into(), json!("Alice"));
        storage.insert("users", &row, None).await.unwrap();

        let builder = builder(storage.clone());
        let ctx = builder.build(Some("alice"), None).await.unwrap();
        assert_eq!(ctx.user_id.as_deref(), Some("1"));

        let rows = storage
            .query("users", &Query::new(), None)
            .await
            .unwrap()
            .records;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["auth0_id"], json!("auth0|alice"));
    }

    #[tokio::test]
    async fn revoked_token_degrades_to_anonymous() {
        let storage = memory();
        let revocations = Arc::new(MemoryRevocationStore::new());
        let now = Utc::now();
        revocations
            .revoke("jti-bob", None, now + chrono::Duration::hours(1), now)
            .await;

        let builder = builder(storage).with_revocations(revocations);
        let ctx = builder.build(Some("bob"), None).await.unwrap();
        assert!(!ctx.is_authenticated());

        let ctx = builder.build(Some("alice"), None).await.unwrap();
        assert!(ctx.is_authenticated());
    }
}
