//! Authentication providers: a verifier plus the claim-field mapping and
//! linking configuration for one token issuer.

use std::collections::HashMap;
use std::sync::Arc;

use japi_core::ApiError;

use crate::verifier::TokenVerifier;

/// One token issuer: how to verify its tokens and which claims carry the
/// identity fields.
#[derive(Clone)]
pub struct Provider {
    pub name: String,
    pub verifier: Arc<dyn TokenVerifier>,
    /// Claim holding the provider-specific subject. Default `sub`.
    pub user_id_claim: String,
    /// Claim holding the email. Default `email`.
    pub email_claim: String,
    /// Claim holding the role list. Default `roles`.
    pub roles_claim: String,
    /// Claim holding the token id. Default `jti`.
    pub token_id_claim: String,
    /// Whether an unlinked subject may be matched to a local user by
    /// email.
    pub link_by_email: bool,
    /// The `users` column carrying this provider's subject. Default
    /// `<name>_id`.
    pub id_column: String,
}

impl Provider {
    pub fn new(name: impl Into<String>, verifier: Arc<dyn TokenVerifier>) -> Self {
        let name = name.into();
        let id_column = format!("{name}_id");
        Self {
            name,
            verifier,
            user_id_claim: "sub".to_string(),
            email_claim: "email".to_string(),
            roles_claim: "roles".to_string(),
            token_id_claim: "jti".to_string(),
            link_by_email: false,
            id_column,
        }
    }

    pub fn with_user_id_claim(mut self, claim: impl Into<String>) -> Self {
        self.user_id_claim = claim.into();
        self
    }

    pub fn with_email_claim(mut self, claim: impl Into<String>) -> Self {
        self.email_claim = claim.into();
        self
    }

    pub fn with_roles_claim(mut self, claim: impl Into<String>) -> Self {
        self.roles_claim = claim.into();
        self
    }

    pub fn with_token_id_claim(mut self, claim: impl Into<String>) -> Self {
        self.token_id_claim = claim.into();
        self
    }

    pub fn with_link_by_email(mut self, enabled: bool) -> Self {
        self.link_by_email = enabled;
        self
    }

    pub fn with_id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = column.into();
        self
    }
}

/// Registry of providers, with one designated default. Populated at
/// startup, read-only while serving.
pub struct ProviderRegistry {
    providers: HashMap<String, Provider>,
    default_provider: String,
}

impl ProviderRegistry {
    pub fn new(default_provider: Provider) -> Self {
        let name = default_provider.name.clone();
        let mut providers = HashMap::new();
        providers.insert(name.clone(), default_provider);
        Self {
            providers,
            default_provider: name,
        }
    }

    pub fn register(mut self, provider: Provider) -> Self {
        self.providers.insert(provider.name.clone(), provider);
        self
    }

    /// The provider named by the transport, or the default when absent.
    pub fn resolve(&self, name: Option<&str>) -> Result<&Provider, ApiError> {
        let name = name.unwrap_or(&self.default_provider);
        self.providers
            .get(name)
            .ok_or_else(|| ApiError::authentication(format!("Unknown auth provider: {name}")))
    }
}
