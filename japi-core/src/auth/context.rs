use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The authenticated (or anonymous) caller of a request.
///
/// Produced by the auth-context builder from verified token claims, or
/// [`anonymous`](AuthContext::anonymous) when no token was presented.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthContext {
    /// Locally persisted user id, when the caller is linked to a user row.
    pub user_id: Option<String>,
    /// Provider-specific subject identifier.
    pub provider_id: Option<String>,
    pub email: Option<String>,
    pub roles: Vec<String>,
    /// Raw verified claims for advanced checkers.
    pub claims: Value,
    /// Token id (`jti`), when the token carried one.
    pub token_id: Option<String>,
    /// Internal callers (jobs, migrations) that bypass ownership.
    pub system: bool,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A system context: authenticated, ownership-exempt.
    pub fn system() -> Self {
        Self {
            system: true,
            ..Self::default()
        }
    }

    /// A context for a known local user (test and tooling convenience).
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn with_provider_id(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_token_id(mut self, token_id: impl Into<String>) -> Self {
        self.token_id = Some(token_id.into());
        self
    }

    /// True when the caller has a local user id, a provider id, or is
    /// flagged system.
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some() || self.provider_id.is_some() || self.system
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Admins (and system callers) bypass ownership enforcement.
    pub fn is_admin(&self) -> bool {
        self.system || self.has_role("admin")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_is_not_authenticated() {
        assert!(!AuthContext::anonymous().is_authenticated());
        assert!(AuthContext::system().is_authenticated());
        assert!(AuthContext::user("7").is_authenticated());
        assert!(AuthContext::anonymous()
            .with_provider_id("auth0|x")
            .is_authenticated());
    }

    #[test]
    fn admin_detection_covers_system_and_role() {
        assert!(AuthContext::system().is_admin());
        assert!(AuthContext::user("1").with_roles(["admin"]).is_admin());
        assert!(!AuthContext::user("1").with_roles(["editor"]).is_admin());
    }
}
