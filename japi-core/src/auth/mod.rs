//! Authentication context and the declarative authorization evaluator.

pub mod checkers;
mod context;

pub use checkers::{Checker, CheckerContext, CheckerRegistry};
pub use context::AuthContext;

use crate::error::ApiError;

/// The capability that turns a presented token into an [`AuthContext`].
///
/// Implemented by `japi-auth`; the engine only knows this seam. A request
/// without a token must yield an anonymous context; a present-but-invalid
/// token must yield an authentication error.
#[async_trait::async_trait]
pub trait AuthProvider: Send + Sync {
    async fn build(
        &self,
        token: Option<&str>,
        provider: Option<&str>,
    ) -> Result<AuthContext, ApiError>;
}

/// Provider used when no authentication stack is wired: every request is
/// anonymous, presented tokens are rejected.
pub struct AnonymousProvider;

#[async_trait::async_trait]
impl AuthProvider for AnonymousProvider {
    async fn build(
        &self,
        token: Option<&str>,
        _provider: Option<&str>,
    ) -> Result<AuthContext, ApiError> {
        match token {
            None => Ok(AuthContext::anonymous()),
            Some(_) => Err(ApiError::authentication(
                "No token verifier is configured",
            )),
        }
    }
}
