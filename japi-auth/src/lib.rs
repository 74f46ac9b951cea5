//! # japi-auth — Token verification and auth-context building
//!
//! Implements the engine's [`AuthProvider`](japi_core::auth::AuthProvider)
//! capability: opaque token → verified claims → [`AuthContext`] with a
//! linked local user.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`TokenVerifier`] | Verification capability; ships [`HmacVerifier`] (symmetric JWT) and [`StaticVerifier`] (tests) |
//! | [`Provider`] / [`ProviderRegistry`] | Per-issuer claim mapping, link-by-email flag, default provider |
//! | [`RevocationStore`] / [`MemoryRevocationStore`] | `jti` revocation lookup with a periodic [`spawn_pruner`] task |
//! | [`AuthContextBuilder`] | The full pipeline, including user linking with one conflict retry |
//! | [`AuthError`] | Verification failures; maps to a generic 401 |
//!
//! Remote key sets (JWKS) are an external collaborator: implement
//! [`TokenVerifier`] over your key-fetching stack and register it as a
//! provider.
//!
//! [`AuthContext`]: japi_core::AuthContext

pub mod context;
pub mod error;
pub mod provider;
pub mod revocation;
pub mod verifier;

pub use context::AuthContextBuilder;
pub use error::AuthError;
pub use provider::{Provider, ProviderRegistry};
pub use revocation::{spawn_pruner, MemoryRevocationStore, RevocationStore};
pub use verifier::{HmacVerifier, StaticVerifier, TokenVerifier};

/// Re-exports of the most commonly used auth types.
pub mod prelude {
    pub use crate::{
        AuthContextBuilder, AuthError, HmacVerifier, MemoryRevocationStore, Provider,
        ProviderRegistry, RevocationStore, TokenVerifier,
    };
}
