//! Token verifier capability and the shipped symmetric-key verifier.
//!
//! Remote key sets (JWKS) are an external collaborator: implement
//! [`TokenVerifier`] over your key-fetching stack and hand it to a
//! provider.

use std::collections::HashMap;

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::AuthError;

/// Verifies an opaque token string into raw claims.
#[async_trait::async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Value, AuthError>;
}

/// Symmetric-secret JWT verifier (HS256/HS384/HS512).
pub struct HmacVerifier {
    key: DecodingKey,
    allowed_algorithms: Vec<Algorithm>,
    issuer: Option<String>,
    audience: Option<String>,
}

impl HmacVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            allowed_algorithms: vec![Algorithm::HS256],
            issuer: None,
            audience: None,
        }
    }

    pub fn with_allowed_algorithms(
        mut self,
        algorithms: impl IntoIterator<Item = Algorithm>,
    ) -> Self {
        self.allowed_algorithms = algorithms.into_iter().collect();
        self
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }
}

#[async_trait::async_trait]
impl TokenVerifier for HmacVerifier {
    async fn verify(&self, token: &str) -> Result<Value, AuthError> {
        let header = decode_header(token)
            .map_err(|e| AuthError::InvalidToken(format!("failed to decode header: {e}")))?;
        let algorithm = header.alg;
        debug!(?algorithm, "decoded token header");

        if !self.allowed_algorithms.contains(&algorithm) {
            return Err(AuthError::DisallowedAlgorithm(format!("{algorithm:?}")));
        }

        let mut validation = Validation::new(algorithm);
        validation.algorithms = self.allowed_algorithms.clone();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &self.audience {
            validation.set_audience(&[audience]);
        }

        let data = decode::<Value>(token, &self.key, &validation).map_err(|e| {
            let err = match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                jsonwebtoken::errors::ErrorKind::InvalidIssuer => {
                    AuthError::ValidationFailed("invalid issuer".into())
                }
                jsonwebtoken::errors::ErrorKind::InvalidAudience => {
                    AuthError::ValidationFailed("invalid audience".into())
                }
                _ => AuthError::InvalidToken(e.to_string()),
            };
            warn!(error = %err, "token validation failed");
            err
        })?;
        Ok(data.claims)
    }
}

/// Fixed token → claims map, for tests and local tooling.
#[derive(Default)]
pub struct StaticVerifier {
    tokens: HashMap<String, Value>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, claims: Value) -> Self {
        self.tokens.insert(token.into(), claims);
        self
    }
}

#[async_trait::async_trait]
impl TokenVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<Value, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::InvalidToken("unknown token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn token(secret: &[u8], claims: &Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret),
        )
        .unwrap()
    }

    fn far_future() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[tokio::test]
    async fn verifies_a_valid_token() {
        let secret = b"top secret";
        let claims = json!({"sub": "auth0|42", "exp": far_future()});
        let verifier = HmacVerifier::new(secret);
        let verified = verifier.verify(&token(secret, &claims)).await.unwrap();
        assert_eq!(verified["sub"], "auth0|42");
    }

    #[tokio::test]
    async fn rejects_a_wrong_secret() {
        let claims = json!({"sub": "x", "exp": far_future()});
        let verifier = HmacVerifier::new(b"right");
        let err = verifier.verify(&token(b"wrong", &claims)).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn rejects_an_expired_token() {
        let secret = b"s";
        let claims = json!({"sub": "x", "exp": chrono::Utc::now().timestamp() - 60});
        let verifier = HmacVerifier::new(secret);
        let err = verifier.verify(&token(secret, &claims)).await.unwrap_err();
        assert!(matches!(err, AuthError::TokenExpired));
    }

    #[tokio::test]
    async fn rejects_a_wrong_issuer() {
        let secret = b"s";
        let claims = json!({"sub": "x", "exp": far_future(), "iss": "them"});
        let verifier = HmacVerifier::new(secret).with_issuer("us");
        let err = verifier.verify(&token(secret, &claims)).await.unwrap_err();
        assert!(matches!(err, AuthError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn static_verifier_serves_fixed_claims() {
        let verifier = StaticVerifier::new().with_token("t1", json!({"sub": "u1"}));
        assert_eq!(verifier.verify("t1").await.unwrap()["sub"], "u1");
        assert!(verifier.verify("t2").await.is_err());
    }
}
