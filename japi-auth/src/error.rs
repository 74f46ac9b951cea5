use japi_core::ApiError;

/// Token verification failures.
#[derive(Debug)]
pub enum AuthError {
    /// The token is malformed or its signature does not verify.
    InvalidToken(String),

    /// The token has expired.
    TokenExpired,

    /// The token's algorithm is not in the verifier's allowed set.
    DisallowedAlgorithm(String),

    /// Claim validation failed (issuer, audience, or other mismatch).
    ValidationFailed(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidToken(msg) => write!(f, "Invalid token: {msg}"),
            AuthError::TokenExpired => write!(f, "Token expired"),
            AuthError::DisallowedAlgorithm(alg) => write!(f, "Disallowed algorithm: {alg}"),
            AuthError::ValidationFailed(msg) => write!(f, "Token validation failed: {msg}"),
        }
    }
}

impl std::error::Error for AuthError {}

impl AuthError {
    /// What the wire sees. Verification detail stays in the logs.
    pub fn public_message(&self) -> &'static str {
        "Token verification failed"
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::authentication(err.public_message())
    }
}
