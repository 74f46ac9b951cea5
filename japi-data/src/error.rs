/// Errors that can occur in the storage layer.
#[derive(Debug)]
pub enum StorageError {
    /// The resource/table is not known to the backend.
    UnknownResource(String),
    /// A unique constraint was violated on the named field.
    UniqueViolation { resource: String, field: String },
    /// The backend does not support a required feature
    /// (e.g. `window_functions`).
    Unsupported { feature: String },
    /// The transaction handle is not (or no longer) open.
    InvalidTransaction,
    /// Anything else propagated from the backend driver.
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl StorageError {
    /// Construct a `Backend` variant from any error type.
    ///
    /// Used by backend crates to wrap driver-specific errors.
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StorageError::Backend(Box::new(err))
    }

    pub fn unsupported(feature: impl Into<String>) -> Self {
        StorageError::Unsupported {
            feature: feature.into(),
        }
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::UnknownResource(name) => write!(f, "Unknown resource: {name}"),
            StorageError::UniqueViolation { resource, field } => {
                write!(f, "Unique violation on {resource}.{field}")
            }
            StorageError::Unsupported { feature } => {
                write!(f, "Backend does not support: {feature}")
            }
            StorageError::InvalidTransaction => write!(f, "Transaction is not open"),
            StorageError::Backend(err) => write!(f, "Storage error: {err}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Backend(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
