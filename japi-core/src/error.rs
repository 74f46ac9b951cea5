use http::StatusCode;
use serde_json::{json, Value};

use japi_data::StorageError;

/// A single semantic validation failure, addressed by a structured path
/// (e.g. `data.relationships.author.data.id`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub rule: String,
    pub message: String,
}

impl Violation {
    pub fn new(
        field: impl Into<String>,
        rule: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            rule: rule.into(),
            message: message.into(),
        }
    }
}

/// The engine's error taxonomy. Every variant carries a stable symbolic
/// [`code`](ApiError::code), maps to one [`status`](ApiError::status), and
/// renders as a JSON:API `errors` document via
/// [`to_document`](ApiError::to_document).
#[derive(Debug)]
pub enum ApiError {
    /// Structural shape mismatch in the request payload (400).
    Payload {
        message: String,
        path: String,
        expected: String,
        received: String,
    },
    /// Semantic violation against the schema (422).
    Validation { violations: Vec<Violation> },
    /// A token was presented but failed verification (401).
    Authentication { message: String },
    /// No authorization rule passed (403).
    Authorization {
        required: Vec<String>,
        reasons: Vec<String>,
    },
    /// Unknown resource, unknown id, or ownership mask (404).
    NotFound { message: String },
    /// Storage-reported unique violation during linking or upsert (409).
    Conflict { message: String },
    /// The backend lacks a feature the request requires (400).
    UnsupportedOperation {
        message: String,
        required_feature: String,
    },
    /// The client disconnected before the first write was issued (400).
    Cancelled,
    /// Everything else propagated from storage (500).
    Storage {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ApiError {
    pub fn payload(
        path: impl Into<String>,
        expected: impl Into<String>,
        received: impl Into<String>,
    ) -> Self {
        let path = path.into();
        let expected = expected.into();
        ApiError::Payload {
            message: format!("Malformed payload at {path}: expected {expected}"),
            path,
            expected,
            received: received.into(),
        }
    }

    pub fn validation(violations: Vec<Violation>) -> Self {
        ApiError::Validation { violations }
    }

    pub fn violation(
        field: impl Into<String>,
        rule: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ApiError::Validation {
            violations: vec![Violation::new(field, rule, message)],
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        ApiError::Authentication {
            message: message.into(),
        }
    }

    pub fn authorization(required: Vec<String>, reasons: Vec<String>) -> Self {
        ApiError::Authorization { required, reasons }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ApiError::Conflict {
            message: message.into(),
        }
    }

    pub fn unsupported(feature: impl Into<String>) -> Self {
        let feature = feature.into();
        ApiError::UnsupportedOperation {
            message: format!("Backend does not support required feature: {feature}"),
            required_feature: feature,
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        ApiError::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Stable symbolic name for transports and logs.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Payload { .. } => "payload_error",
            ApiError::Validation { .. } => "validation_error",
            ApiError::Authentication { .. } => "authentication_error",
            ApiError::Authorization { .. } => "access_denied",
            ApiError::NotFound { .. } => "not_found",
            ApiError::Conflict { .. } => "conflict",
            ApiError::UnsupportedOperation { .. } => "unsupported_operation",
            ApiError::Cancelled => "request_cancelled",
            ApiError::Storage { .. } => "storage_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Payload { .. } => StatusCode::BAD_REQUEST,
            ApiError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Authentication { .. } => StatusCode::UNAUTHORIZED,
            ApiError::Authorization { .. } => StatusCode::FORBIDDEN,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::UnsupportedOperation { .. } => StatusCode::BAD_REQUEST,
            ApiError::Cancelled => StatusCode::BAD_REQUEST,
            ApiError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render as a JSON:API `errors` document.
    pub fn to_document(&self) -> Value {
        let status = self.status().as_u16().to_string();
        let code = self.code();
        let errors = match self {
            ApiError::Validation { violations } => violations
                .iter()
                .map(|v| {
                    json!({
                        "status": status,
                        "code": code,
                        "title": "Validation failed",
                        "detail": v.message,
                        "source": { "pointer": v.field },
                        "meta": { "field": v.field, "rule": v.rule, "message": v.message },
                    })
                })
                .collect::<Vec<_>>(),
            ApiError::Payload {
                message,
                path,
                expected,
                received,
            } => vec![json!({
                "status": status,
                "code": code,
                "title": "Malformed payload",
                "detail": message,
                "source": { "pointer": path },
                "meta": { "path": path, "expected": expected, "received": received },
            })],
            ApiError::Authorization { required, reasons } => vec![json!({
                "status": status,
                "code": code,
                "title": "Access denied",
                "detail": self.to_string(),
                "meta": { "required": required, "reasons": reasons },
            })],
            ApiError::UnsupportedOperation {
                message,
                required_feature,
            } => vec![json!({
                "status": status,
                "code": code,
                "title": "Unsupported operation",
                "detail": message,
                "meta": { "requiredFeature": required_feature },
            })],
            other => vec![json!({
                "status": status,
                "code": code,
                "title": other.title(),
                "detail": other.to_string(),
            })],
        };
        json!({ "errors": errors })
    }

    fn title(&self) -> &'static str {
        match self {
            ApiError::Payload { .. } => "Malformed payload",
            ApiError::Validation { .. } => "Validation failed",
            ApiError::Authentication { .. } => "Authentication failed",
            ApiError::Authorization { .. } => "Access denied",
            ApiError::NotFound { .. } => "Not found",
            ApiError::Conflict { .. } => "Conflict",
            ApiError::UnsupportedOperation { .. } => "Unsupported operation",
            ApiError::Cancelled => "Request cancelled",
            ApiError::Storage { .. } => "Storage failure",
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Payload { message, .. } => write!(f, "{message}"),
            ApiError::Validation { violations } => {
                write!(f, "Validation failed: ")?;
                for (i, v) in violations.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{} ({})", v.message, v.field)?;
                }
                Ok(())
            }
            ApiError::Authentication { message } => write!(f, "Authentication failed: {message}"),
            ApiError::Authorization { required, reasons } => {
                write!(f, "Access denied: requires one of [{}]", required.join(", "))?;
                if !reasons.is_empty() {
                    write!(f, " — {}", reasons.join("; "))?;
                }
                Ok(())
            }
            ApiError::NotFound { message } => write!(f, "{message}"),
            ApiError::Conflict { message } => write!(f, "{message}"),
            ApiError::UnsupportedOperation { message, .. } => write!(f, "{message}"),
            ApiError::Cancelled => write!(f, "Client disconnected before write; request aborted"),
            ApiError::Storage { message, .. } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApiError::Storage {
                source: Some(err), ..
            } => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::UniqueViolation { resource, field } => {
                ApiError::conflict(format!("Unique constraint violated on {resource}.{field}"))
            }
            StorageError::Unsupported { feature } => ApiError::unsupported(feature),
            StorageError::UnknownResource(name) => {
                ApiError::not_found(format!("Unknown resource: {name}"))
            }
            other => ApiError::Storage {
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(
            ApiError::payload("data", "object", "null").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::violation("data.type", "known_resource", "unknown type").status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::authentication("bad signature").status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::authorization(vec!["owns".into()], vec![]).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::not_found("no such record").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::conflict("duplicate email").status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::unsupported("window_functions").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::storage("io failure").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn unsupported_names_the_feature_in_meta() {
        let doc = ApiError::unsupported("window_functions").to_document();
        assert_eq!(
            doc["errors"][0]["meta"]["requiredFeature"],
            "window_functions"
        );
        assert_eq!(doc["errors"][0]["code"], "unsupported_operation");
    }

    #[test]
    fn violations_render_one_error_each_with_pointer() {
        let err = ApiError::validation(vec![
            Violation::new("data.attributes.title", "required", "title is required"),
            Violation::new(
                "data.relationships.author.data.id",
                "non_null",
                "id must not be null",
            ),
        ]);
        let doc = err.to_document();
        let errors = doc["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors[1]["source"]["pointer"],
            "data.relationships.author.data.id"
        );
    }

    #[test]
    fn unique_violation_maps_to_conflict() {
        let err: ApiError = StorageError::UniqueViolation {
            resource: "users".into(),
            field: "email".into(),
        }
        .into();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }
}
