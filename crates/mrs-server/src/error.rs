use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

/// The stable error-code taxonomy clients can match on, each bound to one
/// HTTP status. A single `IntoResponse`-implementing error type fed by
/// `#[from]` conversions from every layer, the same split
/// `noosphere-gateway::GatewayError` uses.
pub enum ApiError {
    InvalidGeometry(String),
    InvalidUri(String),
    MissingField(String),
    TypeMismatch(String),
    Unauthorized(String),
    Forbidden(String),
    NotAuthoritative { origin_server: String },
    NotFound,
    Conflict(String),
    CursorExpired,
    Internal(anyhow::Error),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidGeometry(_) => "invalid_geometry",
            ApiError::InvalidUri(_) => "invalid_uri",
            ApiError::MissingField(_) => "missing_field",
            ApiError::TypeMismatch(_) => "type_mismatch",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotAuthoritative { .. } => "not_authoritative",
            ApiError::NotFound => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::CursorExpired => "cursor_expired",
            ApiError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidGeometry(_)
            | ApiError::InvalidUri(_)
            | ApiError::MissingField(_)
            | ApiError::TypeMismatch(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) | ApiError::NotAuthoritative { .. } => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::CursorExpired => StatusCode::GONE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::InvalidGeometry(m) | ApiError::InvalidUri(m) => m.clone(),
            ApiError::MissingField(m) => format!("missing required field {m}"),
            ApiError::TypeMismatch(m) => m.clone(),
            ApiError::Unauthorized(m) | ApiError::Forbidden(m) => m.clone(),
            ApiError::NotAuthoritative { origin_server } => {
                format!("record is owned by origin server {origin_server}")
            }
            ApiError::NotFound => "no such registration".to_string(),
            ApiError::Conflict(m) => m.clone(),
            ApiError::CursorExpired => "requested cursor predates the retained change log".to_string(),
            ApiError::Internal(_) => "internal server error".to_string(),
        }
    }

    fn detail(&self) -> Option<Value> {
        match self {
            ApiError::NotAuthoritative { origin_server } => {
                Some(json!({ "origin_server": origin_server }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(error) = &self {
            tracing::error!(%error, "internal server error");
        }
        let status = self.status();
        let mut body = json!({
            "status": "error",
            "error": self.code(),
            "message": self.message(),
        });
        if let Some(detail) = self.detail() {
            body["detail"] = detail;
        }
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        ApiError::Internal(error)
    }
}

impl From<mrs_geometry::GeometryError> for ApiError {
    fn from(error: mrs_geometry::GeometryError) -> Self {
        ApiError::InvalidGeometry(error.to_string())
    }
}

impl From<mrs_registry::RegistryError> for ApiError {
    fn from(error: mrs_registry::RegistryError) -> Self {
        match error {
            mrs_registry::RegistryError::InvalidGeometry(e) => ApiError::InvalidGeometry(e.to_string()),
            mrs_registry::RegistryError::InvalidUri(u) => {
                ApiError::InvalidUri(format!("service_point {u:?} is not a valid https URI"))
            }
            mrs_registry::RegistryError::InvalidRange(r) => {
                ApiError::InvalidGeometry(format!("search range must be >= 0, got {r}"))
            }
            mrs_registry::RegistryError::NotFound => ApiError::NotFound,
            mrs_registry::RegistryError::NotOwner { caller } => {
                ApiError::Forbidden(format!("{caller} does not own this registration"))
            }
            mrs_registry::RegistryError::NotAuthoritative { origin_server } => {
                ApiError::NotAuthoritative { origin_server }
            }
            mrs_registry::RegistryError::Store(e) => ApiError::Internal(anyhow::anyhow!(e)),
        }
    }
}

impl From<mrs_store::StoreError> for ApiError {
    fn from(error: mrs_store::StoreError) -> Self {
        match error {
            mrs_store::StoreError::CursorExpired => ApiError::CursorExpired,
            mrs_store::StoreError::NotFound => ApiError::NotFound,
            mrs_store::StoreError::CanonicalConflict(id) => ApiError::Conflict(format!(
                "({}, {}) is already bound to a different local record",
                id.origin_server, id.origin_id
            )),
            other => ApiError::Internal(anyhow::anyhow!(other)),
        }
    }
}

impl From<mrs_auth::AuthError> for ApiError {
    fn from(error: mrs_auth::AuthError) -> Self {
        match error {
            mrs_auth::AuthError::Malformed => {
                ApiError::Unauthorized("missing or malformed credentials".to_string())
            }
            mrs_auth::AuthError::InvalidCredentials => {
                ApiError::Unauthorized("invalid credentials".to_string())
            }
            mrs_auth::AuthError::Expired => {
                ApiError::Unauthorized("credentials have expired".to_string())
            }
            mrs_auth::AuthError::Forbidden { caller } => {
                ApiError::Forbidden(format!("{caller} is not authorized for this operation"))
            }
            mrs_auth::AuthError::Store(e) => ApiError::Internal(anyhow::anyhow!(e)),
            mrs_auth::AuthError::Key(e) => ApiError::Unauthorized(e.to_string()),
        }
    }
}

impl From<mrs_federation::FederationError> for ApiError {
    fn from(error: mrs_federation::FederationError) -> Self {
        match error {
            mrs_federation::FederationError::CursorExpired => ApiError::CursorExpired,
            other => ApiError::Internal(anyhow::anyhow!(other)),
        }
    }
}
