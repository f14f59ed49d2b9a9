use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;

use crate::error::ApiError;
use crate::state::{AppState, Caller};

/// Resolves either a `Authorization: Bearer <token>` header or the
/// `MRS-Identity` / `Signature-Input` / `Signature` / `Content-Digest`
/// header set into an authenticated [Caller]. Mirrors the shape of
/// `noosphere-gateway`'s extractor module: auth lives behind a single
/// `FromRequestParts` impl so handlers just take `Caller` as an argument.
pub struct AuthenticatedRequest(pub Caller);

impl<S> FromRequestParts<S> for AuthenticatedRequest
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);
        let now = mrs_auth::now();

        if let Ok(TypedHeader(Authorization(bearer))) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state).await
        {
            let caller =
                mrs_auth::verify_bearer_token(app_state.store.as_ref(), bearer.token(), now).await?;
            return Ok(AuthenticatedRequest(caller));
        }

        let header = |name: &str| -> Result<String, ApiError> {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| ApiError::Unauthorized(format!("missing {name} header")))
        };

        let mrs_identity = header("mrs-identity")?;
        let signature_input = header("signature-input")?;
        let signature = header("signature")?;
        let content_digest = parts
            .headers
            .get("content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = parts
            .extensions
            .get::<BufferedBody>()
            .map(|b| b.0.clone())
            .unwrap_or_default();

        let ctx = mrs_auth::SignatureContext {
            method: parts.method.as_str(),
            path: parts.uri.path(),
            mrs_identity: &mrs_identity,
            signature_input: &signature_input,
            signature: &signature,
            content_digest: content_digest.as_deref(),
            body: &body,
        };

        let caller =
            mrs_auth::verify_http_signature(app_state.store.as_ref(), &app_state.key_fetcher, &ctx, now)
                .await?;
        Ok(AuthenticatedRequest(caller))
    }
}

/// Request body bytes, buffered once by the `body_buffering` middleware
/// so both JSON extraction and signature verification can read it.
#[derive(Clone, Default)]
pub struct BufferedBody(pub axum::body::Bytes);
