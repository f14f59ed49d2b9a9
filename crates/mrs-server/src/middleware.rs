use axum::body::Body;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ApiError;
use crate::extractors::BufferedBody;

/// Buffers the whole request body into an extension so that both the
/// authentication extractor (which needs it to check `Content-Digest` and
/// a signature base) and the JSON body extractor (which runs after
/// extraction in handler argument order) can each read it.
pub async fn buffer_body(mut request: Request, next: Next) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;

    let mut rebuilt = Request::from_parts(parts, Body::from(bytes.clone()));
    rebuilt.extensions_mut().insert(BufferedBody(bytes));
    request = rebuilt;

    Ok(next.run(request).await)
}
