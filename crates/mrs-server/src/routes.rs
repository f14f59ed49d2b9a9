use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use mrs_geometry::{Coordinate, Geometry};
use mrs_registry::{RegisterInput, SearchQuery as RegistrySearchQuery};
use mrs_types::{Identity, Peer, Registration};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::extractors::AuthenticatedRequest;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/release", post(release))
        .route("/search", post(search))
        .route("/.well-known/mrs", get(well_known))
        .route("/.well-known/mrs/keys/:identity", get(well_known_keys))
        .route("/auth/register", post(auth_register))
        .route("/auth/login", post(auth_login))
        .route("/auth/me", get(auth_me))
        .route("/sync/snapshot", get(sync_snapshot))
        .route("/sync/changes", get(sync_changes))
        .route("/admin/peers", post(add_peer))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub space: Geometry,
    pub service_point: Option<String>,
    #[serde(default)]
    pub foad: bool,
    /// The id of an existing local record to update, when re-registering
    /// in place rather than creating a new one.
    pub id: Option<String>,
}

async fn register(
    State(state): State<AppState>,
    AuthenticatedRequest(caller): AuthenticatedRequest,
    Json(body): Json<RegisterBody>,
) -> Result<(StatusCode, Json<Registration>), ApiError> {
    let now = mrs_auth::now();
    let registration = state
        .registry
        .register(
            RegisterInput {
                space: body.space,
                service_point: body.service_point,
                foad: body.foad,
                owner: caller.identity,
                update_id: body.id,
            },
            now,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(registration)))
}

#[derive(Debug, Deserialize)]
pub struct ReleaseBody {
    pub id: String,
}

async fn release(
    State(state): State<AppState>,
    AuthenticatedRequest(caller): AuthenticatedRequest,
    Json(body): Json<ReleaseBody>,
) -> Result<Json<Registration>, ApiError> {
    let now = mrs_auth::now();
    let removed = state.registry.release(&body.id, &caller.identity, now).await?;
    Ok(Json(removed))
}

#[derive(Debug, Deserialize)]
pub struct SearchBody {
    pub location: Coordinate,
    #[serde(default)]
    pub range: f64,
    pub owner: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchResultBody {
    pub registration: Registration,
    pub distance_m: f64,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResultBody>,
    pub referrals: Vec<String>,
}

async fn search(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> Result<Json<SearchResponse>, ApiError> {
    if body.range > state.config.max_radius_m {
        return Err(ApiError::InvalidGeometry(format!(
            "search range {} exceeds the configured maximum of {}",
            body.range, state.config.max_radius_m
        )));
    }

    let owner = match body.owner {
        Some(raw) => Some(
            raw.parse::<Identity>()
                .map_err(|_| ApiError::TypeMismatch("owner was not a valid identity".to_string()))?,
        ),
        None => None,
    };

    let results = state
        .registry
        .search(RegistrySearchQuery {
            center: body.location,
            range_m: body.range,
            owner,
            limit: body.limit,
        })
        .await?;

    let referrals = state
        .federation
        .referrals(body.location, body.range)
        .await
        .map(|peers| peers.into_iter().map(|p| p.server_url).collect())
        .unwrap_or_default();

    Ok(Json(SearchResponse {
        results: results
            .into_iter()
            .map(|r| SearchResultBody {
                registration: r.registration,
                distance_m: r.distance_m,
            })
            .collect(),
        referrals,
    }))
}

async fn well_known(State(state): State<AppState>) -> Result<Json<mrs_federation::WellKnownMrs>, ApiError> {
    let known_peers = state
        .store
        .list_peers()
        .await?
        .into_iter()
        .map(|p| p.server_url)
        .collect();

    Ok(Json(mrs_federation::WellKnownMrs {
        server_url: state.config.server_url.clone(),
        authoritative_regions: None,
        admin_email: Some(state.admin_identity().to_string()),
        known_peers,
        capabilities: Some(mrs_federation::Capabilities {
            geometry_types: vec!["sphere".to_string(), "polygon".to_string()],
            max_radius: state.config.max_radius_m,
        }),
        mrs_version: Some(mrs_types::MRS_VERSION.to_string()),
    }))
}

async fn well_known_keys(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Result<Json<Vec<mrs_types::Key>>, ApiError> {
    let now = mrs_auth::now();
    if identity == format!("_server@{}", state.config.server_domain) {
        return Ok(Json(vec![state.server_key_record(now)]));
    }
    Ok(Json(state.store.list_keys(&identity).await?))
}

#[derive(Debug, Deserialize)]
pub struct RegisterKeyBody {
    pub identity: String,
    pub key_id: String,
    pub algorithm: mrs_types::KeyAlgorithm,
    pub public_key_b64: String,
    /// Signature over `"{identity}:{key_id}"` under the key being
    /// published -- proof of possession for a brand-new identity this
    /// server has no other way to have learned about yet.
    pub proof_b64: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterKeyResponse {
    pub identity: String,
}

/// First-use key publication: the request proves possession of the
/// private key inline (the body itself is self-signed) rather than via
/// the general HTTP-signature path, since that path requires a key
/// already on file -- this is how one gets put there in the first place.
async fn auth_register(
    State(state): State<AppState>,
    Json(body): Json<RegisterKeyBody>,
) -> Result<(StatusCode, Json<RegisterKeyResponse>), ApiError> {
    use base64::Engine;
    let now = mrs_auth::now();

    let identity: Identity = body
        .identity
        .parse()
        .map_err(|_| ApiError::TypeMismatch("identity was not well-formed".to_string()))?;

    let public_key = base64::engine::general_purpose::STANDARD
        .decode(&body.public_key_b64)
        .map_err(|_| ApiError::TypeMismatch("public_key_b64 was not valid base64".to_string()))?;
    let proof = base64::engine::general_purpose::STANDARD
        .decode(&body.proof_b64)
        .map_err(|_| ApiError::TypeMismatch("proof_b64 was not valid base64".to_string()))?;

    let message = format!("{}:{}", body.identity, body.key_id);
    mrs_keys::verify(body.algorithm, &public_key, message.as_bytes(), &proof)
        .map_err(|e| ApiError::Unauthorized(e.to_string()))?;

    state
        .store
        .put_key(mrs_types::Key {
            id: format!("{}-{}", identity, body.key_id),
            owner: identity.to_string(),
            key_id: body.key_id,
            algorithm: body.algorithm,
            public_key,
            private_key: None,
            created: now,
            expires: None,
            deprecated: false,
        })
        .await?;

    if state.store.get_user(&identity.to_string()).await?.is_none() {
        state
            .store
            .put_user(mrs_types::User::shell(identity.to_string(), now))
            .await?;
    }

    Ok((
        StatusCode::CREATED,
        Json(RegisterKeyResponse {
            identity: identity.to_string(),
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires: mrs_types::Timestamp,
}

async fn auth_login(
    State(state): State<AppState>,
    AuthenticatedRequest(caller): AuthenticatedRequest,
) -> Result<Json<LoginResponse>, ApiError> {
    let now = mrs_auth::now();
    let expires = now + chrono::Duration::hours(state.config.token_expiry_hours);
    let token = mrs_auth::generate_token();

    state
        .store
        .put_token(mrs_types::Token {
            token: token.clone(),
            user_id: caller.identity.to_string(),
            created: now,
            expires: Some(expires),
        })
        .await?;

    Ok(Json(LoginResponse { token, expires }))
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub identity: String,
    pub via: &'static str,
}

async fn auth_me(AuthenticatedRequest(caller): AuthenticatedRequest) -> Json<MeResponse> {
    let via = match caller.via {
        mrs_auth::AuthMethod::Bearer => "bearer",
        mrs_auth::AuthMethod::HttpSignature => "http_signature",
    };
    Json(MeResponse {
        identity: caller.identity.to_string(),
        via,
    })
}

/// Registrations per `/sync/snapshot` page. Kept well under typical HTTP
/// response size limits so a peer with a large registry still pages cleanly.
const SNAPSHOT_PAGE_SIZE: usize = 500;

#[derive(Debug, Deserialize)]
pub struct SnapshotParams {
    pub after: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SnapshotBody {
    pub registrations: Vec<Registration>,
    pub tombstones: Vec<mrs_types::Tombstone>,
    /// Continuation cursor over `registrations`; pass back as `after` to
    /// fetch the next page. `None` once the last page has been returned.
    pub next: Option<String>,
    /// The change-log cursor as of this snapshot, for the caller to resume
    /// with `/sync/changes?since=` once every page has been pulled.
    pub cursor: String,
}

fn encode_snapshot_cursor(canonical: &mrs_types::CanonicalId) -> String {
    use base64::Engine;
    let json = serde_json::to_vec(canonical).expect("CanonicalId always serializes");
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
}

fn decode_snapshot_cursor(cursor: &str) -> Result<mrs_types::CanonicalId, ApiError> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| ApiError::CursorExpired)?;
    serde_json::from_slice(&bytes).map_err(|_| ApiError::CursorExpired)
}

async fn sync_snapshot(
    State(state): State<AppState>,
    AuthenticatedRequest(caller): AuthenticatedRequest,
    Query(params): Query<SnapshotParams>,
) -> Result<Json<SnapshotBody>, ApiError> {
    mrs_auth::require_known_peer(state.store.as_ref(), &caller).await?;

    let after = params.after.as_deref().map(decode_snapshot_cursor).transpose()?;
    let limit = params.limit.unwrap_or(SNAPSHOT_PAGE_SIZE).min(SNAPSHOT_PAGE_SIZE);

    let registrations = state.store.list_registrations(after.as_ref(), limit).await?;
    let next = if registrations.len() == limit {
        registrations.last().map(|r| encode_snapshot_cursor(&r.canonical_id()))
    } else {
        None
    };

    // Tombstones aren't paginated; only carried on the first page so a
    // multi-page pull doesn't retransmit the full tombstone set each time.
    let tombstones = if after.is_none() {
        state.store.list_tombstones().await?
    } else {
        Vec::new()
    };

    let changes = state.store.changes_since(None).await?;
    let cursor = changes
        .last()
        .map(|c| c.cursor.clone())
        .unwrap_or_else(|| "0".to_string());

    Ok(Json(SnapshotBody {
        registrations,
        tombstones,
        next,
        cursor,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ChangesParams {
    pub since: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChangesBody {
    pub changes: Vec<mrs_types::ChangeEvent>,
    pub cursor: Option<String>,
}

async fn sync_changes(
    State(state): State<AppState>,
    AuthenticatedRequest(caller): AuthenticatedRequest,
    Query(params): Query<ChangesParams>,
) -> Result<Json<ChangesBody>, ApiError> {
    mrs_auth::require_known_peer(state.store.as_ref(), &caller).await?;

    let changes = state.store.changes_since(params.since.as_deref()).await?;
    let cursor = changes.last().map(|c| c.cursor.clone());
    Ok(Json(ChangesBody { changes, cursor }))
}

#[derive(Debug, Deserialize)]
pub struct AddPeerBody {
    pub server_url: String,
}

async fn add_peer(
    State(state): State<AppState>,
    AuthenticatedRequest(caller): AuthenticatedRequest,
    Json(body): Json<AddPeerBody>,
) -> Result<Json<Peer>, ApiError> {
    mrs_auth::require_admin(&caller, state.admin_identity())?;
    let now = mrs_auth::now();
    let peer = Peer::configured(body.server_url, now);
    state.store.put_peer(peer.clone()).await?;
    Ok(Json(peer))
}
