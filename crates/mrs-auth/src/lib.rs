//! Authentication for the registry's two credential types: long-lived
//! bearer tokens issued by `/auth/login`, and per-request HTTP Message
//! Signatures (RFC 9421) that bind a caller to an [Identity] via key
//! material it or a peer server publishes. Kept free of any web framework,
//! the way `noosphere-core`'s authority checks are independent of
//! `noosphere-gateway`'s axum plumbing -- `mrs-server` adapts these into
//! extractors.

mod http_signature;

pub use http_signature::{sign_request, verify_http_signature, OutboundSignature, SignatureContext};

use chrono::Utc;
use mrs_store::{RegistryStore, StoreError};
use mrs_types::{Identity, Timestamp};
use rand::Rng;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing or malformed authorization header")]
    Malformed,
    #[error("credentials were not valid")]
    InvalidCredentials,
    #[error("credentials have expired")]
    Expired,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("key error: {0}")]
    Key(#[from] mrs_keys::KeyError),
    #[error("caller identity {caller} is not authorized for this operation")]
    Forbidden { caller: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Bearer,
    HttpSignature,
}

#[derive(Debug, Clone)]
pub struct AuthenticatedCaller {
    pub identity: Identity,
    pub via: AuthMethod,
}

/// Validate a bearer token against the store, rejecting expired tokens.
/// The caller's identity is the token's owning user id.
pub async fn verify_bearer_token(
    store: &dyn RegistryStore,
    token: &str,
    now: Timestamp,
) -> Result<AuthenticatedCaller, AuthError> {
    let record = store
        .get_token(token)
        .await?
        .ok_or(AuthError::InvalidCredentials)?;

    if !record.is_valid_at(now) {
        return Err(AuthError::Expired);
    }

    let identity: Identity = record
        .user_id
        .parse()
        .map_err(|_| AuthError::InvalidCredentials)?;

    Ok(AuthenticatedCaller {
        identity,
        via: AuthMethod::Bearer,
    })
}

const TOKEN_PREFIX: &str = "mrstok_";

/// Mint a fresh bearer token string. Persistence is the caller's job.
pub fn generate_token() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..32)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{TOKEN_PREFIX}{suffix}")
}

/// Require that `caller`'s identity is exactly `admin_identity` (the
/// server's configured `ADMIN_EMAIL`), used to gate `/admin/peers`.
pub fn require_admin(caller: &AuthenticatedCaller, admin_identity: &Identity) -> Result<(), AuthError> {
    if &caller.identity != admin_identity {
        return Err(AuthError::Forbidden {
            caller: caller.identity.to_string(),
        });
    }
    Ok(())
}

/// Require that `caller`'s identity resolves to a known peer server, used
/// to gate `/sync/snapshot` and `/sync/changes`.
pub async fn require_known_peer(
    store: &dyn RegistryStore,
    caller: &AuthenticatedCaller,
) -> Result<(), AuthError> {
    let server_url = format!("https://{}", caller.identity.domain);
    match store.get_peer(&server_url).await? {
        Some(_) => Ok(()),
        None => Err(AuthError::Forbidden {
            caller: caller.identity.to_string(),
        }),
    }
}

pub fn now() -> Timestamp {
    Utc::now()
}
