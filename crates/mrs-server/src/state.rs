use std::sync::Arc;

use ed25519_dalek::SigningKey;
use mrs_auth::AuthenticatedCaller;
use mrs_federation::FederationService;
use mrs_keys::RemoteKeyFetcher;
use mrs_registry::RegistryService;
use mrs_store::RegistryStore;
use mrs_types::{Identity, Key, KeyAlgorithm};

use crate::config::Config;

/// Everything request handlers share, composed once at startup the way
/// `noosphere-gateway`'s `serve` command layers `Extension`s onto the
/// router; here it's a single `State` rather than several `Extension`s.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RegistryStore>,
    pub registry: Arc<RegistryService>,
    pub federation: Arc<FederationService>,
    pub key_fetcher: Arc<RemoteKeyFetcher>,
    pub config: Arc<Config>,
    pub server_signing_key: Arc<SigningKey>,
    pub server_keyid: String,
}

impl AppState {
    pub fn new(store: Arc<dyn RegistryStore>, config: Config) -> Self {
        let (_verifying_key, server_signing_key) = mrs_keys::generate_ed25519_keypair();
        let server_keyid = format!(
            "{}/.well-known/mrs/keys/_server@{}",
            config.server_url, config.server_domain
        );
        let registry = Arc::new(RegistryService::with_max_results(
            store.clone(),
            config.server_url.clone(),
            config.max_results,
        ));
        let federation = Arc::new(FederationService::new(
            store.clone(),
            config.server_url.clone(),
            config.server_domain.clone(),
        ));
        let key_fetcher = Arc::new(RemoteKeyFetcher::new(std::time::Duration::from_secs(
            config.key_cache_ttl_secs,
        )));

        Self {
            store,
            registry,
            federation,
            key_fetcher,
            config: Arc::new(config),
            server_signing_key: Arc::new(server_signing_key),
            server_keyid,
        }
    }

    pub fn server_key_record(&self, now: mrs_types::Timestamp) -> Key {
        Key {
            id: "server-key".to_string(),
            owner: format!("_server@{}", self.config.server_domain),
            key_id: self.server_keyid.clone(),
            algorithm: KeyAlgorithm::Ed25519,
            public_key: self.server_signing_key.verifying_key().as_bytes().to_vec(),
            private_key: None,
            created: now,
            expires: None,
            deprecated: false,
        }
    }

    pub fn admin_identity(&self) -> &Identity {
        &self.config.admin_identity
    }
}

/// An authenticated request, resolved by either the bearer-token or
/// HTTP-signature path. See `crate::extractors`.
pub type Caller = AuthenticatedCaller;
