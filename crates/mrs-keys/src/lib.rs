//! Local key material and the remote public-key fetch/cache federation
//! identity verification depends on. Splits generating/holding keys
//! ([generate_ed25519_keypair], analogous to `noosphere-core`'s
//! `generate_ed25519_key`) from caching a slow remote lookup behind a
//! single-flight cell (the `async_once_cell::OnceCell` pattern
//! `noosphere-gateway`'s `GatewayConfig` uses for its TOML cache).

use std::sync::Arc;
use std::time::Duration;

use async_once_cell::OnceCell;
use dashmap::DashMap;
use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};
use mrs_types::{Identity, Key, KeyAlgorithm, Timestamp};
use p256::ecdsa::signature::Verifier as P256Verifier;
use p256::ecdsa::{Signature as P256Signature, VerifyingKey as P256VerifyingKey};
use rsa::pss::{Signature as RsaPssSignature, VerifyingKey as RsaVerifyingKey};
use rsa::signature::Verifier as RsaVerifier;
use rsa::RsaPublicKey;
use sha2::Sha256;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum KeyError {
    #[error("fetching remote key material: {0}")]
    Fetch(String),
    #[error("remote key response was not well-formed: {0}")]
    InvalidResponse(String),
    #[error("no key with key_id {0} found for this identity")]
    KeyNotFound(String),
    #[error("algorithm {0:?} is not supported for verification")]
    UnsupportedAlgorithm(KeyAlgorithm),
    #[error("public key bytes were malformed for algorithm {0:?}")]
    MalformedKey(KeyAlgorithm),
    #[error("signature did not verify")]
    SignatureInvalid,
    #[error("keyid host {keyid_host} does not match identity domain {identity_domain}")]
    KeyidBindingMismatch {
        keyid_host: String,
        identity_domain: String,
    },
}

/// Generate a fresh Ed25519 keypair for the server's own signing identity
/// (owner `_server`). The private key bytes are the caller's to persist;
/// this crate never touches disk itself.
pub fn generate_ed25519_keypair() -> (VerifyingKey, SigningKey) {
    let mut rng = rand::thread_rng();
    let signing_key = SigningKey::generate(&mut rng);
    let verifying_key = signing_key.verifying_key();
    (verifying_key, signing_key)
}

pub fn sign_ed25519(signing_key_bytes: &[u8], message: &[u8]) -> Result<Vec<u8>, KeyError> {
    let bytes: [u8; 32] = signing_key_bytes
        .try_into()
        .map_err(|_| KeyError::MalformedKey(KeyAlgorithm::Ed25519))?;
    let signing_key = SigningKey::from_bytes(&bytes);
    Ok(signing_key.sign(message).to_bytes().to_vec())
}

/// Verify `signature` over `message` under `public_key` for the given
/// algorithm. [KeyAlgorithm::EcdsaP384] is accepted on the wire (§3 data
/// model) but this deployment carries no P-384 verifier; it is rejected
/// here rather than silently treated as valid.
pub fn verify(
    algorithm: KeyAlgorithm,
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), KeyError> {
    match algorithm {
        KeyAlgorithm::Ed25519 => {
            let bytes: [u8; 32] = public_key
                .try_into()
                .map_err(|_| KeyError::MalformedKey(algorithm))?;
            let verifying_key =
                VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::MalformedKey(algorithm))?;
            let sig_bytes: [u8; 64] = signature
                .try_into()
                .map_err(|_| KeyError::SignatureInvalid)?;
            let sig = Ed25519Signature::from_bytes(&sig_bytes);
            verifying_key
                .verify(message, &sig)
                .map_err(|_| KeyError::SignatureInvalid)
        }
        KeyAlgorithm::RsaPss => {
            let public_key = <RsaPublicKey as rsa::pkcs1::DecodeRsaPublicKey>::from_pkcs1_der(
                public_key,
            )
            .map_err(|_| KeyError::MalformedKey(algorithm))?;
            let verifying_key = RsaVerifyingKey::<Sha256>::new(public_key);
            let sig = RsaPssSignature::try_from(signature).map_err(|_| KeyError::SignatureInvalid)?;
            verifying_key
                .verify(message, &sig)
                .map_err(|_| KeyError::SignatureInvalid)
        }
        KeyAlgorithm::EcdsaP256 => {
            let verifying_key = P256VerifyingKey::from_sec1_bytes(public_key)
                .map_err(|_| KeyError::MalformedKey(algorithm))?;
            let sig = P256Signature::try_from(signature).map_err(|_| KeyError::SignatureInvalid)?;
            verifying_key
                .verify(message, &sig)
                .map_err(|_| KeyError::SignatureInvalid)
        }
        KeyAlgorithm::EcdsaP384 => Err(KeyError::UnsupportedAlgorithm(algorithm)),
    }
}

/// Check that an HTTP-signature `keyid`'s host matches the signer's
/// claimed identity domain, so a caller can't present a key fetched from
/// one domain while claiming an identity on another.
pub fn check_keyid_binding(keyid: &str, identity: &Identity) -> Result<(), KeyError> {
    let url = url::Url::parse(keyid).map_err(|_| KeyError::InvalidResponse(keyid.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| KeyError::InvalidResponse(keyid.to_string()))?;
    if host != identity.domain {
        return Err(KeyError::KeyidBindingMismatch {
            keyid_host: host.to_string(),
            identity_domain: identity.domain.clone(),
        });
    }
    Ok(())
}

struct CacheEntry {
    keys: Arc<Vec<Key>>,
    fetched_at: Timestamp,
}

/// Caches `GET {domain}/.well-known/mrs/keys/{identity}` responses behind
/// a per-identity single-flight cell, so concurrent verifications of the
/// same unfamiliar identity coalesce into one outbound request.
pub struct RemoteKeyFetcher {
    client: reqwest::Client,
    cache: DashMap<String, Arc<OnceCell<Result<CacheEntry, KeyError>>>>,
    ttl: Duration,
}

impl RemoteKeyFetcher {
    pub fn new(ttl: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client builder with static config never fails");
        Self {
            client,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Fetch (or return cached) keys published by `identity`, picking the
    /// one whose `key_id` matches if given.
    pub async fn fetch_key(
        &self,
        identity: &Identity,
        key_id: Option<&str>,
    ) -> Result<Key, KeyError> {
        let keys = self.fetch_keys(identity).await?;
        match key_id {
            Some(key_id) => keys
                .iter()
                .find(|k| k.key_id == key_id)
                .cloned()
                .ok_or_else(|| KeyError::KeyNotFound(key_id.to_string())),
            None => keys
                .first()
                .cloned()
                .ok_or_else(|| KeyError::KeyNotFound("<any>".to_string())),
        }
    }

    async fn fetch_keys(&self, identity: &Identity) -> Result<Arc<Vec<Key>>, KeyError> {
        let cache_key = identity.to_string();

        if let Some(existing) = self.cache.get(&cache_key) {
            if let Some(Ok(entry)) = existing.get() {
                if !is_stale(entry, self.ttl) {
                    return Ok(entry.keys.clone());
                }
            } else if existing.get().is_none() {
                // A fetch is in flight (or one already failed and nothing
                // replaced it); join it rather than starting a second one.
                return existing
                    .get_or_try_init(self.do_fetch(identity))
                    .await
                    .clone()
                    .map(|entry| entry.keys.clone());
            }
        }

        // Either nothing cached yet, or the cached entry is stale: install
        // a fresh cell so exactly one task performs the next fetch.
        let cell = Arc::new(OnceCell::new());
        self.cache.insert(cache_key, cell.clone());
        cell.get_or_try_init(self.do_fetch(identity))
            .await
            .clone()
            .map(|entry| entry.keys.clone())
    }

    async fn do_fetch(&self, identity: &Identity) -> Result<CacheEntry, KeyError> {
        let url = format!(
            "https://{}/.well-known/mrs/keys/{}",
            identity.domain, identity
        );
        tracing::debug!(%url, "fetching remote key material");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| KeyError::Fetch(e.to_string()))?;
        let keys: Vec<Key> = response
            .json()
            .await
            .map_err(|e| KeyError::InvalidResponse(e.to_string()))?;
        Ok(CacheEntry {
            keys: Arc::new(keys),
            fetched_at: chrono::Utc::now(),
        })
    }
}

fn is_stale(entry: &CacheEntry, ttl: Duration) -> bool {
    let age = chrono::Utc::now() - entry.fetched_at;
    age.to_std().map(|age| age > ttl).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ed25519_round_trips_sign_and_verify() {
        let (verifying_key, signing_key) = generate_ed25519_keypair();
        let signature = sign_ed25519(&signing_key.to_bytes(), b"hello federation").unwrap();
        verify(
            KeyAlgorithm::Ed25519,
            verifying_key.as_bytes(),
            b"hello federation",
            &signature,
        )
        .unwrap();
    }

    #[test]
    fn ed25519_rejects_tampered_message() {
        let (verifying_key, signing_key) = generate_ed25519_keypair();
        let signature = sign_ed25519(&signing_key.to_bytes(), b"hello federation").unwrap();
        let err = verify(
            KeyAlgorithm::Ed25519,
            verifying_key.as_bytes(),
            b"goodbye federation",
            &signature,
        )
        .unwrap_err();
        assert!(matches!(err, KeyError::SignatureInvalid));
    }

    #[test]
    fn ecdsa_p384_is_explicitly_unsupported() {
        let err = verify(KeyAlgorithm::EcdsaP384, &[], b"msg", &[]).unwrap_err();
        assert!(matches!(err, KeyError::UnsupportedAlgorithm(_)));
    }

    #[test]
    fn keyid_binding_mismatch_is_rejected() {
        let identity: Identity = "alice@example.com".parse().unwrap();
        let err = check_keyid_binding("https://evil.example/keys/alice", &identity).unwrap_err();
        assert!(matches!(err, KeyError::KeyidBindingMismatch { .. }));
    }

    #[test]
    fn keyid_binding_match_is_accepted() {
        let identity: Identity = "alice@example.com".parse().unwrap();
        check_keyid_binding("https://example.com/.well-known/mrs/keys/alice@example.com", &identity)
            .unwrap();
    }
}
