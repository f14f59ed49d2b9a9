use base64::Engine;
use mrs_store::RegistryStore;
use mrs_types::{Identity, Key, KeyAlgorithm, Timestamp, User};
use sha2::{Digest, Sha256};

use crate::{AuthError, AuthMethod, AuthenticatedCaller};

const COVERED_COMPONENTS: &[&str] = &["@method", "@path", "content-digest", "mrs-identity"];
const MAX_SKEW_SECS: i64 = 300;

/// The inbound request fields an HTTP Message Signature is computed over.
/// `mrs-server` builds this from the axum request parts; this crate stays
/// framework-agnostic.
pub struct SignatureContext<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub mrs_identity: &'a str,
    pub signature_input: &'a str,
    pub signature: &'a str,
    pub content_digest: Option<&'a str>,
    pub body: &'a [u8],
}

struct ParsedSignatureInput {
    components: Vec<String>,
    keyid: String,
    alg: KeyAlgorithm,
    created: i64,
    expires: Option<i64>,
}

/// Verify `ctx`'s signature, binding it to a known identity. Fetches the
/// signer's public key from the store if cached locally, otherwise via
/// `fetcher`, and persists it (without a private key) for next time.
pub async fn verify_http_signature(
    store: &dyn RegistryStore,
    fetcher: &mrs_keys::RemoteKeyFetcher,
    ctx: &SignatureContext<'_>,
    now: Timestamp,
) -> Result<AuthenticatedCaller, AuthError> {
    let identity: Identity = ctx
        .mrs_identity
        .parse()
        .map_err(|_| AuthError::Malformed)?;

    verify_content_digest(ctx)?;

    let parsed = parse_signature_input(ctx.signature_input)?;
    check_freshness(&parsed, now)?;
    for required in COVERED_COMPONENTS {
        if !parsed.components.iter().any(|c| c == required) {
            return Err(AuthError::Malformed);
        }
    }

    mrs_keys::check_keyid_binding(&parsed.keyid, &identity)?;

    let key = resolve_key(store, fetcher, &identity, &parsed).await?;
    if !key.is_usable_at(now) {
        return Err(AuthError::Expired);
    }

    let base = build_signature_base(ctx, &parsed);
    let signature_bytes = decode_signature_value(ctx.signature)?;
    mrs_keys::verify(parsed.alg, &key.public_key, base.as_bytes(), &signature_bytes)?;

    ensure_shell_user(store, &identity, now).await?;

    Ok(AuthenticatedCaller {
        identity,
        via: AuthMethod::HttpSignature,
    })
}

fn verify_content_digest(ctx: &SignatureContext<'_>) -> Result<(), AuthError> {
    let header = ctx.content_digest.ok_or(AuthError::Malformed)?;
    let claimed = header
        .strip_prefix("sha-256=:")
        .and_then(|s| s.strip_suffix(':'))
        .ok_or(AuthError::Malformed)?;

    let mut hasher = Sha256::new();
    hasher.update(ctx.body);
    let computed = base64::engine::general_purpose::STANDARD.encode(hasher.finalize());

    if claimed != computed {
        return Err(AuthError::InvalidCredentials);
    }
    Ok(())
}

/// Minimal parser for our fixed `Signature-Input` shape:
/// `sig1=("@method" "@path" ...);created=N;keyid="...";alg="..."`.
/// Not a general RFC 9421 structured-field parser -- this deployment only
/// ever emits and accepts this one shape.
fn parse_signature_input(raw: &str) -> Result<ParsedSignatureInput, AuthError> {
    let (_, rest) = raw.split_once('=').ok_or(AuthError::Malformed)?;
    let (components_part, params_part) = rest.split_once(')').ok_or(AuthError::Malformed)?;
    let components_part = components_part.trim_start_matches('(');

    let components = components_part
        .split_whitespace()
        .map(|c| c.trim_matches('"').to_string())
        .collect();

    let mut keyid = None;
    let mut alg = None;
    let mut created = None;
    let mut expires = None;

    for param in params_part.trim_start_matches(';').split(';') {
        let (name, value) = param.split_once('=').ok_or(AuthError::Malformed)?;
        let value = value.trim_matches('"');
        match name {
            "keyid" => keyid = Some(value.to_string()),
            "alg" => {
                alg = Some(match value {
                    "ed25519" => KeyAlgorithm::Ed25519,
                    "rsa-pss-sha256" => KeyAlgorithm::RsaPss,
                    "ecdsa-p256-sha256" => KeyAlgorithm::EcdsaP256,
                    "ecdsa-p384-sha384" => KeyAlgorithm::EcdsaP384,
                    _ => return Err(AuthError::Malformed),
                })
            }
            "created" => created = value.parse().ok(),
            "expires" => expires = value.parse().ok(),
            _ => {}
        }
    }

    Ok(ParsedSignatureInput {
        components,
        keyid: keyid.ok_or(AuthError::Malformed)?,
        alg: alg.ok_or(AuthError::Malformed)?,
        created: created.ok_or(AuthError::Malformed)?,
        expires,
    })
}

fn check_freshness(parsed: &ParsedSignatureInput, now: Timestamp) -> Result<(), AuthError> {
    let now_secs = now.timestamp();
    if (now_secs - parsed.created).abs() > MAX_SKEW_SECS {
        return Err(AuthError::Expired);
    }
    if let Some(expires) = parsed.expires {
        if now_secs > expires {
            return Err(AuthError::Expired);
        }
    }
    Ok(())
}

fn build_signature_base(ctx: &SignatureContext<'_>, parsed: &ParsedSignatureInput) -> String {
    let mut lines = Vec::with_capacity(parsed.components.len() + 1);
    for component in &parsed.components {
        let value = match component.as_str() {
            "@method" => ctx.method.to_string(),
            "@path" => ctx.path.to_string(),
            "content-digest" => ctx.content_digest.unwrap_or_default().to_string(),
            "mrs-identity" => ctx.mrs_identity.to_string(),
            _ => String::new(),
        };
        lines.push(format!("\"{component}\": {value}"));
    }

    let component_list = parsed
        .components
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(" ");
    let mut params = format!("created={}", parsed.created);
    if let Some(expires) = parsed.expires {
        params.push_str(&format!(";expires={expires}"));
    }
    lines.push(format!(
        "\"@signature-params\": ({component_list});{params};keyid=\"{}\"",
        parsed.keyid
    ));

    lines.join("\n")
}

fn decode_signature_value(raw: &str) -> Result<Vec<u8>, AuthError> {
    let (_, rest) = raw.split_once('=').ok_or(AuthError::Malformed)?;
    let encoded = rest
        .trim()
        .strip_prefix(':')
        .and_then(|s| s.strip_suffix(':'))
        .ok_or(AuthError::Malformed)?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| AuthError::Malformed)
}

pub struct OutboundSignature {
    pub content_digest: String,
    pub signature_input: String,
    pub signature: String,
}

/// Build the three headers (`Content-Digest`, `Signature-Input`,
/// `Signature`) this server attaches to its own outbound peer requests,
/// signed with its local Ed25519 server key (owner `_server`).
pub fn sign_request(
    method: &str,
    path: &str,
    mrs_identity: &str,
    signing_key_bytes: &[u8],
    keyid: &str,
    body: &[u8],
    now: Timestamp,
) -> Result<OutboundSignature, AuthError> {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let content_digest = format!(
        "sha-256=:{}:",
        base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
    );

    let created = now.timestamp();
    let signature_input = format!(
        "sig1=({});created={created};keyid=\"{keyid}\";alg=\"ed25519\"",
        COVERED_COMPONENTS
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(" ")
    );

    let parsed = parse_signature_input(&signature_input)?;
    let ctx = SignatureContext {
        method,
        path,
        mrs_identity,
        signature_input: &signature_input,
        signature: "",
        content_digest: Some(&content_digest),
        body,
    };
    let base = build_signature_base(&ctx, &parsed);

    let signature_bytes = mrs_keys::sign_ed25519(signing_key_bytes, base.as_bytes())?;
    let signature = format!(
        "sig1=:{}:",
        base64::engine::general_purpose::STANDARD.encode(signature_bytes)
    );

    Ok(OutboundSignature {
        content_digest,
        signature_input,
        signature,
    })
}

async fn resolve_key(
    store: &dyn RegistryStore,
    fetcher: &mrs_keys::RemoteKeyFetcher,
    identity: &Identity,
    parsed: &ParsedSignatureInput,
) -> Result<Key, AuthError> {
    if let Some(key) = store.get_key(&identity.to_string(), &parsed.keyid).await? {
        return Ok(key);
    }

    let key = fetcher.fetch_key(identity, Some(&parsed.keyid)).await?;
    store.put_key(key.clone()).await?;
    Ok(key)
}

async fn ensure_shell_user(
    store: &dyn RegistryStore,
    identity: &Identity,
    now: Timestamp,
) -> Result<(), AuthError> {
    let id = identity.to_string();
    if store.get_user(&id).await?.is_none() {
        store.put_user(User::shell(id, now)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Signer;
    use mrs_store::InMemoryStore;
    use std::time::Duration;

    fn content_digest(body: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(body);
        format!(
            "sha-256=:{}:",
            base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
        )
    }

    #[test]
    fn parses_a_well_formed_signature_input() {
        let raw = r#"sig1=("@method" "@path" "content-digest" "mrs-identity");created=1700000000;keyid="https://example.com/.well-known/mrs/keys/alice@example.com";alg="ed25519""#;
        let parsed = parse_signature_input(raw).unwrap();
        assert_eq!(parsed.components.len(), 4);
        assert_eq!(parsed.alg, KeyAlgorithm::Ed25519);
        assert_eq!(parsed.created, 1_700_000_000);
    }

    #[test]
    fn content_digest_mismatch_is_rejected() {
        let ctx = SignatureContext {
            method: "POST",
            path: "/register",
            mrs_identity: "alice@example.com",
            signature_input: "sig1=();created=1;keyid=\"k\";alg=\"ed25519\"",
            signature: "sig1=:AA==:",
            content_digest: Some("sha-256=:bogus:"),
            body: b"{}",
        };
        assert!(verify_content_digest(&ctx).is_err());
    }

    #[tokio::test]
    async fn verifies_a_correctly_signed_request_end_to_end() {
        let (verifying_key, signing_key) = mrs_keys::generate_ed25519_keypair();
        let store = InMemoryStore::new();
        let now = chrono::Utc::now();

        let keyid = "https://example.com/.well-known/mrs/keys/alice@example.com".to_string();
        store
            .put_key(Key {
                id: "key-1".to_string(),
                owner: "alice@example.com".to_string(),
                key_id: keyid.clone(),
                algorithm: KeyAlgorithm::Ed25519,
                public_key: verifying_key.as_bytes().to_vec(),
                private_key: None,
                created: now,
                expires: None,
                deprecated: false,
            })
            .await
            .unwrap();

        let body = b"{\"space\":{}}".to_vec();
        let digest = content_digest(&body);
        let created = now.timestamp();
        let signature_input = format!(
            "sig1=(\"@method\" \"@path\" \"content-digest\" \"mrs-identity\");created={created};keyid=\"{keyid}\";alg=\"ed25519\""
        );

        let ctx_for_base = SignatureContext {
            method: "POST",
            path: "/register",
            mrs_identity: "alice@example.com",
            signature_input: &signature_input,
            signature: "",
            content_digest: Some(&digest),
            body: &body,
        };
        let parsed = parse_signature_input(&signature_input).unwrap();
        let base = build_signature_base(&ctx_for_base, &parsed);
        let signature_bytes = signing_key.sign(base.as_bytes()).to_bytes();

        let signature_header = format!(
            "sig1=:{}:",
            base64::engine::general_purpose::STANDARD.encode(signature_bytes)
        );

        let fetcher = mrs_keys::RemoteKeyFetcher::new(Duration::from_secs(300));
        let ctx = SignatureContext {
            method: "POST",
            path: "/register",
            mrs_identity: "alice@example.com",
            signature_input: &signature_input,
            signature: &signature_header,
            content_digest: Some(&digest),
            body: &body,
        };

        let caller = verify_http_signature(&store, &fetcher, &ctx, now).await.unwrap();
        assert_eq!(caller.identity.user, "alice");
    }
}
