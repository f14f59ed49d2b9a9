use std::net::SocketAddr;

use base64::Engine;
use ed25519_dalek::Signer;
use mrs_server::config::Config;
use serde_json::json;

async fn spawn_server() -> String {
    std::env::set_var("MRS_SERVER_URL", "https://a.example");
    std::env::set_var("MRS_ADMIN_EMAIL", "admin@a.example");
    std::env::set_var("MRS_PORT", "0");
    let config = Config::from_env().unwrap();

    let app = mrs_server::app(config, None).await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{addr}")
}

fn signed_headers(
    method: &str,
    path: &str,
    identity: &str,
    signing_key_bytes: &[u8],
    keyid: &str,
    body: &[u8],
) -> (String, String, String, String) {
    let now = chrono::Utc::now();
    let sig = mrs_auth::sign_request(method, path, identity, signing_key_bytes, keyid, body, now).unwrap();
    (
        identity.to_string(),
        sig.content_digest,
        sig.signature_input,
        sig.signature,
    )
}

#[tokio::test]
async fn register_search_and_release_round_trip_through_http() {
    let base_url = spawn_server().await;
    let client = reqwest::Client::new();

    let (verifying_key, signing_key) = mrs_keys::generate_ed25519_keypair();
    let identity = "alice@example.org";
    let key_id = format!("https://example.org/.well-known/mrs/keys/{identity}");

    let proof_message = format!("{identity}:{key_id}");
    let proof = signing_key.sign(proof_message.as_bytes()).to_bytes();

    let register_key_response = client
        .post(format!("{base_url}/auth/register"))
        .json(&json!({
            "identity": identity,
            "key_id": key_id,
            "algorithm": "ed25519",
            "public_key_b64": base64::engine::general_purpose::STANDARD.encode(verifying_key.as_bytes()),
            "proof_b64": base64::engine::general_purpose::STANDARD.encode(proof),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(register_key_response.status(), 201);

    let register_body = json!({
        "space": {
            "type": "sphere",
            "center": { "lat": -33.8568, "lon": 151.2153, "ele": 0.0 },
            "radius": 25.0
        },
        "service_point": "https://svc.example.org/thing",
        "foad": false
    });
    let body_bytes = serde_json::to_vec(&register_body).unwrap();

    let (mrs_identity, content_digest, signature_input, signature) =
        signed_headers("POST", "/register", identity, &signing_key.to_bytes(), &key_id, &body_bytes);

    let register_response = client
        .post(format!("{base_url}/register"))
        .header("MRS-Identity", mrs_identity)
        .header("Content-Digest", content_digest)
        .header("Signature-Input", signature_input)
        .header("Signature", signature)
        .header("content-type", "application/json")
        .body(body_bytes)
        .send()
        .await
        .unwrap();
    assert_eq!(register_response.status(), 201);
    let registration: mrs_types::Registration = register_response.json().await.unwrap();
    assert_eq!(registration.owner, identity);

    let search_body = json!({
        "location": { "lat": -33.8570, "lon": 151.2155, "ele": 0.0 },
        "range": 100.0
    });
    let search_response = client
        .post(format!("{base_url}/search"))
        .json(&search_body)
        .send()
        .await
        .unwrap();
    assert_eq!(search_response.status(), 200);
    let search_body: serde_json::Value = search_response.json().await.unwrap();
    let results = search_body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["registration"]["id"], json!(registration.id));

    let release_body_bytes = serde_json::to_vec(&json!({ "id": registration.id })).unwrap();
    let (mrs_identity, content_digest, signature_input, signature) = signed_headers(
        "POST",
        "/release",
        identity,
        &signing_key.to_bytes(),
        &key_id,
        &release_body_bytes,
    );

    let release_response = client
        .post(format!("{base_url}/release"))
        .header("MRS-Identity", mrs_identity)
        .header("Content-Digest", content_digest)
        .header("Signature-Input", signature_input)
        .header("Signature", signature)
        .header("content-type", "application/json")
        .body(release_body_bytes)
        .send()
        .await
        .unwrap();
    assert_eq!(release_response.status(), 200);

    let search_after_release = client
        .post(format!("{base_url}/search"))
        .json(&json!({
            "location": { "lat": -33.8570, "lon": 151.2155, "ele": 0.0 },
            "range": 100.0
        }))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = search_after_release.json().await.unwrap();
    assert_eq!(body["results"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn well_known_reports_this_servers_identity() {
    let base_url = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{base_url}/.well-known/mrs"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["server_url"], json!("https://a.example"));
}
