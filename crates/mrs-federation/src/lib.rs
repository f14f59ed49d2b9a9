//! Peer directory, referral computation, and snapshot/delta sync ingest.
//! Outbound HTTP to peers follows `noosphere-core/src/api/client.rs`'s
//! plain `reqwest::Client` pattern rather than `noosphere-p2p`'s DHT-based
//! name system -- this protocol is deliberately simple HTTP polling.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mrs_geometry::{intersects, Coordinate, Geometry};
use mrs_store::{RegistryStore, StoreError};
use mrs_types::{ChangeEvent, Peer, Registration, Timestamp, Tombstone};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

pub const MAX_REFERRALS: usize = 16;

#[derive(Error, Debug)]
pub enum FederationError {
    #[error("http request to peer failed: {0}")]
    Http(String),
    #[error("peer response was not well-formed: {0}")]
    InvalidResponse(String),
    #[error("peer's cursor was rejected as expired")]
    CursorExpired,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("signing outbound request: {0}")]
    Auth(#[from] mrs_auth::AuthError),
}

/// The body of `GET /.well-known/mrs`, a peer's self-description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WellKnownMrs {
    pub server_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authoritative_regions: Option<Vec<Geometry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_email: Option<String>,
    #[serde(default)]
    pub known_peers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mrs_version: Option<String>,
}

/// Advertised shape/size limits a peer's search and ingest will accept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub geometry_types: Vec<String>,
    pub max_radius: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub registrations: Vec<Registration>,
    pub tombstones: Vec<Tombstone>,
    /// Continuation cursor over `registrations`, `None` once the last page
    /// has been returned.
    pub next: Option<String>,
    /// The change-log cursor as of this snapshot, to resume with
    /// `/sync/changes?since=` once every page has been pulled.
    pub cursor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncChangesPage {
    pub changes: Vec<ChangeEvent>,
    pub cursor: Option<String>,
}

/// One ingest pass's outcome: how many records were applied versus
/// rejected as sovereignty violations (a peer claiming authorship of a
/// record whose origin is actually us).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub applied: usize,
    pub conflicts_detected: usize,
}

pub struct FederationService {
    store: Arc<dyn RegistryStore>,
    client: reqwest::Client,
    /// This server's canonical URL, e.g. `https://a.example` -- compared
    /// against `Registration::origin_server`.
    local_server: String,
    /// The bare domain of `local_server`, used to address this server's
    /// own `_server@{domain}` identity on outbound signed requests.
    local_domain: String,
    /// Serializes sync pulls per peer so a slow or flapping peer can't
    /// have two concurrent ingest passes racing its change log.
    peer_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FederationService {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        local_server: impl Into<String>,
        local_domain: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client builder with static config never fails");
        Self {
            store,
            client,
            local_server: local_server.into(),
            local_domain: local_domain.into(),
            peer_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, peer_url: &str) -> Arc<Mutex<()>> {
        self.peer_locks
            .entry(peer_url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Referral candidates for a search centered at `center`: every
    /// configured peer, plus learned peers whose published authoritative
    /// region intersects the query, deterministically ordered and capped.
    pub async fn referrals(
        &self,
        center: Coordinate,
        range_m: f64,
    ) -> Result<Vec<Peer>, FederationError> {
        let peers = self.store.list_peers().await?;

        let mut configured: Vec<Peer> = peers.iter().filter(|p| p.is_configured).cloned().collect();
        configured.sort_by(|a, b| {
            b.last_seen.cmp(&a.last_seen).then_with(|| a.server_url.cmp(&b.server_url))
        });

        let mut learned: Vec<Peer> = peers
            .iter()
            .filter(|p| !p.is_configured)
            .filter(|p| {
                p.authoritative_regions
                    .as_ref()
                    .map(|regions| regions.iter().any(|g| intersects(g, &center, range_m)))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        learned.sort_by(|a, b| {
            b.last_seen.cmp(&a.last_seen).then_with(|| a.server_url.cmp(&b.server_url))
        });

        configured.extend(learned);
        configured.dedup_by(|a, b| a.server_url == b.server_url);
        configured.truncate(MAX_REFERRALS);
        Ok(configured)
    }

    /// Refresh a peer's `/.well-known/mrs` metadata and persist it.
    pub async fn refresh_peer(&self, server_url: &str, now: Timestamp) -> Result<Peer, FederationError> {
        let url = format!("{server_url}/.well-known/mrs");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FederationError::Http(e.to_string()))?;
        let well_known: WellKnownMrs = response
            .json()
            .await
            .map_err(|e| FederationError::InvalidResponse(e.to_string()))?;

        let mut peer = self
            .store
            .get_peer(server_url)
            .await?
            .unwrap_or_else(|| Peer::learned(server_url.to_string(), now));
        peer.last_seen = now;
        peer.authoritative_regions = well_known.authoritative_regions;

        self.store.put_peer(peer.clone()).await?;
        Ok(peer)
    }

    /// Pull and ingest a peer's full snapshot (used the first time we
    /// learn about a peer, or after its sync cursor has expired).
    pub async fn pull_snapshot(
        &self,
        peer: &Peer,
        signing_key_bytes: &[u8],
        now: Timestamp,
    ) -> Result<IngestSummary, FederationError> {
        let lock = self.lock_for(&peer.server_url);
        let _guard = lock.lock().await;

        let mut summary = IngestSummary::default();
        let mut after: Option<String> = None;
        let mut change_log_cursor: Option<String> = None;

        loop {
            let path = match &after {
                Some(cursor) => format!("/sync/snapshot?after={cursor}"),
                None => "/sync/snapshot".to_string(),
            };
            let url = format!("{}{path}", peer.server_url);
            let sig = mrs_auth::sign_request(
                "GET",
                &path,
                &format!("_server@{}", self.local_domain),
                signing_key_bytes,
                &format!("{}/.well-known/mrs/keys/_server@{}", self.local_server, self.local_domain),
                b"",
                now,
            )?;

            let response = self
                .client
                .get(&url)
                .header("MRS-Identity", format!("_server@{}", self.local_domain))
                .header("Content-Digest", sig.content_digest)
                .header("Signature-Input", sig.signature_input)
                .header("Signature", sig.signature)
                .send()
                .await
                .map_err(|e| FederationError::Http(e.to_string()))?;

            let page: SyncSnapshot = response
                .json()
                .await
                .map_err(|e| FederationError::InvalidResponse(e.to_string()))?;

            for registration in page.registrations {
                self.ingest_registration(registration, &mut summary).await?;
            }
            for tombstone in page.tombstones {
                if self.store.apply_tombstone(tombstone).await?.is_some() {
                    summary.applied += 1;
                }
            }

            change_log_cursor = Some(page.cursor);
            match page.next {
                Some(next) => after = Some(next),
                None => break,
            }
        }

        let mut updated_peer = peer.clone();
        updated_peer.sync_cursor = change_log_cursor;
        updated_peer.last_seen = now;
        self.store.put_peer(updated_peer).await?;

        Ok(summary)
    }

    /// Pull and ingest the delta since a peer's last known cursor. Falls
    /// back to a full snapshot pull if the peer reports the cursor
    /// expired.
    pub async fn pull_changes(
        &self,
        peer: &Peer,
        signing_key_bytes: &[u8],
        now: Timestamp,
    ) -> Result<IngestSummary, FederationError> {
        let lock = self.lock_for(&peer.server_url);
        let _guard = lock.lock().await;

        let cursor = match &peer.sync_cursor {
            Some(c) => c.clone(),
            None => return self.pull_snapshot(peer, signing_key_bytes, now).await,
        };

        let path = format!("/sync/changes?since={cursor}");
        let url = format!("{}{path}", peer.server_url);
        let sig = mrs_auth::sign_request(
            "GET",
            &path,
            &format!("_server@{}", self.local_domain),
            signing_key_bytes,
            &format!("{}/.well-known/mrs/keys/_server@{}", self.local_server, self.local_domain),
            b"",
            now,
        )?;

        let response = self
            .client
            .get(&url)
            .header("MRS-Identity", format!("_server@{}", self.local_domain))
            .header("Content-Digest", sig.content_digest)
            .header("Signature-Input", sig.signature_input)
            .header("Signature", sig.signature)
            .send()
            .await
            .map_err(|e| FederationError::Http(e.to_string()))?;

        if response.status() == reqwest::StatusCode::GONE {
            return self.pull_snapshot(peer, signing_key_bytes, now).await;
        }

        let page: SyncChangesPage = response
            .json()
            .await
            .map_err(|e| FederationError::InvalidResponse(e.to_string()))?;

        let mut summary = IngestSummary::default();
        for change in page.changes {
            self.ingest_change(change, &mut summary).await?;
        }

        let mut updated_peer = peer.clone();
        updated_peer.sync_cursor = page.cursor.or(updated_peer.sync_cursor);
        updated_peer.last_seen = now;
        self.store.put_peer(updated_peer).await?;

        Ok(summary)
    }

    /// One federation tick: refresh every known peer's published metadata,
    /// then pull its changes (falling back to a full snapshot when no
    /// cursor is on file yet). Per-peer failures are returned rather than
    /// aborting the whole pass, so one unreachable peer never blocks sync
    /// with the rest.
    pub async fn sync_all_peers(
        &self,
        signing_key_bytes: &[u8],
        now: Timestamp,
    ) -> Vec<(String, FederationError)> {
        let mut failures = Vec::new();
        let peers = match self.store.list_peers().await {
            Ok(peers) => peers,
            Err(e) => return vec![("*".to_string(), e.into())],
        };

        for peer in peers {
            if let Err(e) = self.refresh_peer(&peer.server_url, now).await {
                failures.push((peer.server_url.clone(), e));
                continue;
            }
            let current = match self.store.get_peer(&peer.server_url).await {
                Ok(Some(p)) => p,
                Ok(None) => continue,
                Err(e) => {
                    failures.push((peer.server_url.clone(), e.into()));
                    continue;
                }
            };
            if let Err(e) = self.pull_changes(&current, signing_key_bytes, now).await {
                failures.push((peer.server_url.clone(), e));
            }
        }
        failures
    }

    async fn ingest_change(
        &self,
        change: ChangeEvent,
        summary: &mut IngestSummary,
    ) -> Result<(), FederationError> {
        match (change.registration, change.tombstone) {
            (Some(registration), _) => self.ingest_registration(registration, summary).await,
            (None, Some(tombstone)) => {
                if self.store.apply_tombstone(tombstone).await?.is_some() {
                    summary.applied += 1;
                }
                Ok(())
            }
            (None, None) => Ok(()),
        }
    }

    /// Apply a replica registration learned from a peer. A registration
    /// claiming `origin_server == self.local_server` that we did not
    /// originate ourselves is a sovereignty violation: our local copy (if
    /// any) is ground truth, so the incoming record is discarded and
    /// counted rather than applied.
    async fn ingest_registration(
        &self,
        mut registration: Registration,
        summary: &mut IngestSummary,
    ) -> Result<(), FederationError> {
        if registration.origin_server == self.local_server {
            summary.conflicts_detected += 1;
            return Ok(());
        }

        if let Some(tombstone) = self.store.get_tombstone(&registration.canonical_id()).await? {
            if tombstone.shadows(registration.version) {
                return Ok(());
            }
        }

        if let Some(existing) = self.store.get_by_canonical(&registration.canonical_id()).await? {
            if existing.version >= registration.version {
                return Ok(());
            }
        }

        registration.replicated_from = Some(registration.origin_server.clone());
        registration.last_synced_at = Some(registration.updated);
        self.store.put(registration).await?;
        summary.applied += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mrs_geometry::Coordinate;
    use mrs_store::InMemoryStore;

    fn ts(seconds: i64) -> Timestamp {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    #[tokio::test]
    async fn referrals_puts_configured_peers_first_and_caps_the_list() {
        let store: Arc<dyn RegistryStore> = Arc::new(InMemoryStore::new());
        for i in 0..20 {
            let mut peer = Peer::learned(format!("https://peer{i}.example"), ts(1));
            peer.authoritative_regions = Some(vec![Geometry::Sphere {
                center: Coordinate::new(0.0, 0.0, 0.0),
                radius: 1000.0,
            }]);
            store.put_peer(peer).await.unwrap();
        }
        store
            .put_peer(Peer::configured("https://zeta.example".to_string(), ts(1)))
            .await
            .unwrap();

        let svc = FederationService::new(store, "example.com", "example.com");
        let referrals = svc
            .referrals(Coordinate::new(0.0, 0.0, 0.0), 500.0)
            .await
            .unwrap();

        assert!(referrals.len() <= MAX_REFERRALS);
        assert_eq!(referrals[0].server_url, "https://zeta.example");
    }

    #[tokio::test]
    async fn ingesting_a_registration_claiming_our_own_origin_is_a_conflict() {
        let store: Arc<dyn RegistryStore> = Arc::new(InMemoryStore::new());
        let svc = FederationService::new(store, "example.com", "example.com");

        let registration = Registration {
            id: "reg_remote".to_string(),
            space: Geometry::Sphere {
                center: Coordinate::new(0.0, 0.0, 0.0),
                radius: 10.0,
            },
            service_point: None,
            foad: false,
            owner: "alice@example.com".to_string(),
            origin_server: "example.com".to_string(),
            origin_id: "origin-1".to_string(),
            version: 1,
            created: ts(1),
            updated: ts(1),
            replicated_from: None,
            last_synced_at: None,
            bbox: mrs_geometry::bbox(&Geometry::Sphere {
                center: Coordinate::new(0.0, 0.0, 0.0),
                radius: 10.0,
            }),
        };

        let mut summary = IngestSummary::default();
        svc.ingest_registration(registration, &mut summary).await.unwrap();
        assert_eq!(summary.conflicts_detected, 1);
        assert_eq!(summary.applied, 0);
    }

    fn remote_registration(origin_id: &str, version: u64) -> Registration {
        let space = Geometry::Sphere {
            center: Coordinate::new(0.0, 0.0, 0.0),
            radius: 10.0,
        };
        Registration {
            id: format!("reg_{origin_id}"),
            bbox: mrs_geometry::bbox(&space),
            space,
            service_point: None,
            foad: false,
            owner: "alice@peer.example".to_string(),
            origin_server: "https://peer.example".to_string(),
            origin_id: origin_id.to_string(),
            version,
            created: ts(1),
            updated: ts(version as i64),
            replicated_from: None,
            last_synced_at: None,
        }
    }

    #[tokio::test]
    async fn ingest_drops_a_stale_replica_version() {
        let store: Arc<dyn RegistryStore> = Arc::new(InMemoryStore::new());
        let svc = FederationService::new(store.clone(), "example.com", "example.com");

        let mut summary = IngestSummary::default();
        svc.ingest_registration(remote_registration("origin-1", 3), &mut summary)
            .await
            .unwrap();
        assert_eq!(summary.applied, 1);

        let mut summary = IngestSummary::default();
        svc.ingest_registration(remote_registration("origin-1", 2), &mut summary)
            .await
            .unwrap();
        assert_eq!(summary.applied, 0, "an out-of-order lower version must be ignored");

        let stored = store
            .get_by_canonical(&mrs_types::CanonicalId::new("https://peer.example", "origin-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 3);
    }

    #[tokio::test]
    async fn referrals_break_ties_by_last_seen_descending() {
        let store: Arc<dyn RegistryStore> = Arc::new(InMemoryStore::new());
        store
            .put_peer(Peer::configured("https://a.example".to_string(), ts(100)))
            .await
            .unwrap();
        store
            .put_peer(Peer::configured("https://b.example".to_string(), ts(200)))
            .await
            .unwrap();

        let svc = FederationService::new(store, "example.com", "example.com");
        let referrals = svc.referrals(Coordinate::new(0.0, 0.0, 0.0), 500.0).await.unwrap();

        assert_eq!(referrals[0].server_url, "https://b.example");
        assert_eq!(referrals[1].server_url, "https://a.example");
    }
}
