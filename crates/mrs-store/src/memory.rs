use std::collections::HashMap;

use async_trait::async_trait;
use mrs_geometry::BoundingBox;
use mrs_types::{
    CanonicalId, ChangeEvent, ChangeKind, Key, Peer, Registration, Timestamp, Token, Tombstone, User,
};
use tokio::sync::RwLock;

use crate::{RegistryStore, StoreError};

#[derive(Default)]
struct StoreInner {
    registrations: HashMap<String, Registration>,
    canonical_index: HashMap<CanonicalId, String>,
    tombstones: HashMap<CanonicalId, Tombstone>,
    users: HashMap<String, User>,
    keys: HashMap<(String, String), Key>,
    tokens: HashMap<String, Token>,
    peers: HashMap<String, Peer>,
    change_log: Vec<ChangeEvent>,
    next_cursor: u64,
    log_floor: u64,
}

impl StoreInner {
    fn next_cursor(&mut self) -> String {
        self.next_cursor += 1;
        self.next_cursor.to_string()
    }

    fn cursor_value(cursor: &str) -> Result<u64, StoreError> {
        cursor.parse().map_err(|_| StoreError::CursorExpired)
    }
}

/// Reference [RegistryStore] backed by a single [tokio::sync::RwLock]
/// guarding a set of maps. Reads proceed concurrently; every write holds
/// the lock for the duration of its change-log append, which is how `put`,
/// `release`, and `apply_tombstone` stay atomic.
pub struct InMemoryStore {
    inner: RwLock<StoreInner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for InMemoryStore {
    async fn put(&self, registration: Registration) -> Result<ChangeEvent, StoreError> {
        let mut inner = self.inner.write().await;

        let canonical = registration.canonical_id();
        if let Some(existing_id) = inner.canonical_index.get(&canonical) {
            if existing_id != &registration.id {
                return Err(StoreError::CanonicalConflict(canonical));
            }
        }

        let existed = inner.registrations.contains_key(&registration.id);
        inner
            .canonical_index
            .insert(canonical, registration.id.clone());

        let cursor = inner.next_cursor();
        let event = if existed {
            ChangeEvent::updated(registration.clone(), cursor)
        } else {
            ChangeEvent::created(registration.clone(), cursor)
        };
        inner.registrations.insert(registration.id.clone(), registration);
        inner.change_log.push(event.clone());
        Ok(event)
    }

    async fn get(&self, id: &str) -> Result<Option<Registration>, StoreError> {
        Ok(self.inner.read().await.registrations.get(id).cloned())
    }

    async fn get_by_canonical(
        &self,
        canonical: &CanonicalId,
    ) -> Result<Option<Registration>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .canonical_index
            .get(canonical)
            .and_then(|id| inner.registrations.get(id))
            .cloned())
    }

    async fn release(
        &self,
        id: &str,
        now: Timestamp,
    ) -> Result<(Registration, ChangeEvent), StoreError> {
        let mut inner = self.inner.write().await;

        let registration = inner
            .registrations
            .remove(id)
            .ok_or(StoreError::NotFound)?;
        let canonical = registration.canonical_id();
        inner.canonical_index.remove(&canonical);

        let tombstone = Tombstone {
            origin_server: registration.origin_server.clone(),
            origin_id: registration.origin_id.clone(),
            version: registration.version,
            deleted_at: now,
        };
        inner.tombstones.insert(canonical, tombstone.clone());

        let cursor = inner.next_cursor();
        let event = ChangeEvent::deleted(tombstone, cursor);
        inner.change_log.push(event.clone());
        Ok((registration, event))
    }

    async fn apply_tombstone(
        &self,
        tombstone: Tombstone,
    ) -> Result<Option<ChangeEvent>, StoreError> {
        let mut inner = self.inner.write().await;

        let canonical = tombstone.canonical_id();
        if let Some(existing) = inner.tombstones.get(&canonical) {
            if existing.shadows(tombstone.version) {
                return Ok(None);
            }
        }

        if let Some(id) = inner.canonical_index.get(&canonical).cloned() {
            if let Some(existing) = inner.registrations.get(&id) {
                if tombstone.shadows(existing.version) {
                    inner.registrations.remove(&id);
                    inner.canonical_index.remove(&canonical);
                }
            }
        }

        inner.tombstones.insert(canonical, tombstone.clone());
        let cursor = inner.next_cursor();
        let event = ChangeEvent::deleted(tombstone, cursor);
        inner.change_log.push(event.clone());
        Ok(Some(event))
    }

    async fn query_bbox(&self, query: BoundingBox) -> Result<Vec<Registration>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .registrations
            .values()
            .filter(|r| boxes_overlap(&query, &r.bbox))
            .cloned()
            .collect())
    }

    async fn list_registrations(
        &self,
        after: Option<&CanonicalId>,
        limit: usize,
    ) -> Result<Vec<Registration>, StoreError> {
        let inner = self.inner.read().await;
        let mut registrations: Vec<&Registration> = inner.registrations.values().collect();
        registrations.sort_by(|a, b| a.canonical_id().cmp(&b.canonical_id()));
        Ok(registrations
            .into_iter()
            .filter(|r| after.map(|a| r.canonical_id() > *a).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_tombstone(&self, canonical: &CanonicalId) -> Result<Option<Tombstone>, StoreError> {
        Ok(self.inner.read().await.tombstones.get(canonical).cloned())
    }

    async fn list_tombstones(&self) -> Result<Vec<Tombstone>, StoreError> {
        Ok(self.inner.read().await.tombstones.values().cloned().collect())
    }

    async fn gc_tombstones(&self, older_than: Timestamp) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.tombstones.len();
        inner.tombstones.retain(|_, t| t.deleted_at >= older_than);
        Ok(before - inner.tombstones.len())
    }

    async fn put_user(&self, user: User) -> Result<(), StoreError> {
        self.inner.write().await.users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.inner.read().await.users.get(id).cloned())
    }

    async fn put_key(&self, key: Key) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .keys
            .insert((key.owner.clone(), key.key_id.clone()), key);
        Ok(())
    }

    async fn get_key(&self, owner: &str, key_id: &str) -> Result<Option<Key>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.keys.get(&(owner.to_string(), key_id.to_string())).cloned())
    }

    async fn list_keys(&self, owner: &str) -> Result<Vec<Key>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .keys
            .values()
            .filter(|k| k.owner == owner)
            .cloned()
            .collect())
    }

    async fn put_token(&self, token: Token) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .tokens
            .insert(token.token.clone(), token);
        Ok(())
    }

    async fn get_token(&self, token: &str) -> Result<Option<Token>, StoreError> {
        Ok(self.inner.read().await.tokens.get(token).cloned())
    }

    async fn delete_token(&self, token: &str) -> Result<(), StoreError> {
        self.inner.write().await.tokens.remove(token);
        Ok(())
    }

    async fn put_peer(&self, peer: Peer) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .peers
            .insert(peer.server_url.clone(), peer);
        Ok(())
    }

    async fn get_peer(&self, server_url: &str) -> Result<Option<Peer>, StoreError> {
        Ok(self.inner.read().await.peers.get(server_url).cloned())
    }

    async fn list_peers(&self) -> Result<Vec<Peer>, StoreError> {
        Ok(self.inner.read().await.peers.values().cloned().collect())
    }

    async fn changes_since(&self, cursor: Option<&str>) -> Result<Vec<ChangeEvent>, StoreError> {
        let inner = self.inner.read().await;
        let after = match cursor {
            Some(c) => StoreInner::cursor_value(c)?,
            None => 0,
        };
        if after < inner.log_floor {
            return Err(StoreError::CursorExpired);
        }
        Ok(inner
            .change_log
            .iter()
            .filter(|e| StoreInner::cursor_value(&e.cursor).unwrap_or(0) > after)
            .cloned()
            .collect())
    }

    async fn gc_change_log(&self, older_than: Timestamp) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let keep_from = inner
            .change_log
            .iter()
            .position(|e| event_timestamp(e) >= older_than)
            .unwrap_or(inner.change_log.len());

        if keep_from > 0 {
            let floor_event = &inner.change_log[keep_from - 1];
            inner.log_floor = StoreInner::cursor_value(&floor_event.cursor)?;
            inner.change_log.drain(0..keep_from);
        }
        Ok(())
    }
}

fn event_timestamp(event: &ChangeEvent) -> Timestamp {
    match event.kind {
        ChangeKind::Created | ChangeKind::Updated => event
            .registration
            .as_ref()
            .map(|r| r.updated)
            .expect("created/updated events always carry a registration"),
        ChangeKind::Deleted => event
            .tombstone
            .as_ref()
            .map(|t| t.deleted_at)
            .expect("deleted events always carry a tombstone"),
    }
}

fn boxes_overlap(a: &BoundingBox, b: &BoundingBox) -> bool {
    if a.max_lat < b.min_lat || a.min_lat > b.max_lat {
        return false;
    }
    lon_ranges_overlap(a, b)
}

fn lon_ranges_overlap(a: &BoundingBox, b: &BoundingBox) -> bool {
    match (a.wraps, b.wraps) {
        (false, false) => a.max_lon >= b.min_lon && a.min_lon <= b.max_lon,
        (true, false) => b.max_lon >= a.min_lon || b.min_lon <= a.max_lon,
        (false, true) => a.max_lon >= b.min_lon || a.min_lon <= b.max_lon,
        // Both wrap the seam; since every box spans at least one pole of
        // the antimeridian, they necessarily overlap there.
        (true, true) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mrs_geometry::{BoundingBox, Coordinate, Geometry};

    fn ts(seconds: i64) -> Timestamp {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn sample_registration(id: &str, origin_id: &str) -> Registration {
        let space = Geometry::Sphere {
            center: Coordinate::new(-33.8568, 151.2153, 0.0),
            radius: 50.0,
        };
        let bbox = mrs_geometry::bbox(&space);
        Registration {
            id: id.to_string(),
            space,
            service_point: Some("https://svc.example/thing".to_string()),
            foad: false,
            owner: "alice@example.com".to_string(),
            origin_server: "example.com".to_string(),
            origin_id: origin_id.to_string(),
            version: 1,
            created: ts(1_000),
            updated: ts(1_000),
            replicated_from: None,
            last_synced_at: None,
            bbox,
        }
    }

    #[tokio::test]
    async fn put_rejects_canonical_conflict_across_distinct_local_ids() {
        let store = InMemoryStore::new();
        store.put(sample_registration("reg_a", "origin-1")).await.unwrap();

        let conflicting = sample_registration("reg_b", "origin-1");
        let err = store.put(conflicting).await.unwrap_err();
        assert!(matches!(err, StoreError::CanonicalConflict(_)));
    }

    #[tokio::test]
    async fn put_same_id_twice_is_an_update_not_a_conflict() {
        let store = InMemoryStore::new();
        let first = store.put(sample_registration("reg_a", "origin-1")).await.unwrap();
        assert!(matches!(first.kind, ChangeKind::Created));

        let mut updated = sample_registration("reg_a", "origin-1");
        updated.version = 2;
        let second = store.put(updated).await.unwrap();
        assert!(matches!(second.kind, ChangeKind::Updated));
    }

    #[tokio::test]
    async fn release_is_a_single_atomic_change_event() {
        let store = InMemoryStore::new();
        store.put(sample_registration("reg_a", "origin-1")).await.unwrap();

        let (removed, event) = store.release("reg_a", ts(2_000)).await.unwrap();
        assert_eq!(removed.id, "reg_a");
        assert!(matches!(event.kind, ChangeKind::Deleted));
        assert!(store.get("reg_a").await.unwrap().is_none());

        let canonical = CanonicalId::new("example.com", "origin-1");
        let tombstone = store.get_tombstone(&canonical).await.unwrap().unwrap();
        assert_eq!(tombstone.version, 1);

        let changes = store.changes_since(None).await.unwrap();
        assert_eq!(changes.len(), 2);
    }

    #[tokio::test]
    async fn apply_tombstone_shadows_an_older_replica_and_is_idempotent() {
        let store = InMemoryStore::new();
        let mut replica = sample_registration("reg_a", "origin-1");
        replica.version = 1;
        store.put(replica).await.unwrap();

        let tombstone = Tombstone {
            origin_server: "example.com".to_string(),
            origin_id: "origin-1".to_string(),
            version: 1,
            deleted_at: ts(5_000),
        };

        let first = store.apply_tombstone(tombstone.clone()).await.unwrap();
        assert!(first.is_some());
        assert!(store.get("reg_a").await.unwrap().is_none());

        let replay = store.apply_tombstone(tombstone).await.unwrap();
        assert!(replay.is_none(), "a stale replayed tombstone must be a no-op");
    }

    #[tokio::test]
    async fn changes_since_respects_retention_floor() {
        let store = InMemoryStore::new();
        store.put(sample_registration("reg_a", "origin-1")).await.unwrap();
        store.put(sample_registration("reg_b", "origin-2")).await.unwrap();

        store.gc_change_log(ts(1_000_000)).await.unwrap();

        let err = store.changes_since(Some("1")).await.unwrap_err();
        assert_eq!(err, StoreError::CursorExpired);
    }

    #[tokio::test]
    async fn list_registrations_is_paginated_in_canonical_order() {
        let store = InMemoryStore::new();
        store.put(sample_registration("reg_c", "c")).await.unwrap();
        store.put(sample_registration("reg_a", "a")).await.unwrap();
        store.put(sample_registration("reg_b", "b")).await.unwrap();

        let first_page = store.list_registrations(None, 2).await.unwrap();
        assert_eq!(
            first_page.iter().map(|r| r.origin_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        let cursor = first_page.last().unwrap().canonical_id();
        let second_page = store.list_registrations(Some(&cursor), 2).await.unwrap();
        assert_eq!(
            second_page.iter().map(|r| r.origin_id.as_str()).collect::<Vec<_>>(),
            vec!["c"]
        );
    }

    #[tokio::test]
    async fn query_bbox_splits_a_wrapped_query_across_the_seam() {
        let store = InMemoryStore::new();
        let near_seam = sample_registration("reg_a", "origin-1");
        let mut near_seam = near_seam.clone();
        near_seam.space = Geometry::Sphere {
            center: Coordinate::new(0.0, 179.99, 0.0),
            radius: 10_000.0,
        };
        near_seam.bbox = mrs_geometry::bbox(&near_seam.space);
        store.put(near_seam).await.unwrap();

        let query = BoundingBox {
            min_lat: -1.0,
            max_lat: 1.0,
            min_lon: 179.0,
            max_lon: -179.0,
            wraps: true,
        };
        let results = store.query_bbox(query).await.unwrap();
        assert_eq!(results.len(), 1);
    }
}
