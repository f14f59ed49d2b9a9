//! The transactional key/range store the registry is built on, specified
//! here as an async trait plus an in-memory reference implementation. A
//! production deployment backs [RegistryStore] with a real transactional
//! store; the contract -- atomic write-plus-change-log-append,
//! single-record-consistent reads, bbox-indexed range queries -- is what
//! matters, not the backing engine.

mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use mrs_geometry::BoundingBox;
use mrs_types::{CanonicalId, ChangeEvent, Key, Peer, Registration, Timestamp, Token, Tombstone, User};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("no such record")]
    NotFound,
    #[error("canonical id ({}, {}) is already bound to a different local record", .0.origin_server, .0.origin_id)]
    CanonicalConflict(CanonicalId),
    #[error("(owner, key_id) pair is already in use")]
    KeyConflict,
    #[error("requested cursor predates the retained change log")]
    CursorExpired,
}

/// Transactional CRUD over registrations, users, keys, peers, and
/// tombstones, plus the monotonic change-log that federation sync reads
/// from. At-least-serializable per record; the write-plus-change-log
/// append is atomic.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Create or update a registration (origin-authored or a replica
    /// write from sync ingest). Appends a `created` or `updated` change
    /// event, chosen by whether a record already existed under `id`.
    async fn put(&self, registration: Registration) -> Result<ChangeEvent, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Registration>, StoreError>;

    async fn get_by_canonical(
        &self,
        canonical: &CanonicalId,
    ) -> Result<Option<Registration>, StoreError>;

    /// Atomically tombstone and delete the record at `id`, returning the
    /// removed registration and the appended `deleted` change event.
    async fn release(
        &self,
        id: &str,
        now: Timestamp,
    ) -> Result<(Registration, ChangeEvent), StoreError>;

    /// Apply a tombstone learned from a peer (sync ingest). Deletes any
    /// local replica the tombstone shadows. Returns `None` if the
    /// tombstone was stale (already shadowed by an equal-or-newer one),
    /// otherwise the appended `deleted` change event.
    async fn apply_tombstone(
        &self,
        tombstone: Tombstone,
    ) -> Result<Option<ChangeEvent>, StoreError>;

    /// Coarse bbox-indexed candidate fetch. `query` may have `wraps =
    /// true`, in which case implementations split into two rectangles.
    async fn query_bbox(&self, query: BoundingBox) -> Result<Vec<Registration>, StoreError>;

    /// Current live registrations in ascending `(origin_server, origin_id)`
    /// order, strictly after `after` (from the beginning if `None`),
    /// capped at `limit`. Used to build a paginated, deterministically
    /// ordered snapshot for peer sync, as opposed to [RegistryStore::changes_since]'s
    /// replay of historical events.
    async fn list_registrations(
        &self,
        after: Option<&CanonicalId>,
        limit: usize,
    ) -> Result<Vec<Registration>, StoreError>;

    async fn get_tombstone(&self, canonical: &CanonicalId) -> Result<Option<Tombstone>, StoreError>;

    async fn list_tombstones(&self) -> Result<Vec<Tombstone>, StoreError>;

    /// Garbage-collect tombstones older than `older_than`, returning the
    /// number removed.
    async fn gc_tombstones(&self, older_than: Timestamp) -> Result<usize, StoreError>;

    async fn put_user(&self, user: User) -> Result<(), StoreError>;

    async fn get_user(&self, id: &str) -> Result<Option<User>, StoreError>;

    /// Upsert keyed by `(owner, key_id)`; the map key structurally
    /// enforces the uniqueness invariant.
    async fn put_key(&self, key: Key) -> Result<(), StoreError>;

    async fn get_key(&self, owner: &str, key_id: &str) -> Result<Option<Key>, StoreError>;

    async fn list_keys(&self, owner: &str) -> Result<Vec<Key>, StoreError>;

    async fn put_token(&self, token: Token) -> Result<(), StoreError>;

    async fn get_token(&self, token: &str) -> Result<Option<Token>, StoreError>;

    async fn delete_token(&self, token: &str) -> Result<(), StoreError>;

    async fn put_peer(&self, peer: Peer) -> Result<(), StoreError>;

    async fn get_peer(&self, server_url: &str) -> Result<Option<Peer>, StoreError>;

    async fn list_peers(&self) -> Result<Vec<Peer>, StoreError>;

    /// Ordered change-log entries strictly after `cursor` (or from the
    /// beginning if `None`). Errs with [StoreError::CursorExpired] if
    /// `cursor` predates what [RegistryStore::gc_change_log] has retained.
    async fn changes_since(&self, cursor: Option<&str>) -> Result<Vec<ChangeEvent>, StoreError>;

    /// Advance the change-log retention floor, discarding entries at or
    /// before `older_than`'s timestamp. Mirrors [RegistryStore::gc_tombstones]'s
    /// retention window so that a `since` cursor older than retention
    /// reliably surfaces [StoreError::CursorExpired] instead of silently
    /// skipping history.
    async fn gc_change_log(&self, older_than: Timestamp) -> Result<(), StoreError>;
}
